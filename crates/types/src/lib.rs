//! # Fin Core Types
//!
//! Core data types for the Fin Core finality protocol:
//!
//! - **Primitives**: block timestamps, packed account names, block ids
//! - **Wire codec**: the canonical, bit-exact consensus encoding
//! - **Consensus types**: headers, header extensions, policies, quorum
//!   certificates, vote messages
//!
//! This crate is the foundation layer: it depends only on
//! `fincore-crypto` and carries no runtime state.

pub mod block;
pub mod extensions;
pub mod name;
pub mod policy;
pub mod qc;
pub mod timestamp;
pub mod vote;
pub mod wire;

pub use block::{BlockHeader, BlockId, BlockNum, SignedBlock, SignedBlockHeader, HS_BLOCK_CONFIRMED};
pub use extensions::{
    emplace_extension, extract_header_extensions, ExtensionError, FinalityMarkerExtension,
    HeaderExtension, HeaderExtensions, InstantFinalityExtension, ProtocolFeatureActivation,
};
pub use name::{AccountName, NameError};
pub use policy::{
    FinalizerAuthority, FinalizerPolicy, PolicyError, ProposerAuthority, ProposerPolicy,
    PRODUCER_REPETITIONS,
};
pub use qc::{Qc, QcClaim, QcError, QcSig, VoteBitset};
pub use timestamp::{BlockTimestamp, BLOCK_INTERVAL_MS, BLOCK_TIMESTAMP_EPOCH_MS};
pub use vote::VoteMessage;
pub use wire::{WireDecode, WireEncode, WireError, WireResult};

// The digest type is used pervasively alongside these types.
pub use fincore_crypto::Digest;
