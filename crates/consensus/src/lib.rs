//! # Fin Core Consensus
//!
//! The instant-finality consensus core: a HotStuff-derived, two-phase
//! finality protocol over BLS-signed finalizer votes.
//!
//! This crate provides:
//! - **Vote aggregation** - [`OpenQcSig`]/[`OpenQc`], thread-safe
//!   incremental aggregation of strong and weak votes into quorum
//!   certificates
//! - **The finality state machine** - [`FinalityCore`], deciding which
//!   blocks become irreversible
//! - **Finalizer safety** - [`Finalizer`] voting rules with persistent
//!   safety records
//! - **Block header states** - [`BlockHeaderState`] and its building /
//!   validating transition
//! - **The fork database** - [`ForkDb`], the DAG of candidate branches
//!   rooted at the last irreversible block
//! - **The controller** - [`Controller`], the main-domain owner tying the
//!   above together, with snapshot take/restore
//!
//! ## Execution domains
//!
//! The controller and everything it owns run on the single-threaded main
//! domain. `OpenQc` aggregators are the one structure shared with the net
//! worker pool: workers call [`OpenQc::aggregate_vote`] concurrently while
//! the main domain seals certificates with [`OpenQc::get_best_qc`].

pub mod block_state;
pub mod controller;
pub mod core;
pub mod fork_db;
pub mod open_qc;
pub mod safety;

pub use block_state::{
    BlockHeaderState, BlockRef, BlockValidationError, BuildInput, PendingFinalizerPolicy,
};
pub use controller::{
    Controller, ControllerError, ExistingState, ProduceParams, Snapshot,
    DEFAULT_MAX_VOTES_PER_CONNECTION, DEFAULT_UNLINKABLE_LOOKAHEAD,
};
pub use core::{FinalityCore, FinalityCoreError};
pub use fork_db::{ForkDb, ForkDbError, ForkNode};
pub use open_qc::{HasVoteStatus, OpenQc, OpenQcSig, QcState, QcVoteMetrics, VoteStatus};
pub use safety::{
    Finalizer, FinalizerSafetyInfo, FinalizerSet, SafetyFileError, VoteDecision, VoteRef,
};
