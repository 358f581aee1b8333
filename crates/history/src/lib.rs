//! # Fin Core State History
//!
//! The state-history streaming service: clients connect over a framed
//! socket protocol, request a block range, and receive per-block results
//! with optional compressed payloads (traces, chain-state deltas, finality
//! data), flow-controlled by send credits.
//!
//! This crate provides:
//! - **Protocol messages** - [`types`], wire-encoded requests and results
//! - **Sessions** - [`spawn_session`], one reader task and one writer task
//!   per connection with a cancellable wake primitive
//! - **Payload logs** - [`HistoryLog`], gzip-compressed per-block entries
//!   whose decompression streams are handed to the writer task
//! - **Endpoints** - [`TcpEndpoint`] and `LocalEndpoint`, the two concrete
//!   transports

pub mod endpoint;
pub mod log;
pub mod session;
pub mod types;

pub use endpoint::{accept_with_timeout, SessionEndpoint, TcpEndpoint};
#[cfg(unix)]
pub use endpoint::LocalEndpoint;
pub use log::{DecompressStream, HistoryLog, HistoryLogError};
pub use session::{
    spawn_session, ChainView, HistoryLogs, SessionConfig, SessionHandle, PROTOCOL_BANNER,
};
pub use types::{
    BlockPosition, GetBlocksAckRequestV0, GetBlocksRequestV0, GetBlocksRequestV1,
    GetBlocksResultV0, GetBlocksResultV1, GetStatusResultV0, GetStatusResultV1, LogRange,
    StateRequest, StateResult,
};
