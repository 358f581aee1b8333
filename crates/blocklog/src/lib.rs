//! # Fin Core Block Log
//!
//! The persisted, partitioned block log: an append-only store of serialized
//! signed blocks indexed by block number.
//!
//! Blocks land in a head chunk (`blocks.log` + `blocks.index`). Every
//! `stride` blocks the head chunk is sealed and renamed to
//! `blocks-<first>-<last>.{log,index}` in the retained directory; when more
//! than `max_retained_files` sealed chunks accumulate, the oldest move to
//! the archive directory (or are deleted when no archive is configured).
//! Archived chunks are no longer served by [`BlockLog::fetch`].
//!
//! Corruption is never repaired silently: opening a log whose header,
//! entries, or index disagree fails with a [`BlockLogError`].

mod log;
mod util;

pub use log::{BlockLog, BlockLogConfig, ChunkRange};
pub use util::{merge_blocklogs, smoke_test, split_blocklog, trim_blocklog_end, trim_blocklog_front};

use fincore_types::BlockNum;
use std::path::PathBuf;

/// Errors from the persisted block log. All fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum BlockLogError {
    /// I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad magic bytes in a log or index file
    #[error("invalid magic in {0}")]
    InvalidMagic(PathBuf),

    /// Unsupported format version
    #[error("unsupported block log version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u8 },

    /// Structurally damaged log or index content
    #[error("corrupted block log {path} at offset {offset}: {message}")]
    Corrupted {
        path: PathBuf,
        offset: usize,
        message: String,
    },

    /// The log and its index disagree
    #[error("index mismatch for {path}: {message}")]
    IndexMismatch { path: PathBuf, message: String },

    /// A block was appended out of order
    #[error("non-sequential append: expected block {expected}, got {got}")]
    NonSequentialAppend { expected: BlockNum, got: BlockNum },

    /// A block failed to decode
    #[error("undecodable block {block_num} in {path}: {message}")]
    BadBlock {
        path: PathBuf,
        block_num: BlockNum,
        message: String,
    },

    /// The requested range is not present
    #[error("blocks {first}..={last} not found under {path}")]
    RangeNotFound {
        path: PathBuf,
        first: BlockNum,
        last: BlockNum,
    },
}

/// Result alias for block log operations.
pub type BlockLogResult<T> = std::result::Result<T, BlockLogError>;
