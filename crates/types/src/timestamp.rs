//! Block timestamps as slot numbers.
//!
//! A slot is a half-second tick counted from the chain epoch. Slots order
//! blocks on a branch and drive the proposer schedule.

use crate::wire::{get_u32, put_u32, WireDecode, WireEncode, WireResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds per block production slot.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// Chain epoch: 2000-01-01T00:00:00Z in Unix milliseconds.
pub const BLOCK_TIMESTAMP_EPOCH_MS: u64 = 946_684_800_000;

/// A block timestamp: a monotone slot number with a derived wall time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockTimestamp {
    /// Slot number since the chain epoch.
    pub slot: u32,
}

impl BlockTimestamp {
    /// Construct from a raw slot number.
    pub const fn new(slot: u32) -> Self {
        Self { slot }
    }

    /// The slot that covers the given Unix-milliseconds wall time.
    pub fn from_unix_ms(ms: u64) -> Self {
        let since_epoch = ms.saturating_sub(BLOCK_TIMESTAMP_EPOCH_MS);
        Self {
            slot: (since_epoch / BLOCK_INTERVAL_MS) as u32,
        }
    }

    /// Derived wall time in Unix milliseconds.
    pub fn to_unix_ms(&self) -> u64 {
        BLOCK_TIMESTAMP_EPOCH_MS + self.slot as u64 * BLOCK_INTERVAL_MS
    }

    /// The next slot.
    pub fn next(&self) -> Self {
        Self {
            slot: self.slot + 1,
        }
    }

    /// Advance by `n` slots.
    pub fn advance(&self, n: u32) -> Self {
        Self {
            slot: self.slot + n,
        }
    }
}

impl fmt::Display for BlockTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.slot)
    }
}

impl WireEncode for BlockTimestamp {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.slot);
    }
}

impl WireDecode for BlockTimestamp {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            slot: get_u32(input)?,
        })
    }
}
