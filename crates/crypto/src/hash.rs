//! Keccak256 hashing and the `Digest` type.
//!
//! All canonical identifiers in Fin Core (block ids, finality digests,
//! protocol feature digests) are 32-byte Keccak256 outputs.

use serde::{Deserialize, Serialize};
use sha3::{Digest as Sha3Digest, Keccak256};
use std::fmt;

/// Compute the Keccak256 hash of the input data.
#[inline]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the Keccak256 hash of multiple concatenated inputs.
///
/// Avoids allocating a temporary buffer for the concatenation.
#[inline]
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A streaming Keccak256 hasher for incremental hashing.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Keccak256,
}

impl Hasher {
    /// Create a new streaming hasher.
    pub fn new() -> Self {
        Self {
            inner: Keccak256::new(),
        }
    }

    /// Feed more bytes into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish and return the 32-byte digest.
    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

/// A 32-byte canonical digest.
///
/// Ordered and hashed by raw bytes so it can key maps and break ties
/// deterministically across nodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into a digest.
    pub fn hash(data: &[u8]) -> Self {
        Self(keccak256(data))
    }

    /// View the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Whether this is the all-zero digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a hex string (with or without `0x` prefix).
    pub fn from_hex(hex_str: &str) -> crate::Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(crate::CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Hex-encode the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; 32] {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form for logs
        write!(f, "{}..", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_matches_single() {
        assert_eq!(
            keccak256(b"hello world"),
            keccak256_concat(&[b"hello", b" ", b"world"])
        );
    }

    #[test]
    fn test_streaming_hasher() {
        let mut h = Hasher::new();
        h.update(b"he");
        h.update(b"llo");
        assert_eq!(h.finalize(), Digest::hash(b"hello"));
    }

    #[test]
    fn test_hex_round_trip() {
        let d = Digest::hash(b"x");
        assert_eq!(Digest::from_hex(&d.to_hex()).unwrap(), d);
        assert_eq!(Digest::from_hex(&format!("0x{}", d.to_hex())).unwrap(), d);
    }
}
