//! # Fin Core Crypto
//!
//! Cryptographic primitives for the Fin Core finality protocol.
//!
//! This crate provides:
//! - **Keccak256 hashing** - canonical 32-byte digests for headers and ids
//! - **Weak-digest tagging** - the `WEAK`-suffixed digest signed by weak votes
//! - **BLS12-381 signatures** - aggregatable signatures for quorum certificates
//!
//! ## Example
//!
//! ```rust
//! use fincore_crypto::{keccak256, Digest, create_weak_digest, bls::BlsPrivateKey};
//!
//! let digest = Digest::from(keccak256(b"block header bytes"));
//!
//! // A strong vote signs the digest itself; a weak vote signs the tagged form.
//! let sk = BlsPrivateKey::random();
//! let strong_sig = sk.sign(digest.as_bytes());
//! let weak_sig = sk.sign(&create_weak_digest(&digest));
//!
//! assert!(strong_sig.verify(digest.as_bytes(), &sk.public_key()));
//! assert!(!weak_sig.verify(digest.as_bytes(), &sk.public_key()));
//! ```

pub mod bls;
pub mod hash;

pub use bls::{BlsAggregateSignature, BlsPrivateKey, BlsPublicKey, BlsSignature};
pub use hash::{keccak256, keccak256_concat, Digest, Hasher};

/// The four-byte tag appended to a strong digest to form the weak digest.
///
/// A finalizer signs the strong digest for a strong vote and the tagged
/// digest for a weak vote; no signature can verify under both.
pub const WEAK_DIGEST_POSTFIX: [u8; 4] = *b"WEAK";

/// A weak digest: the 32-byte strong digest followed by the `WEAK` tag.
pub type WeakDigest = [u8; 36];

/// Build the weak digest for a block's strong digest.
pub fn create_weak_digest(digest: &Digest) -> WeakDigest {
    let mut out = [0u8; 36];
    out[..32].copy_from_slice(digest.as_bytes());
    out[32..].copy_from_slice(&WEAK_DIGEST_POSTFIX);
    out
}

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// BLS operation failed
    #[error("BLS operation failed: {0}")]
    BlsError(String),

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::HexError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_digest_tagging() {
        let digest = Digest::from(keccak256(b"hello"));
        let weak = create_weak_digest(&digest);
        assert_eq!(&weak[..32], digest.as_bytes());
        assert_eq!(&weak[32..], b"WEAK");
    }

    #[test]
    fn test_keccak256_known_vector() {
        let hash = keccak256(b"hello");
        assert_eq!(
            hex::encode(hash),
            "1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }
}
