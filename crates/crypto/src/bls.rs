//! BLS12-381 signatures for finality votes.
//!
//! Finalizer votes are BLS signatures over a block's strong or weak digest.
//! The key property is **signature aggregation**: the signatures of a quorum
//! of finalizers combine into a single 96-byte signature that verifies
//! against the aggregate of their public keys, so a quorum certificate stays
//! constant-size regardless of committee size.
//!
//! Key types:
//!
//! - [`BlsPrivateKey`] - secret scalar (32 bytes)
//! - [`BlsPublicKey`] - G1 point (48 bytes compressed), ordered by bytes
//! - [`BlsSignature`] - G2 point (96 bytes compressed)
//! - [`BlsAggregateSignature`] - running aggregate accepting one vote at a time
//!
//! All byte decoders validate canonical encoding to rule out malleability.

use crate::{CryptoError, Result};
use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Domain separation tag for all Fin Core finality signatures.
///
/// Strong and weak votes are separated by the signed message itself (the
/// weak digest carries the `WEAK` postfix), not by the DST.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_FINCORE_";

/// BLS private key (secret key).
///
/// A 32-byte scalar used for signing votes. Must be kept secret.
pub struct BlsPrivateKey {
    inner: SecretKey,
}

impl BlsPrivateKey {
    /// Generate a random private key using the OS RNG.
    pub fn random() -> Self {
        let mut ikm = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut ikm);
        let sk = SecretKey::key_gen(&ikm, &[]).expect("key generation failed");
        Self { inner: sk }
    }

    /// Derive a private key from input keying material (at least 32 bytes).
    pub fn from_seed(ikm: &[u8]) -> Result<Self> {
        if ikm.len() < 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: ikm.len(),
            });
        }
        let sk = SecretKey::key_gen(ikm, &[])
            .map_err(|_| CryptoError::InvalidPrivateKey("key generation failed".to_string()))?;
        Ok(Self { inner: sk })
    }

    /// Create a private key from a 32-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let sk = SecretKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(format!("{:?}", e)))?;
        Ok(Self { inner: sk })
    }

    /// Get the raw scalar bytes. Handle with care.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Derive the public key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Sign a message (a strong digest or a weak digest).
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature {
            inner: self.inner.sign(message, DST, &[]),
        }
    }
}

impl Clone for BlsPrivateKey {
    fn clone(&self) -> Self {
        let bytes = self.to_bytes();
        Self::from_bytes(&bytes).expect("cloning valid key should succeed")
    }
}

impl std::fmt::Debug for BlsPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsPrivateKey")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// BLS public key (48 bytes, compressed G1 point).
///
/// Implements `Ord` over the compressed bytes so finalizer sets and
/// aggregation order are deterministic across nodes.
#[derive(Clone)]
pub struct BlsPublicKey {
    inner: PublicKey,
}

impl BlsPublicKey {
    /// Decode a compressed public key, rejecting non-canonical encodings.
    pub fn from_bytes(bytes: &[u8; 48]) -> Result<Self> {
        let pk = PublicKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(format!("{:?}", e)))?;
        if pk.to_bytes() != *bytes {
            return Err(CryptoError::BlsError(
                "non-canonical public key encoding".to_string(),
            ));
        }
        Ok(Self { inner: pk })
    }

    /// Parse from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 48 {
            return Err(CryptoError::InvalidLength {
                expected: 48,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 48];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Compressed bytes (48 bytes).
    pub fn to_bytes(&self) -> [u8; 48] {
        self.inner.to_bytes()
    }

    /// Hex-encoded compressed form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Aggregate a non-empty set of public keys into one.
    pub fn aggregate(pubkeys: &[&BlsPublicKey]) -> Result<Self> {
        if pubkeys.is_empty() {
            return Err(CryptoError::BlsError(
                "cannot aggregate empty list".to_string(),
            ));
        }
        let pks: Vec<&PublicKey> = pubkeys.iter().map(|pk| &pk.inner).collect();
        let agg = AggregatePublicKey::aggregate(&pks, false)
            .map_err(|e| CryptoError::BlsError(format!("aggregation failed: {:?}", e)))?;
        Ok(Self {
            inner: agg.to_public_key(),
        })
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl PartialOrd for BlsPublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlsPublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl std::hash::Hash for BlsPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsPublicKey")
            .field("bytes", &self.to_hex())
            .finish()
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            BlsPublicKey::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            if bytes.len() != 48 {
                return Err(serde::de::Error::custom(format!(
                    "expected 48 bytes, got {}",
                    bytes.len()
                )));
            }
            let mut arr = [0u8; 48];
            arr.copy_from_slice(&bytes);
            BlsPublicKey::from_bytes(&arr).map_err(serde::de::Error::custom)
        }
    }
}

/// BLS signature (96 bytes, compressed G2 point).
#[derive(Clone)]
pub struct BlsSignature {
    inner: Signature,
}

impl BlsSignature {
    /// Decode a compressed signature, rejecting non-canonical encodings.
    pub fn from_bytes(bytes: &[u8; 96]) -> Result<Self> {
        let sig = Signature::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidSignature(format!("{:?}", e)))?;
        if sig.to_bytes() != *bytes {
            return Err(CryptoError::BlsError(
                "non-canonical signature encoding".to_string(),
            ));
        }
        Ok(Self { inner: sig })
    }

    /// Parse from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 96 {
            return Err(CryptoError::InvalidLength {
                expected: 96,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 96];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Compressed bytes (96 bytes).
    pub fn to_bytes(&self) -> [u8; 96] {
        self.inner.to_bytes()
    }

    /// Hex-encoded compressed form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify against a single public key.
    pub fn verify(&self, message: &[u8], public_key: &BlsPublicKey) -> bool {
        self.inner
            .verify(true, message, DST, &[], &public_key.inner, true)
            == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify an aggregate signature against a subset of public keys.
    ///
    /// The subset public keys are aggregated into one key, then the
    /// signature is verified against it. All signers must have signed the
    /// same message.
    pub fn verify_aggregate(&self, message: &[u8], public_keys: &[&BlsPublicKey]) -> bool {
        if public_keys.is_empty() {
            return false;
        }
        let pks: Vec<&PublicKey> = public_keys.iter().map(|pk| &pk.inner).collect();
        let agg_pk = match AggregatePublicKey::aggregate(&pks, false) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        self.inner
            .verify(true, message, DST, &[], &agg_pk.to_public_key(), true)
            == BLST_ERROR::BLST_SUCCESS
    }

    /// Verify an aggregate signature where signers signed different messages.
    ///
    /// Used for quorum certificates carrying both strong and weak votes:
    /// strong voters signed the strong digest, weak voters the weak digest,
    /// and a single aggregate covers both groups.
    pub fn verify_aggregate_multi(&self, pairs: &[(&[u8], &BlsPublicKey)]) -> bool {
        if pairs.is_empty() {
            return false;
        }
        let msgs: Vec<&[u8]> = pairs.iter().map(|(m, _)| *m).collect();
        let pks: Vec<&PublicKey> = pairs.iter().map(|(_, pk)| &pk.inner).collect();
        self.inner.aggregate_verify(true, &msgs, DST, &pks, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsSignature")
            .field("bytes", &self.to_hex())
            .finish()
    }
}

impl Serialize for BlsSignature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            BlsSignature::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            if bytes.len() != 96 {
                return Err(serde::de::Error::custom(format!(
                    "expected 96 bytes, got {}",
                    bytes.len()
                )));
            }
            let mut arr = [0u8; 96];
            arr.copy_from_slice(&bytes);
            BlsSignature::from_bytes(&arr).map_err(serde::de::Error::custom)
        }
    }
}

/// A running aggregate of vote signatures.
///
/// Starts empty; each accepted vote's signature is folded in with [`add`].
/// The accumulated aggregate seals into a plain [`BlsSignature`] when a
/// quorum certificate is produced.
///
/// [`add`]: BlsAggregateSignature::add
#[derive(Clone, Default)]
pub struct BlsAggregateSignature {
    inner: Option<Signature>,
}

impl BlsAggregateSignature {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any signature has been folded in yet.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Fold one signature into the aggregate.
    pub fn add(&mut self, sig: &BlsSignature) -> Result<()> {
        match &self.inner {
            None => {
                self.inner = Some(sig.inner);
                Ok(())
            }
            Some(current) => {
                let mut agg = AggregateSignature::from_signature(current);
                agg.add_signature(&sig.inner, false)
                    .map_err(|e| CryptoError::BlsError(format!("aggregation failed: {:?}", e)))?;
                self.inner = Some(agg.to_signature());
                Ok(())
            }
        }
    }

    /// Seal the aggregate into a signature.
    ///
    /// Fails if no signatures have been added.
    pub fn to_signature(&self) -> Result<BlsSignature> {
        match &self.inner {
            Some(sig) => Ok(BlsSignature { inner: *sig }),
            None => Err(CryptoError::BlsError("empty aggregate".to_string())),
        }
    }
}

impl std::fmt::Debug for BlsAggregateSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(sig) => write!(f, "BlsAggregateSignature({})", hex::encode(sig.to_bytes())),
            None => write!(f, "BlsAggregateSignature(empty)"),
        }
    }
}
