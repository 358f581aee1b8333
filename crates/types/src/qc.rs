//! Quorum certificates.
//!
//! A [`QcSig`] is a sealed aggregate over one finalizer policy: bitsets of
//! who voted strong and who voted weak, plus the single aggregate BLS
//! signature covering both groups. A [`Qc`] pairs the active-policy
//! signature with an optional pending-policy signature during committee
//! rotation. A [`QcClaim`] is the compact `{block_num, is_strong_qc}`
//! reference every block header carries.

use crate::policy::FinalizerPolicy;
use crate::wire::{
    get_bool, get_bytes, get_option, get_u32, get_var_bytes, get_varuint32, put_bool, put_bytes,
    put_option, put_u32, put_var_bytes, put_varuint32, WireDecode, WireEncode, WireError,
    WireResult,
};
use fincore_crypto::{BlsPublicKey, BlsSignature, Digest, WeakDigest};
use serde::{Deserialize, Serialize};

/// Errors from QC verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QcError {
    /// Bitset length differs from the policy size
    #[error("bitset length {got} does not match policy size {expected}")]
    BitsetLengthMismatch { got: usize, expected: usize },

    /// No votes present
    #[error("quorum certificate carries no votes")]
    EmptyVotes,

    /// A finalizer appears in both the strong and the weak bitset
    #[error("finalizer {0} voted both strong and weak")]
    DoubleVote(usize),

    /// Accumulated weight below the policy threshold
    #[error("voted weight {weight} below threshold {threshold}")]
    QuorumNotMet { weight: u64, threshold: u64 },

    /// The aggregate signature failed verification
    #[error("aggregate signature verification failed")]
    InvalidAggregate,

    /// Expected a pending-policy signature that was absent, or vice versa
    #[error("pending policy signature mismatch: {0}")]
    PendingPolicyMismatch(&'static str),
}

/// A dynamic bitset indexed by finalizer position in a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteBitset {
    num_bits: u32,
    bits: Vec<u8>,
}

impl VoteBitset {
    /// Create an all-zero bitset of `num_bits` bits.
    pub fn new(num_bits: usize) -> Self {
        Self {
            num_bits: num_bits as u32,
            bits: vec![0u8; num_bits.div_ceil(8)],
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.num_bits as usize
    }

    /// Whether the bitset has zero addressable bits.
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Set bit `index`.
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len());
        self.bits[index / 8] |= 1 << (index % 8);
    }

    /// Read bit `index`.
    pub fn get(&self, index: usize) -> bool {
        index < self.len() && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Whether any bit is set.
    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b != 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterate over the indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|i| self.get(*i))
    }
}

impl WireEncode for VoteBitset {
    fn encode(&self, out: &mut Vec<u8>) {
        put_varuint32(out, self.num_bits);
        put_bytes(out, &self.bits);
    }
}

impl WireDecode for VoteBitset {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let num_bits = get_varuint32(input)?;
        let byte_len = (num_bits as usize).div_ceil(8);
        let bits = get_bytes(input, byte_len)?.to_vec();
        // bits past num_bits must be zero so encodings stay canonical
        if num_bits % 8 != 0 {
            let last = bits[byte_len - 1];
            if last >> (num_bits % 8) != 0 {
                return Err(WireError::InvalidValue("nonzero padding bits in bitset"));
            }
        }
        Ok(Self { num_bits, bits })
    }
}

/// A sealed vote aggregate under a single finalizer policy.
///
/// `is_strong` iff no weak bitset is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcSig {
    /// Who voted on the strong digest
    pub strong_votes: Option<VoteBitset>,
    /// Who voted on the weak digest
    pub weak_votes: Option<VoteBitset>,
    /// Aggregate BLS signature over all votes
    pub sig: BlsSignature,
}

impl QcSig {
    /// Whether this is a strong QC signature (no weak votes).
    pub fn is_strong(&self) -> bool {
        self.weak_votes.is_none()
    }

    /// Whether any weak votes are present.
    pub fn is_weak(&self) -> bool {
        self.weak_votes.is_some()
    }

    /// Verify this aggregate against a policy and the block's digests.
    ///
    /// Checks bitset lengths, non-emptiness, disjointness of the strong and
    /// weak sets, the quorum threshold, and finally the aggregate signature
    /// (strong voters over the strong digest, weak voters over the weak
    /// digest).
    pub fn verify(
        &self,
        policy: &FinalizerPolicy,
        strong_digest: &Digest,
        weak_digest: &WeakDigest,
    ) -> Result<(), QcError> {
        let expected = policy.num_finalizers();
        for bitset in [&self.strong_votes, &self.weak_votes].into_iter().flatten() {
            if bitset.len() != expected {
                return Err(QcError::BitsetLengthMismatch {
                    got: bitset.len(),
                    expected,
                });
            }
        }

        let mut weight: u64 = 0;
        let mut pairs: Vec<(&[u8], &BlsPublicKey)> = Vec::new();
        if let Some(strong) = &self.strong_votes {
            for index in strong.iter_ones() {
                weight = weight.saturating_add(policy.finalizers[index].weight);
                pairs.push((strong_digest.as_bytes(), &policy.finalizers[index].public_key));
            }
        }
        if let Some(weak) = &self.weak_votes {
            for index in weak.iter_ones() {
                if self.strong_votes.as_ref().is_some_and(|s| s.get(index)) {
                    return Err(QcError::DoubleVote(index));
                }
                weight = weight.saturating_add(policy.finalizers[index].weight);
                pairs.push((weak_digest.as_slice(), &policy.finalizers[index].public_key));
            }
        }
        if pairs.is_empty() {
            return Err(QcError::EmptyVotes);
        }
        if weight < policy.threshold {
            return Err(QcError::QuorumNotMet {
                weight,
                threshold: policy.threshold,
            });
        }

        let ok = if self.weak_votes.is_none() {
            // all signers share the strong digest, use the single-message path
            let pks: Vec<&BlsPublicKey> = pairs.iter().map(|(_, pk)| *pk).collect();
            self.sig.verify_aggregate(strong_digest.as_bytes(), &pks)
        } else {
            self.sig.verify_aggregate_multi(&pairs)
        };
        if !ok {
            return Err(QcError::InvalidAggregate);
        }
        Ok(())
    }
}

impl WireEncode for QcSig {
    fn encode(&self, out: &mut Vec<u8>) {
        put_option(out, &self.strong_votes);
        put_option(out, &self.weak_votes);
        put_var_bytes(out, &self.sig.to_bytes());
    }
}

impl WireDecode for QcSig {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let strong_votes = get_option(input)?;
        let weak_votes = get_option(input)?;
        let sig_bytes = get_var_bytes(input)?;
        if sig_bytes.len() != 96 {
            return Err(WireError::InvalidValue("BLS signature must be 96 bytes"));
        }
        let mut arr = [0u8; 96];
        arr.copy_from_slice(sig_bytes);
        let sig = BlsSignature::from_bytes(&arr)
            .map_err(|_| WireError::InvalidValue("invalid BLS signature"))?;
        Ok(Self {
            strong_votes,
            weak_votes,
            sig,
        })
    }
}

/// A quorum certificate for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qc {
    /// The block this certificate finalizes votes for
    pub block_num: u32,
    /// Signatures under the block's active finalizer policy
    pub active_policy_sig: QcSig,
    /// Signatures under the block's pending policy, when one existed
    pub pending_policy_sig: Option<QcSig>,
}

impl Qc {
    /// Strong iff every present component signature is strong.
    pub fn is_strong(&self) -> bool {
        self.active_policy_sig.is_strong()
            && self.pending_policy_sig.as_ref().is_none_or(|s| s.is_strong())
    }

    /// Weak iff any component signature is weak.
    pub fn is_weak(&self) -> bool {
        !self.is_strong()
    }

    /// The compact claim describing this certificate.
    pub fn to_claim(&self) -> QcClaim {
        QcClaim {
            block_num: self.block_num,
            is_strong_qc: self.is_strong(),
        }
    }
}

impl WireEncode for Qc {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.block_num);
        self.active_policy_sig.encode(out);
        put_option(out, &self.pending_policy_sig);
    }
}

impl WireDecode for Qc {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            block_num: get_u32(input)?,
            active_policy_sig: QcSig::decode(input)?,
            pending_policy_sig: get_option(input)?,
        })
    }
}

/// The compact QC reference carried in every block header.
///
/// Ordered by `(block_num, is_strong_qc)`: a strong claim on a block
/// supersedes a weak claim on the same block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct QcClaim {
    /// The claimed QC's block number
    pub block_num: u32,
    /// Whether the claimed QC is strong
    pub is_strong_qc: bool,
}

impl WireEncode for QcClaim {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.block_num);
        put_bool(out, self.is_strong_qc);
    }
}

impl WireDecode for QcClaim {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            block_num: get_u32(input)?,
            is_strong_qc: get_bool(input)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basics() {
        let mut b = VoteBitset::new(10);
        assert_eq!(b.len(), 10);
        assert!(!b.any());
        b.set(0);
        b.set(9);
        assert!(b.get(0) && b.get(9) && !b.get(5));
        assert_eq!(b.count_ones(), 2);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_bitset_wire_rejects_dirty_padding() {
        let mut b = VoteBitset::new(10);
        b.set(3);
        let mut bytes = b.to_wire_bytes();
        // flip a padding bit past num_bits
        *bytes.last_mut().unwrap() |= 0x80;
        assert!(VoteBitset::from_wire_bytes(&bytes).is_err());
    }

    #[test]
    fn test_claim_ordering() {
        let weak = QcClaim {
            block_num: 5,
            is_strong_qc: false,
        };
        let strong = QcClaim {
            block_num: 5,
            is_strong_qc: true,
        };
        let later = QcClaim {
            block_num: 6,
            is_strong_qc: false,
        };
        assert!(weak < strong);
        assert!(strong < later);
    }
}
