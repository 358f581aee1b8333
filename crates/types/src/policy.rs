//! Finalizer and proposer policies.
//!
//! A **finalizer policy** names the committee whose BLS votes form quorum
//! certificates: an ordered list of weighted authorities, a quorum
//! threshold, and a generation counter that increments on every rotation.
//! Finalizer order fixes the bitset indices used in QCs and is immutable
//! within a generation.
//!
//! A **proposer policy** is the ordered block production schedule plus the
//! slot at which it activates.

use crate::name::AccountName;
use crate::timestamp::BlockTimestamp;
use crate::wire::{
    get_string, get_u32, get_u64, get_var_bytes, get_varuint32, put_string, put_u32, put_u64,
    put_var_bytes, put_varuint32, WireDecode, WireEncode, WireError, WireResult,
};
use fincore_crypto::BlsPublicKey;
use serde::{Deserialize, Serialize};

/// Consecutive slots assigned to each producer before the schedule moves on.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// Errors from policy validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Policy has no members
    #[error("policy has no members")]
    Empty,

    /// Member weight is zero
    #[error("finalizer {0} has zero weight")]
    ZeroWeight(String),

    /// Summed weights overflow u64
    #[error("total weight overflows u64")]
    WeightOverflow,

    /// Threshold below the BFT minimum or above the total weight
    #[error("threshold {threshold} outside valid range ({min}..={max})")]
    BadThreshold { threshold: u64, min: u64, max: u64 },

    /// Duplicate finalizer key
    #[error("duplicate finalizer key {0}")]
    DuplicateKey(String),
}

/// One member of a finalizer committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerAuthority {
    /// Operator-facing label, not consensus-relevant
    pub description: String,
    /// Voting weight
    pub weight: u64,
    /// BLS public key the member votes with
    pub public_key: BlsPublicKey,
}

impl WireEncode for FinalizerAuthority {
    fn encode(&self, out: &mut Vec<u8>) {
        put_string(out, &self.description);
        put_u64(out, self.weight);
        put_var_bytes(out, &self.public_key.to_bytes());
    }
}

impl WireDecode for FinalizerAuthority {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let description = get_string(input)?;
        let weight = get_u64(input)?;
        let key_bytes = get_var_bytes(input)?;
        if key_bytes.len() != 48 {
            return Err(WireError::InvalidValue("BLS public key must be 48 bytes"));
        }
        let mut arr = [0u8; 48];
        arr.copy_from_slice(key_bytes);
        let public_key = BlsPublicKey::from_bytes(&arr)
            .map_err(|_| WireError::InvalidValue("invalid BLS public key"))?;
        Ok(Self {
            description,
            weight,
            public_key,
        })
    }
}

/// A generation of the finalizer committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerPolicy {
    /// Monotone counter identifying this policy version
    pub generation: u32,
    /// Minimum combined weight for a quorum
    pub threshold: u64,
    /// Ordered committee; position fixes the QC bitset index
    pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
    /// Combined weight of all members.
    ///
    /// Valid policies never overflow ([`validate`] checks the sum), so this
    /// saturates rather than panicking on adversarial input.
    ///
    /// [`validate`]: FinalizerPolicy::validate
    pub fn total_weight(&self) -> u64 {
        self.finalizers
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(f.weight))
    }

    /// The largest cumulative weak weight still compatible with reaching a
    /// strong QC.
    pub fn max_weak_sum_before_weak_final(&self) -> u64 {
        self.total_weight() - self.threshold
    }

    /// Bitset index of the member with the given key.
    pub fn finalizer_index(&self, key: &BlsPublicKey) -> Option<usize> {
        self.finalizers.iter().position(|f| &f.public_key == key)
    }

    /// Number of committee members.
    pub fn num_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    /// Check the policy invariants: non-empty, positive weights, no
    /// duplicate keys, no weight overflow, and
    /// `threshold >= 2*total_weight/3 + 1`.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.finalizers.is_empty() {
            return Err(PolicyError::Empty);
        }
        let mut total: u64 = 0;
        for f in &self.finalizers {
            if f.weight == 0 {
                return Err(PolicyError::ZeroWeight(f.description.clone()));
            }
            total = total
                .checked_add(f.weight)
                .ok_or(PolicyError::WeightOverflow)?;
        }
        for (i, f) in self.finalizers.iter().enumerate() {
            if self.finalizers[..i]
                .iter()
                .any(|other| other.public_key == f.public_key)
            {
                return Err(PolicyError::DuplicateKey(f.public_key.to_hex()));
            }
        }
        let min = total * 2 / 3 + 1;
        if self.threshold < min || self.threshold > total {
            return Err(PolicyError::BadThreshold {
                threshold: self.threshold,
                min,
                max: total,
            });
        }
        Ok(())
    }
}

impl WireEncode for FinalizerPolicy {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.generation);
        put_u64(out, self.threshold);
        put_varuint32(out, self.finalizers.len() as u32);
        for f in &self.finalizers {
            f.encode(out);
        }
    }
}

impl WireDecode for FinalizerPolicy {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let generation = get_u32(input)?;
        let threshold = get_u64(input)?;
        let count = get_varuint32(input)? as usize;
        let mut finalizers = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            finalizers.push(FinalizerAuthority::decode(input)?);
        }
        Ok(Self {
            generation,
            threshold,
            finalizers,
        })
    }
}

/// One slot-holder in the production schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerAuthority {
    /// Producer account
    pub producer_name: AccountName,
    /// Opaque block-signing authority (producer signatures are checked by
    /// an outer layer)
    pub block_signing_authority: Vec<u8>,
}

impl WireEncode for ProposerAuthority {
    fn encode(&self, out: &mut Vec<u8>) {
        self.producer_name.encode(out);
        put_var_bytes(out, &self.block_signing_authority);
    }
}

impl WireDecode for ProposerAuthority {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            producer_name: AccountName::decode(input)?,
            block_signing_authority: get_var_bytes(input)?.to_vec(),
        })
    }
}

/// An ordered production schedule activated at a timestamp slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerPolicy {
    /// Schedule version; copied from the header's `schedule_version` when
    /// the policy activates
    pub version: u32,
    /// Slot at which this schedule becomes active
    pub active_time: BlockTimestamp,
    /// Ordered producer schedule
    pub proposer_schedule: Vec<ProposerAuthority>,
}

impl ProposerPolicy {
    /// The producer scheduled for slot `t`.
    ///
    /// Each producer holds [`PRODUCER_REPETITIONS`] consecutive slots; the
    /// schedule wraps round-robin.
    pub fn scheduled_producer(&self, t: BlockTimestamp) -> &ProposerAuthority {
        let index = (t.slot / PRODUCER_REPETITIONS) as usize % self.proposer_schedule.len();
        &self.proposer_schedule[index]
    }
}

impl WireEncode for ProposerPolicy {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.version);
        self.active_time.encode(out);
        put_varuint32(out, self.proposer_schedule.len() as u32);
        for p in &self.proposer_schedule {
            p.encode(out);
        }
    }
}

impl WireDecode for ProposerPolicy {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let version = get_u32(input)?;
        let active_time = BlockTimestamp::decode(input)?;
        let count = get_varuint32(input)? as usize;
        if count == 0 {
            return Err(WireError::InvalidValue("empty proposer schedule"));
        }
        let mut proposer_schedule = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            proposer_schedule.push(ProposerAuthority::decode(input)?);
        }
        Ok(Self {
            version,
            active_time,
            proposer_schedule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fincore_crypto::bls::BlsPrivateKey;

    fn authority(desc: &str, weight: u64) -> FinalizerAuthority {
        FinalizerAuthority {
            description: desc.to_string(),
            weight,
            public_key: BlsPrivateKey::random().public_key(),
        }
    }

    #[test]
    fn test_threshold_bounds() {
        let mut policy = FinalizerPolicy {
            generation: 1,
            threshold: 3,
            finalizers: (0..4).map(|i| authority(&format!("f{i}"), 1)).collect(),
        };
        assert!(policy.validate().is_ok());
        assert_eq!(policy.total_weight(), 4);
        assert_eq!(policy.max_weak_sum_before_weak_final(), 1);

        policy.threshold = 2; // below 2*4/3 + 1 == 3
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::BadThreshold { .. })
        ));

        policy.threshold = 5; // above total
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::BadThreshold { .. })
        ));
    }

    #[test]
    fn test_finalizer_index_follows_order() {
        let policy = FinalizerPolicy {
            generation: 1,
            threshold: 3,
            finalizers: (0..4).map(|i| authority(&format!("f{i}"), 1)).collect(),
        };
        for (i, f) in policy.finalizers.iter().enumerate() {
            assert_eq!(policy.finalizer_index(&f.public_key), Some(i));
        }
        assert_eq!(
            policy.finalizer_index(&BlsPrivateKey::random().public_key()),
            None
        );
    }

    #[test]
    fn test_scheduled_producer_rotation() {
        let schedule: Vec<ProposerAuthority> = ["alpha", "beta"]
            .iter()
            .map(|n| ProposerAuthority {
                producer_name: n.parse().unwrap(),
                block_signing_authority: Vec::new(),
            })
            .collect();
        let policy = ProposerPolicy {
            version: 1,
            active_time: BlockTimestamp::new(0),
            proposer_schedule: schedule,
        };

        // Each producer keeps PRODUCER_REPETITIONS consecutive slots.
        let a = policy.scheduled_producer(BlockTimestamp::new(0)).producer_name;
        let still_a = policy
            .scheduled_producer(BlockTimestamp::new(PRODUCER_REPETITIONS - 1))
            .producer_name;
        let b = policy
            .scheduled_producer(BlockTimestamp::new(PRODUCER_REPETITIONS))
            .producer_name;
        assert_eq!(a, still_a);
        assert_ne!(a, b);
    }
}
