//! Per-block header state and the transition function.
//!
//! A [`BlockHeaderState`] is the immutable snapshot attached to every block
//! in the fork database: the header, the active and pending policies, the
//! finality core, and enough ancestor history to validate any QC a
//! descendant may claim - including after a restart from a snapshot with no
//! block log, when ancestors below the fork root are otherwise unknown.
//!
//! [`BlockHeaderState::next`] produces the child state either in *building*
//! mode (a local producer assembling a block) or in *validating* mode
//! (reconstructing the state from a received signed header and checking the
//! recomputed id against the received one).

use crate::core::{FinalityCore, FinalityCoreError};
use fincore_crypto::{create_weak_digest, Digest};
use fincore_types::{
    emplace_extension, extract_header_extensions, AccountName, BlockHeader, BlockId, BlockNum,
    BlockTimestamp, ExtensionError, FinalizerPolicy, HeaderExtension, InstantFinalityExtension,
    PolicyError, ProposerPolicy, ProtocolFeatureActivation, Qc, QcClaim, QcError,
    SignedBlockHeader, WireEncode, HS_BLOCK_CONFIRMED,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Fatal block validation failures; the block and its descendants are
/// rejected.
#[derive(Debug, thiserror::Error)]
pub enum BlockValidationError {
    /// Header's `previous` does not match the state being extended
    #[error("previous mismatch: header links {got}, state is {expected}")]
    PreviousMismatch { expected: BlockId, got: BlockId },

    /// Producer differs from the scheduled one
    #[error("wrong producer: expected {expected}, got {got}")]
    WrongProducer {
        expected: AccountName,
        got: AccountName,
    },

    /// Timestamp not beyond the parent's
    #[error("timestamp slot {got} not greater than parent slot {parent}")]
    NonMonotonicTimestamp { parent: u32, got: u32 },

    /// Malformed or missing header extensions
    #[error(transparent)]
    Extension(#[from] ExtensionError),

    /// The QC claim violated the core's monotonicity rules
    #[error(transparent)]
    Claim(#[from] FinalityCoreError),

    /// The claim references a block past this one
    #[error("qc claim on block {claimed} exceeds block number {block_num}")]
    ClaimBeyondBlock { claimed: BlockNum, block_num: BlockNum },

    /// A received header's instant-finality extension carried no claim
    #[error("received header carries no qc claim")]
    MissingQcClaim,

    /// The claim references an ancestor older than the retained history
    #[error("no ancestor reference retained for claimed block {0}")]
    MissingAncestorRef(BlockNum),

    /// A protocol feature was activated twice
    #[error("protocol feature {0} already activated")]
    DuplicateProtocolFeature(Digest),

    /// A proposed finalizer policy failed validation
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The attached QC failed cryptographic verification
    #[error(transparent)]
    Qc(#[from] QcError),

    /// A QC payload was attached for a repeated claim, or missing for a new
    /// claim
    #[error("qc attachment mismatch: {0}")]
    QcAttachmentMismatch(&'static str),

    /// Recomputed id differs from the received header's id
    #[error("computed block id {computed} does not match received id {received}")]
    IdMismatch { computed: BlockId, received: BlockId },
}

/// A compact reference to one ancestor block.
///
/// The fork root's state retains these for the whole span
/// `[last_final_block_num, self]`, which is exactly what a node restarted
/// from a snapshot needs to validate incoming QC claims on blocks it has
/// never seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub block_num: BlockNum,
    pub id: BlockId,
    pub timestamp: BlockTimestamp,
    /// The block number that this block's own latest QC claim references
    pub latest_qc_claim_block_num: BlockNum,
    /// Generation of the finalizer policy active at this block
    pub active_policy_generation: u32,
    /// Generation of the pending policy at this block, if one existed
    pub pending_policy_generation: Option<u32>,
}

/// A pending finalizer policy and the block at which it became pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFinalizerPolicy {
    /// Block number where the policy moved from proposed to pending
    pub became_pending_at: BlockNum,
    pub policy: Arc<FinalizerPolicy>,
}

/// The inputs to a block transition.
#[derive(Debug, Clone, Default)]
pub struct BuildInput {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    pub parent_id: BlockId,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    pub new_protocol_feature_activations: Vec<Digest>,
    pub new_proposer_policy: Option<ProposerPolicy>,
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    /// The QC claim to carry; inherited from the parent when absent
    pub qc_claim: Option<QcClaim>,
    /// Whether this transition validates a received header
    pub validating: bool,
}

/// Immutable per-block state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeaderState {
    pub id: BlockId,
    pub header: BlockHeader,
    pub activated_protocol_features: Arc<Vec<Digest>>,
    pub core: FinalityCore,

    pub active_proposer_policy: Arc<ProposerPolicy>,
    /// Scheduled proposer policies ordered by activation slot
    pub pending_proposer_policies: BTreeMap<BlockTimestamp, Arc<ProposerPolicy>>,

    pub active_finalizer_policy: Arc<FinalizerPolicy>,
    pub pending_finalizer_policy: Option<PendingFinalizerPolicy>,
    /// Proposed finalizer policies not yet pending: `(proposed_at, policy)`
    pub proposed_finalizer_policies: Vec<(BlockNum, Arc<FinalizerPolicy>)>,

    /// Every finalizer policy generation referenced by `block_refs`,
    /// retained so QCs on any referenced ancestor remain verifiable
    pub finalizer_policies: BTreeMap<u32, Arc<FinalizerPolicy>>,
    /// Ancestor references spanning `[last_final_block_num, block_num]`,
    /// newest last
    pub block_refs: VecDeque<BlockRef>,
}

impl BlockHeaderState {
    /// Build the root state of a new chain.
    ///
    /// The genesis block carries a weak self-claim and is final from the
    /// start.
    pub fn genesis(
        timestamp: BlockTimestamp,
        producer: AccountName,
        finalizer_policy: FinalizerPolicy,
        proposer_policy: ProposerPolicy,
    ) -> Result<Self, BlockValidationError> {
        finalizer_policy.validate()?;
        let finalizer_policy = Arc::new(finalizer_policy);
        let proposer_policy = Arc::new(proposer_policy);

        let mut header = BlockHeader {
            timestamp,
            producer,
            confirmed: HS_BLOCK_CONFIRMED,
            previous: BlockId::default(), // zero id, so the genesis block is number 1
            transaction_mroot: Digest::ZERO,
            action_mroot: Digest::ZERO,
            schedule_version: proposer_policy.version,
            header_extensions: Vec::new(),
        };
        let block_num = header.block_num();
        let if_ext = InstantFinalityExtension {
            qc_claim: Some(QcClaim {
                block_num,
                is_strong_qc: false,
            }),
            new_finalizer_policy: None,
            new_proposer_policy: None,
        };
        emplace_extension(
            &mut header.header_extensions,
            InstantFinalityExtension::EXTENSION_ID,
            if_ext.to_wire_bytes(),
        );
        let id = header.calculate_id();

        let generation = finalizer_policy.generation;
        let mut finalizer_policies = BTreeMap::new();
        finalizer_policies.insert(generation, Arc::clone(&finalizer_policy));

        let mut block_refs = VecDeque::new();
        block_refs.push_back(BlockRef {
            block_num,
            id,
            timestamp,
            latest_qc_claim_block_num: block_num,
            active_policy_generation: generation,
            pending_policy_generation: None,
        });

        Ok(Self {
            id,
            header,
            activated_protocol_features: Arc::new(Vec::new()),
            core: FinalityCore::genesis(block_num),
            active_proposer_policy: proposer_policy,
            pending_proposer_policies: BTreeMap::new(),
            active_finalizer_policy: finalizer_policy,
            pending_finalizer_policy: None,
            proposed_finalizer_policies: Vec::new(),
            finalizer_policies,
            block_refs,
        })
    }

    /// This block's number.
    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    /// This block's timestamp.
    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// The claim carried by this block.
    pub fn latest_qc_claim(&self) -> QcClaim {
        self.core.latest_qc_claim()
    }

    /// The retained reference for ancestor `block_num`, if still in range.
    pub fn get_block_ref(&self, block_num: BlockNum) -> Option<&BlockRef> {
        let first = self.block_refs.front()?.block_num;
        if block_num < first {
            return None;
        }
        let index = (block_num - first) as usize;
        let r = self.block_refs.get(index)?;
        debug_assert_eq!(r.block_num, block_num);
        Some(r)
    }

    /// Timestamp of the block this state's latest claim references.
    pub fn latest_qc_block_timestamp(&self) -> Option<BlockTimestamp> {
        let claim = self.latest_qc_claim();
        self.get_block_ref(claim.block_num).map(|r| r.timestamp)
    }

    /// Whether this state's branch contains the block with the given id.
    ///
    /// References below the last final block are treated as extended: the
    /// finalized prefix is unique by construction.
    pub fn extends(&self, ancestor: &BlockId) -> bool {
        let num = ancestor.block_num();
        if num > self.block_num() {
            return false;
        }
        match self.get_block_ref(num) {
            Some(r) => &r.id == ancestor,
            None => num < self.core.last_final_block_num,
        }
    }

    /// The retained policy with the given generation.
    pub fn finalizer_policy_for(&self, generation: u32) -> Option<Arc<FinalizerPolicy>> {
        self.finalizer_policies.get(&generation).cloned()
    }

    /// Verify a sealed QC claimed on an ancestor of this block.
    ///
    /// Resolves the ancestor's digests and policy generations from the
    /// retained history; works identically before and after a snapshot
    /// restart.
    pub fn verify_qc_claimed_on_ancestor(&self, qc: &Qc) -> Result<(), BlockValidationError> {
        let r = self
            .get_block_ref(qc.block_num)
            .ok_or(BlockValidationError::MissingAncestorRef(qc.block_num))?;
        let active_policy = self
            .finalizer_policy_for(r.active_policy_generation)
            .ok_or(BlockValidationError::MissingAncestorRef(qc.block_num))?;

        let strong_digest = *r.id.as_digest();
        let weak_digest = create_weak_digest(&strong_digest);
        qc.active_policy_sig
            .verify(&active_policy, &strong_digest, &weak_digest)?;

        match (r.pending_policy_generation, &qc.pending_policy_sig) {
            (Some(generation), Some(sig)) => {
                let pending_policy = self
                    .finalizer_policy_for(generation)
                    .ok_or(BlockValidationError::MissingAncestorRef(qc.block_num))?;
                sig.verify(&pending_policy, &strong_digest, &weak_digest)?;
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(QcError::PendingPolicyMismatch(
                    "claimed block had a pending policy but QC has no pending signature",
                )
                .into());
            }
            (None, Some(_)) => {
                return Err(QcError::PendingPolicyMismatch(
                    "QC has a pending signature but claimed block had no pending policy",
                )
                .into());
            }
        }
        Ok(())
    }

    /// The next generation a newly proposed finalizer policy receives.
    fn next_finalizer_generation(&self) -> u32 {
        let mut generation = self.active_finalizer_policy.generation;
        if let Some(pending) = &self.pending_finalizer_policy {
            generation = generation.max(pending.policy.generation);
        }
        for (_, proposed) in &self.proposed_finalizer_policies {
            generation = generation.max(proposed.generation);
        }
        generation + 1
    }

    /// Produce or validate the next block header state.
    pub fn next(&self, input: &BuildInput) -> Result<BlockHeaderState, BlockValidationError> {
        if input.parent_id != self.id {
            return Err(BlockValidationError::PreviousMismatch {
                expected: self.id,
                got: input.parent_id,
            });
        }
        if input.timestamp <= self.timestamp() {
            return Err(BlockValidationError::NonMonotonicTimestamp {
                parent: self.timestamp().slot,
                got: input.timestamp.slot,
            });
        }

        // header template; the schedule version may be bumped below
        let mut header = BlockHeader {
            timestamp: input.timestamp,
            producer: input.producer,
            confirmed: HS_BLOCK_CONFIRMED,
            previous: self.id,
            transaction_mroot: input.transaction_mroot,
            action_mroot: input.action_mroot,
            schedule_version: self.header.schedule_version,
            header_extensions: Vec::new(),
        };
        let block_num = header.block_num();

        // activated protocol features: order-preserving union
        let activated_protocol_features = if input.new_protocol_feature_activations.is_empty() {
            Arc::clone(&self.activated_protocol_features)
        } else {
            let mut features = (*self.activated_protocol_features).clone();
            for digest in &input.new_protocol_feature_activations {
                if features.contains(digest) {
                    return Err(BlockValidationError::DuplicateProtocolFeature(*digest));
                }
                features.push(*digest);
            }
            Arc::new(features)
        };

        // finality core; when validating, the extension's claim is
        // authoritative and must be present
        let claim = match input.qc_claim {
            Some(claim) => claim,
            None if input.validating => return Err(BlockValidationError::MissingQcClaim),
            None => self.latest_qc_claim(),
        };
        if claim.block_num > self.block_num() {
            return Err(BlockValidationError::ClaimBeyondBlock {
                claimed: claim.block_num,
                block_num: self.block_num(),
            });
        }
        let claimed_target = self
            .get_block_ref(claim.block_num)
            .map(|r| r.latest_qc_claim_block_num)
            .unwrap_or(self.core.last_final_block_num);
        let core = self.core.next(claim, claimed_target)?;

        // proposer policy rotation: the head entry activates with one slot
        // of lead time
        let mut active_proposer_policy = Arc::clone(&self.active_proposer_policy);
        let mut pending_proposer_policies = self.pending_proposer_policies.clone();
        if let Some((&slot, _)) = pending_proposer_policies.iter().next() {
            if slot.slot <= input.timestamp.slot.saturating_sub(1) {
                let policy = pending_proposer_policies
                    .remove(&slot)
                    .expect("head entry exists");
                header.schedule_version = self.header.schedule_version + 1;
                let mut activated = (*policy).clone();
                activated.version = header.schedule_version;
                info!(
                    version = activated.version,
                    at_slot = input.timestamp.slot,
                    "proposer policy activated"
                );
                active_proposer_policy = Arc::new(activated);
            }
        }
        if let Some(new_policy) = &input.new_proposer_policy {
            pending_proposer_policies
                .insert(new_policy.active_time, Arc::new(new_policy.clone()));
        }

        // finalizer policy rotation, driven by finality advancement:
        // pending becomes active once the block where it became pending is
        // final; the newest eligible proposed policy becomes pending once
        // its proposing block is final
        let mut active_finalizer_policy = Arc::clone(&self.active_finalizer_policy);
        let mut pending_finalizer_policy = self.pending_finalizer_policy.clone();
        let mut proposed_finalizer_policies = self.proposed_finalizer_policies.clone();
        let mut finalizer_policies = self.finalizer_policies.clone();
        let lib = core.last_final_block_num;

        if let Some(pending) = &pending_finalizer_policy {
            if pending.became_pending_at <= lib {
                info!(
                    generation = pending.policy.generation,
                    "finalizer policy activated"
                );
                active_finalizer_policy = Arc::clone(&pending.policy);
                pending_finalizer_policy = None;
            }
        }
        if pending_finalizer_policy.is_none() {
            let eligible: Vec<usize> = proposed_finalizer_policies
                .iter()
                .enumerate()
                .filter(|(_, (proposed_at, _))| *proposed_at <= lib)
                .map(|(i, _)| i)
                .collect();
            if let Some(&newest) = eligible.last() {
                let (_, policy) = proposed_finalizer_policies[newest].clone();
                debug!(
                    generation = policy.generation,
                    at_block = block_num,
                    "finalizer policy now pending"
                );
                finalizer_policies.insert(policy.generation, Arc::clone(&policy));
                pending_finalizer_policy = Some(PendingFinalizerPolicy {
                    became_pending_at: block_num,
                    policy,
                });
                // everything at or below LIB is consumed or superseded
                proposed_finalizer_policies.retain(|(proposed_at, _)| *proposed_at > lib);
            }
        }

        // a newly proposed policy gets the next generation deterministically
        let new_finalizer_policy_ext = match &input.new_finalizer_policy {
            Some(proposed) => {
                let mut policy = proposed.clone();
                policy.generation = self.next_finalizer_generation();
                policy.validate()?;
                let policy = Arc::new(policy);
                proposed_finalizer_policies.push((block_num, Arc::clone(&policy)));
                Some((*policy).clone())
            }
            None => None,
        };

        // instant finality extension, present in every block
        let if_ext = InstantFinalityExtension {
            qc_claim: Some(claim),
            new_finalizer_policy: new_finalizer_policy_ext,
            new_proposer_policy: input.new_proposer_policy.clone(),
        };
        emplace_extension(
            &mut header.header_extensions,
            InstantFinalityExtension::EXTENSION_ID,
            if_ext.to_wire_bytes(),
        );

        // protocol feature activation extension when new features arrived
        if !input.new_protocol_feature_activations.is_empty() {
            let pfa = ProtocolFeatureActivation {
                protocol_features: input.new_protocol_feature_activations.clone(),
            };
            emplace_extension(
                &mut header.header_extensions,
                ProtocolFeatureActivation::EXTENSION_ID,
                pfa.to_wire_bytes(),
            );
        }

        let id = header.calculate_id();

        // extend and prune the ancestor reference history
        let mut block_refs = self.block_refs.clone();
        block_refs.push_back(BlockRef {
            block_num,
            id,
            timestamp: input.timestamp,
            latest_qc_claim_block_num: claim.block_num,
            active_policy_generation: active_finalizer_policy.generation,
            pending_policy_generation: pending_finalizer_policy
                .as_ref()
                .map(|p| p.policy.generation),
        });
        while block_refs
            .front()
            .is_some_and(|r| r.block_num < core.last_final_block_num)
        {
            block_refs.pop_front();
        }

        // retain exactly the policy generations the remaining refs name
        let min_generation = block_refs
            .iter()
            .map(|r| r.active_policy_generation)
            .min()
            .unwrap_or(active_finalizer_policy.generation);
        finalizer_policies.retain(|generation, _| *generation >= min_generation);
        finalizer_policies.insert(
            active_finalizer_policy.generation,
            Arc::clone(&active_finalizer_policy),
        );
        if let Some(pending) = &pending_finalizer_policy {
            finalizer_policies.insert(pending.policy.generation, Arc::clone(&pending.policy));
        }

        Ok(BlockHeaderState {
            id,
            header,
            activated_protocol_features,
            core,
            active_proposer_policy,
            pending_proposer_policies,
            active_finalizer_policy,
            pending_finalizer_policy,
            proposed_finalizer_policies,
            finalizer_policies,
            block_refs,
        })
    }

    /// Validate a received signed header by re-running the transition and
    /// comparing the computed id with the received one.
    pub fn next_validating(
        &self,
        signed_header: &SignedBlockHeader,
    ) -> Result<BlockHeaderState, BlockValidationError> {
        let header = &signed_header.header;
        if header.previous != self.id {
            return Err(BlockValidationError::PreviousMismatch {
                expected: self.id,
                got: header.previous,
            });
        }

        // the producer must match the schedule of the state being extended
        let scheduled = self
            .active_proposer_policy
            .scheduled_producer(header.timestamp)
            .producer_name;
        if header.producer != scheduled {
            return Err(BlockValidationError::WrongProducer {
                expected: scheduled,
                got: header.producer,
            });
        }

        let extensions = extract_header_extensions(&header.header_extensions)?;
        let if_ext = extensions.require_instant_finality()?;

        // the extension's claim is authoritative for core advancement
        let input = BuildInput {
            timestamp: header.timestamp,
            producer: header.producer,
            parent_id: self.id,
            transaction_mroot: header.transaction_mroot,
            action_mroot: header.action_mroot,
            new_protocol_feature_activations: extensions
                .protocol_features
                .as_ref()
                .map(|pfa| pfa.protocol_features.clone())
                .unwrap_or_default(),
            new_proposer_policy: if_ext.new_proposer_policy.clone(),
            new_finalizer_policy: if_ext.new_finalizer_policy.clone(),
            qc_claim: if_ext.qc_claim,
            validating: true,
        };

        let next = self.next(&input)?;
        let received_id = header.calculate_id();
        if next.id != received_id {
            return Err(BlockValidationError::IdMismatch {
                computed: next.id,
                received: received_id,
            });
        }
        Ok(next)
    }
}
