//! The chain controller: the single main-domain owner of the fork database
//! and the block lifecycle.
//!
//! Net workers hand votes and blocks to the controller; it validates
//! headers, routes votes to the right aggregator, advances the root when
//! finality progresses, and assembles new blocks when producing. It also
//! takes and restores snapshots: a snapshot is the complete header state of
//! one block, including every finalizer policy generation a restarting node
//! may need to validate incoming QC claims on ancestors it has never seen.

use crate::block_state::{BlockHeaderState, BlockValidationError, BuildInput};
use crate::fork_db::{ForkDb, ForkDbError};
use crate::open_qc::VoteStatus;
use fincore_types::{
    AccountName, BlockId, BlockNum, BlockTimestamp, Digest, FinalizerPolicy, ProposerPolicy, Qc,
    QcClaim, SignedBlock, SignedBlockHeader, VoteMessage,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of blocks past the head for which unlinkable blocks are
/// buffered instead of dropped.
pub const DEFAULT_UNLINKABLE_LOOKAHEAD: u32 = 16;

/// Default per-connection vote allowance.
pub const DEFAULT_MAX_VOTES_PER_CONNECTION: u32 = 2500;

/// Errors surfaced by the controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Fatal validation failure; the block and its descendants are rejected
    #[error(transparent)]
    Validation(#[from] BlockValidationError),

    /// The parent is unknown; the block was buffered or dropped
    #[error("unlinkable block {id} (parent {parent}), {disposition}")]
    Unlinkable {
        id: BlockId,
        parent: BlockId,
        disposition: &'static str,
    },

    /// Fork database inconsistency
    #[error(transparent)]
    ForkDb(#[from] ForkDbError),

    /// Startup-state conflict around snapshots
    #[error("fork database error: {0}")]
    ForkDatabase(String),

    /// Snapshot serialization failure
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// A serialized chain snapshot: one block's complete header state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    state: BlockHeaderState,
}

impl Snapshot {
    /// The snapshotted block's id.
    pub fn block_id(&self) -> BlockId {
        self.state.id
    }

    /// The snapshotted block's number.
    pub fn block_num(&self) -> BlockNum {
        self.state.block_num()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ControllerError> {
        bincode::serialize(self).map_err(|e| ControllerError::Snapshot(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ControllerError> {
        bincode::deserialize(bytes).map_err(|e| ControllerError::Snapshot(e.to_string()))
    }
}

/// Local persistent state discovered at startup, used to validate snapshot
/// restores.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingState {
    pub has_fork_db: bool,
    pub has_block_log: bool,
}

/// Everything a producer supplies for the next block besides what the
/// controller derives itself.
#[derive(Debug, Clone, Default)]
pub struct ProduceParams {
    pub timestamp: BlockTimestamp,
    pub producer: AccountName,
    pub transaction_mroot: Digest,
    pub action_mroot: Digest,
    pub new_protocol_feature_activations: Vec<Digest>,
    pub new_proposer_policy: Option<ProposerPolicy>,
    pub new_finalizer_policy: Option<FinalizerPolicy>,
}

/// Main-domain owner of the fork database and block lifecycle.
#[derive(Debug)]
pub struct Controller {
    fork_db: ForkDb,
    /// Blocks whose parent has not arrived yet, keyed by the missing parent
    pending_blocks: HashMap<BlockId, Vec<SignedBlock>>,
    unlinkable_lookahead: u32,
    /// Per-connection accepted-vote counters for the rate cap
    connection_votes: HashMap<u32, u32>,
    max_votes_per_connection: u32,
}

impl Controller {
    /// Start a chain from a root header state.
    pub fn new(root: BlockHeaderState) -> Self {
        Self {
            fork_db: ForkDb::new(Arc::new(root)),
            pending_blocks: HashMap::new(),
            unlinkable_lookahead: DEFAULT_UNLINKABLE_LOOKAHEAD,
            connection_votes: HashMap::new(),
            max_votes_per_connection: DEFAULT_MAX_VOTES_PER_CONNECTION,
        }
    }

    /// Restore a chain from a snapshot.
    ///
    /// Refuses to start when a fork database survived without a block log:
    /// the fork database would reference reversible blocks the node can no
    /// longer serve.
    pub fn open_from_snapshot(
        snapshot: &Snapshot,
        existing: ExistingState,
    ) -> Result<Self, ControllerError> {
        if existing.has_fork_db && !existing.has_block_log {
            return Err(ControllerError::ForkDatabase(
                "when starting from a snapshot with no block log, \
                 we shouldn't have a fork database either"
                    .to_string(),
            ));
        }
        info!(
            block = %snapshot.state.id,
            "opening chain from snapshot"
        );
        Ok(Self::new(snapshot.state.clone()))
    }

    /// The fork database.
    pub fn fork_db(&self) -> &ForkDb {
        &self.fork_db
    }

    /// The best head state.
    pub fn head(&self) -> Arc<BlockHeaderState> {
        Arc::clone(&self.fork_db.best_head().state)
    }

    /// The last irreversible block number.
    pub fn lib_number(&self) -> BlockNum {
        self.head().core.last_final_block_num
    }

    /// Change the per-connection vote allowance.
    pub fn set_max_votes_per_connection(&mut self, max: u32) {
        self.max_votes_per_connection = max;
    }

    /// Take a snapshot of the given block's state.
    pub fn take_snapshot(&self, id: &BlockId) -> Result<Snapshot, ControllerError> {
        let node = self
            .fork_db
            .get(id)
            .ok_or(ForkDbError::UnknownBlock(*id))?;
        Ok(Snapshot {
            state: (*node.state).clone(),
        })
    }

    /// Apply a received block: validate, insert, propagate its QC, advance
    /// the root, and drain any buffered children.
    ///
    /// Re-applying an already-applied block is a no-op.
    pub fn apply_block(&mut self, block: &SignedBlock) -> Result<BlockId, ControllerError> {
        let id = block.id();
        if self.fork_db.contains(&id) {
            return Ok(id);
        }

        let parent_id = block.signed_header.header.previous;
        let parent_state = match self.fork_db.get(&parent_id) {
            Some(parent) => Arc::clone(&parent.state),
            None => return Err(self.buffer_unlinkable(id, parent_id, block)),
        };

        let state = Arc::new(parent_state.next_validating(&block.signed_header)?);

        // pair the attached certificate with the claim: a fresh claim
        // demands one, a repeated claim forbids one
        let claim = state.latest_qc_claim();
        let parent_claim = parent_state.latest_qc_claim();
        let fresh_claim = claim.block_num > parent_claim.block_num;
        match (&block.qc, fresh_claim) {
            (Some(qc), true) => {
                if qc.to_claim() != claim {
                    return Err(BlockValidationError::QcAttachmentMismatch(
                        "attached QC does not match the header's claim",
                    )
                    .into());
                }
                parent_state.verify_qc_claimed_on_ancestor(qc)?;
            }
            (None, true) => {
                return Err(BlockValidationError::QcAttachmentMismatch(
                    "block advances the QC claim but carries no certificate",
                )
                .into());
            }
            (Some(_), false) => {
                return Err(BlockValidationError::QcAttachmentMismatch(
                    "block repeats its parent's claim but carries a certificate",
                )
                .into());
            }
            (None, false) => {}
        }

        self.fork_db.insert(Arc::clone(&state))?;
        if let Some(qc) = &block.qc {
            self.propagate_received_qc(&id, qc);
        }
        debug!(block = %id, claim = ?claim, "block applied");

        self.advance_finality()?;
        self.drain_pending_children(id)?;
        Ok(id)
    }

    fn buffer_unlinkable(
        &mut self,
        id: BlockId,
        parent: BlockId,
        block: &SignedBlock,
    ) -> ControllerError {
        let head_num = self.head().block_num();
        let within_lookahead = block.block_num() <= head_num + self.unlinkable_lookahead;
        let disposition = if within_lookahead {
            self.pending_blocks
                .entry(parent)
                .or_default()
                .push(block.clone());
            "buffered"
        } else {
            "dropped"
        };
        warn!(block = %id, parent = %parent, disposition, "unlinkable block");
        ControllerError::Unlinkable {
            id,
            parent,
            disposition,
        }
    }

    fn drain_pending_children(&mut self, parent: BlockId) -> Result<(), ControllerError> {
        if let Some(children) = self.pending_blocks.remove(&parent) {
            for child in children {
                // a buffered block that fails validation is simply dropped
                if let Err(e) = self.apply_block(&child) {
                    warn!(block = %child.id(), error = %e, "buffered block rejected");
                }
            }
        }
        Ok(())
    }

    /// Hand a received QC to the aggregator of the block it certifies,
    /// resolved along the branch of the block that carried it.
    fn propagate_received_qc(&self, carrier: &BlockId, qc: &Qc) {
        if let Ok(target) = self.fork_db.ancestor_with_num(carrier, qc.block_num) {
            if let Some(node) = self.fork_db.get(&target) {
                node.open_qc.set_received_qc(qc);
            }
        }
    }

    fn advance_finality(&mut self) -> Result<(), ControllerError> {
        let lib = self.lib_number();
        if lib > self.fork_db.root().state.block_num() {
            self.fork_db.advance_root(lib)?;
        }
        Ok(())
    }

    /// Route a vote to the aggregator of the voted block.
    pub fn handle_vote(&mut self, connection_id: u32, vote: &VoteMessage) -> VoteStatus {
        let count = self.connection_votes.entry(connection_id).or_insert(0);
        if *count >= self.max_votes_per_connection {
            return VoteStatus::MaxExceeded;
        }

        let Some(node) = self.fork_db.get(&vote.block_id) else {
            return VoteStatus::UnknownBlock;
        };
        let status = node.open_qc.aggregate_vote(vote);
        if status == VoteStatus::Success {
            *count += 1;
        }
        status
    }

    /// Assemble, apply, and return the next block on the given parent.
    ///
    /// Walks the parent's branch for the best available certificate; when
    /// it advances past the parent's claim the certificate is attached,
    /// otherwise the parent's claim is repeated with no attachment.
    pub fn produce_block_on(
        &mut self,
        parent_id: &BlockId,
        params: ProduceParams,
    ) -> Result<SignedBlock, ControllerError> {
        let parent = self
            .fork_db
            .get(parent_id)
            .ok_or(ForkDbError::UnknownBlock(*parent_id))?;
        let parent_state = Arc::clone(&parent.state);

        let parent_claim = parent_state.latest_qc_claim();
        let best_qc = self.fork_db.get_best_qc(parent_id);
        let (claim, attached_qc) = match best_qc {
            Some(qc) if qc.block_num > parent_claim.block_num => (qc.to_claim(), Some(qc)),
            _ => (parent_claim, None),
        };

        let input = BuildInput {
            timestamp: params.timestamp,
            producer: params.producer,
            parent_id: *parent_id,
            transaction_mroot: params.transaction_mroot,
            action_mroot: params.action_mroot,
            new_protocol_feature_activations: params.new_protocol_feature_activations,
            new_proposer_policy: params.new_proposer_policy,
            new_finalizer_policy: params.new_finalizer_policy,
            qc_claim: Some(claim),
            validating: false,
        };
        let state = Arc::new(parent_state.next(&input)?);
        let block = SignedBlock {
            signed_header: SignedBlockHeader::unsigned(state.header.clone()),
            qc: attached_qc,
        };

        self.fork_db.insert(Arc::clone(&state))?;
        if let Some(qc) = &block.qc {
            self.propagate_received_qc(&state.id, qc);
        }
        info!(block = %state.id, claim = ?claim, "block produced");
        self.advance_finality()?;
        Ok(block)
    }

    /// Produce on the current best head.
    pub fn produce_block(&mut self, params: ProduceParams) -> Result<SignedBlock, ControllerError> {
        let head_id = self.head().id;
        self.produce_block_on(&head_id, params)
    }
}

/// Helper computing the scheduled claim for a block a producer is about to
/// build, mirroring what [`Controller::produce_block_on`] chooses.
pub fn choose_claim(parent_claim: QcClaim, best_qc: Option<&Qc>) -> QcClaim {
    match best_qc {
        Some(qc) if qc.block_num > parent_claim.block_num => qc.to_claim(),
        _ => parent_claim,
    }
}
