//! The fork database: a DAG of block header states rooted at the last
//! irreversible block.
//!
//! Nodes reference parents; parents never reference children. Children are
//! tracked in a side map so pruning on LIB advancement is id-set
//! subtraction. Each node carries the live [`OpenQc`] aggregator collecting
//! votes for that block.

use crate::block_state::BlockHeaderState;
use crate::open_qc::OpenQc;
use fincore_types::{BlockId, BlockNum, Qc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Errors from fork database operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ForkDbError {
    /// The block's parent is not present
    #[error("unlinkable block {id}: parent {parent} not in fork database")]
    UnlinkableBlock { id: BlockId, parent: BlockId },

    /// The requested block is not present
    #[error("block {0} not in fork database")]
    UnknownBlock(BlockId),

    /// No block with the requested number exists on the best branch
    #[error("no block numbered {0} on the best branch")]
    NoSuchBlockNum(BlockNum),
}

/// One node: the immutable state plus the live vote aggregator.
#[derive(Debug)]
pub struct ForkNode {
    pub state: Arc<BlockHeaderState>,
    pub open_qc: Arc<OpenQc>,
}

impl ForkNode {
    fn new(state: Arc<BlockHeaderState>) -> Self {
        let open_qc = Arc::new(OpenQc::new(
            Arc::clone(&state.active_finalizer_policy),
            state
                .pending_finalizer_policy
                .as_ref()
                .map(|p| Arc::clone(&p.policy)),
        ));
        Self { state, open_qc }
    }
}

/// DAG of block header states rooted at LIB.
#[derive(Debug)]
pub struct ForkDb {
    root_id: BlockId,
    nodes: HashMap<BlockId, ForkNode>,
    children: HashMap<BlockId, BTreeSet<BlockId>>,
}

impl ForkDb {
    /// Create a fork database rooted at the given state.
    pub fn new(root: Arc<BlockHeaderState>) -> Self {
        let root_id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(root_id, ForkNode::new(root));
        Self {
            root_id,
            nodes,
            children: HashMap::new(),
        }
    }

    /// The current root id (the last irreversible block).
    pub fn root_id(&self) -> BlockId {
        self.root_id
    }

    /// The root state.
    pub fn root(&self) -> &ForkNode {
        &self.nodes[&self.root_id]
    }

    /// Look up a node by block id.
    pub fn get(&self, id: &BlockId) -> Option<&ForkNode> {
        self.nodes.get(id)
    }

    /// Whether the block is present.
    pub fn contains(&self, id: &BlockId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether only the root remains.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Insert a state whose parent is present.
    ///
    /// Re-inserting an existing block is a no-op.
    pub fn insert(&mut self, state: Arc<BlockHeaderState>) -> Result<(), ForkDbError> {
        let id = state.id;
        if self.nodes.contains_key(&id) {
            return Ok(());
        }
        let parent = state.header.previous;
        if !self.nodes.contains_key(&parent) {
            return Err(ForkDbError::UnlinkableBlock { id, parent });
        }
        self.children.entry(parent).or_default().insert(id);
        self.nodes.insert(id, ForkNode::new(state));
        Ok(())
    }

    /// The tip maximizing `(last_final, final_on_strong_qc, last_qc, slot,
    /// id)` lexicographically.
    pub fn best_head(&self) -> &ForkNode {
        self.nodes
            .values()
            .max_by_key(|node| {
                let core = &node.state.core;
                (
                    core.last_final_block_num,
                    core.final_on_strong_qc_block_num,
                    core.last_qc_block_num,
                    node.state.timestamp().slot,
                    node.state.id,
                )
            })
            .expect("fork database always holds the root")
    }

    /// Walk from `tip` toward the root, returning the highest-numbered QC
    /// attainable from the live aggregators along the branch.
    pub fn get_best_qc(&self, tip: &BlockId) -> Option<Qc> {
        let mut cursor = *tip;
        loop {
            let node = self.nodes.get(&cursor)?;
            if let Some(qc) = node.open_qc.get_best_qc(node.state.block_num()) {
                return Some(qc);
            }
            if cursor == self.root_id {
                return None;
            }
            cursor = node.state.header.previous;
        }
    }

    /// Find the ancestor of `tip` with the given block number.
    pub fn ancestor_with_num(
        &self,
        tip: &BlockId,
        block_num: BlockNum,
    ) -> Result<BlockId, ForkDbError> {
        let mut cursor = *tip;
        loop {
            let node = self
                .nodes
                .get(&cursor)
                .ok_or(ForkDbError::UnknownBlock(cursor))?;
            match node.state.block_num().cmp(&block_num) {
                std::cmp::Ordering::Equal => return Ok(cursor),
                std::cmp::Ordering::Less => return Err(ForkDbError::NoSuchBlockNum(block_num)),
                std::cmp::Ordering::Greater => {
                    if cursor == self.root_id {
                        return Err(ForkDbError::NoSuchBlockNum(block_num));
                    }
                    cursor = node.state.header.previous;
                }
            }
        }
    }

    /// Advance the root to block number `block_num` on the best branch,
    /// pruning every node at or below it that is not an ancestor of the new
    /// root, and every node on discarded forks.
    pub fn advance_root(&mut self, block_num: BlockNum) -> Result<(), ForkDbError> {
        if block_num <= self.root().state.block_num() {
            return Ok(());
        }
        let best_tip = self.best_head().state.id;
        let new_root = self.ancestor_with_num(&best_tip, block_num)?;

        // survivors: the new root and everything reachable beneath it
        let mut keep: BTreeSet<BlockId> = BTreeSet::new();
        let mut stack = vec![new_root];
        while let Some(id) = stack.pop() {
            if keep.insert(id) {
                if let Some(kids) = self.children.get(&id) {
                    stack.extend(kids.iter().copied());
                }
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|id, _| keep.contains(id));
        self.children.retain(|id, _| keep.contains(id));
        for kids in self.children.values_mut() {
            kids.retain(|id| keep.contains(id));
        }
        self.root_id = new_root;
        info!(
            root = %new_root,
            pruned = before - self.nodes.len(),
            "fork database root advanced"
        );
        debug!(live = self.nodes.len(), "fork database size");
        Ok(())
    }
}
