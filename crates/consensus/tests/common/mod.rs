//! In-process cluster harness for finality scenarios.
//!
//! A single controller hosts every branch; test finalizers hold their own
//! safety records and vote only on the blocks the test pushes to them, so
//! partitions, withheld votes, and delayed delivery are all scripted
//! explicitly.

use fincore_consensus::{
    BlockHeaderState, Controller, Finalizer, FinalizerSafetyInfo, ProduceParams, VoteDecision,
    VoteStatus,
};
use fincore_crypto::bls::BlsPrivateKey;
use fincore_types::{
    AccountName, BlockId, BlockTimestamp, FinalizerAuthority, FinalizerPolicy, ProposerAuthority,
    ProposerPolicy, Qc, QcClaim, SignedBlock,
};
use std::sync::Arc;

pub const PRODUCER: &str = "alpha";

/// Deterministic finalizer keys; index 0..n map to test finalizers A, B, C,
/// D, E, ...
pub fn finalizer_keys(n: usize) -> Vec<BlsPrivateKey> {
    (0..n)
        .map(|i| BlsPrivateKey::from_seed(&[i as u8 + 1; 32]).unwrap())
        .collect()
}

pub fn finalizer_policy(generation: u32, keys: &[BlsPrivateKey]) -> FinalizerPolicy {
    FinalizerPolicy {
        generation,
        threshold: (keys.len() as u64 * 2) / 3 + 1,
        finalizers: keys
            .iter()
            .enumerate()
            .map(|(i, key)| FinalizerAuthority {
                description: format!("node{i}"),
                weight: 1,
                public_key: key.public_key(),
            })
            .collect(),
    }
}

pub fn proposer_policy() -> ProposerPolicy {
    ProposerPolicy {
        version: 0,
        active_time: BlockTimestamp::new(0),
        proposer_schedule: vec![ProposerAuthority {
            producer_name: PRODUCER.parse().unwrap(),
            block_signing_authority: Vec::new(),
        }],
    }
}

pub struct Cluster {
    pub controller: Controller,
    /// Test finalizers; committee members plus any extra keys a scenario
    /// rotates in
    pub finalizers: Vec<Finalizer>,
    pub keys: Vec<BlsPrivateKey>,
    pub genesis: BlockId,
}

impl Cluster {
    /// A cluster whose genesis committee is the first `committee` of
    /// `total_keys` deterministic keys; the remainder are spare keys for
    /// rotation scenarios.
    pub fn new(committee: usize, total_keys: usize) -> Self {
        let keys = finalizer_keys(total_keys);
        let policy = finalizer_policy(1, &keys[..committee]);
        let genesis_state = BlockHeaderState::genesis(
            BlockTimestamp::new(0),
            PRODUCER.parse::<AccountName>().unwrap(),
            policy,
            proposer_policy(),
        )
        .unwrap();
        let genesis = genesis_state.id;
        let finalizers = keys
            .iter()
            .map(|key| Finalizer::with_lock(key.clone(), &genesis_state))
            .collect();
        Self {
            controller: Controller::new(genesis_state),
            finalizers,
            keys,
            genesis,
        }
    }

    /// Standard four-finalizer cluster (threshold 3).
    pub fn four() -> Self {
        Self::new(4, 4)
    }

    pub fn state(&self, id: &BlockId) -> Arc<BlockHeaderState> {
        Arc::clone(&self.controller.fork_db().get(id).expect("block in fork db").state)
    }

    /// Produce a block on `parent` at the given slot with default contents.
    pub fn produce(&mut self, parent: &BlockId, slot: u32) -> SignedBlock {
        self.produce_with(parent, slot, ProduceParams::default())
    }

    pub fn produce_with(
        &mut self,
        parent: &BlockId,
        slot: u32,
        mut params: ProduceParams,
    ) -> SignedBlock {
        params.timestamp = BlockTimestamp::new(slot);
        params.producer = PRODUCER.parse().unwrap();
        self.controller
            .produce_block_on(parent, params)
            .expect("block production failed")
    }

    /// Have finalizer `index` decide and sign a vote on `block`, without
    /// delivering it.
    pub fn vote(&mut self, index: usize, block: &BlockId) -> Option<fincore_types::VoteMessage> {
        let state = self.state(block);
        self.finalizers[index].vote(&state)
    }

    /// Deliver a vote to the controller over a synthetic connection.
    pub fn deliver(&mut self, vote: &fincore_types::VoteMessage) -> VoteStatus {
        self.controller.handle_vote(0, vote)
    }

    /// Vote with the given finalizers and deliver immediately, returning
    /// each finalizer's decision.
    pub fn vote_and_deliver(&mut self, indices: &[usize], block: &BlockId) -> Vec<VoteDecision> {
        let mut decisions = Vec::new();
        for &index in indices {
            let state = self.state(block);
            let decision = self.finalizers[index].decide_vote(&state);
            decisions.push(decision);
            let vote = match decision {
                VoteDecision::Strong => Some(fincore_types::VoteMessage::new(
                    *block,
                    true,
                    &self.keys[index],
                )),
                VoteDecision::Weak => Some(fincore_types::VoteMessage::new(
                    *block,
                    false,
                    &self.keys[index],
                )),
                VoteDecision::NoVote => None,
            };
            if let Some(vote) = vote {
                self.deliver(&vote);
            }
        }
        decisions
    }

    /// Produce a block and have every finalizer vote strong on it; the
    /// steady-state happy path.
    pub fn produce_and_vote_all(&mut self, parent: &BlockId, slot: u32) -> SignedBlock {
        let block = self.produce(parent, slot);
        let id = block.id();
        let committee: Vec<usize> = (0..self.finalizers.len()).collect();
        self.vote_and_deliver(&committee, &id);
        block
    }

    pub fn lib(&self) -> u32 {
        self.controller.lib_number()
    }

    pub fn fsi(&self, index: usize) -> &FinalizerSafetyInfo {
        self.finalizers[index].safety_info()
    }

    pub fn claim_of(&self, block: &SignedBlock) -> QcClaim {
        self.state(&block.id()).latest_qc_claim()
    }

    pub fn attached_qc(block: &SignedBlock) -> Option<&Qc> {
        block.qc.as_ref()
    }
}

/// Assert a block carries a strong QC on the expected block.
pub fn assert_strong_qc_on(block: &SignedBlock, expected: &SignedBlock) {
    let qc = block.qc.as_ref().expect("block should carry a QC");
    assert_eq!(qc.block_num, expected.block_num(), "QC block number");
    assert!(qc.is_strong(), "QC should be strong");
}

/// Assert a block carries a weak QC on the expected block.
pub fn assert_weak_qc_on(block: &SignedBlock, expected: &SignedBlock) {
    let qc = block.qc.as_ref().expect("block should carry a QC");
    assert_eq!(qc.block_num, expected.block_num(), "QC block number");
    assert!(qc.is_weak(), "QC should be weak");
}
