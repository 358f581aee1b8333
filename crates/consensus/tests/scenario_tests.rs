//! End-to-end finality scenarios on an in-process cluster.
//!
//! Four finalizers A, B, C, D (indices 0..4) of weight 1, threshold 3.
//! Blocks are produced on explicit parents so partitions and forks are
//! scripted directly; votes are cast per finalizer and delivered (or
//! withheld, or delayed) by the test.

mod common;

use common::{assert_strong_qc_on, assert_weak_qc_on, Cluster};
use fincore_consensus::{Controller, ExistingState, ProduceParams, Snapshot, VoteDecision};

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;
const D: usize = 3;

// ---------------------------------------------------------------------------
// Scenario 1: happy chain. All finalizers vote strong on every block; after
// seven blocks the fifth from the end is irreversible (two-chain lag).
// ---------------------------------------------------------------------------
#[test]
fn test_happy_chain_finality_lag() {
    let mut cluster = Cluster::four();
    let mut parent = cluster.genesis;

    let mut blocks = Vec::new();
    for slot in 1..=7 {
        let block = cluster.produce_and_vote_all(&parent, slot);
        parent = block.id();
        blocks.push(block);
    }
    // blocks[0] is b0 .. blocks[6] is b6
    assert_eq!(cluster.lib(), blocks[4].block_num(), "b4 should be final");

    // monotone finality along the applied chain
    let mut prev_final = 0;
    for block in &blocks {
        let core = cluster.state(&block.id()).core;
        assert!(core.last_final_block_num >= prev_final);
        prev_final = core.last_final_block_num;
    }
}

// ---------------------------------------------------------------------------
// Scenario 2: weak masking. D is partitioned off and produces a later block
// on an old parent; B and C are forced to vote weak, then the chain must
// recover strong finality instead of stalling.
//
//                   +-----+  S   +-----+      S     +-----+   no   +-----+   W  +-----+  S  +-----+
//  A produces  <----| b0  |<-----| b1  |<-----------|  b3 |<-------+ b4  |<-----| b5  |<----|  b6 |
//                   +-----+      +-----+            +-----+  claim +-----+      +-----+     +-----+
//                      ^
//                      |                    +-----+
//  D produces          +--------------------| b2  |
//                                      S    +-----+
// ---------------------------------------------------------------------------
#[test]
fn test_weak_masking_recovery() {
    let mut cluster = Cluster::four();

    // two warm-up blocks so b0 has a strong QC from all finalizers
    let warmup = cluster.produce_and_vote_all(&cluster.genesis.clone(), 1);
    let b0 = cluster.produce_and_vote_all(&warmup.id(), 2);

    // partition D; b1 receives strong votes from A, B, C only
    let b1 = cluster.produce(&b0.id(), 3);
    assert_strong_qc_on(&b1, &b0);
    let decisions = cluster.vote_and_deliver(&[A, B, C], &b1.id());
    assert!(decisions.iter().all(|d| *d == VoteDecision::Strong));

    // D produces b2 on b0 at a later slot; B and C see it and vote weak,
    // A never sees it
    let b2 = cluster.produce(&b0.id(), 4);
    assert_strong_qc_on(&b2, &b0);
    assert!(b2.signed_header.header.timestamp > b1.signed_header.header.timestamp);
    let decisions = cluster.vote_and_deliver(&[B, C, D], &b2.id());
    assert_eq!(
        decisions,
        vec![VoteDecision::Weak, VoteDecision::Weak, VoteDecision::Strong]
    );

    // back on the A branch: b3 carries the strong QC on b1. B's and C's
    // votes on b3 are weak, and B's vote is not propagated, so no quorum
    // forms on b3.
    let b3 = cluster.produce(&b1.id(), 5);
    assert_strong_qc_on(&b3, &b1);
    let a_vote = cluster.vote(A, &b3.id()).expect("A votes");
    assert!(a_vote.strong, "A never saw b2, so it votes strong");
    let b_vote = cluster.vote(B, &b3.id()).expect("B votes");
    assert!(!b_vote.strong, "B voted on b2, so it votes weak");
    let c_vote = cluster.vote(C, &b3.id()).expect("C votes");
    assert!(!c_vote.strong);
    cluster.deliver(&a_vote);
    cluster.deliver(&c_vote); // B's vote withheld

    assert_eq!(cluster.lib(), b0.block_num());

    // b4 must repeat b3's claim with no certificate attached
    let b4 = cluster.produce(&b3.id(), 6);
    assert!(b4.qc.is_none(), "no new QC formed on b3");
    assert_eq!(cluster.claim_of(&b4), cluster.claim_of(&b3));
    let decisions = cluster.vote_and_deliver(&[A, B, C], &b4.id());
    assert_eq!(
        decisions,
        vec![VoteDecision::Strong, VoteDecision::Weak, VoteDecision::Weak]
    );
    assert_eq!(cluster.lib(), b0.block_num());

    // the weak votes formed a weak QC on b4; carried by b5, which then
    // receives strong votes again
    let b5 = cluster.produce(&b4.id(), 7);
    assert_weak_qc_on(&b5, &b4);
    let decisions = cluster.vote_and_deliver(&[A, B, C], &b5.id());
    assert!(
        decisions.iter().all(|d| *d == VoteDecision::Strong),
        "all recover to strong votes on b5"
    );
    assert_eq!(cluster.lib(), b0.block_num());

    // the strong QC on b5 finalizes b4
    let b6 = cluster.produce(&b5.id(), 8);
    assert_strong_qc_on(&b6, &b5);
    let decisions = cluster.vote_and_deliver(&[A, B, C], &b6.id());
    assert!(decisions.iter().all(|d| *d == VoteDecision::Strong));
    assert_eq!(cluster.lib(), b4.block_num(), "b4 becomes irreversible");
}

// ---------------------------------------------------------------------------
// Scenario 3: liveness under delayed votes. After a microfork at t4, B's
// votes arrive one block late, so every QC trails by one block. B must
// return to voting strong from b6 on, with its safety record evolving
// exactly as specified.
//
// Time:        t1      t2      t3      t4      t5      t6      t7      t8
//      b0 <--- b1 <--- b2 <-|- b3
//                           \--------- b4 <--- b5 <--- b6 <--- b7 <--- b8
// ---------------------------------------------------------------------------
#[test]
fn test_delayed_votes_liveness() {
    let mut cluster = Cluster::four();

    let b0 = cluster.produce_and_vote_all(&cluster.genesis.clone(), 1);
    let b1 = cluster.produce_and_vote_all(&b0.id(), 2);
    let b2 = cluster.produce_and_vote_all(&b1.id(), 3);
    assert_eq!(cluster.lib(), b0.block_num());

    // D produces b3 on b2; B, C, D see it and vote strong, A does not
    let b3 = cluster.produce(&b2.id(), 4);
    assert_strong_qc_on(&b3, &b2);
    let decisions = cluster.vote_and_deliver(&[B, C, D], &b3.id());
    assert!(decisions.iter().all(|d| *d == VoteDecision::Strong));
    assert_eq!(cluster.lib(), b1.block_num());

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b3.id());
    assert_eq!(fsi.lock.unwrap().block_id, b2.id());
    assert_eq!(fsi.other_branch_latest_time, None);

    // the microfork: b4 is built on b2, skipping a slot. A votes strong
    // (it never saw b3); B and C vote weak. B's votes are delayed by one
    // block from here on.
    let b4 = cluster.produce(&b2.id(), 6);
    assert_strong_qc_on(&b4, &b2);
    let a4 = cluster.vote(A, &b4.id()).unwrap();
    assert!(a4.strong);
    let b4_vote = cluster.vote(B, &b4.id()).unwrap();
    assert!(!b4_vote.strong);
    let c4 = cluster.vote(C, &b4.id()).unwrap();
    assert!(!c4.strong);
    cluster.deliver(&a4);
    cluster.deliver(&c4);
    assert_eq!(cluster.lib(), b1.block_num());

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b4.id());
    assert_eq!(fsi.lock.unwrap().block_id, b2.id());
    assert_eq!(
        fsi.other_branch_latest_time,
        Some(b3.signed_header.header.timestamp),
        "B recorded the abandoned branch's latest time"
    );

    // b5: B's delayed vote on b4 has not arrived, so only two votes exist
    // on b4 and b5 repeats the claim
    let b5 = cluster.produce(&b4.id(), 7);
    assert!(b5.qc.is_none());
    let a5 = cluster.vote(A, &b5.id()).unwrap();
    assert!(a5.strong);
    let b5_vote = cluster.vote(B, &b5.id()).unwrap();
    assert!(!b5_vote.strong);
    let c5 = cluster.vote(C, &b5.id()).unwrap();
    assert!(!c5.strong);
    cluster.deliver(&a5);
    cluster.deliver(&c5);
    cluster.deliver(&b4_vote); // B's b4 vote arrives one block late
    assert_eq!(cluster.lib(), b1.block_num());

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b5.id());
    assert_eq!(fsi.lock.unwrap().block_id, b2.id());
    assert_eq!(
        fsi.other_branch_latest_time,
        Some(b3.signed_header.header.timestamp)
    );

    // b6 carries the weak QC on b4; B starts voting strong again
    let b6 = cluster.produce(&b5.id(), 8);
    assert_weak_qc_on(&b6, &b4);
    let a6 = cluster.vote(A, &b6.id()).unwrap();
    assert!(a6.strong);
    let b6_vote = cluster.vote(B, &b6.id()).unwrap();
    assert!(b6_vote.strong, "liveness restored: B votes strong on b6");
    let c6 = cluster.vote(C, &b6.id()).unwrap();
    assert!(c6.strong);
    cluster.deliver(&a6);
    cluster.deliver(&c6);
    cluster.deliver(&b5_vote);
    assert_eq!(cluster.lib(), b1.block_num());

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b6.id());
    assert_eq!(fsi.lock.unwrap().block_id, b4.id());
    assert_eq!(fsi.other_branch_latest_time, None);

    // b7 carries the weak QC on b5
    let b7 = cluster.produce(&b6.id(), 9);
    assert_weak_qc_on(&b7, &b5);
    let a7 = cluster.vote(A, &b7.id()).unwrap();
    let b7_vote = cluster.vote(B, &b7.id()).unwrap();
    let c7 = cluster.vote(C, &b7.id()).unwrap();
    assert!(a7.strong && b7_vote.strong && c7.strong);
    cluster.deliver(&a7);
    cluster.deliver(&c7);
    cluster.deliver(&b6_vote);
    assert_eq!(cluster.lib(), b1.block_num());

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b7.id());
    assert_eq!(fsi.lock.unwrap().block_id, b5.id());
    assert_eq!(fsi.other_branch_latest_time, None);

    // with B's vote on b6 delivered, b6 has a strong QC; b8 carries it and
    // finalizes b4
    let b8 = cluster.produce(&b7.id(), 10);
    assert_strong_qc_on(&b8, &b6);
    let a8 = cluster.vote(A, &b8.id()).unwrap();
    let b8_vote = cluster.vote(B, &b8.id()).unwrap();
    let c8 = cluster.vote(C, &b8.id()).unwrap();
    assert!(a8.strong && b8_vote.strong && c8.strong);
    cluster.deliver(&a8);
    cluster.deliver(&c8);
    cluster.deliver(&b7_vote);
    assert_eq!(cluster.lib(), b4.block_num(), "b8 finalizes b4");

    let fsi = cluster.fsi(B);
    assert_eq!(fsi.last_vote.unwrap().block_id, b8.id());
    assert_eq!(fsi.lock.unwrap().block_id, b6.id());
    assert_eq!(fsi.other_branch_latest_time, None);
}

// ---------------------------------------------------------------------------
// Scenario 4: restart from a snapshot taken at b3, with no block log and no
// fork database. Incoming blocks whose QC claims reference ancestors of the
// snapshot block must still validate.
//
// b1 <- b2 <- b3 <- b4 <- b5 <- b6
// b2 claims strong on b1; b3 repeats; b4 claims strong on b2 (finalizes
// b1); b5 claims strong on b4 (finalizes b2); b6 claims strong on b5
// (finalizes b4).
// ---------------------------------------------------------------------------
#[test]
fn test_restart_from_snapshot_without_forkdb() {
    let mut cluster = Cluster::four();

    let b1 = cluster.produce_and_vote_all(&cluster.genesis.clone(), 1);

    // partition A: b2 and b3 receive only A's votes
    let b2 = cluster.produce(&b1.id(), 2);
    assert_strong_qc_on(&b2, &b1);
    let a2 = cluster.vote(A, &b2.id()).unwrap();
    cluster.deliver(&a2);

    let b3 = cluster.produce(&b2.id(), 3);
    assert!(b3.qc.is_none(), "no quorum on b2 yet, claim repeated");

    let snapshot = cluster.controller.take_snapshot(&b3.id()).unwrap();
    let snapshot_bytes = snapshot.to_bytes().unwrap();

    // partition lifted: the other finalizers receive b2 and vote on it
    for index in [B, C, D] {
        if let Some(vote) = cluster.vote(index, &b2.id()) {
            cluster.deliver(&vote);
        }
    }

    let b4 = cluster.produce(&b3.id(), 4);
    assert_strong_qc_on(&b4, &b2);
    assert_eq!(cluster.lib(), b1.block_num(), "b4 finalizes b1");
    cluster.vote_and_deliver(&[A, B, C, D], &b4.id());

    let b5 = cluster.produce(&b4.id(), 5);
    assert_strong_qc_on(&b5, &b4);
    assert_eq!(cluster.lib(), b2.block_num(), "b5 finalizes b2");
    cluster.vote_and_deliver(&[A, B, C, D], &b5.id());

    let b6 = cluster.produce(&b5.id(), 6);
    assert_strong_qc_on(&b6, &b5);
    assert_eq!(cluster.lib(), b4.block_num(), "b6 finalizes b4");

    // restart from the b3 snapshot: no block log, no fork database
    let snapshot = Snapshot::from_bytes(&snapshot_bytes).unwrap();
    let mut restarted =
        Controller::open_from_snapshot(&snapshot, ExistingState::default()).unwrap();
    assert_eq!(restarted.head().id, b3.id());

    // b4 advances the claim from b1 to b2, so it must carry the QC on b2;
    // the restarted node has never seen b2 but validates it from the
    // retained ancestor history
    restarted.apply_block(&b4).unwrap();
    restarted.apply_block(&b5).unwrap();
    restarted.apply_block(&b6).unwrap();
    assert_eq!(restarted.lib_number(), b4.block_num());
}

// ---------------------------------------------------------------------------
// A snapshot restore must refuse to start when a fork database survived
// without a block log.
// ---------------------------------------------------------------------------
#[test]
fn test_snapshot_with_forkdb_but_no_blocklog_rejected() {
    let mut cluster = Cluster::four();
    let b1 = cluster.produce_and_vote_all(&cluster.genesis.clone(), 1);
    let snapshot = cluster.controller.take_snapshot(&b1.id()).unwrap();

    let err = Controller::open_from_snapshot(
        &snapshot,
        ExistingState {
            has_fork_db: true,
            has_block_log: false,
        },
    )
    .unwrap_err();
    assert!(err
        .to_string()
        .contains("we shouldn't have a fork database either"));

    // with a block log present the same restore is fine
    Controller::open_from_snapshot(
        &snapshot,
        ExistingState {
            has_fork_db: true,
            has_block_log: true,
        },
    )
    .unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 5: finalizer policy rotation across a snapshot boundary. P2 is
// proposed at b1, becomes pending at b3 (b1 final) and active at b6 (b3
// final). A node restarted from a snapshot at b6 must still verify the QC
// on b5, whose voters belonged to P1 - neither active nor pending at b6.
// ---------------------------------------------------------------------------
#[test]
fn test_policy_rotation_across_snapshot() {
    // committee of four; a fifth key E replaces B in the new policy
    let mut cluster = Cluster::new(4, 5);
    const E: usize = 4;
    let everyone = [A, B, C, D, E];

    let p1_generation = cluster
        .state(&cluster.genesis.clone())
        .active_finalizer_policy
        .generation;

    // b1 proposes policy P2 (A, E, C, D)
    let new_policy = common::finalizer_policy(
        0, // generation assigned by the transition
        &[
            cluster.keys[A].clone(),
            cluster.keys[E].clone(),
            cluster.keys[C].clone(),
            cluster.keys[D].clone(),
        ],
    );
    let b1 = cluster.produce_with(
        &cluster.genesis.clone(),
        1,
        ProduceParams {
            new_finalizer_policy: Some(new_policy),
            ..Default::default()
        },
    );
    cluster.vote_and_deliver(&everyone, &b1.id());
    assert!(cluster.state(&b1.id()).pending_finalizer_policy.is_none());

    let b2 = cluster.produce(&b1.id(), 2);
    assert_strong_qc_on(&b2, &b1);
    cluster.vote_and_deliver(&everyone, &b2.id());

    // b3 finalizes b1, so P2 becomes pending
    let b3 = cluster.produce(&b2.id(), 3);
    assert_strong_qc_on(&b3, &b2);
    assert_eq!(cluster.lib(), b1.block_num());
    let b3_state = cluster.state(&b3.id());
    let pending = b3_state
        .pending_finalizer_policy
        .as_ref()
        .expect("P2 pending at b3");
    let p2_generation = pending.policy.generation;
    assert_eq!(p2_generation, p1_generation + 1);
    cluster.vote_and_deliver(&everyone, &b3.id());

    // the producer is partitioned off: b4 carries the QC on b3 but
    // receives no votes for now
    let b4 = cluster.produce(&b3.id(), 4);
    assert_strong_qc_on(&b4, &b3);
    assert_eq!(cluster.lib(), b2.block_num());
    assert!(cluster.state(&b4.id()).pending_finalizer_policy.is_some());

    // a QC over a block with a pending policy carries both signatures
    let qc_on_b3 = b4.qc.as_ref().unwrap();
    assert!(qc_on_b3.pending_policy_sig.is_some());

    // with no quorum on b4, b5 repeats the claim
    let b5 = cluster.produce(&b4.id(), 5);
    assert!(b5.qc.is_none());
    assert_eq!(cluster.lib(), b2.block_num());
    assert!(cluster.state(&b5.id()).pending_finalizer_policy.is_some());

    // partition lifted: everyone receives and votes on b4
    cluster.vote_and_deliver(&everyone, &b4.id());

    // b6 carries the strong QC on b4, finalizing b3; P2 (pending since b3)
    // activates
    let b6 = cluster.produce(&b5.id(), 6);
    assert_strong_qc_on(&b6, &b4);
    assert_eq!(cluster.lib(), b3.block_num());
    let b6_state = cluster.state(&b6.id());
    assert_eq!(b6_state.active_finalizer_policy.generation, p2_generation);
    assert!(b6_state.pending_finalizer_policy.is_none());
    // P1 is retained for ancestor QC verification
    assert!(b6_state.finalizer_policy_for(p1_generation).is_some());

    let snapshot = cluster.controller.take_snapshot(&b6.id()).unwrap();

    // votes on b5 arrive now, so b7 carries the QC on b5 - signed under P1
    // (active at b5) with a P2 pending signature
    cluster.vote_and_deliver(&everyone, &b5.id());
    let b7 = cluster.produce(&b6.id(), 7);
    assert_strong_qc_on(&b7, &b5);
    assert_eq!(cluster.lib(), b3.block_num());
    let qc_on_b5 = b7.qc.as_ref().unwrap();
    assert!(qc_on_b5.pending_policy_sig.is_some());

    // votes on b6 and b7 aggregate under the now-active P2
    cluster.vote_and_deliver(&everyone, &b6.id());
    let b8 = cluster.produce(&b7.id(), 8);
    assert_strong_qc_on(&b8, &b6);
    assert_eq!(cluster.lib(), b4.block_num(), "b8 finalizes b4");
    assert!(b8.qc.as_ref().unwrap().pending_policy_sig.is_none());

    cluster.vote_and_deliver(&everyone, &b7.id());
    cluster.vote_and_deliver(&everyone, &b8.id());
    let b9 = cluster.produce(&b8.id(), 9);
    assert_strong_qc_on(&b9, &b8);
    assert_eq!(cluster.lib(), b6.block_num(), "b9 finalizes b6");

    // restart from the b6 snapshot and replay b7..b9: the QC on b5 is
    // signed under P1, which must have been retained in the snapshot even
    // though it was neither active nor pending at b6
    let mut restarted =
        Controller::open_from_snapshot(&snapshot, ExistingState::default()).unwrap();
    restarted.apply_block(&b7).unwrap();
    restarted.apply_block(&b8).unwrap();
    restarted.apply_block(&b9).unwrap();
    assert_eq!(restarted.lib_number(), b6.block_num());
}
