//! Incremental, thread-safe vote aggregation.
//!
//! An [`OpenQcSig`] mirrors one finalizer policy and folds arriving votes
//! into running strong and weak aggregates. It is "open" in that votes may
//! be added at any time, from any thread: net workers call
//! [`OpenQc::aggregate_vote`] while the main domain seals the best
//! available certificate with [`OpenQc::get_best_qc`].
//!
//! The aggregation state machine:
//!
//! | State | Meaning |
//! |---|---|
//! | `Unrestricted` | any outcome still reachable |
//! | `Restricted` | too much weak weight for a strong QC, no weak QC yet |
//! | `WeakAchieved` | weak quorum met, strong still possible |
//! | `WeakFinal` | weak quorum met, strong impossible |
//! | `Strong` | strong quorum met; terminal |
//!
//! `state()` never regresses: once a quorum state is reached it is stable.

use fincore_crypto::{BlsAggregateSignature, BlsPublicKey, Digest, WeakDigest};
use fincore_types::{FinalizerPolicy, Qc, QcError, QcSig, VoteBitset, VoteMessage};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-vote processing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    /// Vote accepted and aggregated
    Success,
    /// This finalizer already voted on this block; expected when votes
    /// arrive over multiple connections
    Duplicate,
    /// The key is not a member of any policy mirrored by the aggregator
    UnknownPublicKey,
    /// The BLS signature does not verify
    InvalidSignature,
    /// The voted block is not known, possibly below LIB or far ahead
    UnknownBlock,
    /// The connection exceeded its vote allowance
    MaxExceeded,
}

/// Aggregation state; see the module docs for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QcState {
    Unrestricted,
    Restricted,
    WeakAchieved,
    WeakFinal,
    Strong,
}

impl QcState {
    /// Whether this state corresponds to a usable quorum.
    pub fn is_quorum_met(self) -> bool {
        matches!(self, QcState::WeakAchieved | QcState::WeakFinal | QcState::Strong)
    }
}

/// One side (strong or weak) of the running aggregation.
#[derive(Debug)]
struct Votes {
    bitset: VoteBitset,
    sig: BlsAggregateSignature,
}

impl Votes {
    fn new(num_finalizers: usize) -> Self {
        Self {
            bitset: VoteBitset::new(num_finalizers),
            sig: BlsAggregateSignature::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: QcState,
    strong_sum: u64,
    weak_sum: u64,
    strong_votes: Votes,
    weak_votes: Votes,
    /// Best QC received from the network inside a block extension
    received_qc_sig: Option<QcSig>,
}

/// Thread-safe incremental aggregation for one finalizer policy.
pub struct OpenQcSig {
    quorum: u64,
    max_weak_sum_before_weak_final: u64,
    num_finalizers: usize,
    /// Lock-free duplicate short-circuit, one flag per finalizer index per
    /// vote kind. An optimization only; the bitset under the mutex is the
    /// source of truth.
    processed_strong: Vec<AtomicBool>,
    processed_weak: Vec<AtomicBool>,
    inner: Mutex<Inner>,
}

impl OpenQcSig {
    /// Create an aggregator sized for a policy.
    pub fn new(num_finalizers: usize, quorum: u64, max_weak_sum_before_weak_final: u64) -> Self {
        Self {
            quorum,
            max_weak_sum_before_weak_final,
            num_finalizers,
            processed_strong: (0..num_finalizers).map(|_| AtomicBool::new(false)).collect(),
            processed_weak: (0..num_finalizers).map(|_| AtomicBool::new(false)).collect(),
            inner: Mutex::new(Inner {
                state: QcState::Unrestricted,
                strong_sum: 0,
                weak_sum: 0,
                strong_votes: Votes::new(num_finalizers),
                weak_votes: Votes::new(num_finalizers),
                received_qc_sig: None,
            }),
        }
    }

    /// Create an aggregator mirroring `policy`.
    pub fn for_policy(policy: &FinalizerPolicy) -> Self {
        Self::new(
            policy.num_finalizers(),
            policy.threshold,
            policy.max_weak_sum_before_weak_final(),
        )
    }

    /// Current aggregation state.
    pub fn state(&self) -> QcState {
        self.inner.lock().state
    }

    /// Whether a weak or strong quorum has been reached.
    pub fn is_quorum_met(&self) -> bool {
        self.state().is_quorum_met()
    }

    /// Whether the finalizer at `index` has a recorded vote of the given kind.
    pub fn has_voted(&self, strong: bool, index: usize) -> bool {
        if index >= self.num_finalizers {
            return false;
        }
        let flags = if strong {
            &self.processed_strong
        } else {
            &self.processed_weak
        };
        flags[index].load(Ordering::Acquire)
    }

    /// Whether the finalizer at `index` voted at all.
    pub fn has_voted_any(&self, index: usize) -> bool {
        self.has_voted(true, index) || self.has_voted(false, index)
    }

    /// Fold one verified vote into the aggregate.
    ///
    /// The caller must have verified the BLS signature already; this method
    /// only updates the bitsets, sums, aggregates, and state.
    pub fn add_vote(
        &self,
        strong: bool,
        index: usize,
        sig: &fincore_crypto::BlsSignature,
        weight: u64,
    ) -> VoteStatus {
        if index >= self.num_finalizers {
            return VoteStatus::UnknownPublicKey;
        }

        // fast, lock-free duplicate check
        let flags = if strong {
            &self.processed_strong
        } else {
            &self.processed_weak
        };
        if flags[index].load(Ordering::Acquire) {
            return VoteStatus::Duplicate;
        }

        let mut inner = self.inner.lock();
        let votes = if strong {
            &mut inner.strong_votes
        } else {
            &mut inner.weak_votes
        };
        if votes.bitset.get(index) {
            return VoteStatus::Duplicate;
        }
        votes.bitset.set(index);
        if votes.sig.add(sig).is_err() {
            // aggregation of a canonical signature cannot fail; treat
            // defensively as an invalid vote without poisoning the bitset
            warn!(index, "failed to aggregate vote signature");
            return VoteStatus::InvalidSignature;
        }
        flags[index].store(true, Ordering::Release);

        let old_state = inner.state;
        if strong {
            inner.strong_sum += weight;
            self.transition_on_strong(&mut inner);
        } else {
            inner.weak_sum += weight;
            self.transition_on_weak(&mut inner);
        }
        if inner.state != old_state {
            debug!(?old_state, new_state = ?inner.state, "aggregation state advanced");
        }
        VoteStatus::Success
    }

    fn transition_on_strong(&self, inner: &mut Inner) {
        match inner.state {
            QcState::Unrestricted | QcState::Restricted => {
                let quorum_met = inner.strong_sum + inner.weak_sum >= self.quorum;
                if inner.strong_sum >= self.quorum {
                    inner.state = QcState::Strong;
                } else if quorum_met {
                    inner.state = if inner.state == QcState::Restricted {
                        QcState::WeakFinal
                    } else {
                        QcState::WeakAchieved
                    };
                }
            }
            QcState::WeakAchieved => {
                if inner.strong_sum >= self.quorum {
                    inner.state = QcState::Strong;
                }
            }
            QcState::WeakFinal | QcState::Strong => {}
        }
    }

    fn transition_on_weak(&self, inner: &mut Inner) {
        match inner.state {
            QcState::Unrestricted => {
                let quorum_met = inner.strong_sum + inner.weak_sum >= self.quorum;
                let strong_impossible = inner.weak_sum > self.max_weak_sum_before_weak_final;
                inner.state = match (quorum_met, strong_impossible) {
                    (true, true) => QcState::WeakFinal,
                    (true, false) => QcState::WeakAchieved,
                    (false, true) => QcState::Restricted,
                    (false, false) => QcState::Unrestricted,
                };
            }
            QcState::Restricted => {
                if inner.strong_sum + inner.weak_sum >= self.quorum {
                    inner.state = QcState::WeakFinal;
                }
            }
            QcState::WeakAchieved => {
                if inner.weak_sum > self.max_weak_sum_before_weak_final {
                    inner.state = QcState::WeakFinal;
                }
            }
            QcState::WeakFinal | QcState::Strong => {}
        }
    }

    /// Record a sealed QC received from the network.
    pub fn set_received_qc_sig(&self, qc: QcSig) {
        self.inner.lock().received_qc_sig = Some(qc);
    }

    /// Whether a received QC exists and is strong.
    pub fn received_qc_sig_is_strong(&self) -> bool {
        self.inner
            .lock()
            .received_qc_sig
            .as_ref()
            .is_some_and(|qc| qc.is_strong())
    }

    /// The best sealed signature available.
    ///
    /// Strong-over-weak preference is strict: a known strong QC is never
    /// downgraded. Order of preference: a received strong QC, then a locally
    /// aggregated quorum, then any received (weak) QC, then none.
    pub fn get_best_qc(&self) -> Option<QcSig> {
        let inner = self.inner.lock();
        if inner
            .received_qc_sig
            .as_ref()
            .is_some_and(|qc| qc.is_strong())
        {
            return inner.received_qc_sig.clone();
        }
        if inner.state.is_quorum_met() {
            if let Some(valid) = Self::to_valid_qc_sig(&inner) {
                return Some(valid);
            }
        }
        inner.received_qc_sig.clone()
    }

    /// Seal the accumulated bitsets and aggregate into a `QcSig`.
    fn to_valid_qc_sig(inner: &Inner) -> Option<QcSig> {
        if inner.state == QcState::Strong {
            // the strong votes alone form a strong QC; weak votes are left out
            return Some(QcSig {
                strong_votes: Some(inner.strong_votes.bitset.clone()),
                weak_votes: None,
                sig: inner.strong_votes.sig.to_signature().ok()?,
            });
        }
        let strong_any = inner.strong_votes.bitset.any();
        let weak_any = inner.weak_votes.bitset.any();
        let sig = match (strong_any, weak_any) {
            (true, true) => {
                let mut merged = inner.strong_votes.sig.clone();
                merged.add(&inner.weak_votes.sig.to_signature().ok()?).ok()?;
                merged.to_signature().ok()?
            }
            (true, false) => inner.strong_votes.sig.to_signature().ok()?,
            (false, true) => inner.weak_votes.sig.to_signature().ok()?,
            (false, false) => return None,
        };
        Some(QcSig {
            strong_votes: strong_any.then(|| inner.strong_votes.bitset.clone()),
            weak_votes: weak_any.then(|| inner.weak_votes.bitset.clone()),
            sig,
        })
    }
}

impl std::fmt::Debug for OpenQcSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OpenQcSig")
            .field("state", &inner.state)
            .field("strong_sum", &inner.strong_sum)
            .field("weak_sum", &inner.weak_sum)
            .field("quorum", &self.quorum)
            .finish()
    }
}

/// Whether a finalizer key has voted, or is irrelevant to this aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasVoteStatus {
    Voted,
    NotVoted,
    IrrelevantFinalizer,
}

/// Classification of a QC's voters for operational telemetry.
#[derive(Debug, Clone, Default)]
pub struct QcVoteMetrics {
    pub strong_voted: BTreeSet<BlsPublicKey>,
    pub weak_voted: BTreeSet<BlsPublicKey>,
    pub missing: BTreeSet<BlsPublicKey>,
}

/// Dual-policy aggregation: one [`OpenQcSig`] for the active policy and,
/// during committee rotation, another for the pending policy.
///
/// All public methods are thread-safe; the policies are fixed at
/// construction.
pub struct OpenQc {
    active_policy: Arc<FinalizerPolicy>,
    pending_policy: Option<Arc<FinalizerPolicy>>,
    active_sig: OpenQcSig,
    pending_sig: Option<OpenQcSig>,
}

impl OpenQc {
    /// Create the aggregators for a block's active and pending policies.
    pub fn new(
        active_policy: Arc<FinalizerPolicy>,
        pending_policy: Option<Arc<FinalizerPolicy>>,
    ) -> Self {
        let active_sig = OpenQcSig::for_policy(&active_policy);
        let pending_sig = pending_policy.as_deref().map(OpenQcSig::for_policy);
        Self {
            active_policy,
            pending_policy,
            active_sig,
            pending_sig,
        }
    }

    /// The active-policy aggregator.
    pub fn active_sig(&self) -> &OpenQcSig {
        &self.active_sig
    }

    /// Verify and fold one vote, dispatching to every policy the voter
    /// belongs to (active, pending, both, or neither).
    pub fn aggregate_vote(&self, vote: &VoteMessage) -> VoteStatus {
        let active_index = self.active_policy.finalizer_index(&vote.finalizer_key);
        let pending_index = self
            .pending_policy
            .as_ref()
            .and_then(|p| p.finalizer_index(&vote.finalizer_key));
        if active_index.is_none() && pending_index.is_none() {
            return VoteStatus::UnknownPublicKey;
        }

        if !vote.verify() {
            warn!(block_id = %vote.block_id, "invalid vote signature");
            return VoteStatus::InvalidSignature;
        }

        let mut status = VoteStatus::Success;
        if let Some(index) = active_index {
            let weight = self.active_policy.finalizers[index].weight;
            status = self.active_sig.add_vote(vote.strong, index, &vote.sig, weight);
        }
        if status == VoteStatus::Success || active_index.is_none() {
            if let (Some(index), Some(pending_sig), Some(pending_policy)) = (
                pending_index,
                self.pending_sig.as_ref(),
                self.pending_policy.as_ref(),
            ) {
                let weight = pending_policy.finalizers[index].weight;
                status = pending_sig.add_vote(vote.strong, index, &vote.sig, weight);
            }
        }
        status
    }

    /// Quorum requires the active side and, when present, the pending side.
    pub fn is_quorum_met(&self) -> bool {
        self.active_sig.is_quorum_met()
            && self.pending_sig.as_ref().is_none_or(|s| s.is_quorum_met())
    }

    /// Seal the best certificate for `block_num`.
    ///
    /// Returns a QC only when the active side can produce a signature and,
    /// when a pending policy exists, the pending side can as well.
    pub fn get_best_qc(&self, block_num: u32) -> Option<Qc> {
        let active = self.active_sig.get_best_qc()?;
        let pending = match &self.pending_sig {
            Some(sig) => Some(sig.get_best_qc()?),
            None => None,
        };
        Some(Qc {
            block_num,
            active_policy_sig: active,
            pending_policy_sig: pending,
        })
    }

    /// Record a QC received inside a block extension.
    pub fn set_received_qc(&self, qc: &Qc) {
        self.active_sig.set_received_qc_sig(qc.active_policy_sig.clone());
        if let (Some(pending_sig), Some(received)) =
            (&self.pending_sig, &qc.pending_policy_sig)
        {
            pending_sig.set_received_qc_sig(received.clone());
        }
    }

    /// Whether a received QC exists and is strong on every present side.
    pub fn received_qc_is_strong(&self) -> bool {
        self.active_sig.received_qc_sig_is_strong()
            && self
                .pending_sig
                .as_ref()
                .is_none_or(|s| s.received_qc_sig_is_strong())
    }

    /// Verify a sealed QC against both policies and the block's digests.
    pub fn verify_qc(
        &self,
        qc: &Qc,
        strong_digest: &Digest,
        weak_digest: &WeakDigest,
    ) -> Result<(), QcError> {
        qc.active_policy_sig
            .verify(&self.active_policy, strong_digest, weak_digest)?;
        match (&self.pending_policy, &qc.pending_policy_sig) {
            (Some(policy), Some(sig)) => sig.verify(policy, strong_digest, weak_digest),
            (None, None) => Ok(()),
            (Some(_), None) => Err(QcError::PendingPolicyMismatch(
                "pending policy exists but QC has no pending signature",
            )),
            (None, Some(_)) => Err(QcError::PendingPolicyMismatch(
                "QC has a pending signature but no pending policy exists",
            )),
        }
    }

    /// Classify finalizers of the active (and pending) policy into strong,
    /// weak, and missing voters for a sealed QC.
    pub fn vote_metrics(&self, qc: &Qc) -> QcVoteMetrics {
        let mut metrics = QcVoteMetrics::default();
        let mut classify = |policy: &FinalizerPolicy, sig: &QcSig| {
            for (index, authority) in policy.finalizers.iter().enumerate() {
                if sig.strong_votes.as_ref().is_some_and(|b| b.get(index)) {
                    metrics.strong_voted.insert(authority.public_key.clone());
                } else if sig.weak_votes.as_ref().is_some_and(|b| b.get(index)) {
                    metrics.weak_voted.insert(authority.public_key.clone());
                } else {
                    metrics.missing.insert(authority.public_key.clone());
                }
            }
        };
        classify(&self.active_policy, &qc.active_policy_sig);
        if let (Some(policy), Some(sig)) = (&self.pending_policy, &qc.pending_policy_sig) {
            classify(policy, sig);
        }
        metrics
    }

    /// The finalizers that are missing from a sealed QC.
    pub fn missing_votes(&self, qc: &Qc) -> BTreeSet<BlsPublicKey> {
        self.vote_metrics(qc).missing
    }

    /// Whether the given key has voted on this block.
    pub fn has_voted(&self, key: &BlsPublicKey) -> HasVoteStatus {
        let active_index = self.active_policy.finalizer_index(key);
        let pending_index = self
            .pending_policy
            .as_ref()
            .and_then(|p| p.finalizer_index(key));
        match (active_index, pending_index) {
            (None, None) => HasVoteStatus::IrrelevantFinalizer,
            (Some(index), _) => {
                if self.active_sig.has_voted_any(index) {
                    HasVoteStatus::Voted
                } else {
                    HasVoteStatus::NotVoted
                }
            }
            (None, Some(index)) => {
                let voted = self
                    .pending_sig
                    .as_ref()
                    .is_some_and(|s| s.has_voted_any(index));
                if voted {
                    HasVoteStatus::Voted
                } else {
                    HasVoteStatus::NotVoted
                }
            }
        }
    }
}

impl std::fmt::Debug for OpenQc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenQc")
            .field("active_generation", &self.active_policy.generation)
            .field(
                "pending_generation",
                &self.pending_policy.as_ref().map(|p| p.generation),
            )
            .field("active_sig", &self.active_sig)
            .finish()
    }
}
