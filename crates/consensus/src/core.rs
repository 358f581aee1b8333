//! The finality safety state machine.
//!
//! [`FinalityCore`] is the per-block finality record: the most recent
//! ancestor with a quorum certificate, the block that a strong QC would
//! make final, and the last irreversible block. All three are monotone
//! non-decreasing along any branch, and
//! `last_final <= final_on_strong_qc <= last_qc` whenever the optional
//! fields are present.
//!
//! Advancement follows the two-chain rule: a *strong* QC claimed on block
//! `N` makes final the block that `N` itself claimed a QC on, whether `N`'s
//! own claim was strong or weak. A *weak* claim records the QC without
//! advancing finality and clears `final_on_strong_qc_block_num` until a
//! strong QC forms again.

use fincore_types::{BlockNum, QcClaim};
use serde::{Deserialize, Serialize};

/// Errors from advancing the finality core.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FinalityCoreError {
    /// The incoming claim references an older block than the parent's claim
    #[error("qc claim on block {incoming} regresses behind parent claim on block {parent}")]
    ClaimRegression { incoming: BlockNum, parent: BlockNum },
}

/// Per-block finality state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityCore {
    /// Most recent ancestor with a QC, if any claim has been made yet
    pub last_qc_block_num: Option<BlockNum>,
    /// Block that becomes final once a strong QC forms on the claim target;
    /// cleared by weak claims
    pub final_on_strong_qc_block_num: Option<BlockNum>,
    /// Last irreversible block
    pub last_final_block_num: BlockNum,
}

impl FinalityCore {
    /// The core of a chain root: a weak self-claim, already final.
    pub fn genesis(block_num: BlockNum) -> Self {
        Self {
            last_qc_block_num: Some(block_num),
            final_on_strong_qc_block_num: None,
            last_final_block_num: block_num,
        }
    }

    /// The compact claim this core most recently recorded.
    ///
    /// The claim is strong exactly when `final_on_strong_qc_block_num`
    /// tracks `last_qc_block_num`; weak claims clear it.
    pub fn latest_qc_claim(&self) -> QcClaim {
        let block_num = self.last_qc_block_num.unwrap_or(self.last_final_block_num);
        QcClaim {
            block_num,
            is_strong_qc: self.final_on_strong_qc_block_num == Some(block_num)
                && self.last_qc_block_num.is_some(),
        }
    }

    /// Advance the core with the claim carried by a child block.
    ///
    /// `claimed_block_claim_num` is the block number that the *claimed*
    /// block's own latest QC claim references; the caller reads it from the
    /// ancestor reference history. It is only consulted for strong claims.
    ///
    /// A claim repeating the parent's `last_qc_block_num` leaves the core
    /// unchanged. A claim on an older block is a hard validation failure.
    pub fn next(
        &self,
        claim: QcClaim,
        claimed_block_claim_num: BlockNum,
    ) -> Result<FinalityCore, FinalityCoreError> {
        // no state change when the claim is repeated
        if Some(claim.block_num) == self.last_qc_block_num {
            return Ok(*self);
        }

        if let Some(parent_claim_num) = self.last_qc_block_num {
            if claim.block_num < parent_claim_num {
                return Err(FinalityCoreError::ClaimRegression {
                    incoming: claim.block_num,
                    parent: parent_claim_num,
                });
            }
        }

        let mut next = *self;
        if claim.is_strong_qc {
            // two-chain: the strong QC on the claimed block finalizes that
            // block's own claim target
            next.last_final_block_num = self.last_final_block_num.max(claimed_block_claim_num);
            next.final_on_strong_qc_block_num = Some(claim.block_num);
        } else {
            next.final_on_strong_qc_block_num = None;
        }
        next.last_qc_block_num = Some(claim.block_num);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong(block_num: BlockNum) -> QcClaim {
        QcClaim {
            block_num,
            is_strong_qc: true,
        }
    }

    fn weak(block_num: BlockNum) -> QcClaim {
        QcClaim {
            block_num,
            is_strong_qc: false,
        }
    }

    #[test]
    fn test_genesis_claim_is_weak_self_claim() {
        let core = FinalityCore::genesis(1);
        assert_eq!(core.latest_qc_claim(), weak(1));
        assert_eq!(core.last_final_block_num, 1);
    }

    #[test]
    fn test_repeated_claim_is_identity() {
        let core = FinalityCore::genesis(1);
        let next = core.next(weak(1), 1).unwrap();
        assert_eq!(next, core);
        // strength of a repeated claim is ignored
        let next = core.next(strong(1), 1).unwrap();
        assert_eq!(next, core);
    }

    #[test]
    fn test_regressing_claim_rejected() {
        let core = FinalityCore::genesis(1);
        let advanced = core.next(strong(3), 1).unwrap();
        assert_eq!(
            advanced.next(strong(2), 1),
            Err(FinalityCoreError::ClaimRegression {
                incoming: 2,
                parent: 3
            })
        );
    }

    #[test]
    fn test_strong_claim_advances_two_chain() {
        // block 5 claimed a QC on block 4; a strong QC on block 5 makes
        // block 4 final
        let core = FinalityCore {
            last_qc_block_num: Some(4),
            final_on_strong_qc_block_num: Some(4),
            last_final_block_num: 2,
        };
        let next = core.next(strong(5), 4).unwrap();
        assert_eq!(next.last_final_block_num, 4);
        assert_eq!(next.final_on_strong_qc_block_num, Some(5));
        assert_eq!(next.last_qc_block_num, Some(5));
        assert_eq!(next.latest_qc_claim(), strong(5));
    }

    #[test]
    fn test_weak_claim_preserves_finality() {
        let core = FinalityCore {
            last_qc_block_num: Some(3),
            final_on_strong_qc_block_num: Some(3),
            last_final_block_num: 1,
        };
        let next = core.next(weak(4), 3).unwrap();
        assert_eq!(next.last_final_block_num, 1);
        assert_eq!(next.final_on_strong_qc_block_num, None);
        assert_eq!(next.last_qc_block_num, Some(4));
        assert_eq!(next.latest_qc_claim(), weak(4));
    }

    #[test]
    fn test_strong_after_weak_recovers() {
        // weak claim on 4, then strong claim on 5 whose target was 4
        let core = FinalityCore {
            last_qc_block_num: Some(3),
            final_on_strong_qc_block_num: Some(3),
            last_final_block_num: 1,
        };
        let weak_step = core.next(weak(4), 3).unwrap();
        let strong_step = weak_step.next(strong(5), 4).unwrap();
        assert_eq!(strong_step.last_final_block_num, 4);
        assert_eq!(strong_step.final_on_strong_qc_block_num, Some(5));
    }

    #[test]
    fn test_monotonicity_along_chain() {
        let mut core = FinalityCore::genesis(1);
        let mut prev = core;
        // alternating strong and weak claims, targets trailing by one
        for (claim, target) in [
            (strong(2), 1),
            (weak(3), 2),
            (strong(4), 3),
            (strong(5), 4),
            (weak(6), 5),
        ] {
            core = core.next(claim, target).unwrap();
            assert!(core.last_final_block_num >= prev.last_final_block_num);
            assert!(core.last_qc_block_num >= prev.last_qc_block_num);
            let fos = core
                .final_on_strong_qc_block_num
                .unwrap_or(core.last_final_block_num);
            assert!(core.last_final_block_num <= fos);
            assert!(fos <= core.last_qc_block_num.unwrap());
            prev = core;
        }
    }
}
