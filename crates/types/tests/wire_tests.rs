//! Round-trip tests for the canonical wire codec.

use fincore_crypto::bls::BlsPrivateKey;
use fincore_types::{
    AccountName, BlockTimestamp, FinalizerAuthority, FinalizerPolicy, ProposerAuthority,
    ProposerPolicy, Qc, QcClaim, QcSig, VoteBitset, VoteMessage, WireDecode, WireEncode,
};
use fincore_types::{BlockId, Digest};

fn round_trip<T: WireEncode + WireDecode + PartialEq + std::fmt::Debug>(value: &T) {
    let bytes = value.to_wire_bytes();
    let decoded = T::from_wire_bytes(&bytes).unwrap();
    assert_eq!(&decoded, value);
    // re-encoding must be byte-identical
    assert_eq!(decoded.to_wire_bytes(), bytes);
}

fn test_policy(generation: u32, n: usize) -> FinalizerPolicy {
    FinalizerPolicy {
        generation,
        threshold: (n as u64 * 2) / 3 + 1,
        finalizers: (0..n)
            .map(|i| FinalizerAuthority {
                description: format!("finalizer{i}"),
                weight: 1,
                public_key: BlsPrivateKey::from_seed(&[i as u8 + 1; 32])
                    .unwrap()
                    .public_key(),
            })
            .collect(),
    }
}

#[test]
fn test_timestamp_round_trip() {
    round_trip(&BlockTimestamp::new(123_456));
}

#[test]
fn test_account_name_round_trip() {
    for name in ["", "alice", "prod.one", "zzzzzzzzzzz"] {
        let parsed: AccountName = name.parse().unwrap();
        round_trip(&parsed);
        assert_eq!(parsed.to_wire_bytes().len(), 7);
    }
}

#[test]
fn test_finalizer_policy_round_trip() {
    let policy = test_policy(3, 4);
    policy.validate().unwrap();
    round_trip(&policy);
}

#[test]
fn test_proposer_policy_round_trip() {
    let policy = ProposerPolicy {
        version: 2,
        active_time: BlockTimestamp::new(99),
        proposer_schedule: vec![
            ProposerAuthority {
                producer_name: "alpha".parse().unwrap(),
                block_signing_authority: vec![1, 2, 3],
            },
            ProposerAuthority {
                producer_name: "beta".parse().unwrap(),
                block_signing_authority: Vec::new(),
            },
        ],
    };
    round_trip(&policy);
}

#[test]
fn test_qc_round_trip() {
    let key = BlsPrivateKey::from_seed(&[9u8; 32]).unwrap();
    let digest = Digest::hash(b"block");

    let mut strong = VoteBitset::new(4);
    strong.set(0);
    strong.set(2);
    let mut weak = VoteBitset::new(4);
    weak.set(1);

    let qc = Qc {
        block_num: 7,
        active_policy_sig: QcSig {
            strong_votes: Some(strong),
            weak_votes: Some(weak),
            sig: key.sign(digest.as_bytes()),
        },
        pending_policy_sig: Some(QcSig {
            strong_votes: Some(VoteBitset::new(4)),
            weak_votes: None,
            sig: key.sign(digest.as_bytes()),
        }),
    };
    round_trip(&qc);

    // strength classification
    assert!(qc.is_weak());
    assert_eq!(
        qc.to_claim(),
        QcClaim {
            block_num: 7,
            is_strong_qc: false
        }
    );
}

#[test]
fn test_qc_claim_round_trip() {
    round_trip(&QcClaim {
        block_num: 41,
        is_strong_qc: true,
    });
}

#[test]
fn test_vote_message_round_trip() {
    let key = BlsPrivateKey::from_seed(&[5u8; 32]).unwrap();
    let id = BlockId::from_digest(Digest::hash(b"b"), 3);
    let vote = VoteMessage::new(id, true, &key);
    round_trip(&vote);
    assert!(vote.verify());
}

#[test]
fn test_truncated_input_rejected() {
    let policy = test_policy(1, 4);
    let bytes = policy.to_wire_bytes();
    for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
        assert!(FinalizerPolicy::from_wire_bytes(&bytes[..cut]).is_err());
    }
}

#[test]
fn test_trailing_bytes_rejected() {
    let claim = QcClaim {
        block_num: 1,
        is_strong_qc: false,
    };
    let mut bytes = claim.to_wire_bytes();
    bytes.push(0);
    assert!(QcClaim::from_wire_bytes(&bytes).is_err());
}
