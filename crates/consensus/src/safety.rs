//! Finalizer safety: the fork-lock voting rule and its persistent record.
//!
//! Each finalizer key maintains a [`FinalizerSafetyInfo`] record - its last
//! vote, its lock, and the latest timestamp it voted for on another branch.
//! The record decides whether a proposal gets a strong vote, a weak vote,
//! or none:
//!
//! - a vote requires **monotony** (the proposal's timestamp is beyond the
//!   last vote's) and either **liveness** (the proposal's latest QC block
//!   is beyond the lock) or **safety** (the proposal extends the lock);
//! - the lock advances to the proposal's claim target whenever that
//!   target's timestamp is beyond the current lock;
//! - the vote is **strong** when the proposal extends the last vote and any
//!   recorded other-branch time is older than the proposal's latest QC
//!   block, which also clears the record; otherwise the vote is **weak**,
//!   and switching branches records the abandoned branch's latest time.
//!
//! These rules are consensus-critical: every fsi transition must be
//! bit-identical across nodes. Records are persisted to disk before the
//! vote leaves the process, so a restarted finalizer can never equivocate.

use crate::block_state::BlockHeaderState;
use fincore_crypto::bls::BlsPrivateKey;
use fincore_crypto::BlsPublicKey;
use fincore_types::{BlockId, BlockTimestamp, VoteMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes identifying a finalizer safety file.
const FSI_MAGIC: [u8; 4] = *b"FFSI";

/// Current safety file format version.
const FSI_VERSION: u8 = 1;

/// Errors from safety-file persistence.
#[derive(Debug, thiserror::Error)]
pub enum SafetyFileError {
    /// I/O error reading or writing the safety file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic bytes
    #[error("invalid safety file magic")]
    InvalidMagic,

    /// Unsupported version
    #[error("unsupported safety file version: {0}")]
    UnsupportedVersion(u8),

    /// Corrupted entry
    #[error("corrupted safety file entry at offset {offset}: {message}")]
    Corrupted { offset: usize, message: String },
}

/// A block referenced by a safety record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRef {
    pub block_id: BlockId,
    pub timestamp: BlockTimestamp,
}

impl VoteRef {
    fn for_state(state: &BlockHeaderState) -> Self {
        Self {
            block_id: state.id,
            timestamp: state.timestamp(),
        }
    }
}

/// Persistent per-key safety state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FinalizerSafetyInfo {
    /// The block this key last voted on
    pub last_vote: Option<VoteRef>,
    /// The block this key is locked on
    pub lock: Option<VoteRef>,
    /// Latest timestamp voted for on a branch this key has since left
    pub other_branch_latest_time: Option<BlockTimestamp>,
}

/// The vote a finalizer decides to cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDecision {
    Strong,
    Weak,
    NoVote,
}

/// One finalizer key with its safety record.
pub struct Finalizer {
    key: BlsPrivateKey,
    fsi: FinalizerSafetyInfo,
}

impl Finalizer {
    /// Create a finalizer with an empty record. Without a lock it cannot
    /// vote; use [`Finalizer::with_lock`] to seed from a trusted root.
    pub fn new(key: BlsPrivateKey) -> Self {
        Self {
            key,
            fsi: FinalizerSafetyInfo::default(),
        }
    }

    /// Create a finalizer locked on a trusted root block.
    pub fn with_lock(key: BlsPrivateKey, root: &BlockHeaderState) -> Self {
        Self {
            key,
            fsi: FinalizerSafetyInfo {
                last_vote: None,
                lock: Some(VoteRef::for_state(root)),
                other_branch_latest_time: None,
            },
        }
    }

    /// Restore a finalizer from a persisted record.
    pub fn from_parts(key: BlsPrivateKey, fsi: FinalizerSafetyInfo) -> Self {
        Self { key, fsi }
    }

    /// This finalizer's public key.
    pub fn public_key(&self) -> BlsPublicKey {
        self.key.public_key()
    }

    /// The current safety record.
    pub fn safety_info(&self) -> &FinalizerSafetyInfo {
        &self.fsi
    }

    /// Apply the voting rule to a proposal, updating the record.
    pub fn decide_vote(&mut self, proposal: &BlockHeaderState) -> VoteDecision {
        let monotony = self
            .fsi
            .last_vote
            .is_none_or(|last| proposal.timestamp() > last.timestamp);

        let latest_qc_timestamp = proposal.latest_qc_block_timestamp();
        let (liveness, safety) = match &self.fsi.lock {
            Some(lock) => {
                let liveness = latest_qc_timestamp.is_some_and(|t| t > lock.timestamp);
                let safety = !liveness && proposal.extends(&lock.block_id);
                (liveness, safety)
            }
            // without a lock neither check can pass
            None => (false, false),
        };

        if !(monotony && (liveness || safety)) {
            debug!(
                block = %proposal.id,
                monotony,
                liveness,
                safety,
                "not voting"
            );
            return VoteDecision::NoVote;
        }

        // advance the lock to the proposal's claim target when it is newer
        let claim_num = proposal.latest_qc_claim().block_num;
        if let Some(claim_ref) = proposal.get_block_ref(claim_num) {
            let newer = self
                .fsi
                .lock
                .is_none_or(|lock| lock.timestamp < claim_ref.timestamp);
            if newer {
                self.fsi.lock = Some(VoteRef {
                    block_id: claim_ref.id,
                    timestamp: claim_ref.timestamp,
                });
            }
        }

        let extends_last_vote = self
            .fsi
            .last_vote
            .is_none_or(|last| proposal.extends(&last.block_id));

        let decision = if extends_last_vote {
            match self.fsi.other_branch_latest_time {
                Some(other_time) => {
                    if latest_qc_timestamp.is_some_and(|t| t > other_time) {
                        // the new branch has caught up past the abandoned one
                        self.fsi.other_branch_latest_time = None;
                        VoteDecision::Strong
                    } else {
                        VoteDecision::Weak
                    }
                }
                None => VoteDecision::Strong,
            }
        } else {
            // switching branches: remember how far the old one had gotten
            self.fsi.other_branch_latest_time = self.fsi.last_vote.map(|last| last.timestamp);
            VoteDecision::Weak
        };

        self.fsi.last_vote = Some(VoteRef::for_state(proposal));
        decision
    }

    /// Decide and, if voting, produce the signed vote message.
    pub fn vote(&mut self, proposal: &BlockHeaderState) -> Option<VoteMessage> {
        match self.decide_vote(proposal) {
            VoteDecision::Strong => Some(VoteMessage::new(proposal.id, true, &self.key)),
            VoteDecision::Weak => Some(VoteMessage::new(proposal.id, false, &self.key)),
            VoteDecision::NoVote => None,
        }
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("public_key", &self.public_key().to_hex())
            .field("fsi", &self.fsi)
            .finish()
    }
}

/// The set of finalizer keys this node runs, with file-backed safety
/// records.
pub struct FinalizerSet {
    finalizers: BTreeMap<BlsPublicKey, Finalizer>,
    path: Option<PathBuf>,
}

impl FinalizerSet {
    /// An in-memory set (tests, non-voting nodes).
    pub fn in_memory(finalizers: Vec<Finalizer>) -> Self {
        Self {
            finalizers: finalizers
                .into_iter()
                .map(|f| (f.public_key(), f))
                .collect(),
            path: None,
        }
    }

    /// Open a file-backed set, restoring any persisted records for the
    /// given keys.
    pub fn open(path: PathBuf, keys: Vec<BlsPrivateKey>, root: &BlockHeaderState) -> Result<Self, SafetyFileError> {
        let saved = if path.exists() {
            load_safety_file(&path)?
        } else {
            BTreeMap::new()
        };
        let finalizers = keys
            .into_iter()
            .map(|key| {
                let public = key.public_key();
                let finalizer = match saved.get(&public.to_bytes().to_vec()) {
                    Some(fsi) => Finalizer::from_parts(key, fsi.clone()),
                    None => Finalizer::with_lock(key, root),
                };
                (public, finalizer)
            })
            .collect();
        Ok(Self {
            finalizers,
            path: Some(path),
        })
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    /// Whether the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// The safety record for a key.
    pub fn safety_info(&self, key: &BlsPublicKey) -> Option<&FinalizerSafetyInfo> {
        self.finalizers.get(key).map(|f| f.safety_info())
    }

    /// Have every relevant key vote on a proposal. Records are persisted
    /// before the votes are returned.
    pub fn vote_on(&mut self, proposal: &BlockHeaderState) -> Vec<VoteMessage> {
        let votes: Vec<VoteMessage> = self
            .finalizers
            .values_mut()
            .filter_map(|f| f.vote(proposal))
            .collect();
        if !votes.is_empty() {
            if let Err(e) = self.persist() {
                // a finalizer that cannot persist must not vote
                warn!(error = %e, "failed to persist finalizer safety file; discarding votes");
                return Vec::new();
            }
        }
        votes
    }

    /// Write all records to the safety file, atomically.
    pub fn persist(&self) -> Result<(), SafetyFileError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: BTreeMap<Vec<u8>, FinalizerSafetyInfo> = self
            .finalizers
            .iter()
            .map(|(public, f)| (public.to_bytes().to_vec(), f.safety_info().clone()))
            .collect();
        save_safety_file(path, &entries)
    }
}

/// Entry framing: `u32 length | bincode payload | u32 crc32`, after a
/// `magic | version` file header.
fn save_safety_file(
    path: &Path,
    entries: &BTreeMap<Vec<u8>, FinalizerSafetyInfo>,
) -> Result<(), SafetyFileError> {
    let mut data = Vec::new();
    data.extend_from_slice(&FSI_MAGIC);
    data.push(FSI_VERSION);
    for entry in entries {
        let payload = bincode::serialize(&entry).map_err(|e| SafetyFileError::Corrupted {
            offset: data.len(),
            message: e.to_string(),
        })?;
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        data.extend_from_slice(&crc32(&payload).to_le_bytes());
    }

    // write-then-rename so a crash never leaves a torn file
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load_safety_file(
    path: &Path,
) -> Result<BTreeMap<Vec<u8>, FinalizerSafetyInfo>, SafetyFileError> {
    let data = fs::read(path)?;
    if data.len() < 5 {
        return Err(SafetyFileError::Corrupted {
            offset: 0,
            message: "file too short".to_string(),
        });
    }
    if data[0..4] != FSI_MAGIC {
        return Err(SafetyFileError::InvalidMagic);
    }
    if data[4] != FSI_VERSION {
        return Err(SafetyFileError::UnsupportedVersion(data[4]));
    }

    let mut entries = BTreeMap::new();
    let mut offset = 5;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(SafetyFileError::Corrupted {
                offset,
                message: "truncated length prefix".to_string(),
            });
        }
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len + 4 > data.len() {
            return Err(SafetyFileError::Corrupted {
                offset,
                message: "truncated entry".to_string(),
            });
        }
        let payload = &data[offset..offset + len];
        let stored_crc =
            u32::from_le_bytes(data[offset + len..offset + len + 4].try_into().unwrap());
        if crc32(payload) != stored_crc {
            return Err(SafetyFileError::Corrupted {
                offset,
                message: "crc mismatch".to_string(),
            });
        }
        let (key, fsi): (Vec<u8>, FinalizerSafetyInfo) =
            bincode::deserialize(payload).map_err(|e| SafetyFileError::Corrupted {
                offset,
                message: e.to_string(),
            })?;
        entries.insert(key, fsi);
        offset += len + 4;
    }
    Ok(entries)
}

/// CRC32 (IEEE polynomial), table generated at compile time.
fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = generate_crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        let index = ((crc ^ (*byte as u32)) & 0xFF) as usize;
        crc = TABLE[index] ^ (crc >> 8);
    }
    !crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
