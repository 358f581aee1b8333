//! Block identifiers and headers.
//!
//! The block id is the Keccak256 of the canonically encoded header with the
//! block number spliced into the first four bytes (big-endian), so the
//! number is recoverable from the id alone.

use crate::name::AccountName;
use crate::qc::Qc;
use crate::timestamp::BlockTimestamp;
use crate::wire::{
    get_bytes, get_option, get_u16, get_u32, get_var_bytes, get_varuint32, put_bytes, put_option,
    put_u16, put_u32, put_var_bytes, put_varuint32, WireDecode, WireEncode, WireResult,
};
use fincore_crypto::{keccak256, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block number type.
pub type BlockNum = u32;

/// Sentinel for the legacy `confirmed` header field.
///
/// Pre-IF consensus counted producer confirmations here; under instant
/// finality the field is vestigial and always carries this sentinel. It is
/// still encoded for wire compatibility and never interpreted.
pub const HS_BLOCK_CONFIRMED: u16 = u16::MAX;

/// A block id: a digest with the block number in its first four bytes.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockId(pub Digest);

impl BlockId {
    /// Splice a block number into a header digest.
    pub fn from_digest(digest: Digest, block_num: BlockNum) -> Self {
        let mut bytes = digest.into_bytes();
        bytes[..4].copy_from_slice(&block_num.to_be_bytes());
        Self(Digest::new(bytes))
    }

    /// Recover the block number from the id.
    pub fn block_num(&self) -> BlockNum {
        let bytes = self.0.as_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// The underlying digest bytes. This is also the block's strong digest:
    /// strong votes sign exactly these 32 bytes.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId(#{} {})", self.block_num(), self.0.to_hex())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.block_num(), self.0)
    }
}

impl WireEncode for BlockId {
    fn encode(&self, out: &mut Vec<u8>) {
        put_bytes(out, self.0.as_bytes());
    }
}

impl WireDecode for BlockId {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let bytes = get_bytes(input, 32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(Digest::new(arr)))
    }
}

/// A block header.
///
/// `header_extensions` are raw `(ext_id, payload)` pairs sorted by id; the
/// typed views live in [`crate::extensions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockHeader {
    /// Production slot
    pub timestamp: BlockTimestamp,
    /// Scheduled producer that signed the block
    pub producer: AccountName,
    /// Legacy confirmation count, always [`HS_BLOCK_CONFIRMED`]
    pub confirmed: u16,
    /// Parent block id
    pub previous: BlockId,
    /// Merkle root of the block's transactions
    pub transaction_mroot: Digest,
    /// Merkle root of the block's action receipts
    pub action_mroot: Digest,
    /// Proposer schedule version
    pub schedule_version: u32,
    /// Raw header extensions, sorted by extension id
    pub header_extensions: Vec<(u16, Vec<u8>)>,
}

impl BlockHeader {
    /// This block's number: one past the parent's.
    pub fn block_num(&self) -> BlockNum {
        self.previous.block_num() + 1
    }

    /// Compute the block id from the canonical header encoding.
    pub fn calculate_id(&self) -> BlockId {
        let digest = Digest::new(keccak256(&self.to_wire_bytes()));
        BlockId::from_digest(digest, self.block_num())
    }
}

impl WireEncode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.timestamp.encode(out);
        self.producer.encode(out);
        put_u16(out, self.confirmed);
        self.previous.encode(out);
        put_bytes(out, self.transaction_mroot.as_bytes());
        put_bytes(out, self.action_mroot.as_bytes());
        put_u32(out, self.schedule_version);
        put_varuint32(out, self.header_extensions.len() as u32);
        for (ext_id, payload) in &self.header_extensions {
            put_u16(out, *ext_id);
            put_var_bytes(out, payload);
        }
    }
}

impl WireDecode for BlockHeader {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let timestamp = BlockTimestamp::decode(input)?;
        let producer = AccountName::decode(input)?;
        let confirmed = get_u16(input)?;
        let previous = BlockId::decode(input)?;

        let mut mroot = [0u8; 32];
        mroot.copy_from_slice(get_bytes(input, 32)?);
        let transaction_mroot = Digest::new(mroot);
        mroot.copy_from_slice(get_bytes(input, 32)?);
        let action_mroot = Digest::new(mroot);

        let schedule_version = get_u32(input)?;
        let ext_count = get_varuint32(input)? as usize;
        let mut header_extensions = Vec::with_capacity(ext_count.min(16));
        for _ in 0..ext_count {
            let ext_id = get_u16(input)?;
            let payload = get_var_bytes(input)?.to_vec();
            header_extensions.push((ext_id, payload));
        }
        Ok(Self {
            timestamp,
            producer,
            confirmed,
            previous,
            transaction_mroot,
            action_mroot,
            schedule_version,
            header_extensions,
        })
    }
}

/// A header plus the producer's signature.
///
/// The signature is opaque here; producer signature verification belongs to
/// the outer validation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignedBlockHeader {
    pub header: BlockHeader,
    pub producer_signature: Vec<u8>,
}

impl SignedBlockHeader {
    /// Wrap an unsigned header (tests and local production).
    pub fn unsigned(header: BlockHeader) -> Self {
        Self {
            header,
            producer_signature: Vec::new(),
        }
    }
}

impl WireEncode for SignedBlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        put_var_bytes(out, &self.producer_signature);
    }
}

impl WireDecode for SignedBlockHeader {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            header: BlockHeader::decode(input)?,
            producer_signature: get_var_bytes(input)?.to_vec(),
        })
    }
}

/// A signed header plus the optional quorum certificate payload.
///
/// The header's instant-finality extension carries the compact claim; the
/// certificate justifying a *new* claim travels alongside in the block. A
/// block repeating its parent's claim must not carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBlock {
    pub signed_header: SignedBlockHeader,
    pub qc: Option<Qc>,
}

impl SignedBlock {
    /// Block number from the header.
    pub fn block_num(&self) -> BlockNum {
        self.signed_header.header.block_num()
    }

    /// Recompute the block id.
    pub fn id(&self) -> BlockId {
        self.signed_header.header.calculate_id()
    }
}

impl WireEncode for SignedBlock {
    fn encode(&self, out: &mut Vec<u8>) {
        self.signed_header.encode(out);
        put_option(out, &self.qc);
    }
}

impl WireDecode for SignedBlock {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            signed_header: SignedBlockHeader::decode(input)?,
            qc: get_option(input)?,
        })
    }
}
