//! State-history protocol messages.
//!
//! Clients send status, block-range, and credit (ack) requests; the server
//! streams back status results and one block result per credit. All
//! messages are framed as a varuint variant index followed by the
//! variant's canonical wire encoding.

use fincore_types::wire::{
    get_bool, get_option, get_u32, get_var_bytes, get_varuint32, put_bool, put_option, put_u32,
    put_var_bytes, put_varuint32, WireDecode, WireEncode, WireError, WireResult,
};
use fincore_types::BlockId;

/// A `(block_num, block_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockPosition {
    pub block_num: u32,
    pub block_id: BlockId,
}

impl WireEncode for BlockPosition {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.block_num);
        self.block_id.encode(out);
    }
}

impl WireDecode for BlockPosition {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            block_num: get_u32(input)?,
            block_id: BlockId::decode(input)?,
        })
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum StateRequest {
    GetStatusV0,
    GetBlocksV0(GetBlocksRequestV0),
    GetBlocksAckV0(GetBlocksAckRequestV0),
    GetStatusV1,
    GetBlocksV1(GetBlocksRequestV1),
}

/// Request a stream of blocks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetBlocksRequestV0 {
    pub start_block_num: u32,
    pub end_block_num: u32,
    /// Initial send credits; each block sent consumes one
    pub max_messages_in_flight: u32,
    /// Blocks the client already has; a mismatching id rewinds the start
    pub have_positions: Vec<BlockPosition>,
    /// Only stream irreversible blocks
    pub irreversible_only: bool,
    pub fetch_block: bool,
    pub fetch_traces: bool,
    pub fetch_deltas: bool,
}

/// V1 adds finality data to the block stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetBlocksRequestV1 {
    pub base: GetBlocksRequestV0,
    pub fetch_finality_data: bool,
}

/// Grant the server more send credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetBlocksAckRequestV0 {
    pub num_messages: u32,
}

impl WireEncode for GetBlocksRequestV0 {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.start_block_num);
        put_u32(out, self.end_block_num);
        put_u32(out, self.max_messages_in_flight);
        put_varuint32(out, self.have_positions.len() as u32);
        for position in &self.have_positions {
            position.encode(out);
        }
        put_bool(out, self.irreversible_only);
        put_bool(out, self.fetch_block);
        put_bool(out, self.fetch_traces);
        put_bool(out, self.fetch_deltas);
    }
}

impl WireDecode for GetBlocksRequestV0 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let start_block_num = get_u32(input)?;
        let end_block_num = get_u32(input)?;
        let max_messages_in_flight = get_u32(input)?;
        let count = get_varuint32(input)? as usize;
        let mut have_positions = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            have_positions.push(BlockPosition::decode(input)?);
        }
        Ok(Self {
            start_block_num,
            end_block_num,
            max_messages_in_flight,
            have_positions,
            irreversible_only: get_bool(input)?,
            fetch_block: get_bool(input)?,
            fetch_traces: get_bool(input)?,
            fetch_deltas: get_bool(input)?,
        })
    }
}

impl WireEncode for GetBlocksRequestV1 {
    fn encode(&self, out: &mut Vec<u8>) {
        self.base.encode(out);
        put_bool(out, self.fetch_finality_data);
    }
}

impl WireDecode for GetBlocksRequestV1 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            base: GetBlocksRequestV0::decode(input)?,
            fetch_finality_data: get_bool(input)?,
        })
    }
}

impl WireEncode for StateRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            StateRequest::GetStatusV0 => put_varuint32(out, 0),
            StateRequest::GetBlocksV0(request) => {
                put_varuint32(out, 1);
                request.encode(out);
            }
            StateRequest::GetBlocksAckV0(ack) => {
                put_varuint32(out, 2);
                put_u32(out, ack.num_messages);
            }
            StateRequest::GetStatusV1 => put_varuint32(out, 3),
            StateRequest::GetBlocksV1(request) => {
                put_varuint32(out, 4);
                request.encode(out);
            }
        }
    }
}

impl WireDecode for StateRequest {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        match get_varuint32(input)? {
            0 => Ok(StateRequest::GetStatusV0),
            1 => Ok(StateRequest::GetBlocksV0(GetBlocksRequestV0::decode(input)?)),
            2 => Ok(StateRequest::GetBlocksAckV0(GetBlocksAckRequestV0 {
                num_messages: get_u32(input)?,
            })),
            3 => Ok(StateRequest::GetStatusV1),
            4 => Ok(StateRequest::GetBlocksV1(GetBlocksRequestV1::decode(input)?)),
            _ => Err(WireError::InvalidValue("unknown state request variant")),
        }
    }
}

/// Block range served by one history log kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogRange {
    pub begin_block: u32,
    pub end_block: u32,
}

impl WireEncode for LogRange {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.begin_block);
        put_u32(out, self.end_block);
    }
}

impl WireDecode for LogRange {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            begin_block: get_u32(input)?,
            end_block: get_u32(input)?,
        })
    }
}

/// Server status.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetStatusResultV0 {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub trace_log: Option<LogRange>,
    pub chain_state_log: Option<LogRange>,
}

/// V1 status adds the finality data log range.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetStatusResultV1 {
    pub base: GetStatusResultV0,
    pub finality_data_log: Option<LogRange>,
}

impl WireEncode for GetStatusResultV0 {
    fn encode(&self, out: &mut Vec<u8>) {
        self.head.encode(out);
        self.last_irreversible.encode(out);
        put_option(out, &self.trace_log);
        put_option(out, &self.chain_state_log);
    }
}

impl WireDecode for GetStatusResultV0 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            head: BlockPosition::decode(input)?,
            last_irreversible: BlockPosition::decode(input)?,
            trace_log: get_option(input)?,
            chain_state_log: get_option(input)?,
        })
    }
}

impl WireEncode for GetStatusResultV1 {
    fn encode(&self, out: &mut Vec<u8>) {
        self.base.encode(out);
        put_option(out, &self.finality_data_log);
    }
}

impl WireDecode for GetStatusResultV1 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            base: GetStatusResultV0::decode(input)?,
            finality_data_log: get_option(input)?,
        })
    }
}

/// One block delivery.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetBlocksResultV0 {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub this_block: Option<BlockPosition>,
    pub prev_block: Option<BlockPosition>,
    pub block: Option<Vec<u8>>,
    pub traces: Option<Vec<u8>>,
    pub deltas: Option<Vec<u8>>,
}

/// V1 adds the decompressed finality data payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetBlocksResultV1 {
    pub base: GetBlocksResultV0,
    pub finality_data: Option<Vec<u8>>,
}

fn put_option_bytes(out: &mut Vec<u8>, bytes: &Option<Vec<u8>>) {
    match bytes {
        Some(bytes) => {
            put_bool(out, true);
            put_var_bytes(out, bytes);
        }
        None => put_bool(out, false),
    }
}

fn get_option_bytes(input: &mut &[u8]) -> WireResult<Option<Vec<u8>>> {
    if get_bool(input)? {
        Ok(Some(get_var_bytes(input)?.to_vec()))
    } else {
        Ok(None)
    }
}

impl WireEncode for GetBlocksResultV0 {
    fn encode(&self, out: &mut Vec<u8>) {
        self.head.encode(out);
        self.last_irreversible.encode(out);
        put_option(out, &self.this_block);
        put_option(out, &self.prev_block);
        put_option_bytes(out, &self.block);
        put_option_bytes(out, &self.traces);
        put_option_bytes(out, &self.deltas);
    }
}

impl WireDecode for GetBlocksResultV0 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            head: BlockPosition::decode(input)?,
            last_irreversible: BlockPosition::decode(input)?,
            this_block: get_option(input)?,
            prev_block: get_option(input)?,
            block: get_option_bytes(input)?,
            traces: get_option_bytes(input)?,
            deltas: get_option_bytes(input)?,
        })
    }
}

impl WireEncode for GetBlocksResultV1 {
    fn encode(&self, out: &mut Vec<u8>) {
        self.base.encode(out);
        put_option_bytes(out, &self.finality_data);
    }
}

impl WireDecode for GetBlocksResultV1 {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            base: GetBlocksResultV0::decode(input)?,
            finality_data: get_option_bytes(input)?,
        })
    }
}

/// A server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum StateResult {
    StatusV0(GetStatusResultV0),
    BlocksV0(GetBlocksResultV0),
    StatusV1(GetStatusResultV1),
    BlocksV1(GetBlocksResultV1),
}

impl WireEncode for StateResult {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            StateResult::StatusV0(result) => {
                put_varuint32(out, 0);
                result.encode(out);
            }
            StateResult::BlocksV0(result) => {
                put_varuint32(out, 1);
                result.encode(out);
            }
            StateResult::StatusV1(result) => {
                put_varuint32(out, 2);
                result.encode(out);
            }
            StateResult::BlocksV1(result) => {
                put_varuint32(out, 3);
                result.encode(out);
            }
        }
    }
}

impl WireDecode for StateResult {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        match get_varuint32(input)? {
            0 => Ok(StateResult::StatusV0(GetStatusResultV0::decode(input)?)),
            1 => Ok(StateResult::BlocksV0(GetBlocksResultV0::decode(input)?)),
            2 => Ok(StateResult::StatusV1(GetStatusResultV1::decode(input)?)),
            3 => Ok(StateResult::BlocksV1(GetBlocksResultV1::decode(input)?)),
            _ => Err(WireError::InvalidValue("unknown state result variant")),
        }
    }
}
