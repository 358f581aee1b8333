//! A state-history session: one connected client, two cooperative tasks.
//!
//! The **reader** parses framed requests and updates the session state; the
//! **writer** drains it - status replies first, then one block result per
//! send credit. The writer sleeps on a wake primitive whenever there is
//! nothing to send; the reader, [`SessionHandle::block_applied`], and
//! shutdown all wake it. Closing the socket or cancelling the wake makes
//! both tasks finish promptly, and every exit path releases the stream.
//!
//! Per-block payload logs are read by opening an owned decompression
//! stream, which moves into the writer task; no log lock is held while the
//! payload is streamed out.

use crate::log::HistoryLog;
use crate::types::{
    BlockPosition, GetBlocksRequestV0, GetBlocksResultV0, GetBlocksResultV1, GetStatusResultV0,
    GetStatusResultV1, LogRange, StateRequest, StateResult,
};
use fincore_types::{BlockId, WireDecode, WireEncode};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Greeting written to every client before the request loop starts.
pub const PROTOCOL_BANNER: &[u8] = b"fincore-state-history-v1";

/// Largest accepted request frame.
const MAX_REQUEST_FRAME: u32 = 1024 * 1024;

/// The chain data a session serves; implemented by the node's controller
/// layer.
pub trait ChainView: Send + Sync + 'static {
    fn head(&self) -> BlockPosition;
    fn last_irreversible(&self) -> BlockPosition;
    fn block_id_for(&self, block_num: u32) -> Option<BlockId>;
    fn fetch_block(&self, block_num: u32) -> Option<Vec<u8>>;
}

/// The optional per-kind payload logs.
#[derive(Clone, Default)]
pub struct HistoryLogs {
    pub traces: Option<Arc<HistoryLog>>,
    pub chain_state: Option<Arc<HistoryLog>>,
    pub finality_data: Option<Arc<HistoryLog>>,
}

/// Session timing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Allowed gap between client requests before the session closes
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct SessionState {
    /// Queued status requests; `true` marks a v1 request
    status_requests: Vec<bool>,
    current_request: Option<GetBlocksRequestV0>,
    /// `None` while a v0 request is active; `Some(fetch_finality)` for v1
    v1_finality: Option<bool>,
    send_credits: u32,
    next_block_cursor: u32,
    closed: bool,
}

/// Control handle for a running session.
pub struct SessionHandle {
    state: Arc<Mutex<SessionState>>,
    wake: Arc<Notify>,
    supervisor: JoinHandle<()>,
}

impl SessionHandle {
    /// A block was applied on the main domain. A number at or below the
    /// session cursor indicates a fork of already-sent blocks: the cursor
    /// rewinds so the new reality is re-sent.
    pub fn block_applied(&self, block_num: u32) {
        let mut state = self.state.lock();
        if block_num < state.next_block_cursor {
            state.next_block_cursor = block_num;
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Ask both tasks to finish promptly.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_one();
    }

    /// Wait for the session to finish.
    pub async fn wait(self) {
        let _ = self.supervisor.await;
    }
}

/// Spawn the reader and writer tasks for one accepted connection.
pub fn spawn_session<S>(
    stream: S,
    remote: String,
    view: Arc<dyn ChainView>,
    logs: HistoryLogs,
    config: SessionConfig,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let state = Arc::new(Mutex::new(SessionState::default()));
    let wake = Arc::new(Notify::new());
    info!(remote = %remote, "incoming state history connection");

    let (read_half, write_half) = tokio::io::split(stream);
    let reader = tokio::spawn(read_loop(
        read_half,
        remote.clone(),
        Arc::clone(&state),
        Arc::clone(&wake),
        Arc::clone(&view),
        config.clone(),
    ));
    let writer = tokio::spawn(write_loop(
        write_half,
        remote.clone(),
        Arc::clone(&state),
        Arc::clone(&wake),
        view,
        logs,
    ));

    let supervisor = tokio::spawn(async move {
        let _ = reader.await;
        let _ = writer.await;
        info!(remote = %remote, "state history session finished");
    });

    SessionHandle {
        state,
        wake,
        supervisor,
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match tokio::time::timeout(timeout, reader.read_exact(&mut len_bytes)).await {
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(_)) => {}
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_REQUEST_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request frame too large",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    tokio::time::timeout(timeout, reader.read_exact(&mut payload))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
    Ok(Some(payload))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    remote: String,
    state: Arc<Mutex<SessionState>>,
    wake: Arc<Notify>,
    view: Arc<dyn ChainView>,
    config: SessionConfig,
) {
    let result = async {
        loop {
            let Some(frame) = read_frame(&mut reader, config.read_timeout).await? else {
                return Ok::<(), io::Error>(());
            };
            let request = StateRequest::from_wire_bytes(&frame)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            debug!(remote = %remote, ?request, "state history request");
            handle_request(&state, &view, request);
            wake.notify_one();
        }
    }
    .await;

    // log the first failure once, with the remote endpoint and the cause
    if let Err(e) = result {
        info!(remote = %remote, cause = %e, "state history connection failed");
    }
    state.lock().closed = true;
    wake.notify_one();
}

fn handle_request(state: &Mutex<SessionState>, view: &Arc<dyn ChainView>, request: StateRequest) {
    let mut state = state.lock();
    match request {
        StateRequest::GetStatusV0 => state.status_requests.push(false),
        StateRequest::GetStatusV1 => state.status_requests.push(true),
        StateRequest::GetBlocksAckV0(ack) => {
            state.send_credits = state.send_credits.saturating_add(ack.num_messages);
        }
        StateRequest::GetBlocksV0(request) => set_blocks_request(&mut state, view, request, None),
        StateRequest::GetBlocksV1(request) => {
            let finality = Some(request.fetch_finality_data);
            set_blocks_request(&mut state, view, request.base, finality);
        }
    }
}

fn set_blocks_request(
    state: &mut SessionState,
    view: &Arc<dyn ChainView>,
    mut request: GetBlocksRequestV0,
    v1_finality: Option<bool>,
) {
    // a have-position whose id no longer matches is on a discarded fork:
    // rewind the start below it
    for have in request.have_positions.drain(..) {
        if request.start_block_num <= have.block_num {
            continue;
        }
        if view.block_id_for(have.block_num) != Some(have.block_id) {
            request.start_block_num = request.start_block_num.min(have.block_num);
        }
    }
    state.send_credits = request.max_messages_in_flight;
    state.next_block_cursor = request.start_block_num;
    state.v1_finality = v1_finality;
    state.current_request = Some(request);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    remote: String,
    state: Arc<Mutex<SessionState>>,
    wake: Arc<Notify>,
    view: Arc<dyn ChainView>,
    logs: HistoryLogs,
) {
    let result = async {
        write_frame(&mut writer, PROTOCOL_BANNER).await?;

        loop {
            // decide what to send while holding the lock, then do all I/O
            // and decompression outside it
            let (status_requests, block_to_send) = next_work(&state, &view);
            if state.lock().closed {
                return Ok::<(), io::Error>(());
            }
            if status_requests.is_empty() && block_to_send.is_none() {
                wake.notified().await;
                continue;
            }

            for is_v1 in status_requests {
                let status = fill_status(&view, &logs);
                let result = if is_v1 {
                    StateResult::StatusV1(status)
                } else {
                    StateResult::StatusV0(status.base)
                };
                write_frame(&mut writer, &result.to_wire_bytes()).await?;
            }

            if let Some(package) = block_to_send {
                let result = build_block_result(&view, &logs, package)?;
                write_frame(&mut writer, &result.to_wire_bytes()).await?;
            }
        }
    }
    .await;

    if let Err(e) = result {
        info!(remote = %remote, cause = %e, "state history write failed");
    }
    state.lock().closed = true;
    // dropping the write half releases the stream resources
}

struct BlockPackage {
    block_num: u32,
    request: GetBlocksRequestV0,
    v1_finality: Option<bool>,
}

/// Pop the queued status requests and reserve the next block to send, if
/// credits and the cursor allow.
fn next_work(
    state: &Mutex<SessionState>,
    view: &Arc<dyn ChainView>,
) -> (Vec<bool>, Option<BlockPackage>) {
    let mut state = state.lock();
    let status_requests = std::mem::take(&mut state.status_requests);

    let mut block_to_send = None;
    if let Some(request) = state.current_request.clone() {
        let latest = if request.irreversible_only {
            view.last_irreversible().block_num
        } else {
            view.head().block_num
        };
        let cursor = state.next_block_cursor;
        if state.send_credits > 0 && cursor <= latest && cursor < request.end_block_num {
            block_to_send = Some(BlockPackage {
                block_num: cursor,
                request,
                v1_finality: state.v1_finality,
            });
            state.next_block_cursor += 1;
            state.send_credits -= 1;
        }
    }
    (status_requests, block_to_send)
}

fn fill_status(view: &Arc<dyn ChainView>, logs: &HistoryLogs) -> GetStatusResultV1 {
    let range_of = |log: &Option<Arc<HistoryLog>>| {
        log.as_ref().and_then(|l| l.block_range()).map(|(begin, end)| LogRange {
            begin_block: begin,
            end_block: end,
        })
    };
    GetStatusResultV1 {
        base: GetStatusResultV0 {
            head: view.head(),
            last_irreversible: view.last_irreversible(),
            trace_log: range_of(&logs.traces),
            chain_state_log: range_of(&logs.chain_state),
        },
        finality_data_log: range_of(&logs.finality_data),
    }
}

fn build_block_result(
    view: &Arc<dyn ChainView>,
    logs: &HistoryLogs,
    package: BlockPackage,
) -> io::Result<StateResult> {
    let mut base = GetBlocksResultV0 {
        head: view.head(),
        last_irreversible: view.last_irreversible(),
        ..Default::default()
    };

    let mut finality_data = None;
    if let Some(block_id) = view.block_id_for(package.block_num) {
        base.this_block = Some(BlockPosition {
            block_num: package.block_num,
            block_id,
        });
        if package.block_num > 0 {
            if let Some(prev_id) = view.block_id_for(package.block_num - 1) {
                base.prev_block = Some(BlockPosition {
                    block_num: package.block_num - 1,
                    block_id: prev_id,
                });
            }
        }
        if package.request.fetch_block {
            base.block = view.fetch_block(package.block_num);
        }
        // decompression streams are owned here, in the writer task
        if package.request.fetch_traces {
            base.traces = open_payload(&logs.traces, package.block_num)?;
        }
        if package.request.fetch_deltas {
            base.deltas = open_payload(&logs.chain_state, package.block_num)?;
        }
        if package.v1_finality == Some(true) {
            finality_data = open_payload(&logs.finality_data, package.block_num)?;
        }
    } else {
        warn!(block_num = package.block_num, "no id for scheduled block");
    }

    Ok(match package.v1_finality {
        Some(_) => StateResult::BlocksV1(GetBlocksResultV1 {
            base,
            finality_data,
        }),
        None => StateResult::BlocksV0(base),
    })
}

fn open_payload(log: &Option<Arc<HistoryLog>>, block_num: u32) -> io::Result<Option<Vec<u8>>> {
    match log.as_ref().and_then(|l| l.open_entry(block_num)) {
        Some(stream) => Ok(Some(stream.read_all()?)),
        None => Ok(None),
    }
}
