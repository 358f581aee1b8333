//! Chunk file format and the partitioned log itself.
//!
//! Log file layout:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ Magic "FBLG" (4) │ Version (1) │ First block (4, LE)  │
//! ├───────────────────────────────────────────────────────┤
//! │ Entry: payload len (4, LE) │ payload │ CRC32 (4, LE)  │
//! │ ... one entry per block, ascending ...                │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The index file carries the same magic scheme ("FBLI") and one `u64`
//! little-endian log offset per block.

use crate::{BlockLogError, BlockLogResult};
use fincore_types::{BlockNum, SignedBlock, WireDecode, WireEncode};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub(crate) const LOG_MAGIC: [u8; 4] = *b"FBLG";
pub(crate) const INDEX_MAGIC: [u8; 4] = *b"FBLI";
pub(crate) const FORMAT_VERSION: u8 = 1;
pub(crate) const HEADER_SIZE: usize = 9;

/// The block-number range covered by one sealed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkRange {
    pub first: BlockNum,
    pub last: BlockNum,
}

impl ChunkRange {
    pub fn contains(&self, block_num: BlockNum) -> bool {
        self.first <= block_num && block_num <= self.last
    }

    pub(crate) fn log_name(&self) -> String {
        format!("blocks-{}-{}.log", self.first, self.last)
    }

    pub(crate) fn index_name(&self) -> String {
        format!("blocks-{}-{}.index", self.first, self.last)
    }
}

/// Configuration for the partitioned block log.
#[derive(Debug, Clone)]
pub struct BlockLogConfig {
    /// Directory holding the head chunk (`blocks.log`/`blocks.index`)
    pub dir: PathBuf,
    /// Blocks per sealed chunk
    pub stride: u32,
    /// Where sealed chunks are kept; defaults to `dir`
    pub retained_dir: Option<PathBuf>,
    /// Where chunks evicted from the retained set go; unset means delete
    pub archive_dir: Option<PathBuf>,
    /// Maximum sealed chunks kept in the retained set; 0 means unlimited
    pub max_retained_files: u32,
}

impl BlockLogConfig {
    pub fn new(dir: impl Into<PathBuf>, stride: u32) -> Self {
        Self {
            dir: dir.into(),
            stride,
            retained_dir: None,
            archive_dir: None,
            max_retained_files: 0,
        }
    }

    fn retained_dir(&self) -> PathBuf {
        match &self.retained_dir {
            Some(dir) if dir.is_relative() => self.dir.join(dir),
            Some(dir) => dir.clone(),
            None => self.dir.clone(),
        }
    }

    fn archive_dir(&self) -> Option<PathBuf> {
        self.archive_dir.as_ref().map(|dir| {
            if dir.is_relative() {
                self.dir.join(dir)
            } else {
                dir.clone()
            }
        })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BlockLogError + '_ {
    move |source| BlockLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append-friendly in-memory view of one chunk.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub first_block: BlockNum,
    /// Raw block payloads, in order
    pub payloads: Vec<Vec<u8>>,
}

impl Chunk {
    pub fn empty(first_block: BlockNum) -> Self {
        Self {
            first_block,
            payloads: Vec::new(),
        }
    }

    pub fn next_block(&self) -> BlockNum {
        self.first_block + self.payloads.len() as u32
    }

    pub fn last_block(&self) -> Option<BlockNum> {
        (!self.payloads.is_empty()).then(|| self.next_block() - 1)
    }

    pub fn encode_log(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&LOG_MAGIC);
        data.push(FORMAT_VERSION);
        data.extend_from_slice(&self.first_block.to_le_bytes());
        for payload in &self.payloads {
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            data.extend_from_slice(payload);
            data.extend_from_slice(&crc32(payload).to_le_bytes());
        }
        data
    }

    pub fn encode_index(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&INDEX_MAGIC);
        data.push(FORMAT_VERSION);
        data.extend_from_slice(&self.first_block.to_le_bytes());
        let mut offset = HEADER_SIZE as u64;
        for payload in &self.payloads {
            data.extend_from_slice(&offset.to_le_bytes());
            offset += 4 + payload.len() as u64 + 4;
        }
        data
    }

    /// Parse and fully validate a log file, cross-checking the index.
    pub fn read(log_path: &Path, index_path: &Path) -> BlockLogResult<Self> {
        let log_data = fs::read(log_path).map_err(io_err(log_path))?;
        let index_data = fs::read(index_path).map_err(io_err(index_path))?;

        let (first_block, payload_offsets, payloads) = parse_log(log_path, &log_data)?;
        let index_first = parse_index_header(index_path, &index_data)?;
        if index_first != first_block {
            return Err(BlockLogError::IndexMismatch {
                path: index_path.to_path_buf(),
                message: format!(
                    "index starts at block {index_first}, log starts at {first_block}"
                ),
            });
        }

        let offsets_bytes = &index_data[HEADER_SIZE..];
        if offsets_bytes.len() % 8 != 0 {
            return Err(BlockLogError::Corrupted {
                path: index_path.to_path_buf(),
                offset: HEADER_SIZE,
                message: "index size not a multiple of entry size".to_string(),
            });
        }
        let index_offsets: Vec<u64> = offsets_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunk of 8")))
            .collect();
        if index_offsets.len() != payloads.len() {
            return Err(BlockLogError::IndexMismatch {
                path: index_path.to_path_buf(),
                message: format!(
                    "index has {} entries, log has {}",
                    index_offsets.len(),
                    payloads.len()
                ),
            });
        }
        for (i, (stored, actual)) in index_offsets.iter().zip(&payload_offsets).enumerate() {
            if stored != actual {
                return Err(BlockLogError::IndexMismatch {
                    path: index_path.to_path_buf(),
                    message: format!(
                        "entry {i}: index offset {stored} does not match log offset {actual}"
                    ),
                });
            }
        }

        Ok(Self {
            first_block,
            payloads,
        })
    }

    pub fn write(&self, log_path: &Path, index_path: &Path) -> BlockLogResult<()> {
        write_file(log_path, &self.encode_log())?;
        write_file(index_path, &self.encode_index())
    }
}

fn write_file(path: &Path, data: &[u8]) -> BlockLogResult<()> {
    let mut file = fs::File::create(path).map_err(io_err(path))?;
    file.write_all(data).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

fn append_file(path: &Path, data: &[u8]) -> BlockLogResult<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(data).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

/// Parse a log file: header, then CRC-checked entries. Returns the first
/// block number, per-entry offsets, and payloads.
fn parse_log(path: &Path, data: &[u8]) -> BlockLogResult<(BlockNum, Vec<u64>, Vec<Vec<u8>>)> {
    if data.len() < HEADER_SIZE {
        return Err(BlockLogError::Corrupted {
            path: path.to_path_buf(),
            offset: 0,
            message: "file shorter than header".to_string(),
        });
    }
    if data[0..4] != LOG_MAGIC {
        return Err(BlockLogError::InvalidMagic(path.to_path_buf()));
    }
    if data[4] != FORMAT_VERSION {
        return Err(BlockLogError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: data[4],
        });
    }
    let first_block = u32::from_le_bytes(data[5..9].try_into().expect("4 bytes"));

    let mut offsets = Vec::new();
    let mut payloads = Vec::new();
    let mut offset = HEADER_SIZE;
    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(BlockLogError::Corrupted {
                path: path.to_path_buf(),
                offset,
                message: "truncated entry length".to_string(),
            });
        }
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4 bytes")) as usize;
        if offset + 4 + len + 4 > data.len() {
            return Err(BlockLogError::Corrupted {
                path: path.to_path_buf(),
                offset,
                message: "truncated entry payload".to_string(),
            });
        }
        let payload = &data[offset + 4..offset + 4 + len];
        let stored_crc = u32::from_le_bytes(
            data[offset + 4 + len..offset + 4 + len + 4]
                .try_into()
                .expect("4 bytes"),
        );
        if crc32(payload) != stored_crc {
            return Err(BlockLogError::Corrupted {
                path: path.to_path_buf(),
                offset,
                message: "entry crc mismatch".to_string(),
            });
        }
        offsets.push(offset as u64);
        payloads.push(payload.to_vec());
        offset += 4 + len + 4;
    }
    Ok((first_block, offsets, payloads))
}

fn parse_index_header(path: &Path, data: &[u8]) -> BlockLogResult<BlockNum> {
    if data.len() < HEADER_SIZE {
        return Err(BlockLogError::Corrupted {
            path: path.to_path_buf(),
            offset: 0,
            message: "index shorter than header".to_string(),
        });
    }
    if data[0..4] != INDEX_MAGIC {
        return Err(BlockLogError::InvalidMagic(path.to_path_buf()));
    }
    if data[4] != FORMAT_VERSION {
        return Err(BlockLogError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: data[4],
        });
    }
    Ok(u32::from_le_bytes(data[5..9].try_into().expect("4 bytes")))
}

/// The partitioned block log.
#[derive(Debug)]
pub struct BlockLog {
    config: BlockLogConfig,
    head: Chunk,
    /// Sealed chunks still served, ascending
    retained: Vec<ChunkRange>,
}

impl BlockLog {
    /// Open (or create) the log under the configured directories.
    ///
    /// The head chunk is fully validated; a corrupted log or index fails
    /// here rather than being silently truncated.
    pub fn open(config: BlockLogConfig) -> BlockLogResult<Self> {
        fs::create_dir_all(&config.dir).map_err(io_err(&config.dir))?;
        let retained_dir = config.retained_dir();
        fs::create_dir_all(&retained_dir).map_err(io_err(&retained_dir))?;
        if let Some(archive) = config.archive_dir() {
            fs::create_dir_all(&archive).map_err(io_err(&archive))?;
        }

        let log_path = config.dir.join("blocks.log");
        let index_path = config.dir.join("blocks.index");
        let head = if log_path.exists() {
            Chunk::read(&log_path, &index_path)?
        } else {
            Chunk::empty(1)
        };

        let retained = scan_chunks(&retained_dir)?;
        info!(
            dir = %config.dir.display(),
            retained = retained.len(),
            head_first = head.first_block,
            head_blocks = head.payloads.len(),
            "block log opened"
        );
        Ok(Self {
            config,
            head,
            retained,
        })
    }

    /// First block currently served (retained or head), if any.
    pub fn first_block(&self) -> Option<BlockNum> {
        self.retained
            .first()
            .map(|r| r.first)
            .or_else(|| self.head.last_block().map(|_| self.head.first_block))
    }

    /// Last appended block, if any.
    pub fn last_block(&self) -> Option<BlockNum> {
        self.head
            .last_block()
            .or_else(|| self.retained.last().map(|r| r.last))
    }

    /// The served block range.
    pub fn block_range(&self) -> Option<(BlockNum, BlockNum)> {
        Some((self.first_block()?, self.last_block()?))
    }

    /// The sealed chunks currently served.
    pub fn retained_chunks(&self) -> &[ChunkRange] {
        &self.retained
    }

    /// Append the next block. Blocks must arrive in strict sequence.
    pub fn append(&mut self, block: &SignedBlock) -> BlockLogResult<()> {
        let expected = self
            .last_block()
            .map(|last| last + 1)
            .unwrap_or(self.head.first_block);
        if block.block_num() != expected {
            return Err(BlockLogError::NonSequentialAppend {
                expected,
                got: block.block_num(),
            });
        }
        if self.head.payloads.is_empty() {
            self.head.first_block = expected;
        }

        let payload = block.to_wire_bytes();
        self.append_head_entry(&payload)?;
        self.head.payloads.push(payload);

        // seal the head chunk at the stride boundary
        if block.block_num() % self.config.stride == 0 {
            self.rotate()?;
        }
        Ok(())
    }

    /// Append one entry to the head files, creating them with headers when
    /// this is the chunk's first block.
    fn append_head_entry(&self, payload: &[u8]) -> BlockLogResult<()> {
        let log_path = self.config.dir.join("blocks.log");
        let index_path = self.config.dir.join("blocks.index");

        let mut log_offset = HEADER_SIZE as u64;
        for existing in &self.head.payloads {
            log_offset += 4 + existing.len() as u64 + 4;
        }

        if self.head.payloads.is_empty() {
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(&LOG_MAGIC);
            header.push(FORMAT_VERSION);
            header.extend_from_slice(&self.head.first_block.to_le_bytes());
            write_file(&log_path, &header)?;

            let mut index_header = Vec::with_capacity(HEADER_SIZE);
            index_header.extend_from_slice(&INDEX_MAGIC);
            index_header.push(FORMAT_VERSION);
            index_header.extend_from_slice(&self.head.first_block.to_le_bytes());
            write_file(&index_path, &index_header)?;
        }

        let mut entry = Vec::with_capacity(4 + payload.len() + 4);
        entry.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        entry.extend_from_slice(payload);
        entry.extend_from_slice(&crc32(payload).to_le_bytes());
        append_file(&log_path, &entry)?;
        append_file(&index_path, &log_offset.to_le_bytes())?;
        Ok(())
    }

    fn rotate(&mut self) -> BlockLogResult<()> {
        let Some(last) = self.head.last_block() else {
            return Ok(());
        };
        let range = ChunkRange {
            first: self.head.first_block,
            last,
        };
        let retained_dir = self.config.retained_dir();
        let sealed = std::mem::replace(&mut self.head, Chunk::empty(last + 1));
        sealed.write(
            &retained_dir.join(range.log_name()),
            &retained_dir.join(range.index_name()),
        )?;
        fs::remove_file(self.config.dir.join("blocks.log")).ok();
        fs::remove_file(self.config.dir.join("blocks.index")).ok();
        self.retained.push(range);
        debug!(first = range.first, last = range.last, "chunk sealed");

        // evict beyond the retention cap; 0 means unlimited
        let max = self.config.max_retained_files as usize;
        if max > 0 {
            while self.retained.len() > max {
                let evicted = self.retained.remove(0);
                self.evict(&retained_dir, evicted)?;
            }
        }
        Ok(())
    }

    fn evict(&self, retained_dir: &Path, range: ChunkRange) -> BlockLogResult<()> {
        let log = retained_dir.join(range.log_name());
        let index = retained_dir.join(range.index_name());
        match self.config.archive_dir() {
            Some(archive) => {
                fs::rename(&log, archive.join(range.log_name())).map_err(io_err(&log))?;
                fs::rename(&index, archive.join(range.index_name())).map_err(io_err(&index))?;
                info!(first = range.first, last = range.last, "chunk archived");
            }
            None => {
                fs::remove_file(&log).map_err(io_err(&log))?;
                fs::remove_file(&index).map_err(io_err(&index))?;
                warn!(first = range.first, last = range.last, "chunk deleted");
            }
        }
        Ok(())
    }

    /// Fetch a block by number from the head chunk or the retained set.
    ///
    /// Archived blocks are no longer served and return `None`.
    pub fn fetch(&self, block_num: BlockNum) -> BlockLogResult<Option<SignedBlock>> {
        // head chunk first: the most common reads are near the tip
        if block_num >= self.head.first_block {
            let index = (block_num - self.head.first_block) as usize;
            return match self.head.payloads.get(index) {
                Some(payload) => Ok(Some(decode_block(
                    &self.config.dir.join("blocks.log"),
                    block_num,
                    payload,
                )?)),
                None => Ok(None),
            };
        }

        let Some(range) = self.retained.iter().find(|r| r.contains(block_num)) else {
            return Ok(None);
        };
        let retained_dir = self.config.retained_dir();
        let chunk = Chunk::read(
            &retained_dir.join(range.log_name()),
            &retained_dir.join(range.index_name()),
        )?;
        let index = (block_num - chunk.first_block) as usize;
        match chunk.payloads.get(index) {
            Some(payload) => Ok(Some(decode_block(
                &retained_dir.join(range.log_name()),
                block_num,
                payload,
            )?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn decode_block(
    path: &Path,
    block_num: BlockNum,
    payload: &[u8],
) -> BlockLogResult<SignedBlock> {
    let block = SignedBlock::from_wire_bytes(payload).map_err(|e| BlockLogError::BadBlock {
        path: path.to_path_buf(),
        block_num,
        message: e.to_string(),
    })?;
    if block.block_num() != block_num {
        return Err(BlockLogError::BadBlock {
            path: path.to_path_buf(),
            block_num,
            message: format!("entry decodes to block {}", block.block_num()),
        });
    }
    Ok(block)
}

/// Discover sealed chunk files in a directory.
pub(crate) fn scan_chunks(dir: &Path) -> BlockLogResult<Vec<ChunkRange>> {
    let mut ranges = Vec::new();
    let entries = fs::read_dir(dir).map_err(io_err(dir))?;
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(range) = parse_chunk_name(name) {
            ranges.push(range);
        }
    }
    ranges.sort();
    Ok(ranges)
}

fn parse_chunk_name(name: &str) -> Option<ChunkRange> {
    let rest = name.strip_prefix("blocks-")?.strip_suffix(".log")?;
    let (first, last) = rest.split_once('-')?;
    Some(ChunkRange {
        first: first.parse().ok()?,
        last: last.parse().ok()?,
    })
}

/// CRC32 (IEEE polynomial), table generated at compile time.
pub(crate) fn crc32(data: &[u8]) -> u32 {
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
