//! Per-kind compressed entry logs (traces, chain-state deltas, finality
//! data).
//!
//! Entries are gzip-compressed and indexed by block number. Reading an
//! entry returns an owned [`DecompressStream`]: decompression state moves
//! into whichever task drains it, so no log lock is held while a session
//! writer streams the payload out.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use tracing::debug;

/// Errors from a history log.
#[derive(Debug, thiserror::Error)]
pub enum HistoryLogError {
    /// I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Structurally damaged log content
    #[error("corrupted history log {path} at offset {offset}")]
    Corrupted { path: PathBuf, offset: usize },

    /// Compression failure
    #[error("compression error: {0}")]
    Compression(String),
}

const ENTRY_HEADER: usize = 8; // block_num u32 + payload len u32

/// An owned decompression stream over one entry.
///
/// Implements [`Read`]; ownership transfers to the consuming task.
pub struct DecompressStream {
    inner: GzDecoder<Cursor<Vec<u8>>>,
    unpacked_size: u64,
}

impl DecompressStream {
    /// Size of the decompressed payload.
    pub fn unpacked_size(&self) -> u64 {
        self.unpacked_size
    }

    /// Drain the stream into a buffer.
    pub fn read_all(mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.unpacked_size as usize);
        self.inner.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for DecompressStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

struct Inner {
    /// Raw compressed entries by block number
    entries: BTreeMap<u32, Vec<u8>>,
    /// Uncompressed sizes, kept alongside for stream sizing
    sizes: BTreeMap<u32, u64>,
}

/// One kind of history log (traces, deltas, or finality data).
///
/// Entries are held compressed in memory and mirrored to a file so a
/// restarted service can serve history from before the restart.
pub struct HistoryLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl HistoryLog {
    /// Open or create a log at `path`, loading any existing entries.
    pub fn open(path: PathBuf) -> Result<Self, HistoryLogError> {
        let mut entries = BTreeMap::new();
        let mut sizes = BTreeMap::new();
        if path.exists() {
            let data = fs::read(&path).map_err(|source| HistoryLogError::Io {
                path: path.clone(),
                source,
            })?;
            let mut offset = 0;
            while offset < data.len() {
                if offset + ENTRY_HEADER > data.len() {
                    return Err(HistoryLogError::Corrupted {
                        path: path.clone(),
                        offset,
                    });
                }
                let block_num =
                    u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4 bytes"));
                let len = u32::from_le_bytes(
                    data[offset + 4..offset + 8].try_into().expect("4 bytes"),
                ) as usize;
                if offset + ENTRY_HEADER + len > data.len() {
                    return Err(HistoryLogError::Corrupted {
                        path: path.clone(),
                        offset,
                    });
                }
                let compressed = data[offset + ENTRY_HEADER..offset + ENTRY_HEADER + len].to_vec();
                let size = unpacked_size(&compressed).ok_or(HistoryLogError::Corrupted {
                    path: path.clone(),
                    offset,
                })?;
                entries.insert(block_num, compressed);
                sizes.insert(block_num, size);
                offset += ENTRY_HEADER + len;
            }
        }
        Ok(Self {
            path,
            inner: Mutex::new(Inner { entries, sizes }),
        })
    }

    /// Compress and store the payload for a block, replacing any earlier
    /// entry for the same block (fork handling).
    pub fn append(&self, block_num: u32, payload: &[u8]) -> Result<(), HistoryLogError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload)
            .and_then(|_| encoder.finish())
            .map_err(|e| HistoryLogError::Compression(e.to_string()))
            .and_then(|compressed| {
                let mut inner = self.inner.lock();
                inner.sizes.insert(block_num, payload.len() as u64);
                inner.entries.insert(block_num, compressed);
                // entries above a replaced block are stale after a fork
                let stale: Vec<u32> = inner
                    .entries
                    .range(block_num + 1..)
                    .map(|(n, _)| *n)
                    .collect();
                for n in stale {
                    inner.entries.remove(&n);
                    inner.sizes.remove(&n);
                }
                drop(inner);
                self.flush()
            })?;
        debug!(block_num, "history entry stored");
        Ok(())
    }

    /// The `[begin, end)` block range currently stored.
    pub fn block_range(&self) -> Option<(u32, u32)> {
        let inner = self.inner.lock();
        let first = *inner.entries.keys().next()?;
        let last = *inner.entries.keys().next_back()?;
        Some((first, last + 1))
    }

    /// Open an owned decompression stream over one entry.
    pub fn open_entry(&self, block_num: u32) -> Option<DecompressStream> {
        let inner = self.inner.lock();
        let compressed = inner.entries.get(&block_num)?.clone();
        let unpacked_size = *inner.sizes.get(&block_num)?;
        drop(inner);
        Some(DecompressStream {
            inner: GzDecoder::new(Cursor::new(compressed)),
            unpacked_size,
        })
    }

    fn flush(&self) -> Result<(), HistoryLogError> {
        let inner = self.inner.lock();
        let mut data = Vec::new();
        for (block_num, compressed) in &inner.entries {
            data.extend_from_slice(&block_num.to_le_bytes());
            data.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            data.extend_from_slice(compressed);
        }
        drop(inner);
        fs::write(&self.path, &data).map_err(|source| HistoryLogError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn unpacked_size(compressed: &[u8]) -> Option<u64> {
    let mut decoder = GzDecoder::new(Cursor::new(compressed));
    let mut sink = Vec::new();
    decoder.read_to_end(&mut sink).ok()?;
    Some(sink.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_stream_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("trace.log")).unwrap();

        log.append(5, b"trace payload for block five").unwrap();
        log.append(6, b"six").unwrap();
        assert_eq!(log.block_range(), Some((5, 7)));

        let stream = log.open_entry(5).unwrap();
        assert_eq!(stream.unpacked_size(), 28);
        assert_eq!(stream.read_all().unwrap(), b"trace payload for block five");
        assert!(log.open_entry(4).is_none());
    }

    #[test]
    fn test_fork_replacement_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("trace.log")).unwrap();
        log.append(5, b"five").unwrap();
        log.append(6, b"six").unwrap();
        log.append(7, b"seven").unwrap();

        // a fork re-applies block 6: the old 6 and everything above it go
        log.append(6, b"six prime").unwrap();
        assert_eq!(log.block_range(), Some((5, 7)));
        assert_eq!(log.open_entry(6).unwrap().read_all().unwrap(), b"six prime");
        assert!(log.open_entry(7).is_none());
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deltas.log");
        {
            let log = HistoryLog::open(path.clone()).unwrap();
            log.append(1, b"one").unwrap();
            log.append(2, b"two").unwrap();
        }
        let log = HistoryLog::open(path).unwrap();
        assert_eq!(log.block_range(), Some((1, 3)));
        assert_eq!(log.open_entry(2).unwrap().read_all().unwrap(), b"two");
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        fs::write(&path, b"\x01\x00\x00\x00\xff\xff\xff\xff").unwrap();
        assert!(matches!(
            HistoryLog::open(path),
            Err(HistoryLogError::Corrupted { .. })
        ));
    }
}
