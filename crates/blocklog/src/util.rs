//! Offline maintenance utilities for block log directories.
//!
//! These operate on directories holding a monolithic head chunk
//! (`blocks.log` + `blocks.index`) and/or sealed `blocks-<lo>-<hi>` chunks,
//! the same layouts the live [`crate::BlockLog`] produces.

use crate::log::{decode_block, scan_chunks, Chunk};
use crate::{BlockLogError, BlockLogResult};
use fincore_types::BlockNum;
use std::fs;
use std::path::Path;
use tracing::info;

/// Split a monolithic `blocks.log` into stride-aligned chunk files.
///
/// Chunk boundaries fall on multiples of `stride`; the final, possibly
/// partial chunk is written as well.
pub fn split_blocklog(src: &Path, dst: &Path, stride: u32) -> BlockLogResult<()> {
    let chunk = Chunk::read(&src.join("blocks.log"), &src.join("blocks.index"))?;
    fs::create_dir_all(dst).map_err(|source| BlockLogError::Io {
        path: dst.to_path_buf(),
        source,
    })?;

    let mut piece = Chunk::empty(chunk.first_block);
    for (i, payload) in chunk.payloads.iter().enumerate() {
        let block_num = chunk.first_block + i as u32;
        if piece.payloads.is_empty() {
            piece.first_block = block_num;
        }
        piece.payloads.push(payload.clone());
        let chunk_complete = block_num % stride == 0;
        if chunk_complete {
            write_piece(dst, &piece)?;
            piece = Chunk::empty(block_num + 1);
        }
    }
    if !piece.payloads.is_empty() {
        write_piece(dst, &piece)?;
    }
    Ok(())
}

fn write_piece(dst: &Path, piece: &Chunk) -> BlockLogResult<()> {
    let first = piece.first_block;
    let last = piece.last_block().expect("piece is non-empty");
    piece.write(
        &dst.join(format!("blocks-{first}-{last}.log")),
        &dst.join(format!("blocks-{first}-{last}.index")),
    )?;
    info!(first, last, "wrote chunk");
    Ok(())
}

/// Merge a directory of sealed chunks back into one monolithic
/// `blocks.log`/`blocks.index` in `dst`.
///
/// The chunks must form a contiguous block range.
pub fn merge_blocklogs(src: &Path, dst: &Path) -> BlockLogResult<()> {
    let ranges = scan_chunks(src)?;
    let Some(first_range) = ranges.first() else {
        return Err(BlockLogError::RangeNotFound {
            path: src.to_path_buf(),
            first: 0,
            last: 0,
        });
    };

    let mut merged = Chunk::empty(first_range.first);
    let mut expected = first_range.first;
    for range in &ranges {
        if range.first != expected {
            return Err(BlockLogError::IndexMismatch {
                path: src.to_path_buf(),
                message: format!(
                    "chunk gap: expected chunk starting at {expected}, found {}",
                    range.first
                ),
            });
        }
        let chunk = Chunk::read(
            &src.join(range.log_name()),
            &src.join(range.index_name()),
        )?;
        if chunk.first_block != range.first {
            return Err(BlockLogError::IndexMismatch {
                path: src.to_path_buf(),
                message: format!(
                    "chunk {} claims first block {}",
                    range.log_name(),
                    chunk.first_block
                ),
            });
        }
        merged.payloads.extend(chunk.payloads);
        expected = range.last + 1;
    }

    fs::create_dir_all(dst).map_err(|source| BlockLogError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    merged.write(&dst.join("blocks.log"), &dst.join("blocks.index"))?;
    info!(
        first = merged.first_block,
        count = merged.payloads.len(),
        "merged block log"
    );
    Ok(())
}

/// Copy a monolithic log, dropping every block before `new_first`.
pub fn trim_blocklog_front(src: &Path, dst: &Path, new_first: BlockNum) -> BlockLogResult<()> {
    let chunk = Chunk::read(&src.join("blocks.log"), &src.join("blocks.index"))?;
    let last = chunk.last_block().ok_or(BlockLogError::RangeNotFound {
        path: src.to_path_buf(),
        first: new_first,
        last: new_first,
    })?;
    if new_first < chunk.first_block || new_first > last {
        return Err(BlockLogError::RangeNotFound {
            path: src.to_path_buf(),
            first: new_first,
            last,
        });
    }

    let skip = (new_first - chunk.first_block) as usize;
    let trimmed = Chunk {
        first_block: new_first,
        payloads: chunk.payloads[skip..].to_vec(),
    };
    fs::create_dir_all(dst).map_err(|source| BlockLogError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    trimmed.write(&dst.join("blocks.log"), &dst.join("blocks.index"))?;
    Ok(())
}

/// Truncate a monolithic log in place so `new_last` is its final block.
pub fn trim_blocklog_end(dir: &Path, new_last: BlockNum) -> BlockLogResult<()> {
    let chunk = Chunk::read(&dir.join("blocks.log"), &dir.join("blocks.index"))?;
    let last = chunk.last_block().ok_or(BlockLogError::RangeNotFound {
        path: dir.to_path_buf(),
        first: new_last,
        last: new_last,
    })?;
    if new_last < chunk.first_block || new_last > last {
        return Err(BlockLogError::RangeNotFound {
            path: dir.to_path_buf(),
            first: chunk.first_block,
            last,
        });
    }

    let keep = (new_last - chunk.first_block + 1) as usize;
    let trimmed = Chunk {
        first_block: chunk.first_block,
        payloads: chunk.payloads[..keep].to_vec(),
    };
    trimmed.write(&dir.join("blocks.log"), &dir.join("blocks.index"))?;
    Ok(())
}

/// Validate a monolithic log end to end: header, CRCs, index agreement,
/// decodability, sequential numbering from `first_block`, and parent-id
/// linkage. Returns the validated `(first, last)` range.
pub fn smoke_test(dir: &Path, first_block: BlockNum) -> BlockLogResult<(BlockNum, BlockNum)> {
    let log_path = dir.join("blocks.log");
    let chunk = Chunk::read(&log_path, &dir.join("blocks.index"))?;
    if chunk.first_block != first_block {
        return Err(BlockLogError::IndexMismatch {
            path: log_path,
            message: format!(
                "log starts at block {}, expected {first_block}",
                chunk.first_block
            ),
        });
    }
    let last = chunk.last_block().ok_or(BlockLogError::RangeNotFound {
        path: log_path.clone(),
        first: first_block,
        last: first_block,
    })?;

    let mut prev_id = None;
    for (i, payload) in chunk.payloads.iter().enumerate() {
        let block_num = chunk.first_block + i as u32;
        let block = decode_block(&log_path, block_num, payload)?;
        if let Some(prev_id) = prev_id {
            if block.signed_header.header.previous != prev_id {
                return Err(BlockLogError::BadBlock {
                    path: log_path.clone(),
                    block_num,
                    message: "parent id does not match preceding block".to_string(),
                });
            }
        }
        prev_id = Some(block.id());
    }
    info!(first = first_block, last, "block log smoke test passed");
    Ok((first_block, last))
}
