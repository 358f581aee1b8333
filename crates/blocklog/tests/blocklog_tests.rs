//! Partitioned block log round-trips, retention, and corruption handling.

use fincore_blocklog::{
    merge_blocklogs, smoke_test, split_blocklog, trim_blocklog_end, trim_blocklog_front, BlockLog,
    BlockLogConfig, BlockLogError,
};
use fincore_crypto::Digest;
use fincore_types::{
    BlockHeader, BlockId, BlockTimestamp, SignedBlock, SignedBlockHeader, HS_BLOCK_CONFIRMED,
};
use std::fs;

/// A chain of syntactically valid blocks linked by id, numbered from 1.
fn make_chain(count: u32) -> Vec<SignedBlock> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut previous = BlockId::default();
    for i in 0..count {
        let header = BlockHeader {
            timestamp: BlockTimestamp::new(i + 1),
            producer: "alpha".parse().unwrap(),
            confirmed: HS_BLOCK_CONFIRMED,
            previous,
            transaction_mroot: Digest::hash(&i.to_le_bytes()),
            action_mroot: Digest::ZERO,
            schedule_version: 0,
            header_extensions: Vec::new(),
        };
        previous = header.calculate_id();
        blocks.push(SignedBlock {
            signed_header: SignedBlockHeader::unsigned(header),
            qc: None,
        });
    }
    blocks
}

#[test]
fn test_partitioned_round_trip_with_retention() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlockLogConfig {
        dir: dir.path().to_path_buf(),
        stride: 20,
        retained_dir: None,
        archive_dir: Some("archive".into()),
        max_retained_files: 5,
    };

    let mut log = BlockLog::open(config.clone()).unwrap();
    let chain = make_chain(150);
    for block in &chain {
        log.append(block).unwrap();
    }

    // chunks 1-20 and 21-40 were evicted to the archive; the retained set
    // is exactly the five chunks ending at the head chunk
    let archive = dir.path().join("archive");
    for (first, last) in [(1, 20), (21, 40)] {
        assert!(archive.join(format!("blocks-{first}-{last}.log")).exists());
        assert!(archive.join(format!("blocks-{first}-{last}.index")).exists());
    }
    for (first, last) in [(41, 60), (61, 80), (81, 100), (101, 120), (121, 140)] {
        assert!(dir.path().join(format!("blocks-{first}-{last}.log")).exists());
        assert!(dir.path().join(format!("blocks-{first}-{last}.index")).exists());
    }
    assert_eq!(log.retained_chunks().len(), 5);

    // archived blocks are no longer served
    assert!(log.fetch(40).unwrap().is_none());

    // every block in the retained range and the head chunk is served with
    // the right number
    for n in [41, 50, 60, 81, 90, 100, 121, 130, 140, 141, 145, 150] {
        let block = log.fetch(n).unwrap().unwrap_or_else(|| panic!("block {n}"));
        assert_eq!(block.block_num(), n);
    }

    // nothing outside the produced range
    assert!(log.fetch(160).unwrap().is_none());
}

#[test]
fn test_reopen_resumes_appending() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlockLogConfig::new(dir.path(), 20);
    let chain = make_chain(50);

    {
        let mut log = BlockLog::open(config.clone()).unwrap();
        for block in &chain[..30] {
            log.append(block).unwrap();
        }
    }

    let mut log = BlockLog::open(config).unwrap();
    assert_eq!(log.block_range(), Some((1, 30)));
    for block in &chain[30..] {
        log.append(block).unwrap();
    }
    assert_eq!(log.block_range(), Some((1, 50)));
    assert_eq!(log.fetch(7).unwrap().unwrap().block_num(), 7);
    assert_eq!(log.fetch(50).unwrap().unwrap().block_num(), 50);
}

#[test]
fn test_non_sequential_append_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = BlockLog::open(BlockLogConfig::new(dir.path(), 20)).unwrap();
    let chain = make_chain(5);

    log.append(&chain[0]).unwrap();
    let err = log.append(&chain[2]).unwrap_err();
    assert!(matches!(
        err,
        BlockLogError::NonSequentialAppend {
            expected: 2,
            got: 3
        }
    ));
}

#[test]
fn test_corrupted_index_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlockLogConfig::new(dir.path(), 100);
    {
        let mut log = BlockLog::open(config.clone()).unwrap();
        for block in &make_chain(10) {
            log.append(block).unwrap();
        }
    }

    // flip a byte inside an index offset
    let index_path = dir.path().join("blocks.index");
    let mut data = fs::read(&index_path).unwrap();
    let len = data.len();
    data[len - 3] ^= 0xff;
    fs::write(&index_path, &data).unwrap();

    let err = BlockLog::open(config).unwrap_err();
    assert!(matches!(err, BlockLogError::IndexMismatch { .. }));
}

#[test]
fn test_corrupted_log_entry_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlockLogConfig::new(dir.path(), 100);
    {
        let mut log = BlockLog::open(config.clone()).unwrap();
        for block in &make_chain(10) {
            log.append(block).unwrap();
        }
    }

    // damage a payload byte in the middle of the log
    let log_path = dir.path().join("blocks.log");
    let mut data = fs::read(&log_path).unwrap();
    let mid = data.len() / 2;
    data[mid] ^= 0xff;
    fs::write(&log_path, &data).unwrap();

    let err = BlockLog::open(config).unwrap_err();
    assert!(matches!(err, BlockLogError::Corrupted { .. }));
}

#[test]
fn test_bad_magic_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = BlockLogConfig::new(dir.path(), 100);
    {
        let mut log = BlockLog::open(config.clone()).unwrap();
        for block in &make_chain(3) {
            log.append(block).unwrap();
        }
    }

    let log_path = dir.path().join("blocks.log");
    let mut data = fs::read(&log_path).unwrap();
    data[0] = b'X';
    fs::write(&log_path, &data).unwrap();

    assert!(matches!(
        BlockLog::open(config),
        Err(BlockLogError::InvalidMagic(_))
    ));
}

#[test]
fn test_split_then_merge_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let split_dir = tempfile::tempdir().unwrap();
    let merged_dir = tempfile::tempdir().unwrap();
    let chain = make_chain(125);

    // a monolithic log (stride larger than the chain)
    {
        let mut log = BlockLog::open(BlockLogConfig::new(src.path(), 1000)).unwrap();
        for block in &chain {
            log.append(block).unwrap();
        }
    }

    split_blocklog(src.path(), split_dir.path(), 50).unwrap();
    for name in [
        "blocks-1-50.log",
        "blocks-51-100.log",
        "blocks-101-125.log",
    ] {
        assert!(split_dir.path().join(name).exists(), "{name}");
    }

    merge_blocklogs(split_dir.path(), merged_dir.path()).unwrap();
    assert_eq!(smoke_test(merged_dir.path(), 1).unwrap(), (1, 125));

    // merged content is identical to the original
    let original = fs::read(src.path().join("blocks.log")).unwrap();
    let merged = fs::read(merged_dir.path().join("blocks.log")).unwrap();
    assert_eq!(original, merged);
}

#[test]
fn test_trim_front_and_end() {
    let src = tempfile::tempdir().unwrap();
    let trimmed_dir = tempfile::tempdir().unwrap();
    let chain = make_chain(40);
    {
        let mut log = BlockLog::open(BlockLogConfig::new(src.path(), 1000)).unwrap();
        for block in &chain {
            log.append(block).unwrap();
        }
    }

    trim_blocklog_front(src.path(), trimmed_dir.path(), 11).unwrap();
    assert_eq!(smoke_test(trimmed_dir.path(), 11).unwrap(), (11, 40));

    trim_blocklog_end(trimmed_dir.path(), 25).unwrap();
    assert_eq!(smoke_test(trimmed_dir.path(), 11).unwrap(), (11, 25));

    // out-of-range trims are rejected
    assert!(trim_blocklog_end(trimmed_dir.path(), 30).is_err());
    assert!(trim_blocklog_front(src.path(), trimmed_dir.path(), 99).is_err());
}

#[test]
fn test_smoke_test_detects_broken_linkage() {
    let dir = tempfile::tempdir().unwrap();
    let chain = make_chain(10);
    {
        let mut log = BlockLog::open(BlockLogConfig::new(dir.path(), 1000)).unwrap();
        for block in &chain {
            log.append(block).unwrap();
        }
    }
    assert_eq!(smoke_test(dir.path(), 1).unwrap(), (1, 10));
    assert!(smoke_test(dir.path(), 2).is_err());
}
