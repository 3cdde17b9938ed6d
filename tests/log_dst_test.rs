//! Segmented log DST integration tests
//!
//! Multi-seed deterministic simulation of the append path with disk fault
//! injection and crash simulation, plus a file-backed recovery check.

use flowcore::config::LogConfig;
use flowcore::storage::dst::{run_log_dst_batch, summarize_log_dst_batch, LogDSTConfig};
use flowcore::storage::{
    BlockIter, LocalSegmentStore, LogStorage, SegmentedLogStorage, SimulatedSegmentStoreConfig,
};
use std::sync::Arc;

#[test]
fn test_log_dst_50_seeds_no_faults() {
    // INVARIANT: with no faults and no crash every block is acknowledged and recovered.
    let results = run_log_dst_batch(0..50, LogDSTConfig::baseline());
    let summary = summarize_log_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.acknowledged_writes, r.total_writes, "Seed {}", r.seed);
        assert_eq!(r.recovered_blocks, r.total_writes, "Seed {}", r.seed);
    }

    println!("{}", summary);
}

#[test]
fn test_log_dst_50_seeds_crash() {
    // INVARIANT: every acknowledged block survives a crash at its address.
    let results = run_log_dst_batch(0..50, LogDSTConfig::crash_only());
    let summary = summarize_log_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.missing_after_recovery, 0, "Seed {}", r.seed);
    }

    println!("{}", summary);
}

#[test]
fn test_log_dst_50_seeds_with_faults() {
    // Failed writes are never acknowledged, so they may be missing; torn
    // writes must never surface as blocks.
    let config = LogDSTConfig {
        store_config: SimulatedSegmentStoreConfig::default(),
        ..Default::default()
    };

    let results = run_log_dst_batch(0..50, config);
    let summary = summarize_log_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }

    println!("{}", summary);
}

#[test]
fn test_log_dst_high_chaos() {
    let results = run_log_dst_batch(0..20, LogDSTConfig::chaos());
    let summary = summarize_log_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }

    println!("{}", summary);
}

#[test]
fn test_file_backed_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
        dir: dir.path().to_path_buf(),
        segment_size: 1024,
        disk_budget: 1024 * 64,
        ..LogConfig::test()
    };
    let blocks: Vec<Vec<u8>> = (0..60)
        .map(|i| format!("record-{:04}-{}", i, "x".repeat(i % 40)).into_bytes())
        .collect();

    {
        let store = LocalSegmentStore::new(config.dir.clone(), config.disk_budget).unwrap();
        let log = SegmentedLogStorage::new(1, Arc::new(store), config.clone());
        log.open().unwrap();
        for block in &blocks {
            log.append(block).unwrap();
        }
        assert!(log.active_segment_id().unwrap() > 1);
        log.close();
    }

    let store = LocalSegmentStore::new(config.dir.clone(), config.disk_budget).unwrap();
    let log = SegmentedLogStorage::new(1, Arc::new(store), config.clone());
    log.open().unwrap();

    let mut recovered = Vec::new();
    let mut buf = vec![0u8; config.segment_size as usize];
    let mut address = log.first_block_address().unwrap();
    while let Ok(batch) = log.read(&mut buf, address) {
        recovered.extend(BlockIter::new(&buf[..batch.len]).map(|b| b.to_vec()));
        address = batch.next_address;
    }
    assert_eq!(recovered, blocks);

    // appends continue after the recovered tail
    let address = log.append(b"after-reopen").unwrap();
    assert!(address > 0);
    log.close();
}
