//! Segmented log deterministic simulation harness.
//!
//! Verifies the log's durability guarantees under disk fault injection:
//!
//! - **Block atomicity**: a recovered log contains only whole blocks that
//!   were submitted; torn or failed writes never surface as data
//! - **Acknowledged durability**: every acknowledged block survives a crash
//!   at the address it was acknowledged with
//! - **Rotation**: blocks that span many segments come back in append order
//!
//! ## Methodology
//!
//! 1. Open a log over `SimulatedSegmentStore` (buggify write/fsync faults)
//! 2. Append blocks of random size, recording acknowledged addresses
//! 3. Crash at a random point (unsynced bytes are dropped)
//! 4. Reopen over the raw store (no faults) and compare against the shadow

use super::log_storage::{split_address, LogStorage};
use super::segment::{decode_frame, FrameDecode, FRAME_OVERHEAD};
use super::segment_store::{
    InMemorySegmentStore, SimulatedSegmentStore, SimulatedSegmentStoreConfig,
    SimulatedSegmentStoreStats,
};
use super::segmented_log::SegmentedLogStorage;
use crate::buggify::{self, FaultConfig};
use crate::config::LogConfig;
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct LogDSTResult {
    pub seed: u64,
    pub total_writes: usize,
    pub acknowledged_writes: usize,
    pub failed_writes: usize,
    pub recovered_blocks: usize,
    pub missing_after_recovery: usize,
    pub segments_used: u64,
    pub store_stats: SimulatedSegmentStoreStats,
    pub fault_triggers: u64,
    pub passed: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogDSTConfig {
    pub num_writes: usize,
    /// Small so that rotation happens every few blocks
    pub segment_size: u64,
    pub store_config: SimulatedSegmentStoreConfig,
    pub simulate_crash: bool,
}

impl Default for LogDSTConfig {
    fn default() -> Self {
        LogDSTConfig {
            num_writes: 100,
            segment_size: 512,
            store_config: SimulatedSegmentStoreConfig::default(),
            simulate_crash: true,
        }
    }
}

impl LogDSTConfig {
    /// No faults, no crash
    pub fn baseline() -> Self {
        LogDSTConfig {
            store_config: SimulatedSegmentStoreConfig::no_faults(),
            simulate_crash: false,
            ..Default::default()
        }
    }

    pub fn crash_only() -> Self {
        LogDSTConfig {
            store_config: SimulatedSegmentStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn chaos() -> Self {
        LogDSTConfig {
            num_writes: 200,
            store_config: SimulatedSegmentStoreConfig::high_chaos(),
            ..Default::default()
        }
    }

    fn log_config(&self) -> LogConfig {
        LogConfig {
            segment_size: self.segment_size,
            disk_budget: self.segment_size.saturating_mul(4096),
            allocation_backoff: Duration::from_micros(200),
            ..LogConfig::test()
        }
    }
}

pub struct LogDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: LogDSTConfig,
}

impl LogDSTHarness {
    pub fn new(seed: u64, config: LogDSTConfig) -> Self {
        LogDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
        }
    }

    fn block(&mut self, index: usize, max: usize) -> Vec<u8> {
        let mut block = format!("blk-{}-{}:", self.seed, index).into_bytes();
        let target = self.rng.gen_range(block.len() as u64, max as u64 + 1) as usize;
        while block.len() < target {
            block.push(b'a' + (self.rng.gen_range(0, 26) as u8));
        }
        block
    }

    pub fn run(&mut self) -> LogDSTResult {
        buggify::set_config(FaultConfig::new());
        buggify::reset_stats();
        let store = SimulatedSegmentStore::new(
            self.rng.fork(),
            self.config.log_config().disk_budget,
            self.config.store_config.clone(),
        );
        let raw_store = store.inner_store().clone();

        let mut result = LogDSTResult {
            seed: self.seed,
            total_writes: self.config.num_writes,
            acknowledged_writes: 0,
            failed_writes: 0,
            recovered_blocks: 0,
            missing_after_recovery: 0,
            segments_used: 0,
            store_stats: SimulatedSegmentStoreStats::default(),
            fault_triggers: 0,
            passed: false,
            error_message: None,
        };

        let log = SegmentedLogStorage::new(0, Arc::new(store.clone()), self.config.log_config());
        if let Err(e) = log.open() {
            result.error_message = Some(format!("open failed: {}", e));
            return result;
        }

        let max_block = (log.max_block_size() / 2).max(16);
        let crash_at = if self.config.simulate_crash {
            self.rng
                .gen_range(1, (self.config.num_writes as u64).saturating_add(1)) as usize
        } else {
            usize::MAX
        };

        let mut acked: Vec<(i64, Vec<u8>)> = Vec::new();
        let mut submitted: HashSet<Vec<u8>> = HashSet::new();
        for i in 0..self.config.num_writes {
            if i == crash_at {
                raw_store.simulate_crash();
                break;
            }
            let block = self.block(i, max_block);
            submitted.insert(block.clone());
            match log.append(&block) {
                Ok(address) => acked.push((address, block)),
                Err(e) if e.is_fatal() => {
                    result.error_message = Some(format!("writer halted: {}", e));
                    break;
                }
                Err(_) => result.failed_writes += 1,
            }
        }
        if self.config.simulate_crash && crash_at >= self.config.num_writes {
            raw_store.simulate_crash();
        }
        result.segments_used = log.active_segment_id().unwrap_or(0);
        log.close();
        drop(log);
        result.acknowledged_writes = acked.len();
        result.store_stats = store.stats();
        result.fault_triggers = buggify::get_stats().total_triggers();

        // recovery reads the raw store: read faults are out of scope here
        let recovered = match recover_blocks(raw_store, self.config.log_config()) {
            Ok(blocks) => blocks,
            Err(e) => {
                result.missing_after_recovery = acked.len();
                result.error_message = Some(format!("recovery failed: {}", e));
                return result;
            }
        };
        result.recovered_blocks = recovered.len();

        let unexpected = recovered
            .iter()
            .filter(|(_, b)| !submitted.contains(b))
            .count();
        let recovered_at: std::collections::HashMap<i64, &Vec<u8>> =
            recovered.iter().map(|(a, b)| (*a, b)).collect();
        let missing: Vec<i64> = acked
            .iter()
            .filter(|(address, block)| recovered_at.get(address) != Some(&block))
            .map(|(address, _)| *address)
            .collect();
        result.missing_after_recovery = missing.len();

        let ordered = recovered.windows(2).all(|w| w[0].0 < w[1].0);
        result.passed = missing.is_empty() && unexpected == 0 && ordered;
        if !result.passed {
            result.error_message = Some(format!(
                "INVARIANT VIOLATION: {} acked blocks missing (first: {:?}), {} unexpected blocks, ordered: {}",
                missing.len(),
                missing.first().map(|a| split_address(*a)),
                unexpected,
                ordered
            ));
        }
        result
    }
}

/// Reopen a log over `store` and return every readable `(address, block)`.
pub fn recover_blocks(
    store: InMemorySegmentStore,
    config: LogConfig,
) -> Result<Vec<(i64, Vec<u8>)>, String> {
    let log = SegmentedLogStorage::new(0, Arc::new(store), config);
    log.open().map_err(|e| e.to_string())?;
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; log.config().segment_size as usize];
    let Ok(mut address) = log.first_block_address() else {
        return Ok(blocks);
    };
    while let Ok(batch) = log.read(&mut buf, address) {
        let mut block_address = batch.next_address - batch.len as i64;
        let mut pos = 0;
        while let FrameDecode::Complete { len, total } = decode_frame(&buf[pos..batch.len]) {
            blocks.push((
                block_address,
                buf[pos + FRAME_OVERHEAD..pos + FRAME_OVERHEAD + len].to_vec(),
            ));
            pos += total;
            block_address += total as i64;
        }
        address = batch.next_address;
    }
    log.close();
    Ok(blocks)
}

pub fn run_log_dst_batch(seeds: std::ops::Range<u64>, config: LogDSTConfig) -> Vec<LogDSTResult> {
    seeds
        .map(|seed| LogDSTHarness::new(seed, config.clone()).run())
        .collect()
}

pub fn summarize_log_dst_batch(results: &[LogDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let acked: usize = results.iter().map(|r| r.acknowledged_writes).sum();
    let failed_writes: usize = results.iter().map(|r| r.failed_writes).sum();
    let recovered: usize = results.iter().map(|r| r.recovered_blocks).sum();
    let missing: usize = results.iter().map(|r| r.missing_after_recovery).sum();

    let mut summary = format!(
        "Log DST Batch: {}/{} passed\n\
         Acknowledged: {}, Failed: {}, Recovered: {}, Missing: {}",
        passed, total, acked, failed_writes, recovered, missing
    );
    for r in results.iter().filter(|r| !r.passed) {
        summary.push_str(&format!(
            "\n  Seed {}: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_single_seed() {
        let result = LogDSTHarness::new(1, LogDSTConfig::baseline()).run();
        assert!(result.passed, "{:?}", result.error_message);
        assert_eq!(result.acknowledged_writes, 100);
        assert_eq!(result.recovered_blocks, 100);
        assert!(result.segments_used > 1);
    }

    #[test]
    fn test_crash_single_seed() {
        let result = LogDSTHarness::new(5, LogDSTConfig::crash_only()).run();
        assert!(result.passed, "{:?}", result.error_message);
        assert_eq!(result.missing_after_recovery, 0);
    }
}
