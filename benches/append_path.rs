//! Append and distribution hot paths.
//!
//! Run with: `cargo bench --bench append_path`
//! Compare baselines: `cargo bench --bench append_path -- --baseline main`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use flowcore::config::LogConfig;
use flowcore::distribution::{DistributionRecord, DistributionState, ValueType};
use flowcore::snapshot::SnapshotChunk;
use flowcore::storage::{InMemorySegmentStore, LogStorage, SegmentedLogStorage};
use flowcore::transport::PushDeploymentRequest;
use bytes::Bytes;
use std::sync::Arc;

const SEGMENT_SIZE: u64 = 1024 * 1024;

fn open_log() -> SegmentedLogStorage<InMemorySegmentStore> {
    let config = LogConfig {
        segment_size: SEGMENT_SIZE,
        disk_budget: SEGMENT_SIZE * 64,
        ..LogConfig::test()
    };
    let log = SegmentedLogStorage::new(1, Arc::new(InMemorySegmentStore::new(config.disk_budget)), config);
    log.open().expect("open bench log");
    log
}

/// SegmentedLogStorage::append across rotations, with filled segments
/// deleted so the budget is never exhausted
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");

    for block_len in [64usize, 1024, 16 * 1024] {
        let block = vec![b'x'; block_len];
        group.throughput(Throughput::Bytes(block_len as u64));
        group.bench_function(format!("block_{}", block_len), |b| {
            let log = open_log();
            let mut appended = 0u64;
            b.iter(|| {
                let address = log.append(black_box(&block)).expect("append");
                appended += 1;
                if appended % 1024 == 0 {
                    log.delete(address).expect("retention");
                }
                address
            });
            log.close();
        });
    }

    group.finish();
}

fn bench_push_request_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_request");
    let record = DistributionRecord::new(42, 1, ValueType::Deployment, "CREATE", vec![b'b'; 2048]);
    let payload = Bytes::from(bincode::serialize(&record).expect("encode record"));
    let request = PushDeploymentRequest {
        deployment_key: 42,
        partition_id: 3,
        payload,
    };
    let encoded = request.encode();

    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(&request).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| PushDeploymentRequest::decode(black_box(encoded.clone())))
    });
    group.finish();
}

fn bench_snapshot_chunk_codec(c: &mut Criterion) {
    let chunk = SnapshotChunk::new("1-100", 8, "0.chunk", Bytes::from(vec![7u8; 64 * 1024]), 0, 512 * 1024);
    let encoded = chunk.encode();

    let mut group = c.benchmark_group("snapshot_chunk");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(&chunk).encode()));
    group.bench_function("decode_verify", |b| {
        b.iter(|| {
            let decoded = SnapshotChunk::decode(black_box(encoded.clone())).expect("decode");
            decoded.verify().expect("checksum");
        })
    });
    group.finish();
}

/// Pending bookkeeping for one distribution to 8 partitions
fn bench_distribution_state(c: &mut Criterion) {
    let record = DistributionRecord::new(1, 1, ValueType::Deployment, "CREATE", vec![b'b'; 256]);

    c.bench_function("distribution_state_lifecycle", |b| {
        b.iter_batched(
            DistributionState::in_memory,
            |mut state| {
                state.add_command_distribution(1, &record).expect("add");
                for partition in 2..=8 {
                    state.add_pending_distribution(1, partition);
                    state.add_retriable_distribution(1, partition);
                }
                for partition in 2..=8 {
                    state.remove_retriable_distribution(1, partition);
                    state.remove_pending_distribution(1, partition);
                }
                state.remove_command_distribution(1);
                state
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_log_append,
    bench_push_request_codec,
    bench_snapshot_chunk_codec,
    bench_distribution_state
);
criterion_main!(benches);
