//! flowcore demo node
//!
//! Runs a three-partition cluster in one process:
//!
//! 1. appends records to partition 1's segmented log
//! 2. distributes a deployment from partition 1 while partition 3 has no
//!    known leader, then elects one
//! 3. replicates a snapshot of the in-flight distribution state to a follower
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FLOWCORE_CONFIG | - | TOML config file |
//! | FLOWCORE_LOG_DIR | /tmp/flowcore/log | Segment directory |
//! | FLOWCORE_LOG_LEVEL | info | Default tracing filter |
//! | RUST_LOG | - | Overrides the tracing filter |

use flowcore::config::EngineConfig;
use flowcore::distribution::{
    DistributionKey, DistributionRecord, DistributionState, InMemoryKvStore, ValueType,
};
use flowcore::distributor::{
    spawn_distributor, ApplyError, ApplyOutcome, CommandApplier, CommandRedistributor,
    DeploymentPusher, InterPartitionReceiver,
};
use flowcore::observability::init_tracing;
use flowcore::snapshot::{SnapshotAssembler, SnapshotChunker, SnapshotReplication};
use flowcore::storage::{spawn_appender, LocalSegmentStore, LogStorage, SegmentedLogStorage};
use flowcore::topology::{BrokerId, PartitionId, TopologyView};
use flowcore::transport::LocalCluster;
use flowcore::DistributionBehavior;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SOURCE_PARTITION: PartitionId = 1;
const DEPLOYMENT_KEY: DistributionKey = 2_251_799_813_685_249;

#[derive(Default)]
struct DeploymentRepository {
    deployed: Mutex<Vec<(PartitionId, DistributionKey)>>,
}

impl CommandApplier for DeploymentRepository {
    fn apply(&self, partition: PartitionId, record: &DistributionRecord) -> Result<ApplyOutcome, ApplyError> {
        let mut deployed = self.deployed.lock();
        if deployed.contains(&(partition, record.distribution_key)) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        info!(
            "partition {}: deployed {} ({} bytes)",
            partition,
            record.distribution_key,
            record.command_value.len()
        );
        deployed.push((partition, record.distribution_key));
        Ok(ApplyOutcome::Applied)
    }
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    records_appended: usize,
    last_address: i64,
    distribution_key: DistributionKey,
    deployed_on: Vec<PartitionId>,
    push_attempts: u64,
    snapshot_bytes: usize,
    snapshot_chunks: usize,
    follower_pending_partitions: Vec<PartitionId>,
    elapsed_ms: u128,
}

fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match std::env::var("FLOWCORE_CONFIG") {
        Ok(path) => EngineConfig::from_file(&PathBuf::from(path))?,
        Err(_) => EngineConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load_config()?;
    init_tracing(&config.logging);
    let started = Instant::now();

    println!("flowcore demo");
    println!("=============");
    println!("  Partitions: {}", config.node.partition_count);
    println!("  Log dir: {}", config.log.dir.display());
    println!("  Segment size: {} bytes", config.log.segment_size);
    println!();

    // ---- partition log ----
    let store = LocalSegmentStore::new(
        config.log.dir.join(format!("partition-{}", SOURCE_PARTITION)),
        config.log.disk_budget,
    )?;
    let log = Arc::new(SegmentedLogStorage::new(
        SOURCE_PARTITION,
        Arc::new(store),
        config.log.clone(),
    ));
    log.open()?;
    let (appender, appender_task) = spawn_appender(Arc::clone(&log));

    let mut last_address = 0;
    let records_appended = 16;
    for i in 0..records_appended {
        last_address = appender
            .append(format!("process-instance-created:{}", i).into_bytes())
            .await?;
    }
    info!("appended {} records, last at {}", records_appended, last_address);

    // ---- cluster ----
    let cluster = LocalCluster::new();
    let partitions: Vec<PartitionId> = (1..=config.node.partition_count.max(1)).collect();
    let brokers: Vec<BrokerId> = partitions.clone();
    let topology = TopologyView::round_robin(config.node.partition_count.max(1), &brokers);
    let repository = Arc::new(DeploymentRepository::default());
    for &broker in &brokers {
        InterPartitionReceiver::new(
            Arc::new(cluster.join(broker)),
            topology.clone(),
            Arc::clone(&repository),
        )
        .register();
    }

    // partition 3 is mid-election when the deployment starts
    let electing = partitions.last().copied().filter(|p| *p != SOURCE_PARTITION);
    if let Some(partition) = electing {
        topology.remove_leader(partition);
    }

    let behavior = DistributionBehavior::new(
        SOURCE_PARTITION,
        partitions.clone(),
        DistributionState::in_memory(),
        appender.clone(),
    );
    let pusher = DeploymentPusher::new(
        Arc::new(cluster.join(SOURCE_PARTITION)),
        topology.clone(),
        config.distribution.clone(),
    );
    let (distributor, distributor_task) = spawn_distributor(behavior, pusher);
    let redistributor_cancel = CancellationToken::new();
    let redistributor = CommandRedistributor::new(distributor.clone(), &config.distribution)
        .spawn(redistributor_cancel.clone());

    let record = DistributionRecord::new(
        DEPLOYMENT_KEY,
        SOURCE_PARTITION,
        ValueType::Deployment,
        "CREATE",
        b"<bpmn:process id=\"order\"/>".to_vec(),
    )
    .with_queue("deployment");
    let targets = distributor.distribute(record).await?;
    info!("distribution {} started towards {:?}", DEPLOYMENT_KEY, targets);

    // ---- snapshot of the in-flight state, replicated to a follower ----
    let snapshot = distributor.snapshot().await?;
    let snapshot_id = format!("{}-{}", SOURCE_PARTITION, last_address);
    let chunks = SnapshotChunker::new(config.snapshot.chunk_size).split(&snapshot_id, &snapshot);

    let leader_channel = SnapshotReplication::new(
        Arc::new(cluster.join(SOURCE_PARTITION)),
        SOURCE_PARTITION,
        config.snapshot.clone(),
    );
    let follower_channel = SnapshotReplication::new(
        Arc::new(cluster.join(brokers.len() as BrokerId + 1)),
        SOURCE_PARTITION,
        config.snapshot.clone(),
    );
    let (assembled_tx, assembled_rx) = oneshot::channel();
    let mut assembled_tx = Some(assembled_tx);
    let mut assembler = SnapshotAssembler::new();
    follower_channel.consume(move |chunk| match assembler.accept(chunk) {
        Ok(Some(bytes)) => {
            if let Some(tx) = assembled_tx.take() {
                let _ = tx.send(bytes);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("follower rejected snapshot chunk: {}", e),
    })?;
    for chunk in &chunks {
        leader_channel.replicate(chunk);
    }
    let replicated = tokio::time::timeout(Duration::from_secs(5), assembled_rx).await??;
    let follower_state = DistributionState::from_snapshot_bytes(InMemoryKvStore::new(), &replicated)?;
    let follower_pending_partitions = follower_state.pending_partitions(DEPLOYMENT_KEY);
    follower_channel.close();
    leader_channel.close();

    // ---- leader elected, distribution completes ----
    tokio::time::sleep(config.distribution.retry_backoff).await;
    if let Some(partition) = electing {
        topology.set_leader(partition, brokers[0]);
        info!("partition {}: broker {} elected", partition, brokers[0]);
    }

    let deadline = Instant::now() + config.distribution.push_timeout * 2;
    let stats = loop {
        let stats = distributor.stats().await?;
        if stats.pending == 0 && stats.in_flight == 0 {
            break stats;
        }
        if Instant::now() >= deadline {
            warn!("distribution {} still pending: {:?}", DEPLOYMENT_KEY, stats);
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    redistributor_cancel.cancel();
    let _ = redistributor.await;
    distributor.shutdown().await;
    let _ = distributor_task.await;
    appender.flush().await?;
    appender.shutdown().await;
    let _ = appender_task.await;
    log.close();

    let mut deployed_on: Vec<PartitionId> = repository
        .deployed
        .lock()
        .iter()
        .filter(|(_, key)| *key == DEPLOYMENT_KEY)
        .map(|(partition, _)| *partition)
        .collect();
    deployed_on.sort_unstable();

    let summary = DemoSummary {
        records_appended,
        last_address,
        distribution_key: DEPLOYMENT_KEY,
        deployed_on,
        push_attempts: stats.push_attempts,
        snapshot_bytes: snapshot.len(),
        snapshot_chunks: chunks.len(),
        follower_pending_partitions,
        elapsed_ms: started.elapsed().as_millis(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
