//! Command distribution deterministic simulation harness.
//!
//! Drives one source partition distributing commands to every other
//! partition of a `LocalCluster` while the topology and network misbehave.
//!
//! ## Invariants checked
//!
//! - **Completion**: once faults stop, every distribution finishes and the
//!   distribution state is empty
//! - **Exactly-once apply**: each `(K, P)` is applied on `P` exactly once,
//!   never on the source partition
//! - **Queue order**: per `(queue, P)`, commands are applied in the order
//!   they were distributed
//! - **Continuations**: every requested continuation continues exactly once
//! - **Subscription hygiene**: at most one response subscription per
//!   `(K, P)` at any time, none once idle
//!
//! ## Fault model
//!
//! | Fault            | Injection                                        |
//! |------------------|--------------------------------------------------|
//! | packet loss      | `NetworkFaultConfig` on the cluster              |
//! | leader change    | random partition moves to a random broker        |
//! | leaderless       | partition temporarily has no known leader        |
//! | isolation        | broker cut off, later healed                     |
//! | backpressure     | applier answers `RESOURCE_EXHAUSTED`             |
//! | source crash     | distributor stops, restarts from persisted state |

use super::distributor::{spawn_distributor, CommandRedistributor, DistributorHandle};
use super::pusher::DeploymentPusher;
use super::receiver::{ApplyError, ApplyOutcome, CommandApplier, InterPartitionReceiver};
use crate::buggify::{self, faults, FaultConfig};
use crate::config::DistributionConfig;
use crate::distribution::{
    DistributionBehavior, DistributionEvent, DistributionKey, DistributionRecord,
    DistributionState, InMemoryKvStore, RecordingEventSink, ValueType,
};
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::topology::{BrokerId, PartitionId, TopologyView};
use crate::transport::wire::deployment_response_topic;
use crate::transport::{LocalCluster, NetworkFaultConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SOURCE_PARTITION: PartitionId = 1;
const SOURCE_BROKER: BrokerId = 1;
const QUEUES: [&str; 2] = ["deployments", "resources"];

#[derive(Debug, Clone, Default)]
pub struct DistributionDSTResult {
    pub seed: u64,
    pub distributions: usize,
    pub continuations: usize,
    pub applied: usize,
    pub already_applied: u64,
    pub backpressure_rejections: u64,
    pub push_attempts: u64,
    pub leader_changes: u64,
    pub isolations: u64,
    pub crashes: u64,
    /// Buggify sites that fired, network and crash
    pub fault_triggers: u64,
    pub max_subscriptions: usize,
    pub elapsed: Duration,
    pub passed: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DistributionDSTConfig {
    pub num_distributions: usize,
    pub partition_count: u32,
    /// Fraction of distributions that belong to a queue
    pub queued_prob: f64,
    pub continuation_prob: f64,
    pub network: NetworkFaultConfig,
    pub leader_change_prob: f64,
    pub leaderless_prob: f64,
    pub isolate_prob: f64,
    pub backpressure_prob: f64,
    pub crash_prob: f64,
    /// Simulated time between chaos steps
    pub step: Duration,
    pub deadline: Duration,
    pub distribution: DistributionConfig,
}

impl Default for DistributionDSTConfig {
    fn default() -> Self {
        DistributionDSTConfig {
            num_distributions: 20,
            partition_count: 3,
            queued_prob: 0.5,
            continuation_prob: 0.2,
            network: NetworkFaultConfig::none(),
            leader_change_prob: 0.0,
            leaderless_prob: 0.0,
            isolate_prob: 0.0,
            backpressure_prob: 0.0,
            crash_prob: 0.0,
            step: Duration::from_millis(5),
            deadline: Duration::from_secs(30),
            distribution: DistributionConfig::test(),
        }
    }
}

impl DistributionDSTConfig {
    /// Healthy cluster, no faults
    pub fn baseline() -> Self {
        Self::default()
    }

    /// Leaders move around, network is reliable
    pub fn leader_churn() -> Self {
        DistributionDSTConfig {
            leader_change_prob: 0.15,
            leaderless_prob: 0.05,
            ..Default::default()
        }
    }

    pub fn chaos() -> Self {
        DistributionDSTConfig {
            num_distributions: 30,
            network: NetworkFaultConfig {
                packet_drop_prob: 0.05,
                response_drop_prob: 0.05,
                delay_prob: 0.2,
                max_delay: Duration::from_millis(10),
                broadcast_drop_prob: 0.1,
            },
            leader_change_prob: 0.1,
            leaderless_prob: 0.05,
            isolate_prob: 0.05,
            backpressure_prob: 0.1,
            crash_prob: 0.05,
            ..Default::default()
        }
    }
}

/// Partition state shared by every broker: whichever broker leads `P`
/// applies into the same log.
struct SimulatedPartitions {
    rng: Mutex<SimulatedRng>,
    backpressure_prob: f64,
    applied: Mutex<HashMap<PartitionId, Vec<DistributionKey>>>,
    already_applied: Mutex<u64>,
    backpressure: Mutex<u64>,
}

impl SimulatedPartitions {
    fn new(rng: SimulatedRng, backpressure_prob: f64) -> Self {
        SimulatedPartitions {
            rng: Mutex::new(rng),
            backpressure_prob,
            applied: Mutex::new(HashMap::new()),
            already_applied: Mutex::new(0),
            backpressure: Mutex::new(0),
        }
    }

    fn applied(&self, partition: PartitionId) -> Vec<DistributionKey> {
        self.applied
            .lock()
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }
}

impl CommandApplier for SimulatedPartitions {
    fn apply(&self, partition: PartitionId, record: &DistributionRecord) -> Result<ApplyOutcome, ApplyError> {
        if self.backpressure_prob > 0.0 && self.rng.lock().gen_bool(self.backpressure_prob) {
            *self.backpressure.lock() += 1;
            return Err(ApplyError::Backpressure);
        }
        let mut applied = self.applied.lock();
        let log = applied.entry(partition).or_default();
        if log.contains(&record.distribution_key) {
            *self.already_applied.lock() += 1;
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        log.push(record.distribution_key);
        Ok(ApplyOutcome::Applied)
    }
}

/// The source partition's distribution context.
struct SourceNode {
    handle: DistributorHandle,
    join: JoinHandle<DistributionBehavior<RecordingEventSink>>,
    redistributor_cancel: CancellationToken,
    redistributor: JoinHandle<()>,
}

impl SourceNode {
    fn start(
        cluster: &LocalCluster,
        topology: &TopologyView,
        partitions: &[PartitionId],
        state: DistributionState,
        sink: RecordingEventSink,
        config: &DistributionConfig,
    ) -> Self {
        let behavior = DistributionBehavior::new(SOURCE_PARTITION, partitions.to_vec(), state, sink);
        let pusher = DeploymentPusher::new(
            Arc::new(cluster.join(SOURCE_BROKER)),
            topology.clone(),
            config.clone(),
        );
        let (handle, join) = spawn_distributor(behavior, pusher);
        let redistributor_cancel = CancellationToken::new();
        let redistributor =
            CommandRedistributor::new(handle.clone(), config).spawn(redistributor_cancel.clone());
        SourceNode {
            handle,
            join,
            redistributor_cancel,
            redistributor,
        }
    }

    /// Stop the node and return its persisted state.
    async fn stop(self) -> Result<Vec<u8>, String> {
        self.redistributor_cancel.cancel();
        let _ = self.redistributor.await;
        self.handle.shutdown().await;
        let behavior = self.join.await.map_err(|e| format!("distributor panicked: {}", e))?;
        behavior
            .into_state()
            .to_snapshot_bytes()
            .map_err(|e| e.to_string())
    }
}

pub struct DistributionDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: DistributionDSTConfig,
}

impl DistributionDSTHarness {
    pub fn new(seed: u64, config: DistributionDSTConfig) -> Self {
        DistributionDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
        }
    }

    pub fn run(&mut self) -> DistributionDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return DistributionDSTResult {
                    seed: self.seed,
                    error_message: Some(format!("runtime: {}", e)),
                    ..Default::default()
                }
            }
        };
        // fault sites run on this thread: the runtime is single threaded
        buggify::set_config(FaultConfig::new());
        buggify::reset_stats();
        let mut result = runtime.block_on(self.simulate());
        result.fault_triggers = buggify::get_stats().total_triggers();
        buggify::set_config(FaultConfig::default());
        result
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        debug_assert!(!items.is_empty(), "Precondition: pick from a non-empty slice");
        items[self.rng.gen_range(0, items.len() as u64) as usize]
    }

    async fn simulate(&mut self) -> DistributionDSTResult {
        let started = Instant::now();
        let mut result = DistributionDSTResult {
            seed: self.seed,
            ..Default::default()
        };

        let cluster = LocalCluster::with_faults(self.rng.next_u64(), self.config.network.clone());
        let partitions: Vec<PartitionId> = (1..=self.config.partition_count).collect();
        let brokers: Vec<BrokerId> = partitions.clone();
        let targets: Vec<PartitionId> = partitions
            .iter()
            .copied()
            .filter(|p| *p != SOURCE_PARTITION)
            .collect();
        let topology = TopologyView::round_robin(self.config.partition_count, &brokers);

        let applier = Arc::new(SimulatedPartitions::new(
            self.rng.fork(),
            self.config.backpressure_prob,
        ));
        let receivers: Vec<_> = brokers
            .iter()
            .map(|&broker| {
                let receiver = InterPartitionReceiver::new(
                    Arc::new(cluster.join(broker)),
                    topology.clone(),
                    Arc::clone(&applier),
                );
                receiver.register();
                receiver
            })
            .collect();

        let sink = RecordingEventSink::new();
        let mut node = SourceNode::start(
            &cluster,
            &topology,
            &partitions,
            DistributionState::in_memory(),
            sink.clone(),
            &self.config.distribution,
        );

        let mut distributed: Vec<DistributionRecord> = Vec::new();
        let mut continuation_keys: Vec<DistributionKey> = Vec::new();
        let mut next_continuation: DistributionKey = 1_000_000;
        let mut crash_rng = self.rng.fork();

        // ---- chaos phase: distribute while faults are injected ----
        for i in 0..self.config.num_distributions {
            let key = (i as DistributionKey).saturating_add(1);
            let mut record = DistributionRecord::new(
                key,
                SOURCE_PARTITION,
                ValueType::Deployment,
                "CREATE",
                format!("resource-{}", key).into_bytes(),
            );
            if self.rng.gen_bool(self.config.queued_prob) {
                record = record.with_queue(self.pick(&QUEUES));
            }
            if let Err(e) = node.handle.distribute(record.clone()).await {
                result.error_message = Some(format!("distribute {} failed: {}", key, e));
                return result;
            }
            if let Some(queue) = &record.queue_id {
                if self.rng.gen_bool(self.config.continuation_prob) {
                    let continuation = DistributionRecord::new(
                        next_continuation,
                        SOURCE_PARTITION,
                        ValueType::Resource,
                        "CONTINUE",
                        Vec::new(),
                    )
                    .with_queue(queue.clone());
                    if let Err(e) = node
                        .handle
                        .request_continuation(next_continuation, continuation)
                        .await
                    {
                        result.error_message = Some(format!("continuation failed: {}", e));
                        return result;
                    }
                    continuation_keys.push(next_continuation);
                    next_continuation = next_continuation.saturating_add(1);
                }
            }
            distributed.push(record);

            if self.rng.gen_bool(self.config.leader_change_prob) {
                let partition = self.pick(&targets);
                let broker = self.pick(&brokers);
                topology.set_leader(partition, broker);
                result.leader_changes += 1;
            }
            if self.rng.gen_bool(self.config.leaderless_prob) {
                topology.remove_leader(self.pick(&targets));
                result.leader_changes += 1;
            }
            if self.rng.gen_bool(self.config.isolate_prob) {
                cluster.isolate(self.pick(&brokers));
                result.isolations += 1;
            } else if self.rng.gen_bool(0.3) {
                cluster.heal(self.pick(&brokers));
            }
            if crate::buggify!(&mut crash_rng, faults::process::CRASH, self.config.crash_prob) {
                let bytes = match node.stop().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        result.error_message = Some(format!("crash: {}", e));
                        return result;
                    }
                };
                let state = match DistributionState::from_snapshot_bytes(InMemoryKvStore::new(), &bytes) {
                    Ok(state) => state,
                    Err(e) => {
                        result.error_message = Some(format!("restart: {}", e));
                        return result;
                    }
                };
                node = SourceNode::start(
                    &cluster,
                    &topology,
                    &partitions,
                    state,
                    sink.clone(),
                    &self.config.distribution,
                );
                result.crashes += 1;
            }

            result.max_subscriptions = result
                .max_subscriptions
                .max(max_subscriptions(&cluster, &distributed, &targets));
            tokio::time::sleep(self.config.step).await;
        }

        // ---- convergence phase: heal everything, elect leaders ----
        for &broker in &brokers {
            cluster.heal(broker);
        }
        for &partition in &targets {
            if topology.leader(partition).is_none() {
                topology.set_leader(partition, self.pick(&brokers));
            }
        }

        let deadline = started + self.config.deadline;
        loop {
            let stats = match node.handle.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    result.error_message = Some(format!("stats: {}", e));
                    return result;
                }
            };
            result.push_attempts = stats.push_attempts;
            result.max_subscriptions = result
                .max_subscriptions
                .max(max_subscriptions(&cluster, &distributed, &targets));
            if stats.pending == 0 && stats.in_flight == 0 {
                break;
            }
            if Instant::now() >= deadline {
                result.error_message = Some(format!(
                    "distribution did not converge before deadline: {:?}",
                    stats
                ));
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let bytes = match node.stop().await {
            Ok(bytes) => bytes,
            Err(e) => {
                result.error_message = Some(format!("final stop: {}", e));
                return result;
            }
        };
        for receiver in &receivers {
            receiver.unregister();
        }

        result.distributions = distributed.len();
        result.continuations = continuation_keys.len();
        result.already_applied = *applier.already_applied.lock();
        result.backpressure_rejections = *applier.backpressure.lock();
        result.elapsed = started.elapsed();

        let violations = self.verify(
            &applier,
            &distributed,
            &continuation_keys,
            &sink.events(),
            &targets,
            &bytes,
            &cluster,
        );
        result.applied = targets.iter().map(|p| applier.applied(*p).len()).sum();
        result.passed = violations.is_empty() && result.max_subscriptions <= 1;
        if !result.passed {
            let mut message = violations.join("; ");
            if result.max_subscriptions > 1 {
                message.push_str(&format!(
                    "; {} concurrent response subscriptions for one (K, P)",
                    result.max_subscriptions
                ));
            }
            result.error_message = Some(format!("INVARIANT VIOLATION: {}", message));
        }
        result
    }

    fn verify(
        &self,
        applier: &SimulatedPartitions,
        distributed: &[DistributionRecord],
        continuation_keys: &[DistributionKey],
        events: &[DistributionEvent],
        targets: &[PartitionId],
        final_state: &[u8],
        cluster: &LocalCluster,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        match DistributionState::from_snapshot_bytes(InMemoryKvStore::new(), final_state) {
            Ok(state) if state.is_empty() => {}
            Ok(_) => violations.push("distribution state not empty after convergence".to_string()),
            Err(e) => violations.push(format!("final state unreadable: {}", e)),
        }

        if !applier.applied(SOURCE_PARTITION).is_empty() {
            violations.push("source partition applied its own distribution".to_string());
        }

        for &partition in targets {
            let log = applier.applied(partition);
            let unique: HashSet<_> = log.iter().copied().collect();
            if unique.len() != log.len() {
                violations.push(format!("partition {} applied a command twice", partition));
            }
            for record in distributed {
                if !unique.contains(&record.distribution_key) {
                    violations.push(format!(
                        "distribution {} never applied on partition {}",
                        record.distribution_key, partition
                    ));
                }
            }
            for queue in QUEUES {
                let expected: Vec<DistributionKey> = distributed
                    .iter()
                    .filter(|r| r.queue_id.as_deref() == Some(queue))
                    .map(|r| r.distribution_key)
                    .collect();
                let queued: HashSet<_> = expected.iter().copied().collect();
                let observed: Vec<DistributionKey> =
                    log.iter().copied().filter(|k| queued.contains(k)).collect();
                if observed != expected {
                    violations.push(format!(
                        "queue {} out of order on partition {}: {:?} != {:?}",
                        queue, partition, observed, expected
                    ));
                }
            }
            for record in distributed {
                let topic = deployment_response_topic(record.distribution_key, partition);
                if cluster.subscription_count(&topic) > 0 {
                    violations.push(format!("subscription {} left behind", topic));
                }
            }
        }

        let mut finished: HashMap<DistributionKey, usize> = HashMap::new();
        let mut continued: HashMap<DistributionKey, usize> = HashMap::new();
        for event in events {
            match event {
                DistributionEvent::Finished {
                    distribution_key, ..
                } => *finished.entry(*distribution_key).or_default() += 1,
                DistributionEvent::Continued {
                    continuation_key, ..
                } => *continued.entry(*continuation_key).or_default() += 1,
                _ => {}
            }
        }
        for record in distributed {
            let count = finished.get(&record.distribution_key).copied().unwrap_or(0);
            if count != 1 {
                violations.push(format!(
                    "distribution {} finished {} times",
                    record.distribution_key, count
                ));
            }
        }
        for key in continuation_keys {
            let count = continued.get(key).copied().unwrap_or(0);
            if count != 1 {
                violations.push(format!("continuation {} continued {} times", key, count));
            }
        }
        violations
    }
}

fn max_subscriptions(
    cluster: &LocalCluster,
    distributed: &[DistributionRecord],
    targets: &[PartitionId],
) -> usize {
    distributed
        .iter()
        .flat_map(|r| {
            targets
                .iter()
                .map(move |p| cluster.subscription_count(&deployment_response_topic(r.distribution_key, *p)))
        })
        .max()
        .unwrap_or(0)
}

pub fn run_distribution_dst_batch(
    seeds: std::ops::Range<u64>,
    config: DistributionDSTConfig,
) -> Vec<DistributionDSTResult> {
    seeds
        .map(|seed| DistributionDSTHarness::new(seed, config.clone()).run())
        .collect()
}

pub fn summarize_distribution_dst_batch(results: &[DistributionDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let distributions: usize = results.iter().map(|r| r.distributions).sum();
    let attempts: u64 = results.iter().map(|r| r.push_attempts).sum();
    let leader_changes: u64 = results.iter().map(|r| r.leader_changes).sum();
    let crashes: u64 = results.iter().map(|r| r.crashes).sum();
    let redundant: u64 = results.iter().map(|r| r.already_applied).sum();
    let faults: u64 = results.iter().map(|r| r.fault_triggers).sum();

    let mut summary = format!(
        "Distribution DST Batch: {}/{} passed\n\
         Distributions: {}, Push attempts: {}, Leader changes: {}, Crashes: {}, Redundant pushes: {}, Faults: {}",
        passed, total, distributions, attempts, leader_changes, crashes, redundant, faults
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
