//! Command distributor actor.
//!
//! Runs the partition's distribution context: it owns the
//! `DistributionBehavior` (and with it the `DistributionState`), so every
//! state mutation happens on this one task. Pushes run as separate tasks and
//! report back through the same mailbox.
//!
//! ```text
//! Distribute ──┐                      ┌──► spawn push(K, P) ──► PushCompleted
//! Acknowledge ─┤                      │                              │
//! RetryTick ───┼──► CommandDistributor┤◄─────────────────────────────┘
//! Snapshot ────┤    (single task)     │
//! Shutdown ────┘                      └──► events ──► partition log
//! ```
//!
//! At most one push is in flight per `(K, P)`. An acknowledgement cancels the
//! matching push; a second acknowledgement is a no-op.

use super::pusher::{DeploymentPusher, PushOutcome, PushReport};
use crate::config::DistributionConfig;
use crate::distribution::{
    AckOutcome, ContinuationOutcome, DistributionBehavior, DistributionEventSink, DistributionKey,
    DistributionRecord, DistributionStateError, KvStore,
};
use crate::topology::PartitionId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error(transparent)]
    State(#[from] DistributionStateError),
    #[error("distributor stopped")]
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributorStats {
    pub in_flight: usize,
    pub pending: usize,
    pub retriable: usize,
    pub pushes_started: u64,
    pub pushes_acknowledged: u64,
    pub push_attempts: u64,
    pub distributions_finished: u64,
    pub duplicate_acks: u64,
}

pub enum DistributorMessage {
    Distribute {
        record: DistributionRecord,
        response_tx: oneshot::Sender<Result<Vec<PartitionId>, DistributionStateError>>,
    },
    Acknowledge {
        key: DistributionKey,
        partition: PartitionId,
        response_tx: Option<oneshot::Sender<Result<AckOutcome, DistributionStateError>>>,
    },
    RequestContinuation {
        key: DistributionKey,
        record: DistributionRecord,
        response_tx: oneshot::Sender<Result<ContinuationOutcome, DistributionStateError>>,
    },
    RetryTick,
    PushCompleted {
        key: DistributionKey,
        partition: PartitionId,
        push_id: u64,
        report: PushReport,
    },
    Snapshot {
        response_tx: oneshot::Sender<Result<Vec<u8>, DistributionStateError>>,
    },
    Inspect {
        response_tx: oneshot::Sender<DistributorStats>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

struct InFlight {
    push_id: u64,
    cancel: CancellationToken,
}

pub struct CommandDistributor<E: DistributionEventSink, K: KvStore> {
    behavior: DistributionBehavior<E, K>,
    pusher: Arc<DeploymentPusher>,
    rx: mpsc::UnboundedReceiver<DistributorMessage>,
    mailbox: mpsc::WeakUnboundedSender<DistributorMessage>,
    in_flight: HashMap<(DistributionKey, PartitionId), InFlight>,
    shutdown: CancellationToken,
    next_push_id: u64,
    stats: DistributorStats,
}

impl<E: DistributionEventSink, K: KvStore> CommandDistributor<E, K> {
    /// Runs until shutdown and hands the behavior back, state included.
    pub async fn run(mut self) -> DistributionBehavior<E, K> {
        // anything retriable in recovered state is pushed again
        self.redistribute();

        while let Some(msg) = self.rx.recv().await {
            if let Some(response_tx) = self.handle(msg) {
                self.shutdown.cancel();
                info!(
                    "partition {}: distributor shutting down, {} pushes cancelled",
                    self.behavior.partition_id(),
                    self.in_flight.len()
                );
                let _ = response_tx.send(());
                return self.behavior;
            }
        }
        self.shutdown.cancel();
        self.behavior
    }

    /// Returns the responder on shutdown.
    fn handle(&mut self, msg: DistributorMessage) -> Option<oneshot::Sender<()>> {
        match msg {
            DistributorMessage::Distribute {
                record,
                response_tx,
            } => {
                let key = record.distribution_key;
                let result = self.behavior.start_distribution(record);
                if let Ok(partitions) = &result {
                    for partition in partitions.clone() {
                        self.start_push(key, partition);
                    }
                    // a cluster of one finishes on start
                    self.note_finished_if_done(key);
                }
                let _ = response_tx.send(result);
            }
            DistributorMessage::Acknowledge {
                key,
                partition,
                response_tx,
            } => {
                let result = self.acknowledge(key, partition);
                if let Some(tx) = response_tx {
                    let _ = tx.send(result);
                } else if let Err(e) = result {
                    warn!("distribution {}: ack from partition {} failed: {}", key, partition, e);
                }
            }
            DistributorMessage::RequestContinuation {
                key,
                record,
                response_tx,
            } => {
                let _ = response_tx.send(self.behavior.request_continuation(key, record));
            }
            DistributorMessage::RetryTick => self.redistribute(),
            DistributorMessage::PushCompleted {
                key,
                partition,
                push_id,
                report,
            } => {
                if self
                    .in_flight
                    .get(&(key, partition))
                    .is_some_and(|f| f.push_id == push_id)
                {
                    self.in_flight.remove(&(key, partition));
                }
                self.stats.push_attempts = self.stats.push_attempts.saturating_add(report.attempts);
                if report.outcome == PushOutcome::Acknowledged {
                    self.stats.pushes_acknowledged = self.stats.pushes_acknowledged.saturating_add(1);
                    if let Err(e) = self.acknowledge(key, partition) {
                        warn!("distribution {}: ack from partition {} failed: {}", key, partition, e);
                    }
                }
            }
            DistributorMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(self.behavior.state().to_snapshot_bytes());
            }
            DistributorMessage::Inspect { response_tx } => {
                let _ = response_tx.send(self.inspect());
            }
            DistributorMessage::Shutdown { response_tx } => return Some(response_tx),
        }
        None
    }

    fn acknowledge(
        &mut self,
        key: DistributionKey,
        partition: PartitionId,
    ) -> Result<AckOutcome, DistributionStateError> {
        let outcome = self.behavior.acknowledge(key, partition)?;
        match &outcome {
            AckOutcome::Duplicate => {
                self.stats.duplicate_acks = self.stats.duplicate_acks.saturating_add(1);
            }
            AckOutcome::Acknowledged {
                released, finished, ..
            } => {
                if let Some(in_flight) = self.in_flight.remove(&(key, partition)) {
                    in_flight.cancel.cancel();
                }
                for (next, partition) in released.clone() {
                    self.start_push(next, partition);
                }
                if *finished {
                    self.stats.distributions_finished = self.stats.distributions_finished.saturating_add(1);
                }
            }
        }
        Ok(outcome)
    }

    fn note_finished_if_done(&mut self, key: DistributionKey) {
        if !self.behavior.state().has_command_distribution(key) {
            self.stats.distributions_finished = self.stats.distributions_finished.saturating_add(1);
        }
    }

    fn redistribute(&mut self) {
        let mut restarted = 0usize;
        for (key, partition, _) in self.behavior.retriable() {
            if !self.in_flight.contains_key(&(key, partition)) {
                self.start_push(key, partition);
                restarted += 1;
            }
        }
        if restarted > 0 {
            debug!(
                "partition {}: redistributing {} retriable distributions",
                self.behavior.partition_id(),
                restarted
            );
        }
    }

    fn start_push(&mut self, key: DistributionKey, partition: PartitionId) {
        if self.in_flight.contains_key(&(key, partition)) {
            return;
        }
        let Some(record) = self.behavior.push_record(key, partition) else {
            debug!("distribution {}: nothing to push to partition {}", key, partition);
            return;
        };
        let payload = match bincode::serialize(&record) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("distribution {}: cannot encode record: {}", key, e);
                return;
            }
        };
        let push_id = self.next_push_id;
        self.next_push_id = self
            .next_push_id
            .checked_add(1)
            .expect("push id overflow unreachable");
        let cancel = self.shutdown.child_token();
        self.in_flight.insert(
            (key, partition),
            InFlight {
                push_id,
                cancel: cancel.clone(),
            },
        );
        self.stats.pushes_started = self.stats.pushes_started.saturating_add(1);

        // weak, so outstanding pushes do not keep the actor alive once every
        // handle is gone
        let mailbox = self.mailbox.clone();
        let pusher = Arc::clone(&self.pusher);
        tokio::spawn(async move {
            let report = pusher.push(key, partition, payload, cancel).await;
            let Some(mailbox) = mailbox.upgrade() else {
                return;
            };
            let _ = mailbox.send(DistributorMessage::PushCompleted {
                key,
                partition,
                push_id,
                report,
            });
        });
    }

    fn inspect(&self) -> DistributorStats {
        let mut pending = 0;
        self.behavior.state().for_each_pending_distribution(|_, _, _| {
            pending += 1;
            true
        });
        DistributorStats {
            in_flight: self.in_flight.len(),
            pending,
            retriable: self.behavior.retriable().len(),
            ..self.stats.clone()
        }
    }
}

/// Cloneable handle to a running distributor.
#[derive(Clone)]
pub struct DistributorHandle {
    tx: mpsc::UnboundedSender<DistributorMessage>,
}

impl DistributorHandle {
    /// Start distributing `record`; returns the partitions pushed to now.
    pub async fn distribute(&self, record: DistributionRecord) -> Result<Vec<PartitionId>, DistributorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DistributorMessage::Distribute {
            record,
            response_tx,
        })?;
        Ok(response_rx.await.map_err(|_| DistributorError::Stopped)??)
    }

    pub async fn acknowledge(
        &self,
        key: DistributionKey,
        partition: PartitionId,
    ) -> Result<AckOutcome, DistributorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DistributorMessage::Acknowledge {
            key,
            partition,
            response_tx: Some(response_tx),
        })?;
        Ok(response_rx.await.map_err(|_| DistributorError::Stopped)??)
    }

    pub async fn request_continuation(
        &self,
        key: DistributionKey,
        record: DistributionRecord,
    ) -> Result<ContinuationOutcome, DistributorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DistributorMessage::RequestContinuation {
            key,
            record,
            response_tx,
        })?;
        Ok(response_rx.await.map_err(|_| DistributorError::Stopped)??)
    }

    pub fn retry_tick(&self) -> Result<(), DistributorError> {
        self.send(DistributorMessage::RetryTick)
    }

    /// Serialized distribution state.
    pub async fn snapshot(&self) -> Result<Vec<u8>, DistributorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DistributorMessage::Snapshot { response_tx })?;
        Ok(response_rx.await.map_err(|_| DistributorError::Stopped)??)
    }

    pub async fn stats(&self) -> Result<DistributorStats, DistributorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(DistributorMessage::Inspect { response_tx })?;
        response_rx.await.map_err(|_| DistributorError::Stopped)
    }

    /// Cancels every in-flight push and stops the actor.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.send(DistributorMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }

    fn send(&self, msg: DistributorMessage) -> Result<(), DistributorError> {
        self.tx.send(msg).map_err(|_| DistributorError::Stopped)
    }
}

/// Spawn the distributor on the current tokio runtime.
pub fn spawn_distributor<E: DistributionEventSink, K: KvStore>(
    behavior: DistributionBehavior<E, K>,
    pusher: DeploymentPusher,
) -> (DistributorHandle, tokio::task::JoinHandle<DistributionBehavior<E, K>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = CommandDistributor {
        behavior,
        pusher: Arc::new(pusher),
        rx,
        mailbox: tx.downgrade(),
        in_flight: HashMap::new(),
        shutdown: CancellationToken::new(),
        next_push_id: 0,
        stats: DistributorStats::default(),
    };
    let handle = tokio::spawn(actor.run());
    (DistributorHandle { tx }, handle)
}

/// Periodically asks the distributor to re-push retriable distributions.
pub struct CommandRedistributor {
    handle: DistributorHandle,
    interval: Duration,
}

impl CommandRedistributor {
    pub fn new(handle: DistributorHandle, config: &DistributionConfig) -> Self {
        CommandRedistributor {
            handle,
            interval: config.redistribution_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately; recovery already covered it
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.handle.retry_tick().is_err() {
                        break;
                    }
                }
            }
        }
        debug!("redistributor stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{
        DistributionEvent, DistributionState, RecordingEventSink, ValueType,
    };
    use crate::topology::TopologyView;
    use crate::transport::wire::{deployment_response_topic, PUSH_DEPLOYMENT_SUBJECT};
    use crate::transport::{LocalCluster, Messaging, PushDeploymentRequest, PushDeploymentResponse};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::time::Instant;

    /// Every broker acknowledges every push and records it.
    fn acking_brokers(cluster: &LocalCluster, brokers: &[u32]) -> Arc<Mutex<Vec<(u64, u32)>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        for &broker in brokers {
            let received = Arc::clone(&received);
            cluster.join(broker).register_handler(
                PUSH_DEPLOYMENT_SUBJECT,
                Arc::new(move |bytes: Bytes| {
                    let request = PushDeploymentRequest::decode(bytes).unwrap();
                    received.lock().push((request.deployment_key, request.partition_id));
                    async move {
                        PushDeploymentResponse::Success {
                            deployment_key: request.deployment_key,
                            partition_id: request.partition_id,
                        }
                        .encode()
                    }
                    .boxed()
                }),
            );
        }
        received
    }

    fn spawn(
        cluster: &LocalCluster,
        topology: TopologyView,
        state: DistributionState,
        sink: RecordingEventSink,
    ) -> (
        DistributorHandle,
        tokio::task::JoinHandle<DistributionBehavior<RecordingEventSink>>,
    ) {
        let behavior = DistributionBehavior::new(1, vec![1, 2, 3], state, sink);
        let pusher = DeploymentPusher::new(
            Arc::new(cluster.join(1)),
            topology,
            DistributionConfig::test(),
        );
        spawn_distributor(behavior, pusher)
    }

    async fn wait_until_idle(handle: &DistributorHandle) -> DistributorStats {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = handle.stats().await.unwrap();
            if stats.pending == 0 && stats.in_flight == 0 {
                return stats;
            }
            assert!(Instant::now() < deadline, "distribution never completed: {:?}", stats);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(key: u64) -> DistributionRecord {
        DistributionRecord::new(key, 1, ValueType::Deployment, "CREATE", b"bpmn".to_vec())
    }

    #[tokio::test]
    async fn test_distribution_reaches_every_partition() {
        let cluster = LocalCluster::new();
        let received = acking_brokers(&cluster, &[2, 3]);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);
        let sink = RecordingEventSink::new();
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), sink.clone());

        assert_eq!(handle.distribute(record(7)).await.unwrap(), vec![2, 3]);
        let stats = wait_until_idle(&handle).await;
        assert_eq!(stats.distributions_finished, 1);
        assert_eq!(stats.pushes_acknowledged, 2);

        let mut seen = received.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![(7, 2), (7, 3)]);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, DistributionEvent::Finished { distribution_key: 7, .. })));
        assert_eq!(cluster.subscription_count(&deployment_response_topic(7, 2)), 0);

        handle.shutdown().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_order_per_partition() {
        let cluster = LocalCluster::new();
        let received = acking_brokers(&cluster, &[2, 3]);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), RecordingEventSink::new());

        for key in [30u64, 10, 20] {
            handle.distribute(record(key).with_queue("deployments")).await.unwrap();
        }
        wait_until_idle(&handle).await;

        let seen = received.lock().clone();
        for partition in [2u32, 3] {
            let order: Vec<u64> = seen
                .iter()
                .filter(|(_, p)| *p == partition)
                .map(|(k, _)| *k)
                .collect();
            assert_eq!(order, vec![30, 10, 20], "partition {}", partition);
        }
        handle.shutdown().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_external_ack_cancels_push_and_duplicate_is_noop() {
        let cluster = LocalCluster::new();
        // partition 2's leader never answers
        cluster.join(2);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);
        topology.set_leader(3, 2);
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), RecordingEventSink::new());

        handle.distribute(record(1)).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().in_flight, 2);

        let first = handle.acknowledge(1, 2).await.unwrap();
        assert!(matches!(first, AckOutcome::Acknowledged { finished: false, .. }));
        assert_eq!(handle.acknowledge(1, 2).await.unwrap(), AckOutcome::Duplicate);
        let outcome = handle.acknowledge(1, 3).await.unwrap();
        assert!(matches!(outcome, AckOutcome::Acknowledged { finished: true, .. }));

        let stats = wait_until_idle(&handle).await;
        assert_eq!(stats.duplicate_acks, 1);
        // cancelled pushes unsubscribe on their own task
        let deadline = Instant::now() + Duration::from_secs(5);
        while cluster.subscription_count(&deployment_response_topic(1, 2)) > 0 {
            assert!(Instant::now() < deadline, "cancelled push kept its subscription");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_recovered_state_is_redistributed() {
        let cluster = LocalCluster::new();
        let received = acking_brokers(&cluster, &[2, 3]);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);

        let mut state = DistributionState::in_memory();
        state.add_command_distribution(4, &record(4)).unwrap();
        state.add_pending_distribution(4, 3);
        state.add_retriable_distribution(4, 3);
        let (handle, join) = spawn(&cluster, topology, state, RecordingEventSink::new());

        let stats = wait_until_idle(&handle).await;
        assert_eq!(stats.distributions_finished, 1);
        assert_eq!(*received.lock(), vec![(4, 3)]);
        handle.shutdown().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_hands_back_unfinished_state() {
        let cluster = LocalCluster::new();
        cluster.join(2);
        cluster.join(3);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), RecordingEventSink::new());

        handle.distribute(record(9)).await.unwrap();
        handle.shutdown().await;
        let state = join.await.unwrap().into_state();
        assert_eq!(state.pending_partitions(9), vec![2, 3]);
        assert!(state.has_retriable_distribution_for(9, 2));
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_actor_with_pushes_outstanding() {
        let cluster = LocalCluster::new();
        // no handlers: both pushes retry forever
        cluster.join(2);
        cluster.join(3);
        let topology = TopologyView::round_robin(3, &[1, 2, 3]);
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), RecordingEventSink::new());

        handle.distribute(record(5)).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().in_flight, 2);
        drop(handle);

        let behavior = tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("actor outlived its handles")
            .unwrap();
        assert_eq!(behavior.into_state().pending_partitions(5), vec![2, 3]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while cluster.subscription_count(&deployment_response_topic(5, 2)) > 0 {
            assert!(Instant::now() < deadline, "push kept running after the actor stopped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_redistributor_ticks() {
        let cluster = LocalCluster::new();
        let topology = TopologyView::new();
        let (handle, join) = spawn(&cluster, topology, DistributionState::in_memory(), RecordingEventSink::new());
        let cancel = CancellationToken::new();
        let ticker = CommandRedistributor::new(handle.clone(), &DistributionConfig::test()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        ticker.await.unwrap();
        handle.shutdown().await;
        join.await.unwrap();
        assert!(handle.retry_tick().is_err());
    }
}
