//! Distribution lifecycle on the originating partition.
//!
//! ```text
//!  start ──► STARTED ──► pending + retriable for every other partition
//!                 │          (queued behind the head when the queue is busy)
//!                 ▼
//!  ack(P) ──► pending(K, P) removed ──► next queued key for (queue, P) released
//!                 │
//!                 └─ no partition pending ──► FINISHED ──► queue drained?
//!                                                            └─► continuations CONTINUED
//! ```
//!
//! Every transition is applied to `DistributionState` and emitted as a
//! `DistributionEvent`. Acknowledgements are idempotent: only the first ack
//! for `(K, P)` has side effects.

use super::events::{DistributionEvent, DistributionEventSink};
use super::kv::{InMemoryKvStore, KvStore};
use super::record::{DistributionKey, DistributionRecord, Followup};
use super::state::{DistributionState, DistributionStateError};
use crate::topology::PartitionId;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// `(K, P)` was not pending: already acknowledged or never distributed.
    Duplicate,
    Acknowledged {
        /// Queued distributions to `P` that became dispatchable.
        released: Vec<(DistributionKey, PartitionId)>,
        finished: bool,
        followup: Option<Followup>,
        continuations: Vec<(DistributionKey, DistributionRecord)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationOutcome {
    /// The queue was already empty.
    Continued(DistributionRecord),
    /// Waiting for the queue to drain.
    Staged,
}

pub struct DistributionBehavior<E: DistributionEventSink, K: KvStore = InMemoryKvStore> {
    partition_id: PartitionId,
    partitions: Vec<PartitionId>,
    state: DistributionState<K>,
    events: E,
}

impl<E: DistributionEventSink, K: KvStore> DistributionBehavior<E, K> {
    /// `partitions` lists every partition of the cluster, including this one.
    pub fn new(
        partition_id: PartitionId,
        partitions: Vec<PartitionId>,
        state: DistributionState<K>,
        events: E,
    ) -> Self {
        debug_assert!(
            partitions.contains(&partition_id),
            "Precondition: local partition is part of the cluster"
        );
        DistributionBehavior {
            partition_id,
            partitions,
            state,
            events,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn state(&self) -> &DistributionState<K> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DistributionState<K> {
        &mut self.state
    }

    pub fn into_state(self) -> DistributionState<K> {
        self.state
    }

    fn targets(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions
            .iter()
            .copied()
            .filter(move |p| *p != self.partition_id)
    }

    /// Record a new distribution and return the partitions to push to now.
    /// Starting a key that is already distributing is a no-op.
    pub fn start_distribution(
        &mut self,
        record: DistributionRecord,
    ) -> Result<Vec<PartitionId>, DistributionStateError> {
        let key = record.distribution_key;
        if self.state.has_command_distribution(key) {
            debug!("distribution {} already started", key);
            return Ok(Vec::new());
        }

        self.state.add_command_distribution(key, &record)?;
        let queue_id = record.queue_id.clone();
        self.events.emit(DistributionEvent::Started { record });

        let targets: Vec<PartitionId> = self.targets().collect();
        let mut dispatch = Vec::with_capacity(targets.len());
        for partition in targets {
            self.state.add_pending_distribution(key, partition);
            if let Some(queue) = &queue_id {
                self.state.enqueue_command_distribution(queue, key, partition);
                if self.state.next_queued_distribution_key(queue, partition) != Some(key) {
                    self.events.emit(DistributionEvent::Enqueued {
                        distribution_key: key,
                        partition,
                        queue_id: queue.clone(),
                    });
                    continue;
                }
            }
            self.state.add_retriable_distribution(key, partition);
            self.events.emit(DistributionEvent::Distributing {
                distribution_key: key,
                partition,
            });
            dispatch.push(partition);
        }

        if !self.state.has_pending_distribution(key) {
            // single-partition cluster
            self.finish(key, None, queue_id.as_deref());
        }
        info!(
            "partition {}: distribution {} started, {} partitions dispatchable",
            self.partition_id,
            key,
            dispatch.len()
        );
        Ok(dispatch)
    }

    /// Apply an acknowledgement from `partition`.
    pub fn acknowledge(
        &mut self,
        key: DistributionKey,
        partition: PartitionId,
    ) -> Result<AckOutcome, DistributionStateError> {
        if !self.state.has_pending_distribution_for(key, partition) {
            debug!("distribution {}: duplicate ack from partition {}", key, partition);
            return Ok(AckOutcome::Duplicate);
        }

        let record = self.state.get_command_distribution(key)?;
        if record.is_none() {
            warn!(
                "distribution {}: ack from partition {} but no distribution record",
                key, partition
            );
        }
        self.state.remove_pending_distribution(key, partition);
        self.state.remove_retriable_distribution(key, partition);
        self.events.emit(DistributionEvent::Acknowledged {
            distribution_key: key,
            partition,
        });

        let queue_id = record.as_ref().and_then(|r| r.queue_id.clone());
        let mut released = Vec::new();
        if let Some(queue) = &queue_id {
            self.state.remove_queued_distribution(queue, partition, key);
            if let Some(next) = self.state.next_queued_distribution_key(queue, partition) {
                if !self.state.has_retriable_distribution_for(next, partition) {
                    self.state.add_retriable_distribution(next, partition);
                    self.events.emit(DistributionEvent::Distributing {
                        distribution_key: next,
                        partition,
                    });
                    released.push((next, partition));
                }
            }
        }

        let finished = !self.state.has_pending_distribution(key);
        let mut followup = None;
        let mut continuations = Vec::new();
        if finished {
            followup = record.and_then(|r| r.followup);
            continuations = self.finish(key, followup.clone(), queue_id.as_deref());
        }

        Ok(AckOutcome::Acknowledged {
            released,
            finished,
            followup,
            continuations,
        })
    }

    fn finish(
        &mut self,
        key: DistributionKey,
        followup: Option<Followup>,
        queue_id: Option<&str>,
    ) -> Vec<(DistributionKey, DistributionRecord)> {
        self.state.remove_command_distribution(key);
        self.events.emit(DistributionEvent::Finished {
            distribution_key: key,
            followup,
        });
        info!("partition {}: distribution {} finished", self.partition_id, key);

        match queue_id {
            Some(queue) if !self.state.has_queued_distributions(queue) => self.continue_queue(queue),
            _ => Vec::new(),
        }
    }

    /// Stage `record` until its queue has drained on every partition.
    pub fn request_continuation(
        &mut self,
        continuation_key: DistributionKey,
        record: DistributionRecord,
    ) -> Result<ContinuationOutcome, DistributionStateError> {
        let queue = record
            .queue_id
            .clone()
            .ok_or(DistributionStateError::MissingQueue(continuation_key))?;

        if !self.state.has_queued_distributions(&queue) {
            self.events.emit(DistributionEvent::Continued {
                continuation_key,
                record: record.clone(),
            });
            return Ok(ContinuationOutcome::Continued(record));
        }

        self.state.add_continuation_command(continuation_key, &record)?;
        self.events.emit(DistributionEvent::ContinuationRequested {
            continuation_key,
            queue_id: queue,
        });
        Ok(ContinuationOutcome::Staged)
    }

    fn continue_queue(&mut self, queue: &str) -> Vec<(DistributionKey, DistributionRecord)> {
        let mut staged = Vec::new();
        self.state.for_each_continuation_command(queue, |key, record| {
            staged.push((key, record.clone()));
            true
        });
        for (key, record) in &staged {
            self.state.remove_continuation_command(*key, queue);
            self.events.emit(DistributionEvent::Continued {
                continuation_key: *key,
                record: record.clone(),
            });
        }
        staged
    }

    /// Every `(K, P)` whose push should be (re)attempted, with its record.
    pub fn retriable(&self) -> Vec<(DistributionKey, PartitionId, DistributionRecord)> {
        let mut out = Vec::new();
        self.state.for_each_retriable_distribution(|key, partition, record| {
            out.push((key, partition, record.clone()));
            true
        });
        out
    }

    /// Record to push for `(K, P)`, if that push is still wanted.
    pub fn push_record(&self, key: DistributionKey, partition: PartitionId) -> Option<DistributionRecord> {
        if !self.state.has_retriable_distribution_for(key, partition) {
            return None;
        }
        self.state.get_command_distribution(key).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::events::RecordingEventSink;
    use crate::distribution::record::ValueType;

    fn behavior() -> (DistributionBehavior<RecordingEventSink>, RecordingEventSink) {
        let sink = RecordingEventSink::new();
        let behavior =
            DistributionBehavior::new(1, vec![1, 2, 3], DistributionState::in_memory(), sink.clone());
        (behavior, sink)
    }

    fn record(key: DistributionKey) -> DistributionRecord {
        DistributionRecord::new(key, 1, ValueType::Deployment, "CREATE", b"process".to_vec())
    }

    #[test]
    fn test_start_targets_every_other_partition() {
        let (mut behavior, sink) = behavior();
        let dispatch = behavior.start_distribution(record(10)).unwrap();
        assert_eq!(dispatch, vec![2, 3]);
        assert!(behavior.state().has_pending_distribution_for(10, 2));
        assert!(behavior.state().has_retriable_distribution_for(10, 3));
        assert!(!behavior.state().has_pending_distribution_for(10, 1));

        let events = sink.take();
        assert!(matches!(events[0], DistributionEvent::Started { .. }));
        assert_eq!(events.len(), 3);

        // starting again changes nothing
        assert!(behavior.start_distribution(record(10)).unwrap().is_empty());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_ack_completes_distribution() {
        let (mut behavior, sink) = behavior();
        behavior
            .start_distribution(record(10).with_followup(Followup {
                value_type: ValueType::Deployment,
                intent: "FULLY_DISTRIBUTED".into(),
                command_value: vec![],
            }))
            .unwrap();

        let outcome = behavior.acknowledge(10, 2).unwrap();
        assert!(matches!(outcome, AckOutcome::Acknowledged { finished: false, .. }));
        assert!(behavior.state().has_command_distribution(10));

        let AckOutcome::Acknowledged { finished, followup, .. } = behavior.acknowledge(10, 3).unwrap() else {
            panic!("expected acknowledged");
        };
        assert!(finished);
        assert_eq!(followup.map(|f| f.intent), Some("FULLY_DISTRIBUTED".to_string()));
        assert!(!behavior.state().has_command_distribution(10));
        assert!(behavior.state().is_empty());
        assert!(matches!(
            sink.events().last(),
            Some(DistributionEvent::Finished { distribution_key: 10, .. })
        ));
    }

    #[test]
    fn test_duplicate_ack_has_no_side_effects() {
        let (mut behavior, sink) = behavior();
        behavior.start_distribution(record(10)).unwrap();
        behavior.acknowledge(10, 2).unwrap();
        let before = sink.events().len();

        assert_eq!(behavior.acknowledge(10, 2).unwrap(), AckOutcome::Duplicate);
        assert_eq!(behavior.acknowledge(99, 2).unwrap(), AckOutcome::Duplicate);
        assert_eq!(sink.events().len(), before);
        assert!(behavior.state().has_pending_distribution_for(10, 3));
    }

    #[test]
    fn test_queue_releases_in_enqueue_order() {
        let (mut behavior, _sink) = behavior();
        assert_eq!(behavior.start_distribution(record(5).with_queue("q")).unwrap(), vec![2, 3]);
        assert!(behavior.start_distribution(record(4).with_queue("q")).unwrap().is_empty());
        assert!(behavior.start_distribution(record(6).with_queue("q")).unwrap().is_empty());
        assert!(behavior.push_record(4, 2).is_none());

        let AckOutcome::Acknowledged { released, .. } = behavior.acknowledge(5, 2).unwrap() else {
            panic!("expected acknowledged");
        };
        assert_eq!(released, vec![(4, 2)]);
        assert!(behavior.push_record(4, 2).is_some());
        // partition 3 still waits for 5
        assert!(behavior.push_record(4, 3).is_none());

        let AckOutcome::Acknowledged { released, .. } = behavior.acknowledge(4, 2).unwrap() else {
            panic!("expected acknowledged");
        };
        assert_eq!(released, vec![(6, 2)]);
    }

    #[test]
    fn test_continuation_waits_for_queue_to_drain() {
        let (mut behavior, sink) = behavior();
        behavior.start_distribution(record(5).with_queue("q")).unwrap();

        let staged = behavior
            .request_continuation(50, record(50).with_queue("q"))
            .unwrap();
        assert_eq!(staged, ContinuationOutcome::Staged);

        let AckOutcome::Acknowledged { continuations, .. } = behavior.acknowledge(5, 2).unwrap() else {
            panic!("expected acknowledged");
        };
        assert!(continuations.is_empty());

        let AckOutcome::Acknowledged { continuations, finished, .. } = behavior.acknowledge(5, 3).unwrap() else {
            panic!("expected acknowledged");
        };
        assert!(finished);
        assert_eq!(continuations.len(), 1);
        assert_eq!(continuations[0].0, 50);
        assert!(matches!(
            sink.events().last(),
            Some(DistributionEvent::Continued { continuation_key: 50, .. })
        ));
        assert!(behavior.state().is_empty());
    }

    #[test]
    fn test_continuation_on_empty_queue_is_immediate() {
        let (mut behavior, _sink) = behavior();
        let outcome = behavior
            .request_continuation(50, record(50).with_queue("idle"))
            .unwrap();
        assert!(matches!(outcome, ContinuationOutcome::Continued(_)));
        assert!(behavior.request_continuation(51, record(51)).is_err());
    }

    #[test]
    fn test_single_partition_finishes_immediately() {
        let sink = RecordingEventSink::new();
        let mut behavior =
            DistributionBehavior::new(1, vec![1], DistributionState::in_memory(), sink.clone());
        assert!(behavior.start_distribution(record(1)).unwrap().is_empty());
        assert!(!behavior.state().has_command_distribution(1));
        assert!(matches!(
            sink.events().last(),
            Some(DistributionEvent::Finished { .. })
        ));
    }

    #[test]
    fn test_retriable_lists_dispatchable_pairs() {
        let (mut behavior, _sink) = behavior();
        behavior.start_distribution(record(1)).unwrap();
        behavior.start_distribution(record(2).with_queue("q")).unwrap();
        behavior.start_distribution(record(3).with_queue("q")).unwrap();
        let pairs: Vec<_> = behavior.retriable().into_iter().map(|(k, p, _)| (k, p)).collect();
        assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 2), (2, 3)]);
    }
}
