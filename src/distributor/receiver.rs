//! Receiving end of a push, registered on every broker.
//!
//! | Condition                                  | Response                     |
//! |--------------------------------------------|------------------------------|
//! | undecodable request or record              | `MALFORMED_REQUEST`          |
//! | this broker does not lead the partition    | `PARTITION_LEADER_MISMATCH`  |
//! | applier reports backpressure               | `RESOURCE_EXHAUSTED`         |
//! | applier rejects the command                | `INTERNAL_ERROR`             |
//! | applied (or already applied)               | success, also broadcast on   |
//! |                                            | the deployment response topic|

use crate::distribution::{DistributionKey, DistributionRecord};
use crate::topology::{PartitionId, TopologyView};
use crate::transport::wire::{
    deployment_response_topic, ErrorCode, PushDeploymentRequest, PushDeploymentResponse,
    PUSH_DEPLOYMENT_SUBJECT,
};
use crate::transport::Messaging;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The partition had already applied this distribution.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("partition is under backpressure")]
    Backpressure,
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Applies a distributed command on the target partition.
///
/// The receiver only remembers recent distributions, so a redelivery of an
/// older one reaches the applier again and must be answered with
/// `AlreadyApplied`.
pub trait CommandApplier: Send + Sync + 'static {
    fn apply(&self, partition: PartitionId, record: &DistributionRecord) -> Result<ApplyOutcome, ApplyError>;
}

/// Distributions remembered per broker for duplicate suppression.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Bounded set of recently applied `(key, partition)` pairs, oldest evicted first.
struct RecentlyApplied {
    members: HashSet<(DistributionKey, PartitionId)>,
    order: VecDeque<(DistributionKey, PartitionId)>,
    capacity: usize,
}

impl RecentlyApplied {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "Precondition: dedup capacity must be positive");
        RecentlyApplied {
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, entry: &(DistributionKey, PartitionId)) -> bool {
        self.members.contains(entry)
    }

    fn insert(&mut self, entry: (DistributionKey, PartitionId)) {
        if !self.members.insert(entry) {
            return;
        }
        self.order.push_back(entry);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        debug_assert_eq!(self.members.len(), self.order.len(), "Postcondition: index matches order");
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct InterPartitionReceiver<A: CommandApplier> {
    messaging: Arc<dyn Messaging>,
    topology: TopologyView,
    applier: Arc<A>,
    applied: Mutex<RecentlyApplied>,
}

impl<A: CommandApplier> InterPartitionReceiver<A> {
    pub fn new(messaging: Arc<dyn Messaging>, topology: TopologyView, applier: Arc<A>) -> Arc<Self> {
        Self::with_dedup_capacity(messaging, topology, applier, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_dedup_capacity(
        messaging: Arc<dyn Messaging>,
        topology: TopologyView,
        applier: Arc<A>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(InterPartitionReceiver {
            messaging,
            topology,
            applier,
            applied: Mutex::new(RecentlyApplied::new(capacity.max(1))),
        })
    }

    /// Number of distributions currently remembered as applied.
    pub fn remembered(&self) -> usize {
        self.applied.lock().len()
    }

    /// Serve push requests on this broker.
    pub fn register(self: &Arc<Self>) {
        let receiver = Arc::clone(self);
        self.messaging.register_handler(
            PUSH_DEPLOYMENT_SUBJECT,
            Arc::new(move |bytes: Bytes| {
                let response = receiver.handle(bytes);
                async move { response }.boxed()
            }),
        );
    }

    pub fn unregister(&self) {
        self.messaging.unregister_handler(PUSH_DEPLOYMENT_SUBJECT);
    }

    pub fn handle(&self, bytes: Bytes) -> Bytes {
        self.respond(bytes).encode()
    }

    fn respond(&self, bytes: Bytes) -> PushDeploymentResponse {
        let request = match PushDeploymentRequest::decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("broker {}: malformed push request: {}", self.messaging.local_broker(), e);
                return PushDeploymentResponse::error(ErrorCode::MalformedRequest, &e.to_string());
            }
        };
        let key = request.deployment_key;
        let partition = request.partition_id;
        let broker = self.messaging.local_broker();

        if !self.topology.is_leader(partition, broker) {
            debug!(
                "broker {}: not leader of partition {}, rejecting distribution {}",
                broker, partition, key
            );
            return PushDeploymentResponse::leader_mismatch(partition);
        }

        let mut applied = self.applied.lock();
        if !applied.contains(&(key, partition)) {
            let record: DistributionRecord = match bincode::deserialize(&request.payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!("distribution {}: undecodable record for partition {}: {}", key, partition, e);
                    return PushDeploymentResponse::error(ErrorCode::MalformedRequest, &e.to_string());
                }
            };
            match self.applier.apply(partition, &record) {
                Ok(outcome) => {
                    debug!("distribution {}: partition {} {:?}", key, partition, outcome);
                    applied.insert((key, partition));
                }
                Err(ApplyError::Backpressure) => {
                    return PushDeploymentResponse::error(ErrorCode::ResourceExhausted, "backpressure");
                }
                Err(e @ ApplyError::Rejected(_)) => {
                    warn!("distribution {}: partition {} rejected: {}", key, partition, e);
                    return PushDeploymentResponse::error(ErrorCode::InternalError, &e.to_string());
                }
            }
        }

        drop(applied);

        let ack = PushDeploymentResponse::Success {
            deployment_key: key,
            partition_id: partition,
        };
        self.messaging
            .broadcast(&deployment_response_topic(key, partition), ack.encode());
        ack
    }
}
