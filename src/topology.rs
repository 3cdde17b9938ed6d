//! Eventually-consistent view of partition leadership.
//!
//! Updated by a topology listener (the consensus layer, or a test) and read
//! by the pusher and the inter-partition receiver. Reads never block on a
//! fresher view; a stale answer is corrected by the next retry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type BrokerId = u32;
pub type PartitionId = u32;

#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    leaders: Arc<RwLock<HashMap<PartitionId, BrokerId>>>,
}

impl TopologyView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robin leadership of `partition_count` partitions (ids from 1)
    /// over `brokers`.
    pub fn round_robin(partition_count: u32, brokers: &[BrokerId]) -> Self {
        debug_assert!(!brokers.is_empty(), "Precondition: at least one broker");
        let view = TopologyView::new();
        for partition in 1..=partition_count {
            let broker = brokers[(partition as usize - 1) % brokers.len()];
            view.set_leader(partition, broker);
        }
        view
    }

    pub fn leader(&self, partition: PartitionId) -> Option<BrokerId> {
        self.leaders.read().get(&partition).copied()
    }

    pub fn set_leader(&self, partition: PartitionId, broker: BrokerId) {
        self.leaders.write().insert(partition, broker);
    }

    /// Leader lost, new one not elected yet.
    pub fn remove_leader(&self, partition: PartitionId) {
        self.leaders.write().remove(&partition);
    }

    pub fn is_leader(&self, partition: PartitionId, broker: BrokerId) -> bool {
        self.leader(partition) == Some(broker)
    }

    /// Sorted ids of every partition with a known leader.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.leaders.read().keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }
}
