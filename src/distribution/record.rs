use crate::topology::PartitionId;
use serde::{Deserialize, Serialize};

pub type DistributionKey = u64;

/// Kind of command carried by a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Deployment,
    Resource,
    Signal,
    MessageSubscription,
    User,
}

/// Second command issued once the first one has been applied everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Followup {
    pub value_type: ValueType,
    pub intent: String,
    pub command_value: Vec<u8>,
}

/// One logical command being propagated to the other partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub distribution_key: DistributionKey,
    pub value_type: ValueType,
    pub intent: String,
    pub command_value: Vec<u8>,
    pub followup: Option<Followup>,
    pub queue_id: Option<String>,
    pub source_partition_id: PartitionId,
}

impl DistributionRecord {
    pub fn new(
        distribution_key: DistributionKey,
        source_partition_id: PartitionId,
        value_type: ValueType,
        intent: impl Into<String>,
        command_value: impl Into<Vec<u8>>,
    ) -> Self {
        DistributionRecord {
            distribution_key,
            value_type,
            intent: intent.into(),
            command_value: command_value.into(),
            followup: None,
            queue_id: None,
            source_partition_id,
        }
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_followup(mut self, followup: Followup) -> Self {
        self.followup = Some(followup);
        self
    }
}
