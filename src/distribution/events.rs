//! Distribution lifecycle events, written to the partition log.

use super::record::{DistributionKey, DistributionRecord, Followup};
use crate::storage::AppenderHandle;
use crate::topology::PartitionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionEvent {
    Started {
        record: DistributionRecord,
    },
    Enqueued {
        distribution_key: DistributionKey,
        partition: PartitionId,
        queue_id: String,
    },
    Distributing {
        distribution_key: DistributionKey,
        partition: PartitionId,
    },
    Acknowledged {
        distribution_key: DistributionKey,
        partition: PartitionId,
    },
    Finished {
        distribution_key: DistributionKey,
        followup: Option<Followup>,
    },
    ContinuationRequested {
        continuation_key: DistributionKey,
        queue_id: String,
    },
    Continued {
        continuation_key: DistributionKey,
        record: DistributionRecord,
    },
}

impl DistributionEvent {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn distribution_key(&self) -> DistributionKey {
        match self {
            DistributionEvent::Started { record } => record.distribution_key,
            DistributionEvent::Enqueued { distribution_key, .. }
            | DistributionEvent::Distributing { distribution_key, .. }
            | DistributionEvent::Acknowledged { distribution_key, .. }
            | DistributionEvent::Finished { distribution_key, .. } => *distribution_key,
            DistributionEvent::ContinuationRequested { continuation_key, .. }
            | DistributionEvent::Continued { continuation_key, .. } => *continuation_key,
        }
    }
}

pub trait DistributionEventSink: Send + 'static {
    fn emit(&self, event: DistributionEvent);
}

/// Events become blocks of the partition log.
impl DistributionEventSink for AppenderHandle {
    fn emit(&self, event: DistributionEvent) {
        let block = match event.encode() {
            Ok(block) => block,
            Err(e) => {
                warn!("distribution {}: cannot encode event: {}", event.distribution_key(), e);
                return;
            }
        };
        if let Err(e) = self.append_fire_and_forget(block) {
            warn!(
                "distribution {}: event not written: {}",
                event.distribution_key(),
                e
            );
        }
    }
}

/// Keeps events in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<DistributionEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DistributionEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<DistributionEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl DistributionEventSink for RecordingEventSink {
    fn emit(&self, event: DistributionEvent) {
        self.events.lock().push(event);
    }
}
