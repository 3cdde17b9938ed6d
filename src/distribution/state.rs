//! Distribution state.
//!
//! Tracks, per distribution key, the record being distributed, the
//! partitions that have not acknowledged it yet (pending), the partitions
//! whose push should be (re)attempted (retriable), the per-`(queue,
//! partition)` FIFO of distributions waiting for their turn, and the
//! continuation commands staged behind a queue.
//!
//! | Column family  | Key                                   | Value          |
//! |----------------|---------------------------------------|----------------|
//! | `Distribution` | distribution_key                      | record         |
//! | `Pending`      | distribution_key, partition           | -              |
//! | `Retriable`    | distribution_key, partition           | -              |
//! | `Queued`       | queue, partition, sequence            | distribution_key |
//! | `QueuedIndex`  | queue, partition, distribution_key    | sequence       |
//! | `Continuation` | queue, continuation_key               | record         |
//!
//! Mutated only from the owning partition's context. Every operation is
//! total over its key domain: removing something absent is a no-op.

use super::kv::{ColumnFamily, InMemoryKvStore, KeyBuilder, KeyReader, KvStore};
use super::record::{DistributionKey, DistributionRecord};
use crate::topology::PartitionId;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum DistributionStateError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("continuation command {0} has no queue id")]
    MissingQueue(DistributionKey),
}

const NEXT_QUEUE_SEQUENCE: &[u8] = &[ColumnFamily::Meta as u8, 1];

pub struct DistributionState<K: KvStore = InMemoryKvStore> {
    kv: K,
}

impl DistributionState<InMemoryKvStore> {
    pub fn in_memory() -> Self {
        DistributionState::new(InMemoryKvStore::new())
    }
}

impl<K: KvStore> DistributionState<K> {
    pub fn new(kv: K) -> Self {
        DistributionState { kv }
    }

    // =========================================================================
    // Distribution records
    // =========================================================================

    pub fn add_command_distribution(
        &mut self,
        key: DistributionKey,
        record: &DistributionRecord,
    ) -> Result<(), DistributionStateError> {
        debug_assert_eq!(record.distribution_key, key, "Precondition: record carries its key");
        let value = bincode::serialize(record)?;
        self.kv.put(record_key(key), value);
        Ok(())
    }

    /// Removes only the record; pending and retriable entries are left alone.
    pub fn remove_command_distribution(&mut self, key: DistributionKey) -> bool {
        self.kv.delete(&record_key(key))
    }

    pub fn has_command_distribution(&self, key: DistributionKey) -> bool {
        self.kv.exists(&record_key(key))
    }

    pub fn get_command_distribution(
        &self,
        key: DistributionKey,
    ) -> Result<Option<DistributionRecord>, DistributionStateError> {
        match self.kv.get(&record_key(key)) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Pending / retriable
    // =========================================================================

    pub fn add_pending_distribution(&mut self, key: DistributionKey, partition: PartitionId) {
        self.kv.put(pair_key(ColumnFamily::Pending, key, partition), Vec::new());
    }

    pub fn remove_pending_distribution(&mut self, key: DistributionKey, partition: PartitionId) -> bool {
        self.kv.delete(&pair_key(ColumnFamily::Pending, key, partition))
    }

    /// True while any partition has not acknowledged `key`.
    pub fn has_pending_distribution(&self, key: DistributionKey) -> bool {
        self.has_any(ColumnFamily::Pending, key)
    }

    pub fn has_pending_distribution_for(&self, key: DistributionKey, partition: PartitionId) -> bool {
        self.kv.exists(&pair_key(ColumnFamily::Pending, key, partition))
    }

    pub fn pending_partitions(&self, key: DistributionKey) -> Vec<PartitionId> {
        let prefix = KeyBuilder::new(ColumnFamily::Pending).u64(key).build();
        let mut partitions = Vec::new();
        self.kv.scan_prefix(&prefix, &mut |k, _| {
            let mut reader = KeyReader::new(k);
            if let (Some(_), Some(partition)) = (reader.u64(), reader.u32()) {
                partitions.push(partition);
            }
            true
        });
        partitions
    }

    pub fn add_retriable_distribution(&mut self, key: DistributionKey, partition: PartitionId) {
        self.kv.put(pair_key(ColumnFamily::Retriable, key, partition), Vec::new());
    }

    pub fn remove_retriable_distribution(&mut self, key: DistributionKey, partition: PartitionId) -> bool {
        self.kv.delete(&pair_key(ColumnFamily::Retriable, key, partition))
    }

    pub fn has_retriable_distribution(&self, key: DistributionKey) -> bool {
        self.has_any(ColumnFamily::Retriable, key)
    }

    pub fn has_retriable_distribution_for(&self, key: DistributionKey, partition: PartitionId) -> bool {
        self.kv.exists(&pair_key(ColumnFamily::Retriable, key, partition))
    }

    fn has_any(&self, cf: ColumnFamily, key: DistributionKey) -> bool {
        let prefix = KeyBuilder::new(cf).u64(key).build();
        let mut found = false;
        self.kv.scan_prefix(&prefix, &mut |_, _| {
            found = true;
            false
        });
        found
    }

    /// Visit every pending `(key, partition)` with its record.
    pub fn for_each_pending_distribution<F>(&self, visitor: F)
    where
        F: FnMut(DistributionKey, PartitionId, &DistributionRecord) -> bool,
    {
        self.for_each_pair(ColumnFamily::Pending, visitor);
    }

    pub fn for_each_retriable_distribution<F>(&self, visitor: F)
    where
        F: FnMut(DistributionKey, PartitionId, &DistributionRecord) -> bool,
    {
        self.for_each_pair(ColumnFamily::Retriable, visitor);
    }

    /// Entries of one distribution are contiguous, so the last resolved
    /// record is reused until the key changes.
    fn for_each_pair<F>(&self, cf: ColumnFamily, mut visitor: F)
    where
        F: FnMut(DistributionKey, PartitionId, &DistributionRecord) -> bool,
    {
        let mut cached: Option<(DistributionKey, Option<DistributionRecord>)> = None;
        self.kv.scan_prefix(&[cf as u8], &mut |k, _| {
            let mut reader = KeyReader::new(k);
            let (Some(key), Some(partition)) = (reader.u64(), reader.u32()) else {
                warn!("skipping malformed {:?} entry {:?}", cf, k);
                return true;
            };

            if cached.as_ref().map(|(cached_key, _)| *cached_key) != Some(key) {
                let record = match self.get_command_distribution(key) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("distribution {}: unreadable record: {}", key, e);
                        None
                    }
                };
                cached = Some((key, record));
            }

            match cached.as_ref().and_then(|(_, record)| record.as_ref()) {
                Some(record) => visitor(key, partition, record),
                None => {
                    warn!(
                        "inconsistent distribution state: {:?} entry ({}, {}) has no distribution record, skipping",
                        cf, key, partition
                    );
                    true
                }
            }
        });
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Append `key` to the FIFO of `(queue, partition)`. Enqueuing an entry
    /// that is already queued keeps its original position.
    pub fn enqueue_command_distribution(&mut self, queue: &str, key: DistributionKey, partition: PartitionId) {
        let index = queue_index_key(queue, partition, key);
        if self.kv.exists(&index) {
            return;
        }
        let sequence = self.next_queue_sequence();
        self.kv.put(
            queued_key(queue, partition, sequence),
            key.to_be_bytes().to_vec(),
        );
        self.kv.put(index, sequence.to_be_bytes().to_vec());
    }

    pub fn remove_queued_distribution(&mut self, queue: &str, partition: PartitionId, key: DistributionKey) -> bool {
        let index = queue_index_key(queue, partition, key);
        let Some(sequence) = self.kv.get(&index).and_then(decode_u64) else {
            return false;
        };
        self.kv.delete(&queued_key(queue, partition, sequence));
        self.kv.delete(&index);
        true
    }

    /// Head of the FIFO for `(queue, partition)`.
    pub fn next_queued_distribution_key(&self, queue: &str, partition: PartitionId) -> Option<DistributionKey> {
        let prefix = KeyBuilder::new(ColumnFamily::Queued).str(queue).u32(partition).build();
        let mut head = None;
        self.kv.scan_prefix(&prefix, &mut |_, v| {
            head = decode_u64(v);
            false
        });
        head
    }

    pub fn is_queued(&self, queue: &str, partition: PartitionId, key: DistributionKey) -> bool {
        self.kv.exists(&queue_index_key(queue, partition, key))
    }

    /// True while any partition still has an entry in `queue`.
    pub fn has_queued_distributions(&self, queue: &str) -> bool {
        let prefix = KeyBuilder::new(ColumnFamily::Queued).str(queue).build();
        let mut found = false;
        self.kv.scan_prefix(&prefix, &mut |_, _| {
            found = true;
            false
        });
        found
    }

    fn next_queue_sequence(&mut self) -> u64 {
        let current = self.kv.get(NEXT_QUEUE_SEQUENCE).and_then(decode_u64).unwrap_or(0);
        let next = current
            .checked_add(1)
            .expect("queue sequence overflow unreachable");
        self.kv.put(NEXT_QUEUE_SEQUENCE.to_vec(), next.to_be_bytes().to_vec());
        current
    }

    // =========================================================================
    // Continuations
    // =========================================================================

    /// Stage `record` behind the queue named by its `queue_id`.
    pub fn add_continuation_command(
        &mut self,
        continuation_key: DistributionKey,
        record: &DistributionRecord,
    ) -> Result<(), DistributionStateError> {
        let queue = record
            .queue_id
            .as_deref()
            .ok_or(DistributionStateError::MissingQueue(continuation_key))?;
        let value = bincode::serialize(record)?;
        self.kv.put(continuation_key_of(queue, continuation_key), value);
        Ok(())
    }

    pub fn remove_continuation_command(&mut self, continuation_key: DistributionKey, queue: &str) -> bool {
        self.kv.delete(&continuation_key_of(queue, continuation_key))
    }

    pub fn for_each_continuation_command<F>(&self, queue: &str, mut visitor: F)
    where
        F: FnMut(DistributionKey, &DistributionRecord) -> bool,
    {
        let prefix = KeyBuilder::new(ColumnFamily::Continuation).str(queue).build();
        self.kv.scan_prefix(&prefix, &mut |k, v| {
            let mut reader = KeyReader::new(k);
            let (Some(_), Some(key)) = (reader.str(), reader.u64()) else {
                warn!("skipping malformed continuation entry {:?}", k);
                return true;
            };
            match bincode::deserialize::<DistributionRecord>(v) {
                Ok(record) => visitor(key, &record),
                Err(e) => {
                    warn!("queue {}: unreadable continuation {}: {}", queue, key, e);
                    true
                }
            }
        });
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Serialize the whole state, in key order.
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>, DistributionStateError> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.kv.len());
        self.kv.scan_prefix(&[], &mut |k, v| {
            entries.push((k.to_vec(), v.to_vec()));
            true
        });
        Ok(bincode::serialize(&entries)?)
    }

    /// Replace the current contents with a snapshot.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), DistributionStateError> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = bincode::deserialize(bytes)?;
        self.kv.clear();
        for (k, v) in entries {
            self.kv.put(k, v);
        }
        Ok(())
    }

    pub fn from_snapshot_bytes(kv: K, bytes: &[u8]) -> Result<Self, DistributionStateError> {
        let mut state = DistributionState::new(kv);
        state.restore_snapshot(bytes)?;
        Ok(state)
    }

    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.kv.scan_prefix(&[], &mut |k, _| {
            empty = k.first() == Some(&(ColumnFamily::Meta as u8));
            empty
        });
        empty
    }
}

fn record_key(key: DistributionKey) -> Vec<u8> {
    KeyBuilder::new(ColumnFamily::Distribution).u64(key).build()
}

fn pair_key(cf: ColumnFamily, key: DistributionKey, partition: PartitionId) -> Vec<u8> {
    KeyBuilder::new(cf).u64(key).u32(partition).build()
}

fn queued_key(queue: &str, partition: PartitionId, sequence: u64) -> Vec<u8> {
    KeyBuilder::new(ColumnFamily::Queued)
        .str(queue)
        .u32(partition)
        .u64(sequence)
        .build()
}

fn queue_index_key(queue: &str, partition: PartitionId, key: DistributionKey) -> Vec<u8> {
    KeyBuilder::new(ColumnFamily::QueuedIndex)
        .str(queue)
        .u32(partition)
        .u64(key)
        .build()
}

fn continuation_key_of(queue: &str, continuation_key: DistributionKey) -> Vec<u8> {
    KeyBuilder::new(ColumnFamily::Continuation)
        .str(queue)
        .u64(continuation_key)
        .build()
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}
