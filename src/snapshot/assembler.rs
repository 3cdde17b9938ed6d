//! Splitting a snapshot into chunks and putting it back together.

use super::chunk::{SnapshotChunk, SnapshotError};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

pub fn chunk_name(index: usize) -> String {
    format!("{}.chunk", index)
}

pub struct SnapshotChunker {
    chunk_size: usize,
}

impl SnapshotChunker {
    pub fn new(chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0, "Precondition: chunk size must be positive");
        SnapshotChunker {
            chunk_size: chunk_size.max(1),
        }
    }

    /// An empty snapshot still yields one (empty) chunk.
    pub fn split(&self, snapshot_id: &str, data: &[u8]) -> Vec<SnapshotChunk> {
        let data = Bytes::copy_from_slice(data);
        let total_size = data.len() as i64;
        let count = data.len().div_ceil(self.chunk_size).max(1);
        let total_count = i32::try_from(count).unwrap_or(i32::MAX);

        (0..count)
            .map(|index| {
                let start = index * self.chunk_size;
                let end = (start + self.chunk_size).min(data.len());
                SnapshotChunk::new(
                    snapshot_id,
                    total_count,
                    chunk_name(index),
                    data.slice(start..end),
                    start as i64,
                    total_size,
                )
            })
            .collect()
    }
}

struct PartialSnapshot {
    total_count: i32,
    total_file_size: i64,
    /// Keyed by file block position
    chunks: BTreeMap<i64, SnapshotChunk>,
}

/// Snapshots assembled at the same time. A chunk of a new snapshot beyond
/// this evicts the oldest partial one.
pub const DEFAULT_MAX_PENDING: usize = 1;

/// Completed or superseded snapshot ids remembered so their late chunks
/// do not start them over.
const RETIRED_IDS: usize = 16;

/// Collects chunks until a snapshot is complete. Only the most recently
/// started snapshots are kept; a leader that moved on to a newer snapshot
/// makes the older partial one useless.
pub struct SnapshotAssembler {
    pending: HashMap<String, PartialSnapshot>,
    /// Pending ids, oldest first
    started: VecDeque<String>,
    retired: VecDeque<String>,
    max_pending: usize,
}

impl Default for SnapshotAssembler {
    fn default() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        debug_assert!(max_pending > 0, "Precondition: at least one pending snapshot");
        SnapshotAssembler {
            pending: HashMap::new(),
            started: VecDeque::new(),
            retired: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn retire(&mut self, snapshot_id: String) {
        self.started.retain(|id| *id != snapshot_id);
        self.retired.push_back(snapshot_id);
        while self.retired.len() > RETIRED_IDS {
            self.retired.pop_front();
        }
    }

    fn start(&mut self, snapshot_id: &str) {
        self.started.push_back(snapshot_id.to_string());
        while self.started.len() > self.max_pending {
            let Some(oldest) = self.started.pop_front() else {
                break;
            };
            let dropped = self.pending.remove(&oldest).map_or(0, |p| p.chunks.len());
            debug!(
                "snapshot {}: superseded by {}, dropping {} chunks",
                oldest, snapshot_id, dropped
            );
            self.retire(oldest);
        }
        debug_assert!(self.started.len() <= self.max_pending, "Postcondition: pending bounded");
    }

    /// Returns the snapshot bytes once the last chunk arrives. Duplicate
    /// chunks are ignored.
    pub fn accept(&mut self, chunk: SnapshotChunk) -> Result<Option<Vec<u8>>, SnapshotError> {
        chunk.verify()?;
        let snapshot_id = chunk.snapshot_id.clone();
        if self.retired.contains(&snapshot_id) {
            debug!("snapshot {}: late chunk {} ignored", snapshot_id, chunk.chunk_name);
            return Ok(None);
        }
        if !self.pending.contains_key(&snapshot_id) {
            self.start(&snapshot_id);
        }
        let partial = self
            .pending
            .entry(snapshot_id.clone())
            .or_insert_with(|| PartialSnapshot {
                total_count: chunk.total_count,
                total_file_size: chunk.total_file_size,
                chunks: BTreeMap::new(),
            });
        if partial.total_count != chunk.total_count || partial.total_file_size != chunk.total_file_size {
            return Err(SnapshotError::Inconsistent {
                snapshot_id,
                chunk_name: chunk.chunk_name,
            });
        }
        if partial.chunks.contains_key(&chunk.file_block_position) {
            debug!("snapshot {}: duplicate chunk {}", snapshot_id, chunk.chunk_name);
            return Ok(None);
        }
        partial.chunks.insert(chunk.file_block_position, chunk);
        if partial.chunks.len() < partial.total_count.max(0) as usize {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&snapshot_id) else {
            return Ok(None);
        };
        self.retire(snapshot_id.clone());
        let mut data = Vec::with_capacity(partial.total_file_size.max(0) as usize);
        for chunk in partial.chunks.values() {
            data.extend_from_slice(&chunk.content);
        }
        if data.len() as i64 != partial.total_file_size {
            return Err(SnapshotError::SizeMismatch {
                snapshot_id,
                expected: partial.total_file_size,
                actual: data.len() as i64,
            });
        }
        debug!("snapshot {}: assembled {} bytes", snapshot_id, data.len());
        Ok(Some(data))
    }

    /// Names of the chunks not yet received, empty for unknown snapshots.
    pub fn missing_chunks(&self, snapshot_id: &str) -> Vec<String> {
        let Some(partial) = self.pending.get(snapshot_id) else {
            return Vec::new();
        };
        let received: std::collections::HashSet<&str> =
            partial.chunks.values().map(|c| c.chunk_name.as_str()).collect();
        (0..partial.total_count.max(0) as usize)
            .map(chunk_name)
            .filter(|name| !received.contains(name.as_str()))
            .collect()
    }

    pub fn is_pending(&self, snapshot_id: &str) -> bool {
        self.pending.contains_key(snapshot_id)
    }

    /// Drop a partially received snapshot. It may be received again.
    pub fn abort(&mut self, snapshot_id: &str) -> bool {
        self.started.retain(|id| id != snapshot_id);
        self.pending.remove(snapshot_id).is_some()
    }

    /// Number of snapshots partially received.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
