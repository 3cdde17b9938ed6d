//! Snapshot chunk and its wire format.
//!
//! ```text
//! ┌─────────────┬─────────────┬────────────┬────────────┬─────────┬────────────────┬─────────────────┐
//! │ snapshot_id │ total_count │ chunk_name │ checksum   │ content │ file_block_pos │ total_file_size │
//! │ u32 + utf8  │ i32         │ u32 + utf8 │ i64        │ u32 + n │ i64            │ i64             │
//! └─────────────┴─────────────┴────────────┴────────────┴─────────┴────────────────┴─────────────────┘
//! ```
//!
//! Little-endian throughout. The checksum is the CRC32 of `content`, widened
//! to i64.

use crate::transport::wire::{
    ensure_consumed, get_bytes, get_i32, get_i64, get_string, put_bytes, put_str, WireError,
};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed chunk: {0}")]
    Wire(#[from] WireError),
    #[error("chunk {chunk_name} of snapshot {snapshot_id}: checksum mismatch (expected {expected}, actual {actual})")]
    ChecksumMismatch {
        snapshot_id: String,
        chunk_name: String,
        expected: i64,
        actual: i64,
    },
    #[error("chunk {chunk_name} disagrees with snapshot {snapshot_id} on its shape")]
    Inconsistent {
        snapshot_id: String,
        chunk_name: String,
    },
    #[error("snapshot {snapshot_id} assembled to {actual} bytes, expected {expected}")]
    SizeMismatch {
        snapshot_id: String,
        expected: i64,
        actual: i64,
    },
    #[error("replication channel already has a consumer")]
    AlreadyConsuming,
    #[error("replication channel closed")]
    Closed,
    #[error("failed to start consumer thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub snapshot_id: String,
    /// Chunks in the whole snapshot
    pub total_count: i32,
    pub chunk_name: String,
    pub checksum: i64,
    pub content: Bytes,
    /// Offset of `content` within the snapshot
    pub file_block_position: i64,
    pub total_file_size: i64,
}

impl SnapshotChunk {
    /// Build a chunk, computing the checksum over `content`.
    pub fn new(
        snapshot_id: impl Into<String>,
        total_count: i32,
        chunk_name: impl Into<String>,
        content: Bytes,
        file_block_position: i64,
        total_file_size: i64,
    ) -> Self {
        debug_assert!(total_count > 0, "Precondition: a snapshot has at least one chunk");
        SnapshotChunk {
            snapshot_id: snapshot_id.into(),
            total_count,
            chunk_name: chunk_name.into(),
            checksum: checksum(&content),
            content,
            file_block_position,
            total_file_size,
        }
    }

    pub fn verify(&self) -> Result<(), SnapshotError> {
        let actual = checksum(&self.content);
        if actual != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                snapshot_id: self.snapshot_id.clone(),
                chunk_name: self.chunk_name.clone(),
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.snapshot_id.len() + self.chunk_name.len() + self.content.len() + 44,
        );
        put_str(&mut buf, &self.snapshot_id);
        buf.put_i32_le(self.total_count);
        put_str(&mut buf, &self.chunk_name);
        buf.put_i64_le(self.checksum);
        put_bytes(&mut buf, &self.content);
        buf.put_i64_le(self.file_block_position);
        buf.put_i64_le(self.total_file_size);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let chunk = SnapshotChunk {
            snapshot_id: get_string(&mut buf, "snapshot_id")?,
            total_count: get_i32(&mut buf, "total_count")?,
            chunk_name: get_string(&mut buf, "chunk_name")?,
            checksum: get_i64(&mut buf, "checksum")?,
            content: get_bytes(&mut buf, "content")?,
            file_block_position: get_i64(&mut buf, "file_block_position")?,
            total_file_size: get_i64(&mut buf, "total_file_size")?,
        };
        ensure_consumed(&buf)?;
        Ok(chunk)
    }
}

pub fn checksum(content: &[u8]) -> i64 {
    i64::from(crc32fast::hash(content))
}
