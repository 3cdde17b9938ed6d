//! Snapshot transfer between replicas of a partition.
//!
//! - `chunk`: `SnapshotChunk` and its wire format
//! - `assembler`: splitting snapshots into chunks and reassembling them
//! - `replication`: the per-partition broadcast channel

pub mod assembler;
pub mod chunk;
pub mod replication;

pub use assembler::{chunk_name, SnapshotAssembler, SnapshotChunker};
pub use chunk::{SnapshotChunk, SnapshotError};
pub use replication::SnapshotReplication;
