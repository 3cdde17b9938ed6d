//! Partition log storage.
//!
//! Append-only, segment-based, block-addressed. One appender per partition
//! writes; any number of readers follow behind the committed tail.
//!
//! - `log_storage`: the storage contract and status codes
//! - `segment`: on-disk format and segment state machine
//! - `segment_store`: file backends (in-memory, local, simulated)
//! - `allocator`: background segment preallocation
//! - `segmented_log`: rotation, recovery, reads, retention
//! - `appender`: the write-buffer draining actor
//! - `dst`: deterministic simulation harness

pub mod allocator;
pub mod appender;
pub mod dst;
pub mod log_storage;
pub mod segment;
pub mod segment_store;
pub mod segmented_log;

pub use appender::{spawn_appender, AppenderHandle};
pub use log_storage::{
    AppendError, FrameAligner, LogStorage, ReadBatch, ReadResultProcessor, StorageStatus,
};
pub use segment::{BlockIter, SegmentState};
pub use segment_store::{
    InMemorySegmentStore, LocalSegmentStore, SegmentError, SegmentFile, SegmentStore,
    SimulatedSegmentStore, SimulatedSegmentStoreConfig,
};
pub use segmented_log::SegmentedLogStorage;
