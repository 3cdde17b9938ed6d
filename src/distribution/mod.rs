//! Cross-partition command distribution.
//!
//! A command issued on one partition (a deployment, a signal subscription)
//! must be applied on every other partition. The originating partition keeps
//! a `DistributionState` of what is still unacknowledged and a
//! `DistributionBehavior` that drives it through its lifecycle; the pushing
//! itself lives in `crate::distributor`.

pub mod behavior;
pub mod events;
pub mod kv;
pub mod record;
pub mod state;

pub use behavior::{AckOutcome, ContinuationOutcome, DistributionBehavior};
pub use events::{DistributionEvent, DistributionEventSink, RecordingEventSink};
pub use kv::{InMemoryKvStore, KvStore};
pub use record::{DistributionKey, DistributionRecord, Followup, ValueType};
pub use state::{DistributionState, DistributionStateError};
