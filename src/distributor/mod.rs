//! Pushing distributions to other partitions.
//!
//! - `distributor`: the actor owning a partition's distribution context,
//!   plus the periodic redistributor
//! - `pusher`: one push, retried until acknowledged or cancelled
//! - `receiver`: the handler every broker registers for incoming pushes
//! - `dst`: deterministic simulation harness

pub mod distributor;
pub mod dst;
pub mod pusher;
pub mod receiver;

pub use distributor::{
    spawn_distributor, CommandDistributor, CommandRedistributor, DistributorError,
    DistributorHandle, DistributorMessage, DistributorStats,
};
pub use pusher::{DeploymentPusher, PushOutcome, PushReport};
pub use receiver::{ApplyError, ApplyOutcome, CommandApplier, InterPartitionReceiver};
