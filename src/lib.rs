pub mod io;
pub mod buggify;
pub mod config;
pub mod observability;
pub mod storage;
pub mod topology;
pub mod distribution;
pub mod transport;
pub mod distributor;
pub mod snapshot;

pub use config::EngineConfig;
pub use distribution::{DistributionBehavior, DistributionRecord, DistributionState};
pub use distributor::{spawn_distributor, DeploymentPusher, DistributorHandle, InterPartitionReceiver};
pub use snapshot::{SnapshotChunk, SnapshotReplication};
pub use storage::{spawn_appender, AppenderHandle, LogStorage, SegmentedLogStorage};
pub use topology::{BrokerId, PartitionId, TopologyView};
pub use transport::{LocalCluster, Messaging};
