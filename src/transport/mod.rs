//! Inter-broker transport: the messaging abstraction and wire formats.

pub mod messaging;
pub mod wire;

use crate::topology::BrokerId;

pub use messaging::{
    LocalCluster, LocalMessaging, Messaging, NetworkFaultConfig, RequestHandler, Subscription,
};
pub use wire::{ErrorCode, PushDeploymentRequest, PushDeploymentResponse, WireError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request to broker {0} timed out")]
    Timeout(BrokerId),
    #[error("broker {0} unreachable")]
    Unreachable(BrokerId),
    #[error("broker {broker} has no handler for {subject}")]
    NoHandler { broker: BrokerId, subject: String },
}
