//! Delivers one distribution to one partition, retrying until acknowledged.
//!
//! ```text
//!            ┌──────────────── resolve leader (topology) ◄──────────────┐
//!            │ unknown: sleep(backoff)                                  │
//!            ▼                                                          │
//!   send(leader, request, 15s) ─┬─ Success ──────────────► done         │
//!   retry timer (same deadline) │  LEADER_MISMATCH ─── debug ──► now ───┤
//!   response topic ─────────────┤  RESOURCE_EXHAUSTED ── warn ──► backoff┤
//!                               │  other error ───────── warn ──► backoff┤
//!                               └─ timeout / transport ──────► backoff ──┘
//! ```
//!
//! The response subscription for `(key, partition)` is created on the first
//! send and shared by every retry; an acknowledgement broadcast on it
//! completes the push even when the direct reply was lost. There is no retry
//! limit: the push ends on acknowledgement or cancellation.
//!
//! A leader mismatch is retried immediately a few times; while the topology
//! keeps pointing at the same non-leader, later retries wait the backoff.

use crate::config::DistributionConfig;
use crate::distribution::DistributionKey;
use crate::topology::{BrokerId, PartitionId, TopologyView};
use crate::transport::wire::{
    deployment_response_topic, ErrorCode, PushDeploymentRequest, PushDeploymentResponse,
    PUSH_DEPLOYMENT_SUBJECT,
};
use crate::transport::{Messaging, Subscription, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Acknowledged,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub outcome: PushOutcome,
    pub attempts: u64,
}

enum Step {
    Acknowledged,
    Cancelled,
    RetryNow,
    LeaderMismatch,
    Backoff,
    Resubscribe,
}

/// Consecutive leader mismatches retried without delay. Beyond this the
/// topology is considered stale and retries back off.
const IMMEDIATE_MISMATCH_RETRIES: u32 = 3;

pub struct DeploymentPusher {
    messaging: Arc<dyn Messaging>,
    topology: TopologyView,
    config: DistributionConfig,
}

impl DeploymentPusher {
    pub fn new(messaging: Arc<dyn Messaging>, topology: TopologyView, config: DistributionConfig) -> Self {
        DeploymentPusher {
            messaging,
            topology,
            config,
        }
    }

    pub async fn push(
        &self,
        key: DistributionKey,
        partition: PartitionId,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> PushReport {
        let topic = deployment_response_topic(key, partition);
        let request = PushDeploymentRequest {
            deployment_key: key,
            partition_id: partition,
            payload,
        }
        .encode();

        let mut subscription: Option<Subscription> = None;
        let mut attempts: u64 = 0;
        let mut mismatches: u32 = 0;
        let outcome = loop {
            let Some(leader) = self.topology.leader(partition) else {
                debug!(
                    "distribution {}: no leader known for partition {}, retrying in {:?}",
                    key, partition, self.config.retry_backoff
                );
                match self.backoff(key, partition, subscription.as_mut(), &cancel).await {
                    Step::Acknowledged => break PushOutcome::Acknowledged,
                    Step::Cancelled => break PushOutcome::Cancelled,
                    Step::Resubscribe => subscription = None,
                    _ => {}
                }
                continue;
            };

            let sub = subscription.get_or_insert_with(|| self.messaging.subscribe(&topic));
            attempts = attempts
                .checked_add(1)
                .expect("push attempt counter overflow unreachable");
            let step = self
                .attempt(key, partition, leader, request.clone(), sub, &cancel)
                .await;

            let step = match step {
                Step::LeaderMismatch => {
                    mismatches = mismatches.saturating_add(1);
                    if mismatches <= IMMEDIATE_MISMATCH_RETRIES {
                        Step::RetryNow
                    } else {
                        debug!(
                            "distribution {}: {} consecutive leader mismatches for partition {}, retrying in {:?}",
                            key, mismatches, partition, self.config.retry_backoff
                        );
                        self.backoff(key, partition, Some(sub), &cancel).await
                    }
                }
                Step::Backoff => {
                    mismatches = 0;
                    self.backoff(key, partition, Some(sub), &cancel).await
                }
                other => {
                    mismatches = 0;
                    other
                }
            };
            match step {
                Step::Acknowledged => break PushOutcome::Acknowledged,
                Step::Cancelled => break PushOutcome::Cancelled,
                Step::Resubscribe => subscription = None,
                Step::RetryNow | Step::LeaderMismatch | Step::Backoff => {}
            }
        };

        if subscription.is_some() {
            self.messaging.unsubscribe(&topic);
        }
        if outcome == PushOutcome::Acknowledged {
            debug!(
                "distribution {}: partition {} acknowledged after {} attempts",
                key, partition, attempts
            );
        }
        PushReport { outcome, attempts }
    }

    /// One send racing the retry timer, the response topic and cancellation.
    async fn attempt(
        &self,
        key: DistributionKey,
        partition: PartitionId,
        leader: BrokerId,
        request: Bytes,
        subscription: &mut Subscription,
        cancel: &CancellationToken,
    ) -> Step {
        let timeout = self.config.push_timeout;
        let send = self
            .messaging
            .send_and_receive(leader, PUSH_DEPLOYMENT_SUBJECT, request, timeout);
        let retry_timer = tokio::time::sleep(timeout);
        tokio::pin!(send);
        tokio::pin!(retry_timer);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Step::Cancelled,
                message = subscription.recv() => match message {
                    Some(bytes) if is_ack(&bytes, key, partition) => return Step::Acknowledged,
                    Some(_) => continue,
                    None => return Step::Resubscribe,
                },
                response = &mut send => return self.classify(key, partition, leader, response),
                _ = &mut retry_timer => {
                    debug!(
                        "distribution {}: no response from broker {} for partition {} within {:?}",
                        key, leader, partition, timeout
                    );
                    return Step::RetryNow;
                }
            }
        }
    }

    fn classify(
        &self,
        key: DistributionKey,
        partition: PartitionId,
        leader: BrokerId,
        response: Result<Bytes, TransportError>,
    ) -> Step {
        let bytes = match response {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(
                    "distribution {}: push to partition {} via broker {} failed: {}",
                    key, partition, leader, e
                );
                return Step::Backoff;
            }
        };

        match PushDeploymentResponse::decode(bytes) {
            Ok(PushDeploymentResponse::Success {
                deployment_key,
                partition_id,
            }) if deployment_key == key && partition_id == partition => Step::Acknowledged,
            Ok(PushDeploymentResponse::Success {
                deployment_key,
                partition_id,
            }) => {
                warn!(
                    "distribution {}: partition {} acknowledged unrelated push ({}, {})",
                    key, partition, deployment_key, partition_id
                );
                Step::Backoff
            }
            Ok(response @ PushDeploymentResponse::Error {
                code: ErrorCode::PartitionLeaderMismatch,
                ..
            }) => {
                // topology stays authoritative, the hint is only logged
                debug!(
                    "distribution {}: broker {} is not leader of partition {} (hint {:?}), retrying",
                    key,
                    leader,
                    partition,
                    response.mismatch_partition()
                );
                Step::LeaderMismatch
            }
            Ok(PushDeploymentResponse::Error {
                code: ErrorCode::ResourceExhausted,
                ..
            }) => {
                warn!(
                    "distribution {}: partition {} is exhausted, retrying in {:?}",
                    key, partition, self.config.retry_backoff
                );
                Step::Backoff
            }
            Ok(PushDeploymentResponse::Error { code, data }) => {
                warn!(
                    "distribution {}: partition {} rejected push with {:?} ({}), retrying in {:?}",
                    key,
                    partition,
                    code,
                    String::from_utf8_lossy(&data),
                    self.config.retry_backoff
                );
                Step::Backoff
            }
            Err(e) => {
                warn!(
                    "distribution {}: undecodable response from partition {}: {}",
                    key, partition, e
                );
                Step::Backoff
            }
        }
    }

    /// Sleep for the retry backoff, still listening for a late ack.
    async fn backoff(
        &self,
        key: DistributionKey,
        partition: PartitionId,
        subscription: Option<&mut Subscription>,
        cancel: &CancellationToken,
    ) -> Step {
        let sleep = tokio::time::sleep(self.config.retry_backoff);
        tokio::pin!(sleep);
        match subscription {
            None => tokio::select! {
                _ = cancel.cancelled() => Step::Cancelled,
                _ = &mut sleep => Step::Backoff,
            },
            Some(subscription) => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Step::Cancelled,
                    message = subscription.recv() => match message {
                        Some(bytes) if is_ack(&bytes, key, partition) => return Step::Acknowledged,
                        Some(_) => continue,
                        None => return Step::Resubscribe,
                    },
                    _ = &mut sleep => return Step::Backoff,
                }
            },
        }
    }
}

fn is_ack(bytes: &Bytes, key: DistributionKey, partition: PartitionId) -> bool {
    matches!(
        PushDeploymentResponse::decode(bytes.clone()),
        Ok(PushDeploymentResponse::Success { deployment_key, partition_id })
            if deployment_key == key && partition_id == partition
    )
}
