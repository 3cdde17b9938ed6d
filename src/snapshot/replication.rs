//! Snapshot replication channel for one partition.
//!
//! ```text
//! leader                      topic replication-<P>              follower
//! replicate(chunk) ──encode──► broadcast ──► subscription ──► consumer thread
//!                                                                 │ decode
//!                                                                 ▼
//!                                                             handler(chunk)
//! ```
//!
//! Delivery is fire-and-forget: lost chunks are recovered by the receiver
//! asking for them again, outside this channel. The consumer runs on its own
//! thread so chunks reach the handler in subscription order.

use super::chunk::{SnapshotChunk, SnapshotError};
use crate::config::SnapshotConfig;
use crate::topology::PartitionId;
use crate::transport::wire::replication_topic;
use crate::transport::Messaging;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

struct Consumer {
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct SnapshotReplication {
    messaging: Arc<dyn Messaging>,
    partition: PartitionId,
    topic: String,
    config: SnapshotConfig,
    consumer: Mutex<Option<Consumer>>,
    closed: AtomicBool,
}

impl SnapshotReplication {
    pub fn new(messaging: Arc<dyn Messaging>, partition: PartitionId, config: SnapshotConfig) -> Self {
        SnapshotReplication {
            messaging,
            partition,
            topic: replication_topic(partition),
            config,
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn replicate(&self, chunk: &SnapshotChunk) {
        if self.closed.load(Ordering::Acquire) {
            debug!(
                "partition {}: channel closed, dropping chunk {}",
                self.partition, chunk.chunk_name
            );
            return;
        }
        self.messaging.broadcast(&self.topic, chunk.encode());
    }

    /// Deliver every chunk received on the topic to `handler`, in order, on
    /// a dedicated thread. Undecodable messages are logged and skipped.
    pub fn consume<F>(&self, mut handler: F) -> Result<(), SnapshotError>
    where
        F: FnMut(SnapshotChunk) + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(SnapshotError::Closed);
        }
        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            return Err(SnapshotError::AlreadyConsuming);
        }

        let mut subscription = self.messaging.subscribe(&self.topic);
        let (done_tx, done_rx) = channel::bounded(1);
        let partition = self.partition;
        let spawned = std::thread::Builder::new()
            .name(format!("snapshot-replication-{}", partition))
            .spawn(move || {
                while let Some(bytes) = subscription.blocking_recv() {
                    match SnapshotChunk::decode(bytes) {
                        Ok(chunk) => handler(chunk),
                        Err(e) => warn!("partition {}: undecodable snapshot chunk: {}", partition, e),
                    }
                }
                let _ = done_tx.send(());
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.messaging.unsubscribe(&self.topic);
                return Err(SnapshotError::Thread(e));
            }
        };
        info!("partition {}: consuming snapshot chunks on {}", partition, self.topic);
        *consumer = Some(Consumer {
            thread,
            done: done_rx,
        });
        Ok(())
    }

    /// Unsubscribe and stop the consumer, waiting at most the configured
    /// close timeout for an in-progress handler. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(consumer) = self.consumer.lock().take() else {
            return;
        };
        self.messaging.unsubscribe(&self.topic);

        match consumer.done.recv_timeout(self.config.close_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if consumer.thread.join().is_err() {
                    error!("partition {}: snapshot consumer panicked", self.partition);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // detached: the thread exits once its handler returns
                warn!(
                    "partition {}: snapshot consumer did not stop within {:?}, abandoning it",
                    self.partition, self.config.close_timeout
                );
            }
        }
        debug!("partition {}: snapshot replication closed", self.partition);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for SnapshotReplication {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalCluster;
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    fn config() -> SnapshotConfig {
        SnapshotConfig {
            chunk_size: 16,
            close_timeout: Duration::from_millis(200),
        }
    }

    fn chunk(index: i32) -> SnapshotChunk {
        SnapshotChunk::new(
            "snap",
            10,
            format!("{}.chunk", index),
            Bytes::from(vec![index as u8; 4]),
            i64::from(index) * 4,
            40,
        )
    }

    #[test]
    fn test_chunks_arrive_in_order() {
        let cluster = LocalCluster::new();
        let leader = SnapshotReplication::new(Arc::new(cluster.join(1)), 3, config());
        let follower = SnapshotReplication::new(Arc::new(cluster.join(2)), 3, config());
        let (tx, rx) = channel::unbounded();
        follower.consume(move |chunk| tx.send(chunk).unwrap()).unwrap();
        assert_eq!(cluster.subscription_count("replication-3"), 1);

        for i in 0..10 {
            leader.replicate(&chunk(i));
        }
        let received: Vec<SnapshotChunk> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, (0..10).map(chunk).collect::<Vec<_>>());

        follower.close();
        assert_eq!(cluster.subscription_count("replication-3"), 0);
    }

    #[test]
    fn test_malformed_message_skipped() {
        let cluster = LocalCluster::new();
        let leader = cluster.join(1);
        let follower = SnapshotReplication::new(Arc::new(cluster.join(2)), 1, config());
        let (tx, rx) = channel::unbounded();
        follower.consume(move |chunk| tx.send(chunk).unwrap()).unwrap();

        leader.broadcast("replication-1", Bytes::from_static(b"junk"));
        leader.broadcast("replication-1", chunk(0).encode());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), chunk(0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let cluster = LocalCluster::new();
        let follower = SnapshotReplication::new(Arc::new(cluster.join(2)), 1, config());
        follower.consume(|_| {}).unwrap();
        assert!(matches!(
            follower.consume(|_| {}),
            Err(SnapshotError::AlreadyConsuming)
        ));

        follower.close();
        follower.close();
        assert!(follower.is_closed());
        assert!(matches!(follower.consume(|_| {}), Err(SnapshotError::Closed)));
    }

    #[test]
    fn test_close_abandons_stuck_handler() {
        let cluster = LocalCluster::new();
        let leader = SnapshotReplication::new(Arc::new(cluster.join(1)), 1, config());
        let follower = SnapshotReplication::new(Arc::new(cluster.join(2)), 1, config());
        let (entered_tx, entered_rx) = channel::bounded(1);
        follower
            .consume(move |_| {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_secs(2));
            })
            .unwrap();
        leader.replicate(&chunk(0));
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let started = Instant::now();
        follower.close();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
