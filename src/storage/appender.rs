//! Log appender actor.
//!
//! Writers on any task push blocks into the write buffer (an unbounded
//! mpsc channel); the appender drains it in batches and appends each block
//! in arrival order. Append order is durability order: a writer's ack is
//! sent only after its block is fsynced, and a later block is never
//! attempted before an earlier one has been resolved.
//!
//! ```text
//! Writer 1 ──┐
//! Writer 2 ──┤──► write buffer ──► LogAppender ──► segment append + fsync ──► ack
//! Writer 3 ──┘                        │
//!                                     └─ next segment NEW? sleep(backoff), retry same block
//! ```
//!
//! Segment writes and fsyncs block, so they run on tokio's blocking pool
//! while the actor awaits them; the runtime's workers never wait on disk.

use super::log_storage::{AppendError, LogStorage};
use super::segment_store::SegmentStore;
use super::segmented_log::{AppendAttempt, SegmentedLogStorage};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub enum AppenderMessage {
    Append {
        block: Bytes,
        ack_tx: Option<oneshot::Sender<Result<i64, AppendError>>>,
    },
    Flush {
        response_tx: oneshot::Sender<Result<(), AppendError>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

pub struct LogAppender<S: SegmentStore> {
    log: Arc<SegmentedLogStorage<S>>,
    rx: mpsc::UnboundedReceiver<AppenderMessage>,
    max_batch: usize,
    backoff: Duration,
    batch: Vec<AppenderMessage>,
    appended: u64,
}

impl<S: SegmentStore> LogAppender<S> {
    fn new(log: Arc<SegmentedLogStorage<S>>, rx: mpsc::UnboundedReceiver<AppenderMessage>) -> Self {
        let max_batch = log.config().max_batch.max(1);
        let backoff = log.config().allocation_backoff;
        LogAppender {
            log,
            rx,
            max_batch,
            backoff,
            batch: Vec::with_capacity(max_batch),
            appended: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            let msg = match self.rx.recv().await {
                Some(msg) => msg,
                None => break,
            };
            self.batch.push(msg);
            while self.batch.len() < self.max_batch {
                match self.rx.try_recv() {
                    Ok(msg) => self.batch.push(msg),
                    Err(_) => break,
                }
            }

            let batch = std::mem::take(&mut self.batch);
            for msg in batch {
                if self.handle(msg).await {
                    return;
                }
            }
        }
        debug!(
            "partition {}: appender channel closed after {} blocks",
            self.log.partition_id(),
            self.appended
        );
    }

    /// Returns true on shutdown.
    async fn handle(&mut self, msg: AppenderMessage) -> bool {
        match msg {
            AppenderMessage::Append { block, ack_tx } => {
                let len = block.len();
                let result = self.append_block(block).await;
                if let Err(e) = &result {
                    if !e.is_fatal() {
                        warn!(
                            "partition {}: append of {} bytes failed: {}",
                            self.log.partition_id(),
                            len,
                            e
                        );
                    }
                }
                if let Some(tx) = ack_tx {
                    let _ = tx.send(result);
                }
                false
            }
            AppenderMessage::Flush { response_tx } => {
                let result = self.blocking(|log| log.flush().map_err(AppendError::from)).await;
                let _ = response_tx.send(result);
                false
            }
            AppenderMessage::Shutdown { response_tx } => {
                if let Err(e) = self.blocking(|log| log.flush().map_err(AppendError::from)).await {
                    warn!("partition {}: flush on shutdown failed: {}", self.log.partition_id(), e);
                }
                info!(
                    "partition {}: appender shutting down after {} blocks",
                    self.log.partition_id(),
                    self.appended
                );
                let _ = response_tx.send(());
                true
            }
        }
    }

    /// Run a storage call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, AppendError>
    where
        T: Send + 'static,
        F: FnOnce(&SegmentedLogStorage<S>) -> Result<T, AppendError> + Send + 'static,
    {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || f(&log))
            .await
            .map_err(|e| AppendError::Blocking(e.to_string()))?
    }

    async fn append_block(&mut self, block: Bytes) -> Result<i64, AppendError> {
        loop {
            let attempt = block.clone();
            match self.blocking(move |log| log.try_append(&attempt)).await? {
                AppendAttempt::Appended(address) => {
                    self.appended = self
                        .appended
                        .checked_add(1)
                        .expect("appended counter overflow unreachable");
                    return Ok(address);
                }
                AppendAttempt::NextSegmentNotReady => {
                    debug!(
                        "partition {}: next segment not ready, retrying in {:?}",
                        self.log.partition_id(),
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

/// Cloneable handle to a running appender.
#[derive(Clone)]
pub struct AppenderHandle {
    tx: mpsc::UnboundedSender<AppenderMessage>,
}

impl AppenderHandle {
    /// Append and wait until the block is durable.
    pub async fn append(&self, block: impl Into<Bytes>) -> Result<i64, AppendError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(AppenderMessage::Append {
                block: block.into(),
                ack_tx: Some(ack_tx),
            })
            .map_err(|_| AppendError::AppenderStopped)?;
        ack_rx.await.map_err(|_| AppendError::AppenderStopped)?
    }

    /// Queue a block without waiting for durability.
    pub fn append_fire_and_forget(&self, block: impl Into<Bytes>) -> Result<(), AppendError> {
        self.tx
            .send(AppenderMessage::Append {
                block: block.into(),
                ack_tx: None,
            })
            .map_err(|_| AppendError::AppenderStopped)
    }

    pub async fn flush(&self) -> Result<(), AppendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AppenderMessage::Flush { response_tx })
            .map_err(|_| AppendError::AppenderStopped)?;
        response_rx.await.map_err(|_| AppendError::AppenderStopped)?
    }

    /// Stop after every block queued before this call is resolved.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(AppenderMessage::Shutdown { response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Spawn the appender on the current tokio runtime. The log must be open.
pub fn spawn_appender<S: SegmentStore>(
    log: Arc<SegmentedLogStorage<S>>,
) -> (AppenderHandle, tokio::task::JoinHandle<()>) {
    debug_assert!(log.is_open(), "Precondition: log opened before spawning appender");
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = LogAppender::new(log, rx);
    let handle = tokio::spawn(actor.run());
    (AppenderHandle { tx }, handle)
}
