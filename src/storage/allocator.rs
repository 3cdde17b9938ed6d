//! Segment allocation.
//!
//! Creating a segment means a free-space check, creating and
//! preallocating the file, then writing and fsyncing its header. All of it
//! is blocking file I/O, so the next segment is allocated on a dedicated
//! conductor thread while the appender keeps writing to the current one.
//!
//! ```text
//! appender ──Allocate(seg N+1)──► conductor thread
//!    ▲                                 │ allocate + header + fsync
//!    │                                 │ seg.state = ALLOCATED | ALLOCATION_FAILED
//!    └────────AllocationOutcome────────┘ (SPSC queue)
//! ```
//!
//! The first segment of a fresh log is allocated synchronously on the
//! appender's own thread with the same `SegmentAllocator`.

use super::segment::{Segment, SegmentHeader, SEGMENT_HEADER_SIZE};
use super::segment_store::{SegmentError, SegmentFile, SegmentStore};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Allocates segment files with a free-space check.
pub struct SegmentAllocator<S: SegmentStore> {
    store: Arc<S>,
    segment_size: u64,
    min_free_space: u64,
}

impl<S: SegmentStore> SegmentAllocator<S> {
    pub fn new(store: Arc<S>, segment_size: u64, min_free_space: u64) -> Self {
        debug_assert!(
            segment_size > SEGMENT_HEADER_SIZE as u64,
            "Precondition: segment larger than its header"
        );
        SegmentAllocator {
            store,
            segment_size,
            min_free_space,
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Allocate the file for `segment` and move it to ALLOCATED, or to
    /// ALLOCATION_FAILED on any error.
    pub fn allocate(&self, segment: &Segment<S::File>) -> Result<(), SegmentError> {
        match self.create_file(segment.id()) {
            Ok(file) => {
                segment.mark_allocated(file);
                debug!("allocated segment {}", segment.id());
                Ok(())
            }
            Err(e) => {
                segment.mark_allocation_failed();
                Err(e)
            }
        }
    }

    fn create_file(&self, id: u64) -> Result<S::File, SegmentError> {
        let available = self.store.available_space();
        let required = self.segment_size.saturating_add(self.min_free_space);
        if available < required {
            return Err(SegmentError::DiskFull {
                required,
                available,
            });
        }

        let file = self.store.allocate(id, self.segment_size)?;
        let header = SegmentHeader {
            segment_id: id,
            capacity: self.segment_size,
        };
        let written = file
            .write_at(0, &header.encode())
            .and_then(|_| file.sync());
        if let Err(e) = written {
            // half-initialized file would be rejected by recovery anyway
            let _ = self.store.delete(id);
            return Err(e);
        }
        Ok(file)
    }
}

/// Result of one background allocation.
#[derive(Debug)]
pub struct AllocationOutcome {
    pub segment_id: u64,
    pub result: Result<(), SegmentError>,
}

enum ConductorCommand<F: SegmentFile> {
    Allocate(Arc<Segment<F>>),
    Shutdown,
}

/// Background allocation thread.
pub struct AllocatorConductor<S: SegmentStore> {
    commands: Sender<ConductorCommand<S::File>>,
    outcomes: Receiver<AllocationOutcome>,
    thread: Option<JoinHandle<()>>,
}

impl<S: SegmentStore> AllocatorConductor<S> {
    pub fn spawn(allocator: Arc<SegmentAllocator<S>>, name: &str) -> Result<Self, SegmentError> {
        let (commands, command_rx) = channel::unbounded::<ConductorCommand<S::File>>();
        let (outcome_tx, outcomes) = channel::unbounded();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(cmd) = command_rx.recv() {
                    match cmd {
                        ConductorCommand::Allocate(segment) => {
                            let result = allocator.allocate(&segment);
                            if let Err(e) = &result {
                                error!("allocation of segment {} failed: {}", segment.id(), e);
                            }
                            let outcome = AllocationOutcome {
                                segment_id: segment.id(),
                                result,
                            };
                            if outcome_tx.send(outcome).is_err() {
                                break;
                            }
                        }
                        ConductorCommand::Shutdown => break,
                    }
                }
                info!("segment allocator stopped");
            })?;

        Ok(AllocatorConductor {
            commands,
            outcomes,
            thread: Some(thread),
        })
    }

    /// Queue allocation of a NEW segment. Returns immediately. With the
    /// thread gone the segment is marked ALLOCATION_FAILED instead.
    pub fn request(&self, segment: Arc<Segment<S::File>>) {
        if let Err(channel::SendError(ConductorCommand::Allocate(segment))) =
            self.commands.send(ConductorCommand::Allocate(segment))
        {
            error!("segment allocator gone, cannot allocate segment {}", segment.id());
            segment.mark_allocation_failed();
        }
    }

    /// False once the thread has exited, by shutdown or by panic.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Next finished allocation, if any.
    pub fn try_outcome(&self) -> Option<AllocationOutcome> {
        self.outcomes.try_recv().ok()
    }

    /// Stop the thread after it finishes any in-flight allocation.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(ConductorCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("segment allocator thread panicked");
            }
        }
    }
}

impl<S: SegmentStore> Drop for AllocatorConductor<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
