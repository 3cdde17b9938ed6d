//! Segmented log storage.
//!
//! Ties segments, the allocator and the read path together. One writer
//! (the appender) holds the writer lock; readers only touch the segment map
//! under a short read lock and the committed tail of one segment, so they
//! never wait on a write or an fsync.
//!
//! ## Rotation
//!
//! ```text
//! active: seg N (ACTIVE)     next: seg N+1 (NEW → ALLOCATED on conductor)
//!
//! block does not fit in N:
//!   N → FILLED
//!   N+1 ALLOCATED?  promote to ACTIVE, request N+2, retry block on N+1
//!   N+1 NEW?        NextSegmentNotReady (caller backs off, retries block)
//!   N+1 FAILED?     fatal AllocationFailed, writer halted
//! ```
//!
//! ## Recovery
//!
//! `open()` validates every `seg-NN.data` header and recovers each tail by
//! walking frames up to the first torn or corrupt one. The highest segment
//! holding data becomes active; older ones are FILLED. One empty segment
//! after it is kept as the preallocated next, any others are removed.

use super::allocator::{AllocatorConductor, SegmentAllocator};
use super::log_storage::{
    make_address, split_address, AppendError, LogStorage, ReadBatch, ReadResultProcessor,
    StorageStatus,
};
use super::segment::{frame_len, read_header, recover_tail, Segment, SegmentAppend, SegmentState};
use super::segment_store::{SegmentError, SegmentFile, SegmentStore};
use crate::config::LogConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one non-blocking append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendAttempt {
    Appended(i64),
    /// Active segment is full and the next one is still being allocated.
    /// Retry the same block after a backoff.
    NextSegmentNotReady,
}

struct WriterState<S: SegmentStore> {
    active: Arc<Segment<S::File>>,
    next: Arc<Segment<S::File>>,
    conductor: AllocatorConductor<S>,
    /// Set once allocation failed; every later append fails with it
    fatal: Option<String>,
}

pub struct SegmentedLogStorage<S: SegmentStore> {
    partition_id: u32,
    store: Arc<S>,
    config: LogConfig,
    allocator: Arc<SegmentAllocator<S>>,
    segments: RwLock<BTreeMap<u64, Arc<Segment<S::File>>>>,
    writer: Mutex<Option<WriterState<S>>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl<S: SegmentStore> SegmentedLogStorage<S> {
    pub fn new(partition_id: u32, store: Arc<S>, config: LogConfig) -> Self {
        let allocator = Arc::new(SegmentAllocator::new(
            Arc::clone(&store),
            config.segment_size,
            config.min_free_space,
        ));
        SegmentedLogStorage {
            partition_id,
            store,
            config,
            allocator,
            segments: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Largest block accepted by `append`.
    pub fn max_block_size(&self) -> usize {
        (self.config.usable_segment_size() as usize).saturating_sub(frame_len(0))
    }

    /// `(id, state, tail)` for every known segment, for tests and diagnostics.
    pub fn segment_summary(&self) -> Vec<(u64, SegmentState, u64)> {
        self.segments
            .read()
            .values()
            .map(|s| (s.id(), s.state(), s.tail_position()))
            .collect()
    }

    pub fn active_segment_id(&self) -> Option<u64> {
        self.writer.lock().as_ref().map(|w| w.active.id())
    }

    /// Append without blocking on the allocator.
    pub fn try_append(&self, block: &[u8]) -> Result<AppendAttempt, AppendError> {
        if block.is_empty() {
            return Err(AppendError::EmptyBlock);
        }
        let max = self.max_block_size();
        if block.len() > max {
            return Err(AppendError::BlockTooBig {
                size: block.len(),
                max: max as u64,
            });
        }

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(AppendError::Closed)?;
        if let Some(reason) = &writer.fatal {
            return Err(AppendError::AllocationFailed(reason.clone()));
        }

        loop {
            match writer.active.try_append(block)? {
                SegmentAppend::Appended { offset } => {
                    return Ok(AppendAttempt::Appended(make_address(
                        writer.active.id(),
                        offset,
                    )));
                }
                SegmentAppend::DoesNotFit => {
                    writer.active.mark_filled();
                    match writer.next.state() {
                        SegmentState::New if !writer.conductor.is_running() => {
                            writer.next.mark_allocation_failed();
                            let reason = format!(
                                "segment allocator stopped before allocating segment {}",
                                writer.next.id()
                            );
                            error!("partition {}: {}, halting writer", self.partition_id, reason);
                            writer.fatal = Some(reason.clone());
                            return Err(AppendError::AllocationFailed(reason));
                        }
                        SegmentState::New => return Ok(AppendAttempt::NextSegmentNotReady),
                        SegmentState::AllocationFailed => {
                            let reason = self.drain_failure(writer);
                            error!(
                                "partition {}: next segment {} allocation failed, halting writer: {}",
                                self.partition_id,
                                writer.next.id(),
                                reason
                            );
                            writer.fatal = Some(reason.clone());
                            return Err(AppendError::AllocationFailed(reason));
                        }
                        SegmentState::Allocated => self.promote(writer),
                        state => {
                            debug_assert!(false, "next segment in state {:?}", state);
                            return Err(AppendError::AllocationFailed(format!(
                                "next segment in unexpected state {:?}",
                                state
                            )));
                        }
                    }
                }
            }
        }
    }

    fn promote(&self, writer: &mut WriterState<S>) {
        while writer.conductor.try_outcome().is_some() {}

        writer.next.activate();
        writer.active = Arc::clone(&writer.next);
        let next_id = writer
            .active
            .id()
            .checked_add(1)
            .expect("segment id overflow unreachable");
        writer.next = self.register_new(next_id);
        writer.conductor.request(Arc::clone(&writer.next));

        debug!(
            "partition {}: rotated to segment {}, requested {}",
            self.partition_id,
            writer.active.id(),
            next_id
        );
    }

    fn drain_failure(&self, writer: &WriterState<S>) -> String {
        let mut reason = None;
        while let Some(outcome) = writer.conductor.try_outcome() {
            if let Err(e) = outcome.result {
                reason = Some(e.to_string());
            }
        }
        reason.unwrap_or_else(|| format!("segment {} allocation failed", writer.next.id()))
    }

    fn register_new(&self, id: u64) -> Arc<Segment<S::File>> {
        let segment = Arc::new(Segment::new(id, self.config.usable_segment_size()));
        self.segments.write().insert(id, Arc::clone(&segment));
        segment
    }

    /// Load segments from the store. Returns (active, optional preallocated next).
    fn recover(
        &self,
    ) -> Result<(Arc<Segment<S::File>>, Option<Arc<Segment<S::File>>>), AppendError> {
        let _guard = crate::suppress_buggify!();
        let mut found = Vec::new();
        let mut headerless = Vec::new();
        for id in self.store.list()? {
            let file = self.store.open(id)?;
            match read_header(&file) {
                Ok(header) if header.segment_id == id => {
                    let tail = recover_tail(&file)?;
                    found.push((id, file, tail));
                }
                Ok(header) => {
                    return Err(SegmentError::InvalidHeader(format!(
                        "file seg-{:02} claims id {}",
                        id, header.segment_id
                    ))
                    .into());
                }
                Err(e) => headerless.push((id, e)),
            }
        }

        // a crash during allocation leaves a headerless file after the data
        let last_with_data = found
            .iter()
            .filter(|(_, _, tail)| *tail > 0)
            .map(|(id, _, _)| *id)
            .max()
            .unwrap_or(0);
        for (id, e) in headerless {
            if id < last_with_data {
                return Err(e.into());
            }
            warn!(
                "partition {}: discarding segment {} with invalid header: {}",
                self.partition_id, id, e
            );
            self.store.delete(id)?;
        }

        if found.is_empty() {
            let segment = self.register_new(1);
            self.allocator.allocate(&segment)?;
            segment.activate();
            info!("partition {}: created segment 1", self.partition_id);
            return Ok((segment, None));
        }

        let active_idx = found
            .iter()
            .rposition(|(_, _, tail)| *tail > 0)
            .unwrap_or(0);
        let mut active: Option<Arc<Segment<S::File>>> = None;
        let mut next = None;
        let mut map = self.segments.write();
        for (idx, (id, file, tail)) in found.into_iter().enumerate() {
            if idx < active_idx {
                map.insert(id, Arc::new(Segment::recovered(id, file, tail, SegmentState::Filled)));
            } else if idx == active_idx {
                let segment = Arc::new(Segment::recovered(id, file, tail, SegmentState::Active));
                map.insert(id, Arc::clone(&segment));
                active = Some(segment);
            } else if next.is_none()
                && Some(id) == active.as_ref().map(|a| a.id() + 1)
            {
                let segment =
                    Arc::new(Segment::recovered(id, file, tail, SegmentState::Allocated));
                map.insert(id, Arc::clone(&segment));
                next = Some(segment);
            } else {
                drop(file);
                self.store.delete(id)?;
            }
        }
        drop(map);

        let active = active.ok_or_else(|| {
            AppendError::AllocationFailed("no active segment after recovery".to_string())
        })?;
        info!(
            "partition {}: recovered {} segments, active segment {} at tail {}",
            self.partition_id,
            self.segments.read().len(),
            active.id(),
            active.tail_position()
        );
        Ok((active, next))
    }

    fn segment(&self, id: u64) -> Option<Arc<Segment<S::File>>> {
        self.segments.read().get(&id).cloned()
    }
}

impl<S: SegmentStore> LogStorage for SegmentedLogStorage<S> {
    fn open(&self) -> Result<(), AppendError> {
        let mut guard = self.writer.lock();
        if guard.is_some() {
            return Ok(());
        }
        self.segments.write().clear();

        let (active, next) = self.recover()?;
        let conductor = AllocatorConductor::spawn(
            Arc::clone(&self.allocator),
            &format!("segment-allocator-{}", self.partition_id),
        )?;
        let next = match next {
            Some(next) => next,
            None => {
                let next_id = active
                    .id()
                    .checked_add(1)
                    .expect("segment id overflow unreachable");
                let next = self.register_new(next_id);
                conductor.request(Arc::clone(&next));
                next
            }
        };

        *guard = Some(WriterState {
            active,
            next,
            conductor,
            fatal: None,
        });
        self.closed.store(false, Ordering::Release);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        let mut guard = self.writer.lock();
        if let Some(mut writer) = guard.take() {
            writer.conductor.shutdown();
            if let Err(e) = writer.active.file().map_or(Ok(()), |f| f.sync()) {
                warn!("partition {}: final sync failed: {}", self.partition_id, e);
            }
            info!("partition {}: log closed", self.partition_id);
        }
        self.open.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn append(&self, block: &[u8]) -> Result<i64, AppendError> {
        loop {
            match self.try_append(block)? {
                AppendAttempt::Appended(address) => return Ok(address),
                AppendAttempt::NextSegmentNotReady => {
                    std::thread::sleep(self.config.allocation_backoff)
                }
            }
        }
    }

    fn read_with(
        &self,
        buf: &mut [u8],
        address: i64,
        processor: &dyn ReadResultProcessor,
    ) -> Result<ReadBatch, StorageStatus> {
        if !self.is_open() {
            return Err(StorageStatus::InvalidAddress);
        }
        let (mut segment_id, mut offset) =
            split_address(address).ok_or(StorageStatus::InvalidAddress)?;

        loop {
            let segment = self
                .segment(segment_id)
                .ok_or(StorageStatus::InvalidAddress)?;
            match segment.state() {
                SegmentState::New | SegmentState::Allocated => {
                    if offset == 0 {
                        return Err(StorageStatus::NoData);
                    }
                    return Err(StorageStatus::InvalidAddress);
                }
                SegmentState::AllocationFailed => return Err(StorageStatus::InvalidAddress),
                SegmentState::Active | SegmentState::Filled => {}
            }

            let tail = segment.tail_position();
            if offset > tail {
                return Err(StorageStatus::InvalidAddress);
            }
            if offset == tail {
                if segment.state() == SegmentState::Filled {
                    segment_id += 1;
                    offset = 0;
                    continue;
                }
                return Err(StorageStatus::NoData);
            }

            let copied = segment.read_committed(offset, buf).map_err(|e| {
                warn!(
                    "partition {}: read of segment {} failed: {}",
                    self.partition_id, segment_id, e
                );
                StorageStatus::InvalidAddress
            })?;
            let len = processor.process(buf, copied)?;
            // committed data exists at this offset, so nothing consumed means
            // the buffer cannot hold the next block
            if len == 0 {
                return Err(StorageStatus::InsufficientBufferCapacity);
            }
            return Ok(ReadBatch {
                next_address: make_address(segment_id, offset + len as u64),
                len,
            });
        }
    }

    fn delete(&self, upper_bound: i64) -> Result<usize, SegmentError> {
        let Some((bound_segment, _)) = split_address(upper_bound) else {
            return Ok(0);
        };
        let removable: Vec<u64> = self
            .segments
            .read()
            .values()
            .filter(|s| s.id() < bound_segment && s.state() == SegmentState::Filled)
            .map(|s| s.id())
            .collect();

        for id in &removable {
            self.segments.write().remove(id);
            self.store.delete(*id)?;
        }
        if !removable.is_empty() {
            info!(
                "partition {}: deleted {} segments below {}",
                self.partition_id,
                removable.len(),
                bound_segment
            );
        }
        Ok(removable.len())
    }

    fn first_block_address(&self) -> Result<i64, StorageStatus> {
        self.segments
            .read()
            .values()
            .find(|s| {
                matches!(s.state(), SegmentState::Active | SegmentState::Filled)
                    && s.tail_position() > 0
            })
            .map(|s| make_address(s.id(), 0))
            .ok_or(StorageStatus::NoData)
    }

    fn flush(&self) -> Result<(), SegmentError> {
        let guard = self.writer.lock();
        match guard.as_ref().and_then(|w| w.active.file()) {
            Some(file) => file.sync(),
            None => Ok(()),
        }
    }
}

impl<S: SegmentStore> Drop for SegmentedLogStorage<S> {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::{BlockIter, FRAME_OVERHEAD, SEGMENT_HEADER_SIZE};
    use crate::storage::segment_store::InMemorySegmentStore;
    use std::time::{Duration, Instant};

    fn config(segment_size: u64) -> LogConfig {
        LogConfig {
            segment_size,
            disk_budget: 1 << 20,
            ..LogConfig::test()
        }
    }

    fn open_log(
        store: &Arc<InMemorySegmentStore>,
        segment_size: u64,
    ) -> SegmentedLogStorage<InMemorySegmentStore> {
        let log = SegmentedLogStorage::new(1, Arc::clone(store), config(segment_size));
        log.open().unwrap();
        log
    }

    fn wait_next_allocated(log: &SegmentedLogStorage<InMemorySegmentStore>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let ready = log
                .writer
                .lock()
                .as_ref()
                .map(|w| w.next.state() == SegmentState::Allocated)
                .unwrap_or(false);
            if ready {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("next segment never allocated");
    }

    fn read_all(log: &SegmentedLogStorage<InMemorySegmentStore>) -> Vec<Vec<u8>> {
        let mut blocks = Vec::new();
        let mut buf = vec![0u8; 4096];
        let Ok(mut address) = log.first_block_address() else {
            return blocks;
        };
        while let Ok(batch) = log.read(&mut buf, address) {
            blocks.extend(BlockIter::new(&buf[..batch.len]).map(|b| b.to_vec()));
            address = batch.next_address;
        }
        blocks
    }

    #[test]
    fn test_rotation_scenario() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let segment_size = 1024;
        let capacity = config(segment_size).usable_segment_size();
        let log = open_log(&store, segment_size);
        wait_next_allocated(&log);

        let first = vec![1u8; (capacity - 100) as usize - FRAME_OVERHEAD];
        let second = vec![2u8; 150 - FRAME_OVERHEAD];
        let third = vec![3u8; 50 - FRAME_OVERHEAD];

        let a1 = log.append(&first).unwrap();
        assert_eq!(split_address(a1), Some((1, 0)));
        let a2 = log.append(&second).unwrap();
        assert_eq!(split_address(a2), Some((2, 0)));
        let a3 = log.append(&third).unwrap();
        assert_eq!(split_address(a3), Some((2, 150)));

        let summary = log.segment_summary();
        assert_eq!(summary[0], (1, SegmentState::Filled, capacity - 100));
        assert_eq!(summary[1], (2, SegmentState::Active, 200));
        assert_eq!(summary[2].0, 3);

        assert_eq!(read_all(&log), vec![first, second, third]);
    }

    #[test]
    fn test_block_too_big_rejected() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let log = open_log(&store, 512);
        let err = log.append(&vec![0u8; 512]).unwrap_err();
        assert_eq!(err.status(), Some(StorageStatus::BlockSizeTooBig));

        let exact = vec![5u8; log.max_block_size()];
        assert!(log.append(&exact).is_ok());
    }

    #[test]
    fn test_next_not_ready_then_promotes() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let log = open_log(&store, 256);
        let block = vec![1u8; log.max_block_size()];
        log.append(&block).unwrap();

        // the conductor may or may not have finished; either way the block lands
        let attempt = log.try_append(&block).unwrap();
        if attempt == AppendAttempt::NextSegmentNotReady {
            wait_next_allocated(&log);
            assert!(matches!(log.try_append(&block).unwrap(), AppendAttempt::Appended(_)));
        }
        assert_eq!(log.active_segment_id(), Some(2));
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        // budget holds exactly one segment
        let store = Arc::new(InMemorySegmentStore::new(256));
        let log = SegmentedLogStorage::new(
            1,
            Arc::clone(&store),
            LogConfig {
                segment_size: 256,
                disk_budget: 256,
                ..LogConfig::test()
            },
        );
        log.open().unwrap();
        let block = vec![1u8; log.max_block_size()];
        log.append(&block).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match log.try_append(&block) {
                Err(e) => break e,
                Ok(AppendAttempt::NextSegmentNotReady) => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(AppendAttempt::Appended(_)) => panic!("append must not succeed"),
            }
        };
        assert!(err.is_fatal(), "{}", err);
        assert!(log.append(b"x").unwrap_err().is_fatal());
    }

    /// Allocates the first segment, then panics on the allocator thread.
    struct FirstSegmentOnly(InMemorySegmentStore);

    impl SegmentStore for FirstSegmentOnly {
        type File = crate::storage::segment_store::InMemorySegmentFile;

        fn allocate(&self, id: u64, capacity: u64) -> Result<Self::File, SegmentError> {
            if id > 1 {
                panic!("allocator thread dies on segment {}", id);
            }
            self.0.allocate(id, capacity)
        }

        fn open(&self, id: u64) -> Result<Self::File, SegmentError> {
            self.0.open(id)
        }

        fn list(&self) -> Result<Vec<u64>, SegmentError> {
            self.0.list()
        }

        fn delete(&self, id: u64) -> Result<(), SegmentError> {
            self.0.delete(id)
        }

        fn available_space(&self) -> u64 {
            self.0.available_space()
        }
    }

    #[test]
    fn test_dead_allocator_is_fatal() {
        let store = Arc::new(FirstSegmentOnly(InMemorySegmentStore::new(1 << 20)));
        let log = SegmentedLogStorage::new(
            1,
            store,
            LogConfig {
                segment_size: 256,
                ..LogConfig::test()
            },
        );
        log.open().unwrap();
        let block = vec![1u8; log.max_block_size()];
        log.append(&block).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match log.try_append(&block) {
                Err(e) => break e,
                Ok(AppendAttempt::NextSegmentNotReady) => {
                    assert!(Instant::now() < deadline, "writer kept waiting on a dead allocator");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(AppendAttempt::Appended(_)) => panic!("append must not succeed"),
            }
        };
        assert!(err.is_fatal(), "{}", err);
        assert!(log.try_append(b"x").unwrap_err().is_fatal());
        assert!(log
            .segment_summary()
            .iter()
            .any(|(id, state, _)| *id == 2 && *state == SegmentState::AllocationFailed));
    }

    #[test]
    fn test_read_statuses() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let log = open_log(&store, 1024);
        assert_eq!(log.first_block_address(), Err(StorageStatus::NoData));

        let address = log.append(&[7u8; 100]).unwrap();
        let mut small = [0u8; 16];
        assert_eq!(
            log.read(&mut small, address),
            Err(StorageStatus::InsufficientBufferCapacity)
        );

        let mut buf = [0u8; 256];
        let batch = log.read(&mut buf, address).unwrap();
        assert_eq!(batch.len, 108);
        assert_eq!(log.read(&mut buf, batch.next_address), Err(StorageStatus::NoData));
        assert_eq!(log.read(&mut buf, -5), Err(StorageStatus::InvalidAddress));
        assert_eq!(
            log.read(&mut buf, make_address(1, 5000)),
            Err(StorageStatus::InvalidAddress)
        );
        assert_eq!(
            log.read(&mut buf, make_address(40, 0)),
            Err(StorageStatus::InvalidAddress)
        );
    }

    #[test]
    fn test_empty_buffer_read_reports_capacity() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let log = open_log(&store, 1024);
        let address = log.append(b"hello").unwrap();

        let mut empty: [u8; 0] = [];
        assert_eq!(
            log.read(&mut empty, address),
            Err(StorageStatus::InsufficientBufferCapacity)
        );
        // at the tail there is nothing to fit, so it stays NoData
        let mut buf = [0u8; 64];
        let next = log.read(&mut buf, address).unwrap().next_address;
        assert_eq!(log.read(&mut empty, next), Err(StorageStatus::NoData));
    }

    #[test]
    fn test_reopen_recovers_and_discards_torn_block() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        {
            let log = open_log(&store, 512);
            for i in 0..10u8 {
                log.append(&[i; 60]).unwrap();
            }
            log.close();
            assert!(log.is_closed());
        }
        let before = {
            let log = open_log(&store, 512);
            let blocks = read_all(&log);
            assert_eq!(blocks.len(), 10);
            log.segment_summary()
        };

        // torn write past the committed tail of the active segment
        let (active_id, _, tail) = *before
            .iter()
            .filter(|(_, _, tail)| *tail > 0)
            .last()
            .unwrap();
        store.corrupt(
            active_id,
            SEGMENT_HEADER_SIZE as u64 + tail,
            &[40, 0, 0, 0, 1, 2, 3, 4, 9, 9],
        );

        let log = open_log(&store, 512);
        let blocks = read_all(&log);
        assert_eq!(blocks.len(), 10);
        assert_eq!(blocks[9], vec![9u8; 60]);
        assert!(matches!(log.append(&[10u8; 60]), Ok(_)));
        assert_eq!(read_all(&log).len(), 11);
    }

    #[test]
    fn test_delete_removes_filled_segments_only() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let log = open_log(&store, 256);
        let mut addresses = Vec::new();
        for i in 0..6u8 {
            addresses.push(log.append(&[i; 100]).unwrap());
        }
        let last = *addresses.last().unwrap();
        let (last_segment, _) = split_address(last).unwrap();
        assert!(last_segment >= 3);

        let removed = log.delete(last).unwrap();
        assert_eq!(removed as u64, last_segment - 1);
        assert_eq!(
            log.first_block_address().map(split_address),
            Ok(Some((last_segment, 0)))
        );
        let mut buf = [0u8; 256];
        assert_eq!(log.read(&mut buf, addresses[0]), Err(StorageStatus::InvalidAddress));

        // deleting at the active segment never removes it
        assert_eq!(log.delete(make_address(last_segment + 5, 0)).unwrap(), 0);
    }

    #[test]
    fn test_crash_loses_nothing_acknowledged() {
        let store = Arc::new(InMemorySegmentStore::new(1 << 20));
        let mut acked = Vec::new();
        {
            let log = open_log(&store, 512);
            for i in 0..20u8 {
                log.append(&[i; 30]).unwrap();
                acked.push(vec![i; 30]);
            }
            store.simulate_crash();
        }
        let log = open_log(&store, 512);
        assert_eq!(read_all(&log), acked);
    }
}
