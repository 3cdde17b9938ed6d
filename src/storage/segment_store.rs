//! Segment file storage abstraction.
//!
//! Segments are fixed-capacity files named `seg-NN.data`. Files are
//! preallocated to their full capacity when the allocator creates them, so
//! appends never grow a file and never hit ENOSPC mid-block.
//!
//! ## Implementations
//!
//! - `InMemorySegmentStore`: unit tests and DST (tracks synced bytes for crash simulation)
//! - `LocalSegmentStore`: production (`std::fs::File`, positional I/O, `sync_data`)
//! - `SimulatedSegmentStore`: DST with buggify fault injection
//!
//! `SegmentFile` methods take `&self`: the appender writes at the tail while
//! readers copy committed bytes below it from other threads.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment {0} not found")]
    NotFound(u64),
    #[error("disk full: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },
    #[error("fsync failed: {0}")]
    FsyncFailed(String),
    #[error("partial write: expected {expected} bytes, wrote {actual}")]
    PartialWrite { expected: usize, actual: usize },
    #[error("invalid segment header: {0}")]
    InvalidHeader(String),
    #[error("write past segment end: offset {offset} + {len} > {capacity}")]
    OutOfBounds { offset: u64, len: usize, capacity: u64 },
}

/// One preallocated segment file.
pub trait SegmentFile: Send + Sync + 'static {
    /// Write `data` at `offset`. The bytes are not durable until `sync`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SegmentError>;
    /// Copy bytes starting at `offset` into `buf`; returns the count copied
    /// (short only at end of file).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SegmentError>;
    fn sync(&self) -> Result<(), SegmentError>;
    /// File size in bytes, header included.
    fn len(&self) -> u64;
}

/// Directory of segment files.
pub trait SegmentStore: Send + Sync + 'static {
    type File: SegmentFile;

    /// Create and preallocate a new segment file of `capacity` bytes.
    fn allocate(&self, id: u64, capacity: u64) -> Result<Self::File, SegmentError>;
    fn open(&self, id: u64) -> Result<Self::File, SegmentError>;
    /// Segment ids present, ascending.
    fn list(&self) -> Result<Vec<u64>, SegmentError>;
    fn delete(&self, id: u64) -> Result<(), SegmentError>;
    /// Bytes that may still be allocated.
    fn available_space(&self) -> u64;
}

pub fn segment_file_name(id: u64) -> String {
    format!("seg-{:02}.data", id)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("seg-")?
        .strip_suffix(".data")?
        .parse()
        .ok()
}

fn check_bounds(offset: u64, len: usize, capacity: u64) -> Result<(), SegmentError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(SegmentError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

// ============================================================================
// InMemorySegmentStore
// ============================================================================

#[derive(Debug)]
struct MemFile {
    /// What readers see (page cache)
    data: Vec<u8>,
    /// What survives a crash
    durable: Vec<u8>,
    /// Writes since the last sync, in order
    unsynced: Vec<(u64, Vec<u8>)>,
}

impl MemFile {
    fn new(capacity: u64) -> Self {
        MemFile {
            data: vec![0; capacity as usize],
            durable: vec![0; capacity as usize],
            unsynced: Vec::new(),
        }
    }
}

/// In-memory segment store for unit tests and deterministic simulation.
#[derive(Debug, Clone)]
pub struct InMemorySegmentStore {
    files: Arc<Mutex<BTreeMap<u64, Arc<Mutex<MemFile>>>>>,
    budget: u64,
}

impl InMemorySegmentStore {
    pub fn new(budget: u64) -> Self {
        InMemorySegmentStore {
            files: Arc::new(Mutex::new(BTreeMap::new())),
            budget,
        }
    }

    /// Drop every unsynced write, as a power loss would.
    pub fn simulate_crash(&self) {
        let files = self.files.lock();
        for file in files.values() {
            let mut f = file.lock();
            f.data = f.durable.clone();
            f.unsynced.clear();
        }
    }

    /// Overwrite raw bytes, bypassing the write path (torn-write simulation).
    pub fn corrupt(&self, id: u64, offset: u64, bytes: &[u8]) {
        if let Some(file) = self.files.lock().get(&id) {
            let mut f = file.lock();
            let start = offset as usize;
            let end = (start + bytes.len()).min(f.data.len());
            let n = end.saturating_sub(start);
            f.data[start..end].copy_from_slice(&bytes[..n]);
            f.durable[start..end].copy_from_slice(&bytes[..n]);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

#[derive(Debug, Clone)]
pub struct InMemorySegmentFile {
    inner: Arc<Mutex<MemFile>>,
    capacity: u64,
}

impl SegmentFile for InMemorySegmentFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SegmentError> {
        check_bounds(offset, data.len(), self.capacity)?;
        let mut f = self.inner.lock();
        let start = offset as usize;
        f.data[start..start + data.len()].copy_from_slice(data);
        f.unsynced.push((offset, data.to_vec()));
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SegmentError> {
        let f = self.inner.lock();
        let start = (offset as usize).min(f.data.len());
        let n = buf.len().min(f.data.len() - start);
        buf[..n].copy_from_slice(&f.data[start..start + n]);
        Ok(n)
    }

    fn sync(&self) -> Result<(), SegmentError> {
        let mut f = self.inner.lock();
        let pending = std::mem::take(&mut f.unsynced);
        for (offset, bytes) in pending {
            let start = offset as usize;
            f.durable[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.capacity
    }
}

impl SegmentStore for InMemorySegmentStore {
    type File = InMemorySegmentFile;

    fn allocate(&self, id: u64, capacity: u64) -> Result<Self::File, SegmentError> {
        let available = self.available_space();
        if capacity > available {
            return Err(SegmentError::DiskFull {
                required: capacity,
                available,
            });
        }
        let mut files = self.files.lock();
        if files.contains_key(&id) {
            return Err(SegmentError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                segment_file_name(id),
            )));
        }
        let inner = Arc::new(Mutex::new(MemFile::new(capacity)));
        files.insert(id, Arc::clone(&inner));
        Ok(InMemorySegmentFile { inner, capacity })
    }

    fn open(&self, id: u64) -> Result<Self::File, SegmentError> {
        let files = self.files.lock();
        let inner = files.get(&id).ok_or(SegmentError::NotFound(id))?;
        let capacity = inner.lock().data.len() as u64;
        Ok(InMemorySegmentFile {
            inner: Arc::clone(inner),
            capacity,
        })
    }

    fn list(&self) -> Result<Vec<u64>, SegmentError> {
        Ok(self.files.lock().keys().copied().collect())
    }

    fn delete(&self, id: u64) -> Result<(), SegmentError> {
        self.files
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(SegmentError::NotFound(id))
    }

    fn available_space(&self) -> u64 {
        let used: u64 = self
            .files
            .lock()
            .values()
            .map(|f| f.lock().data.len() as u64)
            .sum();
        self.budget.saturating_sub(used)
    }
}

// ============================================================================
// LocalSegmentStore
// ============================================================================

/// Filesystem-backed segment store. Free space is the configured disk
/// budget minus the size of the segment files already present.
#[derive(Debug, Clone)]
pub struct LocalSegmentStore {
    dir: PathBuf,
    budget: u64,
}

impl LocalSegmentStore {
    pub fn new(dir: PathBuf, budget: u64) -> Result<Self, SegmentError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalSegmentStore { dir, budget })
    }

    fn file_path(&self, id: u64) -> PathBuf {
        self.dir.join(segment_file_name(id))
    }
}

#[derive(Debug)]
pub struct LocalSegmentFile {
    file: std::fs::File,
    capacity: u64,
}

#[cfg(unix)]
impl SegmentFile for LocalSegmentFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SegmentError> {
        use std::os::unix::fs::FileExt;
        check_bounds(offset, data.len(), self.capacity)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SegmentError> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn sync(&self) -> Result<(), SegmentError> {
        self.file
            .sync_data()
            .map_err(|e| SegmentError::FsyncFailed(e.to_string()))
    }

    fn len(&self) -> u64 {
        self.capacity
    }
}

#[cfg(unix)]
impl SegmentStore for LocalSegmentStore {
    type File = LocalSegmentFile;

    fn allocate(&self, id: u64, capacity: u64) -> Result<Self::File, SegmentError> {
        let available = self.available_space();
        if capacity > available {
            return Err(SegmentError::DiskFull {
                required: capacity,
                available,
            });
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.file_path(id))?;
        file.set_len(capacity)?;
        file.sync_all()?;
        Ok(LocalSegmentFile { file, capacity })
    }

    fn open(&self, id: u64) -> Result<Self::File, SegmentError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(id))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SegmentError::NotFound(id),
                _ => SegmentError::Io(e),
            })?;
        let capacity = file.metadata()?.len();
        Ok(LocalSegmentFile { file, capacity })
    }

    fn list(&self) -> Result<Vec<u64>, SegmentError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn delete(&self, id: u64) -> Result<(), SegmentError> {
        std::fs::remove_file(self.file_path(id)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SegmentError::NotFound(id),
            _ => SegmentError::Io(e),
        })
    }

    fn available_space(&self) -> u64 {
        let used: u64 = self
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| std::fs::metadata(self.file_path(id)).ok())
            .map(|m| m.len())
            .sum();
        self.budget.saturating_sub(used)
    }
}

// ============================================================================
// SimulatedSegmentStore - For DST with buggify fault injection
// ============================================================================

use crate::buggify::faults::disk as disk_faults;
use crate::io::Rng;

#[derive(Debug, Clone)]
pub struct SimulatedSegmentStoreConfig {
    pub write_fail_prob: f64,
    pub partial_write_prob: f64,
    pub fsync_fail_prob: f64,
    pub allocate_fail_prob: f64,
    pub disk_full_prob: f64,
}

impl Default for SimulatedSegmentStoreConfig {
    fn default() -> Self {
        SimulatedSegmentStoreConfig {
            write_fail_prob: 0.01,
            partial_write_prob: 0.005,
            fsync_fail_prob: 0.005,
            allocate_fail_prob: 0.0,
            disk_full_prob: 0.0,
        }
    }
}

impl SimulatedSegmentStoreConfig {
    pub fn no_faults() -> Self {
        SimulatedSegmentStoreConfig {
            write_fail_prob: 0.0,
            partial_write_prob: 0.0,
            fsync_fail_prob: 0.0,
            allocate_fail_prob: 0.0,
            disk_full_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedSegmentStoreConfig {
            write_fail_prob: 0.05,
            partial_write_prob: 0.02,
            fsync_fail_prob: 0.02,
            allocate_fail_prob: 0.0,
            disk_full_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedSegmentStoreStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub partial_writes: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub allocations: u64,
    pub allocation_failures: u64,
}

struct SimulatedInner<R: Rng> {
    rng: R,
    stats: SimulatedSegmentStoreStats,
}

/// `InMemorySegmentStore` with injected disk faults.
pub struct SimulatedSegmentStore<R: Rng> {
    inner: InMemorySegmentStore,
    config: SimulatedSegmentStoreConfig,
    state: Arc<Mutex<SimulatedInner<R>>>,
}

impl<R: Rng> SimulatedSegmentStore<R> {
    pub fn new(rng: R, budget: u64, config: SimulatedSegmentStoreConfig) -> Self {
        SimulatedSegmentStore {
            inner: InMemorySegmentStore::new(budget),
            config,
            state: Arc::new(Mutex::new(SimulatedInner {
                rng,
                stats: SimulatedSegmentStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedSegmentStoreStats {
        self.state.lock().stats.clone()
    }

    /// Underlying store, for crash simulation.
    pub fn inner_store(&self) -> &InMemorySegmentStore {
        &self.inner
    }

    fn wrap(&self, file: InMemorySegmentFile) -> SimulatedSegmentFile<R> {
        SimulatedSegmentFile {
            inner: file,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Rng> Clone for SimulatedSegmentStore<R> {
    fn clone(&self) -> Self {
        SimulatedSegmentStore {
            inner: self.inner.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

pub struct SimulatedSegmentFile<R: Rng> {
    inner: InMemorySegmentFile,
    config: SimulatedSegmentStoreConfig,
    state: Arc<Mutex<SimulatedInner<R>>>,
}

impl<R: Rng> SegmentFile for SimulatedSegmentFile<R> {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), SegmentError> {
        let partial = {
            let mut s = self.state.lock();
            let s = &mut *s;
            s.stats.write_attempts = s.stats.write_attempts.saturating_add(1);
            if crate::buggify!(&mut s.rng, disk_faults::WRITE_FAIL, self.config.write_fail_prob) {
                s.stats.write_failures = s.stats.write_failures.saturating_add(1);
                return Err(SegmentError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    "simulated write failure",
                )));
            }
            data.len() > 1
                && crate::buggify!(
                    &mut s.rng,
                    disk_faults::PARTIAL_WRITE,
                    self.config.partial_write_prob
                )
        };

        if partial {
            let actual = data.len() / 2;
            self.inner.write_at(offset, &data[..actual])?;
            let mut s = self.state.lock();
            s.stats.partial_writes = s.stats.partial_writes.saturating_add(1);
            return Err(SegmentError::PartialWrite {
                expected: data.len(),
                actual,
            });
        }
        self.inner.write_at(offset, data)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SegmentError> {
        self.inner.read_at(offset, buf)
    }

    fn sync(&self) -> Result<(), SegmentError> {
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            s.stats.sync_attempts = s.stats.sync_attempts.saturating_add(1);
            if crate::buggify!(&mut s.rng, disk_faults::FSYNC_FAIL, self.config.fsync_fail_prob) {
                s.stats.sync_failures = s.stats.sync_failures.saturating_add(1);
                return Err(SegmentError::FsyncFailed("simulated fsync failure".to_string()));
            }
        }
        self.inner.sync()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

impl<R: Rng> SegmentStore for SimulatedSegmentStore<R> {
    type File = SimulatedSegmentFile<R>;

    fn allocate(&self, id: u64, capacity: u64) -> Result<Self::File, SegmentError> {
        {
            let mut s = self.state.lock();
            let s = &mut *s;
            s.stats.allocations = s.stats.allocations.saturating_add(1);
            if crate::buggify!(&mut s.rng, disk_faults::DISK_FULL, self.config.disk_full_prob) {
                s.stats.allocation_failures = s.stats.allocation_failures.saturating_add(1);
                return Err(SegmentError::DiskFull {
                    required: capacity,
                    available: 0,
                });
            }
            if crate::buggify!(
                &mut s.rng,
                disk_faults::ALLOCATE_FAIL,
                self.config.allocate_fail_prob
            ) {
                s.stats.allocation_failures = s.stats.allocation_failures.saturating_add(1);
                return Err(SegmentError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    "simulated allocation failure",
                )));
            }
        }
        let file = self.inner.allocate(id, capacity)?;
        Ok(self.wrap(file))
    }

    fn open(&self, id: u64) -> Result<Self::File, SegmentError> {
        let file = self.inner.open(id)?;
        Ok(self.wrap(file))
    }

    fn list(&self) -> Result<Vec<u64>, SegmentError> {
        self.inner.list()
    }

    fn delete(&self, id: u64) -> Result<(), SegmentError> {
        self.inner.delete(id)
    }

    fn available_space(&self) -> u64 {
        self.inner.available_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buggify::{self, FaultConfig};
    use crate::io::simulation::SimulatedRng;

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name(1), "seg-01.data");
        assert_eq!(segment_file_name(123), "seg-123.data");
        assert_eq!(parse_segment_file_name("seg-07.data"), Some(7));
        assert_eq!(parse_segment_file_name("seg-07.tmp"), None);
        assert_eq!(parse_segment_file_name("wal-07.data"), None);
    }

    #[test]
    fn test_inmemory_write_read() {
        let store = InMemorySegmentStore::new(1024);
        let file = store.allocate(1, 64).unwrap();
        file.write_at(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(10, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert!(file.write_at(62, b"abc").is_err());
    }

    #[test]
    fn test_inmemory_crash_loses_unsynced() {
        let store = InMemorySegmentStore::new(1024);
        let file = store.allocate(1, 64).unwrap();
        file.write_at(0, b"durable").unwrap();
        file.sync().unwrap();
        file.write_at(7, b"lost").unwrap();
        store.simulate_crash();

        let mut buf = [0u8; 11];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..7], b"durable");
        assert_eq!(&buf[7..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_inmemory_budget() {
        let store = InMemorySegmentStore::new(100);
        store.allocate(1, 60).unwrap();
        assert_eq!(store.available_space(), 40);
        assert!(matches!(
            store.allocate(2, 60),
            Err(SegmentError::DiskFull { required: 60, available: 40 })
        ));
        store.delete(1).unwrap();
        assert_eq!(store.available_space(), 100);
        assert!(matches!(store.delete(1), Err(SegmentError::NotFound(1))));
    }

    #[test]
    fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSegmentStore::new(dir.path().to_path_buf(), 1 << 20).unwrap();

        let file = store.allocate(3, 4096).unwrap();
        file.write_at(100, b"block").unwrap();
        file.sync().unwrap();
        assert!(dir.path().join("seg-03.data").exists());
        assert_eq!(store.available_space(), (1 << 20) - 4096);

        let reopened = store.open(3).unwrap();
        assert_eq!(reopened.len(), 4096);
        let mut buf = [0u8; 5];
        reopened.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"block");

        store.allocate(1, 4096).unwrap();
        assert_eq!(store.list().unwrap(), vec![1, 3]);
        store.delete(3).unwrap();
        assert!(matches!(store.open(3), Err(SegmentError::NotFound(3))));
    }

    #[test]
    fn test_simulated_no_faults() {
        buggify::set_config(FaultConfig::new());
        let store = SimulatedSegmentStore::new(
            SimulatedRng::new(42),
            1 << 20,
            SimulatedSegmentStoreConfig::no_faults(),
        );
        let file = store.allocate(1, 256).unwrap();
        file.write_at(0, b"abc").unwrap();
        file.sync().unwrap();

        let stats = store.stats();
        assert_eq!(stats.write_attempts, 1);
        assert_eq!(stats.write_failures, 0);
        assert_eq!(stats.sync_failures, 0);
    }

    #[test]
    fn test_simulated_fsync_failure() {
        buggify::set_config(FaultConfig::new());
        let store = SimulatedSegmentStore::new(
            SimulatedRng::new(42),
            1 << 20,
            SimulatedSegmentStoreConfig {
                fsync_fail_prob: 1.0,
                ..SimulatedSegmentStoreConfig::no_faults()
            },
        );
        let file = store.allocate(1, 256).unwrap();
        file.write_at(0, b"abc").unwrap();
        assert!(matches!(file.sync(), Err(SegmentError::FsyncFailed(_))));
        assert_eq!(store.stats().sync_failures, 1);
    }

    #[test]
    fn test_simulated_allocation_failure() {
        buggify::set_config(FaultConfig::new());
        let store = SimulatedSegmentStore::new(
            SimulatedRng::new(7),
            1 << 20,
            SimulatedSegmentStoreConfig {
                allocate_fail_prob: 1.0,
                ..SimulatedSegmentStoreConfig::no_faults()
            },
        );
        assert!(store.allocate(1, 256).is_err());
        assert_eq!(store.inner_store().file_count(), 0);
    }
}
