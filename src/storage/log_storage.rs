//! Log storage contract.
//!
//! A byte-addressable, append-only store. Appends return an address; a read
//! at an address copies whole blocks into the caller's buffer and returns
//! the address to continue from. Read failures are reported as one of four
//! status codes that callers match on numerically:
//!
//! | Code | Status                         | Meaning                                   |
//! |------|--------------------------------|-------------------------------------------|
//! | -1   | `INVALID_ADDR`                 | address never existed or was deleted      |
//! | -2   | `NO_DATA`                      | nothing committed there yet, retry later  |
//! | -3   | `INSUFFICIENT_BUFFER_CAPACITY` | next block is larger than the buffer      |
//! | -4   | `BLOCK_SIZE_TOO_BIG`           | block can never fit in a segment          |
//!
//! Addresses pack `(segment_id << 32) | offset`, where `offset` is relative
//! to the segment's frame area. Segment ids start at 1, so every valid
//! address is positive.

use super::segment::{decode_frame, FrameDecode};
use super::segment_store::SegmentError;

pub const INVALID_ADDR: i64 = -1;
pub const NO_DATA: i64 = -2;
pub const INSUFFICIENT_BUFFER_CAPACITY: i64 = -3;
pub const BLOCK_SIZE_TOO_BIG: i64 = -4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageStatus {
    #[error("invalid address")]
    InvalidAddress,
    #[error("no data at address")]
    NoData,
    #[error("insufficient buffer capacity")]
    InsufficientBufferCapacity,
    #[error("block size too big")]
    BlockSizeTooBig,
}

impl StorageStatus {
    pub fn code(&self) -> i64 {
        match self {
            StorageStatus::InvalidAddress => INVALID_ADDR,
            StorageStatus::NoData => NO_DATA,
            StorageStatus::InsufficientBufferCapacity => INSUFFICIENT_BUFFER_CAPACITY,
            StorageStatus::BlockSizeTooBig => BLOCK_SIZE_TOO_BIG,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            INVALID_ADDR => Some(StorageStatus::InvalidAddress),
            NO_DATA => Some(StorageStatus::NoData),
            INSUFFICIENT_BUFFER_CAPACITY => Some(StorageStatus::InsufficientBufferCapacity),
            BLOCK_SIZE_TOO_BIG => Some(StorageStatus::BlockSizeTooBig),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error("block of {size} bytes exceeds segment capacity {max}")]
    BlockTooBig { size: usize, max: u64 },
    #[error("empty block")]
    EmptyBlock,
    /// Fatal: the partition can no longer write.
    #[error("segment allocation failed: {0}")]
    AllocationFailed(String),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error("log storage is not open")]
    Closed,
    #[error("appender stopped")]
    AppenderStopped,
    #[error("blocking append task failed: {0}")]
    Blocking(String),
}

impl AppendError {
    pub fn status(&self) -> Option<StorageStatus> {
        match self {
            AppendError::BlockTooBig { .. } => Some(StorageStatus::BlockSizeTooBig),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AppendError::AllocationFailed(_))
    }
}

/// Successful read: `len` bytes of whole frames were copied to the front
/// of the buffer, and reading continues at `next_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBatch {
    pub next_address: i64,
    pub len: usize,
}

pub fn make_address(segment_id: u64, offset: u64) -> i64 {
    debug_assert!(segment_id > 0 && segment_id < (1 << 31), "Precondition: segment id range");
    debug_assert!(offset <= u32::MAX as u64, "Precondition: offset fits in 32 bits");
    ((segment_id << 32) | offset) as i64
}

/// Split an address into `(segment_id, offset)`; `None` for non-positive values.
pub fn split_address(address: i64) -> Option<(u64, u64)> {
    if address <= 0 {
        return None;
    }
    let raw = address as u64;
    Some((raw >> 32, raw & 0xffff_ffff))
}

/// Post-processes the bytes a read copied, returning how many of them the
/// caller may consume.
pub trait ReadResultProcessor {
    fn process(&self, buf: &[u8], copied: usize) -> Result<usize, StorageStatus>;
}

/// Default processor: trims a trailing block that did not fit completely.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameAligner;

impl ReadResultProcessor for FrameAligner {
    fn process(&self, buf: &[u8], copied: usize) -> Result<usize, StorageStatus> {
        let mut pos = 0;
        loop {
            match decode_frame(&buf[pos..copied]) {
                FrameDecode::Complete { total, .. } => pos += total,
                FrameDecode::Incomplete => break,
                // committed bytes are always valid frames
                FrameDecode::Invalid => return Err(StorageStatus::InvalidAddress),
            }
        }
        if pos == 0 && copied > 0 {
            return Err(StorageStatus::InsufficientBufferCapacity);
        }
        Ok(pos)
    }
}

/// Append-only log with one writer and many concurrent readers.
pub trait LogStorage: Send + Sync {
    fn open(&self) -> Result<(), AppendError>;
    fn close(&self);
    fn is_open(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Persist one block durably; returns its address.
    fn append(&self, block: &[u8]) -> Result<i64, AppendError>;

    fn read_with(
        &self,
        buf: &mut [u8],
        address: i64,
        processor: &dyn ReadResultProcessor,
    ) -> Result<ReadBatch, StorageStatus>;

    fn read(&self, buf: &mut [u8], address: i64) -> Result<ReadBatch, StorageStatus> {
        self.read_with(buf, address, &FrameAligner)
    }

    /// Remove data strictly below `upper_bound`, in whole segments.
    /// Returns the number of segments removed.
    fn delete(&self, upper_bound: i64) -> Result<usize, SegmentError>;

    /// Address of the oldest retained block, or `NoData` when empty.
    fn first_block_address(&self) -> Result<i64, StorageStatus>;

    fn flush(&self) -> Result<(), SegmentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::{encode_frame, frame_len};

    #[test]
    fn test_status_codes() {
        assert_eq!(StorageStatus::InvalidAddress.code(), -1);
        assert_eq!(StorageStatus::NoData.code(), -2);
        assert_eq!(StorageStatus::InsufficientBufferCapacity.code(), -3);
        assert_eq!(StorageStatus::BlockSizeTooBig.code(), -4);
        for code in -4..=-1 {
            assert_eq!(StorageStatus::from_code(code).unwrap().code(), code);
        }
        assert_eq!(StorageStatus::from_code(0), None);
    }

    #[test]
    fn test_address_packing() {
        let addr = make_address(3, 1234);
        assert!(addr > 0);
        assert_eq!(split_address(addr), Some((3, 1234)));
        assert_eq!(split_address(0), None);
        assert_eq!(split_address(INVALID_ADDR), None);
    }

    #[test]
    fn test_frame_aligner_trims_partial_block() {
        let mut buf = encode_frame(b"aaaa");
        buf.extend(encode_frame(b"bbbbbbbb"));
        let copied = frame_len(4) + 5;
        assert_eq!(FrameAligner.process(&buf, copied), Ok(frame_len(4)));
        assert_eq!(FrameAligner.process(&buf, buf.len()), Ok(buf.len()));
    }

    #[test]
    fn test_frame_aligner_buffer_too_small() {
        let buf = encode_frame(&[1u8; 32]);
        assert_eq!(
            FrameAligner.process(&buf, 10),
            Err(StorageStatus::InsufficientBufferCapacity)
        );
        assert_eq!(FrameAligner.process(&buf, 0), Ok(0));
    }

    #[test]
    fn test_block_too_big_maps_to_status() {
        let err = AppendError::BlockTooBig { size: 10, max: 5 };
        assert_eq!(err.status().map(|s| s.code()), Some(BLOCK_SIZE_TOO_BIG));
        assert!(!err.is_fatal());
        assert!(AppendError::AllocationFailed("disk full".into()).is_fatal());
    }
}
