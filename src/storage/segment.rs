//! Segment format and lifecycle.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (32 bytes)                │
//! │ - magic: "FSEG"                  │
//! │ - version: u8, reserved: u8 x 3  │
//! │ - segment_id: u64                │
//! │ - capacity: u64 (file size)      │
//! │ - reserved: u32                  │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Frames (variable, append-only)   │
//! │ - length: u32                    │
//! │ - crc32(bytes): u32              │
//! │ - bytes                          │
//! ├──────────────────────────────────┤
//! │ Zeroed (preallocated, unused)    │
//! └──────────────────────────────────┘
//! ```
//!
//! ## States
//!
//! ```text
//! NEW ──allocate──► ALLOCATED ──promote──► ACTIVE ──full──► FILLED
//!   └─────────────► ALLOCATION_FAILED
//! ```
//!
//! The state lives in an `AtomicU8`. The allocator thread installs the file
//! and then stores ALLOCATED with `Release`; the appender loads with
//! `Acquire`, so once it observes ALLOCATED the file is visible too.
//!
//! The committed tail follows the same pattern: a frame is written and
//! fsynced, then the tail is published with `Release`. Readers load it with
//! `Acquire` and never copy past it, so a partially written block is never
//! visible.

use super::segment_store::{SegmentError, SegmentFile};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

pub const SEGMENT_MAGIC: [u8; 4] = *b"FSEG";
pub const SEGMENT_VERSION: u8 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 32;
/// Length + CRC prefix of every block
pub const FRAME_OVERHEAD: usize = 8;

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub capacity: u64,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4] = SEGMENT_VERSION;
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(SegmentError::InvalidHeader(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidHeader("bad magic".to_string()));
        }
        if buf[4] != SEGMENT_VERSION {
            return Err(SegmentError::InvalidHeader(format!(
                "unsupported version {}",
                buf[4]
            )));
        }
        let stored = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        let actual = crc32fast::hash(&buf[..28]);
        if stored != actual {
            return Err(SegmentError::InvalidHeader(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                stored, actual
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        let mut capacity = [0u8; 8];
        capacity.copy_from_slice(&buf[16..24]);
        Ok(SegmentHeader {
            segment_id: u64::from_le_bytes(id),
            capacity: u64::from_le_bytes(capacity),
        })
    }
}

// ============================================================================
// Frames
// ============================================================================

pub fn frame_len(block_len: usize) -> usize {
    block_len + FRAME_OVERHEAD
}

pub fn encode_frame(block: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame_len(block.len()));
    buf.extend_from_slice(&(block.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(block).to_le_bytes());
    buf.extend_from_slice(block);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecode {
    /// Valid frame; `total` includes the prefix
    Complete { len: usize, total: usize },
    /// Prefix or body extends past the buffer
    Incomplete,
    /// Zero length or checksum mismatch
    Invalid,
}

pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    if buf.len() < FRAME_OVERHEAD {
        return FrameDecode::Incomplete;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return FrameDecode::Invalid;
    }
    let total = frame_len(len);
    if buf.len() < total {
        return FrameDecode::Incomplete;
    }
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if crc32fast::hash(&buf[FRAME_OVERHEAD..total]) != crc {
        return FrameDecode::Invalid;
    }
    FrameDecode::Complete { len, total }
}

/// Length of the longest prefix of `buf` made of valid frames.
pub fn valid_prefix_len(buf: &[u8]) -> usize {
    let mut pos = 0;
    while let FrameDecode::Complete { total, .. } = decode_frame(&buf[pos..]) {
        pos += total;
    }
    pos
}

/// Iterates block payloads in a buffer of whole frames.
pub struct BlockIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlockIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BlockIter { buf, pos: 0 }
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        match decode_frame(&self.buf[self.pos..]) {
            FrameDecode::Complete { len, total } => {
                let start = self.pos + FRAME_OVERHEAD;
                self.pos += total;
                Some(&self.buf[start..start + len])
            }
            _ => None,
        }
    }
}

// ============================================================================
// Segment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    New = 0,
    Allocated = 1,
    AllocationFailed = 2,
    Active = 3,
    Filled = 4,
}

impl SegmentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SegmentState::New,
            1 => SegmentState::Allocated,
            2 => SegmentState::AllocationFailed,
            3 => SegmentState::Active,
            _ => SegmentState::Filled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAppend {
    /// Frame durable at this offset within the frame area
    Appended { offset: u64 },
    DoesNotFit,
}

/// One segment of a partition log.
///
/// Only the appender thread mutates the tail; only the allocator thread
/// installs the file. Everything else is read-only.
pub struct Segment<F: SegmentFile> {
    id: u64,
    /// Bytes available for frames (file size minus header)
    capacity: u64,
    tail: AtomicU64,
    state: AtomicU8,
    file: OnceLock<F>,
}

impl<F: SegmentFile> Segment<F> {
    pub fn new(id: u64, capacity: u64) -> Self {
        Segment {
            id,
            capacity,
            tail: AtomicU64::new(0),
            state: AtomicU8::new(SegmentState::New as u8),
            file: OnceLock::new(),
        }
    }

    /// A segment found on disk during recovery.
    pub fn recovered(id: u64, file: F, tail: u64, state: SegmentState) -> Self {
        let capacity = file.len().saturating_sub(SEGMENT_HEADER_SIZE as u64);
        debug_assert!(tail <= capacity, "Precondition: recovered tail within capacity");
        let segment = Segment {
            id,
            capacity,
            tail: AtomicU64::new(tail),
            state: AtomicU8::new(state as u8),
            file: OnceLock::new(),
        };
        let _ = segment.file.set(file);
        segment
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Committed bytes; everything below is durable and readable.
    pub fn tail_position(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.tail_position())
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn file(&self) -> Option<&F> {
        self.file.get()
    }

    /// Install the backing file and publish ALLOCATED.
    pub fn mark_allocated(&self, file: F) {
        debug_assert_eq!(self.state(), SegmentState::New, "Precondition: NEW before allocation");
        if self.file.set(file).is_err() {
            debug_assert!(false, "segment {} allocated twice", self.id);
        }
        self.state
            .store(SegmentState::Allocated as u8, Ordering::Release);
    }

    pub fn mark_allocation_failed(&self) {
        self.state
            .store(SegmentState::AllocationFailed as u8, Ordering::Release);
    }

    pub fn activate(&self) {
        debug_assert!(
            matches!(self.state(), SegmentState::Allocated | SegmentState::Active),
            "Precondition: only an allocated segment becomes active"
        );
        self.state.store(SegmentState::Active as u8, Ordering::Release);
    }

    pub fn mark_filled(&self) {
        self.state.store(SegmentState::Filled as u8, Ordering::Release);
    }

    /// Write, fsync, then publish one block. Never leaves a partial block
    /// visible: on error the tail is unchanged and the next append
    /// overwrites whatever reached the file.
    pub fn try_append(&self, block: &[u8]) -> Result<SegmentAppend, SegmentError> {
        let file = self.file.get().ok_or(SegmentError::NotFound(self.id))?;
        let tail = self.tail.load(Ordering::Relaxed);
        let needed = frame_len(block.len()) as u64;
        if tail + needed > self.capacity {
            return Ok(SegmentAppend::DoesNotFit);
        }

        let frame = encode_frame(block);
        file.write_at(SEGMENT_HEADER_SIZE as u64 + tail, &frame)?;
        file.sync()?;

        let new_tail = tail
            .checked_add(needed)
            .expect("segment tail overflow unreachable");
        self.tail.store(new_tail, Ordering::Release);

        debug_assert!(
            self.tail_position() <= self.capacity,
            "Postcondition: tail within capacity"
        );
        Ok(SegmentAppend::Appended { offset: tail })
    }

    /// Copy committed frame bytes starting at `offset` into `buf`.
    pub fn read_committed(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SegmentError> {
        let file = self.file.get().ok_or(SegmentError::NotFound(self.id))?;
        let tail = self.tail_position();
        if offset >= tail {
            return Ok(0);
        }
        let n = buf.len().min((tail - offset) as usize);
        file.read_at(SEGMENT_HEADER_SIZE as u64 + offset, &mut buf[..n])
    }
}

/// Scan the frame area of a segment file and return the committed tail:
/// the end of the last frame before the first truncated or corrupt one.
pub fn recover_tail<F: SegmentFile>(file: &F) -> Result<u64, SegmentError> {
    let capacity = file.len().saturating_sub(SEGMENT_HEADER_SIZE as u64) as usize;
    let mut buf = vec![0u8; capacity];
    let n = file.read_at(SEGMENT_HEADER_SIZE as u64, &mut buf)?;
    Ok(valid_prefix_len(&buf[..n]) as u64)
}

pub fn read_header<F: SegmentFile>(file: &F) -> Result<SegmentHeader, SegmentError> {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE];
    let n = file.read_at(0, &mut buf)?;
    SegmentHeader::decode(&buf[..n])
}
