//! Fixed-capacity ring buffer living in a memory-mapped file.
//!
//! Layout: a 128 byte [`SegmentHeader`] followed by `capacity` bytes of ring
//! data. Frames are a 4 byte little-endian length prefix followed by the
//! payload; either part may wrap around the end of the ring.
//!
//! The writer and the reader usually live in different processes. Each side
//! only ever stores its own cursor (Release, after copying data) and loads the
//! other side's cursor (Acquire), so one writer and one reader can operate on
//! the same mapping concurrently without an OS lock. Within one process all
//! operations on a segment instance are additionally serialized by a mutex.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::descriptor::SegmentDescriptor;
use crate::error::SegmentError;

pub const SEGMENT_MAGIC: u32 = 0x5053_4547; // "PSEG"
pub const SEGMENT_VERSION: u32 = 1;
pub const LENGTH_PREFIX: usize = 4;
pub const SESSION_TAG_LEN: usize = 64;
pub const MIN_CAPACITY: usize = 16;
pub const MAX_CAPACITY: usize = 1 << 30;

#[repr(C)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    _reserved: u32,
    /// Logical write offset, only stored by the writer.
    write_pos: AtomicU64,
    /// Logical read offset, only stored by the reader.
    read_pos: AtomicU64,
    total_frames: AtomicU64,
    session_tag: [u8; SESSION_TAG_LEN],
    _padding: [u8; 24],
}

pub const HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();
const _: () = assert!(HEADER_SIZE == 128);

/// Cursor snapshot. Positions are physical offsets into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStatistics {
    pub write_pos: u64,
    pub read_pos: u64,
    pub used: u64,
    pub capacity: u64,
    pub total_frames: u64,
}

impl SegmentStatistics {
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 / self.capacity as f64
    }
}

pub struct SharedMemorySegment {
    path: PathBuf,
    offset: u64,
    capacity: usize,
    map: Mutex<MmapMut>,
    corrupt_frames: AtomicU64,
}

impl SharedMemorySegment {
    /// Create a new backing file at `path` and initialize an empty ring of
    /// `capacity` data bytes tagged with `session_id`.
    pub fn create(path: &Path, session_id: &str, capacity: usize) -> Result<Self, SegmentError> {
        if session_id.is_empty() {
            return Err(SegmentError::EmptySessionId);
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(SegmentError::InvalidSize(capacity as u64));
        }

        let total = HEADER_SIZE + capacity;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(total as u64)?;

        let mut map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };

        let mut session_tag = [0u8; SESSION_TAG_LEN];
        let tag_len = session_id.len().min(SESSION_TAG_LEN - 1);
        session_tag[..tag_len].copy_from_slice(&session_id.as_bytes()[..tag_len]);

        unsafe {
            ptr::write(
                map.as_mut_ptr() as *mut SegmentHeader,
                SegmentHeader {
                    magic: SEGMENT_MAGIC,
                    version: SEGMENT_VERSION,
                    capacity: capacity as u32,
                    _reserved: 0,
                    write_pos: AtomicU64::new(0),
                    read_pos: AtomicU64::new(0),
                    total_frames: AtomicU64::new(0),
                    session_tag,
                    _padding: [0; 24],
                },
            );
            ptr::write_bytes(map.as_mut_ptr().add(HEADER_SIZE), 0, capacity);
        }

        Ok(Self {
            path: path.to_path_buf(),
            offset: 0,
            capacity,
            map: Mutex::new(map),
            corrupt_frames: AtomicU64::new(0),
        })
    }

    /// Map an existing segment from its descriptor.
    pub fn open(descriptor: &SegmentDescriptor) -> Result<Self, SegmentError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&descriptor.mapping_name)?;

        let map = unsafe {
            MmapOptions::new()
                .offset(descriptor.offset)
                .len(descriptor.size as usize)
                .map_mut(&file)?
        };

        if map.len() < HEADER_SIZE {
            return Err(SegmentError::InvalidHeader(format!(
                "mapping is {} bytes, header needs {}",
                map.len(),
                HEADER_SIZE
            )));
        }

        let header = unsafe { &*(map.as_ptr() as *const SegmentHeader) };
        if header.magic != SEGMENT_MAGIC || header.version != SEGMENT_VERSION {
            return Err(SegmentError::InvalidHeader(format!(
                "magic {:#x} version {}",
                header.magic, header.version
            )));
        }

        let capacity = header.capacity as usize;
        if capacity as u64 != descriptor.capacity {
            return Err(SegmentError::SizeMismatch {
                expected: descriptor.capacity,
                actual: capacity as u64,
            });
        }
        if HEADER_SIZE + capacity != map.len() {
            return Err(SegmentError::SizeMismatch {
                expected: (HEADER_SIZE + capacity) as u64,
                actual: map.len() as u64,
            });
        }

        Ok(Self {
            path: PathBuf::from(&descriptor.mapping_name),
            offset: descriptor.offset,
            capacity,
            map: Mutex::new(map),
            corrupt_frames: AtomicU64::new(0),
        })
    }

    pub fn descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor {
            mapping_name: self.path.to_string_lossy().into_owned(),
            capacity: self.capacity as u64,
            offset: self.offset,
            size: (HEADER_SIZE + self.capacity) as u64,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest frame (prefix included) the ring accepts.
    pub fn max_frame_len(&self) -> usize {
        self.capacity / 2
    }

    pub fn session_id(&self) -> String {
        let map = self.lock();
        let header = unsafe { &*(map.as_ptr() as *const SegmentHeader) };
        let end = header
            .session_tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SESSION_TAG_LEN);
        String::from_utf8_lossy(&header.session_tag[..end]).into_owned()
    }

    /// Append one frame.
    ///
    /// Returns `Ok(None)` without touching the ring when there is not enough
    /// free space; the caller decides whether to retry, drop or escalate.
    /// On success returns the index of the frame (frames written before it).
    pub fn try_write_frame(&self, payload: &[u8]) -> Result<Option<u64>, SegmentError> {
        if payload.is_empty() {
            return Err(SegmentError::EmptyFrame);
        }
        let frame_len = LENGTH_PREFIX + payload.len();
        if frame_len > self.max_frame_len() {
            return Err(SegmentError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len().saturating_sub(LENGTH_PREFIX),
            });
        }

        let mut map = self.lock();
        let base = map.as_mut_ptr();
        let header = unsafe { &*(base as *const SegmentHeader) };

        let read_pos = header.read_pos.load(Ordering::Acquire);
        let write_pos = header.write_pos.load(Ordering::Relaxed);
        let used = write_pos.saturating_sub(read_pos) as usize;
        if used + frame_len > self.capacity {
            return Ok(None);
        }

        let start = (write_pos % self.capacity as u64) as usize;
        let prefix = (payload.len() as u32).to_le_bytes();
        unsafe {
            let data = base.add(HEADER_SIZE);
            copy_into_ring(data, self.capacity, start, &prefix);
            copy_into_ring(data, self.capacity, (start + LENGTH_PREFIX) % self.capacity, payload);
        }

        header
            .write_pos
            .store(write_pos + frame_len as u64, Ordering::Release);
        let index = header.total_frames.fetch_add(1, Ordering::AcqRel);
        Ok(Some(index))
    }

    /// Take the oldest frame out of the ring.
    ///
    /// Returns `None` when the ring is empty. A malformed length prefix drops
    /// everything buffered (the read cursor jumps to the write cursor) and also
    /// returns `None`.
    pub fn try_read_frame(&self) -> Option<Vec<u8>> {
        let mut map = self.lock();
        let base = map.as_mut_ptr();
        let header = unsafe { &*(base as *const SegmentHeader) };

        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Relaxed);
        if write_pos == read_pos {
            return None;
        }

        let available = write_pos.saturating_sub(read_pos);
        let start = (read_pos % self.capacity as u64) as usize;
        let mut prefix = [0u8; LENGTH_PREFIX];
        unsafe {
            copy_from_ring(base.add(HEADER_SIZE), self.capacity, start, &mut prefix);
        }
        let len = u32::from_le_bytes(prefix) as usize;

        if len == 0 || len > self.max_frame_len() || (LENGTH_PREFIX + len) as u64 > available {
            tracing::warn!(
                segment = %self.path.display(),
                frame_len = len,
                buffered = available,
                "Corrupt frame header in shared memory ring, dropping buffered data"
            );
            header.read_pos.store(write_pos, Ordering::Release);
            self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut payload = vec![0u8; len];
        unsafe {
            copy_from_ring(
                base.add(HEADER_SIZE),
                self.capacity,
                (start + LENGTH_PREFIX) % self.capacity,
                &mut payload,
            );
        }
        header
            .read_pos
            .store(read_pos + (LENGTH_PREFIX + len) as u64, Ordering::Release);
        Some(payload)
    }

    pub fn statistics(&self) -> SegmentStatistics {
        let map = self.lock();
        let header = unsafe { &*(map.as_ptr() as *const SegmentHeader) };
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        let capacity = self.capacity as u64;
        SegmentStatistics {
            write_pos: write_pos % capacity,
            read_pos: read_pos % capacity,
            used: write_pos.saturating_sub(read_pos).min(capacity),
            capacity,
            total_frames: header.total_frames.load(Ordering::Acquire),
        }
    }

    pub fn fill_ratio(&self) -> f64 {
        self.statistics().fill_ratio()
    }

    /// Number of corrupt frame headers this instance recovered from.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, MmapMut> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Copy `src` into the ring at `start`, wrapping once at `capacity`.
unsafe fn copy_into_ring(data: *mut u8, capacity: usize, start: usize, src: &[u8]) {
    let first = src.len().min(capacity - start);
    ptr::copy_nonoverlapping(src.as_ptr(), data.add(start), first);
    if first < src.len() {
        ptr::copy_nonoverlapping(src.as_ptr().add(first), data, src.len() - first);
    }
}

unsafe fn copy_from_ring(data: *const u8, capacity: usize, start: usize, dst: &mut [u8]) {
    let first = dst.len().min(capacity - start);
    ptr::copy_nonoverlapping(data.add(start), dst.as_mut_ptr(), first);
    if first < dst.len() {
        ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}
