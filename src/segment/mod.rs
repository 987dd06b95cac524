//! Segment - the fixed-size byte region every structure lives in
//!
//! Design: the segment is mapped at a different base address in every
//! process, so nothing inside it ever stores a pointer. All references are
//! byte offsets from the base (`Offset`), resolved on demand against the
//! current process's mapping and never persisted as references.
//!
//! Layout (byte offsets from base):
//! 1. `SegmentHeader` at 0 - magic, main allocator, bucket allocator, cache root
//! 2. Main allocator metadata
//! 3. Heap managed by the main allocator (bucket metadata, bucket lists,
//!    shared cache, cached resources)

mod backing;

#[cfg(test)]
mod tests;

pub use backing::{Backing, HeapRegion};
#[cfg(unix)]
pub use backing::PosixShm;

use crate::error::SegmentError;
use core::mem;
use std::sync::Arc;

/// Default segment capacity (13 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 13 * 1024 * 1024;

/// Identifier written last during cold initialization
pub const SEGMENT_MAGIC: u32 = 0x5448_4D53; // 'THMS'

/// Identifier of a compacted image (allocator metadata no longer valid)
pub const IMAGE_MAGIC: u32 = 0x5448_494D; // 'THIM'

/// Raw in-segment encoding of "no offset"
pub const NIL: u32 = u32::MAX;

/// All allocations are aligned to this many bytes
pub const ALIGN: usize = 8;

/// Round `size` up to the allocation alignment
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Byte offset from the segment base
///
/// Deliberately not convertible to a reference: resolve it through the
/// segment (or manager) that owns the mapping. Offset 0 is the segment
/// header, so it doubles as the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(usize);

impl Offset {
    pub const NULL: Offset = Offset(0);

    #[inline]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    /// Decode an in-segment `u32` field
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == NIL {
            None
        } else {
            Some(Self(raw as usize))
        }
    }

    /// Encode for storage in an in-segment `u32` field
    #[inline]
    pub fn to_raw(offset: Option<Self>) -> u32 {
        match offset {
            Some(o) => {
                debug_assert!(o.0 < NIL as usize, "offset exceeds 32-bit segment range");
                o.0 as u32
            }
            None => NIL,
        }
    }

    /// Raw `u32` of a present offset
    #[inline]
    pub fn raw(self) -> u32 {
        Self::to_raw(Some(self))
    }
}

impl core::fmt::Display for Offset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// Plain data that can be copied in and out of the segment
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or primitive), contain no padding,
/// no pointers, and accept every bit pattern.
pub unsafe trait Record: Copy + 'static {}

unsafe impl Record for u8 {}
unsafe impl Record for u32 {}
unsafe impl Record for u64 {}

/// Header at offset 0 of every segment
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub main_allocator: u32,
    pub bucket_allocator: u32,
    pub shared_cache: u32,
}

unsafe impl Record for SegmentHeader {}

pub const HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();

/// Location of `SegmentHeader::shared_cache` (an offset holder itself)
pub const CACHE_ROOT_FIELD: Offset = Offset(12);

/// A mapped segment plus this process's access rights
///
/// The writable flag is fixed at construction and never revisited.
pub struct Segment {
    backing: Arc<dyn Backing>,
    writable: bool,
}

impl Segment {
    /// Wrap an existing backing
    pub fn new(backing: Arc<dyn Backing>, writable: bool) -> Self {
        Self { backing, writable }
    }

    /// Zeroed, writable, process-private segment
    pub fn anonymous(size: usize) -> Result<Self, SegmentError> {
        let region = HeapRegion::new(size)?;
        Ok(Self::new(Arc::new(region), true))
    }

    /// Create a named platform segment (server)
    ///
    /// Fails with `SegmentError::AlreadyExists` when a segment of that name
    /// survives from a previous server.
    #[cfg(unix)]
    pub fn create_shared(name: &str, size: usize) -> Result<Self, SegmentError> {
        let shm = PosixShm::create(name, size)?;
        Ok(Self::new(Arc::new(shm), true))
    }

    /// Attach to an existing named platform segment
    #[cfg(unix)]
    pub fn attach_shared(name: &str, writable: bool) -> Result<Self, SegmentError> {
        let shm = PosixShm::attach(name, writable)?;
        Ok(Self::new(Arc::new(shm), writable))
    }

    /// Second, read-only view over the same bytes
    pub fn read_only_view(&self) -> Self {
        Self {
            backing: Arc::clone(&self.backing),
            writable: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.backing.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.backing.len() == 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Process-local base address (meaningless in any other process)
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.backing.as_ptr()
    }

    /// Check that `[offset, offset + len)` lies inside the segment
    #[inline]
    pub fn contains(&self, offset: Offset, len: usize) -> bool {
        offset
            .get()
            .checked_add(len)
            .map_or(false, |end| end <= self.len())
    }

    /// Copy a record out of the segment
    ///
    /// Panics if the record does not fit: internal offsets out of range
    /// mean the metadata is corrupt.
    #[inline]
    pub fn read<T: Record>(&self, offset: Offset) -> T {
        assert!(
            self.contains(offset, mem::size_of::<T>()),
            "segment read out of bounds at {}",
            offset
        );
        unsafe {
            core::ptr::read_unaligned(self.backing.as_ptr().add(offset.get()) as *const T)
        }
    }

    /// Copy a record into the segment
    #[inline]
    pub fn write<T: Record>(&mut self, offset: Offset, value: T) {
        assert!(self.writable, "write to read-only segment");
        assert!(
            self.contains(offset, mem::size_of::<T>()),
            "segment write out of bounds at {}",
            offset
        );
        unsafe {
            core::ptr::write_unaligned(self.backing.as_ptr().add(offset.get()) as *mut T, value);
        }
    }

    #[inline]
    pub fn read_u32(&self, offset: Offset) -> u32 {
        self.read::<u32>(offset)
    }

    #[inline]
    pub fn write_u32(&mut self, offset: Offset, value: u32) {
        self.write::<u32>(offset, value)
    }

    /// Borrow a record in place; `None` if out of range or misaligned
    pub fn resolve<T: Record>(&self, offset: Offset) -> Option<&T> {
        if !self.contains(offset, mem::size_of::<T>()) {
            return None;
        }
        let ptr = unsafe { self.backing.as_ptr().add(offset.get()) };
        if (ptr as usize) % mem::align_of::<T>() != 0 {
            return None;
        }
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
        if !self.contains(offset, len) {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.backing.as_ptr().add(offset.get()), len) })
    }

    pub fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]> {
        if !self.writable || !self.contains(offset, len) {
            return None;
        }
        Some(unsafe {
            core::slice::from_raw_parts_mut(self.backing.as_ptr().add(offset.get()), len)
        })
    }

    /// Overlap-safe copy inside the segment
    pub fn copy_within(&mut self, src: Offset, dst: Offset, len: usize) {
        assert!(self.writable, "write to read-only segment");
        assert!(
            self.contains(src, len) && self.contains(dst, len),
            "segment copy out of bounds"
        );
        unsafe {
            let base = self.backing.as_ptr();
            core::ptr::copy(base.add(src.get()), base.add(dst.get()), len);
        }
    }

    #[inline]
    pub fn header(&self) -> SegmentHeader {
        self.read(Offset::NULL)
    }

    #[inline]
    pub fn write_header(&mut self, header: SegmentHeader) {
        self.write(Offset::NULL, header)
    }
}

// Safety: access to the mapping goes through &self / &mut self; cross-process
// exclusion is the single-writer rule plus the cache lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.base())
            .field("len", &self.len())
            .field("writable", &self.writable)
            .finish()
    }
}
