//! Process-heap manager - offsets are plain addresses

use super::MemoryManager;
use crate::error::AllocError;
use crate::logging::{log_allocation, log_deallocation, warn};
use crate::segment::{Offset, ALIGN};
use std::alloc::{self, Layout};
use std::collections::BTreeMap;

/// Manager over the process heap
///
/// `base()` is null, so an offset is the block's address. Live blocks are
/// remembered with their layout so `free` and `bytes` can validate offsets.
#[derive(Debug, Default)]
pub struct HeapMemoryManager {
    live: BTreeMap<usize, Layout>,
}

impl HeapMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live blocks
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    fn block_containing(&self, at: usize, len: usize) -> Option<*mut u8> {
        let (start, layout) = self.live.range(..=at).next_back()?;
        let end = start + layout.size();
        (at.checked_add(len)? <= end).then_some(at as *mut u8)
    }
}

impl MemoryManager for HeapMemoryManager {
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize(size));
        }
        let layout = Layout::from_size_align(size, ALIGN).map_err(|_| AllocError::InvalidSize(size))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocError::OutOfMemory { requested: size });
        }
        self.live.insert(ptr as usize, layout);

        let offset = Offset::new(ptr as usize);
        log_allocation("heap", offset, size);
        Ok(offset)
    }

    fn realloc(&mut self, offset: Offset, new_size: usize) -> Result<Offset, AllocError> {
        if offset.is_null() {
            return self.alloc(new_size);
        }
        let old_size = self.allocated_size(offset);
        if old_size == 0 {
            return Err(AllocError::InvalidSize(new_size));
        }

        let new = self.alloc(new_size)?;
        let len = old_size.min(new_size);
        unsafe {
            core::ptr::copy_nonoverlapping(offset.get() as *const u8, new.get() as *mut u8, len);
        }
        self.free(offset);
        Ok(new)
    }

    fn free(&mut self, offset: Offset) {
        if offset.is_null() {
            return;
        }
        match self.live.remove(&offset.get()) {
            Some(layout) => {
                unsafe { alloc::dealloc(offset.get() as *mut u8, layout) };
                log_deallocation("heap", offset);
            }
            None => warn!(offset = %offset, "heap free of unknown block ignored"),
        }
    }

    fn allocated_size(&self, offset: Offset) -> usize {
        self.live.get(&offset.get()).map_or(0, |layout| layout.size())
    }

    fn base(&self) -> *const u8 {
        core::ptr::null()
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
        let ptr = self.block_containing(offset.get(), len)?;
        Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
    }

    fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]> {
        let ptr = self.block_containing(offset.get(), len)?;
        Some(unsafe { core::slice::from_raw_parts_mut(ptr, len) })
    }
}

impl Drop for HeapMemoryManager {
    fn drop(&mut self) {
        for (address, layout) in std::mem::take(&mut self.live) {
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
    }
}
