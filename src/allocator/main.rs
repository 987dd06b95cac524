//! Main allocator - variable-size blocks over the rest of the segment
//!
//! Design: best-fit through the splay-tree size index, immediate coalescing
//! with both physical neighbours on free. Everything, including the tree
//! root, lives in the segment so a restarted server reconnects instead of
//! rebuilding.

use super::block::{self, BlockHeader, BLOCK_OVERHEAD, MIN_BLOCK};
use super::splay;
use crate::error::AllocError;
use crate::logging::{debug, log_out_of_memory, warn};
use crate::segment::{align_up, Offset, Record, Segment, NIL};
use core::mem;
use serde::Serialize;

/// Identifies initialized main allocator metadata
const MAIN_ALLOCATOR_IDENTIFIER: u32 = 0x4D41_494E; // 'MAIN'

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MainHeader {
    identifier: u32,
    size_root: u32,
    heap_start: u32,
    heap_end: u32,
    free_bytes: u32,
    allocated_bytes: u32,
}

unsafe impl Record for MainHeader {}

/// Size of the metadata placed at the allocator's offset
pub const MAIN_METADATA_SIZE: usize = mem::size_of::<MainHeader>();

/// Handle to main allocator state inside a segment
#[derive(Debug, Clone, Copy)]
pub struct MainAllocator {
    header: Offset,
}

/// Totals derived by walking the heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MainStats {
    pub free_bytes: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub largest_free_block: usize,
}

impl MainAllocator {
    /// Initialize at `at`, or reconnect if metadata is already there
    ///
    /// The heap spans from just after the metadata to the end of the
    /// segment. The identifier is written last.
    pub fn initialize(segment: &mut Segment, at: Offset) -> Result<Self, AllocError> {
        if let Some(allocator) = Self::attach(segment, at) {
            debug!(offset = %at, "reconnected main allocator");
            return Ok(allocator);
        }
        Self::format(segment, at)
    }

    /// Cold initialization, discarding whatever metadata is at `at`
    pub fn format(segment: &mut Segment, at: Offset) -> Result<Self, AllocError> {
        let allocator = Self { header: at };
        let heap_start = align_up(at.get() + MAIN_METADATA_SIZE);
        let heap_end = segment.len().min(NIL as usize) & !7;
        if heap_end <= heap_start || heap_end - heap_start < MIN_BLOCK {
            return Err(AllocError::OutOfMemory { requested: MIN_BLOCK });
        }

        let first = Offset::new(heap_start);
        let size = (heap_end - heap_start) as u32;
        block::mark_free(segment, first, size, 0);

        let mut header = MainHeader {
            identifier: 0,
            size_root: NIL,
            heap_start: heap_start as u32,
            heap_end: heap_end as u32,
            free_bytes: size,
            allocated_bytes: 0,
        };
        splay::insert(segment, &mut header.size_root, first.raw());
        segment.write(at, header);

        header.identifier = MAIN_ALLOCATOR_IDENTIFIER;
        segment.write(at, header);

        debug!(offset = %at, heap_bytes = size, "initialized main allocator");
        Ok(allocator)
    }

    /// Read-only handle for inspection (reports, clients)
    pub fn attach(segment: &Segment, at: Offset) -> Option<Self> {
        let allocator = Self { header: at };
        allocator.is_initialized(segment).then_some(allocator)
    }

    fn is_initialized(&self, segment: &Segment) -> bool {
        segment.contains(self.header, MAIN_METADATA_SIZE)
            && segment.read::<MainHeader>(self.header).identifier == MAIN_ALLOCATOR_IDENTIFIER
    }

    #[inline]
    fn meta(&self, segment: &Segment) -> MainHeader {
        segment.read(self.header)
    }

    /// Allocate at least `size` bytes; returns the payload offset
    pub fn alloc(&mut self, segment: &mut Segment, size: usize) -> Result<Offset, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize(size));
        }
        let need = align_up(size)
            .checked_add(BLOCK_OVERHEAD)
            .filter(|n| *n < NIL as usize)
            .ok_or(AllocError::OutOfMemory { requested: size })?
            .max(MIN_BLOCK);

        let mut meta = self.meta(segment);
        let found = splay::smallest_at_least(segment, &mut meta.size_root, need as u32);
        let Some(node) = found else {
            segment.write(self.header, meta);
            log_out_of_memory("main", size, meta.free_bytes as usize);
            return Err(AllocError::OutOfMemory { requested: size });
        };
        splay::remove(segment, &mut meta.size_root, node);

        let at = Offset::new(node as usize);
        let h = block::header(segment, at);
        let total = h.size();
        let mut used = total;

        if (total as usize) - need >= MIN_BLOCK {
            // split, remainder goes back into the tree
            used = need as u32;
            let rest = at.add(need);
            let rest_size = total - used;
            block::mark_free(segment, rest, rest_size, used);
            self.fix_next_prev_size(segment, &meta, rest, rest_size);
            splay::insert(segment, &mut meta.size_root, rest.raw());
        }

        block::mark_used(segment, at, used, h.prev_size);
        meta.free_bytes -= used;
        meta.allocated_bytes += used;
        segment.write(self.header, meta);

        Ok(block::payload(at))
    }

    /// Release a payload offset, coalescing with free neighbours
    pub fn free(&mut self, segment: &mut Segment, payload: Offset) {
        let mut meta = self.meta(segment);
        let Some(mut at) = self.block_of(segment, &meta, payload) else {
            warn!(offset = %payload, "main allocator free of unknown offset ignored");
            return;
        };
        let h = block::header(segment, at);
        if h.is_free() {
            warn!(offset = %payload, "double free ignored");
            return;
        }

        let mut size = h.size();
        let mut prev_size = h.prev_size;
        meta.free_bytes += size;
        meta.allocated_bytes -= size;

        let next = at.add(size as usize);
        if next.get() < meta.heap_end as usize {
            let nh = block::header(segment, next);
            if nh.is_free() {
                splay::remove(segment, &mut meta.size_root, next.raw());
                size += nh.size();
            }
        }

        if prev_size != 0 {
            let prev = at.sub(prev_size as usize);
            let ph = block::header(segment, prev);
            if ph.is_free() {
                splay::remove(segment, &mut meta.size_root, prev.raw());
                size += ph.size();
                at = prev;
                prev_size = ph.prev_size;
            }
        }

        block::mark_free(segment, at, size, prev_size);
        self.fix_next_prev_size(segment, &meta, at, size);
        splay::insert(segment, &mut meta.size_root, at.raw());
        segment.write(self.header, meta);
    }

    /// True payload capacity of an allocated block (>= requested size)
    pub fn allocated_size(&self, segment: &Segment, payload: Offset) -> usize {
        let meta = self.meta(segment);
        match self.block_of(segment, &meta, payload) {
            Some(at) => block::size(segment, at) as usize - BLOCK_OVERHEAD,
            None => 0,
        }
    }

    pub fn free_bytes(&self, segment: &Segment) -> usize {
        self.meta(segment).free_bytes as usize
    }

    pub fn allocated_bytes(&self, segment: &Segment) -> usize {
        self.meta(segment).allocated_bytes as usize
    }

    /// Walk every block in address order
    pub fn stats(&self, segment: &Segment) -> MainStats {
        let meta = self.meta(segment);
        let mut stats = MainStats::default();
        let mut at = meta.heap_start as usize;
        while at < meta.heap_end as usize {
            let h: BlockHeader = block::header(segment, Offset::new(at));
            let size = h.size() as usize;
            if size == 0 {
                warn!(offset = at, "zero-sized block, heap walk aborted");
                break;
            }
            if h.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free_block = stats.largest_free_block.max(size);
            } else {
                stats.used_blocks += 1;
                stats.allocated_bytes += size;
            }
            at += size;
        }
        stats
    }

    /// Free block offsets in size order (diagnostics and tests)
    pub fn free_blocks(&self, segment: &Segment) -> Vec<(Offset, usize)> {
        let meta = self.meta(segment);
        let mut blocks = Vec::new();
        splay::for_each(segment, meta.size_root, |node| {
            let at = Offset::new(node as usize);
            blocks.push((at, block::size(segment, at) as usize));
        });
        blocks
    }

    fn block_of(&self, segment: &Segment, meta: &MainHeader, payload: Offset) -> Option<Offset> {
        let start = meta.heap_start as usize + BLOCK_OVERHEAD;
        if payload.get() < start || payload.get() >= meta.heap_end as usize {
            return None;
        }
        let at = block::from_payload(payload);
        segment.contains(at, BLOCK_OVERHEAD).then_some(at)
    }

    fn fix_next_prev_size(&self, segment: &mut Segment, meta: &MainHeader, at: Offset, size: u32) {
        let next = at.add(size as usize);
        if next.get() < meta.heap_end as usize {
            block::set_prev_size(segment, next, size);
        }
    }
}
