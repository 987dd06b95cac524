//! Offset registry and compaction
//!
//! Design: compaction moves every tracked cell, so everything that stores an
//! offset to a cell must be found and rewritten. Two kinds of holders:
//! 1. In-segment `u32` fields (cache vectors, static table, segment header),
//!    registered by location in a lock-free set
//! 2. Process-side references, which get a stable handle into an
//!    indirection table instead of registering their own address
//!
//! Compaction rewrites holder values, packs the cells in ascending offset
//! order right after the segment header, and leaves the segment marked as an
//! image: allocator metadata is gone afterwards.


use crate::error::DefragError;
use crate::logging::{debug, log_compaction_complete, warn};
use crate::manager::{MemoryManager, SharedMemoryManager};
use crate::segment::{align_up, Offset, Segment, SegmentHeader, CACHE_ROOT_FIELD, HEADER_SIZE, IMAGE_MAGIC};
use dashmap::DashSet;
use std::collections::BTreeMap;
use std::time::Instant;

/// Stable index into the indirection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(usize);

/// Holder and cell bookkeeping for one shared manager
#[derive(Debug, Default)]
pub struct OffsetRegistry {
    /// Locations of in-segment `u32` fields that hold offsets
    holders: DashSet<Offset>,
    handles: Vec<Option<Offset>>,
    free_handles: Vec<usize>,
    /// Live tracked cells: offset -> aligned size
    cells: BTreeMap<Offset, usize>,
    total: usize,
}

impl OffsetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Offset holders
    // ========================================================================

    /// Track the `u32` field at `at`; register right after writing it
    #[inline]
    pub fn register_offset_holder(&self, at: Offset) {
        self.holders.insert(at);
    }

    /// Stop tracking `at`; must happen before the field's storage is freed
    #[inline]
    pub fn unregister_offset_holder(&self, at: Offset) {
        self.holders.remove(&at);
    }

    pub fn is_registered(&self, at: Offset) -> bool {
        self.holders.contains(&at)
    }

    /// Registered holder locations in ascending order
    pub fn holders(&self) -> Vec<Offset> {
        let mut holders: Vec<Offset> = self.holders.iter().map(|h| *h.key()).collect();
        holders.sort_unstable();
        holders
    }

    // ========================================================================
    // Indirection table
    // ========================================================================

    pub fn register_handle(&mut self, offset: Offset) -> HandleId {
        match self.free_handles.pop() {
            Some(slot) => {
                self.handles[slot] = Some(offset);
                HandleId(slot)
            }
            None => {
                self.handles.push(Some(offset));
                HandleId(self.handles.len() - 1)
            }
        }
    }

    /// Current offset behind `id`
    pub fn handle(&self, id: HandleId) -> Option<Offset> {
        self.handles.get(id.0).copied().flatten()
    }

    pub fn unregister_handle(&mut self, id: HandleId) {
        if let Some(slot) = self.handles.get_mut(id.0) {
            if slot.take().is_some() {
                self.free_handles.push(id.0);
            }
        }
    }

    // ========================================================================
    // Cells
    // ========================================================================

    pub fn cell_allocated(&mut self, offset: Offset, size: usize) {
        let size = align_up(size);
        if let Some(old) = self.cells.insert(offset, size) {
            warn!(offset = %offset, "cell tracked twice");
            self.total -= old;
        }
        self.total += size;
    }

    /// Forget the cell and every holder located inside it
    pub fn cell_freed(&mut self, offset: Offset) {
        let Some(size) = self.cells.remove(&offset) else {
            return;
        };
        self.total -= size;
        let end = offset.add(size);
        self.holders.retain(|h| *h < offset || *h >= end);
    }

    /// Cell at `offset` now lives at `new_offset` (contents already copied)
    ///
    /// Holders inside the old cell are re-registered at the same relative
    /// position in the new one when they still fit, and every holder still pointing at the old
    /// cell is updated to the new one.
    pub fn cell_moved(&mut self, segment: &mut Segment, offset: Offset, new_offset: Offset) {
        let Some(size) = self.cells.get(&offset).copied() else {
            return;
        };
        let end = offset.add(size);
        let inside: Vec<Offset> = self
            .holders
            .iter()
            .map(|h| *h.key())
            .filter(|h| *h >= offset && *h < end)
            .collect();
        let new_size = self.cells.get(&new_offset).copied().unwrap_or(size);
        for holder in inside {
            self.holders.remove(&holder);
            let relative = holder.get() - offset.get();
            // a shrinking move cuts off holders past the new end
            if relative + 4 <= new_size {
                self.holders.insert(new_offset.add(relative));
            }
        }

        self.rewrite(segment, &BTreeMap::from([(offset, new_offset)]));
    }

    pub fn cells(&self) -> &BTreeMap<Offset, usize> {
        &self.cells
    }

    /// Sum of aligned live cell sizes
    pub fn total_allocated(&self) -> usize {
        self.total
    }

    /// Replace holder values and handles found in `relocation`
    fn rewrite(&mut self, segment: &mut Segment, relocation: &BTreeMap<Offset, Offset>) {
        for holder in self.holders() {
            if !segment.contains(holder, 4) {
                warn!(holder = %holder, "offset holder outside the segment");
                continue;
            }
            let Some(value) = Offset::from_raw(segment.read_u32(holder)) else {
                continue;
            };
            if let Some(new) = relocation.get(&value) {
                segment.write_u32(holder, new.raw());
            }
        }
        for slot in self.handles.iter_mut().flatten() {
            if let Some(new) = relocation.get(slot) {
                *slot = *new;
            }
        }
    }

    fn clear_segment_state(&mut self) {
        self.holders.clear();
        self.cells.clear();
        self.total = 0;
    }
}

/// Compact every tracked cell to just after the segment header
///
/// Returns the first offset past the compacted data, which equals the
/// header size plus the sum of live cell sizes. The manager's allocators
/// are detached afterwards and the segment header carries the image magic,
/// so the result is only good for `write_image` and for reads.
pub fn defragment_chunk(manager: &mut SharedMemoryManager) -> Result<usize, DefragError> {
    if !manager.is_writable() {
        return Err(DefragError::ReadOnly);
    }
    let mut registry = manager
        .take_offset_registry()
        .ok_or(DefragError::TrackingDisabled)?;
    let started = Instant::now();

    // the cache root in the header moves like any other holder
    registry.register_offset_holder(CACHE_ROOT_FIELD);

    let mut relocation = BTreeMap::new();
    let mut next = HEADER_SIZE;
    for (&offset, &size) in registry.cells() {
        relocation.insert(offset, Offset::new(next));
        next += size;
    }
    registry.rewrite(manager.segment_mut(), &relocation);

    let mut buffer = Vec::with_capacity(next - HEADER_SIZE);
    for (&offset, &size) in registry.cells() {
        match manager.segment().bytes(offset, size) {
            Some(bytes) => buffer.extend_from_slice(bytes),
            None => {
                manager.restore_offset_registry(registry);
                return Err(DefragError::OutOfRange { offset: offset.get() });
            }
        }
    }

    // allocator state stops mattering once the buffer lands on top of it
    let cells: Vec<Offset> = registry.cells().keys().copied().collect();
    for cell in &cells {
        manager.free(*cell);
    }

    let cache_root = manager.segment().read_u32(CACHE_ROOT_FIELD);
    let segment = manager.segment_mut();
    if let Some(target) = segment.bytes_mut(Offset::new(HEADER_SIZE), buffer.len()) {
        target.copy_from_slice(&buffer);
    }
    segment.write_header(SegmentHeader {
        magic: IMAGE_MAGIC,
        main_allocator: 0,
        bucket_allocator: 0,
        shared_cache: cache_root,
    });
    manager.detach_allocators();

    registry.clear_segment_state();
    manager.restore_offset_registry(registry);

    let elapsed = started.elapsed().as_micros() as u64;
    debug!(bytes = buffer.len(), "compacted buffer written after header");
    log_compaction_complete(cells.len(), next, elapsed);
    Ok(next)
}
