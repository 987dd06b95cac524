//! Bucket allocator - fixed size classes for small objects
//!
//! Design: per size class, a chain of lists of 512 slots each. A slot is
//! `[meta:u64][payload:class size]`. Allocation pops the list's free chain
//! or carves the next never-used slot; both are O(1). Whole lists come from
//! and go back to the main allocator.
//!
//! Observed allocation sizes cluster heavily below 32 bytes and around
//! 200 bytes, which is what the class boundaries follow.

use super::main::MainAllocator;
use super::{SlotMeta, META_SIZE, SMALL_OBJECT_THRESHOLD};
use crate::error::AllocError;
use crate::logging::{debug, trace, warn};
use crate::segment::{Offset, Record, Segment, NIL};
use core::mem;
use serde::Serialize;

/// Identifies initialized bucket metadata
const BUCKET_ALLOCATOR_IDENTIFIER: u32 = 0x4255_434B; // 'BUCK'

pub const CLASS_COUNT: usize = 8;

/// Slot payload sizes, all multiples of 8
pub const CLASS_SIZES: [usize; CLASS_COUNT] = [8, 16, 24, 32, 48, 64, 120, 224];

pub const SLOTS_PER_LIST: u32 = 512;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BucketHeader {
    identifier: u32,
    _reserved: u32,
    /// First list of each class
    lists: [u32; CLASS_COUNT],
    /// List of each class known to have a free slot
    spare: [u32; CLASS_COUNT],
}

unsafe impl Record for BucketHeader {}

pub const BUCKET_METADATA_SIZE: usize = mem::size_of::<BucketHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ListHeader {
    class: u32,
    /// Head of the intra-list free chain (slot offset), NIL when empty
    free_head: u32,
    /// Next never-used slot
    cursor: u32,
    /// Live allocations in this list
    live: u32,
    prev: u32,
    next: u32,
}

unsafe impl Record for ListHeader {}

const LIST_HEADER_SIZE: usize = mem::size_of::<ListHeader>();

/// Bytes the main allocator must supply for one list of `class`
#[inline]
pub const fn list_bytes(class: usize) -> usize {
    LIST_HEADER_SIZE + (META_SIZE + CLASS_SIZES[class]) * SLOTS_PER_LIST as usize
}

#[inline]
const fn slot_stride(class: usize) -> usize {
    META_SIZE + CLASS_SIZES[class]
}

/// Per-class usage, collected by walking the chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketClassStats {
    pub class_size: usize,
    pub lists: usize,
    pub live_slots: usize,
    pub reserved_bytes: usize,
    pub bookkeeping_bytes: usize,
}

/// Handle to bucket allocator state inside a segment
#[derive(Debug, Clone)]
pub struct BucketAllocator {
    header: Offset,
    /// size -> class index for 0..=threshold
    index: [u8; SMALL_OBJECT_THRESHOLD + 1],
}

fn build_index() -> [u8; SMALL_OBJECT_THRESHOLD + 1] {
    let mut index = [0u8; SMALL_OBJECT_THRESHOLD + 1];
    let mut class = 0;
    for (size, slot) in index.iter_mut().enumerate() {
        while size > CLASS_SIZES[class] {
            class += 1;
        }
        *slot = class as u8;
    }
    index
}

impl BucketAllocator {
    /// Reconnect to metadata at `at`, or format it (space already reserved)
    pub fn initialize(
        segment: &mut Segment,
        at: Offset,
        main: &mut MainAllocator,
    ) -> Result<Self, AllocError> {
        if let Some(allocator) = Self::attach(segment, at) {
            debug!(offset = %at, "reconnected bucket allocator");
            return Ok(allocator);
        }
        Self::format(segment, at, main)
    }

    /// Cold initialization, one fresh list per class
    pub fn format(
        segment: &mut Segment,
        at: Offset,
        main: &mut MainAllocator,
    ) -> Result<Self, AllocError> {
        let allocator = Self { header: at, index: build_index() };
        let mut header = BucketHeader {
            identifier: 0,
            _reserved: 0,
            lists: [NIL; CLASS_COUNT],
            spare: [NIL; CLASS_COUNT],
        };
        for class in 0..CLASS_COUNT {
            let list = main.alloc(segment, list_bytes(class))?;
            init_list(segment, list, class, None);
            header.lists[class] = list.raw();
            header.spare[class] = list.raw();
        }
        segment.write(at, header);

        header.identifier = BUCKET_ALLOCATOR_IDENTIFIER;
        segment.write(at, header);

        debug!(offset = %at, "initialized bucket allocator");
        Ok(allocator)
    }

    /// Read-only handle for inspection
    pub fn attach(segment: &Segment, at: Offset) -> Option<Self> {
        let allocator = Self { header: at, index: build_index() };
        allocator.is_initialized(segment).then_some(allocator)
    }

    fn is_initialized(&self, segment: &Segment) -> bool {
        segment.contains(self.header, BUCKET_METADATA_SIZE)
            && segment.read::<BucketHeader>(self.header).identifier == BUCKET_ALLOCATOR_IDENTIFIER
    }

    #[inline]
    fn meta(&self, segment: &Segment) -> BucketHeader {
        segment.read(self.header)
    }

    /// Class index covering `size`
    #[inline]
    pub fn class_of(&self, size: usize) -> Option<usize> {
        self.index.get(size).map(|c| *c as usize)
    }

    /// Allocate a slot for `size` (1..=threshold); returns the payload offset
    pub fn alloc(
        &mut self,
        segment: &mut Segment,
        main: &mut MainAllocator,
        size: usize,
    ) -> Result<Offset, AllocError> {
        let class = match self.class_of(size) {
            Some(class) if size > 0 => class,
            _ => return Err(AllocError::InvalidSize(size)),
        };

        let list_at = self.list_with_space(segment, main, class)?;
        let mut list: ListHeader = segment.read(list_at);

        let slot = match Offset::from_raw(list.free_head) {
            Some(slot) => {
                list.free_head = match SlotMeta::decode(segment.read::<u64>(slot)) {
                    Some(SlotMeta::NextFree(next)) => Offset::to_raw(next),
                    other => {
                        warn!(slot = %slot, meta = ?other, "corrupt free chain, dropping it");
                        NIL
                    }
                };
                slot
            }
            None => {
                let slot = Offset::new(list.cursor as usize);
                list.cursor += slot_stride(class) as u32;
                slot
            }
        };

        SlotMeta::Owner(list_at).write_at(segment, slot);
        list.live += 1;
        segment.write(list_at, list);

        if list.live == SLOTS_PER_LIST && !self.set_spare(segment, class) {
            // list is full and so are its siblings; grow the chain now
            match main.alloc(segment, list_bytes(class)) {
                Ok(new_list) => self.add_list(segment, class, new_list),
                Err(e) => {
                    trace!(class_size = CLASS_SIZES[class], error = %e, "deferred list growth");
                }
            }
        }

        Ok(slot.add(META_SIZE))
    }

    /// Release a slot; empty lists go back to the main allocator when a
    /// sibling can take over
    pub fn free(&mut self, segment: &mut Segment, main: &mut MainAllocator, payload: Offset) {
        let slot = payload.sub(META_SIZE);
        let list_at = match SlotMeta::decode(segment.read::<u64>(slot)) {
            Some(SlotMeta::Owner(list)) => list,
            Some(SlotMeta::NextFree(_)) => {
                warn!(offset = %payload, "double free ignored");
                return;
            }
            other => {
                warn!(offset = %payload, meta = ?other, "bucket free of foreign block ignored");
                return;
            }
        };

        let mut list: ListHeader = segment.read(list_at);
        list.live -= 1;

        if list.live == 0 && (list.prev != NIL || list.next != NIL) {
            let class = list.class as usize;
            let mut meta = self.meta(segment);

            // unlink
            if let Some(prev) = Offset::from_raw(list.prev) {
                let mut p: ListHeader = segment.read(prev);
                p.next = list.next;
                segment.write(prev, p);
            } else {
                meta.lists[class] = list.next;
            }
            if let Some(next) = Offset::from_raw(list.next) {
                let mut n: ListHeader = segment.read(next);
                n.prev = list.prev;
                segment.write(next, n);
            }
            segment.write(self.header, meta);
            segment.write(list_at, list);

            if self.set_spare(segment, class) {
                main.free(segment, list_at);
                trace!(class_size = CLASS_SIZES[class], list = %list_at, "released empty list");
            } else {
                // every sibling is full; keep this one as the recycle target
                self.add_list(segment, class, list_at);
            }
            return;
        }

        SlotMeta::NextFree(Offset::from_raw(list.free_head)).write_at(segment, slot);
        list.free_head = slot.raw();
        segment.write(list_at, list);
    }

    /// Capacity of the slot's size class, not the requested size
    pub fn allocated_size(&self, segment: &Segment, payload: Offset) -> usize {
        match SlotMeta::read(segment, payload) {
            Some(SlotMeta::Owner(list)) => {
                let list: ListHeader = segment.read(list);
                CLASS_SIZES.get(list.class as usize).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// List offsets of a class, head first
    pub fn lists(&self, segment: &Segment, class: usize) -> Vec<Offset> {
        let mut lists = Vec::new();
        let mut at = Offset::from_raw(self.meta(segment).lists[class]);
        while let Some(list) = at {
            lists.push(list);
            at = Offset::from_raw(segment.read::<ListHeader>(list).next);
        }
        lists
    }

    /// The list allocations of `class` currently go to
    pub fn spare_list(&self, segment: &Segment, class: usize) -> Option<Offset> {
        Offset::from_raw(self.meta(segment).spare[class])
    }

    /// Live allocations in the list at `list`
    pub fn live_in(&self, segment: &Segment, list: Offset) -> u32 {
        segment.read::<ListHeader>(list).live
    }

    pub fn stats(&self, segment: &Segment) -> Vec<BucketClassStats> {
        (0..CLASS_COUNT)
            .map(|class| {
                let lists = self.lists(segment, class);
                let live_slots: usize = lists
                    .iter()
                    .map(|l| segment.read::<ListHeader>(*l).live as usize)
                    .sum();
                BucketClassStats {
                    class_size: CLASS_SIZES[class],
                    lists: lists.len(),
                    live_slots,
                    reserved_bytes: lists.len() * list_bytes(class),
                    bookkeeping_bytes: lists.len()
                        * (LIST_HEADER_SIZE + META_SIZE * SLOTS_PER_LIST as usize),
                }
            })
            .collect()
    }

    /// Spare list with room, growing the chain if every list is full
    fn list_with_space(
        &mut self,
        segment: &mut Segment,
        main: &mut MainAllocator,
        class: usize,
    ) -> Result<Offset, AllocError> {
        if let Some(spare) = self.spare_list(segment, class) {
            if segment.read::<ListHeader>(spare).live < SLOTS_PER_LIST {
                return Ok(spare);
            }
        }
        if !self.set_spare(segment, class) {
            let new_list = main.alloc(segment, list_bytes(class))?;
            self.add_list(segment, class, new_list);
        }
        self.spare_list(segment, class)
            .ok_or(AllocError::OutOfMemory { requested: CLASS_SIZES[class] })
    }

    /// Point the class's spare pointer at the first list with room
    fn set_spare(&mut self, segment: &mut Segment, class: usize) -> bool {
        let mut meta = self.meta(segment);
        let mut at = Offset::from_raw(meta.lists[class]);
        while let Some(list_at) = at {
            let list: ListHeader = segment.read(list_at);
            if list.live < SLOTS_PER_LIST {
                meta.spare[class] = list_at.raw();
                segment.write(self.header, meta);
                return true;
            }
            at = Offset::from_raw(list.next);
        }
        false
    }

    /// Link a fresh (or recycled) list at the head of the class chain
    fn add_list(&mut self, segment: &mut Segment, class: usize, list_at: Offset) {
        let mut meta = self.meta(segment);
        let old_head = Offset::from_raw(meta.lists[class]);
        init_list(segment, list_at, class, old_head);
        if let Some(old) = old_head {
            let mut h: ListHeader = segment.read(old);
            h.prev = list_at.raw();
            segment.write(old, h);
        }
        meta.lists[class] = list_at.raw();
        meta.spare[class] = list_at.raw();
        segment.write(self.header, meta);
    }
}

fn init_list(segment: &mut Segment, at: Offset, class: usize, next: Option<Offset>) {
    segment.write(
        at,
        ListHeader {
            class: class as u32,
            free_head: NIL,
            cursor: at.add(LIST_HEADER_SIZE).raw(),
            live: 0,
            prev: NIL,
            next: Offset::to_raw(next),
        },
    );
}
