//! Main allocator block layout
//!
//! ```text
//! used: [size:u32 | prev_size:u32][meta:u64 = Main{capacity}][payload ...]
//! free: [size:u32 | prev_size:u32][meta:u64 = MainFree][left:u32 | right:u32][...]
//! ```
//!
//! `size` is the whole block in bytes (multiple of 8) with bit 0 set while
//! the block is free; `prev_size` is the size of the physically preceding
//! block, 0 for the first block of the heap. The tree links live in the
//! first payload bytes of free blocks only.

use super::{SlotMeta, META_SIZE};
use crate::segment::{Offset, Record, Segment};

const FREE_BIT: u32 = 1;

/// Block header + metadata word
pub(super) const BLOCK_OVERHEAD: usize = 8 + META_SIZE;

/// Header, metadata and room for the two tree links
pub(super) const MIN_BLOCK: usize = BLOCK_OVERHEAD + 8;

const LEFT: usize = BLOCK_OVERHEAD;
const RIGHT: usize = BLOCK_OVERHEAD + 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct BlockHeader {
    size_flags: u32,
    pub prev_size: u32,
}

unsafe impl Record for BlockHeader {}

impl BlockHeader {
    #[inline]
    pub fn new(size: u32, prev_size: u32, free: bool) -> Self {
        debug_assert!(size % 8 == 0, "block size must stay 8-aligned");
        Self {
            size_flags: size | if free { FREE_BIT } else { 0 },
            prev_size,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size_flags & !FREE_BIT
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.size_flags & FREE_BIT != 0
    }
}

#[inline]
pub(super) fn header(segment: &Segment, block: Offset) -> BlockHeader {
    segment.read(block)
}

#[inline]
pub(super) fn set_header(segment: &mut Segment, block: Offset, header: BlockHeader) {
    segment.write(block, header)
}

#[inline]
pub(super) fn size(segment: &Segment, block: Offset) -> u32 {
    header(segment, block).size()
}

#[inline]
pub(super) fn set_prev_size(segment: &mut Segment, block: Offset, prev_size: u32) {
    let mut h = header(segment, block);
    h.prev_size = prev_size;
    set_header(segment, block, h);
}

/// Mark `block` free and write the matching metadata word
pub(super) fn mark_free(segment: &mut Segment, block: Offset, size: u32, prev_size: u32) {
    set_header(segment, block, BlockHeader::new(size, prev_size, true));
    SlotMeta::MainFree.write_at(segment, block.add(8));
}

/// Mark `block` used; the payload capacity goes into the metadata word
pub(super) fn mark_used(segment: &mut Segment, block: Offset, size: u32, prev_size: u32) {
    set_header(segment, block, BlockHeader::new(size, prev_size, false));
    let capacity = size - BLOCK_OVERHEAD as u32;
    SlotMeta::Main { capacity }.write_at(segment, block.add(8));
}

#[inline]
pub(super) fn payload(block: Offset) -> Offset {
    block.add(BLOCK_OVERHEAD)
}

#[inline]
pub(super) fn from_payload(payload: Offset) -> Offset {
    payload.sub(BLOCK_OVERHEAD)
}

#[inline]
pub(super) fn left(segment: &Segment, node: u32) -> u32 {
    segment.read_u32(Offset::new(node as usize + LEFT))
}

#[inline]
pub(super) fn right(segment: &Segment, node: u32) -> u32 {
    segment.read_u32(Offset::new(node as usize + RIGHT))
}

#[inline]
pub(super) fn set_left(segment: &mut Segment, node: u32, value: u32) {
    segment.write_u32(Offset::new(node as usize + LEFT), value)
}

#[inline]
pub(super) fn set_right(segment: &mut Segment, node: u32, value: u32) {
    segment.write_u32(Offset::new(node as usize + RIGHT), value)
}
