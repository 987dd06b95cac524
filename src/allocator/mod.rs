//! Segment allocators - two tiers over one shared heap
//!
//! Design: two-layer architecture:
//! 1. Main allocator - variable-size blocks, best-fit via an in-segment size
//!    tree, address-order coalescing through boundary tags
//! 2. Bucket allocator - eight fixed size classes (8..=224 bytes) carved out
//!    of 512-slot lists obtained from the main allocator
//!
//! Both allocators keep all state inside the segment so a restarted server
//! can reconnect to it. The handles below only remember where that state is.

mod block;
mod bucket;
mod main;
mod splay;


pub use bucket::{BucketAllocator, BucketClassStats, CLASS_SIZES, SLOTS_PER_LIST};
pub use main::{MainAllocator, MainStats};

use crate::segment::{Offset, Segment, NIL};

/// Requests up to this many bytes go to the bucket allocator
pub const SMALL_OBJECT_THRESHOLD: usize = 224;

/// Bytes reserved for bucket allocator bookkeeping
pub const BUCKET_METADATA_RESERVE: usize = 512;

/// Width of the metadata word in front of every handed-out block
pub const META_SIZE: usize = 8;

const TAG_BITS: u64 = 3;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

const TAG_OWNER: u64 = 0;
const TAG_MAIN: u64 = 1;
const TAG_NEXT_FREE: u64 = 2;
const TAG_MAIN_FREE: u64 = 3;

/// The 8-byte word stored just before every payload
///
/// The same storage means different things depending on the block's state;
/// the tag in the low bits makes that state explicit so dispatch never has
/// to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMeta {
    /// Bucket slot in use: offset of the owning list's header
    Owner(Offset),
    /// Bucket slot on its list's free chain: next free slot, if any
    NextFree(Option<Offset>),
    /// Main-allocator block in use with its true payload capacity
    Main { capacity: u32 },
    /// Main-allocator block sitting in the free tree
    MainFree,
}

impl SlotMeta {
    pub fn encode(self) -> u64 {
        match self {
            Self::Owner(list) => ((list.raw() as u64) << TAG_BITS) | TAG_OWNER,
            Self::NextFree(next) => ((Offset::to_raw(next) as u64) << TAG_BITS) | TAG_NEXT_FREE,
            Self::Main { capacity } => ((capacity as u64) << TAG_BITS) | TAG_MAIN,
            Self::MainFree => TAG_MAIN_FREE,
        }
    }

    /// `None` for words no allocator would have written
    pub fn decode(word: u64) -> Option<Self> {
        let value = word >> TAG_BITS;
        if value > NIL as u64 {
            return None;
        }
        let value = value as u32;
        match word & TAG_MASK {
            TAG_OWNER => Offset::from_raw(value).map(Self::Owner),
            TAG_NEXT_FREE => Some(Self::NextFree(Offset::from_raw(value))),
            TAG_MAIN => Some(Self::Main { capacity: value }),
            TAG_MAIN_FREE if value == 0 => Some(Self::MainFree),
            _ => None,
        }
    }

    /// Read the word in front of `payload`
    #[inline]
    pub fn read(segment: &Segment, payload: Offset) -> Option<Self> {
        if payload.get() < META_SIZE {
            return None;
        }
        Self::decode(segment.read::<u64>(payload.sub(META_SIZE)))
    }

    /// Write the word at `slot` (the start of the metadata, not the payload)
    #[inline]
    pub fn write_at(self, segment: &mut Segment, slot: Offset) {
        segment.write::<u64>(slot, self.encode());
    }

    /// Whether the owning allocator is the main allocator
    #[inline]
    pub fn is_main(self) -> bool {
        matches!(self, Self::Main { .. } | Self::MainFree)
    }
}
