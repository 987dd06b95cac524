//! In-segment vector of cache items
//!
//! The header lives inside the cache root; the item array and the key
//! strings are separate allocations from the shared manager. Every offset
//! field written here is registered as an offset holder so compaction can
//! follow it.

use crate::error::AllocError;
use crate::manager::{MemoryManager, SharedMemoryManager};
use crate::segment::{Offset, Record};
use core::mem;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct VecHeader {
    /// Item array, 0 until the first allocation
    pub data: u32,
    pub len: u32,
    pub cap: u32,
    _reserved: u32,
}

unsafe impl Record for VecHeader {}

pub(super) const VEC_HEADER_SIZE: usize = mem::size_of::<VecHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct CacheItem {
    /// Key bytes, 0 for the empty key
    pub key: u32,
    pub key_len: u32,
    /// Cached resource
    pub value: u32,
    _reserved: u32,
}

unsafe impl Record for CacheItem {}

const ITEM_SIZE: usize = mem::size_of::<CacheItem>();
const KEY_FIELD: usize = 0;
const VALUE_FIELD: usize = 8;

/// Handle to a vector whose header sits at `header`
#[derive(Debug, Clone, Copy)]
pub(super) struct SegmentVec {
    header: Offset,
}

impl SegmentVec {
    pub fn at(header: Offset) -> Self {
        Self { header }
    }

    /// Fresh, empty header
    pub fn init(manager: &mut SharedMemoryManager, header: Offset) -> Self {
        manager.segment_mut().write(header, VecHeader::default());
        Self { header }
    }

    fn read_header(&self, manager: &SharedMemoryManager) -> VecHeader {
        manager.segment().read(self.header)
    }

    pub fn len(&self, manager: &SharedMemoryManager) -> usize {
        self.read_header(manager).len as usize
    }

    pub fn capacity(&self, manager: &SharedMemoryManager) -> usize {
        self.read_header(manager).cap as usize
    }

    fn slot(header: &VecHeader, index: usize) -> Offset {
        Offset::new(header.data as usize + index * ITEM_SIZE)
    }

    pub fn get(&self, manager: &SharedMemoryManager, index: usize) -> CacheItem {
        let header = self.read_header(manager);
        manager.segment().read(Self::slot(&header, index))
    }

    /// Key bytes of `item`
    pub fn key<'m>(manager: &'m SharedMemoryManager, item: &CacheItem) -> &'m [u8] {
        if item.key == 0 {
            return &[];
        }
        manager
            .segment()
            .bytes(Offset::new(item.key as usize), item.key_len as usize)
            .unwrap_or(&[])
    }

    /// Index of the first item whose key equals `key`
    pub fn position(&self, manager: &SharedMemoryManager, key: &[u8]) -> Option<usize> {
        (0..self.len(manager)).find(|i| Self::key(manager, &self.get(manager, *i)) == key)
    }

    /// Make room for `additional` more items
    pub fn reserve(&self, manager: &mut SharedMemoryManager, additional: usize) -> Result<(), AllocError> {
        let mut header = self.read_header(manager);
        let needed = header.len as usize + additional;
        if needed <= header.cap as usize {
            return Ok(());
        }
        let cap = needed.max(header.cap as usize * 2).max(4);

        let data = match Offset::new(header.data as usize) {
            data if data.is_null() => manager.alloc(cap * ITEM_SIZE)?,
            data => manager.realloc(data, cap * ITEM_SIZE)?,
        };
        header.data = data.raw();
        header.cap = cap as u32;
        manager.segment_mut().write(self.header, header);
        manager.register_offset_holder(self.header);
        Ok(())
    }

    /// Append `(key, value)`, copying the key into the segment
    pub fn push(&self, manager: &mut SharedMemoryManager, key: &[u8], value: Offset) -> Result<(), AllocError> {
        self.reserve(manager, 1)?;

        let key_at = if key.is_empty() {
            Offset::NULL
        } else {
            let at = manager.alloc(key.len())?;
            if let Some(bytes) = manager.bytes_mut(at, key.len()) {
                bytes.copy_from_slice(key);
            }
            at
        };

        let mut header = self.read_header(manager);
        let slot = Self::slot(&header, header.len as usize);
        manager.segment_mut().write(
            slot,
            CacheItem {
                key: key_at.raw(),
                key_len: key.len() as u32,
                value: value.raw(),
                _reserved: 0,
            },
        );
        if !key_at.is_null() {
            manager.register_offset_holder(slot.add(KEY_FIELD));
        }
        manager.register_offset_holder(slot.add(VALUE_FIELD));

        header.len += 1;
        manager.segment_mut().write(self.header, header);
        Ok(())
    }

    /// Remove the item at `index`, shifting later items down
    pub fn remove(&self, manager: &mut SharedMemoryManager, index: usize) -> CacheItem {
        let mut header = self.read_header(manager);
        let len = header.len as usize;
        let removed: CacheItem = manager.segment().read(Self::slot(&header, index));

        let tail = (len - index - 1) * ITEM_SIZE;
        if tail > 0 {
            let from = Self::slot(&header, index + 1);
            let to = Self::slot(&header, index);
            manager.segment_mut().copy_within(from, to, tail);
        }

        // holders belong to slot positions: the vacated last slot drops both,
        // shifted slots only need their key field to match the new occupant
        let last = Self::slot(&header, len - 1);
        manager.unregister_offset_holder(last.add(KEY_FIELD));
        manager.unregister_offset_holder(last.add(VALUE_FIELD));
        for i in index..len - 1 {
            let slot = Self::slot(&header, i);
            let item: CacheItem = manager.segment().read(slot);
            if item.key == 0 {
                manager.unregister_offset_holder(slot.add(KEY_FIELD));
            } else {
                manager.register_offset_holder(slot.add(KEY_FIELD));
            }
        }

        header.len -= 1;
        manager.segment_mut().write(self.header, header);

        if removed.key != 0 {
            manager.free(Offset::new(removed.key as usize));
        }
        removed
    }

    /// Copy of every `(key, value)` pair, in insertion order
    pub fn entries(&self, manager: &SharedMemoryManager) -> Vec<(Vec<u8>, Offset)> {
        (0..self.len(manager))
            .map(|i| {
                let item = self.get(manager, i);
                (Self::key(manager, &item).to_vec(), Offset::new(item.value as usize))
            })
            .collect()
    }
}
