//! Shared cache - named resource registry inside the segment
//!
//! Design: three insertion-ordered vectors of `(key, offset)`, one per
//! `ItemKind`, plus an optional immutable static offset table:
//! 1. Stylesheet and layout lookups probe the static table first by binary
//!    search on a 32-bit key hash, without taking the lock
//! 2. Everything else is a linear scan of the dynamic vector under the
//!    cross-process cache lock
//!
//! Global layout parameters live only in the static table and are likewise
//! read without the lock.
//!
//! The cache root is found through the segment header on every call, so a
//! compacted or preloaded segment needs no fix-up here.

mod lock;
mod offset_map;
mod vector;


pub use lock::{open_lock, CacheGuard, CacheLock, LocalLock};
#[cfg(unix)]
pub use lock::NamedSemaphore;
pub use offset_map::{hash32, OffsetMapBuilder, ParameterValue, SpecialParameter, StaticOffsetMap};

use crate::error::AllocError;
use crate::logging::{info, log_cache_add, log_cache_miss, log_cache_remove, warn};
use crate::manager::{MemoryManager, SharedMemoryManager};
use crate::segment::{Offset, Record, CACHE_ROOT_FIELD, NIL};
use core::fmt;
use core::mem;
use offset_map::{
    LayoutIndexItem, ParameterItem, StaticItem, LAYOUT_ITEM_SIZE, PARAMETER_ITEM_SIZE, STATIC_ITEM_SIZE,
};
use vector::{SegmentVec, VecHeader, VEC_HEADER_SIZE};

/// Kind of cached resource; selects the dynamic vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    LayoutDefinition,
    Stylesheet,
    Effect,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [Self::LayoutDefinition, Self::Stylesheet, Self::Effect];

    #[inline]
    fn index(self) -> usize {
        match self {
            Self::LayoutDefinition => 0,
            Self::Stylesheet => 1,
            Self::Effect => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LayoutDefinition => "layout",
            Self::Stylesheet => "stylesheet",
            Self::Effect => "effect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "layout" | "layoutdefinition" => Some(Self::LayoutDefinition),
            "stylesheet" | "css" => Some(Self::Stylesheet),
            "effect" => Some(Self::Effect),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CacheRoot {
    vectors: [VecHeader; 3],
    /// Static offset blob, NIL if none
    static_table: u32,
    static_count: u32,
    static_len: u32,
    /// Parameter section, relative to the static blob; NIL if none
    parameter_table: u32,
}

unsafe impl Record for CacheRoot {}

const CACHE_ROOT_SIZE: usize = mem::size_of::<CacheRoot>();
const STATIC_TABLE_FIELD: usize = 3 * VEC_HEADER_SIZE;
const STATIC_COUNT_FIELD: usize = STATIC_TABLE_FIELD + 4;
const STATIC_LEN_FIELD: usize = STATIC_TABLE_FIELD + 8;
const PARAMETER_TABLE_FIELD: usize = STATIC_TABLE_FIELD + 12;

const STYLESHEET_SUFFIX: &str = ".css";
const COLOR_STYLESHEET_SUFFIX: &str = "_color.css";
const LAYOUT_SUFFIX: &str = ".widgetml";

/// Reduce resource paths (`:/themes/style/hbdefault/hbpushbutton.css`) to
/// their file name
fn normalize_key(key: &str) -> &str {
    if key.starts_with(':') {
        key.rsplit('/').next().unwrap_or(key)
    } else {
        key
    }
}

fn layout_key(file: &str, layout: &str, section: &str) -> String {
    format!("{}\0{}\0{}", normalize_key(file), layout, section)
}

/// Handle to the cache published in a shared segment
///
/// Holds only the lock; every operation takes the manager that maps the
/// segment, so server and clients share one code path.
pub struct SharedCache {
    lock: Box<dyn CacheLock>,
}

impl SharedCache {
    /// Server side: publish a new cache, or adopt the one already in the
    /// segment (reconnect after a crash, preloaded image)
    ///
    /// `statics` is copied into the segment only when a new cache is
    /// created. Room for `effect_reserve` effects is reserved up front.
    pub fn init_server(
        manager: &mut SharedMemoryManager,
        statics: Option<&StaticOffsetMap>,
        effect_reserve: usize,
        lock: Box<dyn CacheLock>,
    ) -> Result<Self, AllocError> {
        if !manager.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        if let Some(root) = manager.cache_root() {
            if statics.is_some() {
                warn!(root = %root, "cache already present, static offset map ignored");
            }
            info!(root = %root, "shared cache attached");
            return Ok(Self { lock });
        }

        let root = manager.alloc(CACHE_ROOT_SIZE)?;
        for kind in ItemKind::ALL {
            SegmentVec::init(manager, vector_at(root, kind));
        }
        let segment = manager.segment_mut();
        segment.write_u32(root.add(STATIC_TABLE_FIELD), NIL);
        segment.write_u32(root.add(STATIC_COUNT_FIELD), 0);
        segment.write_u32(root.add(STATIC_LEN_FIELD), 0);
        segment.write_u32(root.add(PARAMETER_TABLE_FIELD), NIL);

        if let Some(map) = statics.filter(|map| !map.is_empty()) {
            let blob = manager.alloc(map.bytes().len())?;
            if let Some(target) = manager.bytes_mut(blob, map.bytes().len()) {
                target.copy_from_slice(map.bytes());
            }
            for position in map.holder_positions() {
                manager.register_offset_holder(blob.add(*position));
            }
            let segment = manager.segment_mut();
            segment.write_u32(root.add(STATIC_TABLE_FIELD), blob.raw());
            segment.write_u32(root.add(STATIC_COUNT_FIELD), map.len() as u32);
            segment.write_u32(root.add(STATIC_LEN_FIELD), map.bytes().len() as u32);
            segment.write_u32(root.add(PARAMETER_TABLE_FIELD), map.parameter_table() as u32);
            manager.register_offset_holder(root.add(STATIC_TABLE_FIELD));
        }

        SegmentVec::at(vector_at(root, ItemKind::Effect)).reserve(manager, effect_reserve)?;

        manager.set_cache_root(root)?;
        manager.register_offset_holder(CACHE_ROOT_FIELD);
        info!(
            root = %root,
            static_widgets = statics.map_or(0, |map| map.len()),
            parameters = statics.map_or(0, |map| map.parameter_count()),
            "shared cache created"
        );
        Ok(Self { lock })
    }

    /// Client side: `None` until a server has published a cache
    pub fn init_client(manager: &SharedMemoryManager, lock: Box<dyn CacheLock>) -> Option<Self> {
        manager.cache_root().map(|_| Self { lock })
    }

    fn root(manager: &SharedMemoryManager) -> Option<Offset> {
        manager.cache_root()
    }

    fn vector(manager: &SharedMemoryManager, kind: ItemKind) -> Option<SegmentVec> {
        Self::root(manager).map(|root| SegmentVec::at(vector_at(root, kind)))
    }

    // ========================================================================
    // Generic items
    // ========================================================================

    /// Append `(key, offset)` to the dynamic vector of `kind`
    ///
    /// No duplicate check: a later entry with the same key is shadowed by
    /// the earlier one on lookup.
    pub fn add(
        &self,
        manager: &mut SharedMemoryManager,
        kind: ItemKind,
        key: &str,
        offset: Offset,
    ) -> Result<(), AllocError> {
        self.push(manager, kind, normalize_key(key), offset)
    }

    fn push(
        &self,
        manager: &mut SharedMemoryManager,
        kind: ItemKind,
        key: &str,
        offset: Offset,
    ) -> Result<(), AllocError> {
        if !manager.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        let vector = Self::vector(manager, kind).ok_or(AllocError::Detached)?;
        let _guard = CacheGuard::new(self.lock.as_ref());
        vector.push(manager, key.as_bytes(), offset)?;
        log_cache_add(kind.as_str(), key, offset);
        Ok(())
    }

    /// Offset cached under `key`, static table first for stylesheets
    pub fn offset(&self, manager: &SharedMemoryManager, kind: ItemKind, key: &str) -> Option<Offset> {
        let key = normalize_key(key);
        if kind == ItemKind::Stylesheet {
            if let Some(offset) = static_stylesheet(manager, key) {
                return Some(offset);
            }
        }
        self.scan(manager, kind, key)
    }

    fn scan(&self, manager: &SharedMemoryManager, kind: ItemKind, key: &str) -> Option<Offset> {
        let vector = Self::vector(manager, kind)?;
        let found = {
            let _guard = CacheGuard::new(self.lock.as_ref());
            vector
                .position(manager, key.as_bytes())
                .map(|index| Offset::new(vector.get(manager, index).value as usize))
        };
        if found.is_none() {
            log_cache_miss(kind.as_str(), key);
        }
        found
    }

    /// Drop the first dynamic entry for `key`; the static table is never touched
    pub fn remove(
        &self,
        manager: &mut SharedMemoryManager,
        kind: ItemKind,
        key: &str,
    ) -> Result<bool, AllocError> {
        self.take(manager, kind, normalize_key(key))
    }

    fn take(
        &self,
        manager: &mut SharedMemoryManager,
        kind: ItemKind,
        key: &str,
    ) -> Result<bool, AllocError> {
        if !manager.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        let Some(vector) = Self::vector(manager, kind) else {
            return Ok(false);
        };
        let _guard = CacheGuard::new(self.lock.as_ref());
        match vector.position(manager, key.as_bytes()) {
            Some(index) => {
                vector.remove(manager, index);
                log_cache_remove(kind.as_str(), key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Layout definitions
    // ========================================================================

    pub fn add_layout_definition(
        &self,
        manager: &mut SharedMemoryManager,
        file: &str,
        layout: &str,
        section: &str,
        offset: Offset,
    ) -> Result<(), AllocError> {
        let key = layout_key(file, layout, section);
        self.push(manager, ItemKind::LayoutDefinition, &key, offset)
    }

    /// Layout definition offset, static layout index first
    pub fn layout_definition_offset(
        &self,
        manager: &SharedMemoryManager,
        file: &str,
        layout: &str,
        section: &str,
    ) -> Option<Offset> {
        let file = normalize_key(file);
        if let Some(offset) = static_layout(manager, file, layout, section) {
            return Some(offset);
        }
        self.scan(manager, ItemKind::LayoutDefinition, &layout_key(file, layout, section))
    }

    pub fn remove_layout_definition(
        &self,
        manager: &mut SharedMemoryManager,
        file: &str,
        layout: &str,
        section: &str,
    ) -> Result<bool, AllocError> {
        let key = layout_key(file, layout, section);
        self.take(manager, ItemKind::LayoutDefinition, &key)
    }

    // ========================================================================
    // Global layout parameters
    // ========================================================================

    /// Value of the global layout parameter `name`
    pub fn layout_parameter(&self, manager: &SharedMemoryManager, name: &str) -> Option<ParameterValue> {
        let table = StaticTable::locate(manager)?;
        table.find_parameter(manager, name)
    }

    /// All global layout parameters, sorted by name hash
    pub fn layout_parameters(&self, manager: &SharedMemoryManager) -> Vec<(String, ParameterValue)> {
        let Some(table) = StaticTable::locate(manager) else {
            return Vec::new();
        };
        let Some(section) = table.parameter_section(manager) else {
            return Vec::new();
        };
        (0..section.count)
            .filter_map(|i| {
                let item = section.item(manager, i);
                let name = table.parameter_name(manager, &section, &item)?;
                Some((name, ParameterValue::decode(&item)?))
            })
            .collect()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Dynamic entries of `kind` in insertion order (layout keys keep their
    /// `\0` separators)
    pub fn entries(&self, manager: &SharedMemoryManager, kind: ItemKind) -> Vec<(String, Offset)> {
        let Some(vector) = Self::vector(manager, kind) else {
            return Vec::new();
        };
        let _guard = CacheGuard::new(self.lock.as_ref());
        vector
            .entries(manager)
            .into_iter()
            .map(|(key, offset)| (String::from_utf8_lossy(&key).into_owned(), offset))
            .collect()
    }

    /// Number of dynamic entries of `kind`
    pub fn len(&self, manager: &SharedMemoryManager, kind: ItemKind) -> usize {
        let Some(root) = Self::root(manager) else {
            return 0;
        };
        let _guard = CacheGuard::new(self.lock.as_ref());
        let cache: CacheRoot = manager.segment().read(root);
        cache.vectors[kind.index()].len as usize
    }

    /// Entries of `kind` that fit before the vector has to grow
    pub fn capacity(&self, manager: &SharedMemoryManager, kind: ItemKind) -> usize {
        Self::vector(manager, kind).map_or(0, |vector| vector.capacity(manager))
    }

    /// Widgets in the static offset table
    pub fn static_len(&self, manager: &SharedMemoryManager) -> usize {
        StaticTable::locate(manager).map_or(0, |table| table.count)
    }
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache").finish_non_exhaustive()
    }
}

#[inline]
fn vector_at(root: Offset, kind: ItemKind) -> Offset {
    root.add(kind.index() * VEC_HEADER_SIZE)
}

/// Static offset blob as found in the segment
struct StaticTable {
    blob: Offset,
    count: usize,
    len: usize,
    parameters: Option<usize>,
}

/// Parameter items and the names that follow them
struct ParameterSection {
    items: Offset,
    count: usize,
}

impl ParameterSection {
    fn item(&self, manager: &SharedMemoryManager, index: usize) -> ParameterItem {
        manager.segment().read(self.items.add(index * PARAMETER_ITEM_SIZE))
    }
}

impl StaticTable {
    fn locate(manager: &SharedMemoryManager) -> Option<Self> {
        let root = manager.cache_root()?;
        let segment = manager.segment();
        if !segment.contains(root, CACHE_ROOT_SIZE) {
            return None;
        }
        let cache: CacheRoot = segment.read(root);
        let blob = Offset::from_raw(cache.static_table)?;
        let len = cache.static_len as usize;
        if !segment.contains(blob, len) {
            warn!(blob = %blob, "static offset table out of range");
            return None;
        }
        let parameters = match cache.parameter_table {
            NIL => None,
            table => Some(table as usize),
        };
        Some(Self { blob, count: cache.static_count as usize, len, parameters })
    }

    fn find(&self, manager: &SharedMemoryManager, widget: &str) -> Option<StaticItem> {
        let hash = hash32(widget);
        let segment = manager.segment();
        let (mut low, mut high) = (0, self.count);
        while low < high {
            let mid = (low + high) / 2;
            let item: StaticItem = segment.read(self.blob.add(mid * STATIC_ITEM_SIZE));
            match item.hash.cmp(&hash) {
                core::cmp::Ordering::Less => low = mid + 1,
                core::cmp::Ordering::Greater => high = mid,
                core::cmp::Ordering::Equal => return Some(item),
            }
        }
        None
    }

    fn find_layout(
        &self,
        manager: &SharedMemoryManager,
        item: &StaticItem,
        layout: &str,
        section: &str,
    ) -> Option<Offset> {
        let table = item.layout_table as usize;
        if item.layout_table == NIL || table + 4 > self.len {
            return None;
        }
        let segment = manager.segment();
        let count = segment.read_u32(self.blob.add(table)) as usize;
        let items = self.blob.add(table + 4);
        if table + 4 + count * LAYOUT_ITEM_SIZE > self.len {
            return None;
        }

        let key = (hash32(layout), hash32(section));
        let (mut low, mut high) = (0, count);
        while low < high {
            let mid = (low + high) / 2;
            let entry: LayoutIndexItem = segment.read(items.add(mid * LAYOUT_ITEM_SIZE));
            match (entry.layout_hash, entry.section_hash).cmp(&key) {
                core::cmp::Ordering::Less => low = mid + 1,
                core::cmp::Ordering::Greater => high = mid,
                core::cmp::Ordering::Equal => return Offset::from_raw(entry.offset),
            }
        }
        None
    }
}

impl StaticTable {
    fn parameter_section(&self, manager: &SharedMemoryManager) -> Option<ParameterSection> {
        let table = self.parameters?;
        if table + 4 > self.len {
            return None;
        }
        let count = manager.segment().read_u32(self.blob.add(table)) as usize;
        if table + 4 + count * PARAMETER_ITEM_SIZE > self.len {
            warn!(count, "parameter table out of range");
            return None;
        }
        Some(ParameterSection { items: self.blob.add(table + 4), count })
    }

    fn parameter_name(
        &self,
        manager: &SharedMemoryManager,
        section: &ParameterSection,
        item: &ParameterItem,
    ) -> Option<String> {
        let start = section.items.get() + item.name as usize;
        let end = self.blob.get() + self.len;
        let bytes = manager.bytes(Offset::new(start), end.checked_sub(start)?)?;
        let len = bytes.iter().position(|b| *b == 0)?;
        String::from_utf8(bytes[..len].to_vec()).ok()
    }

    fn find_parameter(&self, manager: &SharedMemoryManager, name: &str) -> Option<ParameterValue> {
        let section = self.parameter_section(manager)?;
        let hash = hash32(name);
        let (mut low, mut high) = (0, section.count);
        while low < high {
            let mid = (low + high) / 2;
            let item = section.item(manager, mid);
            match item.hash.cmp(&hash) {
                core::cmp::Ordering::Less => low = mid + 1,
                core::cmp::Ordering::Greater => high = mid,
                core::cmp::Ordering::Equal => {
                    // a hash shared with a different name is a miss
                    if self.parameter_name(manager, &section, &item)? != name {
                        return None;
                    }
                    return ParameterValue::decode(&item);
                }
            }
        }
        None
    }
}

fn static_stylesheet(manager: &SharedMemoryManager, file: &str) -> Option<Offset> {
    let (widget, color) = if let Some(widget) = file.strip_suffix(COLOR_STYLESHEET_SUFFIX) {
        (widget, true)
    } else {
        (file.strip_suffix(STYLESHEET_SUFFIX)?, false)
    };
    let table = StaticTable::locate(manager)?;
    let item = table.find(manager, widget)?;
    Offset::from_raw(if color { item.color_css } else { item.css })
}

fn static_layout(manager: &SharedMemoryManager, file: &str, layout: &str, section: &str) -> Option<Offset> {
    let widget = file.strip_suffix(LAYOUT_SUFFIX)?;
    let table = StaticTable::locate(manager)?;
    let item = table.find(manager, widget)?;
    table.find_layout(manager, &item, layout, section)
}
