//! Static offset map - hash-sorted stylesheet and layout offsets
//!
//! Built once (offline or at server start-up) and copied into the segment
//! as one immutable blob, so lookups need no lock:
//!
//! ```text
//! [StaticItem; count]                 sorted by widget hash
//! per widget with layouts:
//!   [count:u32][LayoutIndexItem; count]  sorted by (layout hash, section hash)
//! global parameters:
//!   [count:u32][ParameterItem; count]    sorted by name hash
//!   names, NUL-terminated
//! ```
//!
//! Every field is a native-endian `u32`; absent offsets are `NIL` and
//! `layout_table` is a byte position relative to the blob start. A
//! parameter's `name` is relative to its first `ParameterItem`.

use crate::error::OffsetMapError;
use crate::segment::{Offset, Record, NIL};
use core::mem;
use std::collections::BTreeMap;

/// 32 bits of BLAKE3 over `text`
pub fn hash32(text: &str) -> u32 {
    let hash = blake3::hash(text.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StaticItem {
    pub hash: u32,
    pub css: u32,
    pub color_css: u32,
    pub layout_table: u32,
}

unsafe impl Record for StaticItem {}

pub(super) const STATIC_ITEM_SIZE: usize = mem::size_of::<StaticItem>();

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct LayoutIndexItem {
    pub layout_hash: u32,
    pub section_hash: u32,
    pub offset: u32,
}

unsafe impl Record for LayoutIndexItem {}

pub(super) const LAYOUT_ITEM_SIZE: usize = mem::size_of::<LayoutIndexItem>();

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ParameterItem {
    pub hash: u32,
    /// Segment offset, or `SpecialParameter` index when `special` is set
    pub value: u32,
    pub name: u32,
    pub special: u32,
}

unsafe impl Record for ParameterItem {}

pub(super) const PARAMETER_ITEM_SIZE: usize = mem::size_of::<ParameterItem>();

/// Parameters whose value depends on the device, resolved by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialParameter {
    ScreenWidth,
    ScreenHeight,
    ShortEdge,
    LongEdge,
}

impl SpecialParameter {
    pub const ALL: [SpecialParameter; 4] =
        [Self::ScreenWidth, Self::ScreenHeight, Self::ShortEdge, Self::LongEdge];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Variable name used in stylesheets
    pub fn name(self) -> &'static str {
        match self {
            Self::ScreenWidth => "hb-param-screen-width",
            Self::ScreenHeight => "hb-param-screen-height",
            Self::ShortEdge => "hb-param-screen-short-edge",
            Self::LongEdge => "hb-param-screen-long-edge",
        }
    }
}

/// Value of a global layout parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterValue {
    /// Parsed value stored in the segment
    Stored(Offset),
    Special(SpecialParameter),
}

impl ParameterValue {
    pub(super) fn decode(item: &ParameterItem) -> Option<Self> {
        if item.special != 0 {
            SpecialParameter::from_index(item.value).map(Self::Special)
        } else {
            Offset::from_raw(item.value).map(Self::Stored)
        }
    }
}

#[derive(Debug, Clone)]
struct WidgetEntry {
    name: String,
    css: Option<Offset>,
    color_css: Option<Offset>,
    layouts: BTreeMap<(u32, u32), (Offset, String, String)>,
}

/// Collects offsets per widget, then serializes the blob
#[derive(Debug, Clone, Default)]
pub struct OffsetMapBuilder {
    widgets: BTreeMap<u32, WidgetEntry>,
    parameters: BTreeMap<u32, (String, ParameterValue)>,
}

impl OffsetMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the stylesheet and colour stylesheet offsets of `widget`
    ///
    /// Calling again for the same widget fills in the offsets given this
    /// time; a different widget with the same hash is rejected.
    pub fn add_widget_offsets(
        &mut self,
        widget: &str,
        css: Option<Offset>,
        color_css: Option<Offset>,
    ) -> Result<(), OffsetMapError> {
        let entry = self.widgets.entry(hash32(widget)).or_insert_with(|| WidgetEntry {
            name: widget.to_string(),
            css: None,
            color_css: None,
            layouts: BTreeMap::new(),
        });
        if entry.name != widget {
            return Err(OffsetMapError::DuplicateWidget(widget.to_string()));
        }
        entry.css = css.or(entry.css);
        entry.color_css = color_css.or(entry.color_css);
        Ok(())
    }

    pub fn add_layout_offsets(
        &mut self,
        widget: &str,
        layout: &str,
        section: &str,
        offset: Offset,
    ) -> Result<(), OffsetMapError> {
        let entry = match self.widgets.get_mut(&hash32(widget)) {
            Some(entry) if entry.name == widget => entry,
            _ => return Err(OffsetMapError::UnknownWidget(widget.to_string())),
        };
        let key = (hash32(layout), hash32(section));
        if entry.layouts.contains_key(&key) {
            return Err(OffsetMapError::DuplicateLayout {
                widget: widget.to_string(),
                layout: layout.to_string(),
                section: section.to_string(),
            });
        }
        entry.layouts.insert(key, (offset, layout.to_string(), section.to_string()));
        Ok(())
    }

    /// Replace the global layout parameters
    ///
    /// On a hash collision nothing is replaced.
    pub fn add_global_parameters<I, S>(&mut self, parameters: I) -> Result<(), OffsetMapError>
    where
        I: IntoIterator<Item = (S, ParameterValue)>,
        S: AsRef<str>,
    {
        let mut table = BTreeMap::new();
        for (name, value) in parameters {
            let name = name.as_ref();
            if table.insert(hash32(name), (name.to_string(), value)).is_some() {
                return Err(OffsetMapError::DuplicateParameter(name.to_string()));
            }
        }
        self.parameters = table;
        Ok(())
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.len()
    }

    pub fn build(&self) -> StaticOffsetMap {
        let count = self.widgets.len();
        let mut bytes = vec![0u8; count * STATIC_ITEM_SIZE];
        let mut holders = Vec::new();

        for (i, (hash, entry)) in self.widgets.iter().enumerate() {
            let at = i * STATIC_ITEM_SIZE;
            let layout_table = if entry.layouts.is_empty() {
                NIL
            } else {
                let table = bytes.len();
                push_u32(&mut bytes, entry.layouts.len() as u32);
                for ((layout_hash, section_hash), (offset, _, _)) in &entry.layouts {
                    push_u32(&mut bytes, *layout_hash);
                    push_u32(&mut bytes, *section_hash);
                    holders.push(bytes.len());
                    push_u32(&mut bytes, offset.raw());
                }
                table as u32
            };

            let item = [*hash, Offset::to_raw(entry.css), Offset::to_raw(entry.color_css), layout_table];
            for (field, value) in item.iter().enumerate() {
                put_u32(&mut bytes, at + field * 4, *value);
            }
            if entry.css.is_some() {
                holders.push(at + 4);
            }
            if entry.color_css.is_some() {
                holders.push(at + 8);
            }
        }

        let parameter_table = bytes.len();
        push_u32(&mut bytes, self.parameters.len() as u32);
        let mut name_at = self.parameters.len() * PARAMETER_ITEM_SIZE;
        for (hash, (name, value)) in &self.parameters {
            push_u32(&mut bytes, *hash);
            let (raw, special) = match value {
                ParameterValue::Stored(offset) => {
                    holders.push(bytes.len());
                    (offset.raw(), 0)
                }
                ParameterValue::Special(special) => (special.index(), 1),
            };
            push_u32(&mut bytes, raw);
            push_u32(&mut bytes, name_at as u32);
            push_u32(&mut bytes, special);
            name_at += name.len() + 1;
        }
        for (name, _) in self.parameters.values() {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }

        holders.sort_unstable();
        StaticOffsetMap {
            bytes,
            count,
            parameter_table,
            parameter_count: self.parameters.len(),
            holders,
        }
    }
}

fn push_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_ne_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Serialized map ready to be copied into the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticOffsetMap {
    bytes: Vec<u8>,
    count: usize,
    /// Position of the parameter count
    parameter_table: usize,
    parameter_count: usize,
    /// Positions of offset fields, relative to the blob start
    holders: Vec<usize>,
}

impl StaticOffsetMap {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of widgets
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.parameter_count == 0
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn parameter_table(&self) -> usize {
        self.parameter_table
    }

    pub fn holder_positions(&self) -> &[usize] {
        &self.holders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(map: &StaticOffsetMap, at: usize) -> u32 {
        let b = &map.bytes()[at..at + 4];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn test_items_sorted_by_hash() {
        let mut builder = OffsetMapBuilder::new();
        for (i, widget) in ["hbpushbutton", "hblabel", "hbslider", "hbprogressbar"].iter().enumerate() {
            builder.add_widget_offsets(widget, Some(Offset::new(64 * (i + 1))), None).expect("add");
        }
        let map = builder.build();
        assert_eq!(map.len(), 4);
        // widgets, then an empty parameter section
        assert_eq!(map.bytes().len(), 4 * STATIC_ITEM_SIZE + 4);
        assert_eq!(map.parameter_table(), 4 * STATIC_ITEM_SIZE);
        assert_eq!(field(&map, map.parameter_table()), 0);

        let hashes: Vec<u32> = (0..4).map(|i| field(&map, i * STATIC_ITEM_SIZE)).collect();
        let mut sorted = hashes.clone();
        sorted.sort_unstable();
        assert_eq!(hashes, sorted);
        // css present, color absent, no layouts
        assert_eq!(map.holder_positions().len(), 4);
        assert_eq!(field(&map, 8), NIL);
        assert_eq!(field(&map, 12), NIL);
    }

    #[test]
    fn test_css_and_color_merge() {
        let mut builder = OffsetMapBuilder::new();
        builder.add_widget_offsets("hblabel", Some(Offset::new(80)), None).expect("css");
        builder.add_widget_offsets("hblabel", None, Some(Offset::new(160))).expect("color");
        let map = builder.build();
        assert_eq!(map.len(), 1);
        assert_eq!(field(&map, 4), 80);
        assert_eq!(field(&map, 8), 160);
        assert_eq!(map.holder_positions(), &[4, 8]);
    }

    #[test]
    fn test_layout_table() {
        let mut builder = OffsetMapBuilder::new();
        builder.add_widget_offsets("hblistitem", Some(Offset::new(8)), None).expect("widget");
        builder
            .add_layout_offsets("hblistitem", "default", "portrait", Offset::new(400))
            .expect("layout");
        builder
            .add_layout_offsets("hblistitem", "default", "landscape", Offset::new(480))
            .expect("layout");

        assert!(matches!(
            builder.add_layout_offsets("hblistitem", "default", "portrait", Offset::new(1)),
            Err(OffsetMapError::DuplicateLayout { .. })
        ));
        assert!(matches!(
            builder.add_layout_offsets("hbmissing", "default", "portrait", Offset::new(1)),
            Err(OffsetMapError::UnknownWidget(_))
        ));

        let map = builder.build();
        let table = field(&map, 12) as usize;
        assert_eq!(table, STATIC_ITEM_SIZE);
        assert_eq!(field(&map, table), 2);
        assert_eq!(map.bytes().len(), STATIC_ITEM_SIZE + 4 + 2 * LAYOUT_ITEM_SIZE + 4);
        assert_eq!(map.holder_positions().len(), 3);

        let first = (field(&map, table + 4), field(&map, table + 8));
        let second = (field(&map, table + 16), field(&map, table + 20));
        assert!(first < second);
    }

    #[test]
    fn test_global_parameters() {
        let mut builder = OffsetMapBuilder::new();
        builder.add_widget_offsets("hblabel", Some(Offset::new(80)), None).expect("widget");
        builder
            .add_global_parameters([
                ("hb-param-margin-gene-left", ParameterValue::Stored(Offset::new(200))),
                ("hb-param-screen-width", ParameterValue::Special(SpecialParameter::ScreenWidth)),
                ("hb-param-text-height-primary", ParameterValue::Stored(Offset::new(240))),
            ])
            .expect("parameters");
        let map = builder.build();
        assert_eq!(map.len(), 1);
        assert_eq!(map.parameter_count(), 3);

        let table = map.parameter_table();
        assert_eq!(table, STATIC_ITEM_SIZE);
        assert_eq!(field(&map, table), 3);
        let items = table + 4;
        let hashes: Vec<u32> = (0..3).map(|i| field(&map, items + i * PARAMETER_ITEM_SIZE)).collect();
        let mut sorted = hashes.clone();
        sorted.sort_unstable();
        assert_eq!(hashes, sorted);

        // stored values are offset holders, the special one is an index
        let mut stored = 0;
        for i in 0..3 {
            let at = items + i * PARAMETER_ITEM_SIZE;
            let name_at = items + field(&map, at + 8) as usize;
            let name_end = name_at + map.bytes()[name_at..].iter().position(|b| *b == 0).expect("nul");
            let name = std::str::from_utf8(&map.bytes()[name_at..name_end]).expect("utf8");
            assert_eq!(hash32(name), field(&map, at));
            if field(&map, at + 12) == 0 {
                stored += 1;
                assert!(map.holder_positions().contains(&(at + 4)));
            } else {
                assert_eq!(name, "hb-param-screen-width");
                assert_eq!(field(&map, at + 4), SpecialParameter::ScreenWidth.index());
                assert!(!map.holder_positions().contains(&(at + 4)));
            }
        }
        assert_eq!(stored, 2);
        assert_eq!(map.holder_positions().len(), 3);
    }

    #[test]
    fn test_duplicate_parameter_keeps_previous_set() {
        let mut builder = OffsetMapBuilder::new();
        builder
            .add_global_parameters([("hb-param-graphic-size-primary-small", ParameterValue::Stored(Offset::new(64)))])
            .expect("first set");
        assert!(matches!(
            builder.add_global_parameters([
                ("hb-param-margin-view-top", ParameterValue::Stored(Offset::new(96))),
                ("hb-param-margin-view-top", ParameterValue::Stored(Offset::new(128))),
            ]),
            Err(OffsetMapError::DuplicateParameter(name)) if name == "hb-param-margin-view-top"
        ));

        let map = builder.build();
        assert_eq!(map.parameter_count(), 1);
        assert!(!map.is_empty());
        assert_eq!(field(&map, map.parameter_table() + 4 + 4), 64);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash32("hbpushbutton"), hash32("hbpushbutton"));
        assert_ne!(hash32("hbpushbutton"), hash32("hbpushbutton_color"));
    }
}
