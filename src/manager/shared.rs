//! Shared memory manager - segment owner and allocator dispatch
//!
//! Design: requests up to `SMALL_OBJECT_THRESHOLD` bytes go to the bucket
//! allocator, larger ones to the main allocator. `free` and `realloc` never
//! guess the owner from a size: they read the metadata word in front of the
//! block.

use super::MemoryManager;
use crate::allocator::{
    BucketAllocator, BucketClassStats, MainAllocator, MainStats, SlotMeta, BUCKET_METADATA_RESERVE,
    SMALL_OBJECT_THRESHOLD,
};
use crate::config::{Role, ShmConfig};
use crate::defrag::OffsetRegistry;
use crate::error::{AllocError, ImageError, SegmentError, ShmError};
use crate::logging::{
    debug, info, log_allocation, log_deallocation, log_segment_attached, log_segment_created,
    log_segment_recovered, warn,
};
use crate::segment::{
    align_up, Offset, Segment, SegmentHeader, CACHE_ROOT_FIELD, HEADER_SIZE, IMAGE_MAGIC,
    SEGMENT_MAGIC,
};
use std::fs;
use std::path::Path;

/// Segment plus the allocators living in it
pub struct SharedMemoryManager {
    name: String,
    segment: Segment,
    main: Option<MainAllocator>,
    bucket: Option<BucketAllocator>,
    /// `[HEADER_SIZE, image_end)` holds preloaded, immutable data
    image_end: usize,
    tracking: Option<OffsetRegistry>,
    oom_count: u64,
}

impl SharedMemoryManager {
    /// Create (server) or attach to (client) the configured platform segment
    ///
    /// A server finding a segment left by a crashed predecessor attaches to
    /// it; the header magic then decides between reconnect and cold start.
    #[cfg(unix)]
    pub fn initialize(config: &ShmConfig, role: Role) -> Result<Self, ShmError> {
        let name = &config.segment.name;
        let segment = if role.is_writable() {
            match Segment::create_shared(name, config.segment.size) {
                Ok(segment) => {
                    log_segment_created(name, config.segment.size);
                    segment
                }
                Err(SegmentError::AlreadyExists(_)) => {
                    warn!(segment = %name, "segment already exists, attaching to it");
                    let segment = Segment::attach_shared(name, true)?;
                    log_segment_attached(name, true);
                    segment
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let segment = Segment::attach_shared(name, false)?;
            log_segment_attached(name, false);
            segment
        };
        Self::setup(name.clone(), segment, config.segment.image.as_deref())
    }

    /// Manage an already mapped segment; writability comes from the segment
    pub fn with_segment(segment: Segment, image: Option<&Path>) -> Result<Self, ShmError> {
        Self::setup("anonymous".to_string(), segment, image)
    }

    fn setup(name: String, mut segment: Segment, image: Option<&Path>) -> Result<Self, ShmError> {
        let header = segment.header();
        let main_at = Offset::new(header.main_allocator as usize);
        let bucket_at = Offset::new(header.bucket_allocator as usize);

        if !segment.is_writable() {
            // clients only inspect allocator state
            let (main, bucket, image_end) = if header.magic == SEGMENT_MAGIC {
                (
                    MainAllocator::attach(&segment, main_at),
                    BucketAllocator::attach(&segment, bucket_at),
                    main_at.get(),
                )
            } else {
                (None, None, 0)
            };
            return Ok(Self::assemble(name, segment, main, bucket, image_end));
        }

        if header.magic == SEGMENT_MAGIC {
            let mut main = MainAllocator::initialize(&mut segment, main_at)?;
            let bucket = BucketAllocator::initialize(&mut segment, bucket_at, &mut main)?;
            log_segment_recovered(&name);
            let image_end = main_at.get();
            return Ok(Self::assemble(name, segment, Some(main), Some(bucket), image_end));
        }

        if header.magic == IMAGE_MAGIC {
            warn!(segment = %name, "segment holds a compacted image, reinitializing");
        }
        let image_end = match image {
            Some(path) => load_image(&mut segment, path)?,
            None => {
                segment.write_header(SegmentHeader::default());
                HEADER_SIZE
            }
        };

        let main_at = Offset::new(align_up(image_end));
        let mut main = MainAllocator::format(&mut segment, main_at)?;
        let reserve = main.alloc(&mut segment, BUCKET_METADATA_RESERVE)?;
        let bucket = BucketAllocator::format(&mut segment, reserve, &mut main)?;

        let mut header = SegmentHeader {
            magic: 0,
            main_allocator: main_at.raw(),
            bucket_allocator: reserve.raw(),
            shared_cache: segment.header().shared_cache,
        };
        segment.write_header(header);
        header.magic = SEGMENT_MAGIC;
        segment.write_header(header);

        info!(
            segment = %name,
            size_bytes = segment.len(),
            image_bytes = image_end - HEADER_SIZE,
            "segment initialized"
        );
        Ok(Self::assemble(name, segment, Some(main), Some(bucket), main_at.get()))
    }

    fn assemble(
        name: String,
        segment: Segment,
        main: Option<MainAllocator>,
        bucket: Option<BucketAllocator>,
        image_end: usize,
    ) -> Self {
        Self {
            name,
            segment,
            main,
            bucket,
            image_end,
            tracking: None,
            oom_count: 0,
        }
    }

    // ========================================================================
    // Segment access
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Raw segment access; panics on writes when read-only
    #[inline]
    pub fn segment_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.segment.is_writable()
    }

    pub fn size(&self) -> usize {
        self.segment.len()
    }

    pub fn header(&self) -> SegmentHeader {
        self.segment.header()
    }

    /// Offset of the shared cache root, if one was published
    pub fn cache_root(&self) -> Option<Offset> {
        let raw = self.segment.read_u32(CACHE_ROOT_FIELD);
        (raw != 0).then(|| Offset::new(raw as usize))
    }

    pub fn set_cache_root(&mut self, root: Offset) -> Result<(), AllocError> {
        if !self.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        self.segment.write_u32(CACHE_ROOT_FIELD, root.raw());
        Ok(())
    }

    /// First offset after preloaded image data (`HEADER_SIZE` without image)
    pub fn image_end(&self) -> usize {
        self.image_end
    }

    #[inline]
    fn in_image(&self, offset: Offset) -> bool {
        offset.get() >= HEADER_SIZE && offset.get() < self.image_end
    }

    /// Whether both allocators are usable (false after compaction)
    pub fn has_allocators(&self) -> bool {
        self.main.is_some() && self.bucket.is_some()
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn free_bytes(&self) -> usize {
        self.main.map_or(0, |main| main.free_bytes(&self.segment))
    }

    pub fn allocated_bytes(&self) -> usize {
        self.main.map_or(0, |main| main.allocated_bytes(&self.segment))
    }

    pub fn main_stats(&self) -> Option<MainStats> {
        self.main.map(|main| main.stats(&self.segment))
    }

    pub fn bucket_stats(&self) -> Vec<BucketClassStats> {
        self.bucket
            .as_ref()
            .map(|bucket| bucket.stats(&self.segment))
            .unwrap_or_default()
    }

    /// Allocation requests that failed for lack of space
    pub fn oom_count(&self) -> u64 {
        self.oom_count
    }

    // ========================================================================
    // Offset tracking
    // ========================================================================

    /// Start reporting cells to an offset registry (idempotent)
    pub fn enable_cell_tracking(&mut self) {
        if self.tracking.is_none() {
            debug!(segment = %self.name, "cell tracking enabled");
            self.tracking = Some(OffsetRegistry::new());
        }
    }

    pub fn offset_registry(&self) -> Option<&OffsetRegistry> {
        self.tracking.as_ref()
    }

    pub fn offset_registry_mut(&mut self) -> Option<&mut OffsetRegistry> {
        self.tracking.as_mut()
    }

    /// Track the in-segment offset field at `at`; no-op without tracking
    #[inline]
    pub fn register_offset_holder(&self, at: Offset) {
        if let Some(registry) = &self.tracking {
            registry.register_offset_holder(at);
        }
    }

    #[inline]
    pub fn unregister_offset_holder(&self, at: Offset) {
        if let Some(registry) = &self.tracking {
            registry.unregister_offset_holder(at);
        }
    }

    pub(crate) fn take_offset_registry(&mut self) -> Option<OffsetRegistry> {
        self.tracking.take()
    }

    pub(crate) fn restore_offset_registry(&mut self, registry: OffsetRegistry) {
        self.tracking = Some(registry);
    }

    /// Forget the allocators after their metadata was overwritten
    pub(crate) fn detach_allocators(&mut self) {
        self.main = None;
        self.bucket = None;
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Dump `[0, end)` of a compacted segment to `path`
    pub fn write_image(&self, path: &Path, end: usize) -> Result<(), ImageError> {
        if self.segment.header().magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let bytes = self
            .segment
            .bytes(Offset::NULL, end)
            .ok_or(ImageError::TooLarge { image: end, segment: self.segment.len() })?;
        fs::write(path, bytes)?;
        info!(path = %path.display(), bytes = end, "segment image written");
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut Segment, &mut MainAllocator, &mut BucketAllocator), AllocError> {
        match (&mut self.main, &mut self.bucket) {
            (Some(main), Some(bucket)) => Ok((&mut self.segment, main, bucket)),
            _ => Err(AllocError::Detached),
        }
    }
}

impl MemoryManager for SharedMemoryManager {
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError> {
        if !self.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        if size == 0 {
            return Err(AllocError::InvalidSize(size));
        }

        let (segment, main, bucket) = self.parts()?;
        let result = if size <= SMALL_OBJECT_THRESHOLD {
            bucket.alloc(segment, main, size)
        } else {
            main.alloc(segment, size)
        };

        match result {
            Ok(offset) => {
                log_allocation("shared", offset, size);
                if let Some(registry) = &mut self.tracking {
                    registry.cell_allocated(offset, size);
                }
                Ok(offset)
            }
            Err(e) => {
                if matches!(e, AllocError::OutOfMemory { .. }) {
                    self.oom_count += 1;
                }
                Err(e)
            }
        }
    }

    fn realloc(&mut self, offset: Offset, new_size: usize) -> Result<Offset, AllocError> {
        if !self.is_writable() {
            return Err(AllocError::ReadOnly);
        }
        if offset.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            return Err(AllocError::InvalidSize(new_size));
        }

        let old_capacity = self.allocated_size(offset);
        let new = self.alloc(new_size)?;
        let len = old_capacity.min(self.allocated_size(new));
        self.segment.copy_within(offset, new, len);

        if let Some(registry) = &mut self.tracking {
            registry.cell_moved(&mut self.segment, offset, new);
        }
        self.free(offset);
        Ok(new)
    }

    fn free(&mut self, offset: Offset) {
        if offset.is_null() || !self.is_writable() || self.in_image(offset) {
            return;
        }
        if !self.segment.contains(offset, 0) {
            warn!(offset = %offset, size = self.segment.len(), "free outside the segment ignored");
            return;
        }
        if let Some(registry) = &mut self.tracking {
            registry.cell_freed(offset);
        }

        let meta = SlotMeta::read(&self.segment, offset);
        let Ok((segment, main, bucket)) = self.parts() else {
            warn!(offset = %offset, "free after compaction ignored");
            return;
        };
        match meta {
            Some(SlotMeta::Owner(_)) | Some(SlotMeta::NextFree(_)) => {
                bucket.free(segment, main, offset)
            }
            Some(SlotMeta::Main { .. }) | Some(SlotMeta::MainFree) => main.free(segment, offset),
            None => {
                warn!(offset = %offset, "free of offset without block metadata ignored");
                return;
            }
        }
        log_deallocation("shared", offset);
    }

    fn allocated_size(&self, offset: Offset) -> usize {
        if offset.is_null() || !self.segment.contains(offset, 0) {
            return 0;
        }
        if self.in_image(offset) {
            return self.image_end - offset.get();
        }
        match SlotMeta::read(&self.segment, offset) {
            Some(SlotMeta::Owner(_)) => self
                .bucket
                .as_ref()
                .map_or(0, |bucket| bucket.allocated_size(&self.segment, offset)),
            Some(SlotMeta::Main { capacity }) => capacity as usize,
            _ => 0,
        }
    }

    fn base(&self) -> *const u8 {
        self.segment.base()
    }

    fn is_writable(&self) -> bool {
        self.segment.is_writable()
    }

    fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
        self.segment.bytes(offset, len)
    }

    fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]> {
        self.segment.bytes_mut(offset, len)
    }
}

impl core::fmt::Debug for SharedMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemoryManager")
            .field("name", &self.name)
            .field("segment", &self.segment)
            .field("image_end", &self.image_end)
            .field("allocators", &self.has_allocators())
            .field("tracking", &self.tracking.is_some())
            .finish()
    }
}

/// Copy a compacted image into a fresh segment; returns the image length
fn load_image(segment: &mut Segment, path: &Path) -> Result<usize, ImageError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(ImageError::BadMagic);
    }
    let field = |at: usize| u32::from_ne_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    if field(0) != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }

    // room must remain for allocator metadata and at least one list per class
    let needed = align_up(data.len()) + 64 * 1024;
    if needed > segment.len() {
        return Err(ImageError::TooLarge { image: data.len(), segment: segment.len() });
    }

    let body = &data[HEADER_SIZE..];
    if let Some(target) = segment.bytes_mut(Offset::new(HEADER_SIZE), body.len()) {
        target.copy_from_slice(body);
    }
    segment.write_header(SegmentHeader {
        shared_cache: field(12),
        ..SegmentHeader::default()
    });

    info!(path = %path.display(), bytes = data.len(), "segment image preloaded");
    Ok(data.len())
}
