//! Shared-memory resource cache for theme servers
//!
//! One writer process (the server) owns a fixed-size segment and caches
//! parsed theme resources in it; any number of read-only clients map the
//! same segment and look resources up by name. Everything inside the
//! segment is addressed by `Offset`, never by pointer.

// Core modules
pub mod allocator;
pub mod cache;
pub mod config;
pub mod defrag;
pub mod error;
pub mod logging;
pub mod manager;
pub mod report;
pub mod segment;

// Re-export commonly used items
pub use allocator::{BucketAllocator, MainAllocator, SlotMeta, SMALL_OBJECT_THRESHOLD};
pub use cache::{ItemKind, OffsetMapBuilder, ParameterValue, SharedCache, SpecialParameter, StaticOffsetMap};
pub use config::{Role, ShmConfig};
pub use defrag::{defragment_chunk, HandleId, OffsetRegistry};
pub use error::{AllocError, DefragError, ImageError, LockError, SegmentError, ShmError};
pub use manager::{HeapMemoryManager, ManagerRegistry, MemoryKind, MemoryManager, SharedMemoryManager};
pub use report::MemoryReport;
pub use segment::{Offset, Segment, DEFAULT_SEGMENT_SIZE};
