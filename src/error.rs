//! Error types for the shared memory subsystem
//!
//! Every failure is synchronous and surfaces as a `Result`. Allocation
//! failures are never retried here; callers decide whether to degrade
//! (skip caching, recompute) or treat them as fatal.

use std::fmt;
use std::io;

/// Allocation failures from either allocator or the manager facade
///
/// Misuse (read-only manager, zero size) travels the same channel as
/// out-of-memory so callers handle all of them identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Manager is attached read-only
    ReadOnly,
    /// Requested size is not allocatable
    InvalidSize(usize),
    /// No free block large enough
    OutOfMemory { requested: usize },
    /// Allocator metadata was overwritten by a compaction pass
    Detached,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "memory manager is read-only"),
            Self::InvalidSize(size) => write!(f, "invalid allocation size: {}", size),
            Self::OutOfMemory { requested } => {
                write!(f, "out of shared memory allocating {} bytes", requested)
            }
            Self::Detached => write!(f, "allocators detached after compaction"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Segment create/attach failures
#[derive(Debug)]
pub enum SegmentError {
    InvalidName(String),
    InvalidSize(usize),
    /// A segment with this name already exists (e.g. left by a crashed server)
    AlreadyExists(String),
    Create { name: String, source: io::Error },
    Attach { name: String, source: io::Error },
    Map { name: String, source: io::Error },
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid segment name: {:?}", name),
            Self::InvalidSize(size) => write!(f, "invalid segment size: {}", size),
            Self::AlreadyExists(name) => write!(f, "segment {} already exists", name),
            Self::Create { name, source } => {
                write!(f, "failed to create segment {}: {}", name, source)
            }
            Self::Attach { name, source } => {
                write!(f, "failed to attach segment {}: {}", name, source)
            }
            Self::Map { name, source } => write!(f, "failed to map segment {}: {}", name, source),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create { source, .. } | Self::Attach { source, .. } | Self::Map { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, source: io::Error },
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read config {}: {}", path, source),
            Self::Parse(msg) => write!(f, "failed to parse config: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Cross-process cache lock errors
#[derive(Debug)]
pub enum LockError {
    InvalidName(String),
    Create { name: String, source: io::Error },
    Open { name: String, source: io::Error },
    Unsupported,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid semaphore name: {:?}", name),
            Self::Create { name, source } => {
                write!(f, "failed to create semaphore {}: {}", name, source)
            }
            Self::Open { name, source } => write!(f, "failed to open semaphore {}: {}", name, source),
            Self::Unsupported => write!(f, "named semaphores are not supported on this platform"),
        }
    }
}

impl std::error::Error for LockError {}

/// Compaction image errors
#[derive(Debug)]
pub enum ImageError {
    Io(io::Error),
    /// Image header is missing or carries the wrong identifier
    BadMagic,
    /// Image does not fit the target segment
    TooLarge { image: usize, segment: usize },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "image I/O error: {}", e),
            Self::BadMagic => write!(f, "not a compacted segment image"),
            Self::TooLarge { image, segment } => {
                write!(f, "image of {} bytes does not fit segment of {} bytes", image, segment)
            }
        }
    }
}

impl std::error::Error for ImageError {}

impl From<io::Error> for ImageError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Defragmenter misuse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragError {
    /// Cell tracking was never enabled on the manager
    TrackingDisabled,
    ReadOnly,
    /// A tracked cell no longer lies inside the segment
    OutOfRange { offset: usize },
}

impl fmt::Display for DefragError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrackingDisabled => write!(f, "cell tracking is not enabled"),
            Self::ReadOnly => write!(f, "cannot compact a read-only segment"),
            Self::OutOfRange { offset } => write!(f, "tracked cell at {:#x} is out of range", offset),
        }
    }
}

impl std::error::Error for DefragError {}

/// Static offset table construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetMapError {
    /// Two widgets hash to the same 32-bit value
    DuplicateWidget(String),
    /// Two (layout, section) pairs of one widget hash to the same key
    DuplicateLayout { widget: String, layout: String, section: String },
    /// Layout offsets added for a widget without stylesheet offsets
    UnknownWidget(String),
    /// Two global parameters hash to the same value
    DuplicateParameter(String),
}

impl fmt::Display for OffsetMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateWidget(name) => write!(f, "duplicate widget hash for {}", name),
            Self::DuplicateLayout { widget, layout, section } => write!(
                f,
                "duplicate layout hash for {} (layout {:?}, section {:?})",
                widget, layout, section
            ),
            Self::UnknownWidget(name) => write!(f, "no stylesheet offsets for widget {}", name),
            Self::DuplicateParameter(name) => write!(f, "duplicate parameter hash for {}", name),
        }
    }
}

impl std::error::Error for OffsetMapError {}

/// Top-level error for manager construction and tooling
#[derive(Debug)]
pub enum ShmError {
    Segment(SegmentError),
    Alloc(AllocError),
    Config(ConfigError),
    Lock(LockError),
    Image(ImageError),
    Defrag(DefragError),
    OffsetMap(OffsetMapError),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment(e) => write!(f, "{}", e),
            Self::Alloc(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::Lock(e) => write!(f, "{}", e),
            Self::Image(e) => write!(f, "{}", e),
            Self::Defrag(e) => write!(f, "{}", e),
            Self::OffsetMap(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Segment(e) => Some(e),
            Self::Alloc(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Lock(e) => Some(e),
            Self::Image(e) => Some(e),
            Self::Defrag(e) => Some(e),
            Self::OffsetMap(e) => Some(e),
        }
    }
}

impl From<SegmentError> for ShmError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

impl From<AllocError> for ShmError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

impl From<ConfigError> for ShmError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<LockError> for ShmError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

impl From<ImageError> for ShmError {
    fn from(e: ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<DefragError> for ShmError {
    fn from(e: DefragError) -> Self {
        Self::Defrag(e)
    }
}

impl From<OffsetMapError> for ShmError {
    fn from(e: OffsetMapError) -> Self {
        Self::OffsetMap(e)
    }
}
