//! Memory managers - one allocation contract over two backends
//!
//! Design: consumers see `alloc/realloc/free` returning opaque `Offset`s.
//! 1. `HeapMemoryManager` - process heap, offsets are addresses (base 0)
//! 2. `SharedMemoryManager` - the shared segment, main + bucket allocators
//!
//! `ManagerRegistry` owns at most one manager of each kind. It is created
//! explicitly at start-up and passed to whoever needs it; the process role
//! (and with it writability) is resolved once when the registry is built.

mod heap;
mod shared;

#[cfg(test)]
mod tests;

pub use heap::HeapMemoryManager;
pub use shared::SharedMemoryManager;

use crate::config::{Role, ShmConfig};
use crate::error::{AllocError, ShmError};
use crate::logging::{debug, info};
use crate::segment::Offset;

/// Uniform allocation contract
pub trait MemoryManager: Send {
    /// Allocate `size` bytes; `size` must be positive
    fn alloc(&mut self, size: usize) -> Result<Offset, AllocError>;

    /// Move to a block of `new_size` bytes, keeping the leading contents
    fn realloc(&mut self, offset: Offset, new_size: usize) -> Result<Offset, AllocError>;

    /// Release a block; null offsets are ignored
    fn free(&mut self, offset: Offset);

    /// True capacity of a live block, 0 if unknown
    fn allocated_size(&self, offset: Offset) -> usize;

    /// Process-local base that offsets are relative to
    fn base(&self) -> *const u8;

    fn is_writable(&self) -> bool;

    fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]>;

    fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]>;
}

/// Which backend a caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Heap,
    Shared,
}

/// Lazily constructed managers, one per kind
#[derive(Debug)]
pub struct ManagerRegistry {
    config: ShmConfig,
    role: Role,
    heap: Option<HeapMemoryManager>,
    shared: Option<SharedMemoryManager>,
}

impl ManagerRegistry {
    /// Resolve the role from `config` and keep it for the registry's lifetime
    pub fn new(config: ShmConfig) -> Self {
        let role = config.role();
        Self::with_role(config, role)
    }

    pub fn with_role(config: ShmConfig, role: Role) -> Self {
        debug!(role = ?role, segment = %config.segment.name, "memory manager registry created");
        Self {
            config,
            role,
            heap: None,
            shared: None,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    /// The manager of `kind`, constructing it on first use
    ///
    /// A failed shared-segment initialization leaves nothing behind; the
    /// next call tries again.
    pub fn instance(&mut self, kind: MemoryKind) -> Result<&mut dyn MemoryManager, ShmError> {
        match kind {
            MemoryKind::Heap => Ok(self.heap.get_or_insert_with(HeapMemoryManager::new)),
            MemoryKind::Shared => Ok(self.shared()?),
        }
    }

    /// The shared manager with its segment-specific API
    pub fn shared(&mut self) -> Result<&mut SharedMemoryManager, ShmError> {
        let manager = match self.shared.take() {
            Some(manager) => manager,
            None => {
                let manager = construct_shared(&self.config, self.role)?;
                info!(
                    segment = %self.config.segment.name,
                    writable = manager.is_writable(),
                    "shared memory manager ready"
                );
                manager
            }
        };
        Ok(self.shared.insert(manager))
    }

    pub fn is_live(&self, kind: MemoryKind) -> bool {
        match kind {
            MemoryKind::Heap => self.heap.is_some(),
            MemoryKind::Shared => self.shared.is_some(),
        }
    }

    /// Tear down the manager of `kind`; the next `instance` rebuilds it
    pub fn release_instance(&mut self, kind: MemoryKind) {
        let released = match kind {
            MemoryKind::Heap => self.heap.take().is_some(),
            MemoryKind::Shared => self.shared.take().is_some(),
        };
        if released {
            debug!(kind = ?kind, "memory manager released");
        }
    }
}

#[cfg(unix)]
fn construct_shared(config: &ShmConfig, role: Role) -> Result<SharedMemoryManager, ShmError> {
    SharedMemoryManager::initialize(config, role)
}

/// No platform segment: fall back to a process-private one
#[cfg(not(unix))]
fn construct_shared(config: &ShmConfig, role: Role) -> Result<SharedMemoryManager, ShmError> {
    let segment = crate::segment::Segment::anonymous(config.segment.size)?;
    let segment = if role.is_writable() { segment } else { segment.read_only_view() };
    SharedMemoryManager::with_segment(segment, config.segment.image.as_deref())
}
