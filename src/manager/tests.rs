//! Manager tests - dispatch, realloc across allocators, roles, registry

use super::*;
use crate::allocator::{SlotMeta, SMALL_OBJECT_THRESHOLD};
use crate::segment::Segment;
use proptest::prelude::*;

const TEST_SEGMENT: usize = 2 * 1024 * 1024;

fn server() -> SharedMemoryManager {
    let segment = Segment::anonymous(TEST_SEGMENT).expect("segment");
    SharedMemoryManager::with_segment(segment, None).expect("manager")
}

fn fill(manager: &mut dyn MemoryManager, at: Offset, len: usize, seed: u8) {
    let bytes = manager.bytes_mut(at, len).expect("in range");
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
}

fn check(manager: &dyn MemoryManager, at: Offset, len: usize, seed: u8) -> bool {
    let bytes = manager.bytes(at, len).expect("in range");
    bytes.iter().enumerate().all(|(i, b)| *b == seed.wrapping_add(i as u8))
}

#[cfg(test)]
mod heap_tests {
    use super::*;

    #[test]
    fn test_offsets_are_addresses() {
        let mut heap = HeapMemoryManager::new();
        assert!(heap.base().is_null());
        let at = heap.alloc(100).expect("alloc");
        assert!(!at.is_null());
        assert_eq!(at.get() % 8, 0);
        assert_eq!(heap.allocated_size(at), 100);
        assert!(heap.bytes(at, 100).expect("bytes").iter().all(|b| *b == 0));
        assert!(heap.bytes(at.add(90), 20).is_none());
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        let mut heap = HeapMemoryManager::new();
        let at = heap.alloc(64).expect("alloc");
        fill(&mut heap, at, 64, 3);

        let grown = heap.realloc(at, 256).expect("grow");
        assert!(check(&heap, grown, 64, 3));
        let shrunk = heap.realloc(grown, 16).expect("shrink");
        assert!(check(&heap, shrunk, 16, 3));
        assert_eq!(heap.live_blocks(), 1);
    }

    #[test]
    fn test_misuse() {
        let mut heap = HeapMemoryManager::new();
        assert_eq!(heap.alloc(0), Err(AllocError::InvalidSize(0)));
        heap.free(Offset::NULL);
        heap.free(Offset::new(0x1000));
        assert_eq!(heap.live_blocks(), 0);
        let fresh = heap.realloc(Offset::NULL, 8).expect("alloc via realloc");
        assert_eq!(heap.allocated_size(fresh), 8);
    }
}

#[cfg(test)]
mod shared_tests {
    use super::*;

    #[test]
    fn test_cold_start_writes_header_last() {
        let manager = server();
        let header = manager.header();
        assert_eq!(header.magic, crate::segment::SEGMENT_MAGIC);
        assert_eq!(header.main_allocator as usize, crate::segment::HEADER_SIZE);
        assert_ne!(header.bucket_allocator, 0);
        assert_eq!(manager.cache_root(), None);
        assert!(manager.has_allocators());
        assert!(manager.is_writable());
    }

    #[test]
    fn test_dispatch_by_size() {
        let mut manager = server();
        let small = manager.alloc(SMALL_OBJECT_THRESHOLD).expect("small");
        let large = manager.alloc(SMALL_OBJECT_THRESHOLD + 1).expect("large");

        assert!(matches!(SlotMeta::read(manager.segment(), small), Some(SlotMeta::Owner(_))));
        assert!(matches!(SlotMeta::read(manager.segment(), large), Some(SlotMeta::Main { .. })));
        assert_eq!(manager.allocated_size(small), 224);
        assert_eq!(manager.allocated_size(large), 232);

        let used = manager.allocated_bytes();
        manager.free(large);
        assert!(manager.allocated_bytes() < used);
        manager.free(small);
    }

    #[test]
    fn test_misuse_is_rejected() {
        let mut manager = server();
        assert_eq!(manager.alloc(0), Err(AllocError::InvalidSize(0)));
        assert!(matches!(
            manager.alloc(TEST_SEGMENT),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert_eq!(manager.oom_count(), 1);

        let free = manager.free_bytes();
        manager.free(Offset::NULL);
        manager.free(Offset::new(3));
        assert_eq!(manager.free_bytes(), free);
    }

    #[test]
    fn test_free_outside_segment_is_ignored() {
        let mut manager = server();
        manager.enable_cell_tracking();
        let at = manager.alloc(600).expect("alloc");
        let free = manager.free_bytes();

        manager.free(Offset::new(TEST_SEGMENT * 4));
        manager.free(Offset::new(TEST_SEGMENT + 8));
        assert_eq!(manager.free_bytes(), free);
        assert_eq!(manager.allocated_size(at), 600);
    }

    #[test]
    fn test_realloc_crosses_allocators() {
        let mut manager = server();
        let small = manager.alloc(40).expect("small");
        fill(&mut manager, small, 48, 11);

        let large = manager.realloc(small, 1000).expect("to main");
        assert!(matches!(SlotMeta::read(manager.segment(), large), Some(SlotMeta::Main { .. })));
        assert!(check(&manager, large, 48, 11));
        assert_eq!(
            SlotMeta::read(manager.segment(), small),
            Some(SlotMeta::NextFree(None))
        );

        fill(&mut manager, large, 1000, 7);
        let back = manager.realloc(large, 100).expect("to bucket");
        assert!(matches!(SlotMeta::read(manager.segment(), back), Some(SlotMeta::Owner(_))));
        assert!(check(&manager, back, 120, 7));
    }

    #[test]
    fn test_client_view_is_read_only() {
        let segment = Segment::anonymous(TEST_SEGMENT).expect("segment");
        let view = segment.read_only_view();
        let mut server = SharedMemoryManager::with_segment(segment, None).expect("server");
        let at = server.alloc(500).expect("alloc");
        fill(&mut server, at, 500, 42);

        let mut client = SharedMemoryManager::with_segment(view, None).expect("client");
        assert!(!client.is_writable());
        assert_eq!(client.alloc(8), Err(AllocError::ReadOnly));
        assert_eq!(client.realloc(at, 8), Err(AllocError::ReadOnly));
        assert!(client.bytes_mut(at, 8).is_none());

        client.free(at);
        assert!(check(&client, at, 500, 42));
        assert_eq!(client.allocated_size(at), server.allocated_size(at));
        assert_eq!(client.free_bytes(), server.free_bytes());
        assert_eq!(client.base(), server.base());
    }

    #[test]
    fn test_cell_tracking_follows_blocks() {
        let mut manager = server();
        manager.enable_cell_tracking();

        let a = manager.alloc(10).expect("a");
        let b = manager.alloc(300).expect("b");
        {
            let registry = manager.offset_registry().expect("tracking");
            assert_eq!(registry.cells().get(&a), Some(&16));
            assert_eq!(registry.cells().get(&b), Some(&304));
            assert_eq!(registry.total_allocated(), 320);
        }

        // a holder inside b pointing at a
        manager.segment_mut().write_u32(b.add(8), a.raw());
        manager.register_offset_holder(b.add(8));

        let a2 = manager.realloc(a, 20).expect("move a");
        assert_eq!(manager.segment().read_u32(b.add(8)), a2.raw());

        let b2 = manager.realloc(b, 600).expect("move b");
        let registry = manager.offset_registry().expect("tracking");
        assert!(registry.is_registered(b2.add(8)));
        assert!(!registry.is_registered(b.add(8)));
        assert_eq!(manager.segment().read_u32(b2.add(8)), a2.raw());

        manager.free(b2);
        let registry = manager.offset_registry().expect("tracking");
        assert!(registry.holders().is_empty());
        assert_eq!(registry.cells().len(), 1);
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::config::ShmConfig;

    #[test]
    fn test_heap_instance_is_lazy() {
        let mut registry = ManagerRegistry::with_role(ShmConfig::default(), Role::Client);
        assert!(!registry.is_live(MemoryKind::Heap));

        let heap = registry.instance(MemoryKind::Heap).expect("heap");
        let at = heap.alloc(32).expect("alloc");
        assert!(heap.is_writable());
        assert_eq!(heap.allocated_size(at), 32);
        assert!(registry.is_live(MemoryKind::Heap));

        registry.release_instance(MemoryKind::Heap);
        assert!(!registry.is_live(MemoryKind::Heap));
        registry.release_instance(MemoryKind::Heap);
    }

    #[cfg(unix)]
    #[test]
    fn test_client_without_server_fails_cleanly() {
        let mut config = ShmConfig::default();
        config.segment.name = format!("/theme-shm-test-noserver-{}", std::process::id());
        let mut registry = ManagerRegistry::with_role(config, Role::Client);

        assert!(matches!(
            registry.instance(MemoryKind::Shared),
            Err(ShmError::Segment(_))
        ));
        assert!(!registry.is_live(MemoryKind::Shared));
        assert_eq!(registry.role(), Role::Client);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_realloc_keeps_common_prefix(old in 1usize..1500, new in 1usize..1500, seed: u8) {
        let mut manager = server();
        let at = manager.alloc(old).expect("alloc");
        let old_capacity = manager.allocated_size(at);
        fill(&mut manager, at, old_capacity, seed);

        let moved = manager.realloc(at, new).expect("realloc");
        let kept = old_capacity.min(manager.allocated_size(moved));
        prop_assert!(manager.allocated_size(moved) >= new);
        prop_assert!(check(&manager, moved, kept, seed));
    }
}
