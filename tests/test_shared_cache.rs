use theme_shm::allocator::{SlotMeta, CLASS_SIZES};
use theme_shm::cache::{LocalLock, OffsetMapBuilder};
use theme_shm::{
    defragment_chunk, ItemKind, MemoryManager, MemoryReport, Offset, Segment, SharedCache, SharedMemoryManager,
};

const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

fn server() -> SharedMemoryManager {
    let segment = Segment::anonymous(SEGMENT_SIZE).expect("segment");
    SharedMemoryManager::with_segment(segment, None).expect("manager")
}

fn store(manager: &mut SharedMemoryManager, data: &[u8]) -> Offset {
    let at = manager.alloc(data.len()).expect("alloc");
    manager.bytes_mut(at, data.len()).expect("writable").copy_from_slice(data);
    at
}

#[test]
fn test_thousand_small_objects() {
    let mut manager = server();
    let objects: Vec<Offset> = (0..1000u32)
        .map(|i| {
            let mut data = [0u8; 12];
            data[..4].copy_from_slice(&i.to_le_bytes());
            data[4..8].copy_from_slice(&(i * 7).to_le_bytes());
            store(&mut manager, &data)
        })
        .collect();

    let class16 = manager
        .bucket_stats()
        .into_iter()
        .find(|c| c.class_size == 16)
        .expect("class 16");
    assert_eq!(class16.lists, 2);
    assert_eq!(class16.live_slots, 1000);

    for at in &objects[..500] {
        manager.free(*at);
    }
    for (i, at) in objects.iter().enumerate().skip(500) {
        let bytes = manager.bytes(*at, 12).expect("in range");
        assert_eq!(&bytes[..4], &(i as u32).to_le_bytes());
        assert_eq!(&bytes[4..8], &(i as u32 * 7).to_le_bytes());
        assert!(matches!(SlotMeta::read(manager.segment(), *at), Some(SlotMeta::Owner(_))));
    }
}

#[test]
fn test_every_small_size_gets_its_class() {
    let mut manager = server();
    for size in 1..=224usize {
        let at = manager.alloc(size).expect("alloc");
        let class = CLASS_SIZES.iter().copied().find(|c| *c >= size).expect("class");
        assert_eq!(manager.allocated_size(at), class, "size {}", size);
        manager.free(at);
    }
}

#[test]
fn test_theme_change_cycle() {
    let mut manager = server();
    manager.enable_cell_tracking();

    let button = store(&mut manager, b"HbPushButton { min-height: 7un; }");
    let button_color = store(&mut manager, b"HbPushButton { color: var(qtc_button_normal); }");
    let mut builder = OffsetMapBuilder::new();
    builder
        .add_widget_offsets("hbpushbutton", Some(button), Some(button_color))
        .expect("widget");
    let lock = LocalLock::new();
    let cache = SharedCache::init_server(&mut manager, Some(&builder.build()), 20, Box::new(lock.clone()))
        .expect("cache");

    // a theme change loads a few more stylesheets at runtime
    let slider = store(&mut manager, b"HbSlider { track-height: 1un; }");
    let label = store(&mut manager, b"HbLabel { font: primary; }");
    cache.add(&mut manager, ItemKind::Stylesheet, ":/themes/style/dark/hbslider.css", slider).expect("add");
    cache.add(&mut manager, ItemKind::Stylesheet, ":/themes/style/dark/hblabel.css", label).expect("add");
    cache.remove(&mut manager, ItemKind::Stylesheet, "hbslider.css").expect("remove");
    manager.free(slider);

    let acquired = lock.acquisitions();
    assert_eq!(cache.offset(&manager, ItemKind::Stylesheet, "hbpushbutton.css"), Some(button));
    assert_eq!(lock.acquisitions(), acquired);
    assert_eq!(cache.offset(&manager, ItemKind::Stylesheet, "hbslider.css"), None);
    assert_eq!(cache.offset(&manager, ItemKind::Stylesheet, "hblabel.css"), Some(label));

    let end = defragment_chunk(&mut manager).expect("compact");
    let report = MemoryReport::collect(&manager);
    assert!(report.main.is_none());

    let resolve = |key: &str, len: usize| {
        let at = cache.offset(&manager, ItemKind::Stylesheet, key).expect("cached");
        assert!(at.get() < end);
        manager.bytes(at, len).expect("in range").to_vec()
    };
    assert_eq!(resolve("hbpushbutton.css", 33), b"HbPushButton { min-height: 7un; }".to_vec());
    assert_eq!(
        resolve("hbpushbutton_color.css", 47),
        b"HbPushButton { color: var(qtc_button_normal); }".to_vec()
    );
    assert_eq!(resolve("hblabel.css", 26), b"HbLabel { font: primary; }".to_vec());
}

#[test]
fn test_image_preload_serves_cache() {
    let mut builder = server();
    builder.enable_cell_tracking();
    let css = store(&mut builder, b"HbListItem { layout: default; }");
    let mut offsets = OffsetMapBuilder::new();
    offsets.add_widget_offsets("hblistitem", Some(css), None).expect("widget");
    SharedCache::init_server(&mut builder, Some(&offsets.build()), 4, Box::new(LocalLock::new()))
        .expect("cache");
    let end = defragment_chunk(&mut builder).expect("compact");

    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("theme.img");
    builder.write_image(&image, end).expect("write image");

    let segment = Segment::anonymous(SEGMENT_SIZE).expect("segment");
    let mut server = SharedMemoryManager::with_segment(segment, Some(&image)).expect("preload");
    let cache = SharedCache::init_server(&mut server, None, 4, Box::new(LocalLock::new())).expect("adopt");

    let at = cache.offset(&server, ItemKind::Stylesheet, "hblistitem.css").expect("static hit");
    assert!(at.get() < server.image_end());
    assert_eq!(server.bytes(at, 31).expect("in range"), b"HbListItem { layout: default; }");

    // the preloaded cache still takes dynamic entries
    let extra = store(&mut server, b"HbIcon {}");
    cache.add(&mut server, ItemKind::Stylesheet, "hbicon.css", extra).expect("add");
    assert_eq!(cache.offset(&server, ItemKind::Stylesheet, "hbicon.css"), Some(extra));
    assert!(extra.get() >= server.image_end());
}
