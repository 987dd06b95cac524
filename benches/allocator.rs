//! Allocator benchmarks
//!
//! Measures bucket vs main allocation paths and cache lookups.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use theme_shm::cache::{LocalLock, OffsetMapBuilder};
use theme_shm::{ItemKind, MemoryManager, Offset, Segment, SharedCache, SharedMemoryManager};

const SEGMENT_SIZE: usize = 8 * 1024 * 1024;

fn manager() -> SharedMemoryManager {
    let segment = Segment::anonymous(SEGMENT_SIZE).expect("segment");
    SharedMemoryManager::with_segment(segment, None).expect("manager")
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for size in [16usize, 120, 224, 1024, 16 * 1024] {
        let mut manager = manager();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let at = manager.alloc(black_box(size)).expect("alloc");
                manager.free(at);
            });
        });
    }
    group.finish();
}

fn bench_fragmented_heap(c: &mut Criterion) {
    let mut manager = manager();
    // every other block freed leaves a heap full of small holes
    let blocks: Vec<Offset> = (0..2000).map(|i| manager.alloc(256 + (i % 7) * 64).expect("alloc")).collect();
    for at in blocks.iter().step_by(2) {
        manager.free(*at);
    }

    c.bench_function("main_best_fit_fragmented", |b| {
        b.iter(|| {
            let at = manager.alloc(black_box(500)).expect("alloc");
            manager.free(at);
        });
    });
}

fn bench_cache_lookup(c: &mut Criterion) {
    let mut manager = manager();
    let mut builder = OffsetMapBuilder::new();
    let mut dynamic = Vec::new();
    for i in 0..200 {
        let at = manager.alloc(512).expect("alloc");
        builder
            .add_widget_offsets(&format!("hbwidget{}", i), Some(at), None)
            .expect("widget");
        dynamic.push((format!("custom{}.css", i), at));
    }
    let cache = SharedCache::init_server(&mut manager, Some(&builder.build()), 20, Box::new(LocalLock::new()))
        .expect("cache");
    for (key, at) in &dynamic {
        cache.add(&mut manager, ItemKind::Stylesheet, key, *at).expect("add");
    }

    c.bench_function("lookup_static", |b| {
        b.iter(|| cache.offset(&manager, ItemKind::Stylesheet, black_box("hbwidget150.css")));
    });
    c.bench_function("lookup_dynamic", |b| {
        b.iter(|| cache.offset(&manager, ItemKind::Stylesheet, black_box("custom150.css")));
    });
}

criterion_group!(benches, bench_alloc_free, bench_fragmented_heap, bench_cache_lookup);
criterion_main!(benches);
