#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use theme_shm::cache::{open_lock, CacheLock, NamedSemaphore};
use theme_shm::config::{Role, ShmConfig};
use theme_shm::segment::{PosixShm, SEGMENT_MAGIC};
use theme_shm::{AllocError, ItemKind, MemoryManager, SegmentError, SharedCache, SharedMemoryManager, ShmError};

fn config(tag: &str) -> ShmConfig {
    let mut config = ShmConfig::default();
    config.segment.name = format!("/theme-shm-it-{}-{}", tag, std::process::id());
    config.segment.size = 1024 * 1024;
    config.cache.semaphore = format!("/theme-shm-it-sem-{}-{}", tag, std::process::id());
    config
}

#[test]
fn test_server_and_client_share_segment() {
    let config = config("share");
    let mut server = SharedMemoryManager::initialize(&config, Role::Server).expect("server");
    assert!(server.is_writable());
    assert_eq!(server.header().magic, SEGMENT_MAGIC);

    let lock = open_lock(&config.cache.semaphore, Role::Server).expect("semaphore");
    let cache = SharedCache::init_server(&mut server, None, config.cache.effect_reserve, lock).expect("cache");
    let css = server.alloc(18).expect("alloc");
    server
        .bytes_mut(css, 18)
        .expect("writable")
        .copy_from_slice(b"HbLabel { a: b; }\n");
    cache.add(&mut server, ItemKind::Stylesheet, "hblabel.css", css).expect("add");

    let mut client = SharedMemoryManager::initialize(&config, Role::Client).expect("client");
    assert!(!client.is_writable());
    assert_eq!(client.alloc(8), Err(AllocError::ReadOnly));

    let client_lock = open_lock(&config.cache.semaphore, Role::Client).expect("open semaphore");
    let reader = SharedCache::init_client(&client, client_lock).expect("cache published");
    let at = reader.offset(&client, ItemKind::Stylesheet, "hblabel.css").expect("lookup");
    assert_eq!(at, css);
    assert_eq!(client.bytes(at, 18).expect("mapped"), b"HbLabel { a: b; }\n");
    assert_eq!(client.allocated_size(at), server.allocated_size(at));

    // the server's later writes are visible through the client's mapping
    let effect = server.alloc(400).expect("alloc");
    cache.add(&mut server, ItemKind::Effect, "glow.fxml", effect).expect("add");
    assert_eq!(reader.offset(&client, ItemKind::Effect, "glow.fxml"), Some(effect));

    drop(client);
    drop(server);
    PosixShm::unlink(&config.segment.name).expect("cleanup");
    NamedSemaphore::unlink(&config.cache.semaphore).expect("cleanup");
}

#[test]
fn test_server_reconnects_after_crash() {
    let config = config("crash");
    let (payload, before) = {
        let mut server = SharedMemoryManager::initialize(&config, Role::Server).expect("server");
        let payload = server.alloc(3000).expect("alloc");
        server.bytes_mut(payload, 4).expect("writable").copy_from_slice(b"live");
        let before = server.free_bytes();
        // a crashed server never unmaps or unlinks
        std::mem::forget(server);
        (payload, before)
    };

    let mut server = SharedMemoryManager::initialize(&config, Role::Server).expect("reconnect");
    assert_eq!(server.free_bytes(), before);
    assert_eq!(server.bytes(payload, 4).expect("mapped"), b"live");
    assert_eq!(server.allocated_size(payload), 3000);

    let next = server.alloc(3000).expect("alloc after reconnect");
    assert_ne!(next, payload);
    drop(server);
    PosixShm::unlink(&config.segment.name).expect("cleanup");
}

#[test]
fn test_client_needs_a_server() {
    let config = config("absent");
    assert!(matches!(
        SharedMemoryManager::initialize(&config, Role::Client),
        Err(ShmError::Segment(SegmentError::Attach { .. }))
    ));
    assert!(open_lock(&config.cache.semaphore, Role::Client).is_err());
}

#[test]
fn test_restarted_server_keeps_client_semaphore() {
    let config = config("relock");
    let first = NamedSemaphore::create(&config.cache.semaphore).expect("create");
    let client = NamedSemaphore::open(&config.cache.semaphore).expect("open");
    // crash while holding the lock
    first.acquire();
    std::mem::forget(first);

    let server = Arc::new(NamedSemaphore::create(&config.cache.semaphore).expect("recreate"));
    client.acquire();

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let server = Arc::clone(&server);
        let acquired = Arc::clone(&acquired);
        std::thread::spawn(move || {
            server.acquire();
            acquired.store(true, Ordering::SeqCst);
            server.release();
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "server entered while the client held the lock");
    client.release();
    waiter.join().expect("waiter");
    assert!(acquired.load(Ordering::SeqCst));

    NamedSemaphore::unlink(&config.cache.semaphore).expect("cleanup");
}
