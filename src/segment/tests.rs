//! Segment tests - offsets, record access, views

use super::*;

#[test]
fn offset_raw_round_trip_keeps_nil() {
    assert_eq!(Offset::from_raw(NIL), None);
    assert_eq!(Offset::from_raw(64), Some(Offset::new(64)));
    assert_eq!(Offset::to_raw(None), NIL);
    assert_eq!(Offset::new(96).raw(), 96);
    assert!(Offset::NULL.is_null());
}

#[test]
fn align_up_rounds_to_eight() {
    assert_eq!(align_up(0), 0);
    assert_eq!(align_up(1), 8);
    assert_eq!(align_up(8), 8);
    assert_eq!(align_up(9), 16);
    assert_eq!(align_up(223), 224);
}

#[test]
fn anonymous_segment_starts_zeroed() {
    let segment = Segment::anonymous(4096).expect("segment");
    assert_eq!(segment.len(), 4096);
    assert!(segment.is_writable());
    assert_eq!(segment.header(), SegmentHeader::default());
    assert!(segment.bytes(Offset::NULL, 4096).unwrap().iter().all(|b| *b == 0));
}

#[test]
fn records_copy_in_and_out() {
    let mut segment = Segment::anonymous(256).expect("segment");
    segment.write_u32(Offset::new(32), 0xDEAD_BEEF);
    segment.write::<u64>(Offset::new(40), 7 << 3);

    assert_eq!(segment.read_u32(Offset::new(32)), 0xDEAD_BEEF);
    assert_eq!(segment.read::<u64>(Offset::new(40)), 56);
}

#[test]
fn resolve_rejects_out_of_range() {
    let segment = Segment::anonymous(64).expect("segment");
    assert!(segment.resolve::<u64>(Offset::new(56)).is_some());
    assert!(segment.resolve::<u64>(Offset::new(60)).is_none());
    assert!(segment.resolve::<u32>(Offset::new(62)).is_none());
    assert!(segment.bytes(Offset::new(60), 8).is_none());
}

#[test]
fn read_only_view_sees_writes_but_cannot_write() {
    let mut segment = Segment::anonymous(128).expect("segment");
    let mut view = segment.read_only_view();
    assert!(!view.is_writable());

    segment.write_header(SegmentHeader {
        magic: SEGMENT_MAGIC,
        main_allocator: HEADER_SIZE as u32,
        bucket_allocator: 0,
        shared_cache: 0,
    });
    assert_eq!(view.header().magic, SEGMENT_MAGIC);
    assert!(view.bytes_mut(Offset::new(0), 4).is_none());
}

#[test]
#[should_panic(expected = "read-only")]
fn read_only_view_write_panics() {
    let segment = Segment::anonymous(128).expect("segment");
    let mut view = segment.read_only_view();
    view.write_u32(Offset::new(16), 1);
}

#[test]
fn copy_within_handles_overlap() {
    let mut segment = Segment::anonymous(64).expect("segment");
    segment
        .bytes_mut(Offset::new(16), 8)
        .unwrap()
        .copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    segment.copy_within(Offset::new(16), Offset::new(20), 8);
    assert_eq!(
        segment.bytes(Offset::new(16), 12).unwrap(),
        &[1, 2, 3, 4, 1, 2, 3, 4, 5, 6, 7, 8]
    );
}

#[test]
fn zero_sized_segment_is_rejected() {
    assert!(matches!(Segment::anonymous(0), Err(SegmentError::InvalidSize(0))));
}

#[cfg(unix)]
mod posix {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/theme-shm-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn create_twice_reports_already_exists() {
        let name = unique_name("exists");
        let _ = PosixShm::unlink(&name);

        let first = Segment::create_shared(&name, 8192).expect("create");
        let second = Segment::create_shared(&name, 8192);
        assert!(matches!(second, Err(SegmentError::AlreadyExists(_))));
        drop(first);
    }

    #[test]
    fn attached_reader_sees_server_writes() {
        let name = unique_name("attach");
        let _ = PosixShm::unlink(&name);

        let mut server = Segment::create_shared(&name, 8192).expect("create");
        let client = Segment::attach_shared(&name, false).expect("attach");
        assert_eq!(client.len(), 8192);
        assert!(!client.is_writable());

        server.write_u32(Offset::new(100), 42);
        assert_eq!(client.read_u32(Offset::new(100)), 42);
    }

    #[test]
    fn names_must_be_rooted() {
        assert!(matches!(
            Segment::create_shared("no-slash", 4096),
            Err(SegmentError::InvalidName(_))
        ));
    }
}
