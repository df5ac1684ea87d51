//! Physical frame allocator tests: region accounting, alloc/free,
//! contiguous runs and double-free detection.

use boxos::physical_memory::{BitmapFrameAllocator, PhysRegion, RegionKind, FRAME_SIZE};

const MIB: u64 = 1024 * 1024;

fn allocator_with(regions: &[PhysRegion], mem_start: u64) -> Box<BitmapFrameAllocator> {
    let mut pmm = Box::new(BitmapFrameAllocator::new());
    pmm.init(regions, mem_start);
    pmm
}

#[test]
fn usable_regions_become_free_frames() {
    let regions = [
        PhysRegion {
            base: 16 * MIB,
            len: 4 * MIB,
            kind: RegionKind::Usable,
        },
        PhysRegion {
            base: 32 * MIB,
            len: MIB,
            kind: RegionKind::Reserved,
        },
    ];
    let pmm = allocator_with(&regions, 16 * MIB);
    // Only the usable region counts: 4 MiB = 1024 frames.
    assert_eq!(pmm.free_frames(), 1024);
}

#[test]
fn low_memory_stays_reserved() {
    let regions = [PhysRegion {
        base: 0,
        len: 32 * MIB,
        kind: RegionKind::Usable,
    }];
    let pmm = allocator_with(&regions, 16 * MIB);
    // Everything below mem_start is subtracted.
    assert_eq!(pmm.free_frames(), (16 * MIB / FRAME_SIZE as u64) as usize);
}

#[test]
fn partial_frames_at_region_edges_are_dropped() {
    let regions = [PhysRegion {
        base: 16 * MIB + 123,
        len: 2 * FRAME_SIZE as u64,
        kind: RegionKind::Usable,
    }];
    // Base rounds up to the next frame; only one whole frame fits.
    let pmm = allocator_with(&regions, 0);
    assert_eq!(pmm.free_frames(), 1);
}

#[test]
fn alloc_and_free_round_trip() {
    let regions = [PhysRegion {
        base: 16 * MIB,
        len: MIB,
        kind: RegionKind::Usable,
    }];
    let mut pmm = allocator_with(&regions, 16 * MIB);
    let before = pmm.free_frames();

    let frame = pmm.alloc_frame().expect("frame available");
    assert_eq!(frame % FRAME_SIZE as u64, 0);
    assert!(frame >= 16 * MIB && frame < 17 * MIB);
    assert_eq!(pmm.free_frames(), before - 1);

    let other = pmm.alloc_frame().expect("frame available");
    assert_ne!(frame, other);

    pmm.free_frame(frame);
    pmm.free_frame(other);
    assert_eq!(pmm.free_frames(), before);
}

#[test]
fn exhaustion_returns_none() {
    let regions = [PhysRegion {
        base: 16 * MIB,
        len: 4 * FRAME_SIZE as u64,
        kind: RegionKind::Usable,
    }];
    let mut pmm = allocator_with(&regions, 0);
    for _ in 0..4 {
        assert!(pmm.alloc_frame().is_some());
    }
    assert_eq!(pmm.alloc_frame(), None);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let regions = [PhysRegion {
        base: 16 * MIB,
        len: MIB,
        kind: RegionKind::Usable,
    }];
    let mut pmm = allocator_with(&regions, 0);
    let frame = pmm.alloc_frame().unwrap();
    pmm.free_frame(frame);
    pmm.free_frame(frame);
}

#[test]
fn contiguous_allocation_is_adjacent() {
    let regions = [PhysRegion {
        base: 16 * MIB,
        len: MIB,
        kind: RegionKind::Usable,
    }];
    let mut pmm = allocator_with(&regions, 0);
    let before = pmm.free_frames();

    // Punch a hole so the scan has to skip a fragmented prefix.
    let single = pmm.alloc_frame().unwrap();

    let run = pmm.alloc_contiguous(8).expect("contiguous run available");
    assert_eq!(run % FRAME_SIZE as u64, 0);
    assert_ne!(run, single);
    assert_eq!(pmm.free_frames(), before - 9);

    // The run must be dense: freeing each frame individually works and
    // none of them was the singleton.
    for i in 0..8 {
        let frame = run + (i * FRAME_SIZE) as u64;
        assert_ne!(frame, single);
        pmm.free_frame(frame);
    }
    pmm.free_frame(single);
    assert_eq!(pmm.free_frames(), before);
}

#[test]
fn oversized_contiguous_request_fails() {
    let regions = [PhysRegion {
        base: 16 * MIB,
        len: 4 * FRAME_SIZE as u64,
        kind: RegionKind::Usable,
    }];
    let mut pmm = allocator_with(&regions, 0);
    assert_eq!(pmm.alloc_contiguous(5), None);
    assert_eq!(pmm.free_frames(), 4, "failed request must not leak frames");
}
