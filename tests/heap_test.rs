//! Boundary-tag heap tests: lifecycle, coalescing, exact-fit boundaries
//! and the fatal corruption/double-free paths.

mod common;

use boxos::heap::{BoundaryTagHeap, HEAP_ALIGN};
use common::{heap_arena, HEAP_ARENA_SIZE};

fn fresh_heap(arena: &mut common::HeapArena) -> BoundaryTagHeap {
    let mut heap = BoundaryTagHeap::new();
    unsafe {
        heap.init(arena.0.as_mut_ptr() as usize, HEAP_ARENA_SIZE);
    }
    heap
}

#[test]
fn fresh_pool_is_one_free_block() {
    let mut arena = heap_arena();
    let heap = fresh_heap(&mut arena);
    let stats = heap.stats();
    assert_eq!(stats.total_bytes, HEAP_ARENA_SIZE);
    assert_eq!(stats.free_bytes, HEAP_ARENA_SIZE);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free_block, HEAP_ARENA_SIZE);
}

#[test]
fn alloc_returns_aligned_writable_memory() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let ptr = heap.try_alloc(100);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % HEAP_ALIGN, 0);
    unsafe {
        core::ptr::write_bytes(ptr, 0xA5, 100);
        assert_eq!(*ptr, 0xA5);
        assert_eq!(*ptr.add(99), 0xA5);
    }
    heap.free(ptr);
    assert_eq!(heap.stats().free_bytes, HEAP_ARENA_SIZE);
}

#[test]
fn first_fit_reuses_freed_block() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let first = heap.try_alloc(64);
    let _second = heap.try_alloc(64);
    heap.free(first);
    let third = heap.try_alloc(32);
    assert_eq!(third, first, "first fit should reuse the freed block");
}

/// Allocate 100 blocks of varied sizes, free them in reverse order, and
/// the pool must coalesce back into a single block spanning everything.
#[test]
fn lifecycle_coalesces_back_to_single_block() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let before = heap.stats();

    // Deterministic pseudo-random sizes in 1..4096.
    let mut seed: u64 = 0x5DEECE66D;
    let mut pointers = Vec::new();
    for _ in 0..100 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let size = (seed >> 33) as usize % 4095 + 1;
        let ptr = heap.try_alloc(size);
        assert!(!ptr.is_null());
        pointers.push(ptr);
    }

    for ptr in pointers.into_iter().rev() {
        heap.free(ptr);
    }

    let after = heap.stats();
    assert_eq!(after, before);
    assert_eq!(after.free_blocks, 1);
    assert_eq!(after.largest_free_block, HEAP_ARENA_SIZE);
}

/// The largest request that exactly equals the pool succeeds; one more
/// byte fails.
#[test]
fn exact_fit_boundary() {
    const HEADER_SIZE: usize = 32;
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);

    let exact = HEAP_ARENA_SIZE - HEADER_SIZE;
    let ptr = heap.try_alloc(exact);
    assert!(!ptr.is_null(), "exact-fit allocation must succeed");
    assert!(heap.try_alloc(1).is_null(), "pool is exhausted");
    heap.free(ptr);

    assert!(
        heap.try_alloc(exact + 1).is_null(),
        "one byte beyond the pool must fail"
    );
    let again = heap.try_alloc(exact);
    assert!(!again.is_null());
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let ptr = heap.try_alloc(64);
    heap.free(ptr);
    heap.free(ptr);
}

#[test]
#[should_panic(expected = "outside the pool")]
fn foreign_pointer_is_fatal() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let mut outside = 0u8;
    heap.free(&mut outside as *mut u8);
}

#[test]
#[should_panic(expected = "bad magic")]
fn clobbered_header_is_fatal() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let ptr = heap.try_alloc(64);
    assert!(!ptr.is_null());
    // Scribble over the magic word (third header field).
    unsafe {
        core::ptr::write(ptr.sub(16) as *mut u64, 0);
    }
    heap.free(ptr);
}

#[test]
fn interleaved_frees_coalesce_both_sides() {
    let mut arena = heap_arena();
    let mut heap = fresh_heap(&mut arena);
    let a = heap.try_alloc(128);
    let b = heap.try_alloc(128);
    let c = heap.try_alloc(128);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    // Free the outer blocks first, then the middle one, which must merge
    // with both neighbors and the trailing remainder.
    heap.free(a);
    heap.free(c);
    heap.free(b);

    let stats = heap.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, HEAP_ARENA_SIZE);
}
