// Kernel heap: a boundary-tag, first-fit allocator over one contiguous
// arena. Free blocks form a single list ordered by address so a free can
// coalesce with both neighbors in one pass. Every block header carries a
// magic word; a bad magic at free time means the kernel scribbled over
// its own heap and is not allowed to continue.
//
// The free list is expressed as offsets into the arena rather than
// pointers, which keeps the same code byte-exact between the demand-paged
// kernel window and the plain buffers the tests run it over.

use core::alloc::{GlobalAlloc, Layout};
use spin::Mutex;

/// Payload alignment; every block size is a multiple of this.
pub const HEAP_ALIGN: usize = 16;

/// Magic for a block handed out by `alloc`.
const ALLOC_MAGIC: u64 = 0xB10C_A110_CA7E_D00D;

/// Magic for a block sitting on the free list.
const FREE_MAGIC: u64 = 0xF4EE_B10C_0000_CAFE;

/// "no next block" sentinel for the offset-based list.
const NONE: usize = usize::MAX;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Smallest block worth splitting off: header plus one alignment unit.
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + HEAP_ALIGN;

/// Per-block metadata written directly into the arena. `size` covers the
/// header itself; `next` is an arena offset and only meaningful while the
/// block is free.
#[repr(C)]
struct BlockHeader {
    size: usize,
    next: usize,
    magic: u64,
    _reserved: u64,
}

/// Aggregate numbers for `mem_stats()` and the shell's `mem` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub largest_free_block: usize,
    pub free_blocks: usize,
}

pub struct BoundaryTagHeap {
    base: usize,
    size: usize,
    free_head: usize,
    free_bytes: usize,
    initialized: bool,
}

impl BoundaryTagHeap {
    pub const fn new() -> Self {
        BoundaryTagHeap {
            base: 0,
            size: 0,
            free_head: NONE,
            free_bytes: 0,
            initialized: false,
        }
    }

    fn header(&self, offset: usize) -> *mut BlockHeader {
        (self.base + offset) as *mut BlockHeader
    }

    /// Take ownership of `[base, base + size)` and seed it with a single
    /// free block spanning the whole pool.
    ///
    /// # Safety
    /// The range must be writable (or demand-mapped) memory owned by the
    /// caller, 16-byte aligned, and used by nothing else.
    pub unsafe fn init(&mut self, base: usize, size: usize) {
        assert!(base % HEAP_ALIGN == 0, "heap base must be aligned");
        assert!(size >= MIN_BLOCK_SIZE, "heap pool too small");
        self.base = base;
        self.size = size & !(HEAP_ALIGN - 1);
        self.free_head = 0;
        self.free_bytes = self.size;
        self.initialized = true;
        let head = self.header(0);
        (*head).size = self.size;
        (*head).next = NONE;
        (*head).magic = FREE_MAGIC;
        (*head)._reserved = 0;
    }

    /// First-fit allocation. Returns null when no free block fits; the
    /// kernel-facing wrapper turns that into a panic.
    pub fn try_alloc(&mut self, size: usize) -> *mut u8 {
        if !self.initialized {
            return core::ptr::null_mut();
        }
        let payload = (size.max(1) + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
        let need = payload + HEADER_SIZE;

        let mut prev = NONE;
        let mut current = self.free_head;
        while current != NONE {
            let header = self.header(current);
            // SAFETY: offsets on the free list always point at headers
            // this allocator wrote inside its own arena.
            unsafe {
                assert!(
                    (*header).magic == FREE_MAGIC,
                    "heap corruption: free list entry at offset {:#x} has bad magic",
                    current
                );
                if (*header).size >= need {
                    let remaining = (*header).size - need;
                    let next = (*header).next;
                    let follow = if remaining >= MIN_BLOCK_SIZE {
                        // Split: the tail stays free.
                        let split = current + need;
                        let split_header = self.header(split);
                        (*split_header).size = remaining;
                        (*split_header).next = next;
                        (*split_header).magic = FREE_MAGIC;
                        (*split_header)._reserved = 0;
                        (*header).size = need;
                        split
                    } else {
                        // Hand out the slack with the block.
                        next
                    };
                    if prev == NONE {
                        self.free_head = follow;
                    } else {
                        (*self.header(prev)).next = follow;
                    }
                    self.free_bytes -= (*header).size;
                    (*header).next = NONE;
                    (*header).magic = ALLOC_MAGIC;
                    return (self.base + current + HEADER_SIZE) as *mut u8;
                }
                prev = current;
                current = (*header).next;
            }
        }
        core::ptr::null_mut()
    }

    /// Fatal-on-failure allocation used by the `GlobalAlloc` adapter:
    /// running the kernel out of heap is a bug, not a recoverable state.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        assert!(self.initialized, "heap used before init");
        let ptr = self.try_alloc(size);
        assert!(!ptr.is_null(), "kernel heap exhausted ({} bytes requested)", size);
        ptr
    }

    /// Return a block. Corruption, foreign pointers and double frees are
    /// all fatal because they indicate kernel bugs.
    pub fn free(&mut self, ptr: *mut u8) {
        assert!(self.initialized, "heap used before init");
        assert!(!ptr.is_null(), "heap free of null pointer");
        let address = ptr as usize;
        assert!(
            address > self.base + HEADER_SIZE - 1 && address < self.base + self.size,
            "heap free of pointer {:#x} outside the pool",
            address
        );
        let offset = address - self.base - HEADER_SIZE;
        assert!(
            offset % HEAP_ALIGN == 0,
            "heap free of misaligned pointer {:#x}",
            address
        );

        let header = self.header(offset);
        // SAFETY: range and alignment were just validated; the header
        // either belongs to a live block or the asserts below fire.
        unsafe {
            if (*header).magic == FREE_MAGIC {
                panic!("heap double free at {:#x}", address);
            }
            assert!(
                (*header).magic == ALLOC_MAGIC,
                "heap corruption: freeing block at {:#x} with bad magic",
                address
            );
            let size = (*header).size;
            assert!(
                offset + size <= self.size,
                "heap corruption: block at {:#x} overruns the pool",
                address
            );

            // Find the address-ordered insertion point; an exact match on
            // the way is a double free whose header was rewritten.
            let mut prev = NONE;
            let mut current = self.free_head;
            while current != NONE && current < offset {
                prev = current;
                current = (*self.header(current)).next;
            }
            assert!(current != offset, "heap double free at {:#x}", address);

            (*header).magic = FREE_MAGIC;
            (*header).next = current;
            if prev == NONE {
                self.free_head = offset;
            } else {
                (*self.header(prev)).next = offset;
            }
            self.free_bytes += size;

            // Coalesce with the following neighbor.
            if current != NONE && offset + (*header).size == current {
                let next_header = self.header(current);
                (*header).size += (*next_header).size;
                (*header).next = (*next_header).next;
                (*next_header).magic = 0;
            }

            // Coalesce with the preceding neighbor.
            if prev != NONE {
                let prev_header = self.header(prev);
                if prev + (*prev_header).size == offset {
                    (*prev_header).size += (*header).size;
                    (*prev_header).next = (*header).next;
                    (*header).magic = 0;
                }
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total_bytes: self.size,
            ..HeapStats::default()
        };
        if !self.initialized {
            return stats;
        }
        stats.free_bytes = self.free_bytes;
        let mut current = self.free_head;
        while current != NONE {
            // SAFETY: free-list offsets point at headers inside the arena.
            unsafe {
                let header = self.header(current);
                stats.free_blocks += 1;
                stats.largest_free_block = stats.largest_free_block.max((*header).size);
                current = (*header).next;
            }
        }
        stats
    }
}

// SAFETY: the struct only stores plain offsets/addresses; all access is
// serialized by the Mutex in LockedHeap.
unsafe impl Send for BoundaryTagHeap {}

/// Spinlocked heap exposed as the kernel's `GlobalAlloc`.
pub struct LockedHeap(Mutex<BoundaryTagHeap>);

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap(Mutex::new(BoundaryTagHeap::new()))
    }

    /// # Safety
    /// See [`BoundaryTagHeap::init`].
    pub unsafe fn init(&self, base: usize, size: usize) {
        self.0.lock().init(base, size);
    }

    pub fn stats(&self) -> HeapStats {
        self.0.lock().stats()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        assert!(
            layout.align() <= HEAP_ALIGN,
            "unsupported allocation alignment {}",
            layout.align()
        );
        self.0.lock().alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().free(ptr);
    }
}

/// The kernel allocator instance. Registered as the global allocator
/// only for the freestanding target; host test binaries keep std's.
#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the demand-paged heap window to the allocator.
///
/// # Safety
/// The VMM must be initialized first so faults in the window are fixed
/// up; call exactly once.
pub unsafe fn init() {
    ALLOCATOR.init(
        crate::paging::KERNEL_HEAP_BASE as usize,
        crate::paging::KERNEL_HEAP_SIZE as usize,
    );
}

/// Allocator counters for the shell and for tests.
pub fn mem_stats() -> HeapStats {
    ALLOCATOR.stats()
}
