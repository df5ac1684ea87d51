// Physical frame allocator: one bit per 4 KiB frame, fed by the firmware
// memory map after the kernel image and low memory are reserved.

use spin::Mutex;

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Maximum physical memory we track (1 GiB = 262144 frames)
const MAX_FRAMES: usize = 262_144;

/// Bitmap size in bytes (1 bit per frame)
const BITMAP_SIZE: usize = MAX_FRAMES / 8;

/// Firmware memory-map entry classes, matching the on-disk E820 types
/// 1..5 the loader hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
}

/// One firmware memory-map region.
#[derive(Debug, Clone, Copy)]
pub struct PhysRegion {
    pub base: u64,
    pub len: u64,
    pub kind: RegionKind,
}

/// Bitmap-based physical frame allocator. Bit set = frame in use.
pub struct BitmapFrameAllocator {
    bitmap: [u8; BITMAP_SIZE],
    /// First-fit cursor; keeps single-frame allocations from rescanning
    /// the low bitmap over and over.
    next: usize,
    /// Live count of free frames.
    free: usize,
}

impl BitmapFrameAllocator {
    /// Everything starts out reserved; `init` frees the usable regions.
    pub const fn new() -> Self {
        BitmapFrameAllocator {
            bitmap: [0xFF; BITMAP_SIZE],
            next: 0,
            free: 0,
        }
    }

    /// Walk the firmware map and mark usable frames free, keeping
    /// everything below `mem_start` (kernel image plus identity-map
    /// working set) reserved. Region edges are aligned inward so partial
    /// frames stay reserved.
    pub fn init(&mut self, regions: &[PhysRegion], mem_start: u64) {
        for region in regions {
            if region.kind != RegionKind::Usable {
                continue;
            }
            let first = region.base.div_ceil(FRAME_SIZE as u64);
            let last = (region.base + region.len) / FRAME_SIZE as u64;
            for frame in first..last {
                let address = frame * FRAME_SIZE as u64;
                if address < mem_start || frame as usize >= MAX_FRAMES {
                    continue;
                }
                if !self.is_free(frame as usize) {
                    self.mark_free(frame as usize);
                    self.free += 1;
                }
            }
        }
        self.next = (mem_start as usize / FRAME_SIZE).min(MAX_FRAMES - 1);
    }

    fn mark_free(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    fn mark_used(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    fn is_free(&self, frame: usize) -> bool {
        frame < MAX_FRAMES && (self.bitmap[frame / 8] & (1 << (frame % 8))) == 0
    }

    /// Allocate one frame, first-fit from the cursor. Returns its
    /// physical address.
    pub fn alloc_frame(&mut self) -> Option<u64> {
        if self.free == 0 {
            return None;
        }
        for offset in 0..MAX_FRAMES {
            let frame = (self.next + offset) % MAX_FRAMES;
            if self.is_free(frame) {
                self.mark_used(frame);
                self.free -= 1;
                self.next = (frame + 1) % MAX_FRAMES;
                return Some((frame * FRAME_SIZE) as u64);
            }
        }
        None
    }

    /// Return a frame. Freeing a frame that is already free is a kernel
    /// bug and fatal.
    pub fn free_frame(&mut self, address: u64) {
        assert!(
            address % FRAME_SIZE as u64 == 0,
            "PMM: free of unaligned address {:#x}",
            address
        );
        let frame = (address / FRAME_SIZE as u64) as usize;
        assert!(frame < MAX_FRAMES, "PMM: free of untracked frame {:#x}", address);
        assert!(
            !self.is_free(frame),
            "PMM: double free of frame {:#x}",
            address
        );
        self.mark_free(frame);
        self.free += 1;
    }

    /// Scan for `count` adjacent free frames; returns the address of the
    /// first one.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<u64> {
        if count == 0 || count > self.free {
            return None;
        }
        let mut run = 0;
        let mut start = 0;
        for frame in 0..MAX_FRAMES {
            if self.is_free(frame) {
                if run == 0 {
                    start = frame;
                }
                run += 1;
                if run == count {
                    for taken in start..start + count {
                        self.mark_used(taken);
                    }
                    self.free -= count;
                    return Some((start * FRAME_SIZE) as u64);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free
    }
}

/// The kernel's frame allocator. Task-context users must hold the lock
/// with interrupts disabled, because the page-fault fixup path also takes
/// it.
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::new());

/// Feed the firmware map into the kernel allocator.
pub fn init(regions: &[PhysRegion], mem_start: u64) {
    FRAME_ALLOCATOR.lock().init(regions, mem_start);
}

pub fn alloc_frame() -> Option<u64> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

pub fn free_frame(address: u64) {
    FRAME_ALLOCATOR.lock().free_frame(address);
}

pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}
