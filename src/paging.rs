// Virtual memory manager: conventional 4-level page tables edited
// through the physical-memory window the bootloader maps for us.
// Intermediate table frames come from the PMM; the only demand-paged
// region is the kernel heap window.

use crate::arch;
use crate::physical_memory::{BitmapFrameAllocator, FRAME_ALLOCATOR};
use spin::{Mutex, Once};
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: u64 = 4096;

/// Low memory identity-mapped at boot.
pub const IDENTITY_MAP_LIMIT: u64 = 256 * 1024 * 1024;

/// Upper bound the identity map may be extended to.
pub const IDENTITY_MAP_EXTENDED_LIMIT: u64 = 512 * 1024 * 1024;

/// The kernel heap window: faults in here are demand-mapped, faults
/// anywhere else are fatal.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_8800_0000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024;

/// Page-fault error-code bit 0: set when the fault was a protection
/// violation on a present page.
const FAULT_PRESENT: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The address is already mapped with a different target or flags.
    AlreadyMapped,
    /// `unmap`/`translate` found no leaf entry.
    NotMapped,
    /// The walk ran into a huge-page entry this manager does not edit.
    HugePage,
    /// The PMM could not supply a table or data frame.
    OutOfFrames,
}

/// Source of zeroed 4-KiB frames for table construction. The kernel
/// plugs in the PMM; tests plug in an arena-backed bump allocator.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Option<u64>;
}

impl FrameSource for BitmapFrameAllocator {
    fn alloc_frame(&mut self) -> Option<u64> {
        BitmapFrameAllocator::alloc_frame(self)
    }
}

/// One 4-level address space, identified by the physical address of its
/// root table. All table edits go through `phys_offset`, the virtual
/// base at which physical memory is visible.
pub struct AddressSpace {
    root: u64,
    phys_offset: u64,
    /// TLB maintenance only makes sense when these tables are the ones
    /// the CPU is actually using.
    live: bool,
}

/// # Safety
/// `table_phys` must be the physical address of a page table visible at
/// `phys_offset`. The returned lifetime is unconstrained; callers keep
/// the borrow local to one walk step.
unsafe fn table_mut<'a>(phys_offset: u64, table_phys: u64) -> &'a mut PageTable {
    &mut *((table_phys + phys_offset) as *mut PageTable)
}

unsafe fn table_ref<'a>(phys_offset: u64, table_phys: u64) -> &'a PageTable {
    &*((table_phys + phys_offset) as *const PageTable)
}

impl AddressSpace {
    /// Wrap an existing root table.
    ///
    /// # Safety
    /// `root` must point at a valid, zero-or-well-formed top-level table
    /// reachable through `phys_offset`.
    pub unsafe fn new(root: u64, phys_offset: u64, live: bool) -> Self {
        AddressSpace {
            root,
            phys_offset,
            live,
        }
    }

    /// Adopt the tables the CPU is currently running on.
    ///
    /// # Safety
    /// `phys_offset` must be the base of the bootloader's physical-memory
    /// mapping.
    pub unsafe fn current(phys_offset: u64) -> Self {
        AddressSpace {
            root: arch::read_cr3(),
            phys_offset,
            live: true,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Fetch (or create) the table one level below `entry`.
    fn next_table_create(
        &mut self,
        table_phys: u64,
        index: usize,
        frames: &mut dyn FrameSource,
    ) -> Result<u64, MapError> {
        // SAFETY: table_phys comes from the root or a parent entry this
        // walk just validated.
        let table = unsafe { table_mut(self.phys_offset, table_phys) };
        let entry = &mut table[index];
        if entry.is_unused() {
            let frame = frames.alloc_frame().ok_or(MapError::OutOfFrames)?;
            // SAFETY: the frame was just handed out by the source and is
            // visible through the physical window.
            unsafe {
                core::ptr::write_bytes((frame + self.phys_offset) as *mut u8, 0, PAGE_SIZE as usize);
            }
            entry.set_addr(
                PhysAddr::new(frame),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
            );
            Ok(frame)
        } else if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            Err(MapError::HugePage)
        } else {
            Ok(entry.addr().as_u64())
        }
    }

    /// Install `va -> pa` with `flags` (PRESENT is implied), creating
    /// intermediate tables as needed. Mapping the same address to the
    /// same frame with the same flags is a no-op; anything else on an
    /// occupied entry fails.
    pub fn map(
        &mut self,
        va: u64,
        pa: u64,
        flags: PageTableFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        let addr = VirtAddr::new(va);
        let effective = flags | PageTableFlags::PRESENT;

        let p3 = self.next_table_create(self.root, usize::from(addr.p4_index()), frames)?;
        let p2 = self.next_table_create(p3, usize::from(addr.p3_index()), frames)?;
        let p1 = self.next_table_create(p2, usize::from(addr.p2_index()), frames)?;

        // SAFETY: p1 was produced by the validated walk above.
        let table = unsafe { table_mut(self.phys_offset, p1) };
        let entry = &mut table[usize::from(addr.p1_index())];
        if !entry.is_unused() {
            if entry.addr().as_u64() == pa && entry.flags() == effective {
                return Ok(());
            }
            return Err(MapError::AlreadyMapped);
        }
        entry.set_addr(PhysAddr::new(pa), effective);
        if self.live {
            // SAFETY: flushing a single TLB line is always sound.
            unsafe { arch::invlpg(va) };
        }
        Ok(())
    }

    /// Clear the leaf entry for `va` and invalidate its TLB line.
    /// Returns the physical address that was mapped.
    pub fn unmap(&mut self, va: u64) -> Result<u64, MapError> {
        let addr = VirtAddr::new(va);
        let mut table_phys = self.root;
        for index in [
            usize::from(addr.p4_index()),
            usize::from(addr.p3_index()),
            usize::from(addr.p2_index()),
        ] {
            // SAFETY: table_phys is the root or came from a parent entry.
            let table = unsafe { table_ref(self.phys_offset, table_phys) };
            let entry = &table[index];
            if entry.is_unused() {
                return Err(MapError::NotMapped);
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(MapError::HugePage);
            }
            table_phys = entry.addr().as_u64();
        }

        // SAFETY: validated leaf table.
        let table = unsafe { table_mut(self.phys_offset, table_phys) };
        let entry = &mut table[usize::from(addr.p1_index())];
        if entry.is_unused() {
            return Err(MapError::NotMapped);
        }
        let pa = entry.addr().as_u64();
        entry.set_unused();
        if self.live {
            // SAFETY: flushing a single TLB line is always sound.
            unsafe { arch::invlpg(va) };
        }
        Ok(pa)
    }

    /// Walk the tables for diagnostics. Handles 4-KiB and 2-MiB leaves.
    pub fn translate(&self, va: u64) -> Option<u64> {
        let addr = VirtAddr::new(va);
        let mut table_phys = self.root;
        for (level, index) in [
            (4u8, usize::from(addr.p4_index())),
            (3, usize::from(addr.p3_index())),
            (2, usize::from(addr.p2_index())),
        ] {
            // SAFETY: table_phys is the root or came from a parent entry.
            let table = unsafe { table_ref(self.phys_offset, table_phys) };
            let entry = &table[index];
            if entry.is_unused() {
                return None;
            }
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return match level {
                    2 => Some(entry.addr().as_u64() + (va & 0x1F_FFFF)),
                    3 => Some(entry.addr().as_u64() + (va & 0x3FFF_FFFF)),
                    _ => None,
                };
            }
            table_phys = entry.addr().as_u64();
        }

        // SAFETY: validated leaf table.
        let table = unsafe { table_ref(self.phys_offset, table_phys) };
        let entry = &table[usize::from(addr.p1_index())];
        if entry.is_unused() {
            None
        } else {
            Some(entry.addr().as_u64() + (va & 0xFFF))
        }
    }

    /// Map `[start, end)` with va == pa. Ranges already covered (for
    /// example by bootloader huge pages) are left alone.
    pub fn identity_map_range(
        &mut self,
        start: u64,
        end: u64,
        flags: PageTableFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MapError> {
        let mut address = start & !(PAGE_SIZE - 1);
        while address < end {
            match self.map(address, address, flags, frames) {
                Ok(()) | Err(MapError::AlreadyMapped) | Err(MapError::HugePage) => {}
                Err(e) => return Err(e),
            }
            address += PAGE_SIZE;
        }
        Ok(())
    }

    /// On-demand policy: a not-present fault inside the kernel heap
    /// window gets a fresh zeroed frame mapped read-write. Everything
    /// else is not ours to fix.
    pub fn handle_page_fault(
        &mut self,
        fault_address: u64,
        error_code: u64,
        frames: &mut dyn FrameSource,
    ) -> bool {
        if error_code & FAULT_PRESENT != 0 {
            return false;
        }
        if !(KERNEL_HEAP_BASE..KERNEL_HEAP_BASE + KERNEL_HEAP_SIZE).contains(&fault_address) {
            return false;
        }
        let Some(frame) = frames.alloc_frame() else {
            return false;
        };
        // SAFETY: fresh frame from the source, visible through the window.
        unsafe {
            core::ptr::write_bytes((frame + self.phys_offset) as *mut u8, 0, PAGE_SIZE as usize);
        }
        let page = fault_address & !(PAGE_SIZE - 1);
        self.map(page, frame, PageTableFlags::WRITABLE, frames)
            .is_ok()
    }
}

/// The kernel address space, adopted from the bootloader's tables.
static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Adopt the live tables and install the low-memory identity map.
///
/// # Safety
/// `phys_offset` must be the bootloader's physical-memory mapping base;
/// the PMM must already be initialized.
pub unsafe fn init(phys_offset: u64) {
    KERNEL_SPACE.call_once(|| Mutex::new(AddressSpace::current(phys_offset)));
    let mut space = KERNEL_SPACE.get().unwrap().lock();
    let mut frames = FRAME_ALLOCATOR.lock();
    space
        .identity_map_range(
            0,
            IDENTITY_MAP_LIMIT,
            PageTableFlags::WRITABLE,
            &mut *frames,
        )
        .expect("identity map installation failed");
}

/// Page-fault fixup entry, called from exception context. Uses try_lock
/// so a fault raised while either lock is held reports unfixable instead
/// of deadlocking.
pub fn handle_page_fault(fault_address: u64, error_code: u64) -> bool {
    let Some(space) = KERNEL_SPACE.get() else {
        return false;
    };
    let Some(mut space) = space.try_lock() else {
        return false;
    };
    let Some(mut frames) = FRAME_ALLOCATOR.try_lock() else {
        return false;
    };
    space.handle_page_fault(fault_address, error_code, &mut *frames)
}

/// Map one kernel page; task-context callers only.
pub fn map(va: u64, pa: u64, flags: PageTableFlags) -> Result<(), MapError> {
    arch::without_interrupts(|| {
        let space = KERNEL_SPACE.get().ok_or(MapError::NotMapped)?;
        let mut space = space.lock();
        let mut frames = FRAME_ALLOCATOR.lock();
        space.map(va, pa, flags, &mut *frames)
    })
}

/// Unmap one kernel page; task-context callers only.
pub fn unmap(va: u64) -> Result<u64, MapError> {
    arch::without_interrupts(|| {
        let space = KERNEL_SPACE.get().ok_or(MapError::NotMapped)?;
        let mut space = space.lock();
        space.unmap(va)
    })
}
