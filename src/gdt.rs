// Global Descriptor Table (GDT) and Task State Segment (TSS) for x86_64.
//
// Five segments are live (null, kernel code/data, user code/data) plus the
// two-slot TSS descriptor. The TSS carries the ring-0 stack and the
// Interrupt Stack Table; critical exception vectors each get a dedicated
// IST stack so they never run on a corrupted kernel stack.

use crate::arch;
use core::mem::size_of;

/// GDT Entry - 8 bytes each
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    pub const fn null() -> Self {
        GdtEntry {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    pub const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: ((limit >> 16) & 0x0F) as u8 | (granularity & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    /// Raw descriptor value, for the boot self-test and layout tests.
    pub const fn encoded(&self) -> u64 {
        (self.limit_low as u64)
            | (self.base_low as u64) << 16
            | (self.base_middle as u64) << 32
            | (self.access as u64) << 40
            | (self.granularity as u64) << 48
            | (self.base_high as u64) << 56
    }
}

/// System Segment Descriptor (16 bytes) - the long-mode TSS form with a
/// 64-bit base, occupying two consecutive GDT slots.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SystemSegmentDescriptor {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
    base_upper: u32,
    reserved: u32,
}

impl SystemSegmentDescriptor {
    pub const fn null() -> Self {
        SystemSegmentDescriptor {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
            base_upper: 0,
            reserved: 0,
        }
    }

    /// Create a TSS descriptor from a base address and limit.
    pub const fn new_tss(base: u64, limit: u32) -> Self {
        SystemSegmentDescriptor {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            // Present | Type 0x9 (64-bit TSS, available)
            access: 0x89,
            granularity: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
            base_upper: (base >> 32) as u32,
            reserved: 0,
        }
    }

    /// Low 8 bytes of the two-slot encoding.
    pub const fn encoded_low(&self) -> u64 {
        (self.limit_low as u64)
            | (self.base_low as u64) << 16
            | (self.base_middle as u64) << 32
            | (self.access as u64) << 40
            | (self.granularity as u64) << 48
            | (self.base_high as u64) << 56
    }

    /// High 8 bytes of the two-slot encoding.
    pub const fn encoded_high(&self) -> u64 {
        self.base_upper as u64
    }
}

/// Task State Segment for x86_64: privilege stacks plus the IST.
#[repr(C, packed)]
pub struct TaskStateSegment {
    reserved_1: u32,
    /// Stack used when an interrupt arrives from ring 3.
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    reserved_2: u64,
    /// Interrupt Stack Table - seven stacks selectable per IDT entry.
    pub ist: [u64; 7],
    reserved_3: u64,
    reserved_4: u16,
    /// Offset to the I/O permission bitmap; the structure size means
    /// "no bitmap".
    pub iomap_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        TaskStateSegment {
            reserved_1: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            reserved_2: 0,
            ist: [0; 7],
            reserved_3: 0,
            reserved_4: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

// Access byte flags
const PRESENT: u8 = 1 << 7;
const DPL_RING0: u8 = 0 << 5;
const DPL_RING3: u8 = 3 << 5;
const DESCRIPTOR: u8 = 1 << 4;
const EXECUTABLE: u8 = 1 << 3;
const READ_WRITE: u8 = 1 << 1;

// Granularity byte flags
const LONG_MODE: u8 = 1 << 5;
const SIZE_32: u8 = 1 << 6;
const GRANULARITY_4K: u8 = 1 << 7;

pub const KERNEL_CODE_ACCESS: u8 = PRESENT | DPL_RING0 | DESCRIPTOR | EXECUTABLE | READ_WRITE;
pub const KERNEL_CODE_FLAGS: u8 = LONG_MODE | GRANULARITY_4K;

pub const KERNEL_DATA_ACCESS: u8 = PRESENT | DPL_RING0 | DESCRIPTOR | READ_WRITE;
pub const KERNEL_DATA_FLAGS: u8 = SIZE_32 | GRANULARITY_4K;

pub const USER_CODE_ACCESS: u8 = PRESENT | DPL_RING3 | DESCRIPTOR | EXECUTABLE | READ_WRITE;
pub const USER_CODE_FLAGS: u8 = LONG_MODE | GRANULARITY_4K;

pub const USER_DATA_ACCESS: u8 = PRESENT | DPL_RING3 | DESCRIPTOR | READ_WRITE;
pub const USER_DATA_FLAGS: u8 = SIZE_32 | GRANULARITY_4K;

/// Size of each IST stack and of the ring-0 stack (16 KiB).
pub const IST_STACK_SIZE: usize = 4096 * 4;

/// IST slot assignments. Only the first four are installed; ist5..ist7
/// stay zero. The backing stacks for all seven are still reserved so a
/// later assignment needs no layout change.
pub const IST_DOUBLE_FAULT: u8 = 1;
pub const IST_NMI: u8 = 2;
pub const IST_MACHINE_CHECK: u8 = 3;
pub const IST_DEBUG: u8 = 4;

const INSTALLED_IST_SLOTS: usize = 4;

#[repr(C, align(16))]
struct InterruptStack {
    data: [u8; IST_STACK_SIZE],
}

impl InterruptStack {
    const fn new() -> Self {
        InterruptStack {
            data: [0; IST_STACK_SIZE],
        }
    }
}

/// Backing storage for the seven IST stacks. Distinct regions, 16-byte
/// aligned, non-overlapping by construction.
static mut IST_STACKS: [InterruptStack; 7] = [
    InterruptStack::new(),
    InterruptStack::new(),
    InterruptStack::new(),
    InterruptStack::new(),
    InterruptStack::new(),
    InterruptStack::new(),
    InterruptStack::new(),
];

/// Ring-0 stack installed in TSS.rsp0.
static mut RING0_STACK: InterruptStack = InterruptStack::new();

/// The Task State Segment
static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// The GDT with entries:
/// 0: Null descriptor (required)
/// 1: Kernel code segment (0x08)
/// 2: Kernel data segment (0x10)
/// 3: User code segment (0x18)
/// 4: User data segment (0x20)
/// 5-6: TSS descriptor (0x28) - takes 16 bytes (2 entries)
#[repr(C, align(16))]
struct Gdt {
    null: GdtEntry,
    kernel_code: GdtEntry,
    kernel_data: GdtEntry,
    user_code: GdtEntry,
    user_data: GdtEntry,
    tss: SystemSegmentDescriptor,
}

static mut GDT: Gdt = Gdt {
    null: GdtEntry::null(),
    kernel_code: GdtEntry::new(0, 0xFFFFF, KERNEL_CODE_ACCESS, KERNEL_CODE_FLAGS),
    kernel_data: GdtEntry::new(0, 0xFFFFF, KERNEL_DATA_ACCESS, KERNEL_DATA_FLAGS),
    user_code: GdtEntry::new(0, 0xFFFFF, USER_CODE_ACCESS, USER_CODE_FLAGS),
    user_data: GdtEntry::new(0, 0xFFFFF, USER_DATA_ACCESS, USER_DATA_FLAGS),
    tss: SystemSegmentDescriptor::null(), // Filled in at runtime
};

static mut GDT_PTR: arch::DescriptorTablePointer = arch::DescriptorTablePointer {
    limit: 0,
    base: 0,
};

/// Segment selectors. Every IDT entry references KERNEL_CODE_SELECTOR.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
#[allow(dead_code)]
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
#[allow(dead_code)]
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// Install the GDT and TSS: build the TSS descriptor, load the GDTR,
/// reload all segment registers and execute `ltr`.
///
/// # Safety
/// Must be called exactly once, with interrupts disabled, before the IDT
/// is loaded.
pub unsafe fn init() {
    // Install the ring-0 stack and the first four IST slots; stacks grow
    // down, so each entry is the *top* of its region.
    let tss = &raw mut TSS;
    (*tss).rsp0 = (&raw const RING0_STACK as u64) + IST_STACK_SIZE as u64;
    let stacks = &raw const IST_STACKS as *const InterruptStack;
    for slot in 0..INSTALLED_IST_SLOTS {
        let top = (stacks.add(slot) as u64) + IST_STACK_SIZE as u64;
        (*tss).ist[slot] = top;
    }

    let tss_base = tss as u64;
    let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;
    let gdt = &raw mut GDT;
    (*gdt).tss = SystemSegmentDescriptor::new_tss(tss_base, tss_limit);

    let gdt_ptr = &raw mut GDT_PTR;
    (*gdt_ptr).limit = (size_of::<Gdt>() - 1) as u16;
    (*gdt_ptr).base = gdt as u64;

    arch::lgdt(gdt_ptr);
    arch::reload_segments(KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR);
    arch::ltr(TSS_SELECTOR);
}

/// Set the kernel stack pointer (RSP0) in the TSS. Called when switching
/// tasks so ring-3 interrupts land on the right kernel stack.
///
/// # Safety
/// `stack_top` must point at the top of a valid, live kernel stack.
#[allow(dead_code)]
pub unsafe fn set_kernel_stack(stack_top: u64) {
    (*(&raw mut TSS)).rsp0 = stack_top;
}

/// Boot self-test: the selectors actually loaded must match the layout
/// the IDT entries assume.
pub fn verify_loaded() -> bool {
    arch::read_cs() == KERNEL_CODE_SELECTOR
        && arch::read_ds() == KERNEL_DATA_SELECTOR
        && arch::read_tr() == TSS_SELECTOR
}
