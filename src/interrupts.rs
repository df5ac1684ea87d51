// Low-level interrupt entry and dispatch.
//
// Every vector funnels through a small assembly stub that normalizes the
// stack to one shape: vectors without a CPU-pushed error code get a
// synthetic zero so the common trampoline always sees {vector, error}
// above the iretq frame. The trampoline saves the 15 general registers,
// hands the frame pointer to `interrupt_dispatch`, restores whatever
// frame the dispatcher returns (the scheduler may have rewritten it),
// drops the {vector, error} pair and executes `iretq`.

use crate::{arch, paging, pic, pit, serial_println};
use core::arch::global_asm;
use core::sync::atomic::{AtomicU64, Ordering};

/// CPU state as laid down by the trampoline. The field order is ABI: the
/// assembly in this file produces it and every handler consumes it, so it
/// must never change independently of the stub code below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    /// Synthesized by the per-vector stub.
    pub vector: u64,
    /// CPU-pushed for vectors 8, 10-14, 17, 30; synthetic zero otherwise.
    pub error_code: u64,
    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    pub const fn zeroed() -> Self {
        InterruptFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    fn log(&self) {
        serial_println!(
            "  RIP={:#018x} CS={:#06x} RFLAGS={:#010x}",
            self.rip,
            self.cs,
            self.rflags
        );
        serial_println!("  RSP={:#018x} SS={:#06x}", self.rsp, self.ss);
        serial_println!(
            "  RAX={:#018x} RBX={:#018x} RCX={:#018x}",
            self.rax,
            self.rbx,
            self.rcx
        );
        serial_println!(
            "  RDX={:#018x} RSI={:#018x} RDI={:#018x}",
            self.rdx,
            self.rsi,
            self.rdi
        );
        serial_println!(
            "  RBP={:#018x} R8 ={:#018x} R9 ={:#018x}",
            self.rbp,
            self.r8,
            self.r9
        );
        serial_println!(
            "  R10={:#018x} R11={:#018x} R12={:#018x}",
            self.r10,
            self.r11,
            self.r12
        );
        serial_println!(
            "  R13={:#018x} R14={:#018x} R15={:#018x}",
            self.r13,
            self.r14,
            self.r15
        );
    }
}

/// Vectors where the CPU pushes an error code itself.
pub const fn pushes_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 30)
}

// Common trampoline. Register push order is the InterruptFrame contract.
// `and rsp, -16` satisfies the System V stack alignment for the call; the
// dispatcher returns the frame pointer to resume from in rax, which is
// how a timer tick switches tasks without any extra plumbing.
global_asm!(
    r#"
.section .text
.global interrupt_common
.type interrupt_common, @function
interrupt_common:
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    cld
    mov rdi, rsp
    and rsp, -16
    call interrupt_dispatch
    mov rsp, rax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax
    add rsp, 16
    iretq
"#
);

// Per-vector entry stubs. Two shapes only: vectors whose error code the
// CPU pushes, and vectors that need the synthetic zero.
macro_rules! vector_stub_no_error {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    push 0\n",
                "    push {vector}\n",
                "    jmp interrupt_common\n",
            ),
            vector = const $vector,
        );
    };
}

macro_rules! vector_stub_with_error {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    push {vector}\n",
                "    jmp interrupt_common\n",
            ),
            vector = const $vector,
        );
    };
}

vector_stub_no_error!(vector_stub_0, 0);
vector_stub_no_error!(vector_stub_1, 1);
vector_stub_no_error!(vector_stub_2, 2);
vector_stub_no_error!(vector_stub_3, 3);
vector_stub_no_error!(vector_stub_4, 4);
vector_stub_no_error!(vector_stub_5, 5);
vector_stub_no_error!(vector_stub_6, 6);
vector_stub_no_error!(vector_stub_7, 7);
vector_stub_with_error!(vector_stub_8, 8);
vector_stub_no_error!(vector_stub_9, 9);
vector_stub_with_error!(vector_stub_10, 10);
vector_stub_with_error!(vector_stub_11, 11);
vector_stub_with_error!(vector_stub_12, 12);
vector_stub_with_error!(vector_stub_13, 13);
vector_stub_with_error!(vector_stub_14, 14);
vector_stub_no_error!(vector_stub_15, 15);
vector_stub_no_error!(vector_stub_16, 16);
vector_stub_with_error!(vector_stub_17, 17);
vector_stub_no_error!(vector_stub_18, 18);
vector_stub_no_error!(vector_stub_19, 19);
vector_stub_no_error!(vector_stub_20, 20);
vector_stub_no_error!(vector_stub_21, 21);
vector_stub_no_error!(vector_stub_22, 22);
vector_stub_no_error!(vector_stub_23, 23);
vector_stub_no_error!(vector_stub_24, 24);
vector_stub_no_error!(vector_stub_25, 25);
vector_stub_no_error!(vector_stub_26, 26);
vector_stub_no_error!(vector_stub_27, 27);
vector_stub_no_error!(vector_stub_28, 28);
vector_stub_no_error!(vector_stub_29, 29);
vector_stub_with_error!(vector_stub_30, 30);
vector_stub_no_error!(vector_stub_31, 31);
vector_stub_no_error!(vector_stub_32, 32);
vector_stub_no_error!(vector_stub_33, 33);
vector_stub_no_error!(vector_stub_34, 34);
vector_stub_no_error!(vector_stub_35, 35);
vector_stub_no_error!(vector_stub_36, 36);
vector_stub_no_error!(vector_stub_37, 37);
vector_stub_no_error!(vector_stub_38, 38);
vector_stub_no_error!(vector_stub_39, 39);
vector_stub_no_error!(vector_stub_40, 40);
vector_stub_no_error!(vector_stub_41, 41);
vector_stub_no_error!(vector_stub_42, 42);
vector_stub_no_error!(vector_stub_43, 43);
vector_stub_no_error!(vector_stub_44, 44);
vector_stub_no_error!(vector_stub_45, 45);
vector_stub_no_error!(vector_stub_46, 46);
vector_stub_no_error!(vector_stub_47, 47);

// Shared entry for vectors 48-255. The CPU pushes no error code for
// any of them, so the stub must push the synthetic zero itself; the
// general-protection vector number then routes the uniform frame to a
// controlled panic instead of reusing vector 13's with-error stub and
// consuming the iretq frame one slot off.
vector_stub_no_error!(vector_stub_spurious, 13);

extern "C" {
    fn vector_stub_0();
    fn vector_stub_1();
    fn vector_stub_2();
    fn vector_stub_3();
    fn vector_stub_4();
    fn vector_stub_5();
    fn vector_stub_6();
    fn vector_stub_7();
    fn vector_stub_8();
    fn vector_stub_9();
    fn vector_stub_10();
    fn vector_stub_11();
    fn vector_stub_12();
    fn vector_stub_13();
    fn vector_stub_14();
    fn vector_stub_15();
    fn vector_stub_16();
    fn vector_stub_17();
    fn vector_stub_18();
    fn vector_stub_19();
    fn vector_stub_20();
    fn vector_stub_21();
    fn vector_stub_22();
    fn vector_stub_23();
    fn vector_stub_24();
    fn vector_stub_25();
    fn vector_stub_26();
    fn vector_stub_27();
    fn vector_stub_28();
    fn vector_stub_29();
    fn vector_stub_30();
    fn vector_stub_31();
    fn vector_stub_32();
    fn vector_stub_33();
    fn vector_stub_34();
    fn vector_stub_35();
    fn vector_stub_36();
    fn vector_stub_37();
    fn vector_stub_38();
    fn vector_stub_39();
    fn vector_stub_40();
    fn vector_stub_41();
    fn vector_stub_42();
    fn vector_stub_43();
    fn vector_stub_44();
    fn vector_stub_45();
    fn vector_stub_46();
    fn vector_stub_47();
    fn vector_stub_spurious();
}

/// Number of vectors with their own stub; everything above routes to
/// the shared spurious stub.
pub const STUB_COUNT: usize = 48;

/// Entry address for vectors 48-255: pushes the synthetic zero and the
/// general-protection vector number, keeping the frame shape uniform
/// with every other vector the CPU supplies no error code for.
pub fn spurious_stub() -> u64 {
    vector_stub_spurious as u64
}

/// Entry addresses for vectors 0..48, indexed by vector number.
pub fn stub_table() -> [u64; STUB_COUNT] {
    [
        vector_stub_0 as u64,
        vector_stub_1 as u64,
        vector_stub_2 as u64,
        vector_stub_3 as u64,
        vector_stub_4 as u64,
        vector_stub_5 as u64,
        vector_stub_6 as u64,
        vector_stub_7 as u64,
        vector_stub_8 as u64,
        vector_stub_9 as u64,
        vector_stub_10 as u64,
        vector_stub_11 as u64,
        vector_stub_12 as u64,
        vector_stub_13 as u64,
        vector_stub_14 as u64,
        vector_stub_15 as u64,
        vector_stub_16 as u64,
        vector_stub_17 as u64,
        vector_stub_18 as u64,
        vector_stub_19 as u64,
        vector_stub_20 as u64,
        vector_stub_21 as u64,
        vector_stub_22 as u64,
        vector_stub_23 as u64,
        vector_stub_24 as u64,
        vector_stub_25 as u64,
        vector_stub_26 as u64,
        vector_stub_27 as u64,
        vector_stub_28 as u64,
        vector_stub_29 as u64,
        vector_stub_30 as u64,
        vector_stub_31 as u64,
        vector_stub_32 as u64,
        vector_stub_33 as u64,
        vector_stub_34 as u64,
        vector_stub_35 as u64,
        vector_stub_36 as u64,
        vector_stub_37 as u64,
        vector_stub_38 as u64,
        vector_stub_39 as u64,
        vector_stub_40 as u64,
        vector_stub_41 as u64,
        vector_stub_42 as u64,
        vector_stub_43 as u64,
        vector_stub_44 as u64,
        vector_stub_45 as u64,
        vector_stub_46 as u64,
        vector_stub_47 as u64,
    ]
}

const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// Total CPU exceptions observed since boot.
static EXCEPTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Per-line IRQ counters, indexed by legacy IRQ number 0..15.
static IRQ_COUNTS: [AtomicU64; 16] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Last page-fault address already reported; repeated faults on the same
/// address are not logged again.
static LAST_REPORTED_FAULT: AtomicU64 = AtomicU64::new(u64::MAX);

/// IRQ lines beyond timer/keyboard log only this many occurrences.
const UNKNOWN_IRQ_LOG_LIMIT: u64 = 3;

pub fn exception_count() -> u64 {
    EXCEPTION_COUNT.load(Ordering::Relaxed)
}

pub fn irq_count(irq: usize) -> u64 {
    IRQ_COUNTS[irq].load(Ordering::Relaxed)
}

/// Called from the common trampoline with a pointer to the saved frame.
/// Returns the frame to restore; the scheduler rewrites it in place on a
/// timer tick, so the pointer itself is returned unchanged.
#[no_mangle]
extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) -> *mut InterruptFrame {
    // SAFETY: the trampoline passes a pointer to the frame it just laid
    // out on the interrupt stack; it stays valid until iretq.
    let frame = unsafe { &mut *frame };
    if frame.vector < 32 {
        exception_handler(frame);
    } else {
        irq_handler(frame);
    }
    frame as *mut InterruptFrame
}

fn exception_handler(frame: &mut InterruptFrame) {
    EXCEPTION_COUNT.fetch_add(1, Ordering::Relaxed);

    if frame.vector == 14 {
        let fault_address = arch::read_cr2();
        if paging::handle_page_fault(fault_address, frame.error_code) {
            // Demand mapping succeeded; resume the faulting instruction.
            return;
        }
        if LAST_REPORTED_FAULT.swap(fault_address, Ordering::Relaxed) != fault_address {
            serial_println!(
                "unhandled page fault at {:#x} (error code {:#x})",
                fault_address,
                frame.error_code
            );
            frame.log();
        }
        panic!("unhandled page fault at {:#x}", fault_address);
    }

    let name = EXCEPTION_NAMES[frame.vector as usize];
    serial_println!(
        "EXCEPTION {} ({}), error code {:#x}",
        frame.vector,
        name,
        frame.error_code
    );
    frame.log();
    panic!("CPU exception: {}", name);
}

fn irq_handler(frame: &mut InterruptFrame) {
    let irq = (frame.vector - 32) as usize;
    IRQ_COUNTS[irq].fetch_add(1, Ordering::Relaxed);

    match irq {
        0 => pit::tick(frame),
        1 => {
            // SAFETY: the keyboard data port is only read here, in IRQ
            // context, which the PIC serializes per line.
            let scancode = unsafe { arch::in8(0x60) };
            crate::keyboard::handle_scancode(scancode);
        }
        _ => {
            if IRQ_COUNTS[irq].load(Ordering::Relaxed) <= UNKNOWN_IRQ_LOG_LIMIT {
                serial_println!("unexpected IRQ {}", irq);
            }
        }
    }

    // EOI on every path, even if the driver above misbehaved; a swallowed
    // EOI wedges the whole line.
    pic::eoi(irq as u8);
}
