//! Descriptor-table layout tests: segment and gate encodings, selector
//! constants, IST assignments, error-code vector classification and the
//! interrupt-frame ABI offsets.

use boxos::gdt::{
    GdtEntry, SystemSegmentDescriptor, IST_DEBUG, IST_DOUBLE_FAULT, IST_MACHINE_CHECK, IST_NMI,
    IST_STACK_SIZE, KERNEL_CODE_ACCESS, KERNEL_CODE_FLAGS, KERNEL_CODE_SELECTOR,
    KERNEL_DATA_ACCESS, KERNEL_DATA_FLAGS, KERNEL_DATA_SELECTOR, TSS_SELECTOR, USER_CODE_ACCESS,
    USER_CODE_FLAGS, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use boxos::idt::{ist_for_vector, IdtEntry, IDT_LIMIT, INTERRUPT_GATE};
use boxos::interrupts::{pushes_error_code, InterruptFrame};
use core::mem::{offset_of, size_of};

#[test]
fn selector_layout_matches_the_loader_contract() {
    assert_eq!(KERNEL_CODE_SELECTOR, 0x08);
    assert_eq!(KERNEL_DATA_SELECTOR, 0x10);
    assert_eq!(USER_CODE_SELECTOR, 0x18 | 3);
    assert_eq!(USER_DATA_SELECTOR, 0x20 | 3);
    assert_eq!(TSS_SELECTOR, 0x28);
}

#[test]
fn segment_descriptor_encodings() {
    // The classic long-mode flat segments, byte for byte.
    let kernel_code = GdtEntry::new(0, 0xFFFFF, KERNEL_CODE_ACCESS, KERNEL_CODE_FLAGS);
    assert_eq!(kernel_code.encoded(), 0x00AF_9A00_0000_FFFF);

    let kernel_data = GdtEntry::new(0, 0xFFFFF, KERNEL_DATA_ACCESS, KERNEL_DATA_FLAGS);
    assert_eq!(kernel_data.encoded(), 0x00CF_9200_0000_FFFF);

    let user_code = GdtEntry::new(0, 0xFFFFF, USER_CODE_ACCESS, USER_CODE_FLAGS);
    assert_eq!(user_code.encoded(), 0x00AF_FA00_0000_FFFF);

    assert_eq!(GdtEntry::null().encoded(), 0);
}

#[test]
fn tss_descriptor_splits_the_64_bit_base() {
    let descriptor = SystemSegmentDescriptor::new_tss(0xFFFF_FFFF_1234_5000, 0x67);
    // Low half: limit, base[0..24], access 0x89 (present 64-bit TSS),
    // base[24..32].
    assert_eq!(descriptor.encoded_low(), 0x1200_8934_5000_0067);
    // High half: base[32..64].
    assert_eq!(descriptor.encoded_high(), 0xFFFF_FFFF);

    let zero_based = SystemSegmentDescriptor::new_tss(0, 0x67);
    assert_eq!(zero_based.encoded_low(), 0x0000_8900_0000_0067);
    assert_eq!(zero_based.encoded_high(), 0);
}

#[test]
fn idt_gate_encoding_round_trips() {
    let handler = 0xFFFF_8000_1234_5678u64;
    let entry = IdtEntry::new(handler, KERNEL_CODE_SELECTOR, 3, INTERRUPT_GATE);
    assert_eq!(entry.handler(), handler);
    assert_eq!(entry.selector(), KERNEL_CODE_SELECTOR);
    assert_eq!(entry.ist_index(), 3);
    assert_eq!(entry.attributes(), 0x8E);

    // The IST field is 3 bits on the wire.
    let clamped = IdtEntry::new(0, KERNEL_CODE_SELECTOR, 0xFF, INTERRUPT_GATE);
    assert_eq!(clamped.ist_index(), 7);

    assert_eq!(size_of::<IdtEntry>(), 16);
    assert_eq!(IDT_LIMIT, 256 * 16 - 1);
}

#[test]
fn critical_vectors_get_dedicated_ist_stacks() {
    assert_eq!(ist_for_vector(8), IST_DOUBLE_FAULT);
    assert_eq!(ist_for_vector(2), IST_NMI);
    assert_eq!(ist_for_vector(18), IST_MACHINE_CHECK);
    assert_eq!(ist_for_vector(1), IST_DEBUG);

    // Everything else, including page faults and IRQs, stays on the
    // interrupted stack.
    for vector in [0u8, 3, 6, 13, 14, 32, 33, 47, 255] {
        assert_eq!(ist_for_vector(vector), 0, "vector {}", vector);
    }

    // ist5..ist7 are never assigned.
    for vector in 0..=255u8 {
        assert!(ist_for_vector(vector) <= 4, "vector {}", vector);
    }

    assert!(IST_STACK_SIZE >= 4096);
    assert_eq!(IST_STACK_SIZE % 16, 0);
}

#[test]
fn error_code_vector_classification() {
    let with_error = [8u8, 10, 11, 12, 13, 14, 17, 30];
    for vector in 0..=255u8 {
        assert_eq!(
            pushes_error_code(vector),
            with_error.contains(&vector),
            "vector {}",
            vector
        );
    }
}

/// The trampoline writes this exact layout; the offsets are ABI.
#[test]
fn interrupt_frame_abi_offsets() {
    assert_eq!(size_of::<InterruptFrame>(), 22 * 8);

    // 15 general registers, push order rax..r15 (so r15 sits lowest).
    assert_eq!(offset_of!(InterruptFrame, r15), 0);
    assert_eq!(offset_of!(InterruptFrame, r8), 56);
    assert_eq!(offset_of!(InterruptFrame, rdi), 64);
    assert_eq!(offset_of!(InterruptFrame, rsi), 72);
    assert_eq!(offset_of!(InterruptFrame, rbp), 80);
    assert_eq!(offset_of!(InterruptFrame, rax), 112);

    // The synthesized pair.
    assert_eq!(offset_of!(InterruptFrame, vector), 120);
    assert_eq!(offset_of!(InterruptFrame, error_code), 128);

    // The five CPU-pushed words.
    assert_eq!(offset_of!(InterruptFrame, rip), 136);
    assert_eq!(offset_of!(InterruptFrame, cs), 144);
    assert_eq!(offset_of!(InterruptFrame, rflags), 152);
    assert_eq!(offset_of!(InterruptFrame, rsp), 160);
    assert_eq!(offset_of!(InterruptFrame, ss), 168);
}
