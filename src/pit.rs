// Programmable Interval Timer (8253/8254) driver. Channel 0 runs as a
// rate generator and drives the scheduler tick.

use crate::interrupts::InterruptFrame;
use crate::task;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use x86_64::instructions::port::Port;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
const PIT_RATE_GENERATOR: u8 = 0x34;

/// Input clock of the PIT in Hz.
const PIT_BASE_HZ: u32 = 1_193_182;

/// Tick frequency used unless the caller asks for something else.
pub const DEFAULT_FREQUENCY_HZ: u32 = 100;

/// Monotonic tick count since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Frequency the channel was programmed with (for uptime conversion).
static FREQUENCY_HZ: AtomicU32 = AtomicU32::new(DEFAULT_FREQUENCY_HZ);

/// Program channel 0 for periodic interrupts at `frequency_hz`.
///
/// # Safety
/// Reprograms the timer hardware; call once during boot.
pub unsafe fn init(frequency_hz: u32) {
    let frequency = frequency_hz.max(19); // divisor must fit in 16 bits
    let divisor = (PIT_BASE_HZ / frequency).clamp(1, 65535) as u16;
    FREQUENCY_HZ.store(frequency, Ordering::Relaxed);

    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);
    command.write(PIT_RATE_GENERATOR);
    channel0.write((divisor & 0xFF) as u8);
    channel0.write((divisor >> 8) as u8);
}

/// Hardware tick entry, called by the IRQ dispatcher: bump the monotonic
/// counter, then let the scheduler preempt.
pub fn tick(frame: &mut InterruptFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    task::scheduler_tick(frame);
}

pub fn uptime_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn uptime_seconds() -> u64 {
    let frequency = FREQUENCY_HZ.load(Ordering::Relaxed).max(1) as u64;
    TICKS.load(Ordering::Relaxed) / frequency
}
