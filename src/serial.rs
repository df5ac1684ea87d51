// Serial log sink on COM1. Kernel-internal diagnostics go here so they
// survive even when the VGA console is scrolled away or broken.

use crate::arch;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        SerialPort { base }
    }

    /// 9600 baud, 8 data bits, no parity, one stop bit.
    pub fn init(&self) {
        unsafe {
            // Interrupts off while we reprogram the line.
            arch::out8(self.base + 1, 0x00);

            // DLAB on, divisor 12 (115200 / 9600), DLAB off with 8N1.
            arch::out8(self.base + 3, 0x80);
            arch::out8(self.base, 0x0C);
            arch::out8(self.base + 1, 0x00);
            arch::out8(self.base + 3, 0x03);

            // FIFO on, cleared, 14-byte threshold.
            arch::out8(self.base + 2, 0xC7);

            // RTS/DSR set.
            arch::out8(self.base + 4, 0x0B);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { arch::in8(self.base + 5) & 0x20 != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe {
            arch::out8(self.base, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let serial = SerialPort::new(COM1);
        serial.init();
        Mutex::new(serial)
    };
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    // The sink is shared with IRQ-context logging; holding the lock with
    // interrupts enabled would deadlock on a uniprocessor.
    arch::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Hosted builds have no COM1 to write to; the log sink is inert there.
#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _serial_print(args: fmt::Arguments) {
    let _ = args;
}
