// VGA text-mode console: 80x25 cells at 0xB8000, 16 colours. The shell
// and the panic banner render here; everything else logs to serial.

use core::fmt;
use core::ptr::NonNull;
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::VolatilePtr;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_TEXT_BASE: usize = 0xB8000;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> Self {
        ColorCode((background as u8) << 4 | (foreground as u8))
    }
}

/// One character cell: ASCII byte plus colour attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii: u8,
    color: ColorCode,
}

pub struct Writer {
    column: usize,
    color: ColorCode,
    buffer: *mut ScreenChar,
}

// SAFETY: the raw buffer pointer targets the process-wide VGA aperture;
// the surrounding Mutex serializes all access.
unsafe impl Send for Writer {}

impl Writer {
    const fn new(buffer: *mut ScreenChar) -> Self {
        Writer {
            column: 0,
            color: ColorCode::new(Color::LightGray, Color::Black),
            buffer,
        }
    }

    pub fn set_color(&mut self, color: ColorCode) {
        self.color = color;
    }

    fn write_cell(&mut self, row: usize, col: usize, cell: ScreenChar) {
        let ptr = unsafe { self.buffer.add(row * BUFFER_WIDTH + col) };
        let cell_ptr = unsafe { VolatilePtr::new(NonNull::new_unchecked(ptr)) };
        cell_ptr.write(cell);
    }

    fn read_cell(&self, row: usize, col: usize) -> ScreenChar {
        let ptr = unsafe { self.buffer.add(row * BUFFER_WIDTH + col) };
        let cell_ptr = unsafe { VolatilePtr::new(NonNull::new_unchecked(ptr)) };
        cell_ptr.read()
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            0x08 => self.backspace(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let cell = ScreenChar {
                    ascii: byte,
                    color: self.color,
                };
                self.write_cell(BUFFER_HEIGHT - 1, self.column, cell);
                self.column += 1;
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7E | b'\n' | 0x08 => self.write_byte(byte),
                // Not printable in code page 437's ASCII range.
                _ => self.write_byte(0xFE),
            }
        }
    }

    /// Erase the character left of the cursor (shell line editing).
    pub fn backspace(&mut self) {
        if self.column > 0 {
            self.column -= 1;
            let blank = ScreenChar {
                ascii: b' ',
                color: self.color,
            };
            self.write_cell(BUFFER_HEIGHT - 1, self.column, blank);
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.read_cell(row, col);
                self.write_cell(row - 1, col, cell);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii: b' ',
            color: self.color,
        };
        for col in 0..BUFFER_WIDTH {
            self.write_cell(row, col, blank);
        }
    }

    pub fn clear_screen(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column = 0;
        self.update_cursor();
    }

    /// Move the hardware cursor to the current column on the input row.
    fn update_cursor(&self) {
        #[cfg(target_os = "none")]
        {
            let position = ((BUFFER_HEIGHT - 1) * BUFFER_WIDTH + self.column) as u16;
            // CRT controller registers 14/15 hold the cursor location.
            unsafe {
                crate::arch::out8(0x3D4, 14);
                crate::arch::out8(0x3D5, (position >> 8) as u8);
                crate::arch::out8(0x3D4, 15);
                crate::arch::out8(0x3D5, (position & 0xFF) as u8);
            }
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> =
        Mutex::new(Writer::new(VGA_TEXT_BASE as *mut ScreenChar));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::vga::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)))
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    crate::arch::without_interrupts(|| {
        let mut writer = WRITER.lock();
        let _ = writer.write_fmt(args);
        writer.update_cursor();
    });
}

/// Print one line in the given colour, restoring the default afterwards.
/// The shell uses this for its error messages and the panic path for its
/// banner.
pub fn print_colored(args: fmt::Arguments, color: ColorCode) {
    use core::fmt::Write;
    crate::arch::without_interrupts(|| {
        let mut writer = WRITER.lock();
        writer.set_color(color);
        let _ = writer.write_fmt(args);
        writer.set_color(ColorCode::new(Color::LightGray, Color::Black));
    });
}
