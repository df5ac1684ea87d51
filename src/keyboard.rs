// PS/2 keyboard driver: scancode set 1 translation feeding a spinlocked
// ring buffer. The producer is the IRQ handler; the consumer is the
// shell task, which drains it through getchar.

use crate::arch;
use spin::Mutex;

/// PS/2 keyboard scancode set 1 (scan code to ASCII translation)
/// Index is the scancode, value is the ASCII character (0 means no printable char)
static SCANCODE_TO_ASCII: [u8; 128] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8,   // 0x00-0x0E
    b'\t', b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', // 0x0F-0x1C
    0, b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`',          // 0x1D-0x29
    0, b'\\', b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/', 0, b'*',       // 0x2A-0x37
    0, b' ', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x38-0x46
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x47-0x56
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x57-0x66
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x67-0x76
    0, 0, 0, 0, 0, 0, 0, 0, 0,                                                            // 0x77-0x7F
];

/// Shifted scancode to ASCII translation (for when Shift is held)
static SCANCODE_TO_ASCII_SHIFT: [u8; 128] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8,   // 0x00-0x0E
    b'\t', b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', // 0x0F-0x1C
    0, b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~',          // 0x1D-0x29
    0, b'|', b'Z', b'X', b'C', b'V', b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*',       // 0x2A-0x37
    0, b' ', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x38-0x46
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x47-0x56
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x57-0x66
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,                                       // 0x67-0x76
    0, 0, 0, 0, 0, 0, 0, 0, 0,                                                            // 0x77-0x7F
];

const SCANCODE_RELEASE_BIT: u8 = 0x80;
const SCANCODE_EXTENDED_PREFIX: u8 = 0xE0;
const SCANCODE_LEFT_SHIFT: u8 = 0x2A;
const SCANCODE_RIGHT_SHIFT: u8 = 0x36;
const SCANCODE_CAPS_LOCK: u8 = 0x3A;

/// Ring capacity; must stay a power of two for the index mask.
const BUFFER_SIZE: usize = 256;
const BUFFER_MASK: usize = BUFFER_SIZE - 1;

/// Power-of-two ring with head/tail indices. `head == tail` is empty,
/// `(head + 1) % N == tail` is full; a full ring drops new input rather
/// than overwrite unread bytes.
pub struct InputRing {
    buffer: [u8; BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl InputRing {
    pub const fn new() -> Self {
        InputRing {
            buffer: [0; BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn push(&mut self, byte: u8) -> bool {
        if (self.head + 1) & BUFFER_MASK == self.tail {
            return false;
        }
        self.buffer[self.head] = byte;
        self.head = (self.head + 1) & BUFFER_MASK;
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.tail == self.head {
            return None;
        }
        let byte = self.buffer[self.tail];
        self.tail = (self.tail + 1) & BUFFER_MASK;
        Some(byte)
    }

    pub fn has_input(&self) -> bool {
        self.tail != self.head
    }

    pub fn clear(&mut self) {
        self.tail = self.head;
    }
}

/// Modifier tracking for the translation step.
struct Translator {
    left_shift: bool,
    right_shift: bool,
    caps_lock: bool,
    /// An 0xE0 prefix arrived; the next scancode belongs to the extended
    /// set and produces no ASCII.
    extended_pending: bool,
}

impl Translator {
    const fn new() -> Self {
        Translator {
            left_shift: false,
            right_shift: false,
            caps_lock: false,
            extended_pending: false,
        }
    }

    fn shift_pressed(&self) -> bool {
        self.left_shift || self.right_shift
    }

    /// Feed one raw scancode; returns the ASCII byte it produces, if any.
    fn translate(&mut self, scancode: u8) -> Option<u8> {
        if scancode == SCANCODE_EXTENDED_PREFIX {
            self.extended_pending = true;
            return None;
        }
        if self.extended_pending {
            // Arrow keys, right ctrl/alt and friends; not line input.
            self.extended_pending = false;
            return None;
        }

        let released = scancode & SCANCODE_RELEASE_BIT != 0;
        let code = scancode & !SCANCODE_RELEASE_BIT;

        match code {
            SCANCODE_LEFT_SHIFT => {
                self.left_shift = !released;
                return None;
            }
            SCANCODE_RIGHT_SHIFT => {
                self.right_shift = !released;
                return None;
            }
            SCANCODE_CAPS_LOCK => {
                if !released {
                    self.caps_lock = !self.caps_lock;
                }
                return None;
            }
            _ => {}
        }

        if released {
            return None;
        }

        let ascii = if self.shift_pressed() {
            SCANCODE_TO_ASCII_SHIFT[code as usize]
        } else {
            SCANCODE_TO_ASCII[code as usize]
        };
        if ascii == 0 {
            return None;
        }

        // Caps lock inverts the case of letters only.
        if ascii.is_ascii_alphabetic() && self.caps_lock {
            if self.shift_pressed() {
                Some(ascii.to_ascii_lowercase())
            } else {
                Some(ascii.to_ascii_uppercase())
            }
        } else {
            Some(ascii)
        }
    }
}

static TRANSLATOR: Mutex<Translator> = Mutex::new(Translator::new());

/// One spinlock as promised: the IRQ handler produces into it, tasks
/// consume from it (with interrupts off while the lock is held).
static INPUT: Mutex<InputRing> = Mutex::new(InputRing::new());

/// Translate a scancode and queue the resulting ASCII byte. Runs in IRQ
/// context; also the test entry point for scenario-level input.
pub fn handle_scancode(scancode: u8) {
    let ascii = TRANSLATOR.lock().translate(scancode);
    if let Some(byte) = ascii {
        // A full ring drops the byte; overwriting unread input would be
        // worse than losing a keystroke.
        let _ = INPUT.lock().push(byte);
    }
}

/// Non-blocking read: the next buffered byte, or NUL when idle.
pub fn getchar() -> u8 {
    arch::without_interrupts(|| INPUT.lock().pop().unwrap_or(0))
}

pub fn has_input() -> bool {
    arch::without_interrupts(|| INPUT.lock().has_input())
}

pub fn flush() {
    arch::without_interrupts(|| INPUT.lock().clear());
}

/// Blocking read used by the shell: halt until an interrupt delivers
/// input.
pub fn read_char_blocking() -> u8 {
    loop {
        let byte = getchar();
        if byte != 0 {
            return byte;
        }
        arch::hlt();
    }
}
