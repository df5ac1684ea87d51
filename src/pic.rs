// Cascaded 8259A interrupt controller driver. Remaps the legacy IRQs to
// vectors 32-47, keeps a cached copy of both mask bytes, and exposes
// enable/disable/EOI with slave-cascade handling.

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// ICW1: edge triggered, cascade mode, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;
/// OCW2: non-specific end of interrupt.
const EOI: u8 = 0x20;

/// The IRQ line the slave controller cascades through on the master.
const CASCADE_IRQ: u8 = 2;

struct Pic {
    offset: u8,
    command: Port<u8>,
    data: Port<u8>,
    /// Cached mask byte; 1 = line masked.
    mask: u8,
}

impl Pic {
    const fn new(offset: u8, command_port: u16, data_port: u16) -> Self {
        Pic {
            offset,
            command: Port::new(command_port),
            data: Port::new(data_port),
            mask: 0xFF,
        }
    }
}

/// Both controllers plus their cached masks.
pub struct ChainedPics {
    master: Pic,
    slave: Pic,
}

impl ChainedPics {
    pub const fn new(master_offset: u8, slave_offset: u8) -> Self {
        ChainedPics {
            master: Pic::new(master_offset, MASTER_COMMAND, MASTER_DATA),
            slave: Pic::new(slave_offset, SLAVE_COMMAND, SLAVE_DATA),
        }
    }

    /// Run the ICW1..ICW4 init sequence on both chips, remapping IRQ 0-7
    /// to the master offset and 8-15 to the slave offset, then mask every
    /// line.
    ///
    /// # Safety
    /// Reprograms live interrupt-controller hardware; must run with
    /// interrupts disabled.
    pub unsafe fn initialize(&mut self) {
        // ICW1: begin initialization on both chips.
        self.master.command.write(ICW1_INIT);
        crate::arch::io_wait();
        self.slave.command.write(ICW1_INIT);
        crate::arch::io_wait();

        // ICW2: vector offsets.
        self.master.data.write(self.master.offset);
        crate::arch::io_wait();
        self.slave.data.write(self.slave.offset);
        crate::arch::io_wait();

        // ICW3: master has a slave on IRQ2; slave has cascade identity 2.
        self.master.data.write(1 << CASCADE_IRQ);
        crate::arch::io_wait();
        self.slave.data.write(CASCADE_IRQ);
        crate::arch::io_wait();

        // ICW4: 8086 mode.
        self.master.data.write(ICW4_8086);
        crate::arch::io_wait();
        self.slave.data.write(ICW4_8086);
        crate::arch::io_wait();

        // Mask everything; drivers unmask their own line.
        self.master.mask = 0xFF;
        self.slave.mask = 0xFF;
        self.master.data.write(self.master.mask);
        self.slave.data.write(self.slave.mask);
    }

    /// Unmask an IRQ line. Slave lines also unmask the cascade line on
    /// the master, otherwise they can never be delivered.
    pub fn enable(&mut self, irq: u8) {
        if irq < 8 {
            self.master.mask &= !(1 << irq);
            unsafe { self.master.data.write(self.master.mask) };
        } else {
            self.slave.mask &= !(1 << (irq - 8));
            self.master.mask &= !(1 << CASCADE_IRQ);
            unsafe {
                self.slave.data.write(self.slave.mask);
                self.master.data.write(self.master.mask);
            }
        }
    }

    /// Mask an IRQ line.
    pub fn disable(&mut self, irq: u8) {
        if irq < 8 {
            self.master.mask |= 1 << irq;
            unsafe { self.master.data.write(self.master.mask) };
        } else {
            self.slave.mask |= 1 << (irq - 8);
            unsafe { self.slave.data.write(self.slave.mask) };
        }
    }

    /// Acknowledge an interrupt. Slave IRQs need the EOI on both chips.
    pub fn end_of_interrupt(&mut self, irq: u8) {
        unsafe {
            if irq >= 8 {
                self.slave.command.write(EOI);
            }
            self.master.command.write(EOI);
        }
    }

    /// Cached (master, slave) mask bytes.
    pub fn masks(&self) -> (u8, u8) {
        (self.master.mask, self.slave.mask)
    }
}

lazy_static! {
    pub static ref PICS: Mutex<ChainedPics> =
        Mutex::new(ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET));
}

/// Remap both controllers and unmask the timer and keyboard lines.
///
/// # Safety
/// Must run once during boot with interrupts disabled, after the IDT is
/// loaded.
pub unsafe fn init() {
    let mut pics = PICS.lock();
    pics.initialize();
    pics.enable(0); // PIT
    pics.enable(1); // keyboard
}

/// EOI helper for the IRQ dispatcher. Task-context callers of
/// enable/disable must hold the lock with interrupts off; the dispatcher
/// itself runs with them off already.
pub fn eoi(irq: u8) {
    PICS.lock().end_of_interrupt(irq);
}
