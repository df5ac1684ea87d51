// ATA PIO driver for the primary bus (ports 0x1F0-0x1F7, control 0x3F6).
// 28-bit LBA reads and writes, IDENTIFY at startup with floating-bus
// detection, bounded busy-waits as the only timeout primitive, and ERROR
// register decoding. The sector interface is a trait so the retry
// wrapper and the 4-KiB block layer can be exercised against mock
// devices.

use crate::serial_println;
use x86_64::instructions::port::Port;

pub const SECTOR_SIZE: usize = 512;
const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 2;

/// Largest transfer one command can carry; 256 is encoded as 0 on the
/// wire.
pub const MAX_SECTORS_PER_COMMAND: usize = 256;

/// 28-bit LBA ceiling.
const LBA28_LIMIT: u32 = 0x0FFF_FFFF;

const PRIMARY_IO_BASE: u16 = 0x1F0;
const PRIMARY_CONTROL: u16 = 0x3F6;

// Task-file register offsets from the I/O base.
const REG_DATA: u16 = 0;
const REG_ERROR: u16 = 1;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DRIVE_HEAD: u16 = 6;
const REG_STATUS_COMMAND: u16 = 7;

// Commands.
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

// Status register bits.
const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DF: u8 = 1 << 5;
const STATUS_BSY: u8 = 1 << 7;

/// Drive/head byte: master, LBA mode, bits 5 and 7 always set.
const DRIVE_MASTER_LBA: u8 = 0xE0;

/// Control register: software reset bit.
const CONTROL_SRST: u8 = 1 << 2;

// ERROR register bits, decoded after a failed command.
const ERR_AMNF: u8 = 1 << 0;
const ERR_TK0NF: u8 = 1 << 1;
const ERR_ABRT: u8 = 1 << 2;
const ERR_MCR: u8 = 1 << 3;
const ERR_IDNF: u8 = 1 << 4;
const ERR_MC: u8 = 1 << 5;
const ERR_UNC: u8 = 1 << 6;
const ERR_BBK: u8 = 1 << 7;

/// Spin budget for BSY/DRQ waits; expiring it is the driver's only
/// timeout.
const WAIT_BUDGET: u32 = 1_000_000;

/// Retries attempted per sector transfer before giving up.
pub const IO_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaError {
    /// BSY or DRQ never settled within the wait budget.
    Timeout,
    /// Floating bus or failed IDENTIFY: nothing is attached.
    NoDevice,
    /// LBA beyond the 28-bit limit.
    LbaOutOfRange,
    /// More than 256 sectors requested in one command.
    TooManySectors,
    /// Caller's buffer does not match the transfer size.
    BufferSize,
    /// DF set without error details.
    DeviceFault,
    /// Decoded ERROR register contents.
    AddressMarkNotFound,
    TrackZeroNotFound,
    Aborted,
    MediaChangeRequest,
    IdNotFound,
    MediaChanged,
    UncorrectableData,
    BadBlock,
    /// ERR set but no known bit; carries the raw register.
    Unknown(u8),
}

impl core::fmt::Display for AtaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AtaError::Timeout => f.write_str("command timed out"),
            AtaError::NoDevice => f.write_str("no ATA device present"),
            AtaError::LbaOutOfRange => f.write_str("LBA beyond 28-bit range"),
            AtaError::TooManySectors => f.write_str("more than 256 sectors requested"),
            AtaError::BufferSize => f.write_str("buffer does not match transfer size"),
            AtaError::DeviceFault => f.write_str("device fault"),
            AtaError::AddressMarkNotFound => f.write_str("address mark not found"),
            AtaError::TrackZeroNotFound => f.write_str("track 0 not found"),
            AtaError::Aborted => f.write_str("command aborted"),
            AtaError::MediaChangeRequest => f.write_str("media change requested"),
            AtaError::IdNotFound => f.write_str("sector id not found"),
            AtaError::MediaChanged => f.write_str("media changed"),
            AtaError::UncorrectableData => f.write_str("uncorrectable data error"),
            AtaError::BadBlock => f.write_str("bad block mark"),
            AtaError::Unknown(raw) => write!(f, "unknown device error {:#04x}", raw),
        }
    }
}

/// Map the ERROR register to the most severe condition it reports.
pub fn decode_error(raw: u8) -> AtaError {
    if raw & ERR_BBK != 0 {
        AtaError::BadBlock
    } else if raw & ERR_UNC != 0 {
        AtaError::UncorrectableData
    } else if raw & ERR_MC != 0 {
        AtaError::MediaChanged
    } else if raw & ERR_IDNF != 0 {
        AtaError::IdNotFound
    } else if raw & ERR_MCR != 0 {
        AtaError::MediaChangeRequest
    } else if raw & ERR_ABRT != 0 {
        AtaError::Aborted
    } else if raw & ERR_TK0NF != 0 {
        AtaError::TrackZeroNotFound
    } else if raw & ERR_AMNF != 0 {
        AtaError::AddressMarkNotFound
    } else {
        AtaError::Unknown(raw)
    }
}

/// Validate the addressing of one command against LBA28 and the
/// per-command sector limit.
pub fn validate_transfer(lba: u32, count: usize) -> Result<(), AtaError> {
    if count == 0 || count > MAX_SECTORS_PER_COMMAND {
        return Err(AtaError::TooManySectors);
    }
    if lba > LBA28_LIMIT || LBA28_LIMIT - lba < count as u32 - 1 {
        return Err(AtaError::LbaOutOfRange);
    }
    Ok(())
}

/// Device identity as parsed out of the 256-word IDENTIFY block.
#[derive(Debug, Clone, Copy)]
pub struct IdentifyInfo {
    pub model: [u8; 40],
    pub serial: [u8; 20],
    pub firmware: [u8; 8],
    /// Total addressable sectors in LBA28 mode (words 60-61).
    pub total_sectors: u32,
}

impl IdentifyInfo {
    fn string_field(bytes: &[u8]) -> &str {
        core::str::from_utf8(bytes)
            .unwrap_or("")
            .trim_matches(|c: char| c == ' ' || c == '\0')
    }

    pub fn model_name(&self) -> &str {
        Self::string_field(&self.model)
    }

    pub fn serial_number(&self) -> &str {
        Self::string_field(&self.serial)
    }

    pub fn firmware_revision(&self) -> &str {
        Self::string_field(&self.firmware)
    }
}

/// IDENTIFY strings are stored byte-swapped per 16-bit word.
fn copy_identify_string(words: &[u16], dest: &mut [u8]) {
    for (i, word) in words.iter().enumerate() {
        dest[i * 2] = (word >> 8) as u8;
        dest[i * 2 + 1] = (word & 0xFF) as u8;
    }
}

/// Parse the fields we care about from a raw IDENTIFY block. Split out
/// of the port loop so it can be tested with a canned block.
pub fn parse_identify(words: &[u16; 256]) -> IdentifyInfo {
    let mut info = IdentifyInfo {
        model: [b' '; 40],
        serial: [b' '; 20],
        firmware: [b' '; 8],
        total_sectors: 0,
    };
    copy_identify_string(&words[10..20], &mut info.serial);
    copy_identify_string(&words[23..27], &mut info.firmware);
    copy_identify_string(&words[27..47], &mut info.model);
    info.total_sectors = words[60] as u32 | (words[61] as u32) << 16;
    info
}

/// Sector-granular disk interface. `AtaDisk` implements it over PIO
/// ports; tests implement it over memory.
pub trait SectorDevice {
    fn read_sectors(&mut self, lba: u32, count: usize, buffer: &mut [u8]) -> Result<(), AtaError>;
    fn write_sectors(&mut self, lba: u32, count: usize, buffer: &[u8]) -> Result<(), AtaError>;
    /// Total sectors the device exposes.
    fn sector_count(&self) -> u32;
}

/// The primary-master ATA disk.
pub struct AtaDisk {
    data: Port<u16>,
    error: Port<u8>,
    sector_count: Port<u8>,
    lba_low: Port<u8>,
    lba_mid: Port<u8>,
    lba_high: Port<u8>,
    drive_head: Port<u8>,
    status_command: Port<u8>,
    control: Port<u8>,
    total_sectors: u32,
}

impl AtaDisk {
    pub const fn primary() -> Self {
        AtaDisk {
            data: Port::new(PRIMARY_IO_BASE + REG_DATA),
            error: Port::new(PRIMARY_IO_BASE + REG_ERROR),
            sector_count: Port::new(PRIMARY_IO_BASE + REG_SECTOR_COUNT),
            lba_low: Port::new(PRIMARY_IO_BASE + REG_LBA_LOW),
            lba_mid: Port::new(PRIMARY_IO_BASE + REG_LBA_MID),
            lba_high: Port::new(PRIMARY_IO_BASE + REG_LBA_HIGH),
            drive_head: Port::new(PRIMARY_IO_BASE + REG_DRIVE_HEAD),
            status_command: Port::new(PRIMARY_IO_BASE + REG_STATUS_COMMAND),
            control: Port::new(PRIMARY_CONTROL),
            total_sectors: 0,
        }
    }

    fn read_status(&mut self) -> u8 {
        // SAFETY: reading the primary status register has no side effect
        // beyond clearing the pending-interrupt latch, which is ours.
        unsafe { self.status_command.read() }
    }

    /// ~400ns settle delay: four reads of the alternate status register.
    fn settle(&mut self) {
        for _ in 0..4 {
            // SAFETY: the control port read has no side effects.
            unsafe {
                self.control.read();
            }
        }
    }

    fn wait_not_busy(&mut self) -> Result<(), AtaError> {
        for _ in 0..WAIT_BUDGET {
            if self.read_status() & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::Timeout)
    }

    /// Wait until the device requests a data transfer, surfacing decoded
    /// device errors.
    fn wait_data_request(&mut self) -> Result<(), AtaError> {
        for _ in 0..WAIT_BUDGET {
            let status = self.read_status();
            if status & STATUS_ERR != 0 {
                // SAFETY: the error register is read-only.
                let raw = unsafe { self.error.read() };
                return Err(decode_error(raw));
            }
            if status & STATUS_DF != 0 {
                return Err(AtaError::DeviceFault);
            }
            if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(AtaError::Timeout)
    }

    /// Program the task-file registers and issue `command`.
    fn issue_command(&mut self, lba: u32, count: usize, command: u8) -> Result<(), AtaError> {
        validate_transfer(lba, count)?;
        self.wait_not_busy()?;
        // SAFETY: register writes follow the LBA28 command protocol for
        // the primary master; validate_transfer bounded the operands.
        unsafe {
            self.drive_head
                .write(DRIVE_MASTER_LBA | ((lba >> 24) as u8 & 0x0F));
            self.settle();
            self.sector_count.write((count % 256) as u8); // 256 encodes as 0
            self.lba_low.write(lba as u8);
            self.lba_mid.write((lba >> 8) as u8);
            self.lba_high.write((lba >> 16) as u8);
            self.status_command.write(command);
        }
        Ok(())
    }

    /// One-time software reset, then IDENTIFY the primary master. A
    /// floating bus (status 0x00/0xFF) or non-zero LBA mid/high after
    /// IDENTIFY means nothing usable is attached.
    pub fn init(&mut self) -> Result<IdentifyInfo, AtaError> {
        // Pulse SRST on the control register.
        // SAFETY: reset protocol on the primary control port.
        unsafe {
            self.control.write(CONTROL_SRST);
            self.settle();
            self.control.write(0);
        }
        self.settle();
        self.wait_not_busy()?;

        // SAFETY: IDENTIFY protocol; LBA/count registers must be zeroed
        // before the command byte.
        unsafe {
            self.drive_head.write(DRIVE_MASTER_LBA);
            self.settle();
            self.sector_count.write(0);
            self.lba_low.write(0);
            self.lba_mid.write(0);
            self.lba_high.write(0);
            self.status_command.write(CMD_IDENTIFY);
        }

        let status = self.read_status();
        if status == 0x00 || status == 0xFF {
            return Err(AtaError::NoDevice);
        }
        self.wait_not_busy()?;

        // ATAPI and SATA devices report a signature here instead.
        // SAFETY: signature registers are read-only at this point.
        let (mid, high) = unsafe { (self.lba_mid.read(), self.lba_high.read()) };
        if mid != 0 || high != 0 {
            return Err(AtaError::NoDevice);
        }

        self.wait_data_request()?;
        let mut words = [0u16; 256];
        for word in words.iter_mut() {
            // SAFETY: DRQ is set; the device expects 256 data-port reads.
            *word = unsafe { self.data.read() };
        }

        let info = parse_identify(&words);
        self.total_sectors = info.total_sectors;
        Ok(info)
    }
}

impl SectorDevice for AtaDisk {
    fn read_sectors(&mut self, lba: u32, count: usize, buffer: &mut [u8]) -> Result<(), AtaError> {
        if buffer.len() != count * SECTOR_SIZE {
            return Err(AtaError::BufferSize);
        }
        self.issue_command(lba, count, CMD_READ_SECTORS)?;
        for sector in 0..count {
            self.wait_data_request()?;
            let base = sector * SECTOR_SIZE;
            for word_index in 0..WORDS_PER_SECTOR {
                // SAFETY: DRQ is set for this sector's 256 word reads.
                let word = unsafe { self.data.read() };
                buffer[base + word_index * 2] = word as u8;
                buffer[base + word_index * 2 + 1] = (word >> 8) as u8;
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u32, count: usize, buffer: &[u8]) -> Result<(), AtaError> {
        if buffer.len() != count * SECTOR_SIZE {
            return Err(AtaError::BufferSize);
        }
        self.issue_command(lba, count, CMD_WRITE_SECTORS)?;
        for sector in 0..count {
            self.wait_data_request()?;
            let base = sector * SECTOR_SIZE;
            for word_index in 0..WORDS_PER_SECTOR {
                let word = buffer[base + word_index * 2] as u16
                    | (buffer[base + word_index * 2 + 1] as u16) << 8;
                // SAFETY: DRQ is set for this sector's 256 word writes.
                unsafe { self.data.write(word) };
            }
        }
        // Flush the write cache after every write command.
        self.wait_not_busy()?;
        // SAFETY: CACHE FLUSH takes no operands.
        unsafe { self.status_command.write(CMD_CACHE_FLUSH) };
        self.wait_not_busy()?;
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.total_sectors
    }
}

/// Retry wrapper: every transfer gets `IO_RETRY_ATTEMPTS` tries, with
/// the decoded failure logged between attempts.
pub struct Retrying<D: SectorDevice> {
    inner: D,
    attempts: u32,
}

impl<D: SectorDevice> Retrying<D> {
    pub fn new(inner: D) -> Self {
        Retrying {
            inner,
            attempts: IO_RETRY_ATTEMPTS,
        }
    }

    fn with_retry(
        &mut self,
        label: &str,
        lba: u32,
        mut op: impl FnMut(&mut D) -> Result<(), AtaError>,
    ) -> Result<(), AtaError> {
        let mut last = AtaError::Timeout;
        for attempt in 1..=self.attempts {
            match op(&mut self.inner) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    serial_println!(
                        "ata: {} at LBA {} failed (attempt {}/{}): {}",
                        label,
                        lba,
                        attempt,
                        self.attempts,
                        error
                    );
                    last = error;
                }
            }
        }
        Err(last)
    }
}

impl<D: SectorDevice> SectorDevice for Retrying<D> {
    fn read_sectors(&mut self, lba: u32, count: usize, buffer: &mut [u8]) -> Result<(), AtaError> {
        self.with_retry("read", lba, |disk| disk.read_sectors(lba, count, buffer))
    }

    fn write_sectors(&mut self, lba: u32, count: usize, buffer: &[u8]) -> Result<(), AtaError> {
        self.with_retry("write", lba, |disk| disk.write_sectors(lba, count, buffer))
    }

    fn sector_count(&self) -> u32 {
        self.inner.sector_count()
    }
}
