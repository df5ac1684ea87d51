//! Shared fixtures for the host-run test suite: memory-backed block and
//! sector devices with failure injection, plus aligned arenas for the
//! allocator tests.

#![allow(dead_code)]

use boxos::ata::{AtaError, SectorDevice, SECTOR_SIZE};
use boxos::block::{BlockDevice, BLOCK_SIZE};
use std::cell::RefCell;
use std::rc::Rc;

/// RAM-backed block device. Cloning shares the storage, which is how the
/// remount tests hand "the same disk" to a second mount.
pub struct MemDisk {
    blocks: Rc<RefCell<Vec<[u8; BLOCK_SIZE]>>>,
    fail_writes: Rc<RefCell<u32>>,
    fail_reads: Rc<RefCell<u32>>,
}

impl MemDisk {
    pub fn new(block_count: u32) -> Self {
        MemDisk {
            blocks: Rc::new(RefCell::new(vec![[0u8; BLOCK_SIZE]; block_count as usize])),
            fail_writes: Rc::new(RefCell::new(0)),
            fail_reads: Rc::new(RefCell::new(0)),
        }
    }

    /// Another handle onto the same storage.
    pub fn share(&self) -> Self {
        MemDisk {
            blocks: Rc::clone(&self.blocks),
            fail_writes: Rc::clone(&self.fail_writes),
            fail_reads: Rc::clone(&self.fail_reads),
        }
    }

    /// Make the next `count` writes fail with an uncorrectable-data
    /// error.
    pub fn fail_next_writes(&self, count: u32) {
        *self.fail_writes.borrow_mut() = count;
    }

    pub fn fail_next_reads(&self, count: u32) {
        *self.fail_reads.borrow_mut() = count;
    }

    pub fn raw_block(&self, block: u32) -> [u8; BLOCK_SIZE] {
        self.blocks.borrow()[block as usize]
    }
}

impl BlockDevice for MemDisk {
    fn block_count(&self) -> u32 {
        self.blocks.borrow().len() as u32
    }

    fn read_block(&mut self, block: u32, buffer: &mut [u8; BLOCK_SIZE]) -> Result<(), AtaError> {
        let mut failures = self.fail_reads.borrow_mut();
        if *failures > 0 {
            *failures -= 1;
            return Err(AtaError::UncorrectableData);
        }
        let blocks = self.blocks.borrow();
        let slot = blocks.get(block as usize).ok_or(AtaError::IdNotFound)?;
        buffer.copy_from_slice(slot);
        Ok(())
    }

    fn write_block(&mut self, block: u32, buffer: &[u8; BLOCK_SIZE]) -> Result<(), AtaError> {
        let mut failures = self.fail_writes.borrow_mut();
        if *failures > 0 {
            *failures -= 1;
            return Err(AtaError::UncorrectableData);
        }
        let mut blocks = self.blocks.borrow_mut();
        let slot = blocks
            .get_mut(block as usize)
            .ok_or(AtaError::IdNotFound)?;
        slot.copy_from_slice(buffer);
        Ok(())
    }
}

/// RAM-backed sector device with transient-failure injection, for the
/// retry wrapper and the block-layer fan-out tests.
pub struct MemSectorDisk {
    data: Vec<u8>,
    fail_reads: u32,
    fail_writes: u32,
    pub read_calls: u32,
    pub write_calls: u32,
}

impl MemSectorDisk {
    pub fn new(sector_count: u32) -> Self {
        MemSectorDisk {
            data: vec![0u8; sector_count as usize * SECTOR_SIZE],
            fail_reads: 0,
            fail_writes: 0,
            read_calls: 0,
            write_calls: 0,
        }
    }

    pub fn fail_next_reads(&mut self, count: u32) {
        self.fail_reads = count;
    }

    pub fn fail_next_writes(&mut self, count: u32) {
        self.fail_writes = count;
    }

    pub fn sector(&self, lba: u32) -> &[u8] {
        &self.data[lba as usize * SECTOR_SIZE..(lba as usize + 1) * SECTOR_SIZE]
    }
}

impl SectorDevice for MemSectorDisk {
    fn read_sectors(&mut self, lba: u32, count: usize, buffer: &mut [u8]) -> Result<(), AtaError> {
        self.read_calls += 1;
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(AtaError::BadBlock);
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + count * SECTOR_SIZE;
        if buffer.len() != count * SECTOR_SIZE {
            return Err(AtaError::BufferSize);
        }
        if end > self.data.len() {
            return Err(AtaError::IdNotFound);
        }
        buffer.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u32, count: usize, buffer: &[u8]) -> Result<(), AtaError> {
        self.write_calls += 1;
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(AtaError::BadBlock);
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + count * SECTOR_SIZE;
        if buffer.len() != count * SECTOR_SIZE {
            return Err(AtaError::BufferSize);
        }
        if end > self.data.len() {
            return Err(AtaError::IdNotFound);
        }
        self.data[start..end].copy_from_slice(buffer);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }
}

/// 16-byte aligned arena for the boundary-tag heap.
#[repr(align(16))]
pub struct HeapArena(pub [u8; HEAP_ARENA_SIZE]);

pub const HEAP_ARENA_SIZE: usize = 256 * 1024;

pub fn heap_arena() -> Box<HeapArena> {
    Box::new(HeapArena([0; HEAP_ARENA_SIZE]))
}

/// Simulated physical memory for the VMM tests: frame numbers are byte
/// offsets into an aligned buffer, and the buffer base doubles as the
/// physical-memory window offset.
pub struct PhysArena {
    backing: Vec<u8>,
    base: usize,
    frame_count: usize,
    next_frame: usize,
}

impl PhysArena {
    pub fn new(frame_count: usize) -> Self {
        let backing = vec![0u8; (frame_count + 1) * 4096];
        let base = (backing.as_ptr() as usize + 4095) & !4095;
        PhysArena {
            backing,
            base,
            frame_count,
            next_frame: 0,
        }
    }

    /// The value to use as `phys_offset` when constructing the address
    /// space.
    pub fn phys_offset(&self) -> u64 {
        self.base as u64
    }

    /// Snapshot of every frame handed out so far, for bit-identical
    /// comparisons.
    pub fn snapshot(&self) -> Vec<u8> {
        let used = self.next_frame * 4096;
        unsafe { std::slice::from_raw_parts(self.base as *const u8, used) }.to_vec()
    }

    pub fn frames_used(&self) -> usize {
        self.next_frame
    }
}

impl boxos::paging::FrameSource for PhysArena {
    fn alloc_frame(&mut self) -> Option<u64> {
        if self.next_frame == self.frame_count {
            return None;
        }
        let frame = (self.next_frame * 4096) as u64;
        self.next_frame += 1;
        Some(frame)
    }
}
