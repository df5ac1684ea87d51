// TagFS: a tag-addressed filesystem. Files have no path; an inode
// carries a bounded set of (key, value) tags and queries are tag
// intersections. Logical deletion is the `trashed=true` tag, the
// `name` tag is mandatory and unique among non-trashed files, and a
// process-wide context filter is AND-ed into every listing.
//
// On-disk layout (4-KiB blocks, little-endian):
//   block 0                      superblock
//   [1 .. bitmap_end)            block-allocation bitmap
//   [bitmap_end .. inode_end)    packed inode records (4 per block)
//   [inode_end .. total_blocks)  data region
//
// The whole inode table and bitmap are kept in memory; every mutation
// writes through to disk, and a failed write rolls the in-memory copy
// back by re-reading the affected blocks.

use crate::ata::AtaError;
use crate::block::{BlockDevice, BLOCK_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

pub const TAGFS_MAGIC: u32 = 0x5441_4746; // "TAGF"
pub const TAGFS_VERSION: u32 = 1;

pub const MAX_TAGS_PER_FILE: usize = 8;
pub const KEY_SIZE: usize = 32;
pub const VALUE_SIZE: usize = 64;
pub const DIRECT_BLOCKS: usize = 12;
pub const MAX_FILE_SIZE: usize = DIRECT_BLOCKS * BLOCK_SIZE;

/// Tags a context filter may hold.
pub const MAX_CONTEXT_TAGS: usize = 4;

/// Serialized inode record size; four records pack per block and none
/// straddles a block boundary.
pub const INODE_RECORD_SIZE: usize = 1024;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_RECORD_SIZE;

/// Default geometry when mount has to format a fresh disk.
pub const DEFAULT_TOTAL_BLOCKS: u32 = 4096;
pub const DEFAULT_TOTAL_INODES: u32 = 128;

/// Reserved tag keys.
pub const TAG_NAME: &str = "name";
pub const TAG_OWNER: &str = "owner";
pub const TAG_TRASHED: &str = "trashed";
pub const TRASHED_VALUE: &str = "true";

const TAG_RECORD_SIZE: usize = KEY_SIZE + VALUE_SIZE;
const BLOCK_PTR_NONE: u32 = u32::MAX;
const SIZE_TOMBSTONE: u64 = u64::MAX;
const BITS_PER_BITMAP_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFsError {
    /// Block device failure, decoded at the driver layer.
    Io(AtaError),
    /// Superblock magic mismatch and formatting was not allowed.
    BadMagic,
    /// Geometry does not fit the device.
    InvalidGeometry,
    InodeTableFull,
    /// Data region has too few free blocks for the payload.
    NoDataBlocks,
    /// The inode already carries the maximum number of tags.
    TagTableFull,
    /// The inode already carries a tag with this key.
    DuplicateTag,
    /// Another non-trashed file already uses this name.
    DuplicateName,
    /// The mandatory `name` tag is missing or would be removed.
    MissingName,
    /// Key or value exceeds the fixed field size.
    TagTooLong,
    FileTooLarge,
    NoSuchInode,
    TagNotFound,
    ContextTooLarge,
}

impl From<AtaError> for TagFsError {
    fn from(error: AtaError) -> Self {
        TagFsError::Io(error)
    }
}

impl fmt::Display for TagFsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagFsError::Io(error) => write!(f, "disk error: {}", error),
            TagFsError::BadMagic => f.write_str("superblock magic mismatch"),
            TagFsError::InvalidGeometry => f.write_str("filesystem geometry does not fit device"),
            TagFsError::InodeTableFull => f.write_str("inode table full"),
            TagFsError::NoDataBlocks => f.write_str("no free data blocks"),
            TagFsError::TagTableFull => f.write_str("tag table full"),
            TagFsError::DuplicateTag => f.write_str("tag key already present"),
            TagFsError::DuplicateName => f.write_str("name already in use"),
            TagFsError::MissingName => f.write_str("the name tag is required"),
            TagFsError::TagTooLong => f.write_str("tag key or value too long"),
            TagFsError::FileTooLarge => f.write_str("file exceeds direct block capacity"),
            TagFsError::NoSuchInode => f.write_str("no such inode"),
            TagFsError::TagNotFound => f.write_str("tag not found"),
            TagFsError::ContextTooLarge => f.write_str("too many context tags"),
        }
    }
}

/// A (key, value) pair with fixed on-disk field sizes. Unused bytes are
/// NUL padding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    key: [u8; KEY_SIZE],
    value: [u8; VALUE_SIZE],
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Result<Self, TagFsError> {
        if key.is_empty() || key.len() > KEY_SIZE || value.len() > VALUE_SIZE {
            return Err(TagFsError::TagTooLong);
        }
        let mut tag = Tag {
            key: [0; KEY_SIZE],
            value: [0; VALUE_SIZE],
        };
        tag.key[..key.len()].copy_from_slice(key.as_bytes());
        tag.value[..value.len()].copy_from_slice(value.as_bytes());
        Ok(tag)
    }

    fn field_str(field: &[u8]) -> &str {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        core::str::from_utf8(&field[..end]).unwrap_or("")
    }

    pub fn key(&self) -> &str {
        Self::field_str(&self.key)
    }

    pub fn value(&self) -> &str {
        Self::field_str(&self.value)
    }

    fn write_to(&self, buffer: &mut [u8]) {
        buffer[..KEY_SIZE].copy_from_slice(&self.key);
        buffer[KEY_SIZE..TAG_RECORD_SIZE].copy_from_slice(&self.value);
    }

    fn read_from(buffer: &[u8]) -> Self {
        let mut tag = Tag {
            key: [0; KEY_SIZE],
            value: [0; VALUE_SIZE],
        };
        tag.key.copy_from_slice(&buffer[..KEY_SIZE]);
        tag.value.copy_from_slice(&buffer[KEY_SIZE..TAG_RECORD_SIZE]);
        tag
    }

    const fn zeroed() -> Self {
        Tag {
            key: [0; KEY_SIZE],
            value: [0; VALUE_SIZE],
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key(), self.value())
    }
}

/// One file record. `inode_id == 0` means the slot is unallocated;
/// `size == u64::MAX` is the tombstone sentinel kept for forensic
/// erase-in-progress detection.
#[derive(Clone, Copy)]
pub struct FileInode {
    pub inode_id: u64,
    pub size: u64,
    pub block_count: u32,
    tag_count: u32,
    blocks: [u32; DIRECT_BLOCKS],
    tags: [Tag; MAX_TAGS_PER_FILE],
}

impl FileInode {
    pub const fn empty() -> Self {
        FileInode {
            inode_id: 0,
            size: 0,
            block_count: 0,
            tag_count: 0,
            blocks: [BLOCK_PTR_NONE; DIRECT_BLOCKS],
            tags: [Tag::zeroed(); MAX_TAGS_PER_FILE],
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.inode_id != 0
    }

    pub fn is_tombstone(&self) -> bool {
        self.size == SIZE_TOMBSTONE
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags[..self.tag_count as usize]
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags().iter().find(|t| t.key() == key).map(Tag::value)
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags()
            .iter()
            .any(|t| t.key() == tag.key() && t.value() == tag.value())
    }

    pub fn name(&self) -> &str {
        self.tag_value(TAG_NAME).unwrap_or("")
    }

    pub fn is_trashed(&self) -> bool {
        self.tag_value(TAG_TRASHED) == Some(TRASHED_VALUE)
    }

    fn push_tag(&mut self, tag: Tag) -> Result<(), TagFsError> {
        if self.tag_value(tag.key()).is_some() {
            return Err(TagFsError::DuplicateTag);
        }
        if self.tag_count as usize >= MAX_TAGS_PER_FILE {
            return Err(TagFsError::TagTableFull);
        }
        self.tags[self.tag_count as usize] = tag;
        self.tag_count += 1;
        Ok(())
    }

    fn drop_tag(&mut self, key: &str) -> Result<(), TagFsError> {
        let index = self
            .tags()
            .iter()
            .position(|t| t.key() == key)
            .ok_or(TagFsError::TagNotFound)?;
        let count = self.tag_count as usize;
        for slot in index..count - 1 {
            self.tags[slot] = self.tags[slot + 1];
        }
        self.tags[count - 1] = Tag::zeroed();
        self.tag_count -= 1;
        Ok(())
    }

    /// All predicate tags present (AND semantics).
    pub fn matches(&self, predicate: &[Tag]) -> bool {
        predicate.iter().all(|tag| self.has_tag(tag))
    }

    fn data_blocks(&self) -> &[u32] {
        &self.blocks[..self.block_count as usize]
    }

    fn write_to(&self, buffer: &mut [u8]) {
        buffer[..INODE_RECORD_SIZE].fill(0);
        buffer[0..8].copy_from_slice(&self.inode_id.to_le_bytes());
        buffer[8..16].copy_from_slice(&self.size.to_le_bytes());
        buffer[16..20].copy_from_slice(&self.block_count.to_le_bytes());
        buffer[20..24].copy_from_slice(&self.tag_count.to_le_bytes());
        for (i, block) in self.blocks.iter().enumerate() {
            let at = 24 + i * 4;
            buffer[at..at + 4].copy_from_slice(&block.to_le_bytes());
        }
        for (i, tag) in self.tags.iter().enumerate() {
            let at = 72 + i * TAG_RECORD_SIZE;
            tag.write_to(&mut buffer[at..at + TAG_RECORD_SIZE]);
        }
    }

    fn read_from(buffer: &[u8]) -> Self {
        let mut inode = FileInode::empty();
        inode.inode_id = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
        inode.size = u64::from_le_bytes(buffer[8..16].try_into().unwrap());
        inode.block_count = u32::from_le_bytes(buffer[16..20].try_into().unwrap());
        inode.tag_count =
            u32::from_le_bytes(buffer[20..24].try_into().unwrap()).min(MAX_TAGS_PER_FILE as u32);
        for (i, block) in inode.blocks.iter_mut().enumerate() {
            let at = 24 + i * 4;
            *block = u32::from_le_bytes(buffer[at..at + 4].try_into().unwrap());
        }
        for (i, tag) in inode.tags.iter_mut().enumerate() {
            let at = 72 + i * TAG_RECORD_SIZE;
            *tag = Tag::read_from(&buffer[at..at + TAG_RECORD_SIZE]);
        }
        inode
    }
}

/// Persistent filesystem header, block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_region_start: u32,
}

impl Superblock {
    fn write_to(&self, buffer: &mut [u8; BLOCK_SIZE]) {
        buffer.fill(0);
        let fields = [
            self.magic,
            self.version,
            self.total_blocks,
            self.free_blocks,
            self.total_inodes,
            self.free_inodes,
            self.bitmap_start,
            self.inode_table_start,
            self.data_region_start,
        ];
        for (i, field) in fields.iter().enumerate() {
            buffer[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn read_from(buffer: &[u8; BLOCK_SIZE]) -> Self {
        let field = |i: usize| u32::from_le_bytes(buffer[i * 4..i * 4 + 4].try_into().unwrap());
        Superblock {
            magic: field(0),
            version: field(1),
            total_blocks: field(2),
            free_blocks: field(3),
            total_inodes: field(4),
            free_inodes: field(5),
            bitmap_start: field(6),
            inode_table_start: field(7),
            data_region_start: field(8),
        }
    }
}

/// Mounted filesystem state over some block device.
pub struct TagFs<D: BlockDevice> {
    device: D,
    superblock: Superblock,
    inodes: Vec<FileInode>,
    bitmap: Vec<u8>,
    context: Vec<Tag>,
}

impl<D: BlockDevice> TagFs<D> {
    /// Lay down a fresh filesystem: zeroed inode table, bitmap with only
    /// the metadata blocks set, new superblock.
    pub fn format(
        mut device: D,
        total_blocks: u32,
        total_inodes: u32,
    ) -> Result<Self, TagFsError> {
        if total_blocks == 0 || total_inodes == 0 || total_blocks > device.block_count() {
            return Err(TagFsError::InvalidGeometry);
        }
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BITMAP_BLOCK);
        let inode_blocks = total_inodes.div_ceil(INODES_PER_BLOCK as u32);
        let bitmap_start = 1;
        let inode_table_start = bitmap_start + bitmap_blocks;
        let data_region_start = inode_table_start + inode_blocks;
        if data_region_start >= total_blocks {
            return Err(TagFsError::InvalidGeometry);
        }

        let superblock = Superblock {
            magic: TAGFS_MAGIC,
            version: TAGFS_VERSION,
            total_blocks,
            free_blocks: total_blocks - data_region_start,
            total_inodes,
            free_inodes: total_inodes,
            bitmap_start,
            inode_table_start,
            data_region_start,
        };

        // Metadata blocks (superblock, bitmap, inode table) are in use.
        let mut bitmap = vec![0u8; (bitmap_blocks as usize) * BLOCK_SIZE];
        for block in 0..data_region_start {
            bitmap[(block / 8) as usize] |= 1 << (block % 8);
        }

        let inodes = vec![FileInode::empty(); total_inodes as usize];

        let mut buffer = [0u8; BLOCK_SIZE];
        for index in 0..bitmap_blocks {
            let at = (index as usize) * BLOCK_SIZE;
            buffer.copy_from_slice(&bitmap[at..at + BLOCK_SIZE]);
            device.write_block(bitmap_start + index, &buffer)?;
        }
        buffer.fill(0);
        for index in 0..inode_blocks {
            device.write_block(inode_table_start + index, &buffer)?;
        }
        superblock.write_to(&mut buffer);
        device.write_block(0, &buffer)?;

        Ok(TagFs {
            device,
            superblock,
            inodes,
            bitmap,
            context: Vec::new(),
        })
    }

    /// Mount the filesystem on `device`. A bad superblock magic formats
    /// a fresh filesystem when `force_format` allows it and is an error
    /// (fatal to the caller) otherwise.
    pub fn mount(mut device: D, force_format: bool) -> Result<Self, TagFsError> {
        let mut buffer = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut buffer)?;
        let superblock = Superblock::read_from(&buffer);

        if superblock.magic != TAGFS_MAGIC {
            if !force_format {
                return Err(TagFsError::BadMagic);
            }
            let total_blocks = DEFAULT_TOTAL_BLOCKS.min(device.block_count());
            return Self::format(device, total_blocks, DEFAULT_TOTAL_INODES);
        }

        if superblock.total_blocks > device.block_count()
            || superblock.data_region_start >= superblock.total_blocks
        {
            return Err(TagFsError::InvalidGeometry);
        }

        // Load the bitmap.
        let bitmap_blocks = superblock.inode_table_start - superblock.bitmap_start;
        let mut bitmap = vec![0u8; (bitmap_blocks as usize) * BLOCK_SIZE];
        for index in 0..bitmap_blocks {
            device.read_block(superblock.bitmap_start + index, &mut buffer)?;
            let at = (index as usize) * BLOCK_SIZE;
            bitmap[at..at + BLOCK_SIZE].copy_from_slice(&buffer);
        }

        // Load the inode table. A record carrying the tombstone sentinel
        // is an erase that never finished; treat the slot as free.
        let mut inodes = vec![FileInode::empty(); superblock.total_inodes as usize];
        let inode_blocks = superblock.data_region_start - superblock.inode_table_start;
        for index in 0..inode_blocks {
            device.read_block(superblock.inode_table_start + index, &mut buffer)?;
            for slot in 0..INODES_PER_BLOCK {
                let table_index = (index as usize) * INODES_PER_BLOCK + slot;
                if table_index >= inodes.len() {
                    break;
                }
                let at = slot * INODE_RECORD_SIZE;
                let inode = FileInode::read_from(&buffer[at..at + INODE_RECORD_SIZE]);
                if !inode.is_tombstone() {
                    inodes[table_index] = inode;
                }
            }
        }

        Ok(TagFs {
            device,
            superblock,
            inodes,
            bitmap,
            context: Vec::new(),
        })
    }

    pub fn superblock(&self) -> Superblock {
        self.superblock
    }

    // ---- bitmap helpers -------------------------------------------------

    fn block_is_used(&self, block: u32) -> bool {
        self.bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    fn set_block(&mut self, block: u32, used: bool) {
        if used {
            self.bitmap[(block / 8) as usize] |= 1 << (block % 8);
        } else {
            self.bitmap[(block / 8) as usize] &= !(1 << (block % 8));
        }
    }

    /// First-fit allocation of `count` data blocks (not necessarily
    /// adjacent). Either all are claimed or none.
    fn alloc_data_blocks(&mut self, count: usize) -> Result<Vec<u32>, TagFsError> {
        if (self.superblock.free_blocks as usize) < count {
            return Err(TagFsError::NoDataBlocks);
        }
        let mut claimed = Vec::with_capacity(count);
        for block in self.superblock.data_region_start..self.superblock.total_blocks {
            if claimed.len() == count {
                break;
            }
            if !self.block_is_used(block) {
                self.set_block(block, true);
                claimed.push(block);
            }
        }
        if claimed.len() < count {
            for &block in &claimed {
                self.set_block(block, false);
            }
            return Err(TagFsError::NoDataBlocks);
        }
        Ok(claimed)
    }

    // ---- persistence ----------------------------------------------------

    fn inode_block_of(&self, index: usize) -> u32 {
        self.superblock.inode_table_start + (index / INODES_PER_BLOCK) as u32
    }

    fn bitmap_block_of(&self, block: u32) -> u32 {
        self.superblock.bitmap_start + block / BITS_PER_BITMAP_BLOCK
    }

    fn persist_inode(&mut self, index: usize) -> Result<(), TagFsError> {
        let disk_block = self.inode_block_of(index);
        let first = (index / INODES_PER_BLOCK) * INODES_PER_BLOCK;
        let mut buffer = [0u8; BLOCK_SIZE];
        for slot in 0..INODES_PER_BLOCK {
            if first + slot >= self.inodes.len() {
                break;
            }
            let at = slot * INODE_RECORD_SIZE;
            self.inodes[first + slot].write_to(&mut buffer[at..at + INODE_RECORD_SIZE]);
        }
        self.device.write_block(disk_block, &buffer)?;
        Ok(())
    }

    fn persist_bitmap_for(&mut self, blocks: &[u32]) -> Result<(), TagFsError> {
        let mut written: Vec<u32> = Vec::new();
        for &block in blocks {
            let disk_block = self.bitmap_block_of(block);
            if written.contains(&disk_block) {
                continue;
            }
            let at = ((disk_block - self.superblock.bitmap_start) as usize) * BLOCK_SIZE;
            let mut buffer = [0u8; BLOCK_SIZE];
            buffer.copy_from_slice(&self.bitmap[at..at + BLOCK_SIZE]);
            self.device.write_block(disk_block, &buffer)?;
            written.push(disk_block);
        }
        Ok(())
    }

    fn persist_superblock(&mut self) -> Result<(), TagFsError> {
        let mut buffer = [0u8; BLOCK_SIZE];
        self.superblock.write_to(&mut buffer);
        self.device.write_block(0, &buffer)?;
        Ok(())
    }

    /// Roll the in-memory state for an inode slot, a set of data blocks
    /// and the superblock back to what the disk holds. Secondary read
    /// failures leave memory as it is; the primary error has already
    /// been reported.
    fn rollback(&mut self, inode_index: Option<usize>, data_blocks: &[u32]) {
        let mut buffer = [0u8; BLOCK_SIZE];
        if self.device.read_block(0, &mut buffer).is_ok() {
            let superblock = Superblock::read_from(&buffer);
            if superblock.magic == TAGFS_MAGIC {
                self.superblock = superblock;
            }
        }
        if let Some(index) = inode_index {
            let disk_block = self.inode_block_of(index);
            if self.device.read_block(disk_block, &mut buffer).is_ok() {
                let first = (index / INODES_PER_BLOCK) * INODES_PER_BLOCK;
                for slot in 0..INODES_PER_BLOCK {
                    if first + slot >= self.inodes.len() {
                        break;
                    }
                    let at = slot * INODE_RECORD_SIZE;
                    self.inodes[first + slot] =
                        FileInode::read_from(&buffer[at..at + INODE_RECORD_SIZE]);
                }
            }
        }
        let mut reloaded: Vec<u32> = Vec::new();
        for &block in data_blocks {
            let disk_block = self.bitmap_block_of(block);
            if reloaded.contains(&disk_block) {
                continue;
            }
            if self.device.read_block(disk_block, &mut buffer).is_ok() {
                let at = ((disk_block - self.superblock.bitmap_start) as usize) * BLOCK_SIZE;
                self.bitmap[at..at + BLOCK_SIZE].copy_from_slice(&buffer);
            }
            reloaded.push(disk_block);
        }
    }

    // ---- inode lookup ---------------------------------------------------

    fn index_of(&self, inode_id: u64) -> Result<usize, TagFsError> {
        if inode_id == 0 || inode_id > self.inodes.len() as u64 {
            return Err(TagFsError::NoSuchInode);
        }
        let index = (inode_id - 1) as usize;
        if !self.inodes[index].is_allocated() {
            return Err(TagFsError::NoSuchInode);
        }
        Ok(index)
    }

    pub fn inode(&self, inode_id: u64) -> Result<&FileInode, TagFsError> {
        self.index_of(inode_id).map(|index| &self.inodes[index])
    }

    /// Look a file up by its `name` tag; non-trashed files win over
    /// trashed ones so `restore` can still find what `trash` hid.
    pub fn find_by_name(&self, name: &str) -> Option<u64> {
        let mut trashed_match = None;
        for inode in self.inodes.iter().filter(|i| i.is_allocated()) {
            if inode.name() != name {
                continue;
            }
            if inode.is_trashed() {
                trashed_match.get_or_insert(inode.inode_id);
            } else {
                return Some(inode.inode_id);
            }
        }
        trashed_match
    }

    // ---- operations -----------------------------------------------------

    /// Allocate an inode in the first free slot, claim data blocks for
    /// the payload, copy it in, persist. Returns the new inode id.
    pub fn create(&mut self, tags: &[Tag], data: &[u8]) -> Result<u64, TagFsError> {
        if tags.len() > MAX_TAGS_PER_FILE {
            return Err(TagFsError::TagTableFull);
        }
        if data.len() > MAX_FILE_SIZE {
            return Err(TagFsError::FileTooLarge);
        }
        let name = tags
            .iter()
            .find(|t| t.key() == TAG_NAME)
            .map(Tag::value)
            .ok_or(TagFsError::MissingName)?;
        for (i, tag) in tags.iter().enumerate() {
            if tags[..i].iter().any(|other| other.key() == tag.key()) {
                return Err(TagFsError::DuplicateTag);
            }
        }
        if self
            .inodes
            .iter()
            .any(|i| i.is_allocated() && !i.is_trashed() && i.name() == name)
        {
            return Err(TagFsError::DuplicateName);
        }

        let index = self
            .inodes
            .iter()
            .position(|i| !i.is_allocated())
            .ok_or(TagFsError::InodeTableFull)?;

        let block_count = data.len().div_ceil(BLOCK_SIZE);
        let claimed = self.alloc_data_blocks(block_count)?;

        // Copy the payload out before touching metadata so a failed data
        // write needs only the bitmap bits undone in memory.
        let mut buffer = [0u8; BLOCK_SIZE];
        for (chunk_index, &block) in claimed.iter().enumerate() {
            let start = chunk_index * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(data.len());
            buffer.fill(0);
            buffer[..end - start].copy_from_slice(&data[start..end]);
            if let Err(error) = self.device.write_block(block, &buffer) {
                for &claimed_block in &claimed {
                    self.set_block(claimed_block, false);
                }
                return Err(error.into());
            }
        }

        let mut inode = FileInode::empty();
        inode.inode_id = index as u64 + 1;
        inode.size = data.len() as u64;
        inode.block_count = block_count as u32;
        for (slot, &block) in claimed.iter().enumerate() {
            inode.blocks[slot] = block;
        }
        for tag in tags {
            // Validated above; push cannot fail here.
            let _ = inode.push_tag(*tag);
        }
        self.inodes[index] = inode;
        self.superblock.free_inodes -= 1;
        self.superblock.free_blocks -= block_count as u32;

        let persisted = self
            .persist_inode(index)
            .and_then(|()| self.persist_bitmap_for(&claimed))
            .and_then(|()| self.persist_superblock());
        if let Err(error) = persisted {
            self.rollback(Some(index), &claimed);
            return Err(error);
        }
        Ok(index as u64 + 1)
    }

    /// Concatenate the data blocks up to `size`.
    pub fn read_content(&mut self, inode_id: u64) -> Result<Vec<u8>, TagFsError> {
        let index = self.index_of(inode_id)?;
        let inode = self.inodes[index];
        let mut content = Vec::with_capacity(inode.size as usize);
        let mut buffer = [0u8; BLOCK_SIZE];
        for &block in inode.data_blocks() {
            self.device.read_block(block, &mut buffer)?;
            let remaining = inode.size as usize - content.len();
            content.extend_from_slice(&buffer[..remaining.min(BLOCK_SIZE)]);
        }
        Ok(content)
    }

    pub fn add_tag(&mut self, inode_id: u64, tag: Tag) -> Result<(), TagFsError> {
        let index = self.index_of(inode_id)?;
        if tag.key() == TAG_NAME {
            // Names stay unique across non-trashed files.
            let clash = self.inodes.iter().any(|i| {
                i.is_allocated()
                    && !i.is_trashed()
                    && i.inode_id != inode_id
                    && i.name() == tag.value()
            });
            if clash {
                return Err(TagFsError::DuplicateName);
            }
        }
        self.inodes[index].push_tag(tag)?;
        if let Err(error) = self.persist_inode(index) {
            self.rollback(Some(index), &[]);
            return Err(error);
        }
        Ok(())
    }

    pub fn remove_tag(&mut self, inode_id: u64, key: &str) -> Result<(), TagFsError> {
        let index = self.index_of(inode_id)?;
        if key == TAG_NAME {
            return Err(TagFsError::MissingName);
        }
        self.inodes[index].drop_tag(key)?;
        if let Err(error) = self.persist_inode(index) {
            self.rollback(Some(index), &[]);
            return Err(error);
        }
        Ok(())
    }

    /// Logical deletion: add `trashed=true`. Idempotent.
    pub fn trash(&mut self, inode_id: u64) -> Result<(), TagFsError> {
        let index = self.index_of(inode_id)?;
        if self.inodes[index].is_trashed() {
            return Ok(());
        }
        let tag = Tag::new(TAG_TRASHED, TRASHED_VALUE)?;
        self.inodes[index].push_tag(tag)?;
        if let Err(error) = self.persist_inode(index) {
            self.rollback(Some(index), &[]);
            return Err(error);
        }
        Ok(())
    }

    /// Undo `trash`. Idempotent, but the restored name must not collide
    /// with a live file created in the meantime.
    pub fn restore(&mut self, inode_id: u64) -> Result<(), TagFsError> {
        let index = self.index_of(inode_id)?;
        if !self.inodes[index].is_trashed() {
            return Ok(());
        }
        let name = self.inodes[index].name();
        let clash = self.inodes.iter().any(|i| {
            i.is_allocated() && !i.is_trashed() && i.inode_id != inode_id && i.name() == name
        });
        if clash {
            return Err(TagFsError::DuplicateName);
        }
        self.inodes[index].drop_tag(TAG_TRASHED)?;
        if let Err(error) = self.persist_inode(index) {
            self.rollback(Some(index), &[]);
            return Err(error);
        }
        Ok(())
    }

    /// Permanent deletion: release the data blocks and zero the slot.
    pub fn erase(&mut self, inode_id: u64) -> Result<(), TagFsError> {
        let index = self.index_of(inode_id)?;
        let inode = self.inodes[index];
        let released: Vec<u32> = inode.data_blocks().to_vec();
        for &block in &released {
            self.set_block(block, false);
        }
        self.inodes[index] = FileInode::empty();
        self.superblock.free_inodes += 1;
        self.superblock.free_blocks += released.len() as u32;

        let persisted = self
            .persist_inode(index)
            .and_then(|()| self.persist_bitmap_for(&released))
            .and_then(|()| self.persist_superblock());
        if let Err(error) = persisted {
            self.rollback(Some(index), &released);
            return Err(error);
        }
        Ok(())
    }

    /// Linear scan over the inode table: every inode whose tag set is a
    /// superset of `predicate`, ascending inode id, at most `limit`
    /// results. Trashed inodes are excluded unless the predicate asks
    /// for `trashed:true` itself.
    pub fn query(&self, predicate: &[Tag], limit: usize) -> Vec<u64> {
        let wants_trashed = predicate
            .iter()
            .any(|t| t.key() == TAG_TRASHED && t.value() == TRASHED_VALUE);
        let mut results = Vec::new();
        for inode in self.inodes.iter().filter(|i| i.is_allocated()) {
            if results.len() >= limit {
                break;
            }
            if inode.is_trashed() && !wants_trashed {
                continue;
            }
            if inode.matches(predicate) {
                results.push(inode.inode_id);
            }
        }
        results
    }

    // ---- context filter -------------------------------------------------

    /// Replace the context filter applied to listings.
    pub fn context_set(&mut self, tags: &[Tag]) -> Result<(), TagFsError> {
        if tags.len() > MAX_CONTEXT_TAGS {
            return Err(TagFsError::ContextTooLarge);
        }
        self.context.clear();
        self.context.extend_from_slice(tags);
        Ok(())
    }

    pub fn context_clear(&mut self) {
        self.context.clear();
    }

    pub fn context(&self) -> &[Tag] {
        &self.context
    }

    pub fn context_matches(&self, inode_id: u64) -> bool {
        match self.inode(inode_id) {
            Ok(inode) => inode.matches(&self.context),
            Err(_) => false,
        }
    }

    /// Listing query: the context filter AND-ed with `extra`.
    pub fn list(&self, extra: &[Tag], limit: usize) -> Vec<u64> {
        let mut predicate = Vec::with_capacity(self.context.len() + extra.len());
        predicate.extend_from_slice(&self.context);
        predicate.extend_from_slice(extra);
        self.query(&predicate, limit)
    }
}

/// The filesystem stack the kernel actually mounts: TagFS over 4-KiB
/// blocks over the retrying primary ATA disk.
pub type KernelTagFs =
    TagFs<crate::block::AtaBlockDevice<crate::ata::Retrying<crate::ata::AtaDisk>>>;

static FILESYSTEM: spin::Once<spin::Mutex<KernelTagFs>> = spin::Once::new();

/// Publish the mounted filesystem. Called once at boot, from task
/// context; the filesystem is only ever touched from task context, so
/// the lock never contends with an IRQ.
pub fn init_global(fs: KernelTagFs) {
    FILESYSTEM.call_once(|| spin::Mutex::new(fs));
}

/// Run `f` against the mounted filesystem; `None` before `init_global`.
pub fn with_fs<R>(f: impl FnOnce(&mut KernelTagFs) -> R) -> Option<R> {
    FILESYSTEM.get().map(|fs| f(&mut fs.lock()))
}
