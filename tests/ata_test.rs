//! ATA layer tests: error decode, transfer validation, the retry
//! wrapper, IDENTIFY parsing and the sector-to-block fan-out.

mod common;

use boxos::ata::{
    decode_error, parse_identify, validate_transfer, AtaError, Retrying, SectorDevice,
    IO_RETRY_ATTEMPTS, SECTOR_SIZE,
};
use boxos::block::{AtaBlockDevice, BlockDevice, BLOCK_SIZE, SECTORS_PER_BLOCK};
use common::MemSectorDisk;

#[test]
fn error_register_decoding() {
    assert_eq!(decode_error(0x01), AtaError::AddressMarkNotFound);
    assert_eq!(decode_error(0x02), AtaError::TrackZeroNotFound);
    assert_eq!(decode_error(0x04), AtaError::Aborted);
    assert_eq!(decode_error(0x08), AtaError::MediaChangeRequest);
    assert_eq!(decode_error(0x10), AtaError::IdNotFound);
    assert_eq!(decode_error(0x20), AtaError::MediaChanged);
    assert_eq!(decode_error(0x40), AtaError::UncorrectableData);
    assert_eq!(decode_error(0x80), AtaError::BadBlock);
    // The most severe condition wins when several bits are set.
    assert_eq!(decode_error(0x44), AtaError::UncorrectableData);
    assert_eq!(decode_error(0x00), AtaError::Unknown(0));
}

#[test]
fn transfer_validation_boundaries() {
    // 256 sectors is the largest single command; 257 is rejected.
    assert_eq!(validate_transfer(0, 256), Ok(()));
    assert_eq!(validate_transfer(0, 257), Err(AtaError::TooManySectors));
    assert_eq!(validate_transfer(0, 0), Err(AtaError::TooManySectors));

    assert_eq!(validate_transfer(0x0FFF_FFFF, 1), Ok(()));
    assert_eq!(
        validate_transfer(0x1000_0000, 1),
        Err(AtaError::LbaOutOfRange)
    );
    assert_eq!(
        validate_transfer(0x0FFF_FFFF, 2),
        Err(AtaError::LbaOutOfRange)
    );
}

/// Scenario: two injected transient failures; the retry wrapper must
/// succeed on the third attempt.
#[test]
fn read_succeeds_on_third_attempt() {
    let mut disk = MemSectorDisk::new(64);
    let payload = [0x5Au8; SECTOR_SIZE];
    disk.write_sectors(3, 1, &payload).unwrap();
    disk.fail_next_reads(2);

    let mut retrying = Retrying::new(disk);
    let mut buffer = [0u8; SECTOR_SIZE];
    retrying
        .read_sectors(3, 1, &mut buffer)
        .expect("third attempt must succeed");
    assert_eq!(buffer, payload);
}

#[test]
fn retry_gives_up_after_budget() {
    let mut disk = MemSectorDisk::new(64);
    disk.fail_next_reads(IO_RETRY_ATTEMPTS);

    let mut retrying = Retrying::new(disk);
    let mut buffer = [0u8; SECTOR_SIZE];
    assert_eq!(
        retrying.read_sectors(0, 1, &mut buffer),
        Err(AtaError::BadBlock)
    );
}

#[test]
fn write_retry_consumes_injected_failures() {
    let mut disk = MemSectorDisk::new(64);
    disk.fail_next_writes(1);

    let mut retrying = Retrying::new(disk);
    let payload = [0xC3u8; SECTOR_SIZE];
    retrying.write_sectors(5, 1, &payload).unwrap();

    let mut buffer = [0u8; SECTOR_SIZE];
    retrying.read_sectors(5, 1, &mut buffer).unwrap();
    assert_eq!(buffer, payload);
}

#[test]
fn block_device_maps_one_block_to_eight_sectors() {
    let disk = MemSectorDisk::new(256);
    let mut device = AtaBlockDevice::new(disk);
    assert_eq!(device.block_count(), 256 / SECTORS_PER_BLOCK as u32);

    let mut block = [0u8; BLOCK_SIZE];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    device.write_block(3, &block).unwrap();

    let mut readback = [0u8; BLOCK_SIZE];
    device.read_block(3, &mut readback).unwrap();
    assert_eq!(readback[..], block[..]);
}

#[test]
fn identify_strings_are_byte_swapped() {
    let mut words = [0u16; 256];
    // "QEMU HARDDISK" as the device reports it: big-endian byte pairs.
    let model = b"QEMU HARDDISK";
    for (i, pair) in model.chunks(2).enumerate() {
        let high = pair[0] as u16;
        let low = *pair.get(1).unwrap_or(&b' ') as u16;
        words[27 + i] = high << 8 | low;
    }
    for word in &mut words[27 + model.len().div_ceil(2)..47] {
        *word = 0x2020; // space padding
    }
    let serial = b"QM0001";
    for (i, pair) in serial.chunks(2).enumerate() {
        words[10 + i] = (pair[0] as u16) << 8 | pair[1] as u16;
    }
    for word in &mut words[10 + serial.len() / 2..20] {
        *word = 0x2020;
    }
    words[60] = 0x1234;
    words[61] = 0x0002;

    let info = parse_identify(&words);
    assert_eq!(info.model_name(), "QEMU HARDDISK");
    assert_eq!(info.serial_number(), "QM0001");
    assert_eq!(info.total_sectors, 0x0002_1234);
}
