//! Binary layout tables.
//!
//! Every fixed-position field of the page system header and of the data file
//! header is declared once here as a named [`Field`]. Code reads and writes
//! through these descriptors instead of scattering offset arithmetic.

use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::storage::wal::Lsn;

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A named field at a fixed byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn read_u32(&self, buf: &[u8]) -> u32 {
        LittleEndian::read_u32(&buf[self.range()])
    }

    pub fn write_u32(&self, buf: &mut [u8], value: u32) {
        LittleEndian::write_u32(&mut buf[self.range()], value)
    }

    pub fn read_u64(&self, buf: &[u8]) -> u64 {
        LittleEndian::read_u64(&buf[self.range()])
    }

    pub fn write_u64(&self, buf: &mut [u8], value: u64) {
        LittleEndian::write_u64(&mut buf[self.range()], value)
    }
}

// Page system header.
pub const PAGE_MAGIC: Field = Field::new("magic", 0, 8);
pub const PAGE_CRC32: Field = Field::new("crc32", 8, 4);
pub const PAGE_LSN_SEGMENT: Field = Field::new("lsn_segment", 12, 8);
pub const PAGE_LSN_POSITION: Field = Field::new("lsn_position", 20, 8);

pub const PAGE_HEADER_LAYOUT: [Field; 4] =
    [PAGE_MAGIC, PAGE_CRC32, PAGE_LSN_SEGMENT, PAGE_LSN_POSITION];

/// Size of the page system header; the data area starts here.
pub const PAGE_HEADER_SIZE: usize = 32;

pub const PAGE_MAGIC_NUMBER: u64 = 0x5047_4442_5041_4745;

// Data file header.
pub const FILE_MAGIC: Field = Field::new("magic", 0, 8);
pub const FILE_VERSION: Field = Field::new("version", 8, 4);
pub const FILE_PAGE_SIZE: Field = Field::new("page_size", 12, 4);
pub const FILE_ID: Field = Field::new("file_id", 16, 8);

pub const FILE_HEADER_LAYOUT: [Field; 4] = [FILE_MAGIC, FILE_VERSION, FILE_PAGE_SIZE, FILE_ID];

pub const FILE_HEADER_SIZE: usize = 1024;

pub const FILE_MAGIC_NUMBER: u64 = 0x5047_4442_4649_4c45;
pub const FILE_FORMAT_VERSION: u32 = 1;

pub fn page_lsn(page: &[u8]) -> Lsn {
    Lsn::new(PAGE_LSN_SEGMENT.read_u64(page), PAGE_LSN_POSITION.read_u64(page))
}

pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    PAGE_LSN_SEGMENT.write_u64(page, lsn.segment);
    PAGE_LSN_POSITION.write_u64(page, lsn.position);
}

/// Writes the magic number and the checksum of everything after the crc field.
pub fn stamp_checksum(page: &mut [u8]) {
    PAGE_MAGIC.write_u64(page, PAGE_MAGIC_NUMBER);
    let crc = CRC32C.checksum(&page[PAGE_CRC32.end()..]);
    PAGE_CRC32.write_u32(page, crc);
}

/// Checks a page image read from disk. Pages never written by the engine
/// (magic still zero) are accepted as blank.
pub fn verify_checksum(page: &[u8]) -> bool {
    match PAGE_MAGIC.read_u64(page) {
        0 => page.iter().all(|&b| b == 0),
        PAGE_MAGIC_NUMBER => PAGE_CRC32.read_u32(page) == CRC32C.checksum(&page[PAGE_CRC32.end()..]),
        _ => false,
    }
}
