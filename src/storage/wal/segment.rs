//! WAL segment files and record framing.
//!
//! Each record is stored as a frame:
//!
//! ```text
//! | payload len (u32) | type (u8) | payload (bincode) | crc32c (u32) |
//! ```
//!
//! The checksum covers the type byte and the payload. A frame that is cut
//! short or fails its checksum is "torn": expected at the tail of the last
//! segment after a crash, corruption anywhere else.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::record::WalRecord;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::layout::CRC32C;

pub const FRAME_HEADER_SIZE: usize = 5;
pub const FRAME_TRAILER_SIZE: usize = 4;

pub const SEGMENT_EXTENSION: &str = "wal";

/// Encodes a record into a frame.
pub fn encode_frame(record: &WalRecord) -> StorageResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        StorageError::Serialization(format!("WAL record of {} bytes is too large", payload.len()))
    })?;

    let mut frame = vec![0u8; FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE];
    LittleEndian::write_u32(&mut frame[0..4], len);
    frame[4] = record.record_type() as u8;
    frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    let crc = CRC32C.checksum(&frame[4..FRAME_HEADER_SIZE + payload.len()]);
    let trailer = FRAME_HEADER_SIZE + payload.len();
    LittleEndian::write_u32(&mut frame[trailer..], crc);
    Ok(frame)
}

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum Frame {
    Record { record: WalRecord, size: u64 },
    Torn(String),
}

/// Decodes the frame at the start of `buf`. `Ok(None)` means `buf` is empty.
pub fn decode_frame(buf: &[u8]) -> StorageResult<Option<Frame>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(Some(Frame::Torn("truncated frame header".into())));
    }
    let len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let total = FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE;
    if buf.len() < total {
        return Ok(Some(Frame::Torn(format!(
            "frame of {} bytes cut short at {}",
            total,
            buf.len()
        ))));
    }
    let body_end = FRAME_HEADER_SIZE + len;
    let expected = LittleEndian::read_u32(&buf[body_end..total]);
    if CRC32C.checksum(&buf[4..body_end]) != expected {
        return Ok(Some(Frame::Torn("frame checksum mismatch".into())));
    }
    let record = WalRecord::decode(buf[4], &buf[FRAME_HEADER_SIZE..body_end])?;
    Ok(Some(Frame::Record {
        record,
        size: total as u64,
    }))
}

/// One WAL segment file, `<name>.<order>.wal`.
pub struct WalSegment {
    order: u64,
    path: PathBuf,
    file: File,
    size: u64,
}

impl WalSegment {
    pub fn file_name(name: &str, order: u64) -> String {
        format!("{}.{}.{}", name, order, SEGMENT_EXTENSION)
    }

    /// Extracts the segment order from a file name belonging to `name`.
    pub fn parse_order(name: &str, file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(name)?
            .strip_prefix('.')?
            .strip_suffix(SEGMENT_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    pub fn create(dir: &Path, name: &str, order: u64) -> StorageResult<Self> {
        let path = dir.join(Self::file_name(name, order));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::io(format!("creating WAL segment {}", path.display()), e))?;
        Ok(WalSegment {
            order,
            path,
            file,
            size: 0,
        })
    }

    pub fn open(path: PathBuf, order: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::io(format!("opening WAL segment {}", path.display()), e))?;
        let size = file
            .metadata()
            .map_err(|e| StorageError::io(format!("reading metadata of {}", path.display()), e))?
            .len();
        Ok(WalSegment {
            order,
            path,
            file,
            size,
        })
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        let context = || format!("appending to WAL segment {}", self.order);
        self.file
            .seek(SeekFrom::Start(self.size))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| StorageError::io(context(), e))?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file
            .sync_data()
            .map_err(|e| StorageError::io(format!("syncing WAL segment {}", self.order), e))
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> StorageResult<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(position))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| {
                StorageError::io(
                    format!("reading WAL segment {} at {}", self.order, position),
                    e,
                )
            })
    }

    /// Size in bytes of the frame starting at `position`, read from its
    /// length prefix.
    pub fn frame_size_at(&self, position: u64) -> StorageResult<Option<u64>> {
        if position >= self.size {
            return Ok(None);
        }
        if position + FRAME_HEADER_SIZE as u64 > self.size {
            return Err(self.torn(position, "truncated frame header"));
        }
        let mut len = [0u8; 4];
        self.read_at(position, &mut len)?;
        let total = (FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as u64 + LittleEndian::read_u32(&len) as u64;
        if position + total > self.size {
            return Err(self.torn(position, "frame cut short"));
        }
        Ok(Some(total))
    }

    /// Reads the frame at `position`. `Ok(None)` at the end of the segment.
    pub fn read_frame(&self, position: u64) -> StorageResult<Option<Frame>> {
        if position >= self.size {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        if position + FRAME_HEADER_SIZE as u64 > self.size {
            return Ok(Some(Frame::Torn("truncated frame header".into())));
        }
        self.read_at(position, &mut header)?;
        let total = FRAME_HEADER_SIZE + LittleEndian::read_u32(&header[0..4]) as usize + FRAME_TRAILER_SIZE;
        let available = (self.size - position).min(total as u64) as usize;
        let mut buf = vec![0u8; available];
        self.read_at(position, &mut buf)?;
        decode_frame(&buf)
    }

    /// Walks every frame and returns the position of the last valid record.
    ///
    /// With `repair`, a torn tail is cut off the file; otherwise it is
    /// reported as corruption.
    pub fn scan(&mut self, repair: bool) -> StorageResult<Option<u64>> {
        let mut position = 0;
        let mut last = None;
        loop {
            match self.read_frame(position)? {
                None => return Ok(last),
                Some(Frame::Record { size, .. }) => {
                    last = Some(position);
                    position += size;
                }
                Some(Frame::Torn(reason)) if repair => {
                    log::warn!(
                        "Truncating torn tail of WAL segment {} at {}: {}",
                        self.order,
                        position,
                        reason
                    );
                    self.truncate(position)?;
                    return Ok(last);
                }
                Some(Frame::Torn(reason)) => return Err(self.torn(position, &reason)),
            }
        }
    }

    pub fn truncate(&mut self, len: u64) -> StorageResult<()> {
        self.file
            .set_len(len)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| StorageError::io(format!("truncating WAL segment {}", self.order), e))?;
        self.size = len;
        Ok(())
    }

    pub fn torn(&self, position: u64, reason: &str) -> StorageError {
        StorageError::Corruption(format!(
            "WAL segment {} is damaged at {}: {}",
            self.order, position, reason
        ))
    }

    /// Removes the segment file from disk.
    pub fn remove(self) -> StorageResult<()> {
        let WalSegment { path, file, .. } = self;
        drop(file);
        std::fs::remove_file(&path)
            .map_err(|e| StorageError::io(format!("removing WAL segment {}", path.display()), e))
    }
}
