//! Typed accessors over a page buffer.
//!
//! Offsets passed to these accessors are relative to the page data area,
//! which starts right after the system header.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::diff::{DiffKind, DiffRecorder};
use crate::storage::page::layout::{self, PAGE_HEADER_SIZE};
use crate::storage::wal::Lsn;

fn data_range(page_len: usize, offset: usize, len: usize) -> StorageResult<std::ops::Range<usize>> {
    let start = PAGE_HEADER_SIZE
        .checked_add(offset)
        .ok_or_else(|| StorageError::InvalidDiff(format!("offset {} overflows", offset)))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| StorageError::InvalidDiff(format!("length {} overflows", len)))?;
    if end > page_len {
        return Err(StorageError::InvalidDiff(format!(
            "access {}..{} crosses the page boundary at {}",
            start, end, page_len
        )));
    }
    Ok(start..end)
}

/// Read-only view of a page.
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn lsn(&self) -> Lsn {
        layout::page_lsn(self.data)
    }

    /// Bytes available to callers.
    pub fn data_size(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    pub fn get_byte(&self, offset: usize) -> StorageResult<u8> {
        let range = data_range(self.data.len(), offset, 1)?;
        Ok(self.data[range.start])
    }

    pub fn get_int(&self, offset: usize) -> StorageResult<i32> {
        let range = data_range(self.data.len(), offset, 4)?;
        Ok(LittleEndian::read_i32(&self.data[range]))
    }

    pub fn get_long(&self, offset: usize) -> StorageResult<i64> {
        let range = data_range(self.data.len(), offset, 8)?;
        Ok(LittleEndian::read_i64(&self.data[range]))
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> StorageResult<&'a [u8]> {
        let range = data_range(self.data.len(), offset, len)?;
        Ok(&self.data[range])
    }
}

/// Mutable view of a page that records a diff for every write when a
/// recorder is attached.
pub struct DurablePage<'a> {
    data: &'a mut [u8],
    recorder: Option<&'a mut DiffRecorder>,
}

impl<'a> DurablePage<'a> {
    /// A view whose writes are recorded.
    pub fn recording(data: &'a mut [u8], recorder: &'a mut DiffRecorder) -> Self {
        Self {
            data,
            recorder: Some(recorder),
        }
    }

    /// A view whose writes are not recorded.
    pub fn untracked(data: &'a mut [u8]) -> Self {
        Self {
            data,
            recorder: None,
        }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(self.data)
    }

    pub fn lsn(&self) -> Lsn {
        layout::page_lsn(self.data)
    }

    pub fn data_size(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE
    }

    pub fn get_byte(&self, offset: usize) -> StorageResult<u8> {
        self.view().get_byte(offset)
    }

    pub fn get_int(&self, offset: usize) -> StorageResult<i32> {
        self.view().get_int(offset)
    }

    pub fn get_long(&self, offset: usize) -> StorageResult<i64> {
        self.view().get_long(offset)
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        self.view().get_bytes(offset, len).map(<[u8]>::to_vec)
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) -> StorageResult<()> {
        self.write(DiffKind::Byte, offset, &[value])
    }

    pub fn set_int(&mut self, offset: usize, value: i32) -> StorageResult<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.write(DiffKind::Int, offset, &buf)
    }

    pub fn set_long(&mut self, offset: usize, value: i64) -> StorageResult<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.write(DiffKind::Long, offset, &buf)
    }

    pub fn set_bytes(&mut self, offset: usize, value: &[u8]) -> StorageResult<()> {
        if value.is_empty() {
            return Ok(());
        }
        self.write(DiffKind::Bytes, offset, value)
    }

    /// Overwrites `len` bytes with `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) -> StorageResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.write(DiffKind::Bytes, offset, &vec![byte; len])
    }

    fn write(&mut self, kind: DiffKind, offset: usize, value: &[u8]) -> StorageResult<()> {
        let range = data_range(self.data.len(), offset, value.len())?;
        if let Some(recorder) = self.recorder.as_deref_mut() {
            recorder.record(kind, range.start, &self.data[range.clone()], value)?;
        }
        self.data[range].copy_from_slice(value);
        Ok(())
    }
}
