//! Physical page diffs.
//!
//! A [`PageDiff`] describes one contiguous region of a page that was
//! overwritten: where, the bytes written and, for full diffs, the bytes that
//! were there before. Values are absolute, so applying a diff twice is the
//! same as applying it once.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::layout::PAGE_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    Byte,
    Int,
    Long,
    Bytes,
}

impl DiffKind {
    fn width(self) -> Option<usize> {
        match self {
            DiffKind::Byte => Some(1),
            DiffKind::Int => Some(4),
            DiffKind::Long => Some(8),
            DiffKind::Bytes => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDiff {
    pub kind: DiffKind,
    /// Absolute offset inside the page.
    pub offset: u32,
    pub new: Vec<u8>,
    /// Previous content; `None` for redo-only diffs.
    pub old: Option<Vec<u8>>,
}

impl PageDiff {
    /// A diff carrying both images, usable for redo and undo.
    pub fn full(kind: DiffKind, offset: u32, old: Vec<u8>, new: Vec<u8>) -> StorageResult<Self> {
        if old.len() != new.len() {
            return Err(StorageError::InvalidDiff(format!(
                "old image has {} bytes but new image has {}",
                old.len(),
                new.len()
            )));
        }
        let diff = Self {
            kind,
            offset,
            new,
            old: Some(old),
        };
        diff.check_width()?;
        Ok(diff)
    }

    /// A redo-only diff.
    pub fn partial(kind: DiffKind, offset: u32, new: Vec<u8>) -> StorageResult<Self> {
        let diff = Self {
            kind,
            offset,
            new,
            old: None,
        };
        diff.check_width()?;
        Ok(diff)
    }

    pub fn is_full(&self) -> bool {
        self.old.is_some()
    }

    pub fn len(&self) -> usize {
        self.new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
    }

    fn check_width(&self) -> StorageResult<()> {
        match self.kind.width() {
            Some(width) if width != self.new.len() => Err(StorageError::InvalidDiff(format!(
                "{:?} diff must be {} bytes, got {}",
                self.kind,
                width,
                self.new.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Range of the page touched by this diff, validated against the page
    /// extent. The system header is off limits.
    pub fn range(&self, page_len: usize) -> StorageResult<Range<usize>> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.new.len())
            .ok_or_else(|| StorageError::InvalidDiff("diff length overflows".into()))?;
        if start < PAGE_HEADER_SIZE {
            return Err(StorageError::InvalidDiff(format!(
                "diff at offset {} overlaps the page header",
                start
            )));
        }
        if end > page_len {
            return Err(StorageError::InvalidDiff(format!(
                "diff {}..{} crosses the page boundary at {}",
                start, end, page_len
            )));
        }
        Ok(start..end)
    }

    /// Writes the new image (redo).
    pub fn apply(&self, page: &mut [u8]) -> StorageResult<()> {
        let range = self.range(page.len())?;
        page[range].copy_from_slice(&self.new);
        Ok(())
    }

    /// Writes the old image back (undo).
    pub fn revert(&self, page: &mut [u8]) -> StorageResult<()> {
        let old = self.old.as_ref().ok_or_else(|| {
            StorageError::InvalidDiff(format!(
                "diff at offset {} carries no undo image",
                self.offset
            ))
        })?;
        let range = self.range(page.len())?;
        page[range].copy_from_slice(old);
        Ok(())
    }
}

/// Replays diffs in order. Every diff is validated before the page is touched.
pub fn restore_changes(page: &mut [u8], diffs: &[PageDiff]) -> StorageResult<()> {
    for diff in diffs {
        diff.range(page.len())?;
    }
    for diff in diffs {
        diff.apply(page)?;
    }
    Ok(())
}

/// Undoes diffs in reverse order. Fails without touching the page if any diff
/// is redo-only or out of bounds.
pub fn revert_changes(page: &mut [u8], diffs: &[PageDiff]) -> StorageResult<()> {
    for diff in diffs {
        diff.range(page.len())?;
        if !diff.is_full() {
            return Err(StorageError::InvalidDiff(format!(
                "diff at offset {} carries no undo image",
                diff.offset
            )));
        }
    }
    for diff in diffs.iter().rev() {
        diff.revert(page)?;
    }
    Ok(())
}

/// Collects the diffs produced through a [`DurablePage`](super::DurablePage).
#[derive(Debug, Clone, Default)]
pub struct DiffRecorder {
    diffs: Vec<PageDiff>,
    redo_only: bool,
}

impl DiffRecorder {
    /// Records full diffs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records redo-only diffs, for pages whose prior content is irrelevant.
    pub fn redo_only() -> Self {
        Self {
            diffs: Vec::new(),
            redo_only: true,
        }
    }

    pub fn is_redo_only(&self) -> bool {
        self.redo_only
    }

    pub(crate) fn record(&mut self, kind: DiffKind, offset: usize, old: &[u8], new: &[u8]) -> StorageResult<()> {
        let offset = u32::try_from(offset)
            .map_err(|_| StorageError::InvalidDiff(format!("offset {} out of range", offset)))?;
        let diff = if self.redo_only {
            PageDiff::partial(kind, offset, new.to_vec())?
        } else {
            PageDiff::full(kind, offset, old.to_vec(), new.to_vec())?
        };
        self.diffs.push(diff);
        Ok(())
    }

    pub fn diffs(&self) -> &[PageDiff] {
        &self.diffs
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn take(&mut self) -> Vec<PageDiff> {
        std::mem::take(&mut self.diffs)
    }
}
