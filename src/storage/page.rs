//! Page identity and the durable page abstraction.
//!
//! A page is a fixed-size block of one data file. Its first bytes are a system
//! header (see [`layout`]) managed by the engine; the rest is the data area
//! that [`DurablePage`] exposes to callers through typed accessors.

pub mod diff;
pub mod durable;
pub mod layout;
pub mod record;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use diff::{restore_changes, revert_changes, DiffKind, DiffRecorder, PageDiff};
pub use durable::{DurablePage, PageView};
pub use layout::{Field, PAGE_HEADER_SIZE};

/// Identifier of a data file.
///
/// The high 32 bits carry the id of the owning storage and the low 32 bits
/// the file's local id inside that storage, so several storages can share
/// one cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl FileId {
    pub fn compose(storage_id: u32, local_id: u32) -> Self {
        FileId(((storage_id as u64) << 32) | local_id as u64)
    }

    pub fn storage_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn local_id(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage_id(), self.local_id())
    }
}

/// Identity of one page: the file it belongs to and its index in that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_id, self.page_index)
    }
}
