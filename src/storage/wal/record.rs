//! WAL record types and structures.
//!
//! Defines the various types of WAL records used for logging page mutations
//! and atomic operation boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageDiff, PageKey};
use crate::transaction::OperationUnitId;

/// Log Sequence Number: the segment a record lives in and its byte position
/// inside that segment. LSNs are totally ordered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn {
    pub segment: u64,
    pub position: u64,
}

impl Lsn {
    /// Sorts before every record; segments are numbered from 1.
    pub const ZERO: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    pub fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({}:{})", self.segment, self.position)
    }
}

/// WAL record type tags, as written in the frame's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
    AtomicUnitStart = 1,
    AtomicUnitEnd = 2,
    UpdatePage = 3,
    FileCreated = 4,
    FileDeleted = 5,
    NonTxOperationPerformed = 6,
    CheckpointStart = 7,
    CheckpointEnd = 8,
}

impl TryFrom<u8> for WalRecordType {
    type Error = StorageError;

    fn try_from(tag: u8) -> StorageResult<Self> {
        Ok(match tag {
            1 => WalRecordType::AtomicUnitStart,
            2 => WalRecordType::AtomicUnitEnd,
            3 => WalRecordType::UpdatePage,
            4 => WalRecordType::FileCreated,
            5 => WalRecordType::FileDeleted,
            6 => WalRecordType::NonTxOperationPerformed,
            7 => WalRecordType::CheckpointStart,
            8 => WalRecordType::CheckpointEnd,
            other => {
                return Err(StorageError::Corruption(format!(
                    "unknown WAL record type {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicUnitStartRecord {
    pub unit_id: OperationUnitId,
    /// Opaque caller data attached to the operation.
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicUnitEndRecord {
    pub unit_id: OperationUnitId,
    /// The operation was rolled back in process.
    pub rollback: bool,
}

/// Diffs applied to one page by one step of an atomic operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePageRecord {
    pub unit_id: OperationUnitId,
    pub file_id: FileId,
    pub page_index: u64,
    /// Previous record of the same unit, if any.
    pub prev_unit_lsn: Option<Lsn>,
    pub diffs: Vec<PageDiff>,
}

impl UpdatePageRecord {
    pub fn page_key(&self) -> PageKey {
        PageKey::new(self.file_id, self.page_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreatedRecord {
    pub unit_id: OperationUnitId,
    pub file_id: FileId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeletedRecord {
    pub unit_id: OperationUnitId,
    pub file_id: FileId,
}

/// A change was made outside of any atomic operation; the log alone can no
/// longer reproduce that file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonTxOperationRecord {
    pub file_id: FileId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Taken while operations run; replay starts at `redo_lsn`.
    Fuzzy,
    /// Taken after every dirty page was flushed.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStartRecord {
    pub kind: CheckpointKind,
    /// Recovery replays from here.
    pub redo_lsn: Lsn,
    /// Largest operation unit id handed out when the checkpoint began.
    pub unit_id_watermark: OperationUnitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEndRecord {
    pub start_lsn: Lsn,
}

/// A WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicUnitStart(AtomicUnitStartRecord),
    AtomicUnitEnd(AtomicUnitEndRecord),
    UpdatePage(UpdatePageRecord),
    FileCreated(FileCreatedRecord),
    FileDeleted(FileDeletedRecord),
    NonTxOperationPerformed(NonTxOperationRecord),
    CheckpointStart(CheckpointStartRecord),
    CheckpointEnd(CheckpointEndRecord),
}

impl WalRecord {
    pub fn atomic_unit_start(unit_id: OperationUnitId, metadata: Option<Vec<u8>>) -> Self {
        WalRecord::AtomicUnitStart(AtomicUnitStartRecord { unit_id, metadata })
    }

    pub fn atomic_unit_end(unit_id: OperationUnitId, rollback: bool) -> Self {
        WalRecord::AtomicUnitEnd(AtomicUnitEndRecord { unit_id, rollback })
    }

    pub fn update_page(
        unit_id: OperationUnitId,
        key: PageKey,
        prev_unit_lsn: Option<Lsn>,
        diffs: Vec<PageDiff>,
    ) -> Self {
        WalRecord::UpdatePage(UpdatePageRecord {
            unit_id,
            file_id: key.file_id,
            page_index: key.page_index,
            prev_unit_lsn,
            diffs,
        })
    }

    pub fn file_created(unit_id: OperationUnitId, file_id: FileId, name: impl Into<String>) -> Self {
        WalRecord::FileCreated(FileCreatedRecord {
            unit_id,
            file_id,
            name: name.into(),
        })
    }

    pub fn file_deleted(unit_id: OperationUnitId, file_id: FileId) -> Self {
        WalRecord::FileDeleted(FileDeletedRecord { unit_id, file_id })
    }

    pub fn non_tx_operation(file_id: FileId) -> Self {
        WalRecord::NonTxOperationPerformed(NonTxOperationRecord { file_id })
    }

    pub fn checkpoint_start(
        kind: CheckpointKind,
        redo_lsn: Lsn,
        unit_id_watermark: OperationUnitId,
    ) -> Self {
        WalRecord::CheckpointStart(CheckpointStartRecord {
            kind,
            redo_lsn,
            unit_id_watermark,
        })
    }

    pub fn checkpoint_end(start_lsn: Lsn) -> Self {
        WalRecord::CheckpointEnd(CheckpointEndRecord { start_lsn })
    }

    pub fn record_type(&self) -> WalRecordType {
        match self {
            WalRecord::AtomicUnitStart(_) => WalRecordType::AtomicUnitStart,
            WalRecord::AtomicUnitEnd(_) => WalRecordType::AtomicUnitEnd,
            WalRecord::UpdatePage(_) => WalRecordType::UpdatePage,
            WalRecord::FileCreated(_) => WalRecordType::FileCreated,
            WalRecord::FileDeleted(_) => WalRecordType::FileDeleted,
            WalRecord::NonTxOperationPerformed(_) => WalRecordType::NonTxOperationPerformed,
            WalRecord::CheckpointStart(_) => WalRecordType::CheckpointStart,
            WalRecord::CheckpointEnd(_) => WalRecordType::CheckpointEnd,
        }
    }

    /// The atomic operation this record belongs to, if any.
    pub fn unit_id(&self) -> Option<OperationUnitId> {
        match self {
            WalRecord::AtomicUnitStart(r) => Some(r.unit_id),
            WalRecord::AtomicUnitEnd(r) => Some(r.unit_id),
            WalRecord::UpdatePage(r) => Some(r.unit_id),
            WalRecord::FileCreated(r) => Some(r.unit_id),
            WalRecord::FileDeleted(r) => Some(r.unit_id),
            WalRecord::NonTxOperationPerformed(_)
            | WalRecord::CheckpointStart(_)
            | WalRecord::CheckpointEnd(_) => None,
        }
    }

    /// Serializes the type-specific payload.
    pub fn encode_payload(&self) -> StorageResult<Vec<u8>> {
        let bytes = match self {
            WalRecord::AtomicUnitStart(r) => bincode::serialize(r)?,
            WalRecord::AtomicUnitEnd(r) => bincode::serialize(r)?,
            WalRecord::UpdatePage(r) => bincode::serialize(r)?,
            WalRecord::FileCreated(r) => bincode::serialize(r)?,
            WalRecord::FileDeleted(r) => bincode::serialize(r)?,
            WalRecord::NonTxOperationPerformed(r) => bincode::serialize(r)?,
            WalRecord::CheckpointStart(r) => bincode::serialize(r)?,
            WalRecord::CheckpointEnd(r) => bincode::serialize(r)?,
        };
        Ok(bytes)
    }

    /// Rebuilds a record from its type tag and payload.
    pub fn decode(tag: u8, payload: &[u8]) -> StorageResult<Self> {
        let record = match WalRecordType::try_from(tag)? {
            WalRecordType::AtomicUnitStart => WalRecord::AtomicUnitStart(bincode::deserialize(payload)?),
            WalRecordType::AtomicUnitEnd => WalRecord::AtomicUnitEnd(bincode::deserialize(payload)?),
            WalRecordType::UpdatePage => WalRecord::UpdatePage(bincode::deserialize(payload)?),
            WalRecordType::FileCreated => WalRecord::FileCreated(bincode::deserialize(payload)?),
            WalRecordType::FileDeleted => WalRecord::FileDeleted(bincode::deserialize(payload)?),
            WalRecordType::NonTxOperationPerformed => {
                WalRecord::NonTxOperationPerformed(bincode::deserialize(payload)?)
            }
            WalRecordType::CheckpointStart => WalRecord::CheckpointStart(bincode::deserialize(payload)?),
            WalRecordType::CheckpointEnd => WalRecord::CheckpointEnd(bincode::deserialize(payload)?),
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DiffKind;

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::ZERO < Lsn::new(1, 0));
        assert!(Lsn::new(1, 500) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
        assert_eq!(Lsn::new(3, 4).to_string(), "LSN(3:4)");
    }

    #[test]
    fn test_update_page_payload() {
        let key = PageKey::new(FileId::compose(1, 3), 9);
        let diff = PageDiff::full(DiffKind::Int, 40, vec![0; 4], vec![1, 0, 0, 0]).unwrap();
        let record = WalRecord::update_page(OperationUnitId::new(17), key, Some(Lsn::new(1, 0)), vec![diff]);

        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode(record.record_type() as u8, &payload).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.unit_id(), Some(OperationUnitId::new(17)));

        match decoded {
            WalRecord::UpdatePage(update) => assert_eq!(update.page_key(), key),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        assert!(matches!(
            WalRecord::decode(200, &[]),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_checkpoint_records_have_no_unit() {
        let start = WalRecord::checkpoint_start(CheckpointKind::Fuzzy, Lsn::new(1, 0), OperationUnitId::new(5));
        assert_eq!(start.unit_id(), None);
        assert_eq!(start.record_type(), WalRecordType::CheckpointStart);
    }
}
