//! Write-Ahead Logging (WAL) module.
//!
//! This module implements the segmented write-ahead log, providing:
//! - Record framing with per-record checksums
//! - Log buffer management and flushing
//! - Log sequence number (LSN) management
//! - Segment rotation and truncation below the recovery point
//! - The master record pointing at the last completed checkpoint

pub mod manager;
pub mod master;
pub mod record;
pub mod segment;

pub use manager::{WalIter, WriteAheadLog};
pub use master::MasterRecord;
pub use record::{
    AtomicUnitEndRecord, AtomicUnitStartRecord, CheckpointEndRecord, CheckpointKind,
    CheckpointStartRecord, FileCreatedRecord, FileDeletedRecord, Lsn, NonTxOperationRecord,
    UpdatePageRecord, WalRecord, WalRecordType,
};
