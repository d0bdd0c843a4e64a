//! Atomic operations module.
//!
//! This module groups page changes into all-or-nothing units:
//! - Unit ids and the operations table
//! - Atomic operations bracketed by start/end WAL records
//! - In-process rollback from recorded page diffs
//! - Sessions with a single current-operation slot
//! - The freezer used by backup to quiesce writers

pub mod id;
pub mod manager;
pub mod operation;
pub mod session;

// Re-export commonly used types
pub use id::{OperationUnitId, OperationUnitIdGenerator};
pub use manager::{AtomicOperationsManager, OperationsFreeze};
pub use operation::AtomicOperation;
pub use session::Session;
