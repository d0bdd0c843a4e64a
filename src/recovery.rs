//! Recovery and crash resilience module.
//!
//! This module handles storage recovery, including:
//! - Crash recovery by replaying the write-ahead log
//! - Redo of committed and undo of torn atomic operations
//! - Fuzzy and full checkpoints bounding replay and WAL growth

pub mod checkpoint;
pub mod replay;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use replay::{LogReplay, RecoveryStats};
