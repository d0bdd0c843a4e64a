//! Atomic operation unit ids.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one atomic operation in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationUnitId(pub u64);

impl OperationUnitId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unit{}", self.0)
    }
}

/// A thread-safe unit id generator.
///
/// Ids must stay unique across restarts, so after replaying the log the
/// generator is moved past every id found there.
pub struct OperationUnitIdGenerator {
    next_id: AtomicU64,
}

impl OperationUnitIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> OperationUnitId {
        OperationUnitId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Last id handed out, or 0 if none.
    pub fn current(&self) -> OperationUnitId {
        OperationUnitId::new(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Makes sure every later id is greater than `seen`.
    pub fn advance_past(&self, seen: OperationUnitId) {
        self.next_id.fetch_max(seen.0 + 1, Ordering::SeqCst);
    }
}

impl Default for OperationUnitIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_display_and_ordering() {
        assert_eq!(OperationUnitId::new(123).to_string(), "Unit123");
        assert!(OperationUnitId::new(1) < OperationUnitId::new(2));
    }

    #[test]
    fn test_generator_sequence() {
        let generator = OperationUnitIdGenerator::new();
        assert_eq!(generator.current().value(), 0);
        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
        assert_eq!(generator.current().value(), 2);
    }

    #[test]
    fn test_advance_past() {
        let generator = OperationUnitIdGenerator::new();
        generator.advance_past(OperationUnitId::new(41));
        assert_eq!(generator.next().value(), 42);

        // Never moves backwards
        generator.advance_past(OperationUnitId::new(5));
        assert_eq!(generator.next().value(), 43);
    }

    #[test]
    fn test_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(OperationUnitIdGenerator::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next().value()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
        all_ids.sort();
        all_ids.dedup();
        assert_eq!(all_ids.len(), 1000);
    }
}
