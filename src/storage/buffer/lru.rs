use super::replacer::Replacer;
use crate::storage::page::PageKey;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Evictable pages by the tick they were last unpinned at (oldest first)
    order: BTreeMap<u64, PageKey>,
    /// Tick of each evictable page, for O(log n) removal
    ticks: HashMap<PageKey, u64>,
    clock: u64,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self, accept: &mut dyn FnMut(&PageKey) -> bool) -> Option<PageKey> {
        let (tick, key) = self
            .order
            .iter()
            .find(|(_, key)| accept(key))
            .map(|(tick, key)| (*tick, *key))?;
        self.order.remove(&tick);
        self.ticks.remove(&key);
        Some(key)
    }

    fn pin(&mut self, key: PageKey) {
        self.remove(key);
    }

    fn unpin(&mut self, key: PageKey) {
        self.remove(key);
        self.clock += 1;
        self.order.insert(self.clock, key);
        self.ticks.insert(key, self.clock);
    }

    fn remove(&mut self, key: PageKey) {
        if let Some(tick) = self.ticks.remove(&key) {
            self.order.remove(&tick);
        }
    }

    fn size(&self) -> usize {
        self.order.len()
    }
}
