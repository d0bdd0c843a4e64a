use std::fmt::Debug;

use crate::storage::page::PageKey;

pub trait Replacer: Send + Sync + Debug {
    /// Picks the least recently used evictable page that `accept` agrees to
    /// give up, and forgets it. Rejected pages stay tracked.
    fn evict(&mut self, accept: &mut dyn FnMut(&PageKey) -> bool) -> Option<PageKey>;

    /// Mark a page as pinned (not evictable).
    fn pin(&mut self, key: PageKey);

    /// Mark a page as unpinned (evictable), most recently used.
    fn unpin(&mut self, key: PageKey);

    /// Stop tracking a page.
    fn remove(&mut self, key: PageKey);

    /// Get the number of evictable pages.
    fn size(&self) -> usize;
}
