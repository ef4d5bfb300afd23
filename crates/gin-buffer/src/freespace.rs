//! Free space map of recyclable index pages.
//!
//! Index pages are either in use or entirely free, so the map is a set of
//! block numbers rather than per-page space levels. Vacuum records deleted
//! pages here; page allocation takes them back out.

use gin_common::page::BlockNumber;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Recyclable-page map for one relation.
#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    free: Mutex<BTreeSet<BlockNumber>>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `block` as reusable.
    pub fn record_free_page(&self, block: BlockNumber) {
        self.free.lock().insert(block);
    }

    /// Removes and returns the lowest recorded free page.
    pub fn get_free_page(&self) -> Option<BlockNumber> {
        self.free.lock().pop_first()
    }

    /// Forgets `block`, for pages found unusable on reuse.
    pub fn forget(&self, block: BlockNumber) {
        self.free.lock().remove(&block);
    }

    /// Drops every entry at or beyond `nblocks` (after truncation).
    pub fn truncate(&self, nblocks: BlockNumber) {
        self.free.lock().retain(|b| *b < nblocks);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        self.free.lock().contains(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let fsm = FreeSpaceMap::new();
        assert!(fsm.is_empty());
        fsm.record_free_page(9);
        fsm.record_free_page(4);
        fsm.record_free_page(4);
        assert_eq!(fsm.len(), 2);
        assert_eq!(fsm.get_free_page(), Some(4));
        assert_eq!(fsm.get_free_page(), Some(9));
        assert_eq!(fsm.get_free_page(), None);
    }

    #[test]
    fn test_forget_and_truncate() {
        let fsm = FreeSpaceMap::new();
        for b in [2, 5, 8, 11] {
            fsm.record_free_page(b);
        }
        fsm.forget(5);
        assert!(!fsm.contains(5));
        fsm.truncate(8);
        assert_eq!(fsm.len(), 1);
        assert!(fsm.contains(2));
    }
}
