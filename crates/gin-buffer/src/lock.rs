//! Advisory page-level locks.
//!
//! These are heavyweight locks keyed by block number, independent of buffer
//! content latches. The pending-list cleanup uses one on the metapage block
//! to serialize drains.

use gin_common::page::BlockNumber;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Table of exclusively held page locks for one relation.
#[derive(Debug, Default)]
pub struct PageLockTable {
    held: Mutex<HashSet<BlockNumber>>,
    released: Condvar,
}

impl PageLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock on `block`, waiting for any holder to release it.
    pub fn lock(&self, block: BlockNumber) -> PageLockGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(&block) {
            self.released.wait(&mut held);
        }
        held.insert(block);
        PageLockGuard { table: self, block }
    }

    /// Acquires the lock on `block` only if it is free.
    pub fn try_lock(&self, block: BlockNumber) -> Option<PageLockGuard<'_>> {
        let mut held = self.held.lock();
        if held.contains(&block) {
            return None;
        }
        held.insert(block);
        Some(PageLockGuard { table: self, block })
    }

    pub fn is_locked(&self, block: BlockNumber) -> bool {
        self.held.lock().contains(&block)
    }

    fn release(&self, block: BlockNumber) {
        self.held.lock().remove(&block);
        self.released.notify_all();
    }
}

/// RAII guard releasing a page lock on drop.
#[derive(Debug)]
pub struct PageLockGuard<'a> {
    table: &'a PageLockTable,
    block: BlockNumber,
}

impl PageLockGuard<'_> {
    pub fn block(&self) -> BlockNumber {
        self.block
    }
}

impl Drop for PageLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_try_lock_conflicts() {
        let table = PageLockTable::new();
        let guard = table.lock(0);
        assert!(table.is_locked(0));
        assert!(table.try_lock(0).is_none());
        assert!(table.try_lock(1).is_some());
        drop(guard);
        assert!(!table.is_locked(0));
        assert!(table.try_lock(0).is_some());
    }

    #[test]
    fn test_lock_waits_for_release() {
        let table = Arc::new(PageLockTable::new());
        let acquired = Arc::new(AtomicBool::new(false));
        let guard = table.lock(0);

        let handle = {
            let table = table.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _g = table.lock(0);
                acquired.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
