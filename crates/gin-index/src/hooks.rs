//! Integration points with the host: predicate locking, cancellation,
//! transaction horizons and fault injection.

use gin_common::page::BlockNumber;
use gin_common::{GinError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Serializable-isolation hooks. Reads register page locks; writes check
/// for conflicts against them.
pub trait PredicateLocker: Send + Sync {
    fn lock_page(&self, _block: BlockNumber) {}

    fn check_conflict(&self, _block: BlockNumber) -> Result<()> {
        Ok(())
    }

    /// Carries locks held on `old` over to `new` after a split.
    fn page_split(&self, _old: BlockNumber, _new: BlockNumber) {}
}

/// Predicate locker for isolation levels that need none.
#[derive(Debug, Default)]
pub struct NoPredicateLocks;

impl PredicateLocker for NoPredicateLocks {}

/// Predicate locker that records every call.
#[derive(Debug, Default)]
pub struct RecordingPredicateLocker {
    locked: Mutex<Vec<BlockNumber>>,
    checked: Mutex<Vec<BlockNumber>>,
    splits: Mutex<Vec<(BlockNumber, BlockNumber)>>,
}

impl RecordingPredicateLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked_pages(&self) -> Vec<BlockNumber> {
        self.locked.lock().clone()
    }

    pub fn checked_pages(&self) -> Vec<BlockNumber> {
        self.checked.lock().clone()
    }

    pub fn splits(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.splits.lock().clone()
    }
}

impl PredicateLocker for RecordingPredicateLocker {
    fn lock_page(&self, block: BlockNumber) {
        self.locked.lock().push(block);
    }

    fn check_conflict(&self, block: BlockNumber) -> Result<()> {
        self.checked.lock().push(block);
        Ok(())
    }

    fn page_split(&self, old: BlockNumber, new: BlockNumber) {
        self.splits.lock().push((old, new));
    }
}

/// Shared cancellation flag observed at interrupt-check points.
#[derive(Debug, Clone, Default)]
pub struct InterruptCheck {
    canceled: Arc<AtomicBool>,
}

impl InterruptCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.canceled.store(false, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(GinError::QueryCanceled);
        }
        Ok(())
    }
}

/// Transaction ids as seen by the index: the id stamped on modifications
/// and the horizon below which deleted pages may be recycled.
#[derive(Debug)]
pub struct TransactionContext {
    next_xid: AtomicU32,
    /// Oldest xid still running; 0 means none besides the current one.
    oldest_active: AtomicU32,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self {
            next_xid: AtomicU32::new(FIRST_NORMAL_XID),
            oldest_active: AtomicU32::new(0),
        }
    }
}

/// First xid handed out; lower values are reserved.
pub const FIRST_NORMAL_XID: u32 = 3;

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh xid to a modifying operation.
    pub fn assign_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::AcqRel)
    }

    /// Next xid to be assigned.
    pub fn next_xid(&self) -> u32 {
        self.next_xid.load(Ordering::Acquire)
    }

    /// Pins the horizon at `xid`, as an open snapshot would.
    pub fn hold_horizon(&self, xid: u32) {
        self.oldest_active.store(xid, Ordering::Release);
    }

    pub fn release_horizon(&self) {
        self.oldest_active.store(0, Ordering::Release);
    }

    /// Oldest xid that may still see deleted pages.
    pub fn oldest_active(&self) -> u32 {
        match self.oldest_active.load(Ordering::Acquire) {
            0 => self.next_xid(),
            xid => xid,
        }
    }
}

/// Action run when code reaches an injection point.
pub type InjectionCallback = Arc<dyn Fn() + Send + Sync>;

/// Named fault-injection points. An attached point makes the code that
/// reaches it fail with `InjectedFault`; a point with a callback runs it
/// and carries on.
#[derive(Default)]
pub struct InjectionPoints {
    attached: Mutex<HashSet<String>>,
    callbacks: Mutex<HashMap<String, InjectionCallback>>,
}

impl InjectionPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, name: &str) {
        self.attached.lock().insert(name.to_string());
    }

    /// Runs `callback` every time the point is reached, until detached.
    pub fn attach_callback(&self, name: &str, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .insert(name.to_string(), Arc::new(callback));
    }

    pub fn detach(&self, name: &str) {
        self.attached.lock().remove(name);
        self.callbacks.lock().remove(name);
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.attached.lock().contains(name) || self.callbacks.lock().contains_key(name)
    }

    pub fn run(&self, name: &str) -> Result<()> {
        if self.attached.lock().contains(name) {
            return Err(GinError::InjectedFault(name.to_string()));
        }
        // Cloned out so the callback may detach points itself.
        let callback = self.callbacks.lock().get(name).cloned();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }
}

impl std::fmt::Debug for InjectionPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionPoints")
            .field("attached", &*self.attached.lock())
            .field("callbacks", &self.callbacks.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The host hooks bundled together.
pub struct Hooks {
    pub predicate: Arc<dyn PredicateLocker>,
    pub interrupt: InterruptCheck,
    pub transactions: Arc<TransactionContext>,
    pub injection: InjectionPoints,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            predicate: Arc::new(NoPredicateLocks),
            interrupt: InterruptCheck::new(),
            transactions: Arc::new(TransactionContext::new()),
            injection: InjectionPoints::new(),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("interrupt", &self.interrupt)
            .field("transactions", &self.transactions)
            .field("injection", &self.injection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag() {
        let flag = InterruptCheck::new();
        assert!(flag.check().is_ok());
        let other = flag.clone();
        other.cancel();
        assert!(matches!(flag.check(), Err(GinError::QueryCanceled)));
        flag.reset();
        assert!(other.check().is_ok());
    }

    #[test]
    fn test_horizon_defaults_to_next_xid() {
        let txn = TransactionContext::new();
        let a = txn.assign_xid();
        assert_eq!(a, FIRST_NORMAL_XID);
        assert_eq!(txn.oldest_active(), a + 1);
        txn.hold_horizon(a);
        txn.assign_xid();
        assert_eq!(txn.oldest_active(), a);
        txn.release_horizon();
        assert_eq!(txn.oldest_active(), a + 2);
    }

    #[test]
    fn test_injection_points() {
        let points = InjectionPoints::new();
        assert!(points.run("x").is_ok());
        points.attach("x");
        assert!(matches!(points.run("x"), Err(GinError::InjectedFault(n)) if n == "x"));
        points.detach("x");
        assert!(points.run("x").is_ok());

        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        points.attach_callback("y", move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(points.is_attached("y"));
        points.run("y").unwrap();
        points.run("y").unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        points.detach("y");
        points.run("y").unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_recording_locker() {
        let locker = RecordingPredicateLocker::new();
        locker.lock_page(4);
        locker.check_conflict(5).unwrap();
        locker.page_split(4, 9);
        assert_eq!(locker.locked_pages(), vec![4]);
        assert_eq!(locker.checked_pages(), vec![5]);
        assert_eq!(locker.splits(), vec![(4, 9)]);
    }
}
