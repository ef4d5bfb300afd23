//! In-memory accumulator of (key, TID) pairs.
//!
//! Used by the serial build, by parallel build workers and by the
//! pending-list drain. TIDs usually arrive in ascending order per key; a
//! key whose TIDs arrived out of order is sorted when it is drained.

use crate::posting;
use crate::state::{EntryKey, GinState};
use crate::tid::ItemPointer;
use std::collections::HashMap;

/// Estimated bookkeeping cost of one distinct key.
const ENTRY_OVERHEAD: usize = size_of::<EntryKey>() + size_of::<AccumEntry>() + 32;

#[derive(Debug)]
struct AccumEntry {
    items: Vec<ItemPointer>,
    should_sort: bool,
}

/// Accumulates TID lists per key.
#[derive(Debug, Default)]
pub struct BuildAccumulator {
    entries: HashMap<EntryKey, AccumEntry>,
    allocated: usize,
    /// Largest TID added so far.
    last_tid: Option<ItemPointer>,
}

impl BuildAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds heap row `tid` under each of `keys`.
    pub fn insert(&mut self, tid: ItemPointer, keys: &[EntryKey]) {
        for key in keys {
            match self.entries.get_mut(key) {
                Some(entry) => {
                    if entry.items.capacity() == entry.items.len() {
                        self.allocated += entry.items.len().max(1) * ItemPointer::SIZE;
                    }
                    if !entry.should_sort && entry.items.last().is_some_and(|last| *last > tid) {
                        entry.should_sort = true;
                    }
                    entry.items.push(tid);
                }
                None => {
                    self.allocated += ENTRY_OVERHEAD + key.key.len() + ItemPointer::SIZE;
                    let mut items = Vec::with_capacity(1);
                    items.push(tid);
                    self.entries.insert(
                        key.clone(),
                        AccumEntry {
                            items,
                            should_sort: false,
                        },
                    );
                }
            }
        }
        self.last_tid = Some(self.last_tid.map_or(tid, |last| last.max(tid)));
    }

    /// Approximate memory held, in bytes.
    pub fn allocated_memory(&self) -> usize {
        self.allocated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_tid(&self) -> Option<ItemPointer> {
        self.last_tid
    }

    /// Empties the accumulator, returning its keys in index order, each
    /// with a sorted, deduplicated TID list.
    pub fn drain_sorted(&mut self, state: &GinState) -> Vec<(EntryKey, Vec<ItemPointer>)> {
        let mut out: Vec<(EntryKey, Vec<ItemPointer>)> = self
            .entries
            .drain()
            .map(|(key, mut entry)| {
                if entry.should_sort {
                    posting::sort_dedup(&mut entry.items);
                } else {
                    entry.items.dedup();
                }
                (key, entry.items)
            })
            .collect();
        out.sort_by(|a, b| state.compare_keys(&a.0, &b.0));
        self.allocated = 0;
        self.last_tid = None;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::ArrayOps;
    use crate::tuple::NullCategory;
    use gin_common::IndexOptions;
    use std::sync::Arc;

    fn state() -> GinState {
        GinState::new(vec![Arc::new(ArrayOps)], &IndexOptions::default()).unwrap()
    }

    #[test]
    fn test_drain_orders_keys_and_items() {
        let state = state();
        let mut acc = BuildAccumulator::new();
        let b = EntryKey::norm(1, "b");
        let a = EntryKey::norm(1, "a");
        let null = EntryKey::placeholder(1, NullCategory::NullItem);
        acc.insert(ItemPointer::new(2, 1), &[b.clone(), a.clone()]);
        acc.insert(ItemPointer::new(1, 1), &[b.clone()]);
        acc.insert(ItemPointer::new(3, 1), &[null.clone()]);
        assert_eq!(acc.len(), 3);
        assert_eq!(acc.last_tid(), Some(ItemPointer::new(3, 1)));

        let drained = acc.drain_sorted(&state);
        let keys: Vec<_> = drained.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![a, b, null]);
        assert_eq!(
            drained[1].1,
            vec![ItemPointer::new(1, 1), ItemPointer::new(2, 1)]
        );
        assert!(acc.is_empty());
        assert_eq!(acc.allocated_memory(), 0);
    }

    #[test]
    fn test_memory_grows_with_items() {
        let mut acc = BuildAccumulator::new();
        let key = EntryKey::norm(1, "k");
        acc.insert(ItemPointer::new(0, 1), std::slice::from_ref(&key));
        let one = acc.allocated_memory();
        for i in 2..1000 {
            acc.insert(ItemPointer::new(0, i), std::slice::from_ref(&key));
        }
        assert!(acc.allocated_memory() > one + 900 * ItemPointer::SIZE / 2);
    }
}
