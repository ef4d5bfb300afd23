//! TID bitmap with lossy pages.
//!
//! A block is either tracked exactly, as a set of offsets, or lossily, as
//! "any tuple on this block may match". Once lossy, a block never goes back
//! to exact, and exact offsets are never kept for a lossy block.
//!
//! When the number of exact blocks exceeds the memory budget, the blocks
//! holding the most offsets are converted to lossy first.

use crate::tid::ItemPointer;
use gin_common::page::{BlockNumber, OffsetNumber};
use roaring::RoaringBitmap;
use std::collections::BTreeMap;

/// Rough per-block cost used to turn a byte budget into a block limit.
const PAGE_ENTRY_BYTES: usize = 64;

#[derive(Debug, Clone)]
enum PageEntry {
    Exact { offsets: RoaringBitmap, recheck: bool },
    Lossy,
}

/// One block of bitmap output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapPage {
    pub block: BlockNumber,
    /// Matching offsets, ascending. Empty for a lossy block.
    pub offsets: Vec<OffsetNumber>,
    pub lossy: bool,
    /// The caller must recheck the matched tuples.
    pub recheck: bool,
}

impl BitmapPage {
    /// The block's matches as item pointers; a lossy block yields its
    /// whole-page pointer.
    pub fn items(&self) -> Vec<ItemPointer> {
        if self.lossy {
            return vec![ItemPointer::lossy_page(self.block)];
        }
        self.offsets
            .iter()
            .map(|off| ItemPointer::new(self.block, *off))
            .collect()
    }
}

/// Set of heap TIDs, ordered by block.
#[derive(Debug, Clone, Default)]
pub struct TidBitmap {
    pages: BTreeMap<BlockNumber, PageEntry>,
    /// Most exact blocks kept before lossifying; 0 means unbounded.
    max_exact: usize,
    nexact: usize,
}

impl TidBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap that stays within roughly `bytes` of memory.
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            max_exact: (bytes / PAGE_ENTRY_BYTES).max(16),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of blocks with at least one match.
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    pub fn nlossy(&self) -> usize {
        self.pages.len() - self.nexact
    }

    /// Adds `tids`. A lossy pointer marks its whole block.
    pub fn add_tids(&mut self, tids: &[ItemPointer], recheck: bool) {
        for tid in tids {
            if tid.is_lossy() {
                self.add_page(tid.block);
                continue;
            }
            match self.pages.get_mut(&tid.block) {
                Some(PageEntry::Lossy) => {}
                Some(PageEntry::Exact {
                    offsets,
                    recheck: r,
                }) => {
                    offsets.insert(u32::from(tid.offset));
                    *r |= recheck;
                }
                None => {
                    let mut offsets = RoaringBitmap::new();
                    offsets.insert(u32::from(tid.offset));
                    self.pages
                        .insert(tid.block, PageEntry::Exact { offsets, recheck });
                    self.nexact += 1;
                }
            }
        }
        self.enforce_limit();
    }

    /// Marks every tuple of `block` as a possible match.
    pub fn add_page(&mut self, block: BlockNumber) {
        if let Some(PageEntry::Exact { .. }) = self.pages.insert(block, PageEntry::Lossy) {
            self.nexact -= 1;
        }
    }

    /// Adds everything in `other`.
    pub fn union(&mut self, other: &TidBitmap) {
        for (block, entry) in &other.pages {
            match entry {
                PageEntry::Lossy => self.add_page(*block),
                PageEntry::Exact { offsets, recheck } => match self.pages.get_mut(block) {
                    Some(PageEntry::Lossy) => {}
                    Some(PageEntry::Exact {
                        offsets: mine,
                        recheck: r,
                    }) => {
                        *mine |= offsets;
                        *r |= *recheck;
                    }
                    None => {
                        self.pages.insert(
                            *block,
                            PageEntry::Exact {
                                offsets: offsets.clone(),
                                recheck: *recheck,
                            },
                        );
                        self.nexact += 1;
                    }
                },
            }
        }
        self.enforce_limit();
    }

    /// Whether `tid` may match: `Some(recheck)` when it does.
    pub fn lookup(&self, tid: ItemPointer) -> Option<bool> {
        match self.pages.get(&tid.block)? {
            PageEntry::Lossy => Some(true),
            PageEntry::Exact { offsets, recheck } => {
                offsets.contains(u32::from(tid.offset)).then_some(*recheck)
            }
        }
    }

    /// Matches in block order.
    pub fn pages(&self) -> impl Iterator<Item = BitmapPage> + '_ {
        self.pages.iter().map(|(block, entry)| match entry {
            PageEntry::Lossy => BitmapPage {
                block: *block,
                offsets: Vec::new(),
                lossy: true,
                recheck: true,
            },
            PageEntry::Exact { offsets, recheck } => BitmapPage {
                block: *block,
                offsets: offsets.iter().map(|o| o as OffsetNumber).collect(),
                lossy: false,
                recheck: *recheck,
            },
        })
    }

    /// All matches as item pointers, lossy blocks as whole-page pointers.
    pub fn to_items(&self) -> Vec<ItemPointer> {
        self.pages().flat_map(|p| p.items()).collect()
    }

    /// Number of exact TIDs plus one per lossy block.
    pub fn ntids(&self) -> u64 {
        self.pages
            .values()
            .map(|e| match e {
                PageEntry::Lossy => 1,
                PageEntry::Exact { offsets, .. } => offsets.len(),
            })
            .sum()
    }

    fn enforce_limit(&mut self) {
        if self.max_exact == 0 || self.nexact <= self.max_exact {
            return;
        }
        // Lossify down to half the limit so the next inserts have room.
        let target = self.max_exact / 2;
        let mut exact: Vec<(BlockNumber, u64)> = self
            .pages
            .iter()
            .filter_map(|(b, e)| match e {
                PageEntry::Exact { offsets, .. } => Some((*b, offsets.len())),
                PageEntry::Lossy => None,
            })
            .collect();
        exact.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (block, _) in exact {
            if self.nexact <= target {
                break;
            }
            self.add_page(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_lossy_are_exclusive() {
        let mut bm = TidBitmap::new();
        bm.add_tids(&[ItemPointer::new(1, 3), ItemPointer::new(1, 1)], false);
        bm.add_tids(&[ItemPointer::new(2, 5)], true);
        assert_eq!(bm.lookup(ItemPointer::new(1, 3)), Some(false));
        assert_eq!(bm.lookup(ItemPointer::new(1, 2)), None);
        assert_eq!(bm.lookup(ItemPointer::new(2, 5)), Some(true));

        bm.add_page(1);
        bm.add_tids(&[ItemPointer::new(1, 9)], false);
        let pages: Vec<_> = bm.pages().collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].lossy);
        assert!(pages[0].offsets.is_empty());
        assert_eq!(pages[1].offsets, vec![5]);
        assert_eq!(bm.lookup(ItemPointer::new(1, 77)), Some(true));
        assert_eq!(
            bm.to_items(),
            vec![ItemPointer::lossy_page(1), ItemPointer::new(2, 5)]
        );
        assert_eq!(bm.ntids(), 2);
    }

    #[test]
    fn test_lossy_tid_marks_page() {
        let mut bm = TidBitmap::new();
        bm.add_tids(&[ItemPointer::new(4, 1), ItemPointer::lossy_page(4)], false);
        assert_eq!(bm.nlossy(), 1);
        assert_eq!(bm.npages(), 1);
    }

    #[test]
    fn test_union() {
        let mut a = TidBitmap::new();
        a.add_tids(&[ItemPointer::new(1, 1)], false);
        let mut b = TidBitmap::new();
        b.add_tids(&[ItemPointer::new(1, 2), ItemPointer::new(3, 1)], true);
        b.add_page(5);
        a.union(&b);
        assert_eq!(a.lookup(ItemPointer::new(1, 1)), Some(true));
        assert_eq!(a.npages(), 3);
        assert_eq!(a.nlossy(), 1);
    }

    #[test]
    fn test_memory_limit_lossifies() {
        let mut bm = TidBitmap::with_memory_limit(16 * PAGE_ENTRY_BYTES);
        for block in 0..100u32 {
            bm.add_tids(&[ItemPointer::new(block, 1)], false);
        }
        assert_eq!(bm.npages(), 100);
        assert!(bm.nlossy() > 0);
        assert!(bm.npages() - bm.nlossy() <= 16);
        // Every block still matches.
        for block in 0..100u32 {
            assert!(bm.lookup(ItemPointer::new(block, 1)).is_some());
        }
    }
}
