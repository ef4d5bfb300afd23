//! Per-entry TID streams.
//!
//! An entry is positioned once per scan and then advanced monotonically. Its
//! items come from one of three sources: an in-memory list (an inline
//! posting list), a bitmap (partial matches and empty-query entries collect
//! everything they match up front), or a posting tree read one leaf at a
//! time.

use crate::bitmap::{BitmapPage, TidBitmap};
use crate::btree::{self, Stack};
use crate::datapage::{DataTree, begin_posting_tree_scan};
use crate::entrypage::{EntryTree, page_tuple};
use crate::ginpage::{self, data_leaf_items, data_leaf_items_after, is_deleted, is_leaf, is_rightmost};
use crate::index::GinIndex;
use crate::opclass::{PartialMatch, SearchMode};
use crate::state::EntryKey;
use crate::tid::ItemPointer;
use crate::tuple::NullCategory;
use bytes::Bytes;
use gin_buffer::{Buffer, LockMode};
use gin_common::page::{self, FIRST_OFFSET};
use gin_common::{GinError, Result};
use rand::Rng;
use std::cmp::Ordering;
use tracing::trace;

/// Result of one attempt at positioning an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// The entry tree changed shape under the scan; start over.
    Restart,
}

/// Injection point hit while a partial-match walk holds no latch on the
/// entry leaf, after scanning a matched posting tree.
pub const PARTIAL_MATCH_UNLATCHED_INJECTION: &str = "gin-partial-match-unlatched";
/// Injection point that makes every partial-match walk over a posting tree
/// restart as if the entry tree had split.
pub const PARTIAL_MATCH_RESTART_INJECTION: &str = "gin-partial-match-force-restart";

/// One distinct search stream, possibly shared by several scan keys.
pub struct ScanEntry {
    pub attno: u16,
    pub strategy: u16,
    pub search_mode: SearchMode,
    pub query_key: Bytes,
    pub query_category: NullCategory,
    pub partial_match: bool,
    pub extra: Option<Bytes>,

    pub cur_item: ItemPointer,
    pub is_finished: bool,
    /// Estimated number of items the stream yields.
    pub predict: u64,
    /// Drop items at random to cap the result size.
    pub reduce: bool,
    /// Number of `get_item` calls.
    pub nadvances: u64,
    source: Source,
}

enum Source {
    Empty,
    List {
        items: Vec<ItemPointer>,
        pos: usize,
    },
    Bitmap {
        pages: std::vec::IntoIter<BitmapPage>,
        cur: Option<BitmapPage>,
        pos: usize,
    },
    Tree(TreeCursor),
}

/// Position inside a posting tree. The root stays pinned while the scan is
/// open so vacuum cannot delete pages from under it; the current leaf is
/// pinned but unlatched between calls.
struct TreeCursor {
    _root_pin: Buffer,
    tree: DataTree,
    leaf: Option<Buffer>,
    items: Vec<ItemPointer>,
    pos: usize,
}

impl ScanEntry {
    pub fn new(
        attno: u16,
        strategy: u16,
        search_mode: SearchMode,
        query_key: Bytes,
        query_category: NullCategory,
        partial_match: bool,
        extra: Option<Bytes>,
    ) -> Self {
        Self {
            attno,
            strategy,
            search_mode,
            query_key,
            query_category,
            partial_match,
            extra,
            cur_item: ItemPointer::MIN,
            is_finished: false,
            predict: 0,
            reduce: false,
            nadvances: 0,
            source: Source::Empty,
        }
    }

    fn search_key(&self) -> EntryKey {
        EntryKey::new(self.attno, self.query_category, self.query_key.clone())
    }

    fn reset(&mut self) {
        self.cur_item = ItemPointer::MIN;
        self.is_finished = true;
        self.predict = 0;
        self.reduce = false;
        self.source = Source::Empty;
    }

    /// Positions the stream, restarting when a partial-match walk sees the
    /// entry tree restructured.
    pub fn start(&mut self, index: &GinIndex) -> Result<()> {
        let max = index.config().max_restarts;
        for attempt in 0..=max {
            match self.try_start(index)? {
                Outcome::Done => return Ok(()),
                Outcome::Restart => {
                    trace!(index = index.name(), attno = self.attno, attempt, "restarting entry scan");
                }
            }
        }
        Err(GinError::Internal(format!(
            "scan entry on attribute {} restarted more than {max} times",
            self.attno
        )))
    }

    fn try_start(&mut self, index: &GinIndex) -> Result<Outcome> {
        self.reset();
        let state = index.state();
        let mut tree = EntryTree::new(state, self.search_key());
        let mut stack = btree::find_leaf_page(index, &mut tree, true, false)?;
        let level = stack.len() - 1;
        let (found, off) = tree.locate_leaf_entry(stack[level].page())?;
        stack[level].off = off;

        if self.partial_match || self.query_category == NullCategory::EmptyQuery {
            let mut bitmap = TidBitmap::with_memory_limit(index.config().work_mem_bytes());
            if self.collect_match_bitmap(index, &mut stack, &mut bitmap)? == Outcome::Restart {
                return Ok(Outcome::Restart);
            }
            if !bitmap.is_empty() {
                let pages: Vec<BitmapPage> = bitmap.pages().collect();
                self.source = Source::Bitmap {
                    pages: pages.into_iter(),
                    cur: None,
                    pos: 0,
                };
                self.is_finished = false;
            }
            return Ok(Outcome::Done);
        }

        let leaf_block = stack[level].blkno;
        if !found {
            // Lock the gap the key would occupy.
            index.predicate_locker().lock_page(leaf_block);
            return Ok(Outcome::Done);
        }

        let (posting_root, inline) = {
            let tuple = page_tuple(stack[level].page(), off)?;
            if tuple.is_posting_tree() {
                (Some(tuple.posting_tree_root()), Vec::new())
            } else if tuple.nposting() > 0 {
                (None, tuple.read_items()?)
            } else {
                (None, Vec::new())
            }
        };
        match posting_root {
            Some(root) => {
                index.predicate_locker().lock_page(root);
                // Entries are never removed from the leaf and a posting tree
                // never shrinks back to a list, so the root number stays valid.
                btree::unlock_stack(&mut stack);
                drop(stack);

                let root_pin = index.read_buffer(root)?;
                let (tree, mut pstack) = begin_posting_tree_scan(index, root)?;
                let Some(mut leaf) = pstack.pop() else {
                    return Err(GinError::Internal("empty posting tree descent".to_string()));
                };
                let items = data_leaf_items(leaf.page())?;
                self.predict = u64::from(leaf.predict_number) * items.len() as u64;
                leaf.buffer.unlock();
                self.source = Source::Tree(TreeCursor {
                    _root_pin: root_pin,
                    tree,
                    leaf: Some(leaf.buffer),
                    items,
                    pos: 0,
                });
                self.is_finished = false;
            }
            None => {
                index.predicate_locker().lock_page(leaf_block);
                if !inline.is_empty() {
                    self.predict = inline.len() as u64;
                    self.source = Source::List {
                        items: inline,
                        pos: 0,
                    };
                    self.is_finished = false;
                }
            }
        }
        Ok(Outcome::Done)
    }

    /// Collects every TID the entry matches into `bitmap`, walking the entry
    /// leaves right from the current position.
    fn collect_match_bitmap(
        &mut self,
        index: &GinIndex,
        stack: &mut Stack,
        bitmap: &mut TidBitmap,
    ) -> Result<Outcome> {
        // A null query cannot partially match anything.
        if self.partial_match && self.query_category != NullCategory::NormKey {
            return Ok(Outcome::Done);
        }
        let state = index.state();
        let opclass = state.opclass(self.attno);
        let level = stack.len() - 1;
        let cur = &mut stack[level];
        index.predicate_locker().lock_page(cur.blkno);

        loop {
            if !move_right_if_needed(index, cur)? {
                return Ok(Outcome::Done);
            }
            let (attno, category, key, posting_root) = {
                let t = page_tuple(cur.page(), cur.off)?;
                let root = t.is_posting_tree().then(|| t.posting_tree_root());
                (t.attno(), t.category(), Bytes::copy_from_slice(t.key()), root)
            };
            if attno != self.attno {
                return Ok(Outcome::Done);
            }

            if self.partial_match {
                // Partial matches never match nulls or placeholders.
                if category != NullCategory::NormKey {
                    return Ok(Outcome::Done);
                }
                match opclass.compare_partial(
                    &self.query_key,
                    &key,
                    self.strategy,
                    self.extra.as_ref(),
                ) {
                    PartialMatch::Stop => return Ok(Outcome::Done),
                    PartialMatch::Skip => {
                        cur.off += 1;
                        continue;
                    }
                    PartialMatch::Match => {}
                }
            } else if self.search_mode == SearchMode::All && category == NullCategory::NullItem {
                // Null-item placeholders sort last within an attribute.
                return Ok(Outcome::Done);
            }

            match posting_root {
                Some(root) => {
                    cur.buffer.unlock();
                    index.predicate_locker().lock_page(root);
                    self.predict += scan_posting_tree(index, root, bitmap)?;
                    index.injection_points().run(PARTIAL_MATCH_UNLATCHED_INJECTION)?;

                    cur.buffer.lock(LockMode::Share);
                    if !is_leaf(cur.page())
                        || index.injection_points().is_attached(PARTIAL_MATCH_RESTART_INJECTION)
                    {
                        // The root split while unlatched, or a restart is forced.
                        return Ok(Outcome::Restart);
                    }
                    loop {
                        if !move_right_if_needed(index, cur)? {
                            return Err(GinError::corrupted(
                                index.name(),
                                cur.blkno,
                                "failed to re-find tuple",
                            ));
                        }
                        let t = page_tuple(cur.page(), cur.off)?;
                        if t.attno() == self.attno
                            && state.compare_entries(self.attno, t.key(), t.category(), &key, category)
                                == Ordering::Equal
                        {
                            break;
                        }
                        cur.off += 1;
                    }
                }
                None => {
                    let t = page_tuple(cur.page(), cur.off)?;
                    let items = t.read_items()?;
                    bitmap.add_tids(&items, false);
                    self.predict += t.nposting() as u64;
                }
            }
            cur.off += 1;
        }
    }

    /// Advances the stream to its first item greater than `advance_past`.
    /// Sets `is_finished` when none is left.
    pub fn get_item(&mut self, index: &GinIndex, mut advance_past: ItemPointer) -> Result<()> {
        let limit = index.config().fuzzy_search_limit;
        self.nadvances += 1;
        match &mut self.source {
            Source::Empty => {
                self.cur_item = ItemPointer::MIN;
                self.is_finished = true;
            }
            Source::Bitmap { pages, cur, pos } => {
                self.is_finished = false;
                loop {
                    // Skip pages that are used up or wholly at or before
                    // `advance_past`.
                    loop {
                        let skip = match cur {
                            None => true,
                            Some(p) => {
                                (!p.lossy && *pos >= p.offsets.len())
                                    || p.block < advance_past.block
                                    || (advance_past.is_lossy() && p.block == advance_past.block)
                            }
                        };
                        if !skip {
                            break;
                        }
                        *cur = pages.next();
                        *pos = 0;
                        if cur.is_none() {
                            self.cur_item = ItemPointer::MIN;
                            self.is_finished = true;
                            return Ok(());
                        }
                    }
                    let Some(p) = cur.as_ref() else {
                        continue;
                    };
                    if p.lossy {
                        self.cur_item = ItemPointer::lossy_page(p.block);
                        return Ok(());
                    }
                    if p.block == advance_past.block {
                        if p.offsets.last().is_some_and(|last| *last <= advance_past.offset) {
                            *pos = p.offsets.len();
                            continue;
                        }
                        while p.offsets[*pos] <= advance_past.offset {
                            *pos += 1;
                        }
                    }
                    self.cur_item = ItemPointer::new(p.block, p.offsets[*pos]);
                    *pos += 1;
                    if !self.reduce || !drop_item(limit, self.predict) {
                        return Ok(());
                    }
                }
            }
            Source::List { items, pos } => loop {
                let Some(item) = items.get(*pos).copied() else {
                    self.cur_item = ItemPointer::MIN;
                    self.is_finished = true;
                    return Ok(());
                };
                *pos += 1;
                self.cur_item = item;
                if item <= advance_past {
                    continue;
                }
                if !self.reduce || !drop_item(limit, self.predict) {
                    return Ok(());
                }
            },
            Source::Tree(cursor) => loop {
                while cursor.pos >= cursor.items.len() {
                    if !cursor.load_more(index, self.cur_item, advance_past)? {
                        self.cur_item = ItemPointer::MIN;
                        self.is_finished = true;
                        return Ok(());
                    }
                }
                self.cur_item = cursor.items[cursor.pos];
                cursor.pos += 1;
                if self.cur_item <= advance_past {
                    continue;
                }
                if !self.reduce || !drop_item(limit, self.predict) {
                    return Ok(());
                }
                advance_past = self.cur_item;
            },
        }
        Ok(())
    }
}

impl TreeCursor {
    /// Loads the next leaf's worth of items greater than `advance_past`.
    /// Returns false when the tree is exhausted.
    fn load_more(
        &mut self,
        index: &GinIndex,
        cur_item: ItemPointer,
        advance_past: ItemPointer,
    ) -> Result<bool> {
        let Some(mut leaf) = self.leaf.take() else {
            return Ok(false);
        };
        // When the last item handed out is exactly `advance_past`, the next
        // one is on a later page; otherwise re-descend to skip ahead.
        let mut step_right = cur_item == advance_past;
        if step_right {
            leaf.lock(LockMode::Share);
        } else {
            drop(leaf);
            self.tree.item = if advance_past.is_lossy() {
                ItemPointer::new(advance_past.block + 1, FIRST_OFFSET)
            } else {
                ItemPointer::new(advance_past.block, advance_past.offset + 1)
            };
            self.tree.set_full_scan(false);
            let mut stack = btree::find_leaf_page(index, &mut self.tree, true, false)?;
            let Some(entry) = stack.pop() else {
                return Err(GinError::Internal("empty posting tree descent".to_string()));
            };
            leaf = entry.buffer;
        }
        trace!(index = index.name(), %advance_past, step_right, "loading posting tree items");

        loop {
            index.check_for_interrupts()?;
            self.items.clear();
            self.pos = 0;
            if step_right {
                if is_rightmost(leaf.page()) {
                    return Ok(false);
                }
                btree::step_right(index, &mut leaf, LockMode::Share)?;
            }
            step_right = true;

            let p = leaf.page();
            if is_deleted(p) {
                continue;
            }
            // The next item may be further right after a split, or when
            // another key let us skip ahead.
            if !is_rightmost(p) && advance_past >= ginpage::data_right_bound(p) {
                continue;
            }
            self.items = data_leaf_items_after(p, advance_past)?;
            if let Some(first) = self.items.iter().position(|t| *t > advance_past) {
                self.pos = first;
                if is_rightmost(leaf.page()) {
                    // Everything left is in memory.
                    drop(leaf);
                } else {
                    leaf.unlock();
                    self.leaf = Some(leaf);
                }
                return Ok(true);
            }
        }
    }
}

/// Moves to the next entry leaf once the current position runs off the end
/// of the page. Returns false at the end of the tree.
fn move_right_if_needed(index: &GinIndex, cur: &mut btree::StackEntry) -> Result<bool> {
    if cur.off > page::max_offset(cur.page()) {
        if is_rightmost(cur.page()) {
            return Ok(false);
        }
        btree::step_right(index, &mut cur.buffer, LockMode::Share)?;
        cur.blkno = cur.buffer.block();
        cur.off = FIRST_OFFSET;
        index.predicate_locker().lock_page(cur.blkno);
    }
    Ok(true)
}

/// Adds every item of a posting tree to `bitmap`. Returns the number added.
fn scan_posting_tree(index: &GinIndex, root: u32, bitmap: &mut TidBitmap) -> Result<u64> {
    // Pinned for the whole walk; vacuum deletes pages only under a cleanup
    // lock on the root.
    let _root_pin = index.read_buffer(root)?;
    let (_tree, mut stack) = begin_posting_tree_scan(index, root)?;
    let Some(leaf) = stack.pop() else {
        return Err(GinError::Internal("empty posting tree descent".to_string()));
    };
    let mut buffer = leaf.buffer;
    let mut n = 0u64;
    loop {
        index.check_for_interrupts()?;
        let p = buffer.page();
        if !is_deleted(p) {
            let items = data_leaf_items(p)?;
            n += items.len() as u64;
            bitmap.add_tids(&items, false);
        }
        if is_rightmost(buffer.page()) {
            return Ok(n);
        }
        btree::step_right(index, &mut buffer, LockMode::Share)?;
    }
}

/// Fuzzy-limit coin toss: drop with probability `1 - limit / predict`.
fn drop_item(limit: usize, predict: u64) -> bool {
    if predict == 0 {
        return false;
    }
    rand::rng().random::<f64>() > limit as f64 / predict as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::entry_insert;
    use crate::testutil;

    fn exact(attno: u16, key: &str) -> ScanEntry {
        ScanEntry::new(
            attno,
            0,
            SearchMode::Default,
            Bytes::copy_from_slice(key.as_bytes()),
            NullCategory::NormKey,
            false,
            None,
        )
    }

    fn drain(index: &GinIndex, entry: &mut ScanEntry) -> Vec<ItemPointer> {
        let mut out = Vec::new();
        let mut past = ItemPointer::MIN;
        loop {
            entry.get_item(index, past).unwrap();
            if entry.is_finished {
                return out;
            }
            out.push(entry.cur_item);
            past = entry.cur_item;
        }
    }

    #[test]
    fn test_inline_list_stream() {
        let index = testutil::array_index("idx", false);
        let items = vec![ItemPointer::new(1, 1), ItemPointer::new(2, 4), ItemPointer::new(9, 1)];
        entry_insert(&index, &EntryKey::norm(1, "a"), &items, None).unwrap();

        let mut entry = exact(1, "a");
        entry.start(&index).unwrap();
        assert_eq!(entry.predict, 3);
        assert_eq!(drain(&index, &mut entry), items);

        let mut missing = exact(1, "zz");
        missing.start(&index).unwrap();
        assert!(missing.is_finished);
    }

    #[test]
    fn test_posting_tree_stream_skips_ahead() {
        let index = testutil::array_index("idx", false);
        let items: Vec<ItemPointer> = (0..20_000).map(|i| ItemPointer::new(i / 10, (i % 10 + 1) as u16)).collect();
        entry_insert(&index, &EntryKey::norm(1, "hot"), &items, None).unwrap();

        let mut entry = exact(1, "hot");
        entry.start(&index).unwrap();
        assert!(entry.predict >= 1);
        assert_eq!(drain(&index, &mut entry), items);

        // A skip far ahead re-descends instead of stepping leaf by leaf.
        let mut entry = exact(1, "hot");
        entry.start(&index).unwrap();
        entry.get_item(&index, ItemPointer::MIN).unwrap();
        entry.get_item(&index, ItemPointer::new(1500, 3)).unwrap();
        assert_eq!(entry.cur_item, ItemPointer::new(1500, 4));
        entry.get_item(&index, ItemPointer::lossy_page(1700)).unwrap();
        assert_eq!(entry.cur_item, ItemPointer::new(1701, 1));
    }

    #[test]
    fn test_empty_query_collects_all_keys_of_attribute() {
        let index = testutil::array_index("idx", false);
        entry_insert(&index, &EntryKey::norm(1, "a"), &[ItemPointer::new(1, 1)], None).unwrap();
        entry_insert(&index, &EntryKey::norm(1, "b"), &[ItemPointer::new(1, 2)], None).unwrap();
        let null = EntryKey::placeholder(1, NullCategory::NullItem);
        entry_insert(&index, &null, &[ItemPointer::new(3, 1)], None).unwrap();

        let mut all = ScanEntry::new(
            1,
            0,
            SearchMode::All,
            Bytes::new(),
            NullCategory::EmptyQuery,
            false,
            None,
        );
        all.start(&index).unwrap();
        assert_eq!(
            drain(&index, &mut all),
            vec![ItemPointer::new(1, 1), ItemPointer::new(1, 2)]
        );

        let mut everything = ScanEntry::new(
            1,
            0,
            SearchMode::Everything,
            Bytes::new(),
            NullCategory::EmptyQuery,
            false,
            None,
        );
        everything.start(&index).unwrap();
        assert_eq!(drain(&index, &mut everything).len(), 3);
    }

    #[test]
    fn test_bitmap_stream_honours_lossy_advance() {
        let index = testutil::array_index("idx", false);
        for key in ["a", "b"] {
            entry_insert(
                &index,
                &EntryKey::norm(1, key),
                &[ItemPointer::new(1, 1), ItemPointer::new(1, 5), ItemPointer::new(2, 1)],
                None,
            )
            .unwrap();
        }
        let mut entry = ScanEntry::new(
            1,
            0,
            SearchMode::Everything,
            Bytes::new(),
            NullCategory::EmptyQuery,
            false,
            None,
        );
        entry.start(&index).unwrap();
        entry.get_item(&index, ItemPointer::new(1, 1)).unwrap();
        assert_eq!(entry.cur_item, ItemPointer::new(1, 5));
        entry.get_item(&index, ItemPointer::lossy_page(1)).unwrap();
        assert_eq!(entry.cur_item, ItemPointer::new(2, 1));
        entry.get_item(&index, entry.cur_item).unwrap();
        assert!(entry.is_finished);
    }

    #[test]
    fn test_drop_item_bounds() {
        assert!(!drop_item(10, 0));
        // A limit above the prediction never drops.
        for _ in 0..100 {
            assert!(!drop_item(100, 10));
        }
    }
}
