//! Bulk deletion and post-vacuum cleanup.
//!
//! `bulk_delete` removes the TIDs a callback reports dead from every inline
//! posting list and posting tree. Posting-tree leaves left empty are unlinked
//! from the tree afterwards, under a cleanup lock on the tree's root: scans
//! keep the root pinned while they walk a tree, so the lock cannot be taken
//! while any of them could still step onto an unlinked page.

use crate::datapage::vacuum_posting_leaf;
use crate::entrypage::{EntryInsert, apply_insert, page_tuple};
use crate::ginpage::{
    self, GIN_DELETED, ROOT_BLKNO, data_leaf_is_empty, gin_maxoff, is_data, is_leaf, is_list,
    is_recyclable, is_rightmost, posting_item, right_link,
};
use crate::index::GinIndex;
use crate::meta::GinStatistics;
use crate::tid::ItemPointer;
use crate::tuple::form_leaf_tuple;
use gin_buffer::{Buffer, LockMode};
use gin_common::page::{self, BlockNumber, FIRST_OFFSET, INVALID_BLOCK, OffsetNumber};
use gin_common::{GinError, Result};
use gin_wal::{GinRecordType, RecordBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, trace};

/// Counters reported by a vacuum pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VacuumStats {
    pub num_pages: BlockNumber,
    /// Pages recorded in the free-space map.
    pub pages_free: BlockNumber,
    pub pages_deleted: BlockNumber,
    pub tuples_removed: u64,
    pub num_index_tuples: u64,
}

/// How the vacuum was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumInfo {
    /// Only statistics are wanted; nothing is removed.
    pub analyze_only: bool,
    /// Background maintenance rather than an explicit command. Background
    /// runs leave pending rows appended during the drain for later.
    pub autovacuum: bool,
    pub num_heap_tuples: u64,
}

/// Main data of a DELETE_PAGE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePage {
    pub parent_offset: OffsetNumber,
    pub right_link: BlockNumber,
    pub delete_xid: u32,
}

impl DeletePage {
    pub const SIZE: usize = 10;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.parent_offset.to_le_bytes());
        out[2..6].copy_from_slice(&self.right_link.to_le_bytes());
        out[6..10].copy_from_slice(&self.delete_xid.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(GinError::Internal("truncated page deletion".to_string()));
        }
        Ok(Self {
            parent_offset: u16::from_le_bytes([buf[0], buf[1]]),
            right_link: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            delete_xid: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// Removes from `items` those `is_dead` reports. Returns `None` when none
/// were removed.
fn vacuum_items(
    items: &[ItemPointer],
    is_dead: &mut dyn FnMut(ItemPointer) -> bool,
    stats: &mut VacuumStats,
) -> Option<Vec<ItemPointer>> {
    let kept: Vec<ItemPointer> = items.iter().copied().filter(|t| !is_dead(*t)).collect();
    if kept.len() == items.len() {
        return None;
    }
    stats.tuples_removed += (items.len() - kept.len()) as u64;
    Some(kept)
}

impl GinIndex {
    /// Removes every TID `is_dead` reports from the index.
    ///
    /// The pending list is drained first so that dead rows waiting in it are
    /// removed too. Pass the stats of an earlier call to accumulate.
    pub fn bulk_delete(
        &self,
        stats: Option<VacuumStats>,
        info: &VacuumInfo,
        is_dead: &mut dyn FnMut(ItemPointer) -> bool,
    ) -> Result<VacuumStats> {
        let span = info_span!("bulk_delete", index = self.name());
        let _enter = span.enter();

        let mut stats = match stats {
            Some(stats) => stats,
            None => {
                self.insert_cleanup(!info.autovacuum, false, true)?;
                VacuumStats::default()
            }
        };

        let mut buffer = self.leftmost_entry_leaf()?;
        loop {
            let mut roots = Vec::new();
            self.vacuum_entry_page(&mut buffer, &mut roots, is_dead, &mut stats)?;
            let next = right_link(buffer.page());
            drop(buffer);

            for root in roots {
                self.check_for_interrupts()?;
                self.vacuum_posting_tree(root, is_dead, &mut stats)?;
            }
            if next == INVALID_BLOCK {
                break;
            }
            buffer = self.read_buffer(next)?;
            buffer.lock(LockMode::Exclusive);
        }
        debug!(
            removed = stats.tuples_removed,
            deleted = stats.pages_deleted,
            "bulk delete finished"
        );
        Ok(stats)
    }

    /// Descends along the first downlinks to the leftmost entry leaf and
    /// returns it latched exclusively.
    fn leftmost_entry_leaf(&self) -> Result<Buffer> {
        let mut blkno = ROOT_BLKNO;
        let mut buffer = self.read_buffer(blkno)?;
        loop {
            self.check_for_interrupts()?;
            buffer.lock(LockMode::Share);
            if is_leaf(buffer.page()) {
                buffer.lock(LockMode::Exclusive);
                // The root may have split while unlatched.
                if blkno == ROOT_BLKNO && !is_leaf(buffer.page()) {
                    buffer.unlock();
                    continue;
                }
                return Ok(buffer);
            }
            blkno = page_tuple(buffer.page(), FIRST_OFFSET)?.downlink();
            buffer = self.read_buffer(blkno)?;
        }
    }

    /// Filters the inline posting lists of one entry leaf and collects the
    /// roots of the posting trees it points to.
    fn vacuum_entry_page(
        &self,
        buffer: &mut Buffer,
        roots: &mut Vec<BlockNumber>,
        is_dead: &mut dyn FnMut(ItemPointer) -> bool,
        stats: &mut VacuumStats,
    ) -> Result<()> {
        let block = buffer.block();
        let mut replacements = Vec::new();
        {
            let p = buffer.page();
            for off in FIRST_OFFSET..=page::max_offset(p) {
                let tuple = page_tuple(p, off)?;
                if tuple.is_posting_tree() {
                    roots.push(tuple.posting_tree_root());
                    continue;
                }
                if tuple.nposting() == 0 {
                    continue;
                }
                let items = tuple.read_items()?;
                match vacuum_items(&items, is_dead, stats) {
                    Some(kept) => {
                        stats.num_index_tuples += kept.len() as u64;
                        let raw = form_leaf_tuple(
                            tuple.attno(),
                            tuple.category(),
                            tuple.key(),
                            &kept,
                            self.state().max_item_size(),
                        )?
                        .ok_or_else(|| {
                            GinError::Internal(format!(
                                "vacuumed posting list no longer fits at block {block} offset {off}"
                            ))
                        })?;
                        replacements.push((off, raw));
                    }
                    None => stats.num_index_tuples += items.len() as u64,
                }
            }
        }
        if replacements.is_empty() {
            return Ok(());
        }

        let page = buffer.page_mut();
        for (off, tuple) in replacements {
            apply_insert(
                page,
                off,
                &EntryInsert {
                    tuple,
                    is_delete: true,
                },
                INVALID_BLOCK,
            )?;
        }
        buffer.mark_dirty();
        let mut rec = RecordBuilder::new(GinRecordType::VacuumPage);
        rec.register_block(0, block, false)
            .block_image(0, buffer.page());
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(buffer.page_mut(), lsn.0);
        trace!(block, "vacuumed entry page");
        Ok(())
    }

    fn vacuum_posting_tree(
        &self,
        root: BlockNumber,
        is_dead: &mut dyn FnMut(ItemPointer) -> bool,
        stats: &mut VacuumStats,
    ) -> Result<()> {
        if !self.vacuum_posting_tree_leaves(root, is_dead, stats)? {
            return Ok(());
        }
        let mut rootbuf = self.read_buffer(root)?;
        rootbuf.lock_for_cleanup();
        let mut lefts = Vec::new();
        self.scan_to_delete(rootbuf, true, 0, &mut lefts, None, FIRST_OFFSET, stats)?;
        Ok(())
    }

    /// Vacuums every leaf of a posting tree. Returns whether some leaf was
    /// left empty.
    fn vacuum_posting_tree_leaves(
        &self,
        root: BlockNumber,
        is_dead: &mut dyn FnMut(ItemPointer) -> bool,
        stats: &mut VacuumStats,
    ) -> Result<bool> {
        let mut blkno = root;
        let mut buffer = self.read_buffer(blkno)?;
        loop {
            buffer.lock(LockMode::Share);
            if is_leaf(buffer.page()) {
                buffer.lock(LockMode::Exclusive);
                break;
            }
            blkno = posting_item(buffer.page(), FIRST_OFFSET).child;
            buffer = self.read_buffer(blkno)?;
        }

        let mut has_void = false;
        loop {
            self.check_for_interrupts()?;
            let removed = vacuum_posting_leaf(self, &mut buffer, &mut |t| is_dead(*t))?;
            stats.tuples_removed += removed as u64;
            if data_leaf_is_empty(buffer.page()) {
                has_void = true;
            }
            let next = right_link(buffer.page());
            drop(buffer);
            if next == INVALID_BLOCK {
                break;
            }
            buffer = self.read_buffer(next)?;
            buffer.lock(LockMode::Exclusive);
        }
        Ok(has_void)
    }

    /// Walks the tree depth first, unlinking empty pages. The left sibling
    /// at each depth stays latched until the next page at that depth is
    /// done with; the leftmost and rightmost pages of a level are never
    /// removed. Returns whether the page in `buffer` was deleted.
    #[allow(clippy::too_many_arguments)]
    fn scan_to_delete(
        &self,
        mut buffer: Buffer,
        is_root: bool,
        depth: usize,
        lefts: &mut Vec<Option<Buffer>>,
        parent: Option<&mut Buffer>,
        myoff: OffsetNumber,
        stats: &mut VacuumStats,
    ) -> Result<bool> {
        if lefts.len() <= depth {
            lefts.push(None);
        }
        if !is_data(buffer.page()) {
            return Err(GinError::corrupted(
                self.name(),
                buffer.block(),
                "posting tree page is not a data page",
            ));
        }

        if !is_leaf(buffer.page()) {
            let mut off = FIRST_OFFSET;
            while off <= gin_maxoff(buffer.page()) {
                let child = posting_item(buffer.page(), off).child;
                let mut cbuf = self.read_buffer(child)?;
                cbuf.lock(LockMode::Exclusive);
                let deleted =
                    self.scan_to_delete(cbuf, false, depth + 1, lefts, Some(&mut buffer), off, stats)?;
                // A deletion shifted the next downlink into this slot.
                if !deleted {
                    off += 1;
                }
            }
            if is_rightmost(buffer.page()) {
                if let Some(slot) = lefts.get_mut(depth + 1) {
                    *slot = None;
                }
            }
        }

        let empty = if is_leaf(buffer.page()) {
            data_leaf_is_empty(buffer.page())
        } else {
            gin_maxoff(buffer.page()) < FIRST_OFFSET
        };
        if empty && !is_rightmost(buffer.page()) && !is_root {
            if let (Some(left), Some(parent)) = (lefts[depth].as_mut(), parent) {
                self.delete_page(&mut buffer, left, parent, myoff)?;
                stats.pages_deleted += 1;
                return Ok(true);
            }
        }
        lefts[depth] = Some(buffer);
        Ok(false)
    }

    /// Unlinks `dbuf` from its left sibling and its parent and marks it
    /// deleted. All three pages must be latched exclusively.
    fn delete_page(
        &self,
        dbuf: &mut Buffer,
        lbuf: &mut Buffer,
        pbuf: &mut Buffer,
        myoff: OffsetNumber,
    ) -> Result<()> {
        let rightlink = right_link(dbuf.page());
        // Inserts that would have gone to the deleted page now go right.
        self.predicate_locker().page_split(dbuf.block(), rightlink);
        let xid = self.hooks().transactions.assign_xid();

        ginpage::set_right_link(lbuf.page_mut(), rightlink);
        ginpage::delete_posting_item(pbuf.page_mut(), myoff);
        // The right link stays so that scans already on the page can leave.
        ginpage::add_flags(dbuf.page_mut(), GIN_DELETED);
        ginpage::set_delete_xid(dbuf.page_mut(), xid);
        lbuf.mark_dirty();
        pbuf.mark_dirty();
        dbuf.mark_dirty();

        let mut rec = RecordBuilder::new(GinRecordType::DeletePage);
        rec.register_block(0, dbuf.block(), false)
            .register_block(1, pbuf.block(), false)
            .register_block(2, lbuf.block(), false)
            .main_data(
                &DeletePage {
                    parent_offset: myoff,
                    right_link: rightlink,
                    delete_xid: xid,
                }
                .to_bytes(),
            );
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(dbuf.page_mut(), lsn.0);
        page::set_page_lsn(pbuf.page_mut(), lsn.0);
        page::set_page_lsn(lbuf.page_mut(), lsn.0);
        debug!(
            index = self.name(),
            block = dbuf.block(),
            left = lbuf.block(),
            parent = pbuf.block(),
            xid,
            "deleted posting tree page"
        );
        Ok(())
    }

    /// Finishes a vacuum: drains the pending list if `bulk_delete` did not
    /// run, recounts the pages, refreshes the metapage statistics and
    /// records recyclable pages in the free-space map.
    ///
    /// An analyze-only call drains the list only for background runs and
    /// hands `stats` back unchanged.
    pub fn vacuum_cleanup(
        &self,
        stats: Option<VacuumStats>,
        info: &VacuumInfo,
    ) -> Result<Option<VacuumStats>> {
        let span = info_span!("vacuum_cleanup", index = self.name());
        let _enter = span.enter();

        if info.analyze_only {
            if info.autovacuum {
                self.insert_cleanup(false, true, true)?;
            }
            return Ok(stats);
        }

        let mut stats = match stats {
            Some(stats) => stats,
            None => {
                self.insert_cleanup(!info.autovacuum, false, true)?;
                VacuumStats::default()
            }
        };
        stats.num_index_tuples = info.num_heap_tuples;

        let npages = self.nblocks();
        let oldest = self.hooks().transactions.oldest_active();
        let mut idx = GinStatistics::default();
        let mut free = 0;
        for blkno in ROOT_BLKNO..npages {
            self.check_for_interrupts()?;
            let mut buffer = self.read_buffer(blkno)?;
            buffer.lock(LockMode::Share);
            let p = buffer.page();
            if is_recyclable(p, oldest) {
                self.fsm().record_free_page(blkno);
                free += 1;
            } else if is_data(p) {
                idx.n_data_pages += 1;
            } else if !is_list(p) {
                idx.n_entry_pages += 1;
                if is_leaf(p) {
                    idx.n_entries += page::max_offset(p) as i64;
                }
            }
        }
        idx.n_total_pages = npages;
        self.update_stats(&idx)?;

        stats.pages_free = free;
        stats.num_pages = npages;
        debug!(pages = npages, free, entries = idx.n_entries, "vacuum cleanup finished");
        Ok(Some(stats))
    }

    /// Planner statistics as last stored on the metapage.
    pub fn index_stats(&self) -> Result<GinStatistics> {
        self.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::entry_insert;
    use crate::state::EntryKey;
    use crate::testutil;
    use gin_common::Datum;

    fn tids(n: u32) -> Vec<ItemPointer> {
        (0..n)
            .map(|i| ItemPointer::new(i / 50, (i % 50 + 1) as u16))
            .collect()
    }

    fn root_of(index: &GinIndex, key: &EntryKey) -> BlockNumber {
        use crate::btree;
        use crate::entrypage::EntryTree;
        let mut tree = EntryTree::new(index.state(), key.clone());
        let stack = btree::find_leaf_page(index, &mut tree, true, false).unwrap();
        let leaf = &stack[stack.len() - 1];
        let (found, off) = tree.locate_leaf_entry(leaf.page()).unwrap();
        assert!(found);
        let tuple = page_tuple(leaf.page(), off).unwrap();
        assert!(tuple.is_posting_tree());
        tuple.posting_tree_root()
    }

    #[test]
    fn test_delete_page_record_layout() {
        let rec = DeletePage {
            parent_offset: 3,
            right_link: 77,
            delete_xid: 1234,
        };
        assert_eq!(DeletePage::from_bytes(&rec.to_bytes()).unwrap(), rec);
        assert!(DeletePage::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_inline_lists_are_filtered() {
        let index = testutil::array_index("vac", false);
        for i in 0..200u32 {
            let tags = [format!("k{}", i % 5)];
            index
                .insert(&[Some(Datum::text_array(&tags))], ItemPointer::new(i, 1))
                .unwrap();
        }
        let stats = index
            .bulk_delete(None, &VacuumInfo::default(), &mut |t| t.block % 2 == 0)
            .unwrap();
        assert_eq!(stats.tuples_removed, 100);
        for k in 0..5 {
            let items = testutil::lookup_items(&index, &EntryKey::norm(1, format!("k{k}")));
            assert!(!items.is_empty());
            assert!(items.iter().all(|t| t.block % 2 == 1));
        }
    }

    #[test]
    fn test_posting_tree_empty_leaves_are_unlinked() {
        let index = testutil::array_index("vac", false);
        let key = EntryKey::norm(1, "big");
        let items = tids(40_000);
        entry_insert(&index, &key, &items, None).unwrap();
        let root = root_of(&index, &key);

        // Keep only the first and last thousand items; the leaves between
        // them empty out.
        let keep = |t: ItemPointer| t < items[1000] || t >= items[39_000];
        let stats = index
            .bulk_delete(None, &VacuumInfo::default(), &mut |t| !keep(t))
            .unwrap();
        assert_eq!(stats.tuples_removed, 38_000);
        assert!(stats.pages_deleted > 0);

        let left: Vec<ItemPointer> = items.iter().copied().filter(|t| keep(*t)).collect();
        assert_eq!(testutil::posting_tree_items(&index, root), left);
        assert_eq!(testutil::lookup_items(&index, &key), left);
    }

    #[test]
    fn test_cleanup_recycles_deleted_pages() {
        let index = testutil::array_index("vac", false);
        let key = EntryKey::norm(1, "big");
        let items = tids(40_000);
        entry_insert(&index, &key, &items, None).unwrap();
        let deleted = index
            .bulk_delete(None, &VacuumInfo::default(), &mut |t| t.block > 5 && t.block < 700)
            .unwrap();
        assert!(deleted.pages_deleted > 0);

        let info = VacuumInfo {
            num_heap_tuples: 1234,
            ..VacuumInfo::default()
        };
        let stats = index.vacuum_cleanup(Some(deleted), &info).unwrap().unwrap();
        assert_eq!(stats.num_pages, index.nblocks());
        assert_eq!(stats.num_index_tuples, 1234);
        assert_eq!(stats.pages_free, deleted.pages_deleted);
        assert_eq!(index.fsm().len(), deleted.pages_deleted as usize);

        let idx = index.index_stats().unwrap();
        assert_eq!(idx.n_total_pages, index.nblocks());
        assert_eq!(idx.n_entries, 1);
        assert!(idx.n_data_pages > 0);

        // A recycled page serves the next allocation.
        entry_insert(&index, &EntryKey::norm(1, "again"), &tids(20_000), None).unwrap();
        assert!(index.fsm().len() < deleted.pages_deleted as usize);
    }

    #[test]
    fn test_bulk_delete_drains_pending_list() {
        let index = testutil::array_index("vac", true);
        for i in 0..100u32 {
            index
                .insert(&[Some(Datum::text_array(&["p"]))], ItemPointer::new(i, 1))
                .unwrap();
        }
        assert!(index.pending_rows().unwrap() > 0);
        let stats = index
            .bulk_delete(None, &VacuumInfo::default(), &mut |t| t.block < 10)
            .unwrap();
        assert_eq!(index.pending_rows().unwrap(), 0);
        assert_eq!(stats.tuples_removed, 10);
        assert_eq!(testutil::lookup_items(&index, &EntryKey::norm(1, "p")).len(), 90);
    }

    #[test]
    fn test_analyze_only_keeps_stats() {
        let index = testutil::array_index("vac", true);
        index
            .insert(&[Some(Datum::text_array(&["a"]))], ItemPointer::new(1, 1))
            .unwrap();
        let info = VacuumInfo {
            analyze_only: true,
            ..VacuumInfo::default()
        };
        assert_eq!(index.vacuum_cleanup(None, &info).unwrap(), None);
        assert_eq!(index.pending_rows().unwrap(), 1);

        let info = VacuumInfo {
            analyze_only: true,
            autovacuum: true,
            ..VacuumInfo::default()
        };
        index.vacuum_cleanup(None, &info).unwrap();
        assert_eq!(index.pending_rows().unwrap(), 0);
    }
}
