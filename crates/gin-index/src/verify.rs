//! Read-only structural verification.
//!
//! Walks the entry tree and every posting tree top-down, checking page
//! sanity, key order within pages, that children stay within their parent's
//! bound, and that all leaves of a tree sit at the same depth. A child that
//! exceeds its parent's bound because of a split whose downlink is not yet
//! installed is tolerated: the parent is re-read, and the check only fails
//! if the discrepancy persists.

use crate::entrypage::page_tuple;
use crate::ginpage::{
    self, check_page, data_right_bound, gin_maxoff, is_data, is_deleted, is_incomplete_split,
    is_leaf, is_rightmost, posting_item, right_link,
};
use crate::index::GinIndex;
use crate::meta;
use crate::state::EntryKey;
use crate::tid::ItemPointer;
use gin_buffer::LockMode;
use gin_common::page::{self, BlockNumber, FIRST_OFFSET, INVALID_BLOCK};
use gin_common::{GinError, Result};
use std::cmp::Ordering;
use tracing::{debug, info_span, warn};

/// What a successful verification looked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub entry_pages: u32,
    pub entry_depth: u32,
    pub posting_trees: u32,
    pub data_pages: u32,
    pub items: u64,
}

struct EntryVisit {
    blkno: BlockNumber,
    depth: u32,
    /// Upper bound from the parent; `None` is +infinity.
    parent_key: Option<EntryKey>,
    parent_blkno: BlockNumber,
}

struct DataVisit {
    blkno: BlockNumber,
    depth: u32,
    /// Upper bound from the parent; the minimum item pointer is +infinity.
    parent_key: ItemPointer,
    parent_blkno: BlockNumber,
}

impl GinIndex {
    /// Checks the whole index, failing with `IndexCorrupted` at the first
    /// violation.
    pub fn verify_index(&self) -> Result<VerifyReport> {
        let span = info_span!("verify", index = self.name());
        let _enter = span.enter();

        {
            let mut metabuf = self.read_buffer(ginpage::METAPAGE_BLKNO)?;
            metabuf.lock(LockMode::Share);
            meta::read_meta(self.name(), metabuf.page())?;
        }

        let mut report = VerifyReport::default();
        let roots = self.verify_entry_tree(&mut report)?;
        for root in roots {
            self.verify_posting_tree(root, &mut report)?;
            report.posting_trees += 1;
        }
        debug!(
            entry_pages = report.entry_pages,
            posting_trees = report.posting_trees,
            data_pages = report.data_pages,
            items = report.items,
            "index verified"
        );
        Ok(report)
    }

    fn corrupt(&self, block: BlockNumber, reason: impl Into<String>) -> GinError {
        GinError::corrupted(self.name(), block, reason)
    }

    /// Verifies the entry tree and returns the posting-tree roots found on
    /// its leaves.
    fn verify_entry_tree(&self, report: &mut VerifyReport) -> Result<Vec<BlockNumber>> {
        let state = self.state();
        let mut roots = Vec::new();
        let mut leaf_depth: Option<u32> = None;
        let mut stack = vec![EntryVisit {
            blkno: ginpage::ROOT_BLKNO,
            depth: 0,
            parent_key: None,
            parent_blkno: INVALID_BLOCK,
        }];

        while let Some(mut visit) = stack.pop() {
            self.check_for_interrupts()?;
            let mut buffer = self.read_buffer(visit.blkno)?;
            buffer.lock(LockMode::Share);
            let p = buffer.page();
            check_page(self.name(), visit.blkno, p)?;
            if is_data(p) {
                return Err(self.corrupt(visit.blkno, "data page in the entry tree"));
            }
            if is_deleted(p) {
                return Err(self.corrupt(visit.blkno, "deleted page in the entry tree"));
            }
            report.entry_pages += 1;

            if is_leaf(p) {
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(d) if d != visit.depth => {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("leaf at depth {} while other leaves are at {d}", visit.depth),
                        ));
                    }
                    Some(_) => {}
                }
            }

            let maxoff = page::max_offset(p);
            if maxoff < FIRST_OFFSET {
                if is_leaf(p) && visit.blkno == ginpage::ROOT_BLKNO {
                    continue;
                }
                return Err(self.corrupt(visit.blkno, "entry page has no tuples"));
            }

            // A split we have not seen a downlink for: the right half must be
            // checked against the same parent bound.
            let rightlink = right_link(p);
            if let Some(bound) = &visit.parent_key {
                let last = page_tuple(p, maxoff)?;
                if rightlink != INVALID_BLOCK
                    && state.compare_tuple(bound, &last) == Ordering::Greater
                    && is_incomplete_split(p)
                {
                    stack.push(EntryVisit {
                        blkno: rightlink,
                        depth: visit.depth,
                        parent_key: visit.parent_key.clone(),
                        parent_blkno: visit.parent_blkno,
                    });
                }
            }

            let mut prev: Option<EntryKey> = None;
            for off in FIRST_OFFSET..=maxoff {
                let tuple = page_tuple(p, off)?;
                let is_infinity = !is_leaf(p) && off == maxoff && is_rightmost(p);

                if let Some(prev_key) = &prev {
                    if !is_infinity && state.compare_tuple(prev_key, &tuple) != Ordering::Less {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("wrong tuple order at offset {off}"),
                        ));
                    }
                }

                if off == maxoff && !is_infinity {
                    if let Some(bound) = &visit.parent_key {
                        if state.compare_tuple(bound, &tuple) == Ordering::Less {
                            visit.parent_key = self.refind_entry_parent(&visit)?;
                            match &visit.parent_key {
                                None => warn!(
                                    block = visit.blkno,
                                    parent = visit.parent_blkno,
                                    "parent downlink not found, concurrent split tolerated"
                                ),
                                Some(bound)
                                    if state.compare_tuple(bound, &tuple) == Ordering::Less =>
                                {
                                    return Err(self.corrupt(
                                        visit.blkno,
                                        format!("tuple at offset {off} exceeds the parent's bound"),
                                    ));
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }

                if is_leaf(p) {
                    if tuple.is_posting_tree() {
                        roots.push(tuple.posting_tree_root());
                    } else {
                        let items = tuple.read_items().map_err(|e| {
                            self.corrupt(visit.blkno, format!("offset {off}: {e}"))
                        })?;
                        check_ascending(&items)
                            .map_err(|reason| self.corrupt(visit.blkno, format!("offset {off}: {reason}")))?;
                        report.items += items.len() as u64;
                    }
                } else {
                    let child = tuple.downlink();
                    if child == INVALID_BLOCK || child == visit.blkno {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("invalid downlink {child} at offset {off}"),
                        ));
                    }
                    stack.push(EntryVisit {
                        blkno: child,
                        depth: visit.depth + 1,
                        parent_key: (!is_infinity).then(|| EntryKey::from_tuple(&tuple)),
                        parent_blkno: visit.blkno,
                    });
                }
                prev = Some(EntryKey::from_tuple(&tuple));
            }
        }
        report.entry_depth = leaf_depth.unwrap_or(0);
        Ok(roots)
    }

    /// Re-reads the parent of `visit` and returns the current bound of its
    /// downlink, following the parent's right links in case it split too.
    /// `None` when no downlink is found or it is the rightmost one.
    fn refind_entry_parent(&self, visit: &EntryVisit) -> Result<Option<EntryKey>> {
        let mut blkno = visit.parent_blkno;
        while blkno != INVALID_BLOCK {
            let mut buffer = self.read_buffer(blkno)?;
            buffer.lock(LockMode::Share);
            let p = buffer.page();
            let maxoff = page::max_offset(p);
            for off in FIRST_OFFSET..=maxoff {
                let tuple = page_tuple(p, off)?;
                if tuple.downlink() == visit.blkno {
                    if off == maxoff && is_rightmost(p) {
                        return Ok(None);
                    }
                    return Ok(Some(EntryKey::from_tuple(&tuple)));
                }
            }
            blkno = right_link(p);
        }
        Ok(None)
    }

    fn verify_posting_tree(&self, root: BlockNumber, report: &mut VerifyReport) -> Result<()> {
        let mut leaf_depth: Option<u32> = None;
        let mut stack = vec![DataVisit {
            blkno: root,
            depth: 0,
            parent_key: ItemPointer::MIN,
            parent_blkno: INVALID_BLOCK,
        }];

        while let Some(visit) = stack.pop() {
            self.check_for_interrupts()?;
            let mut buffer = self.read_buffer(visit.blkno)?;
            buffer.lock(LockMode::Share);
            let p = buffer.page();
            check_page(self.name(), visit.blkno, p)?;
            if !is_data(p) {
                return Err(self.corrupt(visit.blkno, "entry page in a posting tree"));
            }
            if is_deleted(p) {
                return Err(self.corrupt(
                    visit.blkno,
                    format!("deleted page reachable from block {}", visit.parent_blkno),
                ));
            }
            report.data_pages += 1;
            let bounded = !visit.parent_key.is_min();
            let rightlink = right_link(p);

            if bounded && rightlink != INVALID_BLOCK {
                let bound = data_right_bound(p);
                if is_incomplete_split(p) {
                    if bound > visit.parent_key {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("high key {bound} exceeds the parent's key {}", visit.parent_key),
                        ));
                    }
                    stack.push(DataVisit {
                        blkno: rightlink,
                        depth: visit.depth,
                        parent_key: visit.parent_key,
                        parent_blkno: visit.parent_blkno,
                    });
                } else if bound != visit.parent_key {
                    return Err(self.corrupt(
                        visit.blkno,
                        format!("high key {bound} differs from the parent's key {}", visit.parent_key),
                    ));
                }
            }

            if is_leaf(p) {
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(d) if d != visit.depth => {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("posting tree {root} has leaves at depths {d} and {}", visit.depth),
                        ));
                    }
                    Some(_) => {}
                }
                let items = ginpage::data_leaf_items(p)
                    .map_err(|e| self.corrupt(visit.blkno, e.to_string()))?;
                check_ascending(&items).map_err(|reason| self.corrupt(visit.blkno, reason))?;
                if let Some(last) = items.last() {
                    if bounded && *last > visit.parent_key {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("item {last} exceeds the parent's key {}", visit.parent_key),
                        ));
                    }
                }
                report.items += items.len() as u64;
                continue;
            }

            let maxoff = gin_maxoff(p);
            if maxoff < FIRST_OFFSET {
                return Err(self.corrupt(visit.blkno, "posting tree internal page has no items"));
            }
            for off in FIRST_OFFSET..=maxoff {
                let item = posting_item(p, off);
                if off == maxoff && rightlink == INVALID_BLOCK && !item.key.is_min() {
                    return Err(self.corrupt(
                        visit.blkno,
                        format!("rightmost posting item has key {} instead of (0,0)", item.key),
                    ));
                }
                if off > FIRST_OFFSET {
                    let prev = posting_item(p, off - 1);
                    if !(off == maxoff && item.key.is_min()) && item.key <= prev.key {
                        return Err(self.corrupt(
                            visit.blkno,
                            format!("wrong posting item order at offset {off}"),
                        ));
                    }
                }
                if bounded && off == maxoff && (item.key.is_min() || item.key > visit.parent_key) {
                    return Err(self.corrupt(
                        visit.blkno,
                        format!("posting item at offset {off} exceeds the parent's key"),
                    ));
                }
                stack.push(DataVisit {
                    blkno: item.child,
                    depth: visit.depth + 1,
                    parent_key: item.key,
                    parent_blkno: visit.blkno,
                });
            }
        }
        Ok(())
    }
}

fn check_ascending(items: &[ItemPointer]) -> std::result::Result<(), String> {
    for pair in items.windows(2) {
        if pair[0] >= pair[1] {
            return Err(format!("item {} does not follow {}", pair[1], pair[0]));
        }
    }
    if items.first().is_some_and(|t| t.is_min()) {
        return Err("posting list holds the minimum item pointer".to_string());
    }
    Ok(())
}
