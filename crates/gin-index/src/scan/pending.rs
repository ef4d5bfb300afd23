//! Scanning the pending list.
//!
//! Rows in the pending list are evaluated one at a time with the boolean
//! consistency function, before the main structure is scanned. The tuples
//! of a row are sorted by (attno, key), so each entry is looked up with a
//! binary search over the row's tuples.

use super::entry::ScanEntry;
use super::key::ScanPlan;
use crate::bitmap::TidBitmap;
use crate::entrypage::page_tuple;
use crate::ginpage::{METAPAGE_BLKNO, has_full_row, is_deleted, right_link};
use crate::index::GinIndex;
use crate::meta;
use crate::opclass::{PartialMatch, SearchMode, TriValue};
use crate::state::GinState;
use crate::tid::ItemPointer;
use crate::tuple::NullCategory;
use gin_buffer::{Buffer, LockMode};
use gin_common::page::{self, FIRST_OFFSET, INVALID_BLOCK, OffsetNumber};
use gin_common::{GinError, Result};
use std::cmp::Ordering;
use tracing::trace;

/// The heap row currently examined: tuples `first..last` of the latched
/// page belong to it.
struct PendingPosition {
    item: ItemPointer,
    buffer: Buffer,
    first: OffsetNumber,
    last: OffsetNumber,
    has_match: Vec<bool>,
}

impl PendingPosition {
    /// Moves to the next heap row. Returns false at the end of the list.
    fn next_candidate(&mut self, index: &GinIndex) -> Result<bool> {
        self.item = ItemPointer::MIN;
        loop {
            let p = self.buffer.page();
            // A drain moved this page's rows into the entry tree already.
            if is_deleted(p) {
                return Ok(false);
            }
            let maxoff = page::max_offset(p);
            if self.first > maxoff {
                let next = right_link(p);
                if next == INVALID_BLOCK {
                    return Ok(false);
                }
                // Latch the next page before letting go of this one so a
                // drain cannot delete it in between.
                let mut nb = index.read_buffer(next)?;
                nb.lock(LockMode::Share);
                self.buffer = nb;
                self.first = FIRST_OFFSET;
                continue;
            }

            self.item = page_tuple(p, self.first)?.heap_tid();
            self.last = if has_full_row(p) {
                let mut last = self.first + 1;
                while last <= maxoff && page_tuple(p, last)?.heap_tid() == self.item {
                    last += 1;
                }
                last
            } else {
                // The whole page belongs to one row.
                maxoff + 1
            };
            return Ok(true);
        }
    }
}

/// Evaluates every pending row against the plan, adding matches to
/// `bitmap`. Returns the number of rows added.
pub fn scan_pending(index: &GinIndex, plan: &mut ScanPlan, bitmap: &mut TidBitmap) -> Result<u64> {
    // Conflicts with fast-path inserts, which check the metapage.
    index.predicate_locker().lock_page(METAPAGE_BLKNO);

    let mut metabuf = index.read_buffer(METAPAGE_BLKNO)?;
    metabuf.lock(LockMode::Share);
    let head = meta::read_meta(index.name(), metabuf.page())?.head;
    if head == INVALID_BLOCK {
        return Ok(0);
    }
    let mut buffer = index.read_buffer(head)?;
    buffer.lock(LockMode::Share);
    drop(metabuf);

    let mut pos = PendingPosition {
        item: ItemPointer::MIN,
        buffer,
        first: FIRST_OFFSET,
        last: FIRST_OFFSET,
        has_match: vec![false; plan.keys.len()],
    };
    let state = index.state();
    let mut ntids = 0;
    while pos.next_candidate(index)? {
        index.check_for_interrupts()?;
        if !collect_matches_for_row(index, plan, &mut pos)? {
            continue;
        }
        let mut recheck = false;
        let mut matched = true;
        for key in plan.keys.iter_mut() {
            if !key.bool_consistent(state.opclass(key.attno)) {
                matched = false;
                break;
            }
            recheck |= key.recheck_cur_item;
        }
        if matched {
            bitmap.add_tids(&[pos.item], recheck);
            ntids += 1;
        }
    }
    trace!(index = index.name(), ntids, "scanned pending list");
    Ok(ntids)
}

/// Sets each key's `entry_res` from the tuples of the current row, reading
/// further pages when the row spans them. Returns false when some key that
/// needs a present entry has none.
fn collect_matches_for_row(index: &GinIndex, plan: &mut ScanPlan, pos: &mut PendingPosition) -> Result<bool> {
    let state = index.state();
    for key in plan.keys.iter_mut() {
        key.entry_res.clear();
        key.entry_res.resize(key.entries.len(), TriValue::False);
    }
    pos.has_match.iter_mut().for_each(|m| *m = false);

    loop {
        let p = pos.buffer.page();
        for (k, key) in plan.keys.iter_mut().enumerate() {
            for (j, &id) in key.entries.iter().enumerate() {
                // Matched on an earlier page of the row.
                if key.entry_res[j] != TriValue::False {
                    continue;
                }
                let entry = &plan.entries[id];
                let matched = match_entry(state, p, pos.first, pos.last, key.attno, entry)?;
                if matched {
                    key.entry_res[j] = TriValue::True;
                }
                pos.has_match[k] |= matched;
            }
        }

        pos.first = pos.last;
        if has_full_row(p) {
            break;
        }
        let item = pos.item;
        if !pos.next_candidate(index)? || pos.item != item {
            return Err(GinError::corrupted(
                index.name(),
                pos.buffer.block(),
                format!("could not find additional pending pages for heap tuple {item}"),
            ));
        }
    }

    // Exclude-only keys have no entry that must be present.
    Ok(plan
        .keys
        .iter()
        .zip(&pos.has_match)
        .all(|(key, matched)| *matched || key.exclude_only))
}

/// Whether tuples `low..high` of `page` contain `entry`.
fn match_entry(
    state: &GinState,
    page: &[u8],
    mut low: OffsetNumber,
    mut high: OffsetNumber,
    attno: u16,
    entry: &ScanEntry,
) -> Result<bool> {
    let end = high;
    while low < high {
        let mid = low + (high - low) / 2;
        let t = page_tuple(page, mid)?;
        match attno.cmp(&t.attno()) {
            Ordering::Less => {
                high = mid;
                continue;
            }
            Ordering::Greater => {
                low = mid + 1;
                continue;
            }
            Ordering::Equal => {}
        }
        let res = if entry.query_category == NullCategory::EmptyQuery {
            if entry.search_mode == SearchMode::All && t.category() == NullCategory::NullItem {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        } else {
            state.compare_entries(
                attno,
                &entry.query_key,
                entry.query_category,
                t.key(),
                t.category(),
            )
        };
        match res {
            Ordering::Equal => {
                return if entry.partial_match {
                    match_partial(state, page, mid, end, entry)
                } else {
                    Ok(true)
                };
            }
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
        }
    }
    if entry.partial_match {
        // No exact hit; scan forward from the first greater tuple.
        return match_partial(state, page, high, end, entry);
    }
    Ok(false)
}

/// Linear partial-match scan of tuples `off..end`.
fn match_partial(
    state: &GinState,
    page: &[u8],
    mut off: OffsetNumber,
    end: OffsetNumber,
    entry: &ScanEntry,
) -> Result<bool> {
    if entry.query_category != NullCategory::NormKey {
        return Ok(false);
    }
    let opclass = state.opclass(entry.attno);
    while off < end {
        let t = page_tuple(page, off)?;
        if t.attno() != entry.attno || t.category() != NullCategory::NormKey {
            return Ok(false);
        }
        match opclass.compare_partial(&entry.query_key, t.key(), entry.strategy, entry.extra.as_ref()) {
            PartialMatch::Match => return Ok(true),
            PartialMatch::Stop => return Ok(false),
            PartialMatch::Skip => off += 1,
        }
    }
    Ok(false)
}
