//! Scan keys: compilation of user predicates into entry streams, and the
//! per-key advancement that combines those streams through the operator
//! class's consistency function.

use super::ScanKey;
use super::entry::ScanEntry;
use crate::index::GinIndex;
use crate::opclass::{OpClass, QueryEntry, SearchMode, TriValue, tri_consistent};
use crate::state::GinState;
use crate::tid::ItemPointer;
use crate::tuple::NullCategory;
use bytes::Bytes;
use gin_common::{Datum, GinError, Result};
use std::cmp::Ordering;

/// Past this many entries no more duplicates are searched for.
const MAX_DEDUP_ENTRIES: usize = 100;

/// One compiled scan key.
pub struct KeyState {
    pub attno: u16,
    pub strategy: u16,
    pub search_mode: SearchMode,
    pub query: Datum,
    /// Entries as the operator class produced them, hidden ones excluded.
    pub query_entries: Vec<QueryEntry>,
    /// Ids into the scan's entry list; the first `nuser` are user entries,
    /// any after them hidden.
    pub entries: Vec<usize>,
    pub nuser: usize,
    /// The key can reject rows but never produce them on its own.
    pub exclude_only: bool,

    pub(super) required: Vec<usize>,
    pub(super) additional: Vec<usize>,
    pub entry_res: Vec<TriValue>,

    pub cur_item: ItemPointer,
    pub cur_item_matches: bool,
    pub recheck_cur_item: bool,
    pub is_finished: bool,
}

impl KeyState {
    fn new(attno: u16, strategy: u16, search_mode: SearchMode, query: Datum) -> Self {
        Self {
            attno,
            strategy,
            search_mode,
            query,
            query_entries: Vec::new(),
            entries: Vec::new(),
            nuser: 0,
            exclude_only: search_mode == SearchMode::All,
            required: Vec::new(),
            additional: Vec::new(),
            entry_res: Vec::new(),
            cur_item: ItemPointer::MIN,
            cur_item_matches: false,
            recheck_cur_item: false,
            is_finished: false,
        }
    }

    /// Tri-state consistency over the current `entry_res`.
    pub fn tri_consistent(&mut self, opclass: &dyn OpClass) -> TriValue {
        if self.search_mode == SearchMode::Everything {
            self.recheck_cur_item = false;
            return TriValue::True;
        }
        let res = tri_consistent(
            opclass,
            &self.entry_res[..self.nuser],
            self.strategy,
            &self.query,
            &self.query_entries,
        );
        if res == TriValue::True {
            self.recheck_cur_item = false;
        }
        res
    }

    /// Boolean consistency over the current `entry_res`, read as
    /// present/absent. Sets `recheck_cur_item`.
    pub fn bool_consistent(&mut self, opclass: &dyn OpClass) -> bool {
        if self.search_mode == SearchMode::Everything {
            self.recheck_cur_item = false;
            return true;
        }
        let check: Vec<bool> = self.entry_res[..self.nuser]
            .iter()
            .map(|v| *v != TriValue::False)
            .collect();
        let (res, recheck) = opclass.consistent(&check, self.strategy, &self.query, &self.query_entries);
        self.recheck_cur_item = recheck;
        res
    }
}

/// The compiled form of a scan's keys.
pub struct ScanPlan {
    pub entries: Vec<ScanEntry>,
    pub keys: Vec<KeyState>,
    /// Some key can never be satisfied.
    pub is_void: bool,
}

impl ScanPlan {
    /// Extracts every key's query entries and lays out the keys for
    /// evaluation: keys that can only exclude go last, and with no keys at
    /// all a full-index key is synthesized.
    pub fn new(state: &GinState, user_keys: &[ScanKey]) -> Result<Self> {
        let mut plan = Self {
            entries: Vec::new(),
            keys: Vec::with_capacity(user_keys.len().max(1)),
            is_void: false,
        };
        let mut attr_has_normal = vec![false; state.natts()];

        for uk in user_keys {
            if uk.attno == 0 || usize::from(uk.attno) > state.natts() {
                return Err(GinError::InvalidParameter {
                    name: "attno".to_string(),
                    value: uk.attno.to_string(),
                });
            }
            // Operators are strict: a null argument matches nothing.
            let Some(query) = uk.query.as_ref() else {
                plan.is_void = true;
                break;
            };
            let extracted = state.opclass(uk.attno).extract_query(query, uk.strategy)?;
            // The extractor may not ask for a full-index scan itself.
            let mode = match extracted.search_mode {
                SearchMode::Everything => SearchMode::All,
                m => m,
            };
            if extracted.entries.is_empty() && mode == SearchMode::Default {
                plan.is_void = true;
                break;
            }
            plan.fill_key(state, uk.attno, uk.strategy, mode, query.clone(), extracted.entries);
            if mode != SearchMode::All {
                attr_has_normal[usize::from(uk.attno) - 1] = true;
            }
        }

        // An ALL key is exclude-only only when a normal key on the same
        // attribute produces candidates for it; otherwise it must produce
        // its own through an empty-query entry.
        let mut nexclude = 0;
        for k in 0..plan.keys.len() {
            if plan.keys[k].search_mode != SearchMode::All {
                continue;
            }
            let att = usize::from(plan.keys[k].attno) - 1;
            if !attr_has_normal[att] {
                plan.keys[k].exclude_only = false;
                plan.add_hidden_entry(state, k, NullCategory::EmptyQuery);
                attr_has_normal[att] = true;
            } else {
                nexclude += 1;
            }
        }
        if nexclude > 0 {
            // Stable: normal keys first, exclude-only after.
            plan.keys.sort_by_key(|k| k.exclude_only);
        }

        if plan.keys.is_empty() && !plan.is_void {
            plan.fill_key(
                state,
                1,
                0,
                SearchMode::Everything,
                Datum::Array(Vec::new()),
                Vec::new(),
            );
        }
        Ok(plan)
    }

    fn fill_key(
        &mut self,
        state: &GinState,
        attno: u16,
        strategy: u16,
        mode: SearchMode,
        query: Datum,
        entries: Vec<QueryEntry>,
    ) {
        let mut key = KeyState::new(attno, strategy, mode, query);
        for qe in &entries {
            let id = self.find_or_add_entry(
                state,
                ScanEntry::new(
                    attno,
                    strategy,
                    mode,
                    qe.key.clone(),
                    qe.category,
                    qe.partial_match,
                    qe.extra.clone(),
                ),
            );
            key.entries.push(id);
        }
        key.nuser = entries.len();
        key.query_entries = entries;
        self.keys.push(key);
        let k = self.keys.len() - 1;
        match mode {
            SearchMode::IncludeEmpty => self.add_hidden_entry(state, k, NullCategory::EmptyItem),
            SearchMode::Everything => self.add_hidden_entry(state, k, NullCategory::EmptyQuery),
            _ => {}
        }
    }

    fn add_hidden_entry(&mut self, state: &GinState, k: usize, category: NullCategory) {
        let (attno, mode) = (self.keys[k].attno, self.keys[k].search_mode);
        let id = self.find_or_add_entry(
            state,
            ScanEntry::new(attno, 0, mode, Bytes::new(), category, false, None),
        );
        self.keys[k].entries.push(id);
    }

    /// Reuses an identical existing entry when there is one. Entries with
    /// operator-class data are never shared.
    fn find_or_add_entry(&mut self, state: &GinState, entry: ScanEntry) -> usize {
        if entry.extra.is_none() && self.entries.len() < MAX_DEDUP_ENTRIES {
            let found = self.entries.iter().position(|prev| {
                prev.extra.is_none()
                    && prev.partial_match == entry.partial_match
                    && prev.strategy == entry.strategy
                    && prev.search_mode == entry.search_mode
                    && prev.attno == entry.attno
                    && state.compare_entries(
                        entry.attno,
                        &prev.query_key,
                        prev.query_category,
                        &entry.query_key,
                        entry.query_category,
                    ) == Ordering::Equal
            });
            if let Some(id) = found {
                return id;
            }
        }
        self.entries.push(entry);
        self.entries.len() - 1
    }
}

/// Splits a key's entries into required and additional sets.
///
/// Entries are ordered by predicted frequency, rarest first, and moved into
/// the required set until the consistency function says no match is
/// possible from the remaining ones alone. Rows that only additional
/// entries contain can then be skipped without consulting them.
pub fn start_scan_key(index: &GinIndex, key: &mut KeyState, entries: &[ScanEntry]) -> Result<()> {
    key.cur_item = ItemPointer::MIN;
    key.cur_item_matches = false;
    key.recheck_cur_item = false;
    key.is_finished = false;
    key.entry_res = vec![TriValue::False; key.entries.len()];

    if key.exclude_only {
        key.required.clear();
        key.additional = key.entries.clone();
        return Ok(());
    }
    if key.entries.len() <= 1 {
        key.required = key.entries.clone();
        key.additional.clear();
        return Ok(());
    }

    let mut order: Vec<usize> = (0..key.entries.len()).collect();
    order.sort_by_key(|&i| entries[key.entries[i]].predict);
    for &i in &order[1..] {
        key.entry_res[i] = TriValue::Maybe;
    }
    let opclass = index.state().opclass(key.attno);
    let mut last = order.len() - 1;
    for (n, &i) in order[..order.len() - 1].iter().enumerate() {
        key.entry_res[i] = TriValue::False;
        if key.tri_consistent(opclass) == TriValue::False {
            last = n;
            break;
        }
        index.check_for_interrupts()?;
    }
    let nrequired = last + 1;
    key.required = order[..nrequired].iter().map(|&i| key.entries[i]).collect();
    key.additional = order[nrequired..].iter().map(|&i| key.entries[i]).collect();
    Ok(())
}

/// Advances `key` to its next candidate greater than `advance_past` and
/// decides whether it matches.
pub fn key_get_item(
    index: &GinIndex,
    key: &mut KeyState,
    entries: &mut [ScanEntry],
    mut advance_past: ItemPointer,
) -> Result<()> {
    // Already positioned past it, possibly on a lossy page.
    if key.cur_item > advance_past {
        return Ok(());
    }

    // Lossy pointers sort after the exact items of their block, so exact
    // items win the minimum.
    let mut min_item = ItemPointer::MAX;
    let mut all_finished = true;
    for &id in &key.required {
        let entry = &mut entries[id];
        if entry.is_finished {
            continue;
        }
        if entry.cur_item <= advance_past {
            entry.get_item(index, advance_past)?;
            if entry.is_finished {
                continue;
            }
        }
        all_finished = false;
        if entry.cur_item < min_item {
            min_item = entry.cur_item;
        }
    }

    if all_finished && !key.exclude_only {
        key.is_finished = true;
        return Ok(());
    }

    if !key.exclude_only {
        // Nothing below `min_item` matches. A lossy minimum only rules out
        // earlier blocks: additional entries may still hold exact items on
        // the same block.
        if min_item.is_lossy() {
            if advance_past.block < min_item.block {
                advance_past = ItemPointer::new(min_item.block, 0);
            }
        } else {
            advance_past = min_item.prev_offset();
        }
    } else {
        // No entry is sure to be present; consider the very next item.
        min_item = if advance_past.offset >= ItemPointer::MAX.offset - 1 {
            ItemPointer::new(advance_past.block.saturating_add(1), 1)
        } else {
            ItemPointer::new(advance_past.block, advance_past.offset + 1)
        };
    }

    // Load every additional entry up to the candidate before asking the
    // consistency function.
    for &id in &key.additional {
        let entry = &mut entries[id];
        if entry.is_finished {
            continue;
        }
        if entry.cur_item <= advance_past {
            entry.get_item(index, advance_past)?;
            if entry.is_finished {
                continue;
            }
        }
        if entry.cur_item < min_item {
            min_item = entry.cur_item;
        }
    }

    key.cur_item = min_item;
    let page_lossy = ItemPointer::lossy_page(min_item.block);
    let opclass = index.state().opclass(key.attno);

    // Whole-page check: lossy user entries as MAYBE, lossy hidden entries
    // as TRUE, everything else FALSE.
    let mut have_lossy = false;
    for (i, &id) in key.entries.iter().enumerate() {
        let entry = &entries[id];
        key.entry_res[i] = if !entry.is_finished && entry.cur_item == page_lossy {
            have_lossy = true;
            if i < key.nuser {
                TriValue::Maybe
            } else {
                TriValue::True
            }
        } else {
            TriValue::False
        };
    }
    if have_lossy && key.tri_consistent(opclass) != TriValue::False {
        key.cur_item = page_lossy;
        key.cur_item_matches = true;
        key.recheck_cur_item = true;
        return Ok(());
    }

    for (i, &id) in key.entries.iter().enumerate() {
        let entry = &entries[id];
        key.entry_res[i] = if entry.is_finished {
            TriValue::False
        } else if entry.cur_item == page_lossy {
            TriValue::Maybe
        } else if entry.cur_item == min_item {
            TriValue::True
        } else {
            TriValue::False
        };
    }
    match key.tri_consistent(opclass) {
        TriValue::True => key.cur_item_matches = true,
        TriValue::False => key.cur_item_matches = false,
        TriValue::Maybe => {
            key.cur_item_matches = true;
            key.recheck_cur_item = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::{ARRAY_CONTAINED, ARRAY_CONTAINS, ARRAY_OVERLAP, ArrayOps};
    use gin_common::IndexOptions;
    use std::sync::Arc;

    fn state(natts: usize) -> GinState {
        let ops: Vec<Arc<dyn OpClass>> = (0..natts).map(|_| Arc::new(ArrayOps) as Arc<dyn OpClass>).collect();
        GinState::new(ops, &IndexOptions::default()).unwrap()
    }

    fn key(attno: u16, strategy: u16, items: &[&str]) -> ScanKey {
        ScanKey::new(attno, strategy, Datum::text_array(items))
    }

    #[test]
    fn test_entries_are_shared_between_keys() {
        let st = state(1);
        let plan = ScanPlan::new(
            &st,
            &[key(1, ARRAY_OVERLAP, &["a", "b"]), key(1, ARRAY_OVERLAP, &["b", "c"])],
        )
        .unwrap();
        assert_eq!(plan.entries.len(), 3);
        assert_eq!(plan.keys[0].entries, vec![0, 1]);
        assert_eq!(plan.keys[1].entries, vec![1, 2]);
    }

    #[test]
    fn test_void_and_everything_plans() {
        let st = state(1);
        let void = ScanPlan::new(&st, &[key(1, ARRAY_OVERLAP, &[])]).unwrap();
        assert!(void.is_void);
        let null = ScanPlan::new(&st, &[ScanKey::null(1, ARRAY_OVERLAP)]).unwrap();
        assert!(null.is_void);

        let full = ScanPlan::new(&st, &[]).unwrap();
        assert_eq!(full.keys.len(), 1);
        assert_eq!(full.keys[0].search_mode, SearchMode::Everything);
        assert_eq!(full.keys[0].nuser, 0);
        assert_eq!(full.entries[0].query_category, NullCategory::EmptyQuery);

        assert!(ScanPlan::new(&st, &[key(2, ARRAY_OVERLAP, &["a"])]).is_err());
    }

    #[test]
    fn test_hidden_entries_by_mode() {
        let st = state(2);
        let plan = ScanPlan::new(&st, &[key(1, ARRAY_CONTAINED, &["a"])]).unwrap();
        let k = &plan.keys[0];
        assert_eq!(k.entries.len(), 2);
        assert_eq!(plan.entries[k.entries[1]].query_category, NullCategory::EmptyItem);

        // An ALL key alone on its attribute produces its own candidates.
        let plan = ScanPlan::new(&st, &[key(1, ARRAY_CONTAINS, &[])]).unwrap();
        assert!(!plan.keys[0].exclude_only);
        assert_eq!(plan.entries[0].query_category, NullCategory::EmptyQuery);

        // Next to a normal key on the same attribute it only excludes, and
        // moves behind the normal key.
        let plan = ScanPlan::new(
            &st,
            &[key(1, ARRAY_CONTAINS, &[]), key(1, ARRAY_OVERLAP, &["x"])],
        )
        .unwrap();
        assert_eq!(plan.keys[0].search_mode, SearchMode::Default);
        assert!(plan.keys[1].exclude_only);
        assert!(plan.keys[1].entries.is_empty());

        // A normal key on another attribute does not count.
        let plan = ScanPlan::new(
            &st,
            &[key(2, ARRAY_OVERLAP, &["x"]), key(1, ARRAY_CONTAINS, &[])],
        )
        .unwrap();
        assert!(plan.keys.iter().all(|k| !k.exclude_only));
    }

    #[test]
    fn test_bool_consistent_ignores_hidden_entries() {
        let st = state(1);
        let mut plan = ScanPlan::new(&st, &[key(1, ARRAY_CONTAINED, &["a", "b"])]).unwrap();
        let k = &mut plan.keys[0];
        k.entry_res = vec![TriValue::False, TriValue::False, TriValue::True];
        assert!(k.bool_consistent(st.opclass(1)));
        assert!(k.recheck_cur_item);
    }
}
