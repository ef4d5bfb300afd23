//! Index scans.
//!
//! A scan compiles its keys into a [`key::ScanPlan`], evaluates the pending
//! list row by row, then advances the keys over the entry and posting trees
//! in TID order, AND-combining them. Results go into a [`TidBitmap`].

mod entry;
mod key;
mod pending;

pub use entry::{Outcome, PARTIAL_MATCH_RESTART_INJECTION, PARTIAL_MATCH_UNLATCHED_INJECTION};

use crate::bitmap::TidBitmap;
use crate::index::GinIndex;
use crate::tid::ItemPointer;
use gin_common::{Datum, Result};
use key::{ScanPlan, key_get_item, start_scan_key};
use tracing::{debug, debug_span};

/// One user predicate: `column <strategy> query`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKey {
    /// 1-based column number.
    pub attno: u16,
    pub strategy: u16,
    /// `None` is a SQL NULL argument, which matches nothing.
    pub query: Option<Datum>,
}

impl ScanKey {
    pub fn new(attno: u16, strategy: u16, query: Datum) -> Self {
        Self {
            attno,
            strategy,
            query: Some(query),
        }
    }

    pub fn null(attno: u16, strategy: u16) -> Self {
        Self {
            attno,
            strategy,
            query: None,
        }
    }
}

/// An open scan. Keys are compiled afresh by every [`GinScan::get_bitmap`].
#[derive(Debug)]
pub struct GinScan<'a> {
    index: &'a GinIndex,
    keys: Vec<ScanKey>,
}

impl GinIndex {
    pub fn begin_scan(&self, keys: &[ScanKey]) -> Result<GinScan<'_>> {
        Ok(GinScan {
            index: self,
            keys: keys.to_vec(),
        })
    }

    /// Runs a one-off scan and returns its bitmap.
    pub fn search(&self, keys: &[ScanKey]) -> Result<TidBitmap> {
        let mut scan = self.begin_scan(keys)?;
        let (bitmap, _) = scan.get_bitmap()?;
        scan.end();
        Ok(bitmap)
    }
}

impl GinScan<'_> {
    /// Replaces the scan keys.
    pub fn rescan(&mut self, keys: &[ScanKey]) {
        self.keys = keys.to_vec();
    }

    /// Every row that may match all keys, with the number of items added.
    /// Rows whose match is uncertain come back flagged for recheck.
    pub fn get_bitmap(&mut self) -> Result<(TidBitmap, u64)> {
        let index = self.index;
        let span = debug_span!("scan", index = index.name(), keys = self.keys.len());
        let _enter = span.enter();

        let mut bitmap = TidBitmap::with_memory_limit(index.config().work_mem_bytes());
        let mut plan = ScanPlan::new(index.state(), &self.keys)?;
        if plan.is_void {
            debug!("unsatisfiable scan");
            return Ok((bitmap, 0));
        }

        let mut ntids = pending::scan_pending(index, &mut plan, &mut bitmap)?;
        start_scan(index, &mut plan)?;

        let mut item = ItemPointer::MIN;
        while let Some((next, recheck)) = scan_get_item(index, &mut plan, item)? {
            if next.is_lossy() {
                bitmap.add_page(next.block);
            } else {
                bitmap.add_tids(&[next], recheck);
            }
            ntids += 1;
            item = next;
        }
        debug!(ntids, pages = bitmap.npages(), lossy = bitmap.nlossy(), "scan finished");
        Ok((bitmap, ntids))
    }

    pub fn end(self) {}
}

/// Positions every entry, applies the fuzzy cap and compiles the keys.
fn start_scan(index: &GinIndex, plan: &mut ScanPlan) -> Result<()> {
    for entry in plan.entries.iter_mut() {
        entry.start(index)?;
    }

    let limit = index.config().fuzzy_search_limit as u64;
    if limit > 0 {
        // Only when every entry looks large do we hope to cut the result
        // down to about `limit` by dropping items at random.
        let total = plan.entries.len() as u64;
        if plan.entries.iter().all(|e| e.predict > total * limit) {
            for entry in plan.entries.iter_mut() {
                entry.predict /= total;
                entry.reduce = true;
            }
            debug!(index = index.name(), limit, "reducing scan result");
        }
    }

    for key in plan.keys.iter_mut() {
        start_scan_key(index, key, &plan.entries)?;
    }
    Ok(())
}

/// Advances the keys in lockstep to the next item greater than
/// `advance_past` that all of them accept. Returns the item and whether it
/// must be rechecked, or `None` when some key is exhausted.
///
/// Relies on a key never yielding both exact and lossy items for the same
/// block.
fn scan_get_item(
    index: &GinIndex,
    plan: &mut ScanPlan,
    mut advance_past: ItemPointer,
) -> Result<Option<(ItemPointer, bool)>> {
    let ScanPlan { entries, keys, .. } = plan;
    loop {
        index.check_for_interrupts()?;
        let mut item = ItemPointer::MIN;
        let mut matched = true;
        for (i, key) in keys.iter_mut().enumerate() {
            // An exclude-only key cannot rule out a whole page.
            if item.is_lossy() && key.exclude_only {
                continue;
            }
            key_get_item(index, key, entries, advance_past)?;
            if key.is_finished {
                return Ok(None);
            }
            if !key.cur_item_matches {
                advance_past = key.cur_item;
                matched = false;
                break;
            }

            // From a lossy item only earlier blocks are ruled out.
            if key.cur_item.is_lossy() {
                if advance_past.block < key.cur_item.block {
                    advance_past = ItemPointer::new(key.cur_item.block, 0);
                }
            } else {
                advance_past = key.cur_item.prev_offset();
            }

            if i == 0 {
                item = key.cur_item;
            } else if key.cur_item.is_lossy() || item.is_lossy() {
                matched = key.cur_item.block == item.block;
            } else {
                matched = key.cur_item == item;
            }
            if !matched {
                break;
            }
        }
        if matched {
            let recheck = keys.iter().any(|k| k.recheck_cur_item);
            return Ok(Some((item, recheck)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Hooks, RecordingPredicateLocker};
    use crate::insert::entry_insert;
    use crate::opclass::{
        ARRAY_CONTAINED, ARRAY_CONTAINS, ARRAY_EQUAL, ARRAY_OVERLAP, ArrayOps, OpClass,
        PREFIX_EQUAL, PREFIX_MATCH, PrefixOps,
    };
    use crate::state::EntryKey;
    use crate::testutil;
    use gin_common::{EngineConfig, IndexOptions};
    use gin_common::GinError;
    use gin_wal::WalWriter;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, mpsc};
    use std::thread;

    type Row = (ItemPointer, Option<Datum>);

    fn rows(n: u32) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let tid = ItemPointer::new(i / 20, (i % 20 + 1) as u16);
                let value = if i % 45 == 0 {
                    None
                } else if i % 50 == 0 {
                    Some(Datum::Array(Vec::new()))
                } else {
                    Some(Datum::text_array(&[format!("t{}", i % 7), format!("u{}", i % 13)]))
                };
                (tid, value)
            })
            .collect()
    }

    fn load(index: &GinIndex, rows: &[Row]) {
        for (tid, value) in rows {
            index.insert(&[value.clone()], *tid).unwrap();
        }
    }

    fn expected(rows: &[Row], keys: &[ScanKey]) -> Vec<ItemPointer> {
        rows.iter()
            .filter(|(_, v)| {
                keys.iter().all(|k| {
                    k.query
                        .as_ref()
                        .is_some_and(|q| ArrayOps::evaluate(v.as_ref(), q, k.strategy))
                })
            })
            .map(|(t, _)| *t)
            .collect()
    }

    /// Scan result with recheck applied against the heap rows.
    fn rechecked(index: &GinIndex, rows: &[Row], keys: &[ScanKey]) -> Vec<ItemPointer> {
        let bitmap = index.search(keys).unwrap();
        let candidates: Vec<ItemPointer> = rows
            .iter()
            .map(|(t, _)| *t)
            .filter(|t| bitmap.lookup(*t).is_some())
            .collect();
        let want = expected(rows, keys);
        // Completeness: nothing that matches is missing.
        for t in &want {
            assert!(candidates.contains(t), "missing {t}");
        }
        candidates.into_iter().filter(|t| want.contains(t)).collect()
    }

    fn key(strategy: u16, items: &[&str]) -> ScanKey {
        ScanKey::new(1, strategy, Datum::text_array(items))
    }

    #[test]
    fn test_overlap_and_contains_are_exact() {
        let data = rows(600);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        for keys in [
            vec![key(ARRAY_OVERLAP, &["t1", "u5"])],
            vec![key(ARRAY_CONTAINS, &["t3", "u3"])],
            vec![key(ARRAY_OVERLAP, &["nope"])],
        ] {
            let bitmap = index.search(&keys).unwrap();
            assert_eq!(bitmap.to_items(), expected(&data, &keys));
            assert!(bitmap.pages().all(|p| !p.recheck));
        }
    }

    #[test]
    fn test_and_of_keys() {
        let data = rows(2000);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        let keys = vec![key(ARRAY_OVERLAP, &["t2"]), key(ARRAY_OVERLAP, &["u7", "u8"])];
        let bitmap = index.search(&keys).unwrap();
        assert_eq!(bitmap.to_items(), expected(&data, &keys));
    }

    #[test]
    fn test_rare_and_frequent_entries() {
        let index = testutil::array_index("idx", false);
        let rare: Vec<ItemPointer> = (0..10).map(|i| ItemPointer::new(i * 97, 3)).collect();
        let frequent: Vec<ItemPointer> = (0..10_000).map(|i| ItemPointer::new(i / 10, (i % 10 + 1) as u16)).collect();
        entry_insert(&index, &EntryKey::norm(1, "rare"), &rare, None).unwrap();
        entry_insert(&index, &EntryKey::norm(1, "common"), &frequent, None).unwrap();

        let keys = vec![key(ARRAY_CONTAINS, &["common", "rare"])];
        let mut plan = ScanPlan::new(index.state(), &keys).unwrap();
        start_scan(&index, &mut plan).unwrap();
        let k = &plan.keys[0];
        let rare_id = plan.entries.iter().position(|e| &e.query_key[..] == b"rare").unwrap();
        let common_id = plan.entries.iter().position(|e| &e.query_key[..] == b"common").unwrap();
        assert_eq!(k.entries.len(), 2);
        // CONTAINS needs both, so the rarer entry alone is required.
        assert_eq!(k.required, vec![rare_id]);
        assert_eq!(k.additional, vec![common_id]);
        let mut got = Vec::new();
        let mut item = ItemPointer::MIN;
        while let Some((next, _)) = scan_get_item(&index, &mut plan, item).unwrap() {
            got.push(next);
            item = next;
        }
        let want: Vec<ItemPointer> = rare.iter().copied().filter(|t| frequent.contains(t)).collect();
        assert_eq!(got, want);
        assert!(plan.entries[rare_id].predict <= 10);
        // The frequent entry is only advanced to each rare candidate.
        let bound = 2 * rare.len() as u64 + 2;
        assert!(
            plan.entries[common_id].nadvances <= bound,
            "common entry advanced {} times",
            plan.entries[common_id].nadvances
        );
        assert!(plan.entries[rare_id].nadvances <= bound);
    }

    #[test]
    fn test_contained_includes_empty_rows() {
        let data = rows(400);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        let keys = vec![key(ARRAY_CONTAINED, &["t1", "u1", "t2", "u2"])];
        let bitmap = index.search(&keys).unwrap();
        // Every empty array is contained in anything.
        for (tid, v) in &data {
            if matches!(v, Some(Datum::Array(a)) if a.is_empty()) {
                assert_eq!(bitmap.lookup(*tid), Some(true));
            }
        }
        assert_eq!(rechecked(&index, &data, &keys), expected(&data, &keys));
    }

    #[test]
    fn test_contains_empty_matches_all_non_null() {
        let data = rows(300);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        let keys = vec![key(ARRAY_CONTAINS, &[])];
        let got = index.search(&keys).unwrap().to_items();
        let want: Vec<ItemPointer> = data.iter().filter(|(_, v)| v.is_some()).map(|(t, _)| *t).collect();
        assert_eq!(got, want);

        // Alongside a normal key it only filters.
        let keys = vec![key(ARRAY_CONTAINS, &[]), key(ARRAY_OVERLAP, &["t4"])];
        assert_eq!(index.search(&keys).unwrap().to_items(), expected(&data, &keys[1..]));
    }

    #[test]
    fn test_equal_with_empty_query() {
        let data = rows(300);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        let keys = vec![key(ARRAY_EQUAL, &[])];
        assert_eq!(rechecked(&index, &data, &keys), expected(&data, &keys));
    }

    #[test]
    fn test_full_index_scan_without_keys() {
        let data = rows(250);
        let index = testutil::array_index("idx", false);
        load(&index, &data);
        let got = index.search(&[]).unwrap().to_items();
        assert_eq!(got, data.iter().map(|(t, _)| *t).collect::<Vec<_>>());
    }

    #[test]
    fn test_void_scans() {
        let index = testutil::array_index("idx", false);
        load(&index, &rows(50));
        let mut scan = index.begin_scan(&[key(ARRAY_OVERLAP, &[])]).unwrap();
        let (bitmap, n) = scan.get_bitmap().unwrap();
        assert!(bitmap.is_empty());
        assert_eq!(n, 0);
        scan.rescan(&[ScanKey::null(1, ARRAY_OVERLAP)]);
        assert_eq!(scan.get_bitmap().unwrap().1, 0);
        scan.rescan(&[key(ARRAY_OVERLAP, &["t0"])]);
        assert!(scan.get_bitmap().unwrap().1 > 0);
        scan.end();
    }

    #[test]
    fn test_pending_and_main_combine() {
        let data = rows(1500);
        let index = testutil::array_index("idx", true);
        load(&index, &data[..700]);
        index.clean_pending_list().unwrap();
        load(&index, &data[700..]);
        assert!(index.pending_rows().unwrap() > 0);

        for keys in [
            vec![key(ARRAY_OVERLAP, &["t5"])],
            vec![key(ARRAY_CONTAINS, &["t0", "u0"])],
            vec![key(ARRAY_OVERLAP, &["t1"]), key(ARRAY_OVERLAP, &["u2", "u9"])],
            vec![key(ARRAY_CONTAINS, &[])],
        ] {
            assert_eq!(rechecked(&index, &data, &keys), expected(&data, &keys));
        }
        let contained = vec![key(ARRAY_CONTAINED, &["t1", "u1"])];
        assert_eq!(rechecked(&index, &data, &contained), expected(&data, &contained));
    }

    fn prefix_index(config: EngineConfig) -> GinIndex {
        GinIndex::create(
            "prefix",
            vec![Arc::new(PrefixOps) as Arc<dyn OpClass>],
            IndexOptions {
                use_fast_update: false,
                ..IndexOptions::default()
            },
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_prefix_partial_match() {
        let index = prefix_index(EngineConfig::default());
        let words = ["apple", "apricot", "banana", "apex", "bandana", "ap"];
        for (i, w) in words.iter().enumerate() {
            index
                .insert(&[Some(Datum::text(w))], ItemPointer::new(i as u32, 1))
                .unwrap();
        }
        index.insert(&[None], ItemPointer::new(99, 1)).unwrap();

        let got = index
            .search(&[ScanKey::new(1, PREFIX_MATCH, Datum::text("ap"))])
            .unwrap()
            .to_items();
        let want: Vec<ItemPointer> = [0, 1, 3, 5].iter().map(|i| ItemPointer::new(*i, 1)).collect();
        assert_eq!(got, want);

        let got = index
            .search(&[ScanKey::new(1, PREFIX_EQUAL, Datum::text("banana"))])
            .unwrap()
            .to_items();
        assert_eq!(got, vec![ItemPointer::new(2, 1)]);
    }

    fn apple_rows(index: &GinIndex, n: u32) -> Vec<ItemPointer> {
        let tids: Vec<ItemPointer> = (0..n).map(|i| ItemPointer::new(i / 10, (i % 10 + 1) as u16)).collect();
        for tid in &tids {
            index.insert(&[Some(Datum::text("apple"))], *tid).unwrap();
        }
        tids
    }

    #[test]
    fn test_partial_match_restarts_after_root_split() {
        let index = prefix_index(EngineConfig::default());
        // One entry with a posting tree, alone on the root leaf.
        let want = apple_rows(&index, 3000);

        let (hit_tx, hit_rx) = mpsc::channel::<()>();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = Mutex::new(go_rx);
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        index
            .hooks()
            .injection
            .attach_callback(PARTIAL_MATCH_UNLATCHED_INJECTION, move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    hit_tx.send(()).unwrap();
                    go_rx.lock().recv().unwrap();
                }
            });

        let got = thread::scope(|s| {
            let scan = s.spawn(|| {
                index
                    .search(&[ScanKey::new(1, PREFIX_MATCH, Datum::text("ap"))])
                    .unwrap()
                    .to_items()
            });
            // The walk has left the entry leaf unlatched: split the root.
            hit_rx.recv().unwrap();
            for i in 0..2000u32 {
                let word = format!("zz{i:05}-padding-to-fill-the-root-leaf");
                index
                    .insert(&[Some(Datum::text(&word))], ItemPointer::new(5000 + i, 1))
                    .unwrap();
            }
            go_tx.send(()).unwrap();
            scan.join().unwrap()
        });
        index.hooks().injection.detach(PARTIAL_MATCH_UNLATCHED_INJECTION);

        // Once before the split, once after restarting from the new root.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(got, want);
        let report = index.verify_index().unwrap();
        assert!(report.entry_pages > 1);
        assert_eq!(report.items, 3000 + 2000);
    }

    #[test]
    fn test_partial_match_restarts_are_bounded() {
        let config = EngineConfig {
            max_restarts: 2,
            ..EngineConfig::default()
        };
        let index = prefix_index(config);
        let want = apple_rows(&index, 3000);
        let keys = [ScanKey::new(1, PREFIX_MATCH, Datum::text("ap"))];

        index.hooks().injection.attach(PARTIAL_MATCH_RESTART_INJECTION);
        match index.search(&keys) {
            Err(GinError::Internal(msg)) => assert!(msg.contains("restarted more than 2 times"), "{msg}"),
            other => panic!("expected restart limit error, got {other:?}"),
        }
        index.hooks().injection.detach(PARTIAL_MATCH_RESTART_INJECTION);
        assert_eq!(index.search(&keys).unwrap().to_items(), want);
    }

    #[test]
    fn test_lossy_partial_match_stays_complete() {
        let config = EngineConfig {
            work_mem_kb: 64,
            ..EngineConfig::default()
        };
        let index = prefix_index(config);
        let nblocks = 4000u32;
        for block in 0..nblocks {
            let word = format!("w{block:05}");
            index
                .insert(&[Some(Datum::text(&word))], ItemPointer::new(block, 2))
                .unwrap();
        }
        let bitmap = index
            .search(&[ScanKey::new(1, PREFIX_MATCH, Datum::text("w"))])
            .unwrap();
        assert!(bitmap.nlossy() > 0);
        assert_eq!(bitmap.npages(), nblocks as usize);
        for block in 0..nblocks {
            assert!(bitmap.lookup(ItemPointer::new(block, 2)).is_some(), "block {block} missing");
        }
        for page in bitmap.pages() {
            // A block is either exact or lossy, never both.
            assert!(!page.lossy || page.offsets.is_empty());
            if page.lossy {
                assert!(page.recheck);
            }
        }

        // ANDed with an exact key, a lossy block still yields the row.
        let bitmap = index
            .search(&[
                ScanKey::new(1, PREFIX_MATCH, Datum::text("w")),
                ScanKey::new(1, PREFIX_EQUAL, Datum::text("w00007")),
            ])
            .unwrap();
        assert_eq!(bitmap.npages(), 1);
        assert!(bitmap.lookup(ItemPointer::new(7, 2)).is_some());
    }

    #[test]
    fn test_fuzzy_limit_reduces_result() {
        let config = EngineConfig {
            fuzzy_search_limit: 10,
            ..EngineConfig::default()
        };
        let index = GinIndex::create(
            "fuzzy",
            vec![Arc::new(ArrayOps) as Arc<dyn OpClass>],
            IndexOptions {
                use_fast_update: false,
                ..IndexOptions::default()
            },
            config,
        )
        .unwrap();
        let items: Vec<ItemPointer> = (0..20_000).map(|i| ItemPointer::new(i / 10, (i % 10 + 1) as u16)).collect();
        entry_insert(&index, &EntryKey::norm(1, "x"), &items, None).unwrap();
        let n = index.search(&[key(ARRAY_OVERLAP, &["x"])]).unwrap().ntids();
        assert!(n < 2_000, "fuzzy cap kept {n} items");
    }

    #[test]
    fn test_scan_takes_predicate_locks() {
        let locker = Arc::new(RecordingPredicateLocker::new());
        let hooks = Hooks {
            predicate: locker.clone(),
            ..Hooks::default()
        };
        let index = GinIndex::create_with(
            "locks",
            vec![Arc::new(ArrayOps) as Arc<dyn OpClass>],
            IndexOptions::default(),
            EngineConfig::default(),
            Arc::new(WalWriter::in_memory()),
            hooks,
        )
        .unwrap();
        load(&index, &rows(20));
        index.search(&[key(ARRAY_OVERLAP, &["absent"])]).unwrap();
        let locked = locker.locked_pages();
        assert!(locked.contains(&crate::ginpage::METAPAGE_BLKNO));
        assert!(locked.contains(&crate::ginpage::ROOT_BLKNO));
    }

    #[test]
    fn test_cancel_stops_scan() {
        let index = testutil::array_index("idx", false);
        load(&index, &rows(100));
        index.hooks().interrupt.cancel();
        assert!(matches!(
            index.search(&[key(ARRAY_OVERLAP, &["t1"])]),
            Err(gin_common::GinError::QueryCanceled)
        ));
        index.hooks().interrupt.reset();
        assert!(index.search(&[key(ARRAY_OVERLAP, &["t1"])]).is_ok());
    }
}
