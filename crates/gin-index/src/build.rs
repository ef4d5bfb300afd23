//! Index build: serial and parallel.
//!
//! Both paths extract keys row by row into a [`BuildAccumulator`]. The
//! serial build drains the accumulator straight into the entry tree. The
//! parallel build runs workers over a shared block scan; each worker sorts
//! its own output, combines runs of equal keys and hands the result to a
//! shared sort that the leader merges into the tree.

use crate::bulk::BuildAccumulator;
use crate::ginpage::{self, ROOT_BLKNO};
use crate::index::GinIndex;
use crate::insert::entry_insert;
use crate::meta::GinStatistics;
use crate::state::{EntryKey, GinState};
use crate::tid::ItemPointer;
use crate::tuplesort::{GinBuffer, GinTuple, TupleSort};
use gin_buffer::LockMode;
use gin_common::page::BlockNumber;
use gin_common::{Datum, GinError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use tracing::{debug, info, info_span, warn};

/// Rows of a heap relation, as the build sees them.
pub trait HeapSource: Sync {
    fn nblocks(&self) -> BlockNumber;

    /// Calls `f` with each live row of `block`, in offset order.
    fn scan_block(
        &self,
        block: BlockNumber,
        f: &mut dyn FnMut(ItemPointer, &[Option<Datum>]) -> Result<()>,
    ) -> Result<()>;
}

/// A heap held in memory, keyed by TID.
#[derive(Debug, Clone, Default)]
pub struct MemHeap {
    rows: BTreeMap<ItemPointer, Vec<Option<Datum>>>,
}

impl MemHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tid: ItemPointer, values: Vec<Option<Datum>>) {
        self.rows.insert(tid, values);
    }

    pub fn remove(&mut self, tid: ItemPointer) -> Option<Vec<Option<Datum>>> {
        self.rows.remove(&tid)
    }

    pub fn get(&self, tid: ItemPointer) -> Option<&[Option<Datum>]> {
        self.rows.get(&tid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemPointer, &[Option<Datum>])> + '_ {
        self.rows.iter().map(|(tid, v)| (*tid, v.as_slice()))
    }
}

impl HeapSource for MemHeap {
    fn nblocks(&self) -> BlockNumber {
        self.rows.keys().next_back().map_or(0, |tid| tid.block + 1)
    }

    fn scan_block(
        &self,
        block: BlockNumber,
        f: &mut dyn FnMut(ItemPointer, &[Option<Datum>]) -> Result<()>,
    ) -> Result<()> {
        let range = ItemPointer::new(block, 0)..=ItemPointer::new(block, u16::MAX);
        for (tid, values) in self.rows.range(range) {
            f(*tid, values)?;
        }
        Ok(())
    }
}

/// Build knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildParams {
    /// Parallel workers requested; 0 builds serially. Capped by the
    /// engine's `max_parallel_workers`.
    pub workers: usize,
    /// Block the parallel scan starts at; the scan wraps around to cover
    /// the blocks before it.
    pub scan_start: BlockNumber,
}

/// Outcome of a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildResult {
    pub heap_tuples: u64,
    /// Keys extracted, counted once per (row, key).
    pub index_tuples: u64,
}

impl GinIndex {
    /// Fills an empty index from `heap`.
    pub fn build(&self, heap: &dyn HeapSource, params: &BuildParams) -> Result<BuildResult> {
        self.check_empty_for_build()?;
        let workers = params.workers.min(self.config().max_parallel_workers);
        let _span = info_span!("build", index = self.name(), workers).entered();

        // The root leaf exists from creation.
        let mut stats = GinStatistics {
            n_entry_pages: 1,
            ..GinStatistics::default()
        };
        let result = if workers == 0 {
            self.serial_build(heap, &mut stats)?
        } else {
            self.parallel_build(heap, workers, params.scan_start, &mut stats)?
        };

        stats.n_total_pages = self.nblocks();
        self.update_stats(&stats)?;
        info!(
            heap_tuples = result.heap_tuples,
            index_tuples = result.index_tuples,
            entries = stats.n_entries,
            pages = stats.n_total_pages,
            "build finished"
        );
        Ok(result)
    }

    fn check_empty_for_build(&self) -> Result<()> {
        let meta = self.read_metapage()?;
        let mut root = self.read_buffer(ROOT_BLKNO)?;
        root.lock(LockMode::Share);
        let root_empty = ginpage::is_leaf(root.page())
            && gin_common::page::max_offset(root.page()) == 0;
        if meta.has_pending() || meta.n_entries != 0 || !root_empty {
            return Err(GinError::InvalidParameter {
                name: "index".to_string(),
                value: format!("\"{}\" already contains data", self.name()),
            });
        }
        Ok(())
    }

    fn serial_build(
        &self,
        heap: &dyn HeapSource,
        stats: &mut GinStatistics,
    ) -> Result<BuildResult> {
        let budget = self.config().maintenance_work_mem_bytes();
        let mut accum = BuildAccumulator::new();
        let mut result = BuildResult::default();
        for block in 0..heap.nblocks() {
            self.check_for_interrupts()?;
            heap.scan_block(block, &mut |tid, values| {
                let keys = self.extract_for_build(tid, values)?;
                accum.insert(tid, &keys);
                result.heap_tuples += 1;
                result.index_tuples += keys.len() as u64;
                if accum.allocated_memory() >= budget {
                    self.dump_build_accumulator(&mut accum, stats)?;
                }
                Ok(())
            })?;
        }
        self.dump_build_accumulator(&mut accum, stats)?;
        Ok(result)
    }

    fn extract_for_build(
        &self,
        tid: ItemPointer,
        values: &[Option<Datum>],
    ) -> Result<Vec<EntryKey>> {
        if !tid.is_valid() {
            return Err(GinError::InvalidTid {
                block: tid.block,
                offset: tid.offset,
            });
        }
        self.state().extract_row(values)
    }

    fn dump_build_accumulator(
        &self,
        accum: &mut BuildAccumulator,
        stats: &mut GinStatistics,
    ) -> Result<()> {
        if accum.is_empty() {
            return Ok(());
        }
        debug!(
            keys = accum.len(),
            memory = accum.allocated_memory(),
            "flushing build accumulator"
        );
        for (key, items) in accum.drain_sorted(self.state()) {
            self.check_for_interrupts()?;
            entry_insert(self, &key, &items, Some(stats))?;
        }
        Ok(())
    }

    fn parallel_build(
        &self,
        heap: &dyn HeapSource,
        workers: usize,
        scan_start: BlockNumber,
        stats: &mut GinStatistics,
    ) -> Result<BuildResult> {
        let shared = ParallelShared {
            heap,
            scan: ParallelBlockScan::new(heap.nblocks(), scan_start),
            sort: Mutex::new(TupleSort::new()),
            progress: Mutex::new(WorkerProgress::default()),
            done: Condvar::new(),
            canceled: AtomicBool::new(false),
        };
        // Workers and the leader's merge share the budget.
        let worker_mem = (self.config().maintenance_work_mem_bytes() / (workers + 1)).max(64 * 1024);

        let joined = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|id| {
                    let shared = &shared;
                    s.spawn(move || {
                        let _done = DoneGuard(shared);
                        if let Err(e) = self.run_worker(shared, id, worker_mem) {
                            warn!(worker = id, error = %e, "build worker failed");
                            shared.canceled.store(true, Ordering::Release);
                            shared.progress.lock().failure.get_or_insert(e.to_string());
                        }
                    })
                })
                .collect();

            {
                let mut progress = shared.progress.lock();
                while progress.finished < workers && progress.failure.is_none() {
                    shared.done.wait(&mut progress);
                }
                if progress.failure.is_some() {
                    shared.canceled.store(true, Ordering::Release);
                }
            }

            let mut panicked = false;
            for h in handles {
                panicked |= h.join().is_err();
            }
            panicked
        });

        let progress = std::mem::take(&mut *shared.progress.lock());
        if let Some(failure) = progress.failure {
            return Err(GinError::ParallelWorkerFailed(failure));
        }
        if joined {
            return Err(GinError::ParallelWorkerFailed(
                "build worker panicked".to_string(),
            ));
        }

        let sort = std::mem::take(&mut *shared.sort.lock());
        self.merge_shared_sort(sort, stats)?;
        Ok(BuildResult {
            heap_tuples: progress.heap_tuples,
            index_tuples: progress.index_tuples,
        })
    }

    /// One worker: scan blocks, sort locally, combine runs per key and
    /// publish them to the shared sort.
    fn run_worker(&self, shared: &ParallelShared<'_>, id: usize, budget: usize) -> Result<()> {
        let state = self.state();
        let mut accum = BuildAccumulator::new();
        let mut local = TupleSort::new();
        let mut heap_tuples = 0u64;
        let mut index_tuples = 0u64;
        debug!(worker = id, "build worker started");

        while let Some(block) = shared.scan.next_block() {
            if shared.canceled.load(Ordering::Acquire) {
                return Err(GinError::QueryCanceled);
            }
            self.check_for_interrupts()?;
            shared.heap.scan_block(block, &mut |tid, values| {
                let keys = self.extract_for_build(tid, values)?;
                // The scan wrapped around: TIDs restart from block 0, so
                // earlier runs must be closed before per-key lists go
                // backwards.
                if accum.last_tid().is_some_and(|last| tid < last) {
                    debug!(worker = id, block, "scan wrapped around, flushing");
                    flush_to_sort(state, &mut accum, &mut local)?;
                }
                accum.insert(tid, &keys);
                heap_tuples += 1;
                index_tuples += keys.len() as u64;
                if accum.allocated_memory() >= budget {
                    flush_to_sort(state, &mut accum, &mut local)?;
                }
                Ok(())
            })?;
        }
        flush_to_sort(state, &mut accum, &mut local)?;

        let mut combined = Vec::new();
        let mut buffer = GinBuffer::default();
        for tup in local.perform_sort(state)? {
            if !buffer.can_add(state, &tup) {
                if let Some((key, items)) = buffer.take() {
                    combined.push(GinTuple::new(state, &key, &items)?.to_bytes());
                }
            } else if buffer.should_trim(&tup) {
                if let Some(key) = buffer.key().cloned() {
                    let frozen = buffer.take_frozen();
                    combined.push(GinTuple::new(state, &key, &frozen)?.to_bytes());
                }
            }
            buffer.store(&tup)?;
        }
        if let Some((key, items)) = buffer.take() {
            combined.push(GinTuple::new(state, &key, &items)?.to_bytes());
        }

        let ntuples = combined.len();
        shared.sort.lock().put_raw(combined);
        let mut progress = shared.progress.lock();
        progress.heap_tuples += heap_tuples;
        progress.index_tuples += index_tuples;
        debug!(worker = id, heap_tuples, sort_tuples = ntuples, "build worker finished");
        Ok(())
    }

    /// Reads the shared sort in key order and inserts each key's combined
    /// TID list.
    fn merge_shared_sort(&self, sort: TupleSort, stats: &mut GinStatistics) -> Result<()> {
        let state = self.state();
        debug!(tuples = sort.len(), bytes = sort.memory(), "merging worker output");
        let mut buffer = GinBuffer::default();
        for tup in sort.perform_sort(state)? {
            self.check_for_interrupts()?;
            if !buffer.can_add(state, &tup) {
                if let Some((key, items)) = buffer.take() {
                    entry_insert(self, &key, &items, Some(stats))?;
                }
            } else if buffer.should_trim(&tup) {
                if let Some(key) = buffer.key().cloned() {
                    let frozen = buffer.take_frozen();
                    entry_insert(self, &key, &frozen, Some(stats))?;
                }
            }
            buffer.store(&tup)?;
        }
        if let Some((key, items)) = buffer.take() {
            entry_insert(self, &key, &items, Some(stats))?;
        }
        Ok(())
    }
}

fn flush_to_sort(
    state: &GinState,
    accum: &mut BuildAccumulator,
    sort: &mut TupleSort,
) -> Result<()> {
    for (key, items) in accum.drain_sorted(state) {
        sort.put(&GinTuple::new(state, &key, &items)?);
    }
    Ok(())
}

/// Hands out heap blocks to workers, starting at an arbitrary block and
/// wrapping around.
#[derive(Debug)]
pub struct ParallelBlockScan {
    nblocks: BlockNumber,
    start: BlockNumber,
    next: AtomicU32,
}

impl ParallelBlockScan {
    pub fn new(nblocks: BlockNumber, start: BlockNumber) -> Self {
        Self {
            nblocks,
            start: if nblocks == 0 { 0 } else { start % nblocks },
            next: AtomicU32::new(0),
        }
    }

    pub fn next_block(&self) -> Option<BlockNumber> {
        let k = self.next.fetch_add(1, Ordering::Relaxed);
        if k >= self.nblocks {
            return None;
        }
        Some(((u64::from(self.start) + u64::from(k)) % u64::from(self.nblocks)) as BlockNumber)
    }
}

#[derive(Debug, Default)]
struct WorkerProgress {
    finished: usize,
    heap_tuples: u64,
    index_tuples: u64,
    failure: Option<String>,
}

/// State shared by the leader and the workers of one parallel build.
struct ParallelShared<'h> {
    heap: &'h dyn HeapSource,
    scan: ParallelBlockScan,
    sort: Mutex<TupleSort>,
    progress: Mutex<WorkerProgress>,
    done: Condvar,
    canceled: AtomicBool,
}

/// Marks a worker finished when it exits, panics included.
struct DoneGuard<'a, 'h>(&'a ParallelShared<'h>);

impl Drop for DoneGuard<'_, '_> {
    fn drop(&mut self) {
        let mut progress = self.0.progress.lock();
        progress.finished += 1;
        if thread::panicking() {
            progress
                .failure
                .get_or_insert_with(|| "build worker panicked".to_string());
        }
        self.0.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn heap(rows: u32) -> MemHeap {
        let mut heap = MemHeap::new();
        for i in 0..rows {
            let tags = [format!("t{}", i % 7), format!("u{}", i % 3), "all".to_string()];
            heap.push(
                ItemPointer::new(i / 10, (i % 10 + 1) as u16),
                vec![Some(Datum::text_array(&tags))],
            );
        }
        heap
    }

    #[test]
    fn test_parallel_scan_wraps() {
        let scan = ParallelBlockScan::new(5, 3);
        let blocks: Vec<_> = std::iter::from_fn(|| scan.next_block()).collect();
        assert_eq!(blocks, vec![3, 4, 0, 1, 2]);
        assert!(ParallelBlockScan::new(0, 3).next_block().is_none());
    }

    #[test]
    fn test_serial_build() {
        let index = testutil::array_index("idx", true);
        let heap = heap(500);
        let res = index.build(&heap, &BuildParams::default()).unwrap();
        assert_eq!(res.heap_tuples, 500);
        assert_eq!(res.index_tuples, 1500);
        let all = testutil::lookup_items(&index, &EntryKey::norm(1, "all"));
        assert_eq!(all.len(), 500);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        let stats = index.statistics().unwrap();
        assert_eq!(stats.n_entries, 11);
        assert_eq!(stats.n_total_pages, index.nblocks());
        assert!(!index.read_metapage().unwrap().has_pending());
    }

    #[test]
    fn test_build_rejects_non_empty_index() {
        let index = testutil::array_index("idx", false);
        index
            .insert(&[Some(Datum::text_array(&["x"]))], ItemPointer::new(1, 1))
            .unwrap();
        assert!(index.build(&heap(10), &BuildParams::default()).is_err());
    }

    #[test]
    fn test_parallel_build_matches_serial() {
        let heap = heap(2000);
        let serial = testutil::array_index("serial", true);
        serial.build(&heap, &BuildParams::default()).unwrap();
        let parallel = testutil::array_index("parallel", true);
        let res = parallel
            .build(
                &heap,
                &BuildParams {
                    workers: 2,
                    scan_start: 117,
                },
            )
            .unwrap();
        assert_eq!(res.heap_tuples, 2000);
        for key in ["all", "t0", "t6", "u1"] {
            let key = EntryKey::norm(1, key);
            assert_eq!(
                testutil::lookup_items(&parallel, &key),
                testutil::lookup_items(&serial, &key),
            );
        }
        assert_eq!(
            parallel.statistics().unwrap().n_entries,
            serial.statistics().unwrap().n_entries
        );
    }

    struct FailingHeap;

    impl HeapSource for FailingHeap {
        fn nblocks(&self) -> BlockNumber {
            8
        }

        fn scan_block(
            &self,
            block: BlockNumber,
            f: &mut dyn FnMut(ItemPointer, &[Option<Datum>]) -> Result<()>,
        ) -> Result<()> {
            if block == 5 {
                return Err(GinError::Internal("heap read failed".to_string()));
            }
            f(ItemPointer::new(block, 1), &[Some(Datum::text_array(&["a"]))])
        }
    }

    #[test]
    fn test_worker_failure_aborts_build() {
        let index = testutil::array_index("idx", true);
        let err = index
            .build(
                &FailingHeap,
                &BuildParams {
                    workers: 2,
                    scan_start: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, GinError::ParallelWorkerFailed(msg) if msg.contains("heap read failed")));
        assert!(testutil::lookup(&index, &EntryKey::norm(1, "a")).is_none());
    }
}
