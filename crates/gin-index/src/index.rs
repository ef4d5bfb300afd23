//! The index handle.
//!
//! [`GinIndex`] ties together the relation's pages, its WAL, the per-index
//! key state and the host hooks. The page-level machinery in the other
//! modules reaches storage only through the helpers defined here; the public
//! operations are implemented as `impl GinIndex` blocks next to the code
//! they drive.

use crate::ginpage::{self, GIN_LEAF, METAPAGE_BLKNO, ROOT_BLKNO};
use crate::hooks::{Hooks, InjectionPoints, PredicateLocker};
use crate::meta::{self, GinMetaPageData, GinStatistics, MetaUpdate};
use crate::opclass::OpClass;
use crate::state::GinState;
use gin_buffer::{Buffer, BufferPool, FreeSpaceMap, LockMode, PageLockTable};
use gin_common::page::{self, BlockNumber};
use gin_common::{EngineConfig, GinError, IndexOptions, Result};
use gin_wal::{GinRecordType, Lsn, RecordBuilder, WalWriter};
use std::sync::Arc;
use tracing::{debug, info};

/// An inverted index over one relation.
pub struct GinIndex {
    name: String,
    state: GinState,
    pool: Arc<BufferPool>,
    wal: Arc<WalWriter>,
    fsm: FreeSpaceMap,
    page_locks: PageLockTable,
    options: IndexOptions,
    config: EngineConfig,
    hooks: Hooks,
}

impl std::fmt::Debug for GinIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GinIndex")
            .field("name", &self.name)
            .field("nblocks", &self.pool.nblocks())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GinIndex {
    /// Creates an empty index with an in-memory WAL and default hooks.
    pub fn create(
        name: &str,
        opclasses: Vec<Arc<dyn OpClass>>,
        options: IndexOptions,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::create_with(
            name,
            opclasses,
            options,
            config,
            Arc::new(WalWriter::in_memory()),
            Hooks::default(),
        )
    }

    /// Creates an empty index: a metapage and an empty root leaf.
    pub fn create_with(
        name: &str,
        opclasses: Vec<Arc<dyn OpClass>>,
        options: IndexOptions,
        config: EngineConfig,
        wal: Arc<WalWriter>,
        hooks: Hooks,
    ) -> Result<Self> {
        let index = Self::assemble(
            Arc::new(BufferPool::new(name)),
            opclasses,
            options,
            config,
            wal,
            hooks,
        )?;
        index.build_empty()?;
        Ok(index)
    }

    /// Opens an index over existing pages, for instance ones loaded from
    /// disk or rebuilt by redo.
    pub fn open(
        pool: Arc<BufferPool>,
        opclasses: Vec<Arc<dyn OpClass>>,
        options: IndexOptions,
        config: EngineConfig,
        wal: Arc<WalWriter>,
        hooks: Hooks,
    ) -> Result<Self> {
        let index = Self::assemble(pool, opclasses, options, config, wal, hooks)?;
        if index.pool.nblocks() <= ROOT_BLKNO {
            return Err(GinError::corrupted(
                &index.name,
                0,
                "relation is too short to hold an index",
            ));
        }
        index.read_metapage()?;

        // Rebuild the free-space map from deleted pages.
        let mut free = 0;
        for block in ROOT_BLKNO + 1..index.pool.nblocks() {
            let mut buf = index.pool.read_buffer(block)?;
            buf.lock(LockMode::Share);
            let p = buf.page();
            if page::page_is_new(p) || ginpage::is_deleted(p) {
                index.fsm.record_free_page(block);
                free += 1;
            }
        }
        info!(
            index = %index.name,
            nblocks = index.pool.nblocks(),
            free,
            "opened index"
        );
        Ok(index)
    }

    fn assemble(
        pool: Arc<BufferPool>,
        opclasses: Vec<Arc<dyn OpClass>>,
        options: IndexOptions,
        config: EngineConfig,
        wal: Arc<WalWriter>,
        hooks: Hooks,
    ) -> Result<Self> {
        options.validate()?;
        config.validate()?;
        let state = GinState::new(opclasses, &options)?;
        Ok(Self {
            name: pool.name().to_string(),
            state,
            pool,
            wal,
            fsm: FreeSpaceMap::new(),
            page_locks: PageLockTable::new(),
            options,
            config,
            hooks,
        })
    }

    /// Formats the metapage and the root leaf of an empty relation.
    fn build_empty(&self) -> Result<()> {
        self.pool.ensure_blocks(ROOT_BLKNO + 1);
        let mut metabuf = self.pool.read_buffer(METAPAGE_BLKNO)?;
        let mut rootbuf = self.pool.read_buffer(ROOT_BLKNO)?;
        metabuf.lock(LockMode::Exclusive);
        rootbuf.lock(LockMode::Exclusive);

        meta::init_metapage(metabuf.page_mut());
        ginpage::init_page(rootbuf.page_mut(), GIN_LEAF);
        metabuf.mark_dirty();
        rootbuf.mark_dirty();

        let mut rec = RecordBuilder::new(GinRecordType::CreateIndex);
        rec.register_block(0, METAPAGE_BLKNO, true)
            .register_block(1, ROOT_BLKNO, true);
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(metabuf.page_mut(), lsn.0);
        page::set_page_lsn(rootbuf.page_mut(), lsn.0);
        debug!(index = %self.name, "initialized empty index");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &GinState {
        &self.state
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<WalWriter> {
        &self.wal
    }

    pub fn fsm(&self) -> &FreeSpaceMap {
        &self.fsm
    }

    pub(crate) fn page_locks(&self) -> &PageLockTable {
        &self.page_locks
    }

    pub fn nblocks(&self) -> BlockNumber {
        self.pool.nblocks()
    }

    /// Pins `block`. The buffer comes back unlatched.
    pub(crate) fn read_buffer(&self, block: BlockNumber) -> Result<Buffer> {
        self.pool.read_buffer(block)
    }

    /// Returns an exclusively latched page for new content: a recyclable
    /// page from the free-space map if one exists, otherwise a new block.
    pub(crate) fn new_buffer(&self) -> Result<Buffer> {
        let oldest = self.hooks.transactions.oldest_active();
        while let Some(block) = self.fsm.get_free_page() {
            let mut buf = self.pool.read_buffer(block)?;
            // Someone else may have recycled it already.
            if buf.try_lock_exclusive() {
                let p = buf.page();
                if page::page_is_new(p) || ginpage::is_recyclable(p, oldest) {
                    debug!(index = %self.name, block, "recycled page");
                    return Ok(buf);
                }
                buf.unlock();
            }
        }
        let mut buf = self.pool.extend()?;
        buf.lock(LockMode::Exclusive);
        Ok(buf)
    }

    /// Appends a record to the WAL.
    pub(crate) fn xlog(&self, rec: RecordBuilder) -> Result<Lsn> {
        self.wal.insert(rec, self.hooks.transactions.next_xid())
    }

    pub(crate) fn check_for_interrupts(&self) -> Result<()> {
        self.hooks.interrupt.check()
    }

    pub(crate) fn predicate_locker(&self) -> &dyn PredicateLocker {
        self.hooks.predicate.as_ref()
    }

    pub(crate) fn injection_points(&self) -> &InjectionPoints {
        &self.hooks.injection
    }

    /// Current metapage contents.
    pub fn read_metapage(&self) -> Result<GinMetaPageData> {
        let mut buf = self.pool.read_buffer(METAPAGE_BLKNO)?;
        buf.lock(LockMode::Share);
        meta::read_meta(&self.name, buf.page())
    }

    /// Statistics stored on the metapage.
    pub fn statistics(&self) -> Result<GinStatistics> {
        Ok(self.read_metapage()?.statistics())
    }

    /// Replaces the statistics on the metapage.
    pub fn update_stats(&self, stats: &GinStatistics) -> Result<()> {
        let mut metabuf = self.pool.read_buffer(METAPAGE_BLKNO)?;
        metabuf.lock(LockMode::Exclusive);
        let mut metadata = meta::read_meta(&self.name, metabuf.page())?;
        stats.apply_to(&mut metadata);
        meta::write_meta(metabuf.page_mut(), &metadata);
        metabuf.mark_dirty();

        let mut rec = RecordBuilder::new(GinRecordType::UpdateMetaPage);
        rec.register_block(0, METAPAGE_BLKNO, false)
            .main_data(&MetaUpdate::stats_only(metadata).to_bytes());
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(metabuf.page_mut(), lsn.0);
        debug!(
            index = %self.name,
            total = stats.n_total_pages,
            entry = stats.n_entry_pages,
            data = stats.n_data_pages,
            entries = stats.n_entries,
            "updated statistics"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::ArrayOps;

    fn array_index(name: &str) -> GinIndex {
        GinIndex::create(
            name,
            vec![Arc::new(ArrayOps)],
            IndexOptions::default(),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_formats_meta_and_root() {
        let index = array_index("idx");
        assert_eq!(index.nblocks(), 2);
        let meta = index.read_metapage().unwrap();
        assert!(!meta.has_pending());
        let mut root = index.read_buffer(ROOT_BLKNO).unwrap();
        root.lock(LockMode::Share);
        assert!(ginpage::is_leaf(root.page()));
        assert!(!ginpage::is_data(root.page()));
        assert_eq!(index.wal().records().unwrap().len(), 1);
    }

    #[test]
    fn test_new_buffer_extends_then_recycles() {
        let index = array_index("idx");
        let buf = index.new_buffer().unwrap();
        assert!(buf.is_exclusive());
        let block = buf.block();
        assert_eq!(block, 2);
        drop(buf);

        // A never-initialized page in the map is reused.
        index.fsm().record_free_page(block);
        let again = index.new_buffer().unwrap();
        assert_eq!(again.block(), block);
        drop(again);

        // A live page in the map is skipped.
        index.fsm().record_free_page(ROOT_BLKNO);
        let fresh = index.new_buffer().unwrap();
        assert_eq!(fresh.block(), 3);
    }

    #[test]
    fn test_update_stats_is_logged() {
        let index = array_index("idx");
        let stats = GinStatistics {
            n_total_pages: 9,
            n_entry_pages: 4,
            n_data_pages: 3,
            n_entries: 12,
            ..GinStatistics::default()
        };
        index.update_stats(&stats).unwrap();
        let got = index.statistics().unwrap();
        assert_eq!(got.n_total_pages, 9);
        assert_eq!(got.n_entries, 12);
        let records = index.wal().records().unwrap();
        assert_eq!(
            records.last().map(|r| r.record_type),
            Some(GinRecordType::UpdateMetaPage)
        );
    }

    #[test]
    fn test_open_rejects_short_relation() {
        let pool = Arc::new(BufferPool::new("short"));
        let err = GinIndex::open(
            pool,
            vec![Arc::new(ArrayOps)],
            IndexOptions::default(),
            EngineConfig::default(),
            Arc::new(WalWriter::in_memory()),
            Hooks::default(),
        )
        .unwrap_err();
        assert!(err.is_corruption());
    }
}
