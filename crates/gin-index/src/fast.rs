//! The pending list.
//!
//! With fast update enabled, inserts append the row's entry tuples to a
//! chain of list pages hanging off the metapage instead of descending the
//! entry tree. A drain later moves the accumulated entries into the main
//! structure in bulk.
//!
//! All tuples of one heap row sit on consecutive pages; the page holding a
//! row's last tuple carries the full-row flag, and its `maxoff` in the
//! opaque area counts the rows that end on it.

use crate::bulk::BuildAccumulator;
use crate::ginpage::{
    self, GIN_DELETED, GIN_LIST, GIN_LIST_FULLROW, LIST_PAGE_SIZE, METAPAGE_BLKNO, gin_maxoff,
    has_full_row, is_deleted, right_link, set_right_link,
};
use crate::index::GinIndex;
use crate::insert::entry_insert;
use crate::meta::{self, GinMetaPageData, META_DATA_SIZE, MetaUpdate};
use crate::state::{EntryKey, GinState};
use crate::tid::ItemPointer;
use crate::tuple::{EntryTuple, form_pending_tuple};
use gin_buffer::{Buffer, LockMode};
use gin_common::page::{self, BlockNumber, FIRST_OFFSET, INVALID_BLOCK, ItemId, OffsetNumber, max_align};
use gin_common::{GinError, Result};
use gin_wal::{GinRecordType, RecordBuilder};
use tracing::{debug, info_span, trace};

/// Most list pages unlinked by one DELETE_LISTPAGE record.
pub const NDELETE_AT_ONCE: usize = 16;

/// Entry tuples of one heap row, ready for the pending list.
#[derive(Debug, Default)]
pub struct PendingCollector {
    tuples: Vec<Vec<u8>>,
    sum_size: usize,
}

impl PendingCollector {
    /// Forms a pending tuple for each of `keys`, all addressed to `tid`.
    pub fn collect(&mut self, state: &GinState, keys: &[EntryKey], tid: ItemPointer) -> Result<()> {
        for key in keys {
            let tuple =
                form_pending_tuple(key.attno, key.category, &key.key, tid, state.max_item_size())?;
            self.sum_size += max_align(tuple.len());
            self.tuples.push(tuple);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Page space the tuples take, line pointers included.
    fn space_needed(&self) -> usize {
        self.sum_size + self.tuples.len() * ItemId::SIZE
    }
}

/// Main data of an INSERT_LISTPAGE record; the tuples follow as block data.
fn encode_list_page_header(rightlink: BlockNumber, ntuples: usize) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0..4].copy_from_slice(&rightlink.to_le_bytes());
    out[4..6].copy_from_slice(&(ntuples as u16).to_le_bytes());
    out
}

pub fn decode_list_page_header(data: &[u8]) -> Result<(BlockNumber, usize)> {
    if data.len() < 6 {
        return Err(GinError::Internal(
            "truncated list page header".to_string(),
        ));
    }
    let rightlink = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let ntuples = u16::from_le_bytes([data[4], data[5]]) as usize;
    Ok((rightlink, ntuples))
}

/// Splits a run of concatenated tuples.
pub fn split_tuples(mut data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let size = EntryTuple::parse(data)?.size();
        if size == 0 {
            return Err(GinError::Internal("zero-length pending tuple".to_string()));
        }
        out.push(&data[..size]);
        data = &data[size..];
    }
    Ok(out)
}

/// Formats `page` as a list page holding `tuples`. The last page of a
/// sub-list holds the end of the one row it was built for.
pub fn fill_list_page<T: AsRef<[u8]>>(
    page: &mut [u8],
    tuples: &[T],
    rightlink: BlockNumber,
) -> Result<()> {
    ginpage::init_page(page, GIN_LIST);
    for tuple in tuples {
        if page::add_item(page, tuple.as_ref(), None).is_none() {
            return Err(GinError::Internal(
                "pending tuple does not fit on a fresh list page".to_string(),
            ));
        }
    }
    set_right_link(page, rightlink);
    if rightlink == INVALID_BLOCK {
        ginpage::add_flags(page, GIN_LIST_FULLROW);
        ginpage::set_gin_maxoff(page, 1);
    } else {
        ginpage::set_gin_maxoff(page, 0);
    }
    Ok(())
}

/// Appends the tuples of one row to the tail page.
pub fn append_to_tail<T: AsRef<[u8]>>(page: &mut [u8], tuples: &[T]) -> Result<()> {
    ginpage::set_gin_maxoff(page, gin_maxoff(page) + 1);
    for tuple in tuples {
        if page::add_item(page, tuple.as_ref(), None).is_none() {
            return Err(GinError::Internal(
                "pending tuple does not fit on the tail page".to_string(),
            ));
        }
    }
    Ok(())
}

/// Main data of a DELETE_LISTPAGE record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteListPages {
    pub meta: GinMetaPageData,
    pub ndeleted: u16,
    pub delete_xid: u32,
}

impl DeleteListPages {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_DATA_SIZE + 6);
        out.extend_from_slice(&self.meta.to_bytes());
        out.extend_from_slice(&self.ndeleted.to_le_bytes());
        out.extend_from_slice(&self.delete_xid.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_DATA_SIZE + 6 {
            return Err(GinError::Internal(
                "truncated list page deletion".to_string(),
            ));
        }
        let rest = &buf[META_DATA_SIZE..];
        Ok(Self {
            meta: GinMetaPageData::from_bytes(&buf[..META_DATA_SIZE])?,
            ndeleted: u16::from_le_bytes([rest[0], rest[1]]),
            delete_xid: u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]),
        })
    }
}

/// Formats a list page unlinked by a drain.
pub fn mark_list_page_deleted(page: &mut [u8], xid: u32) {
    ginpage::init_page(page, GIN_DELETED);
    ginpage::set_delete_xid(page, xid);
}

/// Pointers of a freshly built sub-list.
struct Sublist {
    head: BlockNumber,
    tail: BlockNumber,
    tail_free_size: u32,
    n_pages: u32,
}

/// Feeds the tuples of `page` from `start` on into `accum`, one call per
/// heap row and column.
fn process_pending_page(
    accum: &mut BuildAccumulator,
    index: &str,
    block: BlockNumber,
    page: &[u8],
    start: OffsetNumber,
) -> Result<()> {
    let maxoff = page::max_offset(page);
    let mut current: Option<(ItemPointer, u16)> = None;
    let mut keys = Vec::new();
    for off in start..=maxoff {
        let raw = page::item_checked(page, block, off)?;
        let tuple = EntryTuple::parse(raw)
            .map_err(|e| GinError::corrupted(index, block, e.to_string()))?;
        let row = (tuple.tid_field(), tuple.attno());
        match current {
            Some(cur) if cur == row => {}
            Some((tid, _)) => {
                accum.insert(tid, &keys);
                keys.clear();
                current = Some(row);
            }
            None => current = Some(row),
        }
        keys.push(EntryKey::from_tuple(&tuple));
    }
    if let Some((tid, _)) = current {
        accum.insert(tid, &keys);
    }
    Ok(())
}

impl GinIndex {
    /// Appends the collected tuples of one row to the pending list, and
    /// drains the list when it has outgrown its cleanup threshold.
    pub(crate) fn fast_insert(&self, collector: PendingCollector) -> Result<()> {
        if collector.is_empty() {
            return Ok(());
        }
        let mut metabuf = self.read_buffer(METAPAGE_BLKNO)?;
        // A pending entry may belong anywhere in the tree, so it conflicts
        // with every scan; scans lock the metapage to stand for that.
        self.predicate_locker().check_conflict(METAPAGE_BLKNO)?;

        let needed = collector.space_needed();
        let mut separate = needed > LIST_PAGE_SIZE;
        if !separate {
            metabuf.lock(LockMode::Exclusive);
            let metadata = meta::read_meta(self.name(), metabuf.page())?;
            if !metadata.has_pending() || needed > metadata.tail_free_size as usize {
                separate = true;
                metabuf.unlock();
            }
        }

        let mut rec = RecordBuilder::new(GinRecordType::UpdateMetaPage);
        let mut update = MetaUpdate::stats_only(GinMetaPageData::default());
        let mut tailbuf: Option<Buffer> = None;
        let mut metadata;
        if separate {
            let sub = self.make_sublist(&collector.tuples)?;
            metabuf.lock(LockMode::Exclusive);
            metadata = meta::read_meta(self.name(), metabuf.page())?;
            if !metadata.has_pending() {
                metadata.head = sub.head;
                metadata.tail = sub.tail;
                metadata.tail_free_size = sub.tail_free_size;
                metadata.n_pending_pages = sub.n_pages;
                metadata.n_pending_heap_tuples = 1;
            } else {
                let mut buf = self.read_buffer(metadata.tail)?;
                buf.lock(LockMode::Exclusive);
                if right_link(buf.page()) != INVALID_BLOCK {
                    return Err(GinError::corrupted(
                        self.name(),
                        metadata.tail,
                        "pending list tail has a right link",
                    ));
                }
                set_right_link(buf.page_mut(), sub.head);
                buf.mark_dirty();
                update.prev_tail = metadata.tail;
                update.new_rightlink = sub.head;
                rec.register_block(1, metadata.tail, false);
                metadata.tail = sub.tail;
                metadata.tail_free_size = sub.tail_free_size;
                metadata.n_pending_pages += sub.n_pages;
                metadata.n_pending_heap_tuples += 1;
                tailbuf = Some(buf);
            }
            debug!(
                index = self.name(),
                head = sub.head,
                tail = sub.tail,
                pages = sub.n_pages,
                "spliced sub-list onto pending list"
            );
        } else {
            // The metapage is still latched from the space check.
            metadata = meta::read_meta(self.name(), metabuf.page())?;
            let mut buf = self.read_buffer(metadata.tail)?;
            buf.lock(LockMode::Exclusive);
            append_to_tail(buf.page_mut(), &collector.tuples)?;
            buf.mark_dirty();
            metadata.n_pending_heap_tuples += 1;
            metadata.tail_free_size = page::exact_free_space(buf.page()) as u32;
            update.ntuples = collector.len() as u16;
            rec.register_block(1, metadata.tail, false)
                .block_data(1, &collector.tuples.concat());
            tailbuf = Some(buf);
        }

        meta::write_meta(metabuf.page_mut(), &metadata);
        metabuf.mark_dirty();
        update.meta = metadata;
        rec.register_block(0, METAPAGE_BLKNO, true)
            .main_data(&update.to_bytes());
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(metabuf.page_mut(), lsn.0);
        if let Some(mut buf) = tailbuf {
            page::set_page_lsn(buf.page_mut(), lsn.0);
        }

        let threshold = self.options().pending_list_cleanup_bytes(self.config());
        let need_cleanup = metadata.n_pending_pages as usize * LIST_PAGE_SIZE > threshold;
        drop(metabuf);

        if need_cleanup {
            self.insert_cleanup(false, true, false)?;
        }
        Ok(())
    }

    /// Writes `tuples` to a chain of new list pages.
    fn make_sublist(&self, tuples: &[Vec<u8>]) -> Result<Sublist> {
        let mut groups = Vec::new();
        let mut start = 0;
        let mut size = 0;
        for (i, tuple) in tuples.iter().enumerate() {
            let tupsize = max_align(tuple.len()) + ItemId::SIZE;
            if size + tupsize > LIST_PAGE_SIZE && i > start {
                groups.push(start..i);
                start = i;
                size = 0;
            }
            size += tupsize;
        }
        groups.push(start..tuples.len());

        let mut buffers = Vec::with_capacity(groups.len());
        for _ in &groups {
            buffers.push(self.new_buffer()?);
        }
        let blocks: Vec<BlockNumber> = buffers.iter().map(|b| b.block()).collect();
        let mut tail_free_size = 0;
        for (i, (mut buf, range)) in buffers.into_iter().zip(groups).enumerate() {
            let rightlink = blocks.get(i + 1).copied().unwrap_or(INVALID_BLOCK);
            tail_free_size = self.write_list_page(&mut buf, &tuples[range], rightlink)?;
        }
        Ok(Sublist {
            head: blocks[0],
            tail: blocks[blocks.len() - 1],
            tail_free_size,
            n_pages: blocks.len() as u32,
        })
    }

    /// Fills one list page and logs it. Returns the free space left.
    fn write_list_page(
        &self,
        buf: &mut Buffer,
        tuples: &[Vec<u8>],
        rightlink: BlockNumber,
    ) -> Result<u32> {
        let block = buf.block();
        fill_list_page(buf.page_mut(), tuples, rightlink)?;
        buf.mark_dirty();

        let mut rec = RecordBuilder::new(GinRecordType::InsertListPage);
        rec.main_data(&encode_list_page_header(rightlink, tuples.len()))
            .register_block(0, block, true)
            .block_data(0, &tuples.concat());
        let lsn = self.xlog(rec)?;
        page::set_page_lsn(buf.page_mut(), lsn.0);
        Ok(page::exact_free_space(buf.page()) as u32)
    }

    /// Moves pending entries into the entry tree and unlinks the drained
    /// pages. Returns the number of list pages deleted.
    ///
    /// Without `full_clean` the drain stops at the page that was the tail
    /// when it started. Without `force` it gives up at once if another drain
    /// holds the cleanup lock; with it, it waits.
    pub(crate) fn insert_cleanup(&self, full_clean: bool, fill_fsm: bool, force: bool) -> Result<u32> {
        let _cleanup_lock = if force {
            self.page_locks().lock(METAPAGE_BLKNO)
        } else {
            match self.page_locks().try_lock(METAPAGE_BLKNO) {
                Some(guard) => guard,
                None => {
                    trace!(index = self.name(), "pending list drain already running");
                    return Ok(0);
                }
            }
        };
        let work_mem = if force {
            self.config().maintenance_work_mem_bytes()
        } else {
            self.config().work_mem_bytes()
        };
        let span = info_span!("drain", index = self.name(), full_clean, force);
        let _enter = span.enter();

        let mut metabuf = self.read_buffer(METAPAGE_BLKNO)?;
        metabuf.lock(LockMode::Share);
        let metadata = meta::read_meta(self.name(), metabuf.page())?;
        if !metadata.has_pending() {
            return Ok(0);
        }
        // Rows appended after this point are left for the next drain.
        let finish = metadata.tail;
        let mut blkno = metadata.head;
        let mut buffer = self.read_buffer(blkno)?;
        buffer.lock(LockMode::Share);
        metabuf.unlock();

        let mut accum = BuildAccumulator::new();
        let mut reached_finish = false;
        let mut deleted = 0;
        let mut rounds = 0;
        loop {
            self.check_for_interrupts()?;
            if is_deleted(buffer.page()) {
                return Err(GinError::corrupted(
                    self.name(),
                    blkno,
                    "deleted page in pending list",
                ));
            }
            if blkno == finish && !full_clean {
                reached_finish = true;
            }
            process_pending_page(&mut accum, self.name(), blkno, buffer.page(), FIRST_OFFSET)?;

            let at_end = right_link(buffer.page()) == INVALID_BLOCK;
            if at_end || (has_full_row(buffer.page()) && accum.allocated_memory() >= work_mem) {
                // Inserting can take long; let appenders at the page meanwhile
                // and pick up what they added afterwards.
                let maxoff = page::max_offset(buffer.page());
                buffer.unlock();
                self.dump_accumulator(&mut accum)?;

                metabuf.lock(LockMode::Exclusive);
                buffer.lock(LockMode::Share);
                if page::max_offset(buffer.page()) != maxoff {
                    process_pending_page(&mut accum, self.name(), blkno, buffer.page(), maxoff + 1)?;
                    self.dump_accumulator(&mut accum)?;
                }

                blkno = right_link(buffer.page());
                drop(buffer);
                deleted += self.shift_list(&mut metabuf, blkno, fill_fsm)?;
                metabuf.unlock();
                rounds += 1;
                debug!(deleted, rounds, "drained pending list pages");

                if blkno == INVALID_BLOCK || reached_finish {
                    break;
                }
            } else {
                blkno = right_link(buffer.page());
                drop(buffer);
            }
            buffer = self.read_buffer(blkno)?;
            buffer.lock(LockMode::Share);
        }
        Ok(deleted)
    }

    fn dump_accumulator(&self, accum: &mut BuildAccumulator) -> Result<()> {
        for (key, items) in accum.drain_sorted(self.state()) {
            self.check_for_interrupts()?;
            entry_insert(self, &key, &items, None)?;
        }
        Ok(())
    }

    /// Unlinks the list pages before `new_head`. `metabuf` must be latched
    /// exclusively.
    fn shift_list(&self, metabuf: &mut Buffer, new_head: BlockNumber, fill_fsm: bool) -> Result<u32> {
        let mut metadata = meta::read_meta(self.name(), metabuf.page())?;
        let mut to_delete = metadata.head;
        let mut total = 0;
        while to_delete != new_head {
            let mut buffers = Vec::with_capacity(NDELETE_AT_ONCE);
            let mut rows = 0i64;
            while buffers.len() < NDELETE_AT_ONCE && to_delete != new_head {
                if to_delete == INVALID_BLOCK {
                    return Err(GinError::corrupted(
                        self.name(),
                        METAPAGE_BLKNO,
                        format!("pending list ends before block {new_head}"),
                    ));
                }
                let mut buf = self.read_buffer(to_delete)?;
                buf.lock(LockMode::Exclusive);
                if is_deleted(buf.page()) {
                    return Err(GinError::corrupted(
                        self.name(),
                        to_delete,
                        "pending list page already deleted",
                    ));
                }
                rows += gin_maxoff(buf.page()) as i64;
                to_delete = right_link(buf.page());
                buffers.push(buf);
            }

            metadata.head = to_delete;
            metadata.n_pending_pages = metadata.n_pending_pages.saturating_sub(buffers.len() as u32);
            metadata.n_pending_heap_tuples = (metadata.n_pending_heap_tuples - rows).max(0);
            if to_delete == INVALID_BLOCK {
                metadata.tail = INVALID_BLOCK;
                metadata.tail_free_size = 0;
                metadata.n_pending_pages = 0;
                metadata.n_pending_heap_tuples = 0;
            }
            meta::write_meta(metabuf.page_mut(), &metadata);
            metabuf.mark_dirty();

            let xid = self.hooks().transactions.assign_xid();
            let mut rec = RecordBuilder::new(GinRecordType::DeleteListPage);
            rec.register_block(0, METAPAGE_BLKNO, true);
            for (i, buf) in buffers.iter_mut().enumerate() {
                mark_list_page_deleted(buf.page_mut(), xid);
                buf.mark_dirty();
                rec.register_block(i as u8 + 1, buf.block(), true);
            }
            rec.main_data(
                &DeleteListPages {
                    meta: metadata,
                    ndeleted: buffers.len() as u16,
                    delete_xid: xid,
                }
                .to_bytes(),
            );
            let lsn = self.xlog(rec)?;
            page::set_page_lsn(metabuf.page_mut(), lsn.0);
            for buf in buffers.iter_mut() {
                page::set_page_lsn(buf.page_mut(), lsn.0);
            }
            let blocks: Vec<BlockNumber> = buffers.iter().map(|b| b.block()).collect();
            drop(buffers);
            if fill_fsm {
                for block in &blocks {
                    self.fsm().record_free_page(*block);
                }
            }
            total += blocks.len() as u32;
        }
        Ok(total)
    }

    /// Drains the whole pending list into the entry tree, waiting for any
    /// concurrent drain. Returns the number of list pages freed.
    pub fn clean_pending_list(&self) -> Result<u32> {
        let freed = self.insert_cleanup(true, true, true)?;
        debug!(index = self.name(), freed, "cleaned pending list");
        Ok(freed)
    }

    /// Number of heap rows waiting in the pending list.
    pub fn pending_rows(&self) -> Result<i64> {
        Ok(self.read_metapage()?.n_pending_heap_tuples)
    }
}
