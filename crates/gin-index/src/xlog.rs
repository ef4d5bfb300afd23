//! WAL redo.
//!
//! Every record kind the index writes has a redo routine here. Replaying a
//! log from the start into an empty buffer pool reproduces the pages of the
//! instance that wrote it. A page whose LSN is already at or past a record's
//! LSN is left alone, so replaying a record twice is harmless.

use crate::datapage::{apply_internal_insert, apply_recompress, decode_internal_payload, init_posting_tree_root};
use crate::entrypage::{apply_insert, decode_insert_payload};
use crate::fast::{DeleteListPages, append_to_tail, decode_list_page_header, fill_list_page, mark_list_page_deleted, split_tuples};
use crate::btree::{XLOG_INSERT_ISDATA, XLOG_INSERT_ISLEAF};
use crate::ginpage::{self, GIN_DELETED, GIN_INCOMPLETE_SPLIT, GIN_LEAF};
use crate::meta::{self, MetaUpdate};
use crate::vacuum::DeletePage;
use gin_buffer::{Buffer, BufferPool, LockMode};
use gin_common::page::{self, BlockNumber, INVALID_BLOCK, PAGE_SIZE};
use gin_common::{GinError, Result};
use gin_wal::{GinRecordType, LogRecord};
use tracing::{debug, info_span, trace};

/// State of a block referenced by a record being replayed.
enum BlockRedo {
    /// The record does not reference the block.
    NotFound,
    /// The change is already on the page, or a full image replaced it.
    Done,
    /// The page needs the record's change, and is latched exclusively.
    NeedsRedo(Buffer),
}

fn wal_error(record: &LogRecord, reason: impl Into<String>) -> GinError {
    GinError::WalCorrupted {
        lsn: record.lsn.0,
        reason: reason.into(),
    }
}

fn read_block_for_redo(pool: &BufferPool, record: &LogRecord, id: u8) -> Result<BlockRedo> {
    let Some(bref) = record.block(id) else {
        return Ok(BlockRedo::NotFound);
    };
    pool.ensure_blocks(bref.block + 1);
    let mut buffer = pool.read_buffer(bref.block)?;
    buffer.lock(LockMode::Exclusive);
    if let Some(image) = &bref.image {
        if image.len() != PAGE_SIZE {
            return Err(wal_error(
                record,
                format!("image of block {} has {} bytes", bref.block, image.len()),
            ));
        }
        buffer.page_mut().copy_from_slice(image);
        finish_block(&mut buffer, record);
        return Ok(BlockRedo::Done);
    }
    if !bref.will_init && page::page_lsn(buffer.page()) >= record.lsn.0 {
        return Ok(BlockRedo::Done);
    }
    Ok(BlockRedo::NeedsRedo(buffer))
}

fn finish_block(buffer: &mut Buffer, record: &LogRecord) {
    page::set_page_lsn(buffer.page_mut(), record.lsn.0);
    buffer.mark_dirty();
}

fn block_data<'a>(record: &'a LogRecord, id: u8) -> Result<&'a [u8]> {
    record
        .block(id)
        .map(|b| &b.data[..])
        .ok_or_else(|| wal_error(record, format!("block {id} is not registered")))
}

fn read_u32(data: &[u8], at: usize) -> Option<BlockNumber> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Clears the incomplete-split flag of the child whose downlink the record
/// installed.
fn redo_clear_incomplete_split(pool: &BufferPool, record: &LogRecord, id: u8) -> Result<()> {
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, id)? {
        ginpage::clear_flags(buffer.page_mut(), GIN_INCOMPLETE_SPLIT);
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_create_index(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        meta::init_metapage(buffer.page_mut());
        finish_block(&mut buffer, record);
    }
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 1)? {
        ginpage::init_page(buffer.page_mut(), GIN_LEAF);
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_create_posting_tree(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        init_posting_tree_root(buffer.page_mut(), &record.main_data)?;
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_insert(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let main = &record.main_data[..];
    if main.len() < 2 {
        return Err(wal_error(record, "insert record without flags"));
    }
    let flags = u16::from_le_bytes([main[0], main[1]]);
    let is_data = flags & XLOG_INSERT_ISDATA != 0;
    let is_leaf = flags & XLOG_INSERT_ISLEAF != 0;
    // Inserting a downlink also points the split child's old downlink at
    // its right half.
    let rchild = if is_leaf {
        INVALID_BLOCK
    } else {
        read_u32(main, 6).ok_or_else(|| wal_error(record, "downlink insert without children"))?
    };
    if !is_leaf {
        redo_clear_incomplete_split(pool, record, 1)?;
    }

    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        let data = block_data(record, 0)?;
        let p = buffer.page_mut();
        match (is_data, is_leaf) {
            (true, true) => apply_recompress(p, data)?,
            (true, false) => {
                let (off, item) = decode_internal_payload(data)?;
                apply_internal_insert(p, off, item, rchild);
            }
            (false, _) => {
                let (off, insert) = decode_insert_payload(data)?;
                apply_insert(p, off, &insert, rchild)?;
            }
        }
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_split(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let main = &record.main_data[..];
    let flags = main
        .get(0..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| wal_error(record, "split record without flags"))?;
    if flags & XLOG_INSERT_ISLEAF == 0 {
        // Only present when the split page also received a downlink.
        redo_clear_incomplete_split(pool, record, 3)?;
    }
    // Both halves, and the new root of a root split, come as full images.
    for id in 0..3 {
        match read_block_for_redo(pool, record, id)? {
            BlockRedo::NeedsRedo(buffer) => {
                return Err(wal_error(
                    record,
                    format!("split of block {} has no page image", buffer.block()),
                ));
            }
            BlockRedo::Done | BlockRedo::NotFound => {}
        }
    }
    Ok(())
}

fn redo_vacuum_page(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    match read_block_for_redo(pool, record, 0)? {
        BlockRedo::NeedsRedo(_) => Err(wal_error(record, "vacuumed page has no image")),
        _ => Ok(()),
    }
}

fn redo_vacuum_data_leaf(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        apply_recompress(buffer.page_mut(), block_data(record, 0)?)?;
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_delete_page(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let data = DeletePage::from_bytes(&record.main_data)?;
    // Same order as at runtime: deleted page, parent, left sibling.
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        ginpage::add_flags(buffer.page_mut(), GIN_DELETED);
        ginpage::set_delete_xid(buffer.page_mut(), data.delete_xid);
        finish_block(&mut buffer, record);
    }
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 1)? {
        ginpage::delete_posting_item(buffer.page_mut(), data.parent_offset);
        finish_block(&mut buffer, record);
    }
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 2)? {
        ginpage::set_right_link(buffer.page_mut(), data.right_link);
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_update_metapage(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let update = MetaUpdate::from_bytes(&record.main_data)?;
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        if !ginpage::is_meta(buffer.page()) {
            meta::init_metapage(buffer.page_mut());
        }
        meta::write_meta(buffer.page_mut(), &update.meta);
        finish_block(&mut buffer, record);
    }

    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 1)? {
        if update.ntuples > 0 {
            let tuples = split_tuples(block_data(record, 1)?)?;
            if tuples.len() != update.ntuples as usize {
                return Err(wal_error(
                    record,
                    format!("expected {} tuples, found {}", update.ntuples, tuples.len()),
                ));
            }
            append_to_tail(buffer.page_mut(), &tuples)?;
        } else if update.prev_tail != INVALID_BLOCK {
            ginpage::set_right_link(buffer.page_mut(), update.new_rightlink);
        }
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_insert_list_page(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let (rightlink, ntuples) = decode_list_page_header(&record.main_data)?;
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        let tuples = split_tuples(block_data(record, 0)?)?;
        if tuples.len() != ntuples {
            return Err(wal_error(
                record,
                format!("list page with {ntuples} tuples carries {}", tuples.len()),
            ));
        }
        fill_list_page(buffer.page_mut(), &tuples, rightlink)?;
        finish_block(&mut buffer, record);
    }
    Ok(())
}

fn redo_delete_list_page(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    let data = DeleteListPages::from_bytes(&record.main_data)?;
    if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, 0)? {
        if !ginpage::is_meta(buffer.page()) {
            meta::init_metapage(buffer.page_mut());
        }
        meta::write_meta(buffer.page_mut(), &data.meta);
        finish_block(&mut buffer, record);
    }
    for i in 0..data.ndeleted {
        let id = i as u8 + 1;
        if let BlockRedo::NeedsRedo(mut buffer) = read_block_for_redo(pool, record, id)? {
            mark_list_page_deleted(buffer.page_mut(), data.delete_xid);
            finish_block(&mut buffer, record);
        }
    }
    Ok(())
}

/// Applies one record to `pool`.
pub fn redo(pool: &BufferPool, record: &LogRecord) -> Result<()> {
    trace!(
        lsn = record.lsn.0,
        kind = record.record_type.name(),
        blocks = record.blocks.len(),
        "redo"
    );
    match record.record_type {
        GinRecordType::CreateIndex => redo_create_index(pool, record),
        GinRecordType::CreatePostingTree => redo_create_posting_tree(pool, record),
        GinRecordType::Insert => redo_insert(pool, record),
        GinRecordType::Split => redo_split(pool, record),
        GinRecordType::VacuumPage => redo_vacuum_page(pool, record),
        GinRecordType::VacuumDataLeafPage => redo_vacuum_data_leaf(pool, record),
        GinRecordType::DeletePage => redo_delete_page(pool, record),
        GinRecordType::UpdateMetaPage => redo_update_metapage(pool, record),
        GinRecordType::InsertListPage => redo_insert_list_page(pool, record),
        GinRecordType::DeleteListPage => redo_delete_list_page(pool, record),
    }
}

/// Replays `records` in order. Returns the number applied.
pub fn replay(pool: &BufferPool, records: &[LogRecord]) -> Result<usize> {
    let span = info_span!("replay", relation = pool.name(), records = records.len());
    let _enter = span.enter();
    for record in records {
        redo(pool, record)?;
    }
    debug!(nblocks = pool.nblocks(), "replay finished");
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::GinIndex;
    use crate::testutil;
    use crate::tid::ItemPointer;
    use gin_common::Datum;

    fn same_pages(a: &BufferPool, b: &BufferPool) {
        let left = a.snapshot();
        let right = b.snapshot();
        assert_eq!(left.len(), right.len());
        for (block, (l, r)) in left.iter().zip(&right).enumerate() {
            assert!(l[..] == r[..], "block {block} differs after replay");
        }
    }

    fn load(index: &GinIndex, n: u32) {
        for i in 0..n {
            let tags = [format!("k{}", i % 40), "all".to_string(), format!("u{i}")];
            index
                .insert(&[Some(Datum::text_array(&tags))], ItemPointer::new(i / 10, (i % 10 + 1) as u16))
                .unwrap();
        }
    }

    #[test]
    fn test_replay_reproduces_tree_inserts() {
        let index = testutil::array_index("redo", false);
        load(&index, 4000);
        let pool = BufferPool::new("redo");
        let records = index.wal().records().unwrap();
        assert_eq!(replay(&pool, &records).unwrap(), records.len());
        same_pages(index.pool(), &pool);
    }

    #[test]
    fn test_replay_reproduces_pending_list() {
        let index = testutil::array_index("redo", true);
        load(&index, 1500);
        index.clean_pending_list().unwrap();
        load(&index, 200);
        let pool = BufferPool::new("redo");
        replay(&pool, &index.wal().records().unwrap()).unwrap();
        same_pages(index.pool(), &pool);
    }

    #[test]
    fn test_replay_twice_is_harmless() {
        let index = testutil::array_index("redo", false);
        load(&index, 500);
        let records = index.wal().records().unwrap();
        let pool = BufferPool::new("redo");
        replay(&pool, &records).unwrap();
        let inserts: Vec<LogRecord> = records
            .iter()
            .filter(|r| r.record_type == GinRecordType::Insert)
            .cloned()
            .collect();
        replay(&pool, &inserts).unwrap();
        same_pages(index.pool(), &pool);
    }

    #[test]
    fn test_split_without_image_is_rejected() {
        let index = testutil::array_index("redo", false);
        load(&index, 3000);
        let mut split = index
            .wal()
            .records()
            .unwrap()
            .into_iter()
            .find(|r| r.record_type == GinRecordType::Split)
            .unwrap();
        for b in &mut split.blocks {
            b.image = None;
        }
        let pool = BufferPool::new("redo");
        assert!(matches!(redo(&pool, &split), Err(GinError::WalCorrupted { .. })));
    }
}
