//! Metapage layout and index statistics.
//!
//! The metapage is block 0. Its content area holds the pending-list
//! pointers and counters followed by the planner statistics:
//!
//! ```text
//! offset  field
//!   24    head                 u32   first pending page
//!   28    tail                 u32   last pending page
//!   32    tail_free_size       u32
//!   36    n_pending_pages      u32
//!   40    n_pending_heap_tuples i64
//!   48    n_total_pages        u32
//!   52    n_entry_pages        u32
//!   56    n_data_pages         u32
//!   60    n_entries            i64
//!   68    version              i32
//! ```

use crate::ginpage::{GIN_META, init_page, is_meta};
use gin_common::page::{self, BlockNumber, INVALID_BLOCK, PageHeader};
use gin_common::{GinError, Result};
use serde::{Deserialize, Serialize};

/// Current on-disk format version. Version 1 indexes may hold
/// uncompressed posting-tree leaves.
pub const GIN_CURRENT_VERSION: i32 = 2;

/// Oldest version whose posting-tree leaves are always compressed.
pub const GIN_COMPRESSED_VERSION: i32 = 2;

const META_OFFSET: usize = PageHeader::SIZE;

/// Size of the serialized metapage content.
pub const META_DATA_SIZE: usize = 48;

/// Contents of the metapage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GinMetaPageData {
    pub head: BlockNumber,
    pub tail: BlockNumber,
    /// Free space on the tail page, so appenders can decide without reading it.
    pub tail_free_size: u32,
    pub n_pending_pages: BlockNumber,
    pub n_pending_heap_tuples: i64,
    pub n_total_pages: BlockNumber,
    pub n_entry_pages: BlockNumber,
    pub n_data_pages: BlockNumber,
    pub n_entries: i64,
    pub version: i32,
}

impl Default for GinMetaPageData {
    fn default() -> Self {
        Self {
            head: INVALID_BLOCK,
            tail: INVALID_BLOCK,
            tail_free_size: 0,
            n_pending_pages: 0,
            n_pending_heap_tuples: 0,
            n_total_pages: 0,
            n_entry_pages: 0,
            n_data_pages: 0,
            n_entries: 0,
            version: GIN_CURRENT_VERSION,
        }
    }
}

impl GinMetaPageData {
    pub fn to_bytes(&self) -> [u8; META_DATA_SIZE] {
        let mut buf = [0u8; META_DATA_SIZE];
        buf[0..4].copy_from_slice(&self.head.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tail.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tail_free_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.n_pending_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.n_pending_heap_tuples.to_le_bytes());
        buf[24..28].copy_from_slice(&self.n_total_pages.to_le_bytes());
        buf[28..32].copy_from_slice(&self.n_entry_pages.to_le_bytes());
        buf[32..36].copy_from_slice(&self.n_data_pages.to_le_bytes());
        buf[36..44].copy_from_slice(&self.n_entries.to_le_bytes());
        buf[44..48].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_DATA_SIZE {
            return Err(GinError::Internal(format!(
                "metapage data of {} bytes is truncated",
                buf.len()
            )));
        }
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let i64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            i64::from_le_bytes(b)
        };
        Ok(Self {
            head: u32_at(0),
            tail: u32_at(4),
            tail_free_size: u32_at(8),
            n_pending_pages: u32_at(12),
            n_pending_heap_tuples: i64_at(16),
            n_total_pages: u32_at(24),
            n_entry_pages: u32_at(28),
            n_data_pages: u32_at(32),
            n_entries: i64_at(36),
            version: u32_at(44) as i32,
        })
    }

    pub fn has_pending(&self) -> bool {
        self.head != INVALID_BLOCK
    }

    pub fn statistics(&self) -> GinStatistics {
        GinStatistics {
            n_pending_pages: self.n_pending_pages,
            n_total_pages: self.n_total_pages,
            n_entry_pages: self.n_entry_pages,
            n_data_pages: self.n_data_pages,
            n_entries: self.n_entries,
            version: self.version,
        }
    }
}

/// Formats `page` as an empty metapage.
pub fn init_metapage(page: &mut [u8]) {
    init_page(page, GIN_META);
    write_meta(page, &GinMetaPageData::default());
}

pub fn read_meta(index: &str, page: &[u8]) -> Result<GinMetaPageData> {
    if !is_meta(page) {
        return Err(GinError::corrupted(index, 0, "block 0 is not a metapage"));
    }
    let meta = GinMetaPageData::from_bytes(&page[META_OFFSET..META_OFFSET + META_DATA_SIZE])?;
    if meta.version != 1 && meta.version != GIN_CURRENT_VERSION {
        return Err(GinError::corrupted(
            index,
            0,
            format!("unsupported format version {}", meta.version),
        ));
    }
    Ok(meta)
}

pub fn write_meta(page: &mut [u8], meta: &GinMetaPageData) {
    page[META_OFFSET..META_OFFSET + META_DATA_SIZE].copy_from_slice(&meta.to_bytes());
    // Cover the content with pd_lower so full-page images keep it.
    page::set_lower(page, META_OFFSET + META_DATA_SIZE);
}

/// Main data of an UPDATE_META record: the new metapage contents plus the
/// pending-list change logged with it. With `ntuples > 0` the tuples were
/// appended to the tail page (block 1); otherwise, when `prev_tail` is
/// valid, that page's right link was set to `new_rightlink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaUpdate {
    pub meta: GinMetaPageData,
    pub prev_tail: BlockNumber,
    pub new_rightlink: BlockNumber,
    pub ntuples: u16,
}

impl MetaUpdate {
    pub const SIZE: usize = META_DATA_SIZE + 10;

    pub fn stats_only(meta: GinMetaPageData) -> Self {
        Self {
            meta,
            prev_tail: INVALID_BLOCK,
            new_rightlink: INVALID_BLOCK,
            ntuples: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.meta.to_bytes());
        out.extend_from_slice(&self.prev_tail.to_le_bytes());
        out.extend_from_slice(&self.new_rightlink.to_le_bytes());
        out.extend_from_slice(&self.ntuples.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(GinError::Internal(format!(
                "metapage update of {} bytes is truncated",
                buf.len()
            )));
        }
        let meta = GinMetaPageData::from_bytes(&buf[..META_DATA_SIZE])?;
        let rest = &buf[META_DATA_SIZE..];
        Ok(Self {
            meta,
            prev_tail: u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
            new_rightlink: u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
            ntuples: u16::from_le_bytes([rest[8], rest[9]]),
        })
    }
}

/// Planner-facing statistics kept on the metapage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GinStatistics {
    pub n_pending_pages: BlockNumber,
    pub n_total_pages: BlockNumber,
    pub n_entry_pages: BlockNumber,
    pub n_data_pages: BlockNumber,
    pub n_entries: i64,
    pub version: i32,
}

impl GinStatistics {
    /// Counts a page allocated during a build.
    pub fn count_new_page(&mut self, is_data: bool) {
        if is_data {
            self.n_data_pages += 1;
        } else {
            self.n_entry_pages += 1;
        }
    }

    /// Copies the counters onto `meta`.
    pub fn apply_to(&self, meta: &mut GinMetaPageData) {
        meta.n_total_pages = self.n_total_pages;
        meta.n_entry_pages = self.n_entry_pages;
        meta.n_data_pages = self.n_data_pages;
        meta.n_entries = self.n_entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gin_buffer::zeroed_page;

    #[test]
    fn test_init_metapage() {
        let mut page = zeroed_page();
        init_metapage(&mut page[..]);
        let meta = read_meta("idx", &page[..]).unwrap();
        assert_eq!(meta, GinMetaPageData::default());
        assert!(!meta.has_pending());
        assert_eq!(meta.version, GIN_CURRENT_VERSION);
        assert_eq!(page::lower(&page[..]), META_OFFSET + META_DATA_SIZE);
    }

    #[test]
    fn test_meta_bytes_roundtrip() {
        let meta = GinMetaPageData {
            head: 7,
            tail: 9,
            tail_free_size: 100,
            n_pending_pages: 3,
            n_pending_heap_tuples: 42,
            n_total_pages: 50,
            n_entry_pages: 20,
            n_data_pages: 25,
            n_entries: -1,
            version: 1,
        };
        assert_eq!(GinMetaPageData::from_bytes(&meta.to_bytes()).unwrap(), meta);
    }

    #[test]
    fn test_meta_update_roundtrip() {
        let update = MetaUpdate {
            meta: GinMetaPageData {
                head: 3,
                tail: 4,
                ..GinMetaPageData::default()
            },
            prev_tail: 3,
            new_rightlink: 4,
            ntuples: 0,
        };
        assert_eq!(MetaUpdate::from_bytes(&update.to_bytes()).unwrap(), update);
        assert!(MetaUpdate::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_read_rejects_non_meta() {
        let mut page = zeroed_page();
        init_page(&mut page[..], crate::ginpage::GIN_LEAF);
        assert!(read_meta("idx", &page[..]).is_err());
    }

    #[test]
    fn test_stats_counting() {
        let mut stats = GinStatistics::default();
        stats.count_new_page(true);
        stats.count_new_page(false);
        stats.count_new_page(false);
        stats.n_entries = 5;
        assert_eq!(stats.n_data_pages, 1);
        assert_eq!(stats.n_entry_pages, 2);
        let mut meta = GinMetaPageData::default();
        stats.apply_to(&mut meta);
        assert_eq!(meta.n_entries, 5);
        assert_eq!(meta.statistics().n_entry_pages, 2);
    }
}
