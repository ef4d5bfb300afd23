//! Inverted-index page layout.
//!
//! Every index page carries an 8-byte opaque area in its special space:
//!
//! ```text
//! +--------------+------------+------------+
//! | rightlink u32| maxoff u16 | flags u16  |
//! +--------------+------------+------------+
//! ```
//!
//! Entry-tree pages store index tuples behind ordinary line pointers.
//! Posting-tree (data) pages store a right bound followed either by an array
//! of [`PostingItem`] downlinks (internal) or by compressed segments (leaf).
//! `pd_lower` marks the end of the data area on data pages.

use crate::posting::{self, SegmentIter};
use crate::tid::{self, ItemPointer};
use gin_common::page::{
    self, BlockNumber, INVALID_BLOCK, MAX_INDEX_TUPLES_PER_PAGE, OffsetNumber, PAGE_SIZE,
    PageHeader, max_align,
};
use gin_common::{GinError, Result};

// =============================================================================
// Flags and opaque data
// =============================================================================

pub const GIN_DATA: u16 = 1 << 0;
pub const GIN_LEAF: u16 = 1 << 1;
pub const GIN_DELETED: u16 = 1 << 2;
pub const GIN_META: u16 = 1 << 3;
pub const GIN_LIST: u16 = 1 << 4;
pub const GIN_LIST_FULLROW: u16 = 1 << 5;
pub const GIN_INCOMPLETE_SPLIT: u16 = 1 << 6;
pub const GIN_COMPRESSED: u16 = 1 << 7;

/// Size of the opaque area.
pub const OPAQUE_SIZE: usize = 8;

/// Block holding the metapage.
pub const METAPAGE_BLKNO: BlockNumber = 0;
/// Block holding the entry-tree root.
pub const ROOT_BLKNO: BlockNumber = 1;

/// Start of the data area on posting-tree pages (after the right bound).
pub const DATA_PAGE_DATA_OFFSET: usize = PageHeader::SIZE + max_align(ItemPointer::SIZE);

/// Bytes available for data on a posting-tree page.
pub const DATA_PAGE_MAX_DATA_SIZE: usize =
    PAGE_SIZE - max_align(PageHeader::SIZE) - max_align(ItemPointer::SIZE) - max_align(OPAQUE_SIZE);

/// Bytes available for tuples on a pending-list page.
pub const LIST_PAGE_SIZE: usize = PAGE_SIZE - max_align(PageHeader::SIZE) - max_align(OPAQUE_SIZE);

/// Maximum downlinks on a posting-tree internal page.
pub const MAX_POSTING_ITEMS: usize = DATA_PAGE_MAX_DATA_SIZE / PostingItem::SIZE;

/// Decoded opaque area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GinOpaque {
    pub rightlink: BlockNumber,
    pub maxoff: OffsetNumber,
    pub flags: u16,
}

#[inline]
fn opaque_pos(page: &[u8]) -> usize {
    page::special_offset(page)
}

pub fn opaque(page: &[u8]) -> GinOpaque {
    let p = opaque_pos(page);
    GinOpaque {
        rightlink: u32::from_le_bytes([page[p], page[p + 1], page[p + 2], page[p + 3]]),
        maxoff: u16::from_le_bytes([page[p + 4], page[p + 5]]),
        flags: u16::from_le_bytes([page[p + 6], page[p + 7]]),
    }
}

pub fn set_opaque(page: &mut [u8], op: GinOpaque) {
    let p = opaque_pos(page);
    page[p..p + 4].copy_from_slice(&op.rightlink.to_le_bytes());
    page[p + 4..p + 6].copy_from_slice(&op.maxoff.to_le_bytes());
    page[p + 6..p + 8].copy_from_slice(&op.flags.to_le_bytes());
}

/// Formats an empty index page with the given flags.
pub fn init_page(page: &mut [u8], flags: u16) {
    page::page_init(page, OPAQUE_SIZE);
    set_opaque(
        page,
        GinOpaque {
            rightlink: INVALID_BLOCK,
            maxoff: 0,
            flags,
        },
    );
}

/// Formats an empty posting-tree page; the data area starts after the right bound.
pub fn init_data_page(page: &mut [u8], flags: u16) {
    init_page(page, flags | GIN_DATA);
    page::set_lower(page, DATA_PAGE_DATA_OFFSET);
}

#[inline]
pub fn flags(page: &[u8]) -> u16 {
    opaque(page).flags
}

pub fn set_flags(page: &mut [u8], flags: u16) {
    let mut op = opaque(page);
    op.flags = flags;
    set_opaque(page, op);
}

pub fn add_flags(page: &mut [u8], bits: u16) {
    set_flags(page, flags(page) | bits);
}

pub fn clear_flags(page: &mut [u8], bits: u16) {
    set_flags(page, flags(page) & !bits);
}

#[inline]
pub fn is_leaf(page: &[u8]) -> bool {
    flags(page) & GIN_LEAF != 0
}

#[inline]
pub fn is_data(page: &[u8]) -> bool {
    flags(page) & GIN_DATA != 0
}

#[inline]
pub fn is_deleted(page: &[u8]) -> bool {
    flags(page) & GIN_DELETED != 0
}

#[inline]
pub fn is_meta(page: &[u8]) -> bool {
    flags(page) & GIN_META != 0
}

#[inline]
pub fn is_list(page: &[u8]) -> bool {
    flags(page) & GIN_LIST != 0
}

#[inline]
pub fn has_full_row(page: &[u8]) -> bool {
    flags(page) & GIN_LIST_FULLROW != 0
}

#[inline]
pub fn is_incomplete_split(page: &[u8]) -> bool {
    flags(page) & GIN_INCOMPLETE_SPLIT != 0
}

#[inline]
pub fn is_compressed(page: &[u8]) -> bool {
    flags(page) & GIN_COMPRESSED != 0
}

#[inline]
pub fn right_link(page: &[u8]) -> BlockNumber {
    opaque(page).rightlink
}

pub fn set_right_link(page: &mut [u8], rightlink: BlockNumber) {
    let mut op = opaque(page);
    op.rightlink = rightlink;
    set_opaque(page, op);
}

#[inline]
pub fn is_rightmost(page: &[u8]) -> bool {
    right_link(page) == INVALID_BLOCK
}

/// The opaque `maxoff`: downlink count on internal data pages, item count on
/// uncompressed leaves, heap-row count on pending-list pages.
#[inline]
pub fn gin_maxoff(page: &[u8]) -> OffsetNumber {
    opaque(page).maxoff
}

pub fn set_gin_maxoff(page: &mut [u8], maxoff: OffsetNumber) {
    let mut op = opaque(page);
    op.maxoff = maxoff;
    set_opaque(page, op);
}

/// Transaction that deleted the page, kept in `pd_prune_xid`.
#[inline]
pub fn delete_xid(page: &[u8]) -> u32 {
    page::prune_xid(page)
}

pub fn set_delete_xid(page: &mut [u8], xid: u32) {
    page::set_prune_xid(page, xid);
}

/// A deleted page may be reused once no running transaction can still be
/// traversing it.
pub fn is_recyclable(page: &[u8], oldest_xid: u32) -> bool {
    if page::page_is_new(page) {
        return true;
    }
    is_deleted(page) && delete_xid(page) < oldest_xid
}

// =============================================================================
// Posting-tree pages
// =============================================================================

/// Downlink on a posting-tree internal page: child block and the highest key
/// of the child's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingItem {
    pub child: BlockNumber,
    pub key: ItemPointer,
}

impl PostingItem {
    pub const SIZE: usize = 4 + ItemPointer::SIZE;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.child.to_le_bytes());
        self.key.write_to(&mut buf[4..Self::SIZE]);
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            child: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            key: ItemPointer::from_bytes(&buf[4..Self::SIZE]),
        }
    }
}

/// Highest item allowed on the page; `(0,0)` on rightmost pages.
pub fn data_right_bound(page: &[u8]) -> ItemPointer {
    ItemPointer::from_bytes(&page[PageHeader::SIZE..PageHeader::SIZE + ItemPointer::SIZE])
}

pub fn set_data_right_bound(page: &mut [u8], bound: ItemPointer) {
    bound.write_to(&mut page[PageHeader::SIZE..PageHeader::SIZE + ItemPointer::SIZE]);
}

#[inline]
fn posting_item_pos(off: OffsetNumber) -> usize {
    DATA_PAGE_DATA_OFFSET + (off as usize - 1) * PostingItem::SIZE
}

pub fn posting_item(page: &[u8], off: OffsetNumber) -> PostingItem {
    PostingItem::from_bytes(&page[posting_item_pos(off)..])
}

pub fn set_posting_item(page: &mut [u8], off: OffsetNumber, item: PostingItem) {
    let p = posting_item_pos(off);
    item.write_to(&mut page[p..p + PostingItem::SIZE]);
}

/// All downlinks of an internal posting-tree page.
pub fn posting_items(page: &[u8]) -> Vec<PostingItem> {
    (1..=gin_maxoff(page)).map(|off| posting_item(page, off)).collect()
}

/// Rewrites the downlink array of an internal posting-tree page.
pub fn write_posting_items(page: &mut [u8], items: &[PostingItem]) {
    let end = DATA_PAGE_DATA_OFFSET + items.len() * PostingItem::SIZE;
    for (i, item) in items.iter().enumerate() {
        set_posting_item(page, (i + 1) as OffsetNumber, *item);
    }
    let special = page::special_offset(page);
    page[end..special].fill(0);
    set_gin_maxoff(page, items.len() as OffsetNumber);
    page::set_lower(page, end);
}

/// Inserts a downlink at `off`, shifting later ones right.
pub fn add_posting_item(page: &mut [u8], item: PostingItem, off: OffsetNumber) {
    let mut items = posting_items(page);
    let at = (off as usize).saturating_sub(1).min(items.len());
    items.insert(at, item);
    write_posting_items(page, &items);
}

/// Removes the downlink at `off`.
pub fn delete_posting_item(page: &mut [u8], off: OffsetNumber) {
    let mut items = posting_items(page);
    if off >= 1 && (off as usize) <= items.len() {
        items.remove(off as usize - 1);
    }
    write_posting_items(page, &items);
}

/// Compressed segments of a posting-tree leaf.
pub fn data_leaf_bytes(page: &[u8]) -> &[u8] {
    let end = page::lower(page).max(DATA_PAGE_DATA_OFFSET);
    &page[DATA_PAGE_DATA_OFFSET..end.min(page::special_offset(page))]
}

/// Replaces the segment area of a leaf and moves `pd_lower` to its end.
pub fn set_data_leaf_bytes(page: &mut [u8], data: &[u8]) {
    let end = DATA_PAGE_DATA_OFFSET + data.len();
    page[DATA_PAGE_DATA_OFFSET..end].copy_from_slice(data);
    let special = page::special_offset(page);
    page[end..special].fill(0);
    page::set_lower(page, end);
}

/// Free bytes on a compressed posting-tree leaf.
pub fn data_leaf_free_space(page: &[u8]) -> usize {
    DATA_PAGE_MAX_DATA_SIZE.saturating_sub(data_leaf_bytes(page).len())
}

/// Items stored on a posting-tree leaf in either format.
pub fn data_leaf_items(page: &[u8]) -> Result<Vec<ItemPointer>> {
    if is_compressed(page) {
        posting::decode_segments(data_leaf_bytes(page))
    } else {
        let n = gin_maxoff(page) as usize;
        let end = DATA_PAGE_DATA_OFFSET + n * ItemPointer::SIZE;
        if end > page::special_offset(page) {
            return Err(GinError::PostingListCorrupted(format!(
                "uncompressed leaf claims {n} items"
            )));
        }
        Ok(tid::read_item_pointers(&page[DATA_PAGE_DATA_OFFSET..], n))
    }
}

/// Items on a leaf strictly greater than `advance_past`. Whole segments that
/// end before `advance_past` are skipped without decoding.
pub fn data_leaf_items_after(page: &[u8], advance_past: ItemPointer) -> Result<Vec<ItemPointer>> {
    if !is_compressed(page) || advance_past.is_min() {
        let mut items = data_leaf_items(page)?;
        items.retain(|t| *t > advance_past);
        return Ok(items);
    }
    let segs: Vec<&[u8]> = SegmentIter::new(data_leaf_bytes(page)).collect::<Result<_>>()?;
    // Start at the last segment whose first item is <= advance_past.
    let mut start = 0;
    for (i, seg) in segs.iter().enumerate() {
        if posting::segment_first(seg) <= advance_past {
            start = i;
        } else {
            break;
        }
    }
    let mut items = Vec::new();
    for seg in &segs[start..] {
        posting::decode_into(seg, &mut items)?;
    }
    items.retain(|t| *t > advance_past);
    Ok(items)
}

/// True when a posting-tree leaf holds no items.
pub fn data_leaf_is_empty(page: &[u8]) -> bool {
    if is_compressed(page) {
        data_leaf_bytes(page).is_empty()
    } else {
        gin_maxoff(page) == 0
    }
}

// =============================================================================
// Structural sanity
// =============================================================================

/// Checks the structural invariants every index page must satisfy before its
/// contents are trusted.
pub fn check_page(index: &str, block: BlockNumber, page: &[u8]) -> Result<()> {
    if page::page_is_all_zero(page) || page::page_is_new(page) {
        return Err(GinError::corrupted(index, block, "page is uninitialized"));
    }
    let hdr = page::header(page);
    if (hdr.lower as usize) < PageHeader::SIZE
        || hdr.lower > hdr.upper
        || hdr.upper > hdr.special
        || hdr.special as usize > PAGE_SIZE
    {
        return Err(GinError::corrupted(
            index,
            block,
            format!(
                "invalid page header: lower {} upper {} special {}",
                hdr.lower, hdr.upper, hdr.special
            ),
        ));
    }
    if page::special_size(page) != max_align(OPAQUE_SIZE) {
        return Err(GinError::corrupted(
            index,
            block,
            format!(
                "special area of {} bytes does not match opaque size {}",
                page::special_size(page),
                max_align(OPAQUE_SIZE)
            ),
        ));
    }
    if is_deleted(page) {
        if !is_leaf(page) {
            return Err(GinError::corrupted(index, block, "deleted page is not a leaf"));
        }
        let has_items = if is_data(page) {
            gin_maxoff(page) > 0 || !data_leaf_is_empty(page)
        } else {
            page::max_offset(page) > 0
        };
        if has_items {
            return Err(GinError::corrupted(index, block, "deleted page still has tuples"));
        }
        return Ok(());
    }
    if is_data(page) {
        let limit = if is_leaf(page) {
            DATA_PAGE_MAX_DATA_SIZE / ItemPointer::SIZE
        } else {
            MAX_POSTING_ITEMS
        };
        if gin_maxoff(page) as usize > limit {
            return Err(GinError::corrupted(
                index,
                block,
                format!("maxoff {} exceeds page capacity {limit}", gin_maxoff(page)),
            ));
        }
    } else if page::max_offset(page) as usize > MAX_INDEX_TUPLES_PER_PAGE {
        return Err(GinError::corrupted(
            index,
            block,
            format!(
                "{} line pointers exceed page capacity {MAX_INDEX_TUPLES_PER_PAGE}",
                page::max_offset(page)
            ),
        ));
    }
    Ok(())
}

/// Same as [`check_page`] plus page-kind expectations used during descent.
pub fn check_page_kind(
    index: &str,
    block: BlockNumber,
    page: &[u8],
    want_data: bool,
) -> Result<()> {
    check_page(index, block, page)?;
    if is_data(page) != want_data || is_meta(page) || is_list(page) {
        return Err(GinError::corrupted(
            index,
            block,
            format!("unexpected page type, flags {:#06x}", flags(page)),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn test_constants() {
        assert_eq!(DATA_PAGE_DATA_OFFSET, 32);
        assert_eq!(DATA_PAGE_MAX_DATA_SIZE, 8152);
        assert_eq!(PostingItem::SIZE, 10);
    }

    #[test]
    fn test_opaque_roundtrip() {
        let mut p = page();
        init_page(&mut p, GIN_LEAF);
        assert!(is_leaf(&p));
        assert!(is_rightmost(&p));
        assert_eq!(page::special_size(&p), OPAQUE_SIZE);
        set_right_link(&mut p, 9);
        add_flags(&mut p, GIN_INCOMPLETE_SPLIT);
        assert_eq!(right_link(&p), 9);
        assert!(is_incomplete_split(&p));
        clear_flags(&mut p, GIN_INCOMPLETE_SPLIT);
        assert!(!is_incomplete_split(&p));
        assert!(is_leaf(&p));
    }

    #[test]
    fn test_posting_items() {
        let mut p = page();
        init_data_page(&mut p, 0);
        let a = PostingItem {
            child: 3,
            key: ItemPointer::new(10, 1),
        };
        let b = PostingItem {
            child: 4,
            key: ItemPointer::MIN,
        };
        add_posting_item(&mut p, b, 1);
        add_posting_item(&mut p, a, 1);
        assert_eq!(gin_maxoff(&p), 2);
        assert_eq!(posting_items(&p), vec![a, b]);
        assert_eq!(page::lower(&p), DATA_PAGE_DATA_OFFSET + 20);
        delete_posting_item(&mut p, 1);
        assert_eq!(posting_items(&p), vec![b]);
    }

    #[test]
    fn test_leaf_segments() {
        let mut p = page();
        init_data_page(&mut p, GIN_LEAF | GIN_COMPRESSED);
        assert!(data_leaf_is_empty(&p));
        let items: Vec<ItemPointer> = (1..=600).map(|i| ItemPointer::new(i, 1)).collect();
        let buf = posting::compress_all(&items, posting::SEGMENT_TARGET_SIZE).unwrap();
        set_data_leaf_bytes(&mut p, &buf);
        assert_eq!(data_leaf_items(&p).unwrap(), items);
        assert_eq!(data_leaf_free_space(&p), DATA_PAGE_MAX_DATA_SIZE - buf.len());

        let after = data_leaf_items_after(&p, ItemPointer::new(400, 1)).unwrap();
        assert_eq!(after.first(), Some(&ItemPointer::new(401, 1)));
        assert_eq!(after.len(), 200);
    }

    #[test]
    fn test_shrinking_rewrites_zero_the_tail() {
        let mut p = page();
        init_data_page(&mut p, GIN_LEAF | GIN_COMPRESSED);
        let items: Vec<ItemPointer> = (1..=600).map(|i| ItemPointer::new(i, 1)).collect();
        let long = posting::compress_all(&items, posting::SEGMENT_TARGET_SIZE).unwrap();
        set_data_leaf_bytes(&mut p, &long);
        let short = posting::compress_all(&items[..10], posting::SEGMENT_TARGET_SIZE).unwrap();
        set_data_leaf_bytes(&mut p, &short);
        let end = DATA_PAGE_DATA_OFFSET + short.len();
        assert!(p[end..page::special_offset(&p)].iter().all(|b| *b == 0));
        assert_eq!(data_leaf_items(&p).unwrap(), items[..10]);

        let mut p = page();
        init_data_page(&mut p, 0);
        let downlinks: Vec<PostingItem> = (0..5)
            .map(|i| PostingItem {
                child: i + 2,
                key: ItemPointer::new(i * 10, 1),
            })
            .collect();
        write_posting_items(&mut p, &downlinks);
        write_posting_items(&mut p, &downlinks[..2]);
        let end = DATA_PAGE_DATA_OFFSET + 2 * PostingItem::SIZE;
        assert!(p[end..page::special_offset(&p)].iter().all(|b| *b == 0));
        assert_eq!(posting_items(&p), downlinks[..2]);
    }

    #[test]
    fn test_uncompressed_leaf() {
        let mut p = page();
        init_data_page(&mut p, GIN_LEAF);
        let items = vec![ItemPointer::new(1, 1), ItemPointer::new(1, 2)];
        let raw = tid::write_item_pointers(&items);
        p[DATA_PAGE_DATA_OFFSET..DATA_PAGE_DATA_OFFSET + raw.len()].copy_from_slice(&raw);
        set_gin_maxoff(&mut p, 2);
        assert_eq!(data_leaf_items(&p).unwrap(), items);
    }

    #[test]
    fn test_check_page() {
        let p = page();
        let err = check_page("idx", 4, &p).unwrap_err();
        assert!(err.to_string().contains("Please REINDEX it"));

        let mut p = page();
        init_page(&mut p, GIN_DELETED);
        assert!(check_page("idx", 4, &p).is_err());

        init_page(&mut p, GIN_DELETED | GIN_LEAF);
        assert!(check_page("idx", 4, &p).is_ok());

        let mut p = page();
        page::page_init(&mut p, 16);
        assert!(check_page("idx", 4, &p).is_err());
    }

    #[test]
    fn test_recyclable() {
        let mut p = page();
        assert!(is_recyclable(&p, 10));
        init_page(&mut p, GIN_LEAF);
        assert!(!is_recyclable(&p, 10));
        add_flags(&mut p, GIN_DELETED);
        set_delete_xid(&mut p, 12);
        assert!(!is_recyclable(&p, 10));
        assert!(is_recyclable(&p, 13));
    }
}
