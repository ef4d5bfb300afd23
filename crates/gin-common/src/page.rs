//! Slotted page layout shared by every index page.
//!
//! Layout of a page:
//! ```text
//! +----------------+---------------------+ ... +---------------+---------+
//! | PageHeader(24) | ItemId array ->     | free | <- tuple data | special |
//! +----------------+---------------------+ ... +---------------+---------+
//!                  ^lower                      ^upper          ^special
//! ```
//! Functions operate directly on byte slices so callers can use them on
//! latched buffer frames and on scratch copies alike.

use crate::error::{GinError, Result};
use serde::{Deserialize, Serialize};

/// Page size in bytes (8 KB).
pub const PAGE_SIZE: usize = 8192;

/// Block number within a relation.
pub type BlockNumber = u32;

/// 1-based line pointer number within a page.
pub type OffsetNumber = u16;

/// Sentinel for "no block".
pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// Sentinel for "no offset".
pub const INVALID_OFFSET: OffsetNumber = 0;

/// First valid line pointer number.
pub const FIRST_OFFSET: OffsetNumber = 1;

/// Page layout version written by `page_init`.
pub const PAGE_LAYOUT_VERSION: u16 = 4;

/// Alignment of tuple data and the special area.
pub const MAXIMUM_ALIGNOF: usize = 8;

/// Upper bound on line pointers per page.
pub const MAX_INDEX_TUPLES_PER_PAGE: usize = (PAGE_SIZE - PageHeader::SIZE) / (ItemId::SIZE + 8);

/// Rounds `len` up to the maximum alignment.
#[inline]
pub const fn max_align(len: usize) -> usize {
    (len + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

/// Rounds `len` up to a 2-byte boundary.
#[inline]
pub const fn short_align(len: usize) -> usize {
    (len + 1) & !1
}

/// Header structure at the beginning of every page.
///
/// Layout (24 bytes total):
/// - lsn: 8 bytes
/// - checksum: 2 bytes
/// - flags: 2 bytes
/// - lower: 2 bytes (end of line pointer array)
/// - upper: 2 bytes (start of tuple data)
/// - special: 2 bytes (start of special area)
/// - version: 2 bytes
/// - prune_xid: 4 bytes (delete xid on deleted index pages)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    pub lsn: u64,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 24;

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..14].copy_from_slice(&self.lower.to_le_bytes());
        buf[14..16].copy_from_slice(&self.upper.to_le_bytes());
        buf[16..18].copy_from_slice(&self.special.to_le_bytes());
        buf[18..20].copy_from_slice(&self.version.to_le_bytes());
        buf[20..24].copy_from_slice(&self.prune_xid.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            lsn: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            checksum: u16::from_le_bytes([buf[8], buf[9]]),
            flags: u16::from_le_bytes([buf[10], buf[11]]),
            lower: u16::from_le_bytes([buf[12], buf[13]]),
            upper: u16::from_le_bytes([buf[14], buf[15]]),
            special: u16::from_le_bytes([buf[16], buf[17]]),
            version: u16::from_le_bytes([buf[18], buf[19]]),
            prune_xid: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
        }
    }
}

/// Line pointer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LpFlags {
    Unused = 0,
    Normal = 1,
    Redirect = 2,
    Dead = 3,
}

/// Line pointer: 15-bit offset, 2-bit state, 15-bit length packed in 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    pub off: u16,
    pub flags: LpFlags,
    pub len: u16,
}

impl ItemId {
    /// Size of a line pointer in bytes.
    pub const SIZE: usize = 4;

    pub fn normal(off: u16, len: u16) -> Self {
        Self {
            off,
            flags: LpFlags::Normal,
            len,
        }
    }

    pub fn pack(&self) -> u32 {
        (self.off as u32 & 0x7FFF) | ((self.flags as u32) << 15) | ((self.len as u32 & 0x7FFF) << 17)
    }

    pub fn unpack(raw: u32) -> Self {
        let flags = match (raw >> 15) & 0x3 {
            0 => LpFlags::Unused,
            1 => LpFlags::Normal,
            2 => LpFlags::Redirect,
            _ => LpFlags::Dead,
        };
        Self {
            off: (raw & 0x7FFF) as u16,
            flags,
            len: ((raw >> 17) & 0x7FFF) as u16,
        }
    }
}

// =============================================================================
// Header accessors
// =============================================================================

#[inline]
fn read_u16(page: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([page[at], page[at + 1]])
}

#[inline]
fn write_u16(page: &mut [u8], at: usize, v: u16) {
    page[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn header(page: &[u8]) -> PageHeader {
    PageHeader::from_bytes(&page[..PageHeader::SIZE])
}

pub fn page_lsn(page: &[u8]) -> u64 {
    u64::from_le_bytes([
        page[0], page[1], page[2], page[3], page[4], page[5], page[6], page[7],
    ])
}

pub fn set_page_lsn(page: &mut [u8], lsn: u64) {
    page[0..8].copy_from_slice(&lsn.to_le_bytes());
}

pub fn page_checksum(page: &[u8]) -> u16 {
    read_u16(page, 8)
}

pub fn set_page_checksum(page: &mut [u8], checksum: u16) {
    write_u16(page, 8, checksum);
}

pub fn lower(page: &[u8]) -> usize {
    read_u16(page, 12) as usize
}

pub fn set_lower(page: &mut [u8], lower: usize) {
    write_u16(page, 12, lower as u16);
}

pub fn upper(page: &[u8]) -> usize {
    read_u16(page, 14) as usize
}

fn set_upper(page: &mut [u8], upper: usize) {
    write_u16(page, 14, upper as u16);
}

pub fn special_offset(page: &[u8]) -> usize {
    read_u16(page, 16) as usize
}

/// Size of the special area as recorded in the header.
pub fn special_size(page: &[u8]) -> usize {
    PAGE_SIZE.saturating_sub(special_offset(page))
}

pub fn prune_xid(page: &[u8]) -> u32 {
    u32::from_le_bytes([page[20], page[21], page[22], page[23]])
}

pub fn set_prune_xid(page: &mut [u8], xid: u32) {
    page[20..24].copy_from_slice(&xid.to_le_bytes());
}

/// A page whose header was never initialized.
pub fn page_is_new(page: &[u8]) -> bool {
    upper(page) == 0
}

/// True when every byte of the page is zero.
pub fn page_is_all_zero(page: &[u8]) -> bool {
    page.iter().all(|b| *b == 0)
}

/// Initializes an empty page with a special area of `special_size` bytes.
pub fn page_init(page: &mut [u8], special_size: usize) {
    let special = PAGE_SIZE - max_align(special_size);
    page.fill(0);
    let hdr = PageHeader {
        lsn: 0,
        checksum: 0,
        flags: 0,
        lower: PageHeader::SIZE as u16,
        upper: special as u16,
        special: special as u16,
        version: PAGE_LAYOUT_VERSION,
        prune_xid: 0,
    };
    page[..PageHeader::SIZE].copy_from_slice(&hdr.to_bytes());
}

pub fn special(page: &[u8]) -> &[u8] {
    &page[special_offset(page)..PAGE_SIZE]
}

pub fn special_mut(page: &mut [u8]) -> &mut [u8] {
    let off = special_offset(page);
    &mut page[off..PAGE_SIZE]
}

/// Bytes between the header and the special area.
pub fn contents(page: &[u8]) -> &[u8] {
    &page[PageHeader::SIZE..special_offset(page)]
}

pub fn contents_mut(page: &mut [u8]) -> &mut [u8] {
    let end = special_offset(page);
    &mut page[PageHeader::SIZE..end]
}

// =============================================================================
// Line pointers and tuples
// =============================================================================

/// Number of line pointers on the page.
pub fn max_offset(page: &[u8]) -> OffsetNumber {
    let lower = lower(page);
    if lower <= PageHeader::SIZE {
        0
    } else {
        ((lower - PageHeader::SIZE) / ItemId::SIZE) as OffsetNumber
    }
}

#[inline]
fn item_id_pos(off: OffsetNumber) -> usize {
    PageHeader::SIZE + (off as usize - 1) * ItemId::SIZE
}

pub fn item_id(page: &[u8], off: OffsetNumber) -> ItemId {
    let p = item_id_pos(off);
    ItemId::unpack(u32::from_le_bytes([page[p], page[p + 1], page[p + 2], page[p + 3]]))
}

pub fn set_item_id(page: &mut [u8], off: OffsetNumber, id: ItemId) {
    let p = item_id_pos(off);
    page[p..p + 4].copy_from_slice(&id.pack().to_le_bytes());
}

/// Returns the tuple bytes at `off`. The caller must have validated the page.
pub fn item(page: &[u8], off: OffsetNumber) -> &[u8] {
    let id = item_id(page, off);
    &page[id.off as usize..id.off as usize + id.len as usize]
}

pub fn item_mut(page: &mut [u8], off: OffsetNumber) -> &mut [u8] {
    let id = item_id(page, off);
    &mut page[id.off as usize..id.off as usize + id.len as usize]
}

/// Returns the tuple at `off` after validating its line pointer against the
/// usable area of the page.
pub fn item_checked(page: &[u8], block: BlockNumber, off: OffsetNumber) -> Result<&[u8]> {
    if off == INVALID_OFFSET || off > max_offset(page) {
        return Err(GinError::PageCorrupted {
            block,
            reason: format!("line pointer {off} beyond maxoff {}", max_offset(page)),
        });
    }
    let id = item_id(page, off);
    let end = id.off as usize + id.len as usize;
    if end > special_offset(page).min(PAGE_SIZE) {
        return Err(GinError::PageCorrupted {
            block,
            reason: format!(
                "line pointer points past end of tuple space: offset {} length {}",
                id.off, id.len
            ),
        });
    }
    if id.flags != LpFlags::Normal || id.len == 0 || (id.off as usize) < PageHeader::SIZE {
        return Err(GinError::PageCorrupted {
            block,
            reason: format!(
                "invalid line pointer storage: offset {} length {} flags {:?}",
                id.off, id.len, id.flags
            ),
        });
    }
    Ok(&page[id.off as usize..end])
}

/// Free space available for one more tuple, accounting for its line pointer.
pub fn free_space(page: &[u8]) -> usize {
    exact_free_space(page).saturating_sub(ItemId::SIZE)
}

/// Gap between the line pointer array and the tuple data.
pub fn exact_free_space(page: &[u8]) -> usize {
    upper(page).saturating_sub(lower(page))
}

/// Adds a tuple at `offset` (or at the end when `None`), shifting later line
/// pointers up. Returns the offset used, or `None` when the tuple does not fit.
pub fn add_item(page: &mut [u8], item: &[u8], offset: Option<OffsetNumber>) -> Option<OffsetNumber> {
    let maxoff = max_offset(page);
    let target = offset.unwrap_or(maxoff + 1);
    if target == INVALID_OFFSET || target > maxoff + 1 {
        return None;
    }
    let aligned = max_align(item.len());
    let lower_now = lower(page);
    let upper_now = upper(page);
    if lower_now + ItemId::SIZE + aligned > upper_now {
        return None;
    }

    if target <= maxoff {
        let from = item_id_pos(target);
        let to = item_id_pos(maxoff + 1);
        page.copy_within(from..to, from + ItemId::SIZE);
    }

    let new_upper = upper_now - aligned;
    page[new_upper..new_upper + item.len()].copy_from_slice(item);
    page[new_upper + item.len()..new_upper + aligned].fill(0);
    set_item_id(page, target, ItemId::normal(new_upper as u16, item.len() as u16));
    set_lower(page, lower_now + ItemId::SIZE);
    set_upper(page, new_upper);
    Some(target)
}

/// Removes the tuple at `off`, compacting both the tuple data and the line
/// pointer array.
pub fn index_tuple_delete(page: &mut [u8], off: OffsetNumber) {
    let maxoff = max_offset(page);
    if off == INVALID_OFFSET || off > maxoff {
        return;
    }
    let id = item_id(page, off);
    let size = max_align(id.len as usize);
    let offset = id.off as usize;
    let upper_now = upper(page);

    // Slide tuple data that sits below the removed tuple up by `size`.
    if offset > upper_now {
        page.copy_within(upper_now..offset, upper_now + size);
    }
    page[upper_now..upper_now + size].fill(0);

    // Close the gap in the line pointer array.
    let from = item_id_pos(off + 1);
    let to = item_id_pos(maxoff + 1);
    if from < to {
        page.copy_within(from..to, from - ItemId::SIZE);
    }
    let new_lower = lower(page) - ItemId::SIZE;
    page[new_lower..new_lower + ItemId::SIZE].fill(0);
    set_lower(page, new_lower);
    set_upper(page, upper_now + size);

    for i in 1..maxoff {
        let mut id = item_id(page, i);
        if (id.off as usize) < offset && id.len > 0 {
            id.off += size as u16;
            set_item_id(page, i, id);
        }
    }
}

/// Replaces the tuple at `off` with `item`. Returns false when it does not fit.
pub fn index_tuple_overwrite(page: &mut [u8], off: OffsetNumber, item: &[u8]) -> bool {
    let old_len = max_align(item_id(page, off).len as usize);
    if max_align(item.len()) > exact_free_space(page) + old_len {
        return false;
    }
    index_tuple_delete(page, off);
    add_item(page, item, Some(off)).is_some()
}

/// Removes several tuples; offsets must be sorted ascending.
pub fn index_multi_delete(page: &mut [u8], offsets: &[OffsetNumber]) {
    for &off in offsets.iter().rev() {
        index_tuple_delete(page, off);
    }
}
