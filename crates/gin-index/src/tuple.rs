//! Entry-tree index tuples.
//!
//! ```text
//! +-----------+----------+----------+-----+-----+---------+-----+-----+---------+
//! | tid (6 B) | info u16 | attno u16| cat | pad | keylen  | key | pad | posting |
//! +-----------+----------+----------+-----+-----+---------+-----+-----+---------+
//! ```
//!
//! The tid field is overloaded by tuple kind:
//! - leaf with inline postings: block = byte offset of the posting list,
//!   offset = item count (high bit set when compressed)
//! - leaf pointing at a posting tree: block = tree root, offset = 0xFFFF
//! - internal: block = child page
//! - pending list: the heap tuple's own address

use crate::posting::{self, SEGMENT_HEADER_SIZE};
use crate::tid::{self, ItemPointer};
use gin_common::page::{BlockNumber, ItemId, PAGE_SIZE, PageHeader, max_align, short_align};
use gin_common::{GinError, Result};
use serde::{Deserialize, Serialize};

/// Size of the fixed tuple header.
pub const TUPLE_HEADER_SIZE: usize = 14;

/// Offset value marking a posting-tree pointer tuple.
pub const GIN_TREE_POSTING: u16 = 0xFFFF;

/// Flag bit in the item count marking a compressed inline posting list.
pub const GIN_ITUP_COMPRESSED: u16 = 0x8000;

/// Largest entry tuple; three must fit on a page.
pub const GIN_MAX_ITEM_SIZE: usize = (((PAGE_SIZE
    - PageHeader::SIZE
    - max_align(crate::ginpage::OPAQUE_SIZE))
    / 3
    - ItemId::SIZE)
    / 8)
    * 8;

const INFO_SIZE_MASK: u16 = 0x1FFF;

/// Classification of an index key. The numeric order is the index order
/// within one attribute: normal keys first, then the placeholders.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(i8)]
pub enum NullCategory {
    /// Query-side marker that sorts before every stored key.
    EmptyQuery = -1,
    NormKey = 0,
    /// A null element inside a non-null value.
    NullKey = 1,
    /// A non-null value with no keys.
    EmptyItem = 2,
    /// A null heap value.
    NullItem = 3,
}

impl NullCategory {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            -1 => Some(NullCategory::EmptyQuery),
            0 => Some(NullCategory::NormKey),
            1 => Some(NullCategory::NullKey),
            2 => Some(NullCategory::EmptyItem),
            3 => Some(NullCategory::NullItem),
            _ => None,
        }
    }
}

/// Read-only view of an entry tuple.
#[derive(Debug, Clone, Copy)]
pub struct EntryTuple<'a> {
    raw: &'a [u8],
}

impl<'a> EntryTuple<'a> {
    /// Validates the header and key bounds of `raw`.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < TUPLE_HEADER_SIZE {
            return Err(GinError::Internal(format!(
                "index tuple of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let t = Self { raw };
        if t.size() > raw.len() || TUPLE_HEADER_SIZE + t.key_len() > t.size() {
            return Err(GinError::Internal(format!(
                "index tuple size {} inconsistent with key length {}",
                t.size(),
                t.key_len()
            )));
        }
        if NullCategory::from_i8(raw[10] as i8).is_none() {
            return Err(GinError::Internal(format!(
                "invalid null category {}",
                raw[10] as i8
            )));
        }
        Ok(t)
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn tid_field(&self) -> ItemPointer {
        ItemPointer::from_bytes(self.raw)
    }

    /// Tuple length recorded in the header.
    pub fn size(&self) -> usize {
        (u16::from_le_bytes([self.raw[6], self.raw[7]]) & INFO_SIZE_MASK) as usize
    }

    pub fn attno(&self) -> u16 {
        u16::from_le_bytes([self.raw[8], self.raw[9]])
    }

    pub fn category(&self) -> NullCategory {
        NullCategory::from_i8(self.raw[10] as i8).unwrap_or(NullCategory::NormKey)
    }

    fn key_len(&self) -> usize {
        u16::from_le_bytes([self.raw[12], self.raw[13]]) as usize
    }

    pub fn key(&self) -> &'a [u8] {
        &self.raw[TUPLE_HEADER_SIZE..TUPLE_HEADER_SIZE + self.key_len()]
    }

    pub fn is_posting_tree(&self) -> bool {
        self.tid_field().offset == GIN_TREE_POSTING
    }

    pub fn posting_tree_root(&self) -> BlockNumber {
        self.tid_field().block
    }

    /// Child pointer of an internal tuple.
    pub fn downlink(&self) -> BlockNumber {
        self.tid_field().block
    }

    /// Heap address of a pending-list tuple.
    pub fn heap_tid(&self) -> ItemPointer {
        self.tid_field()
    }

    /// Number of inline posting items.
    pub fn nposting(&self) -> usize {
        if self.is_posting_tree() {
            0
        } else {
            (self.tid_field().offset & !GIN_ITUP_COMPRESSED) as usize
        }
    }

    pub fn is_compressed(&self) -> bool {
        !self.is_posting_tree() && self.tid_field().offset & GIN_ITUP_COMPRESSED != 0
    }

    /// Raw inline posting data.
    pub fn posting_bytes(&self) -> &'a [u8] {
        let start = self.tid_field().block as usize;
        if self.nposting() == 0 || start > self.size() {
            return &[];
        }
        &self.raw[start..self.size()]
    }

    /// Decodes the inline posting list.
    pub fn read_items(&self) -> Result<Vec<ItemPointer>> {
        let n = self.nposting();
        if n == 0 {
            return Ok(Vec::new());
        }
        let data = self.posting_bytes();
        let items = if self.is_compressed() {
            posting::decode_segments(data)?
        } else {
            if data.len() < n * ItemPointer::SIZE {
                return Err(GinError::PostingListCorrupted(format!(
                    "uncompressed posting list of {n} items has only {} bytes",
                    data.len()
                )));
            }
            tid::read_item_pointers(data, n)
        };
        if items.len() != n {
            return Err(GinError::PostingListCorrupted(format!(
                "posting list decoded to {} items, tuple claims {n}",
                items.len()
            )));
        }
        Ok(items)
    }
}

fn key_prefix(attno: u16, category: NullCategory, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(short_align(TUPLE_HEADER_SIZE + key.len()));
    out.resize(6, 0);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&attno.to_le_bytes());
    out.push(category.as_i8() as u8);
    out.push(0);
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(key);
    out
}

fn finish(mut out: Vec<u8>, tid: ItemPointer) -> Vec<u8> {
    tid.write_to(&mut out[0..6]);
    let size = out.len() as u16;
    out[6..8].copy_from_slice(&size.to_le_bytes());
    out
}

fn check_key_size(key: &[u8], max_size: usize) -> Result<()> {
    let size = short_align(TUPLE_HEADER_SIZE + key.len());
    if size > max_size {
        return Err(GinError::TupleTooLarge {
            size,
            max: max_size,
        });
    }
    Ok(())
}

/// Forms a leaf tuple with the given items inline. Returns `None` when the
/// items do not all fit within `max_size`, in which case the caller moves
/// them to a posting tree.
pub fn form_leaf_tuple(
    attno: u16,
    category: NullCategory,
    key: &[u8],
    items: &[ItemPointer],
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    check_key_size(key, max_size)?;
    let mut out = key_prefix(attno, category, key);
    out.resize(short_align(out.len()), 0);
    if items.is_empty() {
        let start = out.len() as u32;
        return Ok(Some(finish(out, ItemPointer::new(start, 0))));
    }
    let room = max_size - out.len();
    if room < SEGMENT_HEADER_SIZE {
        return Ok(None);
    }
    let (seg, n) = posting::compress(items, room)?;
    if n < items.len() {
        return Ok(None);
    }
    let start = out.len() as u32;
    out.extend_from_slice(&seg);
    let tid = ItemPointer::new(start, items.len() as u16 | GIN_ITUP_COMPRESSED);
    Ok(Some(finish(out, tid)))
}

/// Forms a leaf tuple whose postings live in the tree rooted at `root`.
pub fn form_posting_tree_tuple(
    attno: u16,
    category: NullCategory,
    key: &[u8],
    root: BlockNumber,
) -> Vec<u8> {
    let out = key_prefix(attno, category, key);
    finish(out, ItemPointer::new(root, GIN_TREE_POSTING))
}

/// Forms an internal tuple pointing at `child`.
pub fn form_downlink_tuple(
    attno: u16,
    category: NullCategory,
    key: &[u8],
    child: BlockNumber,
) -> Vec<u8> {
    let out = key_prefix(attno, category, key);
    finish(out, ItemPointer::new(child, 0))
}

/// Forms a pending-list tuple for one key of heap row `heap_tid`.
pub fn form_pending_tuple(
    attno: u16,
    category: NullCategory,
    key: &[u8],
    heap_tid: ItemPointer,
    max_size: usize,
) -> Result<Vec<u8>> {
    check_key_size(key, max_size)?;
    let out = key_prefix(attno, category, key);
    Ok(finish(out, heap_tid))
}

/// Repoints an internal tuple at `child`.
pub fn set_downlink(raw: &mut [u8], child: BlockNumber) {
    let mut tid = ItemPointer::from_bytes(raw);
    tid.block = child;
    tid.write_to(&mut raw[0..6]);
}

/// Copy of `raw` turned into an internal tuple pointing at `child`.
pub fn to_downlink(raw: &[u8], child: BlockNumber) -> Result<Vec<u8>> {
    let t = EntryTuple::parse(raw)?;
    Ok(form_downlink_tuple(t.attno(), t.category(), t.key(), child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_item_size() {
        assert_eq!(GIN_MAX_ITEM_SIZE, 2712);
    }

    #[test]
    fn test_category_order() {
        assert!(NullCategory::EmptyQuery < NullCategory::NormKey);
        assert!(NullCategory::NormKey < NullCategory::NullKey);
        assert!(NullCategory::NullKey < NullCategory::EmptyItem);
        assert!(NullCategory::EmptyItem < NullCategory::NullItem);
        assert_eq!(NullCategory::from_i8(-1), Some(NullCategory::EmptyQuery));
        assert_eq!(NullCategory::from_i8(4), None);
    }

    #[test]
    fn test_leaf_tuple_inline() {
        let items: Vec<ItemPointer> = (1..=20).map(|i| ItemPointer::new(i, 3)).collect();
        let raw = form_leaf_tuple(1, NullCategory::NormKey, b"apple", &items, GIN_MAX_ITEM_SIZE)
            .unwrap()
            .unwrap();
        let t = EntryTuple::parse(&raw).unwrap();
        assert_eq!(t.attno(), 1);
        assert_eq!(t.key(), b"apple");
        assert_eq!(t.category(), NullCategory::NormKey);
        assert!(!t.is_posting_tree());
        assert!(t.is_compressed());
        assert_eq!(t.nposting(), 20);
        assert_eq!(t.size(), raw.len());
        assert_eq!(t.read_items().unwrap(), items);
    }

    #[test]
    fn test_leaf_tuple_empty_list() {
        let raw = form_leaf_tuple(2, NullCategory::NullItem, b"", &[], GIN_MAX_ITEM_SIZE)
            .unwrap()
            .unwrap();
        let t = EntryTuple::parse(&raw).unwrap();
        assert_eq!(t.nposting(), 0);
        assert!(t.read_items().unwrap().is_empty());
        assert_eq!(t.category(), NullCategory::NullItem);
    }

    #[test]
    fn test_leaf_tuple_overflow_returns_none() {
        let items: Vec<ItemPointer> = (0..2000).map(|i| ItemPointer::new(i * 977, 1)).collect();
        let res = form_leaf_tuple(1, NullCategory::NormKey, b"k", &items, GIN_MAX_ITEM_SIZE).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_key_too_large() {
        let key = vec![b'x'; 3000];
        let err = form_leaf_tuple(1, NullCategory::NormKey, &key, &[], GIN_MAX_ITEM_SIZE)
            .unwrap_err();
        assert!(matches!(err, GinError::TupleTooLarge { .. }));
    }

    #[test]
    fn test_posting_tree_and_downlink() {
        let raw = form_posting_tree_tuple(1, NullCategory::NormKey, b"pear", 42);
        let t = EntryTuple::parse(&raw).unwrap();
        assert!(t.is_posting_tree());
        assert_eq!(t.posting_tree_root(), 42);
        assert_eq!(t.nposting(), 0);

        let mut down = to_downlink(&raw, 7).unwrap();
        let t = EntryTuple::parse(&down).unwrap();
        assert_eq!(t.downlink(), 7);
        assert_eq!(t.key(), b"pear");
        set_downlink(&mut down, 9);
        assert_eq!(EntryTuple::parse(&down).unwrap().downlink(), 9);
    }

    #[test]
    fn test_pending_tuple() {
        let tid = ItemPointer::new(5, 6);
        let raw = form_pending_tuple(1, NullCategory::NullKey, b"", tid, GIN_MAX_ITEM_SIZE).unwrap();
        let t = EntryTuple::parse(&raw).unwrap();
        assert_eq!(t.heap_tid(), tid);
        assert_eq!(t.category(), NullCategory::NullKey);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EntryTuple::parse(&[0u8; 4]).is_err());
        let mut raw = form_posting_tree_tuple(1, NullCategory::NormKey, b"abc", 3);
        raw[12] = 200;
        assert!(EntryTuple::parse(&raw).is_err());
    }
}
