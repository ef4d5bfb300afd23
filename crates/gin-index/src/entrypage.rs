//! Entry tree: the B-tree over index keys.
//!
//! Pages hold [`EntryTuple`]s behind ordinary line pointers, ordered by
//! `(attno, key, category)`. On internal pages each tuple's key is the
//! highest key of its child; the last tuple of the rightmost page at each
//! level stands for +infinity and is never compared.

use crate::btree::{Placement, TreeOps};
use crate::ginpage::{self, ROOT_BLKNO, init_page, is_leaf, is_rightmost};
use crate::state::{EntryKey, GinState};
use crate::tuple::{self, EntryTuple};
use gin_buffer::{PageBuf, zeroed_page};
use gin_common::page::{
    self, BlockNumber, FIRST_OFFSET, INVALID_BLOCK, INVALID_OFFSET, ItemId, OffsetNumber,
    max_align,
};
use gin_common::{GinError, Result};
use gin_wal::RecordBuilder;
use std::cmp::Ordering;

/// A tuple to place on an entry page. With `is_delete` the tuple at the
/// target offset is replaced rather than shifted right.
#[derive(Debug, Clone)]
pub struct EntryInsert {
    pub tuple: Vec<u8>,
    pub is_delete: bool,
}

/// Redo payload of an entry-page insert.
pub fn encode_insert_payload(off: OffsetNumber, insert: &EntryInsert) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + insert.tuple.len());
    out.push(insert.is_delete as u8);
    out.extend_from_slice(&off.to_le_bytes());
    out.extend_from_slice(&insert.tuple);
    out
}

pub fn decode_insert_payload(data: &[u8]) -> Result<(OffsetNumber, EntryInsert)> {
    if data.len() < 3 {
        return Err(GinError::Internal("entry insert payload truncated".to_string()));
    }
    Ok((
        u16::from_le_bytes([data[1], data[2]]),
        EntryInsert {
            tuple: data[3..].to_vec(),
            is_delete: data[0] != 0,
        },
    ))
}

/// Tuple at `off` of an entry page.
pub fn page_tuple(page: &[u8], off: OffsetNumber) -> Result<EntryTuple<'_>> {
    EntryTuple::parse(page::item(page, off))
}

/// Highest tuple on an entry page.
pub fn rightmost_tuple(page: &[u8]) -> Result<EntryTuple<'_>> {
    let maxoff = page::max_offset(page);
    if maxoff == INVALID_OFFSET {
        return Err(GinError::Internal("entry page has no tuples".to_string()));
    }
    page_tuple(page, maxoff)
}

/// Downlink tuple for `page` stored at block `blkno`.
pub fn form_interior_tuple(page: &[u8], blkno: BlockNumber) -> Result<Vec<u8>> {
    tuple::to_downlink(rightmost_tuple(page)?.raw(), blkno)
}

/// Applies the in-place part of an insertion: removes the replaced tuple on
/// a leaf, or repoints the split child's downlink at its right half.
pub fn prepare_page(
    page: &mut [u8],
    off: OffsetNumber,
    insert: &EntryInsert,
    update_blkno: BlockNumber,
) {
    if insert.is_delete {
        page::index_tuple_delete(page, off);
    }
    if !is_leaf(page) && update_blkno != INVALID_BLOCK {
        tuple::set_downlink(page::item_mut(page, off), update_blkno);
    }
}

/// Applies a complete entry-page insertion, as done at runtime and in redo.
pub fn apply_insert(
    page: &mut [u8],
    off: OffsetNumber,
    insert: &EntryInsert,
    update_blkno: BlockNumber,
) -> Result<()> {
    prepare_page(page, off, insert, update_blkno);
    match page::add_item(page, &insert.tuple, Some(off)) {
        Some(placed) if placed == off => Ok(()),
        _ => Err(GinError::Internal(format!(
            "failed to add tuple of {} bytes at offset {off}",
            insert.tuple.len()
        ))),
    }
}

/// Splits an entry page with the new tuple in place. The split point
/// balances the bytes on both halves rather than the tuple counts.
fn split_page(
    page: &[u8],
    off: OffsetNumber,
    insert: &EntryInsert,
    update_blkno: BlockNumber,
) -> Result<(PageBuf, PageBuf)> {
    let mut work = zeroed_page();
    work.copy_from_slice(page);
    prepare_page(&mut work[..], off, insert, update_blkno);

    let maxoff = page::max_offset(&work[..]);
    let mut tuples: Vec<&[u8]> = Vec::with_capacity(maxoff as usize + 1);
    for i in FIRST_OFFSET..=maxoff {
        if i == off {
            tuples.push(&insert.tuple);
        }
        tuples.push(page::item(&work[..], i));
    }
    if off == maxoff + 1 {
        tuples.push(&insert.tuple);
    }
    let footprint = |t: &[u8]| max_align(t.len()) + ItemId::SIZE;
    let total: usize = tuples.iter().map(|t| footprint(t)).sum();

    let flags = ginpage::flags(page);
    let mut left = zeroed_page();
    let mut right = zeroed_page();
    init_page(&mut left[..], flags);
    init_page(&mut right[..], flags);

    let mut lsize = 0;
    let mut on_right = false;
    for t in tuples {
        if lsize > total / 2 {
            on_right = true;
        } else {
            lsize += footprint(t);
        }
        let target = if on_right { &mut right } else { &mut left };
        if page::add_item(&mut target[..], t, None).is_none() {
            return Err(GinError::Internal(
                "failed to add tuple to entry page during split".to_string(),
            ));
        }
    }
    Ok((left, right))
}

/// Entry-tree search and insertion state for one key.
pub struct EntryTree<'a> {
    state: &'a GinState,
    pub key: EntryKey,
}

impl<'a> EntryTree<'a> {
    pub fn new(state: &'a GinState, key: EntryKey) -> Self {
        Self { state, key }
    }

    fn compare(&self, page: &[u8], off: OffsetNumber) -> Result<Ordering> {
        let t = page_tuple(page, off)?;
        Ok(self.state.compare_tuple(&self.key, &t))
    }

    /// Binary search on a leaf. Returns whether the key exists and the
    /// offset where it is or would be inserted.
    pub fn locate_leaf_entry(&self, page: &[u8]) -> Result<(bool, OffsetNumber)> {
        let mut low = FIRST_OFFSET;
        let mut high = page::max_offset(page);
        if high < low {
            return Ok((false, FIRST_OFFSET));
        }
        high += 1;
        while high > low {
            let mid = low + (high - low) / 2;
            match self.compare(page, mid)? {
                Ordering::Equal => return Ok((true, mid)),
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }
        Ok((false, high))
    }
}

impl TreeOps for EntryTree<'_> {
    type Insert = EntryInsert;
    type Prepared = ();

    fn is_data(&self) -> bool {
        false
    }

    fn root_blkno(&self) -> BlockNumber {
        ROOT_BLKNO
    }

    fn is_move_right(&self, page: &[u8]) -> Result<bool> {
        if is_rightmost(page) {
            return Ok(false);
        }
        let t = rightmost_tuple(page)?;
        Ok(self.state.compare_tuple(&self.key, &t) == Ordering::Greater)
    }

    fn find_child_page(&self, _block: BlockNumber, page: &[u8]) -> Result<(BlockNumber, OffsetNumber)> {
        let maxoff = page::max_offset(page);
        let rightmost = is_rightmost(page);
        let mut low = FIRST_OFFSET;
        let mut high = maxoff + 1;
        while high > low {
            let mid = low + (high - low) / 2;
            let result = if mid == maxoff && rightmost {
                Ordering::Less
            } else {
                self.compare(page, mid)?
            };
            match result {
                Ordering::Equal => return Ok((page_tuple(page, mid)?.downlink(), mid)),
                Ordering::Greater => low = mid + 1,
                Ordering::Less => high = mid,
            }
        }
        if high > maxoff {
            return Err(GinError::Internal(
                "search key beyond the last downlink of an entry page".to_string(),
            ));
        }
        Ok((page_tuple(page, high)?.downlink(), high))
    }

    fn get_leftmost_child(&self, _block: BlockNumber, page: &[u8]) -> Result<BlockNumber> {
        Ok(page_tuple(page, FIRST_OFFSET)?.downlink())
    }

    fn find_child_ptr(&self, page: &[u8], child: BlockNumber, store_off: OffsetNumber) -> OffsetNumber {
        let downlink = |off: OffsetNumber| page_tuple(page, off).map(|t| t.downlink()).ok();
        let mut maxoff = page::max_offset(page);
        if store_off >= FIRST_OFFSET && store_off <= maxoff {
            // Without deletions the downlink only ever moves right.
            for off in store_off..=maxoff {
                if downlink(off) == Some(child) {
                    return off;
                }
            }
            maxoff = store_off - 1;
        }
        for off in FIRST_OFFSET..=maxoff {
            if downlink(off) == Some(child) {
                return off;
            }
        }
        INVALID_OFFSET
    }

    fn begin_place(
        &mut self,
        _block: BlockNumber,
        page: &[u8],
        off: OffsetNumber,
        insert: &EntryInsert,
        update_blkno: BlockNumber,
    ) -> Result<Placement<()>> {
        let added = max_align(insert.tuple.len()) + ItemId::SIZE;
        let released = if insert.is_delete {
            max_align(page::item_id(page, off).len as usize) + ItemId::SIZE
        } else {
            0
        };
        if page::exact_free_space(page) + released >= added {
            return Ok(Placement::Fits(()));
        }
        let (left, right) = split_page(page, off, insert, update_blkno)?;
        Ok(Placement::Split { left, right })
    }

    fn exec_place(
        &mut self,
        page: &mut [u8],
        off: OffsetNumber,
        insert: &EntryInsert,
        _prepared: (),
        update_blkno: BlockNumber,
        rec: &mut RecordBuilder,
    ) -> Result<()> {
        apply_insert(page, off, insert, update_blkno)?;
        rec.block_data(0, &encode_insert_payload(off, insert));
        Ok(())
    }

    fn prepare_downlink(&self, lpage: &[u8], lblkno: BlockNumber) -> Result<EntryInsert> {
        Ok(EntryInsert {
            tuple: form_interior_tuple(lpage, lblkno)?,
            is_delete: false,
        })
    }

    fn fill_root(
        &self,
        root: &mut [u8],
        lblkno: BlockNumber,
        lpage: &[u8],
        rblkno: BlockNumber,
        rpage: &[u8],
    ) -> Result<()> {
        for (blkno, child) in [(lblkno, lpage), (rblkno, rpage)] {
            let t = form_interior_tuple(child, blkno)?;
            if page::add_item(root, &t, None).is_none() {
                return Err(GinError::Internal(
                    "failed to add downlink to new entry root".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ginpage::GIN_LEAF;
    use crate::opclass::ArrayOps;
    use crate::tid::ItemPointer;
    use crate::tuple::NullCategory;
    use bytes::Bytes;
    use gin_common::IndexOptions;
    use std::sync::Arc;

    fn state() -> GinState {
        GinState::new(vec![Arc::new(ArrayOps)], &IndexOptions::default()).unwrap()
    }

    fn leaf_with(keys: &[&str]) -> PageBuf {
        let mut page = zeroed_page();
        init_page(&mut page[..], GIN_LEAF);
        for (i, k) in keys.iter().enumerate() {
            let t = tuple::form_leaf_tuple(
                1,
                NullCategory::NormKey,
                k.as_bytes(),
                &[ItemPointer::new(i as u32, 1)],
                2000,
            )
            .unwrap()
            .unwrap();
            page::add_item(&mut page[..], &t, None).unwrap();
        }
        page
    }

    #[test]
    fn test_locate_leaf_entry() {
        let st = state();
        let page = leaf_with(&["b", "d", "f"]);
        let find = |k: &'static str| {
            EntryTree::new(&st, EntryKey::norm(1, Bytes::from_static(k.as_bytes())))
                .locate_leaf_entry(&page[..])
                .unwrap()
        };
        assert_eq!(find("d"), (true, 2));
        assert_eq!(find("a"), (false, 1));
        assert_eq!(find("e"), (false, 3));
        assert_eq!(find("z"), (false, 4));

        let nulls = EntryTree::new(&st, EntryKey::placeholder(1, NullCategory::NullItem));
        assert_eq!(nulls.locate_leaf_entry(&page[..]).unwrap(), (false, 4));
    }

    #[test]
    fn test_insert_payload_roundtrip() {
        let insert = EntryInsert {
            tuple: vec![1, 2, 3, 4],
            is_delete: true,
        };
        let (off, back) = decode_insert_payload(&encode_insert_payload(7, &insert)).unwrap();
        assert_eq!(off, 7);
        assert!(back.is_delete);
        assert_eq!(back.tuple, insert.tuple);
        assert!(decode_insert_payload(&[1]).is_err());
    }

    #[test]
    fn test_replace_in_place() {
        let mut page = leaf_with(&["b", "d"]);
        let t = tuple::form_leaf_tuple(
            1,
            NullCategory::NormKey,
            b"d",
            &[ItemPointer::new(1, 1), ItemPointer::new(9, 9)],
            2000,
        )
        .unwrap()
        .unwrap();
        let insert = EntryInsert {
            tuple: t,
            is_delete: true,
        };
        apply_insert(&mut page[..], 2, &insert, INVALID_BLOCK).unwrap();
        assert_eq!(page::max_offset(&page[..]), 2);
        let items = page_tuple(&page[..], 2).unwrap().read_items().unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_split_balances_bytes() {
        let keys: Vec<String> = (0..40).map(|i| format!("key{i:03}{}", "x".repeat(150))).collect();
        let refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let page = leaf_with(&refs);
        let new_key = format!("key020a{}", "x".repeat(150));
        let t = tuple::form_leaf_tuple(1, NullCategory::NormKey, new_key.as_bytes(), &[], 2000)
            .unwrap()
            .unwrap();
        let insert = EntryInsert {
            tuple: t,
            is_delete: false,
        };
        let (left, right) = split_page(&page[..], 21, &insert, INVALID_BLOCK).unwrap();
        let nl = page::max_offset(&left[..]) as i32;
        let nr = page::max_offset(&right[..]) as i32;
        assert_eq!(nl + nr, 41);
        assert!((nl - nr).abs() <= 2);
        let last_left = rightmost_tuple(&left[..]).unwrap();
        let first_right = page_tuple(&right[..], 1).unwrap();
        assert!(last_left.key() < first_right.key());
        assert!(is_leaf(&left[..]) && is_leaf(&right[..]));
    }

    #[test]
    fn test_find_child_ptr() {
        let st = state();
        let tree = EntryTree::new(&st, EntryKey::norm(1, Bytes::from_static(b"a")));
        let mut page = zeroed_page();
        init_page(&mut page[..], 0);
        for (i, k) in ["c", "m", "z"].iter().enumerate() {
            let t = tuple::form_downlink_tuple(1, NullCategory::NormKey, k.as_bytes(), 10 + i as u32);
            page::add_item(&mut page[..], &t, None).unwrap();
        }
        assert_eq!(tree.find_child_ptr(&page[..], 11, 1), 2);
        assert_eq!(tree.find_child_ptr(&page[..], 10, 3), 1);
        assert_eq!(tree.find_child_ptr(&page[..], 99, 1), INVALID_OFFSET);
        assert_eq!(tree.find_child_page(5, &page[..]).unwrap(), (10, 1));
        let tree = EntryTree::new(&st, EntryKey::norm(1, Bytes::from_static(b"zz")));
        assert_eq!(tree.find_child_page(5, &page[..]).unwrap(), (12, 3));
    }
}
