//! Insertion of (key, TIDs) pairs into the entry tree, and the retail
//! insert entry point.

use crate::btree;
use crate::datapage::{create_posting_tree, insert_item_pointers};
use crate::entrypage::{EntryInsert, EntryTree, page_tuple};
use crate::fast::PendingCollector;
use crate::index::GinIndex;
use crate::meta::GinStatistics;
use crate::posting;
use crate::state::EntryKey;
use crate::tid::ItemPointer;
use crate::tuple::{EntryTuple, form_leaf_tuple, form_posting_tree_tuple};
use gin_common::page::BlockNumber;
use gin_common::{Datum, GinError, Result};
use tracing::{debug, trace};

/// Whether the caller wants uniqueness enforced on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniqueCheck {
    #[default]
    No,
    Yes,
    Partial,
}

/// Inserts sorted, deduplicated `items` under `key`.
///
/// With `build` set the call runs as part of an index build and the page
/// counters in `build` are maintained.
pub fn entry_insert(
    index: &GinIndex,
    key: &EntryKey,
    items: &[ItemPointer],
    mut build: Option<&mut GinStatistics>,
) -> Result<()> {
    let mut tree = EntryTree::new(index.state(), key.clone());
    let mut stack = btree::find_leaf_page(index, &mut tree, false, false)?;
    let level = stack.len() - 1;
    let leaf_block = stack[level].blkno;
    let (found, off) = tree.locate_leaf_entry(stack[level].page())?;
    stack[level].off = off;

    let insert = if found {
        let raw = page_tuple(stack[level].page(), off)?.raw().to_vec();
        let old = EntryTuple::parse(&raw)?;
        if old.is_posting_tree() {
            let root = old.posting_tree_root();
            // The entry page stays untouched; the posting tree handles its
            // own locking.
            btree::unlock_stack(&mut stack);
            drop(stack);
            return insert_item_pointers(index, root, items, build);
        }
        index.predicate_locker().check_conflict(leaf_block)?;
        EntryInsert {
            tuple: add_items_to_leaf_tuple(index, &old, items, build.as_deref_mut(), leaf_block)?,
            is_delete: true,
        }
    } else {
        index.predicate_locker().check_conflict(leaf_block)?;
        let tuple = build_fresh_leaf_tuple(index, key, items, build.as_deref_mut(), leaf_block)?;
        if let Some(stats) = build.as_deref_mut() {
            stats.n_entries += 1;
        }
        EntryInsert {
            tuple,
            is_delete: false,
        }
    };
    btree::insert_value(index, &mut tree, stack, insert, build)
}

/// Merges `items` into an existing inline posting list. When the merged
/// list no longer fits inline, the old items move to a new posting tree,
/// the new ones are added to it, and a tree-pointer tuple is returned.
fn add_items_to_leaf_tuple(
    index: &GinIndex,
    old: &EntryTuple<'_>,
    items: &[ItemPointer],
    mut build: Option<&mut GinStatistics>,
    entry_block: BlockNumber,
) -> Result<Vec<u8>> {
    let state = index.state();
    let old_items = old.read_items()?;
    let merged = posting::merge(&old_items, items);
    if let Some(tuple) = form_leaf_tuple(
        old.attno(),
        old.category(),
        old.key(),
        &merged,
        state.max_item_size(),
    )? {
        return Ok(tuple);
    }

    let root = create_posting_tree(index, &old_items, build.as_deref_mut(), entry_block)?;
    insert_item_pointers(index, root, items, build)?;
    debug!(
        index = index.name(),
        attno = old.attno(),
        root,
        items = merged.len(),
        "moved posting list to a posting tree"
    );
    Ok(form_posting_tree_tuple(
        old.attno(),
        old.category(),
        old.key(),
        root,
    ))
}

/// Forms the leaf tuple for a key not yet in the index, creating a posting
/// tree when `items` are too many to inline.
fn build_fresh_leaf_tuple(
    index: &GinIndex,
    key: &EntryKey,
    items: &[ItemPointer],
    build: Option<&mut GinStatistics>,
    entry_block: BlockNumber,
) -> Result<Vec<u8>> {
    let max = index.state().max_item_size();
    if let Some(tuple) = form_leaf_tuple(key.attno, key.category, &key.key, items, max)? {
        return Ok(tuple);
    }
    // form_leaf_tuple has already rejected an oversized key.
    let root = create_posting_tree(index, items, build, entry_block)?;
    debug!(
        index = index.name(),
        attno = key.attno,
        root,
        items = items.len(),
        "created posting tree for new key"
    );
    Ok(form_posting_tree_tuple(
        key.attno,
        key.category,
        &key.key,
        root,
    ))
}

impl GinIndex {
    /// Indexes one heap row. `values` holds one value per column, `None`
    /// for SQL NULL.
    pub fn insert(&self, values: &[Option<Datum>], tid: ItemPointer) -> Result<()> {
        self.insert_checked(values, tid, UniqueCheck::No)
    }

    /// Like [`GinIndex::insert`], with an explicit uniqueness request. An
    /// inverted index cannot enforce uniqueness.
    pub fn insert_checked(
        &self,
        values: &[Option<Datum>],
        tid: ItemPointer,
        unique: UniqueCheck,
    ) -> Result<()> {
        if unique != UniqueCheck::No {
            return Err(GinError::UniqueNotSupported);
        }
        if !tid.is_valid() || tid.is_lossy() {
            return Err(GinError::InvalidTid {
                block: tid.block,
                offset: tid.offset,
            });
        }
        self.check_for_interrupts()?;
        let keys = self.state().extract_row(values)?;

        if self.options().use_fast_update {
            let mut collector = PendingCollector::default();
            collector.collect(self.state(), &keys, tid)?;
            self.fast_insert(collector)?;
        } else {
            for key in &keys {
                entry_insert(self, key, &[tid], None)?;
            }
        }
        trace!(index = self.name(), %tid, keys = keys.len(), "inserted row");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ginpage::ROOT_BLKNO;
    use crate::testutil;
    use gin_buffer::LockMode;
    use gin_common::IndexOptions;

    #[test]
    fn test_entry_insert_new_and_existing_key() {
        let index = testutil::array_index("idx", false);
        let key = EntryKey::norm(1, "a");
        entry_insert(&index, &key, &[ItemPointer::new(1, 1)], None).unwrap();
        entry_insert(&index, &key, &[ItemPointer::new(0, 5)], None).unwrap();
        entry_insert(&index, &key, &[ItemPointer::new(1, 1)], None).unwrap();
        let (tree, items) = testutil::lookup(&index, &key).unwrap();
        assert!(!tree);
        assert_eq!(items, vec![ItemPointer::new(0, 5), ItemPointer::new(1, 1)]);
    }

    #[test]
    fn test_promotion_to_posting_tree() {
        let options = IndexOptions {
            use_fast_update: false,
            max_item_size: Some(256),
            ..IndexOptions::default()
        };
        let index = testutil::index_with_options("idx", options);
        let key = EntryKey::norm(1, "k");
        let all: Vec<ItemPointer> = (0..600).map(|i| ItemPointer::new(i * 3, 1)).collect();
        for tid in &all {
            entry_insert(&index, &key, &[*tid], None).unwrap();
        }
        let (tree, items) = testutil::lookup(&index, &key).unwrap();
        assert!(tree);
        assert_eq!(items, all);

        // The entry tree is still a single leaf.
        let mut root = index.read_buffer(ROOT_BLKNO).unwrap();
        root.lock(LockMode::Share);
        assert!(crate::ginpage::is_leaf(root.page()));
    }

    #[test]
    fn test_fresh_key_with_many_items_goes_to_tree() {
        let index = testutil::array_index("idx", false);
        let key = EntryKey::norm(1, "many");
        let items: Vec<ItemPointer> = (0..5000).map(|i| ItemPointer::new(i, 7)).collect();
        let mut stats = GinStatistics::default();
        entry_insert(&index, &key, &items, Some(&mut stats)).unwrap();
        assert_eq!(stats.n_entries, 1);
        assert!(stats.n_data_pages >= 1);
        let (tree, got) = testutil::lookup(&index, &key).unwrap();
        assert!(tree);
        assert_eq!(got, items);
    }

    #[test]
    fn test_retail_insert_without_fast_update() {
        let index = testutil::array_index("idx", false);
        index
            .insert(&[Some(Datum::text_array(&["x", "y"]))], ItemPointer::new(3, 4))
            .unwrap();
        index.insert(&[None], ItemPointer::new(3, 5)).unwrap();
        let (_, xs) = testutil::lookup(&index, &EntryKey::norm(1, "x")).unwrap();
        assert_eq!(xs, vec![ItemPointer::new(3, 4)]);
        assert!(testutil::lookup(&index, &EntryKey::norm(1, "z")).is_none());
        let null = EntryKey::placeholder(1, crate::tuple::NullCategory::NullItem);
        let (_, nulls) = testutil::lookup(&index, &null).unwrap();
        assert_eq!(nulls, vec![ItemPointer::new(3, 5)]);
    }

    #[test]
    fn test_insert_rejects_unique_and_bad_tid() {
        let index = testutil::array_index("idx", false);
        let row = [Some(Datum::text_array(&["x"]))];
        assert!(matches!(
            index.insert_checked(&row, ItemPointer::new(1, 1), UniqueCheck::Yes),
            Err(GinError::UniqueNotSupported)
        ));
        assert!(matches!(
            index.insert(&row, ItemPointer::new(1, 0)),
            Err(GinError::InvalidTid { .. })
        ));
    }

    #[test]
    fn test_oversized_key_is_rejected() {
        let index = testutil::array_index("idx", false);
        let big = "x".repeat(4000);
        let err = index
            .insert(&[Some(Datum::text_array(&[big.as_str()]))], ItemPointer::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, GinError::TupleTooLarge { .. }));
    }
}
