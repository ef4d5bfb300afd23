//! Helpers shared by the unit tests.

use crate::btree;
use crate::datapage;
use crate::entrypage::{EntryTree, page_tuple};
use crate::ginpage;
use crate::index::GinIndex;
use crate::opclass::ArrayOps;
use crate::state::EntryKey;
use crate::tid::ItemPointer;
use gin_buffer::LockMode;
use gin_common::{EngineConfig, IndexOptions};
use std::sync::Arc;

pub fn index_with_options(name: &str, options: IndexOptions) -> GinIndex {
    GinIndex::create(name, vec![Arc::new(ArrayOps)], options, EngineConfig::default()).unwrap()
}

/// Single-column array index.
pub fn array_index(name: &str, fast_update: bool) -> GinIndex {
    index_with_options(
        name,
        IndexOptions {
            use_fast_update: fast_update,
            ..IndexOptions::default()
        },
    )
}

/// Every TID of a posting tree, read leaf by leaf along the right links.
pub fn posting_tree_items(index: &GinIndex, root: u32) -> Vec<ItemPointer> {
    let (_tree, mut stack) = datapage::begin_posting_tree_scan(index, root).unwrap();
    let mut leaf = stack.pop().unwrap();
    let mut out = Vec::new();
    loop {
        out.extend(ginpage::data_leaf_items(leaf.buffer.page()).unwrap());
        if ginpage::is_rightmost(leaf.buffer.page()) {
            return out;
        }
        btree::step_right(index, &mut leaf.buffer, LockMode::Share).unwrap();
    }
}

/// Looks `key` up in the entry tree. Returns whether its items live in a
/// posting tree, and the items.
pub fn lookup(index: &GinIndex, key: &EntryKey) -> Option<(bool, Vec<ItemPointer>)> {
    let mut tree = EntryTree::new(index.state(), key.clone());
    let stack = btree::find_leaf_page(index, &mut tree, true, false).unwrap();
    let leaf = &stack[stack.len() - 1];
    let (found, off) = tree.locate_leaf_entry(leaf.page()).unwrap();
    if !found {
        return None;
    }
    let tuple = page_tuple(leaf.page(), off).unwrap();
    if tuple.is_posting_tree() {
        let root = tuple.posting_tree_root();
        drop(stack);
        return Some((true, posting_tree_items(index, root)));
    }
    Some((false, tuple.read_items().unwrap()))
}

pub fn lookup_items(index: &GinIndex, key: &EntryKey) -> Vec<ItemPointer> {
    lookup(index, key).map(|(_, items)| items).unwrap_or_default()
}
