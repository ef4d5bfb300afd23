//! Generic B-tree machinery shared by the entry tree and posting trees.
//!
//! A tree kind plugs in through [`TreeOps`]; this module handles descent
//! with move-right, placement with page splits, and completion of splits
//! whose downlink was never inserted into the parent.
//!
//! Stacks are root-first vectors: the last element is the current page.
//! Positions passed between the split helpers are counted from the end of
//! the stack because re-finding a parent replaces the upper part of it.

use crate::ginpage::{
    self, GIN_COMPRESSED, GIN_INCOMPLETE_SPLIT, GIN_LEAF, check_page_kind, is_incomplete_split,
    is_leaf, right_link,
};
use crate::index::GinIndex;
use crate::meta::GinStatistics;
use gin_buffer::{Buffer, LockMode, PageBuf, zeroed_page};
use gin_common::page::{self, BlockNumber, INVALID_BLOCK, INVALID_OFFSET, OffsetNumber};
use gin_common::{GinError, Result};
use gin_wal::{GinRecordType, RecordBuilder};
use tracing::debug;

/// Injection point hit before inserting the downlink for a split leaf.
pub const LEAF_SPLIT_INJECTION: &str = "gin-leave-leaf-split-incomplete";
/// Injection point hit before inserting the downlink for a split internal page.
pub const INTERNAL_SPLIT_INJECTION: &str = "gin-leave-internal-split-incomplete";

/// Flags in the main data of insert and split records.
pub const XLOG_INSERT_ISDATA: u16 = 0x01;
pub const XLOG_INSERT_ISLEAF: u16 = 0x02;
pub const XLOG_SPLIT_ROOT: u16 = 0x04;

/// One level of a descent.
pub struct StackEntry {
    pub blkno: BlockNumber,
    pub buffer: Buffer,
    /// Position of the downlink followed (internal) or of the item found (leaf).
    pub off: OffsetNumber,
    /// Estimated number of leaves under this page.
    pub predict_number: u32,
}

impl StackEntry {
    pub fn new(blkno: BlockNumber, buffer: Buffer) -> Self {
        Self {
            blkno,
            buffer,
            off: INVALID_OFFSET,
            predict_number: 1,
        }
    }

    pub fn page(&self) -> &[u8] {
        self.buffer.page()
    }
}

pub type Stack = Vec<StackEntry>;

/// Result of planning an insertion.
pub enum Placement<P> {
    /// The page already holds everything.
    Unmodified,
    /// The insertion fits; `P` carries what `exec_place` needs.
    Fits(P),
    /// The page must split into these two images.
    Split { left: PageBuf, right: PageBuf },
}

/// Capability set of one tree kind.
pub trait TreeOps {
    /// Payload inserted at one level.
    type Insert;
    /// Plan computed by `begin_place` for an in-place insertion.
    type Prepared;

    fn is_data(&self) -> bool;
    fn root_blkno(&self) -> BlockNumber;

    /// When set, descent ignores the search key and takes leftmost children.
    fn full_scan(&self) -> bool {
        false
    }

    /// True when the search key lies beyond this page's key range.
    fn is_move_right(&self, page: &[u8]) -> Result<bool>;

    /// Child to descend into and the position of its downlink.
    fn find_child_page(&self, block: BlockNumber, page: &[u8]) -> Result<(BlockNumber, OffsetNumber)>;

    fn get_leftmost_child(&self, block: BlockNumber, page: &[u8]) -> Result<BlockNumber>;

    /// Position of the downlink to `child`, starting the search at `store_off`.
    fn find_child_ptr(&self, page: &[u8], child: BlockNumber, store_off: OffsetNumber) -> OffsetNumber;

    fn begin_place(
        &mut self,
        block: BlockNumber,
        page: &[u8],
        off: OffsetNumber,
        insert: &Self::Insert,
        update_blkno: BlockNumber,
    ) -> Result<Placement<Self::Prepared>>;

    /// Applies a prepared insertion and registers its redo payload as data
    /// of block 0 of `rec`.
    fn exec_place(
        &mut self,
        page: &mut [u8],
        off: OffsetNumber,
        insert: &Self::Insert,
        prepared: Self::Prepared,
        update_blkno: BlockNumber,
        rec: &mut RecordBuilder,
    ) -> Result<()>;

    /// Downlink for the left half of a split.
    fn prepare_downlink(&self, lpage: &[u8], lblkno: BlockNumber) -> Result<Self::Insert>;

    /// Fills a freshly initialized root with downlinks to both halves.
    fn fill_root(
        &self,
        root: &mut [u8],
        lblkno: BlockNumber,
        lpage: &[u8],
        rblkno: BlockNumber,
        rpage: &[u8],
    ) -> Result<()>;
}

/// Number of downlinks on an internal page.
fn fanout(page: &[u8]) -> u32 {
    if ginpage::is_data(page) {
        ginpage::gin_maxoff(page) as u32
    } else {
        page::max_offset(page) as u32
    }
}

/// Latches a page for descent. Leaves are latched exclusively when the
/// caller intends to modify them.
fn traverse_lock(buffer: &mut Buffer, search_mode: bool) -> LockMode {
    buffer.lock(LockMode::Share);
    if is_leaf(buffer.page()) && !search_mode {
        buffer.lock(LockMode::Exclusive);
        // The root can stop being a leaf while unlatched.
        if !is_leaf(buffer.page()) {
            buffer.lock(LockMode::Share);
            return LockMode::Share;
        }
        return LockMode::Exclusive;
    }
    LockMode::Share
}

/// Moves to the right sibling: the sibling is latched before the current
/// page is released.
pub fn step_right(index: &GinIndex, buffer: &mut Buffer, mode: LockMode) -> Result<()> {
    let (leaf, data, next, from) = {
        let p = buffer.page();
        (is_leaf(p), ginpage::is_data(p), right_link(p), buffer.block())
    };
    if next == INVALID_BLOCK {
        return Err(GinError::Internal(format!(
            "cannot step right from rightmost block {from}"
        )));
    }
    let mut nb = index.read_buffer(next)?;
    nb.lock(mode);
    *buffer = nb;
    let p = buffer.page();
    if leaf != is_leaf(p) || data != ginpage::is_data(p) {
        return Err(GinError::corrupted(
            index.name(),
            next,
            format!("right sibling of block {from} is of different type"),
        ));
    }
    Ok(())
}

/// Descends from the root to the leaf that should hold the search key.
///
/// In search mode only the current level is kept and leaves are latched in
/// share mode. Otherwise the full path is kept, leaves are latched
/// exclusively, and incomplete splits met on the way are finished.
pub fn find_leaf_page<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    search_mode: bool,
    root_conflict_check: bool,
) -> Result<Stack> {
    let root = tree.root_blkno();
    let mut stack = vec![StackEntry::new(root, index.read_buffer(root)?)];
    if root_conflict_check {
        index.predicate_locker().check_conflict(root)?;
    }

    loop {
        index.check_for_interrupts()?;
        let level = stack.len() - 1;
        stack[level].off = INVALID_OFFSET;
        let access = traverse_lock(&mut stack[level].buffer, search_mode);
        check_page_kind(index.name(), stack[level].blkno, stack[level].page(), tree.is_data())?;

        if !search_mode && is_incomplete_split(stack[level].page()) {
            finish_old_split(index, tree, &mut stack, 0, None, access)?;
        }

        let level = stack.len() - 1;
        while !tree.full_scan()
            && stack[level].blkno != root
            && tree.is_move_right(stack[level].page())?
        {
            let rightlink = right_link(stack[level].page());
            if rightlink == INVALID_BLOCK {
                break;
            }
            step_right(index, &mut stack[level].buffer, access)?;
            stack[level].blkno = rightlink;
            if !search_mode && is_incomplete_split(stack[level].page()) {
                finish_old_split(index, tree, &mut stack, 0, None, access)?;
            }
        }

        let level = stack.len() - 1;
        if is_leaf(stack[level].page()) {
            return Ok(stack);
        }

        let (child, off) = tree.find_child_page(stack[level].blkno, stack[level].page())?;
        let predict = stack[level].predict_number.saturating_mul(fanout(stack[level].page()).max(1));
        stack[level].off = off;
        stack[level].buffer.unlock();
        if child == stack[level].blkno || child == INVALID_BLOCK {
            return Err(GinError::corrupted(
                index.name(),
                stack[level].blkno,
                format!("invalid downlink to block {child}"),
            ));
        }

        let buffer = index.read_buffer(child)?;
        if search_mode {
            stack[level] = StackEntry {
                blkno: child,
                buffer,
                off: INVALID_OFFSET,
                predict_number: predict,
            };
        } else {
            let mut entry = StackEntry::new(child, buffer);
            entry.predict_number = predict;
            stack.push(entry);
        }
    }
}

/// Inserts `insert` into the leaf at the end of `stack`, splitting and
/// propagating downlinks as needed. Consumes the stack.
pub fn insert_value<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    mut stack: Stack,
    insert: T::Insert,
    mut build: Option<&mut GinStatistics>,
) -> Result<()> {
    if is_incomplete_split(stack[stack.len() - 1].page()) {
        finish_old_split(index, tree, &mut stack, 0, build.as_deref_mut(), LockMode::Exclusive)?;
    }
    let level = stack.len() - 1;
    let done = place_to_page(
        index,
        tree,
        &mut stack,
        level,
        &insert,
        INVALID_BLOCK,
        None,
        build.as_deref_mut(),
    )?;
    if done {
        return Ok(());
    }
    finish_split(index, tree, &mut stack, 0, true, build)
}

/// Places `insert` on the page at `stack[level]`, which must be latched
/// exclusively. Returns true when the insertion is complete, false when the
/// page was split and the caller must insert a downlink into the parent.
///
/// `child` is the stack position of the split child whose downlink is being
/// inserted; its incomplete-split flag is cleared atomically with the insert.
#[allow(clippy::too_many_arguments)]
fn place_to_page<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    stack: &mut Stack,
    level: usize,
    insert: &T::Insert,
    update_blkno: BlockNumber,
    child: Option<usize>,
    build: Option<&mut GinStatistics>,
) -> Result<bool> {
    let block = stack[level].blkno;
    let off = stack[level].off;
    let is_root = level == 0;
    let mut xlflags = 0u16;
    {
        let p = stack[level].page();
        if ginpage::is_data(p) {
            xlflags |= XLOG_INSERT_ISDATA;
        }
        if is_leaf(p) {
            xlflags |= XLOG_INSERT_ISLEAF;
        }
    }
    let child_links = child.map(|c| (stack[c].blkno, right_link(stack[c].page())));

    let placement = tree.begin_place(block, stack[level].page(), off, insert, update_blkno)?;
    match placement {
        Placement::Unmodified => Ok(true),
        Placement::Fits(prepared) => {
            let mut rec = RecordBuilder::new(GinRecordType::Insert);
            rec.register_block(0, block, false);
            tree.exec_place(
                stack[level].buffer.page_mut(),
                off,
                insert,
                prepared,
                update_blkno,
                &mut rec,
            )?;
            stack[level].buffer.mark_dirty();

            let mut main = xlflags.to_le_bytes().to_vec();
            if let (Some(c), Some((lchild, rchild))) = (child, child_links) {
                clear_incomplete_split(&mut stack[c].buffer);
                rec.register_block(1, lchild, false);
                main.extend_from_slice(&lchild.to_le_bytes());
                main.extend_from_slice(&rchild.to_le_bytes());
            }
            rec.main_data(&main);
            let lsn = index.xlog(rec)?;
            page::set_page_lsn(stack[level].buffer.page_mut(), lsn.0);
            if let Some(c) = child {
                page::set_page_lsn(stack[c].buffer.page_mut(), lsn.0);
            }
            Ok(true)
        }
        Placement::Split {
            mut left,
            mut right,
        } => {
            let mut rbuf = index.new_buffer()?;
            let mut build = build;
            if let Some(stats) = build.as_deref_mut() {
                stats.count_new_page(tree.is_data());
            }
            let saved_right = right_link(stack[level].page());
            let (lchild, rchild) = child_links.unwrap_or((INVALID_BLOCK, INVALID_BLOCK));

            let mut main = Vec::with_capacity(14);
            let mut rec = RecordBuilder::new(GinRecordType::Split);
            let lsn;
            if is_root {
                let mut lbuf = index.new_buffer()?;
                if let Some(stats) = build.as_deref_mut() {
                    stats.count_new_page(tree.is_data());
                }
                ginpage::set_right_link(&mut right[..], INVALID_BLOCK);
                ginpage::set_right_link(&mut left[..], rbuf.block());

                let mut root = zeroed_page();
                let root_flags = ginpage::flags(&left[..]) & !(GIN_LEAF | GIN_COMPRESSED);
                if tree.is_data() {
                    ginpage::init_data_page(&mut root[..], root_flags);
                } else {
                    ginpage::init_page(&mut root[..], root_flags);
                }
                tree.fill_root(&mut root[..], lbuf.block(), &left[..], rbuf.block(), &right[..])?;
                if xlflags & XLOG_INSERT_ISLEAF != 0 {
                    index.predicate_locker().page_split(block, lbuf.block());
                    index.predicate_locker().page_split(block, rbuf.block());
                }

                stack[level].buffer.page_mut().copy_from_slice(&root[..]);
                lbuf.page_mut().copy_from_slice(&left[..]);
                rbuf.page_mut().copy_from_slice(&right[..]);
                stack[level].buffer.mark_dirty();
                lbuf.mark_dirty();
                rbuf.mark_dirty();
                if let Some(c) = child {
                    clear_incomplete_split(&mut stack[c].buffer);
                }

                main.extend_from_slice(&(xlflags | XLOG_SPLIT_ROOT).to_le_bytes());
                main.extend_from_slice(&INVALID_BLOCK.to_le_bytes());
                main.extend_from_slice(&lchild.to_le_bytes());
                main.extend_from_slice(&rchild.to_le_bytes());
                rec.main_data(&main);
                rec.register_block(0, lbuf.block(), true)
                    .block_image(0, lbuf.page());
                rec.register_block(1, rbuf.block(), true)
                    .block_image(1, rbuf.page());
                rec.register_block(2, block, true)
                    .block_image(2, stack[level].page());
                if child.is_some() {
                    rec.register_block(3, lchild, false);
                }
                lsn = index.xlog(rec)?;
                page::set_page_lsn(lbuf.page_mut(), lsn.0);
                debug!(
                    index = index.name(),
                    root = block,
                    left = lbuf.block(),
                    right = rbuf.block(),
                    data = tree.is_data(),
                    "split root page"
                );
            } else {
                ginpage::set_right_link(&mut right[..], saved_right);
                ginpage::add_flags(&mut left[..], GIN_INCOMPLETE_SPLIT);
                ginpage::set_right_link(&mut left[..], rbuf.block());
                if xlflags & XLOG_INSERT_ISLEAF != 0 {
                    index.predicate_locker().page_split(block, rbuf.block());
                }

                stack[level].buffer.page_mut().copy_from_slice(&left[..]);
                rbuf.page_mut().copy_from_slice(&right[..]);
                stack[level].buffer.mark_dirty();
                rbuf.mark_dirty();
                if let Some(c) = child {
                    clear_incomplete_split(&mut stack[c].buffer);
                }

                main.extend_from_slice(&xlflags.to_le_bytes());
                main.extend_from_slice(&saved_right.to_le_bytes());
                main.extend_from_slice(&lchild.to_le_bytes());
                main.extend_from_slice(&rchild.to_le_bytes());
                rec.main_data(&main);
                rec.register_block(0, block, true)
                    .block_image(0, stack[level].page());
                rec.register_block(1, rbuf.block(), true)
                    .block_image(1, rbuf.page());
                if child.is_some() {
                    rec.register_block(3, lchild, false);
                }
                lsn = index.xlog(rec)?;
                debug!(
                    index = index.name(),
                    left = block,
                    right = rbuf.block(),
                    data = tree.is_data(),
                    "split page"
                );
            }
            page::set_page_lsn(stack[level].buffer.page_mut(), lsn.0);
            page::set_page_lsn(rbuf.page_mut(), lsn.0);
            if let Some(c) = child {
                page::set_page_lsn(stack[c].buffer.page_mut(), lsn.0);
            }
            Ok(is_root)
        }
    }
}

fn clear_incomplete_split(buffer: &mut Buffer) {
    ginpage::clear_flags(buffer.page_mut(), GIN_INCOMPLETE_SPLIT);
    buffer.mark_dirty();
}

/// Finishes the incomplete split of the page `from_end` positions before the
/// end of `stack`. On return that page is latched exclusively.
fn finish_old_split<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    stack: &mut Stack,
    from_end: usize,
    build: Option<&mut GinStatistics>,
    access: LockMode,
) -> Result<()> {
    let idx = stack.len() - 1 - from_end;
    debug!(
        index = index.name(),
        block = stack[idx].blkno,
        "finishing incomplete split"
    );
    if access == LockMode::Share {
        stack[idx].buffer.lock(LockMode::Exclusive);
        if !is_incomplete_split(stack[idx].page()) {
            return Ok(());
        }
    }
    finish_split(index, tree, stack, from_end, false, build)
}

/// Inserts downlinks for a split page and continues up the tree while the
/// parents split in turn.
///
/// The page `from_end` positions before the end must be latched
/// exclusively. With `freestack` the stack is consumed; otherwise the
/// starting page stays latched and the rest of the path stays pinned.
fn finish_split<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    stack: &mut Stack,
    mut from_end: usize,
    freestack: bool,
    mut build: Option<&mut GinStatistics>,
) -> Result<()> {
    let mut first = true;
    loop {
        let idx = stack.len() - 1 - from_end;
        if idx == 0 {
            return Err(GinError::corrupted(
                index.name(),
                stack[idx].blkno,
                "incomplete split on a page without parent",
            ));
        }
        let injection = if is_leaf(stack[idx].page()) {
            LEAF_SPLIT_INJECTION
        } else {
            INTERNAL_SPLIT_INJECTION
        };
        index.injection_points().run(injection)?;

        let parent_from_end = from_end + 1;
        let pidx = idx - 1;
        stack[pidx].buffer.lock(LockMode::Exclusive);
        if is_incomplete_split(stack[pidx].page()) {
            finish_old_split(
                index,
                tree,
                stack,
                parent_from_end,
                build.as_deref_mut(),
                LockMode::Exclusive,
            )?;
        }

        // Move right until the downlink to the child is found.
        loop {
            let pidx = stack.len() - 1 - parent_from_end;
            let cidx = pidx + 1;
            let child_blk = stack[cidx].blkno;
            let off = tree.find_child_ptr(stack[pidx].page(), child_blk, stack[pidx].off);
            if off != INVALID_OFFSET {
                stack[pidx].off = off;
                break;
            }
            if ginpage::is_rightmost(stack[pidx].page()) {
                stack[pidx].buffer.unlock();
                find_parents(index, tree, stack, cidx)?;
                break;
            }
            step_right(index, &mut stack[pidx].buffer, LockMode::Exclusive)?;
            stack[pidx].blkno = stack[pidx].buffer.block();
            if is_incomplete_split(stack[pidx].page()) {
                finish_old_split(
                    index,
                    tree,
                    stack,
                    parent_from_end,
                    build.as_deref_mut(),
                    LockMode::Exclusive,
                )?;
            }
        }

        let pidx = stack.len() - 1 - parent_from_end;
        let cidx = pidx + 1;
        let insert = tree.prepare_downlink(stack[cidx].page(), stack[cidx].blkno)?;
        let update_blkno = right_link(stack[cidx].page());
        let done = place_to_page(
            index,
            tree,
            stack,
            pidx,
            &insert,
            update_blkno,
            Some(cidx),
            build.as_deref_mut(),
        )?;

        if !first || freestack {
            stack[cidx].buffer.unlock();
        }
        if freestack {
            stack.truncate(cidx);
        } else {
            from_end += 1;
        }
        first = false;
        if done {
            break;
        }
    }

    let idx = stack.len() - 1 - from_end;
    stack[idx].buffer.unlock();
    if freestack {
        stack.clear();
    }
    Ok(())
}

/// Re-finds the parent of `stack[cidx]` by searching level by level from the
/// root. Replaces everything above `cidx` with the root and the found parent,
/// which is left latched exclusively with `off` set.
fn find_parents<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    stack: &mut Stack,
    cidx: usize,
) -> Result<()> {
    let child_blk = stack[cidx].blkno;
    // Keep the root pinned; it locks out concurrent posting-tree vacuum.
    let mut upper: Vec<StackEntry> = stack.drain(0..cidx).collect();
    upper.truncate(1);
    let root = upper
        .pop()
        .ok_or_else(|| GinError::Internal("empty stack while re-finding parent".to_string()))?;
    let root_blk = root.blkno;

    let mut blkno = root_blk;
    let mut buffer = root.buffer.clone_pin();
    loop {
        buffer.lock(LockMode::Exclusive);
        if is_leaf(buffer.page()) {
            return Err(GinError::corrupted(
                index.name(),
                blkno,
                format!("lost path to block {child_blk}"),
            ));
        }
        if is_incomplete_split(buffer.page()) {
            buffer = finish_split_of_orphan(index, tree, &root, blkno, buffer)?;
        }
        let leftmost = tree.get_leftmost_child(blkno, buffer.page())?;

        let mut found = INVALID_OFFSET;
        loop {
            let off = tree.find_child_ptr(buffer.page(), child_blk, INVALID_OFFSET);
            if off != INVALID_OFFSET {
                found = off;
                break;
            }
            let next = right_link(buffer.page());
            if next == INVALID_BLOCK {
                buffer.unlock();
                break;
            }
            step_right(index, &mut buffer, LockMode::Exclusive)?;
            blkno = next;
            if is_incomplete_split(buffer.page()) {
                buffer = finish_split_of_orphan(index, tree, &root, blkno, buffer)?;
            }
        }

        if found != INVALID_OFFSET {
            let parent = StackEntry {
                blkno,
                buffer,
                off: found,
                predict_number: 1,
            };
            let prefix = if blkno == root_blk {
                vec![parent]
            } else {
                vec![root, parent]
            };
            stack.splice(0..0, prefix);
            return Ok(());
        }

        blkno = leftmost;
        buffer = index.read_buffer(blkno)?;
    }
}

/// Finishes the split of a page met while re-finding a parent, using the
/// root as its provisional parent. Returns the page's buffer, still latched.
fn finish_split_of_orphan<T: TreeOps>(
    index: &GinIndex,
    tree: &mut T,
    root: &StackEntry,
    blkno: BlockNumber,
    buffer: Buffer,
) -> Result<Buffer> {
    if blkno == root.blkno {
        return Err(GinError::corrupted(
            index.name(),
            blkno,
            "root page is marked as incompletely split",
        ));
    }
    let mut tmp = vec![
        StackEntry::new(root.blkno, root.buffer.clone_pin()),
        StackEntry::new(blkno, buffer),
    ];
    finish_old_split(index, tree, &mut tmp, 0, None, LockMode::Exclusive)?;
    tmp.pop()
        .map(|e| e.buffer)
        .ok_or_else(|| GinError::Internal("stack emptied while finishing split".to_string()))
}

/// Releases every latch held by `stack`, keeping the pins.
pub fn unlock_stack(stack: &mut Stack) {
    for entry in stack.iter_mut() {
        entry.buffer.unlock();
    }
}
