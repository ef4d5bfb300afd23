//! Posting trees: B-trees of item pointers for keys with too many rows to
//! keep inline.
//!
//! Leaves hold compressed segments. Inserting disassembles a leaf into its
//! segments, merges the new items into the segments they belong to,
//! re-encodes only what changed, and splits when the result no longer fits.
//! Changes to a leaf that stays in place are logged as a list of segment
//! actions rather than as a page image.

use crate::btree::{self, Placement, Stack, TreeOps};
use crate::ginpage::{
    self, DATA_PAGE_MAX_DATA_SIZE, GIN_COMPRESSED, GIN_DATA, GIN_LEAF, MAX_POSTING_ITEMS,
    PostingItem, data_leaf_bytes, data_right_bound, init_data_page, is_compressed, is_deleted,
    is_leaf, is_rightmost,
};
use crate::index::GinIndex;
use crate::meta::GinStatistics;
use crate::posting::{
    self, SEGMENT_MAX_SIZE, SEGMENT_MIN_SIZE, SEGMENT_TARGET_SIZE, SegmentIter, segment_first,
};
use crate::tid::ItemPointer;
use gin_buffer::{Buffer, PageBuf, zeroed_page};
use gin_common::page::{self, BlockNumber, FIRST_OFFSET, INVALID_OFFSET, OffsetNumber, PAGE_SIZE};
use gin_common::{GinError, Result};
use gin_wal::{GinRecordType, RecordBuilder};
use tracing::{debug, trace};

/// A full segment holds at least this many items.
pub const MIN_TUPLES_PER_SEGMENT: usize = (SEGMENT_MAX_SIZE - 2) / ItemPointer::SIZE;

/// What happened to one segment of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentAction {
    Unmodified = 0,
    Delete = 1,
    Insert = 2,
    Replace = 3,
    AddItems = 4,
}

impl SegmentAction {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => SegmentAction::Unmodified,
            1 => SegmentAction::Delete,
            2 => SegmentAction::Insert,
            3 => SegmentAction::Replace,
            4 => SegmentAction::AddItems,
            other => {
                return Err(GinError::Internal(format!(
                    "unknown segment action {other}"
                )));
            }
        })
    }
}

#[derive(Debug, Clone)]
struct LeafSegment {
    action: SegmentAction,
    /// Encoded form; `None` while the items are being modified.
    seg: Option<Vec<u8>>,
    /// Decoded items, when needed.
    items: Option<Vec<ItemPointer>>,
    /// Items added by an `AddItems` action.
    added: Vec<ItemPointer>,
}

impl LeafSegment {
    fn unmodified(seg: &[u8]) -> Self {
        Self {
            action: SegmentAction::Unmodified,
            seg: Some(seg.to_vec()),
            items: None,
            added: Vec::new(),
        }
    }

    fn inserted(items: Vec<ItemPointer>) -> Self {
        Self {
            action: SegmentAction::Insert,
            seg: None,
            items: Some(items),
            added: Vec::new(),
        }
    }

    fn first(&self) -> Result<ItemPointer> {
        if let Some(first) = self.items.as_ref().and_then(|i| i.first()) {
            return Ok(*first);
        }
        match &self.seg {
            Some(seg) => Ok(segment_first(seg)),
            None => Err(GinError::Internal("segment has neither items nor data".to_string())),
        }
    }

    fn ensure_items(&mut self) -> Result<&Vec<ItemPointer>> {
        if self.items.is_none() {
            let seg = self
                .seg
                .as_ref()
                .ok_or_else(|| GinError::Internal("segment has no data to decode".to_string()))?;
            self.items = Some(posting::decode(seg)?);
        }
        self.items
            .as_ref()
            .ok_or_else(|| GinError::Internal("segment items missing".to_string()))
    }

    fn size(&self) -> usize {
        self.seg.as_ref().map_or(0, |s| s.len())
    }
}

/// A leaf taken apart into segments.
#[derive(Debug, Clone)]
pub struct DisassembledLeaf {
    segments: Vec<LeafSegment>,
    /// The page used the legacy uncompressed format.
    old_format: bool,
    /// Index of the last segment that stays on the left page of a split.
    lastleft: usize,
    lsize: usize,
    rsize: usize,
}

impl DisassembledLeaf {
    pub fn from_page(page: &[u8]) -> Result<Self> {
        let mut segments = Vec::new();
        let old_format = !is_compressed(page);
        if old_format {
            let items = ginpage::data_leaf_items(page)?;
            if !items.is_empty() {
                segments.push(LeafSegment {
                    action: SegmentAction::Replace,
                    seg: None,
                    items: Some(items),
                    added: Vec::new(),
                });
            }
        } else {
            for seg in SegmentIter::new(data_leaf_bytes(page)) {
                segments.push(LeafSegment::unmodified(seg?));
            }
        }
        Ok(Self {
            segments,
            old_format,
            lastleft: 0,
            lsize: 0,
            rsize: 0,
        })
    }

    /// Concatenation of every live segment.
    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lsize + self.rsize);
        for s in &self.segments {
            if s.action != SegmentAction::Delete {
                if let Some(seg) = &s.seg {
                    out.extend_from_slice(seg);
                }
            }
        }
        out
    }

    /// Distributes `new_items` over the segments they fall into. Returns
    /// false when every item was already present.
    fn add_items(&mut self, new_items: &[ItemPointer]) -> Result<bool> {
        if self.segments.is_empty() {
            self.segments.push(LeafSegment::inserted(new_items.to_vec()));
            return Ok(true);
        }
        let mut next = 0;
        let mut modified = false;
        let mut i = 0;
        while i < self.segments.len() {
            let is_last = i + 1 == self.segments.len();
            let nthis = if is_last {
                new_items.len() - next
            } else {
                let next_first = self.segments[i + 1].first()?;
                new_items[next..].iter().take_while(|t| **t < next_first).count()
            };
            if nthis == 0 {
                i += 1;
                continue;
            }
            let chunk = &new_items[next..next + nthis];
            let cur = &mut self.segments[i];
            let cur_len = cur.ensure_items()?.len();
            let cur_last = cur.ensure_items()?.last().copied();

            // Appending past a full last segment: start a new one instead
            // of growing it.
            if is_last
                && cur_last.is_some_and(|last| last < chunk[0])
                && cur.seg.as_ref().is_some_and(|s| s.len() >= SEGMENT_TARGET_SIZE)
            {
                self.segments.push(LeafSegment::inserted(chunk.to_vec()));
                modified = true;
                break;
            }

            let merged = posting::merge(cur.ensure_items()?, chunk);
            if merged.len() != cur_len {
                if merged.len() == cur_len + nthis && cur.action == SegmentAction::Unmodified {
                    cur.action = SegmentAction::AddItems;
                    cur.added = chunk.to_vec();
                } else {
                    cur.action = SegmentAction::Replace;
                }
                cur.items = Some(merged);
                cur.seg = None;
                modified = true;
            }
            next += nthis;
            if next == new_items.len() {
                break;
            }
            i += 1;
        }
        Ok(modified)
    }

    /// Re-encodes modified segments, splitting oversized ones and merging
    /// undersized ones into their successor. Decides the split point when
    /// the result overflows a page. Returns whether a split is needed and,
    /// if even two pages were not enough, the first item left out.
    fn repack(&mut self) -> Result<(bool, Option<ItemPointer>)> {
        let mut pgused = 0;
        let mut needsplit = false;
        let mut remaining = None;
        let mut i = 0;
        while i < self.segments.len() {
            let has_next = i + 1 < self.segments.len();
            if self.segments[i].action != SegmentAction::Delete {
                if self.segments[i].seg.is_none() {
                    let items = self.segments[i].ensure_items()?.clone();
                    let mut packed = None;
                    if items.len() <= SEGMENT_MAX_SIZE {
                        let (seg, n) = posting::compress(&items, SEGMENT_MAX_SIZE)?;
                        if n == items.len() {
                            packed = Some(seg);
                        }
                    }
                    if packed.is_none() {
                        let (seg, n) = posting::compress(&items, SEGMENT_TARGET_SIZE)?;
                        let cur = &mut self.segments[i];
                        if cur.action != SegmentAction::Insert {
                            cur.action = SegmentAction::Replace;
                        }
                        cur.items = Some(items[..n].to_vec());
                        self.segments
                            .insert(i + 1, LeafSegment::inserted(items[n..].to_vec()));
                        packed = Some(seg);
                    }
                    self.segments[i].seg = packed;
                }

                let has_next = has_next || i + 1 < self.segments.len();
                if self.segments[i].size() < SEGMENT_MIN_SIZE && has_next {
                    let cur_items = self.segments[i].ensure_items()?.clone();
                    let next = &mut self.segments[i + 1];
                    let merged = posting::merge(&cur_items, next.ensure_items()?);
                    next.items = Some(merged);
                    next.seg = None;
                    next.added.clear();
                    if next.action != SegmentAction::Insert {
                        next.action = SegmentAction::Replace;
                    }
                    if self.segments[i].action == SegmentAction::Insert {
                        self.segments.remove(i);
                        continue;
                    }
                    self.segments[i].action = SegmentAction::Delete;
                    self.segments[i].seg = None;
                }
                self.segments[i].items = None;
            }
            if self.segments[i].action == SegmentAction::Delete {
                i += 1;
                continue;
            }

            let segsize = self.segments[i].size();
            if pgused + segsize > DATA_PAGE_MAX_DATA_SIZE {
                if !needsplit {
                    if i == 0 {
                        return Err(GinError::Internal(
                            "first segment does not fit on an empty page".to_string(),
                        ));
                    }
                    self.lastleft = i - 1;
                    needsplit = true;
                    self.lsize = pgused;
                    pgused = 0;
                } else {
                    remaining = Some(self.segments[i].first()?);
                    self.segments.truncate(i);
                    break;
                }
            }
            pgused += segsize;
            i += 1;
        }
        if needsplit {
            self.rsize = pgused;
        } else {
            self.lsize = pgused;
        }
        Ok((needsplit, remaining))
    }

    /// Segment-action list describing the changes, for redo.
    fn recompress_payload(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut nactions: u16 = 0;
        let mut segno: u16 = 0;
        for s in &self.segments {
            if s.action != SegmentAction::Unmodified {
                let seg = s.seg.as_deref().unwrap_or(&[]);
                let mut action = s.action;
                let mut data = Vec::new();
                match action {
                    SegmentAction::Delete => {}
                    SegmentAction::AddItems => {
                        data.extend_from_slice(&(s.added.len() as u16).to_le_bytes());
                        for t in &s.added {
                            data.extend_from_slice(&t.to_bytes());
                        }
                        if data.len() > seg.len() {
                            action = SegmentAction::Replace;
                            data = seg.to_vec();
                        }
                    }
                    _ => data.extend_from_slice(seg),
                }
                body.extend_from_slice(&segno.to_le_bytes());
                body.push(action as u8);
                body.extend_from_slice(&data);
                nactions += 1;
            }
            if s.action != SegmentAction::Insert {
                segno += 1;
            }
        }
        let mut out = nactions.to_le_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    /// Writes the reassembled segments back onto `page`.
    fn write_to(&self, page: &mut [u8]) {
        if self.old_format {
            ginpage::add_flags(page, GIN_COMPRESSED);
            ginpage::set_gin_maxoff(page, 0);
        }
        ginpage::set_data_leaf_bytes(page, &self.bytes());
    }

    /// Builds the two halves of a split leaf.
    fn split_pages(&self, lbound: ItemPointer, rbound: ItemPointer) -> (PageBuf, PageBuf) {
        let mut left = zeroed_page();
        let mut right = zeroed_page();
        init_data_page(&mut left[..], GIN_DATA | GIN_LEAF | GIN_COMPRESSED);
        init_data_page(&mut right[..], GIN_DATA | GIN_LEAF | GIN_COMPRESSED);
        let mut ldata = Vec::with_capacity(self.lsize);
        let mut rdata = Vec::with_capacity(self.rsize);
        for (i, s) in self.segments.iter().enumerate() {
            if s.action == SegmentAction::Delete {
                continue;
            }
            let target = if i <= self.lastleft { &mut ldata } else { &mut rdata };
            if let Some(seg) = &s.seg {
                target.extend_from_slice(seg);
            }
        }
        ginpage::set_data_leaf_bytes(&mut left[..], &ldata);
        ginpage::set_data_right_bound(&mut left[..], lbound);
        ginpage::set_data_leaf_bytes(&mut right[..], &rdata);
        ginpage::set_data_right_bound(&mut right[..], rbound);
        (left, right)
    }

    /// Highest item on the left half of a split.
    fn left_bound(&self) -> Result<ItemPointer> {
        let seg = self.segments[..=self.lastleft]
            .iter()
            .rev()
            .find(|s| s.action != SegmentAction::Delete)
            .and_then(|s| s.seg.as_ref())
            .ok_or_else(|| GinError::Internal("left half of split is empty".to_string()))?;
        posting::decode(seg)?
            .last()
            .copied()
            .ok_or_else(|| GinError::Internal("empty segment".to_string()))
    }

    /// Removes dead items from every segment in place. Segments are
    /// re-encoded in their old space, which removing items never overflows.
    fn vacuum(&mut self, is_dead: &mut dyn FnMut(&ItemPointer) -> bool) -> Result<usize> {
        let mut removed = 0;
        for s in &mut self.segments {
            let old_size = s.seg.as_ref().map_or(DATA_PAGE_MAX_DATA_SIZE, |seg| seg.len());
            let items = s.ensure_items()?.clone();
            s.items = None;
            let kept: Vec<ItemPointer> = items.iter().copied().filter(|t| !is_dead(t)).collect();
            if kept.len() == items.len() {
                continue;
            }
            removed += items.len() - kept.len();
            if kept.is_empty() {
                s.action = SegmentAction::Delete;
                s.seg = None;
            } else {
                let (seg, n) = posting::compress(&kept, old_size)?;
                if n != kept.len() {
                    return Err(GinError::PostingListCorrupted(
                        "could not fit vacuumed posting list".to_string(),
                    ));
                }
                s.seg = Some(seg);
                s.action = SegmentAction::Replace;
            }
        }
        Ok(removed)
    }
}

/// Replays a segment-action list onto a leaf.
pub fn apply_recompress(page: &mut [u8], payload: &[u8]) -> Result<()> {
    if !is_compressed(page) {
        let items = ginpage::data_leaf_items(page)?;
        let bytes = if items.is_empty() {
            Vec::new()
        } else {
            posting::compress(&items, PAGE_SIZE)?.0
        };
        ginpage::add_flags(page, GIN_COMPRESSED);
        ginpage::set_gin_maxoff(page, 0);
        ginpage::set_data_leaf_bytes(page, &bytes);
    }

    let old: Vec<Vec<u8>> = SegmentIter::new(data_leaf_bytes(page))
        .map(|s| s.map(|seg| seg.to_vec()))
        .collect::<Result<_>>()?;
    let truncated = || GinError::Internal("segment action list truncated".to_string());
    if payload.len() < 2 {
        return Err(truncated());
    }
    let nactions = u16::from_le_bytes([payload[0], payload[1]]);
    let mut pos = 2;
    let mut out = Vec::with_capacity(DATA_PAGE_MAX_DATA_SIZE);
    let mut segno = 0usize;
    for _ in 0..nactions {
        if pos + 3 > payload.len() {
            return Err(truncated());
        }
        let a_segno = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        let action = SegmentAction::from_u8(payload[pos + 2])?;
        pos += 3;
        if a_segno < segno || a_segno > old.len() {
            return Err(GinError::Internal(format!(
                "segment action for segment {a_segno} out of order"
            )));
        }
        while segno < a_segno {
            out.extend_from_slice(&old[segno]);
            segno += 1;
        }
        let old_seg = || {
            old.get(segno)
                .ok_or_else(|| GinError::Internal(format!("no segment {segno} to modify")))
        };
        match action {
            SegmentAction::Delete => {
                old_seg()?;
                segno += 1;
            }
            SegmentAction::Insert | SegmentAction::Replace => {
                let rest = payload.get(pos..).ok_or_else(truncated)?;
                if rest.len() < posting::SEGMENT_HEADER_SIZE {
                    return Err(truncated());
                }
                let size = posting::segment_size(rest);
                let seg = rest.get(..size).ok_or_else(truncated)?;
                if action == SegmentAction::Replace {
                    old_seg()?;
                    segno += 1;
                }
                out.extend_from_slice(seg);
                pos += size;
            }
            SegmentAction::AddItems => {
                let n = payload
                    .get(pos..pos + 2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
                    .ok_or_else(truncated)?;
                pos += 2;
                let raw = payload
                    .get(pos..pos + n * ItemPointer::SIZE)
                    .ok_or_else(truncated)?;
                pos += n * ItemPointer::SIZE;
                let added = crate::tid::read_item_pointers(raw, n);
                let olditems = posting::decode(old_seg()?)?;
                let merged = posting::merge(&olditems, &added);
                let (seg, packed) = posting::compress(&merged, PAGE_SIZE)?;
                if packed != merged.len() {
                    return Err(GinError::PostingListCorrupted(
                        "re-encoded segment does not fit".to_string(),
                    ));
                }
                out.extend_from_slice(&seg);
                segno += 1;
            }
            SegmentAction::Unmodified => {}
        }
    }
    for seg in &old[segno.min(old.len())..] {
        out.extend_from_slice(seg);
    }
    if out.len() > DATA_PAGE_MAX_DATA_SIZE {
        return Err(GinError::PostingListOverflow(format!(
            "replayed leaf needs {} bytes",
            out.len()
        )));
    }
    ginpage::set_data_leaf_bytes(page, &out);
    Ok(())
}

/// Redo payload of a posting-tree internal insert.
pub fn encode_internal_payload(off: OffsetNumber, item: &PostingItem) -> Vec<u8> {
    let mut out = off.to_le_bytes().to_vec();
    let mut buf = [0u8; PostingItem::SIZE];
    item.write_to(&mut buf);
    out.extend_from_slice(&buf);
    out
}

pub fn decode_internal_payload(data: &[u8]) -> Result<(OffsetNumber, PostingItem)> {
    if data.len() < 2 + PostingItem::SIZE {
        return Err(GinError::Internal("internal insert payload truncated".to_string()));
    }
    Ok((
        u16::from_le_bytes([data[0], data[1]]),
        PostingItem::from_bytes(&data[2..]),
    ))
}

/// Repoints the split child's downlink at its right half and adds the
/// downlink for the left half in front of it.
pub fn apply_internal_insert(
    page: &mut [u8],
    off: OffsetNumber,
    item: PostingItem,
    update_blkno: BlockNumber,
) {
    let mut old = ginpage::posting_item(page, off);
    old.child = update_blkno;
    ginpage::set_posting_item(page, off, old);
    ginpage::add_posting_item(page, item, off);
}

/// Payload placed into a posting tree at one level.
#[derive(Debug, Clone)]
pub enum DataInsert {
    /// The tree's pending items, starting at its cursor.
    Items,
    Downlink(PostingItem),
}

pub enum DataPrepared {
    Leaf(DisassembledLeaf),
    Internal,
}

/// Posting-tree search and insertion state.
pub struct DataTree {
    root: BlockNumber,
    is_build: bool,
    full_scan: bool,
    /// Search key for descents.
    pub item: ItemPointer,
    items: Vec<ItemPointer>,
    cur: usize,
}

impl DataTree {
    pub fn new(root: BlockNumber) -> Self {
        Self {
            root,
            is_build: false,
            full_scan: false,
            item: ItemPointer::MIN,
            items: Vec::new(),
            cur: 0,
        }
    }

    pub fn for_insert(root: BlockNumber, items: Vec<ItemPointer>, is_build: bool) -> Self {
        Self {
            is_build,
            items,
            ..Self::new(root)
        }
    }

    pub fn set_full_scan(&mut self, full_scan: bool) {
        self.full_scan = full_scan;
    }

    fn begin_place_leaf(&mut self, block: BlockNumber, page: &[u8]) -> Result<Placement<DataPrepared>> {
        let rbound = data_right_bound(page);
        let new_items = &self.items[self.cur..];
        let mut maxitems = new_items.len();
        if !is_rightmost(page) {
            maxitems = new_items.iter().take_while(|t| **t <= rbound).count();
            if maxitems == 0 {
                return Err(GinError::Internal(format!(
                    "item {} does not belong on block {block}",
                    new_items[0]
                )));
            }
        }

        let mut leaf = DisassembledLeaf::from_page(page)?;
        let append = match leaf.segments.last_mut() {
            Some(last) => last
                .ensure_items()?
                .last()
                .is_none_or(|max_old| new_items[0] >= *max_old),
            None => true,
        };
        let freespace = if is_compressed(page) {
            ginpage::data_leaf_free_space(page)
        } else {
            0
        };
        if append {
            maxitems = maxitems.min(freespace + DATA_PAGE_MAX_DATA_SIZE);
        } else {
            let nsegments = freespace / SEGMENT_MAX_SIZE + DATA_PAGE_MAX_DATA_SIZE / SEGMENT_MAX_SIZE;
            maxitems = maxitems.min(nsegments * MIN_TUPLES_PER_SEGMENT);
        }

        let chunk = &new_items[..maxitems];
        if !leaf.add_items(chunk)? {
            self.cur += maxitems;
            return Ok(Placement::Unmodified);
        }

        let (needsplit, remaining) = leaf.repack()?;
        if let Some(remaining) = remaining {
            if !append {
                return Err(GinError::Internal(format!(
                    "could not split block {block}: old items do not fit"
                )));
            }
            let fit = chunk.iter().take_while(|t| **t < remaining).count();
            if fit == 0 {
                return Err(GinError::Internal(format!(
                    "could not split block {block}: no new items fit"
                )));
            }
            maxitems = fit;
        }

        if !needsplit {
            self.cur += maxitems;
            return Ok(Placement::Fits(DataPrepared::Leaf(leaf)));
        }

        // A build fills the left page; otherwise balance the halves,
        // leaving the left page 75% full when appending.
        if !self.is_build {
            while leaf.lastleft > 0 {
                let seg = &leaf.segments[leaf.lastleft];
                if seg.action != SegmentAction::Delete {
                    let segsize = seg.size();
                    if leaf.lsize < segsize || leaf.lsize - segsize < leaf.rsize + segsize {
                        break;
                    }
                    if append && leaf.lsize - segsize < PAGE_SIZE * 3 / 4 {
                        break;
                    }
                    leaf.lsize -= segsize;
                    leaf.rsize += segsize;
                }
                leaf.lastleft -= 1;
            }
        }
        let lbound = leaf.left_bound()?;
        let (left, right) = leaf.split_pages(lbound, rbound);
        debug!(
            block,
            items = maxitems,
            lsize = leaf.lsize,
            rsize = leaf.rsize,
            append,
            remaining = self.items.len() - self.cur - maxitems,
            "split posting tree leaf"
        );
        self.cur += maxitems;
        Ok(Placement::Split { left, right })
    }

    fn split_internal(
        &self,
        page: &[u8],
        off: OffsetNumber,
        item: PostingItem,
        update_blkno: BlockNumber,
    ) -> (PageBuf, PageBuf) {
        let mut all = ginpage::posting_items(page);
        let at = (off as usize - 1).min(all.len());
        all.insert(at, item);
        if let Some(old) = all.get_mut(at + 1) {
            old.child = update_blkno;
        }
        let nitems = all.len();
        let separator = if self.is_build && is_rightmost(page) {
            MAX_POSTING_ITEMS.min(nitems - 1)
        } else {
            nitems / 2
        };

        let flags = ginpage::flags(page);
        let mut left = zeroed_page();
        let mut right = zeroed_page();
        init_data_page(&mut left[..], flags);
        init_data_page(&mut right[..], flags);
        ginpage::write_posting_items(&mut left[..], &all[..separator]);
        ginpage::write_posting_items(&mut right[..], &all[separator..]);
        ginpage::set_data_right_bound(&mut left[..], all[separator - 1].key);
        ginpage::set_data_right_bound(&mut right[..], data_right_bound(page));
        (left, right)
    }
}

impl TreeOps for DataTree {
    type Insert = DataInsert;
    type Prepared = DataPrepared;

    fn is_data(&self) -> bool {
        true
    }

    fn root_blkno(&self) -> BlockNumber {
        self.root
    }

    fn full_scan(&self) -> bool {
        self.full_scan
    }

    fn is_move_right(&self, page: &[u8]) -> Result<bool> {
        if is_rightmost(page) {
            return Ok(false);
        }
        if is_deleted(page) {
            return Ok(true);
        }
        Ok(self.item > data_right_bound(page))
    }

    fn find_child_page(&self, block: BlockNumber, page: &[u8]) -> Result<(BlockNumber, OffsetNumber)> {
        let maxoff = ginpage::gin_maxoff(page);
        if maxoff == INVALID_OFFSET {
            return Err(GinError::Internal(format!(
                "internal posting tree page {block} has no downlinks"
            )));
        }
        if self.full_scan {
            return Ok((ginpage::posting_item(page, FIRST_OFFSET).child, FIRST_OFFSET));
        }
        let mut low = FIRST_OFFSET;
        let mut high = maxoff + 1;
        while high > low {
            let mid = low + (high - low) / 2;
            // The last downlink covers everything up to the right bound.
            let result = if mid == maxoff {
                std::cmp::Ordering::Less
            } else {
                self.item.cmp(&ginpage::posting_item(page, mid).key)
            };
            match result {
                std::cmp::Ordering::Equal => {
                    return Ok((ginpage::posting_item(page, mid).child, mid));
                }
                std::cmp::Ordering::Greater => low = mid + 1,
                std::cmp::Ordering::Less => high = mid,
            }
        }
        Ok((ginpage::posting_item(page, high).child, high))
    }

    fn get_leftmost_child(&self, block: BlockNumber, page: &[u8]) -> Result<BlockNumber> {
        if ginpage::gin_maxoff(page) == INVALID_OFFSET {
            return Err(GinError::Internal(format!(
                "internal posting tree page {block} has no downlinks"
            )));
        }
        Ok(ginpage::posting_item(page, FIRST_OFFSET).child)
    }

    fn find_child_ptr(&self, page: &[u8], child: BlockNumber, store_off: OffsetNumber) -> OffsetNumber {
        let mut maxoff = ginpage::gin_maxoff(page);
        if store_off >= FIRST_OFFSET && store_off <= maxoff {
            for off in store_off..=maxoff {
                if ginpage::posting_item(page, off).child == child {
                    return off;
                }
            }
            maxoff = store_off - 1;
        }
        for off in FIRST_OFFSET..=maxoff {
            if ginpage::posting_item(page, off).child == child {
                return off;
            }
        }
        INVALID_OFFSET
    }

    fn begin_place(
        &mut self,
        block: BlockNumber,
        page: &[u8],
        off: OffsetNumber,
        insert: &DataInsert,
        update_blkno: BlockNumber,
    ) -> Result<Placement<DataPrepared>> {
        match insert {
            DataInsert::Items => {
                if !is_leaf(page) {
                    return Err(GinError::Internal(format!(
                        "item insert aimed at internal block {block}"
                    )));
                }
                self.begin_place_leaf(block, page)
            }
            DataInsert::Downlink(item) => {
                if ginpage::gin_maxoff(page) as usize >= MAX_POSTING_ITEMS {
                    let (left, right) = self.split_internal(page, off, *item, update_blkno);
                    return Ok(Placement::Split { left, right });
                }
                Ok(Placement::Fits(DataPrepared::Internal))
            }
        }
    }

    fn exec_place(
        &mut self,
        page: &mut [u8],
        off: OffsetNumber,
        insert: &DataInsert,
        prepared: DataPrepared,
        update_blkno: BlockNumber,
        rec: &mut RecordBuilder,
    ) -> Result<()> {
        match (prepared, insert) {
            (DataPrepared::Leaf(leaf), _) => {
                leaf.write_to(page);
                rec.block_data(0, &leaf.recompress_payload());
            }
            (DataPrepared::Internal, DataInsert::Downlink(item)) => {
                apply_internal_insert(page, off, *item, update_blkno);
                rec.block_data(0, &encode_internal_payload(off, item));
            }
            (DataPrepared::Internal, DataInsert::Items) => {
                return Err(GinError::Internal(
                    "internal placement planned for an item insert".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn prepare_downlink(&self, lpage: &[u8], lblkno: BlockNumber) -> Result<DataInsert> {
        Ok(DataInsert::Downlink(PostingItem {
            child: lblkno,
            key: data_right_bound(lpage),
        }))
    }

    fn fill_root(
        &self,
        root: &mut [u8],
        lblkno: BlockNumber,
        lpage: &[u8],
        rblkno: BlockNumber,
        rpage: &[u8],
    ) -> Result<()> {
        let items = [
            PostingItem {
                child: lblkno,
                key: data_right_bound(lpage),
            },
            PostingItem {
                child: rblkno,
                key: data_right_bound(rpage),
            },
        ];
        ginpage::write_posting_items(root, &items);
        Ok(())
    }
}

/// Packs as many of `items` as fit into a fresh leaf image.
fn build_root_leaf(items: &[ItemPointer]) -> Result<(PageBuf, usize)> {
    let mut page = zeroed_page();
    init_data_page(&mut page[..], GIN_DATA | GIN_LEAF | GIN_COMPRESSED);
    let mut data = Vec::new();
    let mut n = 0;
    while n < items.len() {
        let (seg, packed) = posting::compress(&items[n..], SEGMENT_MAX_SIZE)?;
        if data.len() + seg.len() > DATA_PAGE_MAX_DATA_SIZE {
            break;
        }
        data.extend_from_slice(&seg);
        n += packed;
    }
    ginpage::set_data_leaf_bytes(&mut page[..], &data);
    Ok((page, n))
}

/// Creates a posting tree holding `items` and returns its root block.
/// `entry_block` is the entry leaf the tree hangs off; its predicate locks
/// carry over to the new tree.
pub fn create_posting_tree(
    index: &GinIndex,
    items: &[ItemPointer],
    mut build: Option<&mut GinStatistics>,
    entry_block: BlockNumber,
) -> Result<BlockNumber> {
    let (image, nroot) = build_root_leaf(items)?;
    let mut buffer = index.new_buffer()?;
    let blkno = buffer.block();
    index.predicate_locker().page_split(entry_block, blkno);

    buffer.page_mut().copy_from_slice(&image[..]);
    buffer.mark_dirty();
    let leaf_data = data_leaf_bytes(buffer.page()).to_vec();
    let mut rec = RecordBuilder::new(GinRecordType::CreatePostingTree);
    rec.register_block(0, blkno, true);
    rec.main_data(&leaf_data);
    let lsn = index.xlog(rec)?;
    page::set_page_lsn(buffer.page_mut(), lsn.0);
    drop(buffer);

    if let Some(stats) = build.as_deref_mut() {
        stats.n_data_pages += 1;
    }
    debug!(
        index = index.name(),
        root = blkno,
        items = nroot,
        "created posting tree"
    );
    if nroot < items.len() {
        insert_item_pointers(index, blkno, &items[nroot..], build)?;
    }
    Ok(blkno)
}

/// Redo of posting-tree creation.
pub fn init_posting_tree_root(page: &mut [u8], leaf_data: &[u8]) -> Result<()> {
    if leaf_data.len() > DATA_PAGE_MAX_DATA_SIZE {
        return Err(GinError::PostingListOverflow(format!(
            "posting tree root of {} bytes",
            leaf_data.len()
        )));
    }
    init_data_page(page, GIN_DATA | GIN_LEAF | GIN_COMPRESSED);
    ginpage::set_data_leaf_bytes(page, leaf_data);
    Ok(())
}

/// Adds sorted, deduplicated `items` to the posting tree rooted at `root`.
pub fn insert_item_pointers(
    index: &GinIndex,
    root: BlockNumber,
    items: &[ItemPointer],
    mut build: Option<&mut GinStatistics>,
) -> Result<()> {
    let mut tree = DataTree::for_insert(root, items.to_vec(), build.is_some());
    while tree.cur < tree.items.len() {
        tree.item = tree.items[tree.cur];
        let stack = btree::find_leaf_page(index, &mut tree, false, true)?;
        btree::insert_value(index, &mut tree, stack, DataInsert::Items, build.as_deref_mut())?;
    }
    trace!(root, items = items.len(), "inserted into posting tree");
    Ok(())
}

/// Positions on the leftmost leaf of a posting tree, latched in share mode.
pub fn begin_posting_tree_scan(index: &GinIndex, root: BlockNumber) -> Result<(DataTree, Stack)> {
    let mut tree = DataTree::new(root);
    tree.set_full_scan(true);
    let stack = btree::find_leaf_page(index, &mut tree, true, false)?;
    Ok((tree, stack))
}

/// Removes the items `is_dead` selects from the posting-tree leaf in
/// `buffer`, which must be latched exclusively. Returns the number removed.
pub fn vacuum_posting_leaf(
    index: &GinIndex,
    buffer: &mut Buffer,
    is_dead: &mut dyn FnMut(&ItemPointer) -> bool,
) -> Result<usize> {
    let mut leaf = DisassembledLeaf::from_page(buffer.page())?;
    let removed = leaf.vacuum(is_dead)?;
    if removed == 0 {
        return Ok(0);
    }
    let payload = leaf.recompress_payload();
    leaf.write_to(buffer.page_mut());
    buffer.mark_dirty();
    let mut rec = RecordBuilder::new(GinRecordType::VacuumDataLeafPage);
    rec.register_block(0, buffer.block(), false)
        .block_data(0, &payload);
    let lsn = index.xlog(rec)?;
    page::set_page_lsn(buffer.page_mut(), lsn.0);
    Ok(removed)
}
