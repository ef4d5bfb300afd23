//! Sort records of the parallel build.
//!
//! A [`GinTuple`] carries one key and a compressed TID list. Workers sort
//! their own tuples, combine runs of equal keys, and feed the result into a
//! shared sort that the leader reads back in key order.
//!
//! Serialized layout, little endian:
//!
//! ```text
//! tuplen u32 | attno u16 | keylen u16 | typlen i16 | typbyval u8 | category i8 |
//! nitems u32 | key bytes | pad to 2 | compressed segments
//! ```

use crate::posting;
use crate::state::{EntryKey, GinState};
use crate::tid::ItemPointer;
use crate::tuple::NullCategory;
use bytes::{BufMut, Bytes, BytesMut};
use gin_common::page::short_align;
use gin_common::{GinError, KeyType, Result};
use std::cmp::Ordering;

const HEADER_SIZE: usize = 16;

/// Largest segment written into a sort tuple.
const SORT_SEGMENT_SIZE: usize = u16::MAX as usize;

/// One key with a run of TIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GinTuple {
    pub attno: u16,
    pub category: NullCategory,
    pub key: Bytes,
    pub key_type: KeyType,
    pub nitems: u32,
    /// First TID of the list; breaks ties between equal keys.
    pub first: ItemPointer,
    segments: Bytes,
}

impl GinTuple {
    /// Builds a tuple from a sorted, deduplicated TID list.
    pub fn new(state: &GinState, key: &EntryKey, items: &[ItemPointer]) -> Result<Self> {
        let first = *items.first().ok_or_else(|| {
            GinError::Internal("sort tuple needs at least one item".to_string())
        })?;
        Ok(Self {
            attno: key.attno,
            category: key.category,
            key: key.key.clone(),
            key_type: state.opclass(key.attno).key_type(),
            nitems: items.len() as u32,
            first,
            segments: Bytes::from(posting::compress_all(items, SORT_SEGMENT_SIZE)?),
        })
    }

    pub fn entry_key(&self) -> EntryKey {
        EntryKey::new(self.attno, self.category, self.key.clone())
    }

    pub fn items(&self) -> Result<Vec<ItemPointer>> {
        let items = posting::decode_segments(&self.segments)?;
        if items.len() != self.nitems as usize {
            return Err(GinError::PostingListCorrupted(format!(
                "sort tuple decoded to {} items, header says {}",
                items.len(),
                self.nitems
            )));
        }
        Ok(items)
    }

    pub fn to_bytes(&self) -> Bytes {
        let key_end = short_align(HEADER_SIZE + self.key.len());
        let tuplen = key_end + self.segments.len();
        let mut buf = BytesMut::with_capacity(tuplen);
        buf.put_u32_le(tuplen as u32);
        buf.put_u16_le(self.attno);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_i16_le(self.key_type.typlen);
        buf.put_u8(u8::from(self.key_type.typbyval));
        buf.put_i8(self.category.as_i8());
        buf.put_u32_le(self.nitems);
        buf.put_slice(&self.key);
        buf.resize(key_end, 0);
        buf.put_slice(&self.segments);
        buf.freeze()
    }

    pub fn from_bytes(data: &Bytes) -> Result<Self> {
        let corrupt = |what: &str| GinError::Internal(format!("malformed sort tuple: {what}"));
        if data.len() < HEADER_SIZE {
            return Err(corrupt("truncated header"));
        }
        let tuplen = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let attno = u16::from_le_bytes([data[4], data[5]]);
        let keylen = u16::from_le_bytes([data[6], data[7]]) as usize;
        let key_type = KeyType {
            typlen: i16::from_le_bytes([data[8], data[9]]),
            typbyval: data[10] != 0,
        };
        let category = NullCategory::from_i8(data[11] as i8).ok_or_else(|| corrupt("category"))?;
        let nitems = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        let key_end = short_align(HEADER_SIZE + keylen);
        if tuplen != data.len() || key_end > tuplen {
            return Err(corrupt("length"));
        }
        let segments = data.slice(key_end..tuplen);
        if segments.len() < posting::SEGMENT_HEADER_SIZE {
            return Err(corrupt("missing items"));
        }
        Ok(Self {
            attno,
            category,
            key: data.slice(HEADER_SIZE..HEADER_SIZE + keylen),
            key_type,
            nitems,
            first: posting::segment_first(&segments),
            segments,
        })
    }

    /// Sort order: attribute, category, key, then first TID.
    pub fn compare(state: &GinState, a: &GinTuple, b: &GinTuple) -> Ordering {
        state
            .compare_att_entries(a.attno, &a.key, a.category, b.attno, &b.key, b.category)
            .then_with(|| a.first.cmp(&b.first))
    }
}

/// An in-memory sort of serialized [`GinTuple`]s.
#[derive(Debug, Default)]
pub struct TupleSort {
    tuples: Vec<Bytes>,
    bytes: usize,
}

impl TupleSort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, tuple: &GinTuple) {
        let raw = tuple.to_bytes();
        self.bytes += raw.len();
        self.tuples.push(raw);
    }

    /// Adds already serialized tuples, as handed over by another sort.
    pub fn put_raw(&mut self, raw: impl IntoIterator<Item = Bytes>) {
        for t in raw {
            self.bytes += t.len();
            self.tuples.push(t);
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn memory(&self) -> usize {
        self.bytes
    }

    /// Sorts and returns the tuples in order.
    pub fn perform_sort(self, state: &GinState) -> Result<Vec<GinTuple>> {
        let mut parsed = self
            .tuples
            .iter()
            .map(GinTuple::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        parsed.sort_by(|a, b| GinTuple::compare(state, a, b));
        Ok(parsed)
    }
}

/// Combines consecutive tuples of one key into a single TID list.
///
/// TIDs below the first TID of the latest tuple added can no longer be
/// affected by later tuples of the same key; they form the frozen prefix
/// and are skipped by the merge. When the list grows past its limit, the
/// caller flushes the frozen prefix with [`GinBuffer::take_frozen`].
#[derive(Debug)]
pub struct GinBuffer {
    key: Option<EntryKey>,
    items: Vec<ItemPointer>,
    nfrozen: usize,
    max_items: usize,
}

/// Frozen TIDs needed before a trim is worth doing.
const MIN_TRIM_ITEMS: usize = 1024;

/// Default cap on buffered TID bytes.
pub const GIN_BUFFER_LIMIT: usize = 64 * 1024;

impl Default for GinBuffer {
    fn default() -> Self {
        Self::with_limit(GIN_BUFFER_LIMIT)
    }
}

impl GinBuffer {
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            key: None,
            items: Vec::new(),
            nfrozen: 0,
            max_items: (bytes / ItemPointer::SIZE).max(1),
        }
    }

    /// True when the buffer is empty or holds the key of `tuple`.
    pub fn can_add(&self, state: &GinState, tuple: &GinTuple) -> bool {
        match &self.key {
            None => true,
            Some(k) => {
                state.compare_att_entries(
                    k.attno,
                    &k.key,
                    k.category,
                    tuple.attno,
                    &tuple.key,
                    tuple.category,
                ) == Ordering::Equal
            }
        }
    }

    /// True when adding `tuple` would overflow the buffer and there is a
    /// frozen prefix large enough to flush.
    pub fn should_trim(&self, tuple: &GinTuple) -> bool {
        self.nfrozen >= MIN_TRIM_ITEMS && self.items.len() + tuple.nitems as usize >= self.max_items
    }

    /// Adds the TIDs of `tuple`, which must pass [`GinBuffer::can_add`].
    pub fn store(&mut self, tuple: &GinTuple) -> Result<()> {
        let items = tuple.items()?;
        if self.key.is_none() {
            self.key = Some(tuple.entry_key());
        }
        while self.nfrozen < self.items.len() && self.items[self.nfrozen] < tuple.first {
            self.nfrozen += 1;
        }
        let merged = posting::merge(&self.items[self.nfrozen..], &items);
        self.items.truncate(self.nfrozen);
        self.items.extend_from_slice(&merged);
        Ok(())
    }

    pub fn key(&self) -> Option<&EntryKey> {
        self.key.as_ref()
    }

    /// Removes and returns the frozen prefix.
    pub fn take_frozen(&mut self) -> Vec<ItemPointer> {
        let frozen: Vec<ItemPointer> = self.items.drain(..self.nfrozen).collect();
        self.nfrozen = 0;
        frozen
    }

    /// Empties the buffer, returning its key and items.
    pub fn take(&mut self) -> Option<(EntryKey, Vec<ItemPointer>)> {
        let key = self.key.take()?;
        self.nfrozen = 0;
        Some((key, std::mem::take(&mut self.items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::ArrayOps;
    use gin_common::IndexOptions;
    use std::sync::Arc;

    fn state() -> GinState {
        GinState::new(vec![Arc::new(ArrayOps)], &IndexOptions::default()).unwrap()
    }

    fn tids(blocks: std::ops::Range<u32>) -> Vec<ItemPointer> {
        blocks.map(|b| ItemPointer::new(b, 1)).collect()
    }

    #[test]
    fn test_tuple_serialization() {
        let state = state();
        let t = GinTuple::new(&state, &EntryKey::norm(2, "abc"), &tids(5..500)).unwrap();
        let raw = t.to_bytes();
        assert_eq!(raw.len() % 2, 0);
        let back = GinTuple::from_bytes(&raw).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.first, ItemPointer::new(5, 1));
        assert_eq!(back.items().unwrap(), tids(5..500));
        assert!(GinTuple::from_bytes(&raw.slice(..10)).is_err());
        assert!(GinTuple::new(&state, &EntryKey::norm(1, "x"), &[]).is_err());
    }

    #[test]
    fn test_sort_orders_by_key_then_first_tid() {
        let state = state();
        let mut sort = TupleSort::new();
        sort.put(&GinTuple::new(&state, &EntryKey::norm(1, "b"), &tids(10..12)).unwrap());
        sort.put(&GinTuple::new(&state, &EntryKey::norm(1, "b"), &tids(1..3)).unwrap());
        sort.put(&GinTuple::new(&state, &EntryKey::placeholder(1, NullCategory::NullItem), &tids(0..1)).unwrap());
        sort.put(&GinTuple::new(&state, &EntryKey::norm(1, "a"), &tids(7..8)).unwrap());
        assert_eq!(sort.len(), 4);
        let out = sort.perform_sort(&state).unwrap();
        let order: Vec<_> = out.iter().map(|t| (t.key.clone(), t.first.block)).collect();
        assert_eq!(
            order,
            vec![
                (Bytes::from_static(b"a"), 7),
                (Bytes::from_static(b"b"), 1),
                (Bytes::from_static(b"b"), 10),
                (Bytes::new(), 0),
            ]
        );
    }

    #[test]
    fn test_buffer_merges_overlapping_runs() {
        let state = state();
        let key = EntryKey::norm(1, "k");
        let mut buf = GinBuffer::default();
        let a = GinTuple::new(&state, &key, &[ItemPointer::new(1, 1), ItemPointer::new(5, 1)]).unwrap();
        let b = GinTuple::new(&state, &key, &[ItemPointer::new(3, 1), ItemPointer::new(9, 1)]).unwrap();
        let other = GinTuple::new(&state, &EntryKey::norm(1, "z"), &tids(0..1)).unwrap();
        assert!(buf.can_add(&state, &a));
        buf.store(&a).unwrap();
        buf.store(&b).unwrap();
        assert!(!buf.can_add(&state, &other));
        let (k, items) = buf.take().unwrap();
        assert_eq!(k, key);
        assert_eq!(
            items,
            vec![
                ItemPointer::new(1, 1),
                ItemPointer::new(3, 1),
                ItemPointer::new(5, 1),
                ItemPointer::new(9, 1)
            ]
        );
        assert!(buf.key().is_none());
        assert!(buf.take().is_none());
    }

    #[test]
    fn test_buffer_trims_frozen_prefix() {
        let state = state();
        let key = EntryKey::norm(1, "k");
        let mut buf = GinBuffer::with_limit(3000 * ItemPointer::SIZE);
        buf.store(&GinTuple::new(&state, &key, &tids(0..2000)).unwrap()).unwrap();
        let next = GinTuple::new(&state, &key, &tids(2000..4000)).unwrap();
        // Nothing is frozen until a later run shows where it starts.
        assert!(!buf.should_trim(&next));
        buf.store(&next).unwrap();
        let last = GinTuple::new(&state, &key, &tids(4000..4100)).unwrap();
        assert!(buf.should_trim(&last));
        // Only TIDs below the first TID of the latest run are final.
        let frozen = buf.take_frozen();
        assert_eq!(frozen, tids(0..2000));
        buf.store(&last).unwrap();
        let (_, rest) = buf.take().unwrap();
        assert_eq!(rest, tids(2000..4100));
    }
}
