//! Compressed posting lists.
//!
//! A segment stores its first item pointer verbatim, then each following
//! item as the varbyte-encoded delta from its predecessor in the packed
//! `block << 11 | offset` integer space. Each varbyte byte carries seven
//! payload bits with the high bit set when more bytes follow; a delta never
//! needs more than seven bytes.
//!
//! ```text
//! +-------------+-----------+------------------------+-----+
//! | first (6 B) | nbytes u16| varbyte deltas (nbytes)| pad |
//! +-------------+-----------+------------------------+-----+
//! ```
//!
//! The on-page size of a segment is `short_align(8 + nbytes)`.

use crate::tid::ItemPointer;
use gin_common::page::short_align;
use gin_common::{GinError, Result};

/// Size of the fixed segment header.
pub const SEGMENT_HEADER_SIZE: usize = ItemPointer::SIZE + 2;

/// Longest varbyte encoding of one delta.
pub const MAX_VARBYTE_LEN: usize = 7;

/// Preferred segment size on posting-tree leaves.
pub const SEGMENT_TARGET_SIZE: usize = 256;
/// Segments smaller than this are merged with a neighbour during repacking.
pub const SEGMENT_MIN_SIZE: usize = 128;
/// Segments are re-split when they grow past this.
pub const SEGMENT_MAX_SIZE: usize = 384;

/// Appends the varbyte encoding of `val`.
pub fn encode_varbyte(mut val: u64, out: &mut Vec<u8>) {
    while val > 0x7F {
        out.push(0x80 | (val & 0x7F) as u8);
        val >>= 7;
    }
    out.push(val as u8);
}

/// Decodes one varbyte value starting at `*pos`.
pub fn decode_varbyte(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut val = 0u64;
    for i in 0..MAX_VARBYTE_LEN {
        let b = *buf.get(*pos).ok_or_else(|| {
            GinError::PostingListCorrupted("varbyte value runs past end of segment".to_string())
        })?;
        *pos += 1;
        if i == MAX_VARBYTE_LEN - 1 {
            // The last byte uses all eight bits.
            val |= (b as u64) << (7 * i);
            return Ok(val);
        }
        val |= ((b & 0x7F) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(val);
        }
    }
    Ok(val)
}

/// Number of delta bytes recorded in a segment header.
#[inline]
pub fn segment_nbytes(seg: &[u8]) -> usize {
    u16::from_le_bytes([seg[6], seg[7]]) as usize
}

/// On-page size of the segment starting at `seg`.
#[inline]
pub fn segment_size(seg: &[u8]) -> usize {
    short_align(SEGMENT_HEADER_SIZE + segment_nbytes(seg))
}

#[inline]
pub fn segment_first(seg: &[u8]) -> ItemPointer {
    ItemPointer::from_bytes(&seg[..ItemPointer::SIZE])
}

/// Encodes a prefix of `items` into a single segment of at most `max_size`
/// bytes. Returns the segment bytes and the number of items written.
///
/// `items` must be strictly ascending. The first item is always written.
pub fn compress(items: &[ItemPointer], max_size: usize) -> Result<(Vec<u8>, usize)> {
    let first = *items
        .first()
        .ok_or_else(|| GinError::Internal("cannot compress an empty posting list".to_string()))?;
    let max_size = max_size & !1;
    if max_size < SEGMENT_HEADER_SIZE {
        return Err(GinError::PostingListOverflow(format!(
            "segment limit {max_size} is smaller than the segment header"
        )));
    }
    let max_bytes = max_size - SEGMENT_HEADER_SIZE;

    let mut out = Vec::with_capacity(max_size.min(SEGMENT_HEADER_SIZE + items.len() * 2));
    out.extend_from_slice(&first.to_bytes());
    out.extend_from_slice(&[0, 0]);

    let mut prev = first.pack()?;
    let mut written = 1;
    let mut scratch = Vec::with_capacity(MAX_VARBYTE_LEN + 1);
    for item in &items[1..] {
        let val = item.pack()?;
        if val <= prev {
            return Err(GinError::Internal(format!(
                "posting list items out of order at {item}"
            )));
        }
        scratch.clear();
        encode_varbyte(val - prev, &mut scratch);
        if out.len() - SEGMENT_HEADER_SIZE + scratch.len() > max_bytes {
            break;
        }
        out.extend_from_slice(&scratch);
        prev = val;
        written += 1;
    }

    let nbytes = out.len() - SEGMENT_HEADER_SIZE;
    out[6..8].copy_from_slice(&(nbytes as u16).to_le_bytes());
    out.resize(short_align(out.len()), 0);
    Ok((out, written))
}

/// Encodes all of `items` into consecutive segments of at most `max_segment`
/// bytes each.
pub fn compress_all(items: &[ItemPointer], max_segment: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = items;
    while !rest.is_empty() {
        let (seg, n) = compress(rest, max_segment)?;
        out.extend_from_slice(&seg);
        rest = &rest[n..];
    }
    Ok(out)
}

/// Decodes one segment, appending its items to `out`.
pub fn decode_into(seg: &[u8], out: &mut Vec<ItemPointer>) -> Result<usize> {
    if seg.len() < SEGMENT_HEADER_SIZE {
        return Err(GinError::PostingListCorrupted(format!(
            "segment of {} bytes is shorter than its header",
            seg.len()
        )));
    }
    let nbytes = segment_nbytes(seg);
    let end = SEGMENT_HEADER_SIZE + nbytes;
    if end > seg.len() {
        return Err(GinError::PostingListCorrupted(format!(
            "segment claims {nbytes} bytes but only {} are available",
            seg.len() - SEGMENT_HEADER_SIZE
        )));
    }
    let first = segment_first(seg);
    let before = out.len();
    out.push(first);
    let mut val = first.pack().map_err(|_| {
        GinError::PostingListCorrupted(format!("invalid first item {first} in segment"))
    })?;
    let body = &seg[..end];
    let mut pos = SEGMENT_HEADER_SIZE;
    while pos < end {
        let delta = decode_varbyte(body, &mut pos)?;
        if delta == 0 {
            return Err(GinError::PostingListCorrupted(
                "zero delta in posting list segment".to_string(),
            ));
        }
        val = val.checked_add(delta).ok_or_else(|| {
            GinError::PostingListCorrupted("item pointer delta overflows".to_string())
        })?;
        out.push(ItemPointer::unpack(val));
    }
    Ok(out.len() - before)
}

/// Decodes a single segment.
pub fn decode(seg: &[u8]) -> Result<Vec<ItemPointer>> {
    let mut out = Vec::new();
    decode_into(seg, &mut out)?;
    Ok(out)
}

/// Iterates over the segments packed in `buf`.
pub struct SegmentIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SegmentIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < SEGMENT_HEADER_SIZE {
            self.pos = self.buf.len();
            return Some(Err(GinError::PostingListCorrupted(
                "trailing bytes after last segment".to_string(),
            )));
        }
        let size = segment_size(rest);
        if size > rest.len() {
            self.pos = self.buf.len();
            return Some(Err(GinError::PostingListCorrupted(format!(
                "segment of {size} bytes overruns its container"
            ))));
        }
        self.pos += size;
        Some(Ok(&rest[..size]))
    }
}

/// Decodes a run of concatenated segments, checking global ordering.
pub fn decode_segments(buf: &[u8]) -> Result<Vec<ItemPointer>> {
    let mut out: Vec<ItemPointer> = Vec::new();
    for seg in SegmentIter::new(buf) {
        let seg = seg?;
        if let Some(last) = out.last() {
            if segment_first(seg) <= *last {
                return Err(GinError::PostingListCorrupted(format!(
                    "segment starting at {} does not follow {}",
                    segment_first(seg),
                    last
                )));
            }
        }
        decode_into(seg, &mut out)?;
    }
    Ok(out)
}

/// Merges two ascending lists, dropping duplicates.
pub fn merge(a: &[ItemPointer], b: &[ItemPointer]) -> Vec<ItemPointer> {
    // Fast path for appends, the common case during builds.
    if a.last().zip(b.first()).is_some_and(|(x, y)| x < y) || a.is_empty() || b.is_empty() {
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        return out;
    }
    if b.last().zip(a.first()).is_some_and(|(x, y)| x < y) {
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(b);
        out.extend_from_slice(a);
        return out;
    }

    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Sorts and removes duplicates in place.
pub fn sort_dedup(items: &mut Vec<ItemPointer>) {
    items.sort_unstable();
    items.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tid::MAX_HEAP_OFFSET;

    fn tids(raw: &[(u32, u16)]) -> Vec<ItemPointer> {
        raw.iter().map(|&(b, o)| ItemPointer::new(b, o)).collect()
    }

    #[test]
    fn test_varbyte_lengths() {
        let mut out = Vec::new();
        encode_varbyte(0x7F, &mut out);
        assert_eq!(out, vec![0x7F]);
        out.clear();
        encode_varbyte(0x80, &mut out);
        assert_eq!(out, vec![0x80, 0x01]);
        let mut pos = 0;
        assert_eq!(decode_varbyte(&out, &mut pos).unwrap(), 0x80);
        assert_eq!(pos, 2);

        // The largest packed delta uses exactly seven bytes.
        out.clear();
        let max = ItemPointer::new(u32::MAX - 1, MAX_HEAP_OFFSET).pack().unwrap();
        encode_varbyte(max, &mut out);
        assert_eq!(out.len(), MAX_VARBYTE_LEN);
        let mut pos = 0;
        assert_eq!(decode_varbyte(&out, &mut pos).unwrap(), max);
    }

    #[test]
    fn test_compress_small_deltas() {
        let items = tids(&[(1, 1), (1, 2), (1, 3), (2, 1)]);
        let (seg, n) = compress(&items, 64).unwrap();
        assert_eq!(n, 4);
        assert_eq!(segment_first(&seg), items[0]);
        assert_eq!(segment_size(&seg), seg.len());
        assert_eq!(seg.len() % 2, 0);
        assert_eq!(decode(&seg).unwrap(), items);
    }

    #[test]
    fn test_extreme_pair_needs_sixteen_bytes() {
        let items = tids(&[(0, 1), (u32::MAX - 1, 2047)]);
        let (seg, n) = compress(&items, 16).unwrap();
        assert_eq!(n, 2);
        assert_eq!(seg.len(), 16);
        assert_eq!(decode(&seg).unwrap(), items);

        // Header plus a seven-byte delta does not fit in fourteen bytes.
        let (seg, n) = compress(&items, 14).unwrap();
        assert_eq!(n, 1);
        assert_eq!(decode(&seg).unwrap(), items[..1].to_vec());
    }

    #[test]
    fn test_compress_respects_limit() {
        let items: Vec<ItemPointer> = (0..1000).map(|i| ItemPointer::new(i * 1000, 1)).collect();
        let (seg, n) = compress(&items, 100).unwrap();
        assert!(seg.len() <= 100);
        assert!(n > 1 && n < items.len());
        assert_eq!(decode(&seg).unwrap(), items[..n].to_vec());
    }

    #[test]
    fn test_compress_rejects_unordered() {
        let items = tids(&[(2, 1), (1, 1)]);
        assert!(compress(&items, 64).is_err());
    }

    #[test]
    fn test_compress_all_and_decode_segments() {
        let items: Vec<ItemPointer> = (0..5000u32)
            .map(|i| ItemPointer::new(i / 7, (i % 7 + 1) as u16))
            .collect();
        let buf = compress_all(&items, SEGMENT_TARGET_SIZE).unwrap();
        let segs: Vec<_> = SegmentIter::new(&buf).map(|s| s.unwrap()).collect();
        assert!(segs.len() > 1);
        assert!(segs.iter().all(|s| s.len() <= SEGMENT_TARGET_SIZE));
        assert_eq!(decode_segments(&buf).unwrap(), items);
    }

    #[test]
    fn test_decode_detects_truncation() {
        let items = tids(&[(1, 1), (900, 5)]);
        let (mut seg, _) = compress(&items, 64).unwrap();
        seg[6] = 40;
        assert!(matches!(decode(&seg), Err(GinError::PostingListCorrupted(_))));
    }

    #[test]
    fn test_merge() {
        let a = tids(&[(1, 1), (1, 3), (2, 2)]);
        let b = tids(&[(1, 2), (1, 3), (3, 1)]);
        assert_eq!(merge(&a, &b), tids(&[(1, 1), (1, 2), (1, 3), (2, 2), (3, 1)]));
        assert_eq!(merge(&a, &a), a);
        assert_eq!(merge(&[], &b), b);
        assert_eq!(merge(&b[2..], &a), tids(&[(1, 1), (1, 3), (2, 2), (3, 1)]));
    }
}
