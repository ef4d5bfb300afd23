//! Heap tuple identifiers.

use gin_common::page::{BlockNumber, INVALID_BLOCK, OffsetNumber};
use gin_common::{GinError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bits an offset occupies in the packed integer form.
pub const MAX_HEAP_OFFSET_BITS: u32 = 11;

/// Largest offset a posting list can store.
pub const MAX_HEAP_OFFSET: OffsetNumber = (1 << MAX_HEAP_OFFSET_BITS) - 1;

/// Offset marking a whole-page (lossy) pointer.
pub const LOSSY_OFFSET: OffsetNumber = 0xFFFF;

/// A heap tuple identifier: block number and 1-based line pointer offset.
///
/// Ordering is lexicographic on (block, offset). `(0, 0)` is the minimum and
/// doubles as the +infinity separator on rightmost posting-tree pages.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    /// On-page size: block as two 16-bit halves followed by the offset.
    pub const SIZE: usize = 6;

    pub const MIN: ItemPointer = ItemPointer {
        block: 0,
        offset: 0,
    };

    /// Sorts above every valid item pointer.
    pub const MAX: ItemPointer = ItemPointer {
        block: INVALID_BLOCK,
        offset: LOSSY_OFFSET,
    };

    #[inline]
    pub const fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    /// Lossy pointer covering every tuple of `block`.
    #[inline]
    pub const fn lossy_page(block: BlockNumber) -> Self {
        Self {
            block,
            offset: LOSSY_OFFSET,
        }
    }

    #[inline]
    pub fn is_lossy(&self) -> bool {
        self.offset == LOSSY_OFFSET
    }

    #[inline]
    pub fn is_min(&self) -> bool {
        self.block == 0 && self.offset == 0
    }

    /// A real tuple address: nonzero offset, not lossy.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.offset != 0 && self.offset != LOSSY_OFFSET
    }

    /// The item pointer just before this one on the same block.
    ///
    /// Used to express "everything strictly below `self`" as an
    /// advance-past position.
    #[inline]
    pub fn prev_offset(&self) -> Self {
        Self {
            block: self.block,
            offset: self.offset.saturating_sub(1),
        }
    }

    /// Integer form used by the varbyte codec: `block << 11 | offset`.
    pub fn pack(&self) -> Result<u64> {
        if self.offset > MAX_HEAP_OFFSET {
            return Err(GinError::InvalidTid {
                block: self.block,
                offset: self.offset,
            });
        }
        Ok(((self.block as u64) << MAX_HEAP_OFFSET_BITS) | self.offset as u64)
    }

    pub fn unpack(val: u64) -> Self {
        Self {
            block: (val >> MAX_HEAP_OFFSET_BITS) as BlockNumber,
            offset: (val & MAX_HEAP_OFFSET as u64) as OffsetNumber,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_to(&mut buf);
        buf
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        let hi = (self.block >> 16) as u16;
        let lo = (self.block & 0xFFFF) as u16;
        buf[0..2].copy_from_slice(&hi.to_le_bytes());
        buf[2..4].copy_from_slice(&lo.to_le_bytes());
        buf[4..6].copy_from_slice(&self.offset.to_le_bytes());
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let hi = u16::from_le_bytes([buf[0], buf[1]]) as u32;
        let lo = u16::from_le_bytes([buf[2], buf[3]]) as u32;
        Self {
            block: (hi << 16) | lo,
            offset: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Reads an array of raw item pointers.
pub fn read_item_pointers(buf: &[u8], count: usize) -> Vec<ItemPointer> {
    (0..count)
        .map(|i| ItemPointer::from_bytes(&buf[i * ItemPointer::SIZE..]))
        .collect()
}

/// Serializes an array of raw item pointers.
pub fn write_item_pointers(items: &[ItemPointer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * ItemPointer::SIZE);
    for item in items {
        out.extend_from_slice(&item.to_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = ItemPointer::new(1, 9);
        let b = ItemPointer::new(2, 1);
        let c = ItemPointer::new(2, 3);
        assert!(a < b && b < c);
        assert!(ItemPointer::MIN < a);
        assert!(c < ItemPointer::MAX);
        assert!(ItemPointer::lossy_page(2) > c);
        assert!(ItemPointer::lossy_page(2) < ItemPointer::new(3, 1));
    }

    #[test]
    fn test_pack_unpack() {
        let tid = ItemPointer::new(123_456, 2047);
        let packed = tid.pack().unwrap();
        assert_eq!(packed, (123_456u64 << 11) | 2047);
        assert_eq!(ItemPointer::unpack(packed), tid);
    }

    #[test]
    fn test_pack_rejects_large_offset() {
        let err = ItemPointer::new(1, 2048).pack().unwrap_err();
        assert!(matches!(err, GinError::InvalidTid { block: 1, offset: 2048 }));
        assert!(ItemPointer::lossy_page(5).pack().is_err());
    }

    #[test]
    fn test_byte_layout() {
        let tid = ItemPointer::new(0x0001_0002, 7);
        let bytes = tid.to_bytes();
        assert_eq!(bytes, [1, 0, 2, 0, 7, 0]);
        assert_eq!(ItemPointer::from_bytes(&bytes), tid);
    }

    #[test]
    fn test_validity() {
        assert!(!ItemPointer::MIN.is_valid());
        assert!(ItemPointer::MIN.is_min());
        assert!(ItemPointer::new(0, 1).is_valid());
        assert!(ItemPointer::lossy_page(4).is_lossy());
        assert!(!ItemPointer::lossy_page(4).is_valid());
        assert_eq!(ItemPointer::new(3, 5).prev_offset(), ItemPointer::new(3, 4));
    }

    #[test]
    fn test_item_pointer_arrays() {
        let items = vec![ItemPointer::new(1, 1), ItemPointer::new(70_000, 3)];
        let raw = write_item_pointers(&items);
        assert_eq!(raw.len(), 12);
        assert_eq!(read_item_pointers(&raw, 2), items);
    }
}
