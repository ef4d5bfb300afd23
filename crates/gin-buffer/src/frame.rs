//! Buffer frame management.

use gin_common::page::{BlockNumber, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Page-sized byte buffer.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Allocates a zeroed page buffer.
pub fn zeroed_page() -> PageBuf {
    Box::new([0u8; PAGE_SIZE])
}

/// A frame in the buffer pool holding a single page of one relation.
///
/// Each frame contains:
/// - The page bytes behind a reader-writer latch
/// - A pin count; a pinned frame cannot be recycled or cleanup-locked
/// - A dirty flag cleared when the page is written out
pub struct BufferFrame {
    /// Block number this frame holds.
    block: BlockNumber,
    /// Page data, latched through owned guards so latches outlive borrows.
    data: Arc<RwLock<PageBuf>>,
    /// Number of users currently holding the page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since the last flush.
    is_dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a frame holding `data`.
    pub fn new(block: BlockNumber, data: PageBuf) -> Self {
        Self {
            block,
            data: Arc::new(RwLock::new(data)),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Returns the latch protecting the page.
    #[inline]
    pub fn latch(&self) -> &Arc<RwLock<PageBuf>> {
        &self.data
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count.
    ///
    /// Returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Copies the page under a share latch.
    pub fn copy_page(&self) -> PageBuf {
        let guard = self.data.read();
        let mut out = zeroed_page();
        out.copy_from_slice(&guard[..]);
        out
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("block", &self.block)
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = BufferFrame::new(3, zeroed_page());
        assert_eq!(frame.block(), 3);
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_pin_unpin() {
        let frame = BufferFrame::new(0, zeroed_page());
        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert!(frame.is_pinned());
        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_copy_page() {
        let frame = BufferFrame::new(1, zeroed_page());
        frame.latch().write()[10] = 0xAB;
        let copy = frame.copy_page();
        assert_eq!(copy[10], 0xAB);
    }

    #[test]
    fn test_debug_format() {
        let frame = BufferFrame::new(9, zeroed_page());
        frame.set_dirty(true);
        let s = format!("{:?}", frame);
        assert!(s.contains("block: 9"));
        assert!(s.contains("is_dirty: true"));
    }
}
