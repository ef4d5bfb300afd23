//! Per-relation buffer pool with pinned, latchable buffers.
//!
//! A [`Buffer`] is a pin on one frame. Content latches are taken and
//! released on the buffer independently of the pin, so a caller can keep a
//! page pinned (preventing recycling) while not holding its latch.

use crate::frame::{BufferFrame, PageBuf, zeroed_page};
use gin_common::page::{BlockNumber, PAGE_SIZE};
use gin_common::{GinError, Result};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Content latch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Share,
    Exclusive,
}

enum LockState {
    Unlocked,
    Share(ArcRwLockReadGuard<RawRwLock, PageBuf>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, PageBuf>),
}

/// Buffer pool for a single relation.
///
/// Pages live in memory for the lifetime of the pool; persistence is handled
/// by [`crate::disk::DiskManager`] which snapshots and restores whole pools.
pub struct BufferPool {
    /// Relation name, used in error and log messages.
    name: String,
    /// Frames indexed by block number.
    frames: RwLock<Vec<Arc<BufferFrame>>>,
    /// Serializes relation extension.
    extend_lock: Mutex<()>,
    reads: AtomicU64,
    extends: AtomicU64,
}

impl BufferPool {
    /// Creates an empty relation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: RwLock::new(Vec::new()),
            extend_lock: Mutex::new(()),
            reads: AtomicU64::new(0),
            extends: AtomicU64::new(0),
        }
    }

    /// Creates a relation from existing page images.
    pub fn from_pages(name: impl Into<String>, pages: Vec<PageBuf>) -> Self {
        let pool = Self::new(name);
        {
            let mut frames = pool.frames.write();
            for (i, page) in pages.into_iter().enumerate() {
                frames.push(Arc::new(BufferFrame::new(i as BlockNumber, page)));
            }
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of blocks in the relation.
    pub fn nblocks(&self) -> BlockNumber {
        self.frames.read().len() as BlockNumber
    }

    /// Pins an existing block. The returned buffer is unlocked.
    pub fn read_buffer(&self, block: BlockNumber) -> Result<Buffer> {
        let frame = {
            let frames = self.frames.read();
            frames
                .get(block as usize)
                .cloned()
                .ok_or(GinError::BlockOutOfRange {
                    block,
                    nblocks: frames.len() as BlockNumber,
                })?
        };
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::pin(frame))
    }

    /// Appends a zeroed block and returns it pinned and unlocked.
    pub fn extend(&self) -> Result<Buffer> {
        let _guard = self.extend_lock.lock();
        let mut frames = self.frames.write();
        let block = frames.len() as BlockNumber;
        if block == gin_common::INVALID_BLOCK {
            return Err(GinError::Internal(format!(
                "cannot extend relation \"{}\" beyond {} blocks",
                self.name, block
            )));
        }
        let frame = Arc::new(BufferFrame::new(block, zeroed_page()));
        frames.push(frame.clone());
        self.extends.fetch_add(1, Ordering::Relaxed);
        Ok(Buffer::pin(frame))
    }

    /// Ensures the relation has at least `nblocks` blocks, zero-filling.
    pub fn ensure_blocks(&self, nblocks: BlockNumber) {
        let _guard = self.extend_lock.lock();
        let mut frames = self.frames.write();
        while (frames.len() as BlockNumber) < nblocks {
            let block = frames.len() as BlockNumber;
            frames.push(Arc::new(BufferFrame::new(block, zeroed_page())));
        }
    }

    /// Copies every page under a share latch.
    pub fn snapshot(&self) -> Vec<PageBuf> {
        let frames: Vec<_> = self.frames.read().iter().cloned().collect();
        frames.iter().map(|f| f.copy_page()).collect()
    }

    /// Calls `f` for every dirty page and clears its dirty flag.
    pub fn flush_all<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(BlockNumber, &[u8; PAGE_SIZE]) -> Result<()>,
    {
        let frames: Vec<_> = self.frames.read().iter().cloned().collect();
        let mut flushed = 0;
        for frame in frames {
            if frame.is_dirty() {
                let data = frame.latch().read();
                f(frame.block(), &**data)?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Returns statistics about the pool.
    pub fn stats(&self) -> BufferPoolStats {
        let frames = self.frames.read();
        BufferPoolStats {
            nblocks: frames.len(),
            pinned_frames: frames.iter().filter(|f| f.is_pinned()).count(),
            dirty_frames: frames.iter().filter(|f| f.is_dirty()).count(),
            reads: self.reads.load(Ordering::Relaxed),
            extends: self.extends.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("nblocks", &self.nblocks())
            .finish()
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub nblocks: usize,
    pub pinned_frames: usize,
    pub dirty_frames: usize,
    /// Buffer reads since creation.
    pub reads: u64,
    /// Relation extensions since creation.
    pub extends: u64,
}

/// A pinned page, optionally latched.
///
/// Dropping the buffer releases the latch first and then the pin.
pub struct Buffer {
    frame: Arc<BufferFrame>,
    lock: LockState,
}

impl Buffer {
    fn pin(frame: Arc<BufferFrame>) -> Self {
        frame.pin();
        Self {
            frame,
            lock: LockState::Unlocked,
        }
    }

    /// Takes an additional pin on the same page. The new buffer is unlocked.
    pub fn clone_pin(&self) -> Buffer {
        Buffer::pin(self.frame.clone())
    }

    #[inline]
    pub fn block(&self) -> BlockNumber {
        self.frame.block()
    }

    /// Acquires the content latch. Any latch already held is released first.
    pub fn lock(&mut self, mode: LockMode) {
        self.unlock();
        self.lock = match mode {
            LockMode::Share => LockState::Share(self.frame.latch().read_arc()),
            LockMode::Exclusive => LockState::Exclusive(self.frame.latch().write_arc()),
        };
    }

    /// Tries to acquire the exclusive latch without waiting.
    pub fn try_lock_exclusive(&mut self) -> bool {
        self.unlock();
        match self.frame.latch().try_write_arc() {
            Some(guard) => {
                self.lock = LockState::Exclusive(guard);
                true
            }
            None => false,
        }
    }

    /// Takes the exclusive latch and waits until this is the only pin.
    pub fn lock_for_cleanup(&mut self) {
        loop {
            self.lock(LockMode::Exclusive);
            if self.frame.pin_count() <= 1 {
                return;
            }
            self.unlock();
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Releases the content latch, keeping the pin.
    pub fn unlock(&mut self) {
        self.lock = LockState::Unlocked;
    }

    pub fn is_locked(&self) -> bool {
        !matches!(self.lock, LockState::Unlocked)
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.lock, LockState::Exclusive(_))
    }

    /// Page bytes. Requires a latch.
    pub fn page(&self) -> &[u8] {
        match &self.lock {
            LockState::Share(g) => &g[..],
            LockState::Exclusive(g) => &g[..],
            LockState::Unlocked => {
                panic!("block {} accessed without a content latch", self.block())
            }
        }
    }

    /// Mutable page bytes. Requires the exclusive latch.
    pub fn page_mut(&mut self) -> &mut [u8] {
        let block = self.block();
        match &mut self.lock {
            LockState::Exclusive(g) => &mut g[..],
            _ => panic!("block {block} modified without an exclusive latch"),
        }
    }

    /// Records that the page was modified.
    pub fn mark_dirty(&self) {
        self.frame.set_dirty(true);
    }

    /// Current number of pins on the page, including this one.
    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.lock = LockState::Unlocked;
        self.frame.unpin();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.lock {
            LockState::Unlocked => "unlocked",
            LockState::Share(_) => "share",
            LockState::Exclusive(_) => "exclusive",
        };
        f.debug_struct("Buffer")
            .field("block", &self.block())
            .field("lock", &mode)
            .finish()
    }
}
