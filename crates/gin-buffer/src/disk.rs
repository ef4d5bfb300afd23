//! Disk manager for relation files.
//!
//! Each relation is stored as one file of consecutive pages. Pages are
//! checksummed on write and verified on read.

use crate::frame::{PageBuf, zeroed_page};
use crate::pool::BufferPool;
use gin_common::page::{BlockNumber, PAGE_SIZE, page_checksum, page_is_all_zero, set_page_checksum};
use gin_common::{GinError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for relation files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Computes the 16-bit page checksum with the checksum field zeroed.
pub fn compute_checksum(page: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..8]);
    hasher.update(&[0, 0]);
    hasher.update(&page[10..]);
    let crc = hasher.finalize();
    let folded = (crc ^ (crc >> 16)) as u16;
    // Zero is reserved for "never checksummed".
    if folded == 0 { 1 } else { folded }
}

/// Reads and writes relation files.
pub struct DiskManager {
    config: DiskManagerConfig,
    files: Mutex<HashMap<String, File>>,
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(format!("{name}.rel"))
    }

    fn with_file<T>(&self, name: &str, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(name) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.file_path(name))?;
            files.insert(name.to_string(), file);
        }
        let file = files
            .get_mut(name)
            .ok_or_else(|| GinError::Internal(format!("relation file {name} not open")))?;
        f(file)
    }

    /// Writes one page, stamping its checksum.
    pub fn write_page(&self, name: &str, block: BlockNumber, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut page = zeroed_page();
        page.copy_from_slice(data);
        if !page_is_all_zero(&page[..]) {
            let checksum = compute_checksum(&page[..]);
            set_page_checksum(&mut page[..], checksum);
        }
        let fsync = self.config.fsync_enabled;
        self.with_file(name, |file| {
            file.seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))?;
            file.write_all(&page[..])?;
            if fsync {
                file.sync_all()?;
            }
            Ok(())
        })
    }

    /// Reads one page and verifies its checksum.
    pub fn read_page(&self, name: &str, block: BlockNumber) -> Result<PageBuf> {
        let mut page = zeroed_page();
        self.with_file(name, |file| {
            file.seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))?;
            file.read_exact(&mut page[..])?;
            Ok(())
        })?;
        let stored = page_checksum(&page[..]);
        if !page_is_all_zero(&page[..]) && stored != compute_checksum(&page[..]) {
            return Err(GinError::PageCorrupted {
                block,
                reason: format!("checksum mismatch: stored {stored:#06x}"),
            });
        }
        Ok(page)
    }

    /// Number of pages in a relation file.
    pub fn num_pages(&self, name: &str) -> Result<BlockNumber> {
        self.with_file(name, |file| {
            Ok((file.metadata()?.len() / PAGE_SIZE as u64) as BlockNumber)
        })
    }

    /// Writes every dirty page of `pool` and extends the file to its length.
    pub fn flush_pool(&self, pool: &BufferPool) -> Result<usize> {
        let name = pool.name().to_string();
        let flushed = pool.flush_all(|block, data| self.write_page(&name, block, data))?;
        let nblocks = pool.nblocks();
        self.with_file(&name, |file| {
            let want = nblocks as u64 * PAGE_SIZE as u64;
            if file.metadata()?.len() < want {
                file.set_len(want)?;
            }
            Ok(())
        })?;
        debug!(relation = %name, flushed, nblocks, "flushed relation");
        Ok(flushed)
    }

    /// Loads a relation file into a new buffer pool.
    pub fn load_pool(&self, name: &str) -> Result<BufferPool> {
        let nblocks = self.num_pages(name)?;
        let mut pages = Vec::with_capacity(nblocks as usize);
        for block in 0..nblocks {
            pages.push(self.read_page(name, block)?);
        }
        Ok(BufferPool::from_pages(name, pages))
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for file in files.values() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Closes and removes a relation file.
    pub fn delete_relation(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
