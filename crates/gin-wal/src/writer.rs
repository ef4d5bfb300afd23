//! WAL writer for appending log records.

use crate::record::{LogRecord, Lsn, RecordBuilder};
use bytes::{Buf, Bytes};
use gin_common::{GinError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// LSN assigned to the first record.
const START_LSN: u64 = 64;

/// Configuration for the WAL writer.
#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    /// When false, records are numbered but not retained.
    pub enabled: bool,
    /// Optional log file receiving length-prefixed serialized records.
    pub wal_path: Option<PathBuf>,
    /// Enable fsync after each append to the log file.
    pub fsync_enabled: bool,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wal_path: None,
            fsync_enabled: false,
        }
    }
}

/// Thread-safe WAL writer.
///
/// Serialized records are kept in memory in LSN order and optionally
/// appended to a file.
pub struct WalWriter {
    config: WalWriterConfig,
    /// Next LSN to assign.
    next_lsn: AtomicU64,
    /// LSN of the last inserted record.
    last_lsn: AtomicU64,
    /// Serialized records.
    log: Mutex<Vec<Bytes>>,
    file: Mutex<Option<File>>,
}

impl WalWriter {
    /// Creates a new WAL writer.
    pub fn new(config: WalWriterConfig) -> Result<Self> {
        let file = match &config.wal_path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            next_lsn: AtomicU64::new(START_LSN),
            last_lsn: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            file: Mutex::new(file),
        })
    }

    /// In-memory writer with default settings.
    pub fn in_memory() -> Self {
        Self {
            config: WalWriterConfig::default(),
            next_lsn: AtomicU64::new(START_LSN),
            last_lsn: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            file: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Inserts a record built by `builder` on behalf of transaction `xid`.
    pub fn insert(&self, builder: RecordBuilder, xid: u32) -> Result<Lsn> {
        // The log mutex orders LSN assignment with the append.
        let mut log = self.log.lock();
        let prev = Lsn(self.last_lsn.load(Ordering::SeqCst));
        let provisional = builder.finish(Lsn::INVALID, prev, xid);
        let size = provisional.size_on_disk() as u64;
        let lsn = Lsn(self.next_lsn.fetch_add(size, Ordering::SeqCst));
        let record = LogRecord { lsn, ..provisional };
        self.last_lsn.store(lsn.0, Ordering::SeqCst);

        trace!(%lsn, kind = record.record_type.name(), size, "wal insert");
        if !self.config.enabled {
            return Ok(lsn);
        }

        let bytes = record.serialize();
        if let Some(file) = self.file.lock().as_mut() {
            file.write_all(&(bytes.len() as u32).to_le_bytes())?;
            file.write_all(&bytes)?;
            if self.config.fsync_enabled {
                file.sync_data()?;
            }
        }
        log.push(bytes);
        Ok(lsn)
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    /// Decodes every retained record with LSN >= `from`.
    pub fn records_from(&self, from: Lsn) -> Result<Vec<LogRecord>> {
        let log = self.log.lock();
        let mut out = Vec::new();
        for bytes in log.iter() {
            let record = LogRecord::deserialize(bytes)?;
            if record.lsn >= from {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Decodes every retained record.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.records_from(Lsn::INVALID)
    }

    /// Reads a log file written through `wal_path`.
    pub fn read_file(path: &Path) -> Result<Vec<LogRecord>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        let mut cur = &data[..];
        let mut out = Vec::new();
        while cur.has_remaining() {
            if cur.remaining() < 4 {
                return Err(GinError::WalCorrupted {
                    lsn: 0,
                    reason: "truncated length prefix".to_string(),
                });
            }
            let len = cur.get_u32_le() as usize;
            if cur.remaining() < len {
                return Err(GinError::WalCorrupted {
                    lsn: 0,
                    reason: "truncated record".to_string(),
                });
            }
            out.push(LogRecord::deserialize(&cur[..len])?);
            cur.advance(len);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("next_lsn", &self.next_lsn())
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GinRecordType;

    fn builder(kind: GinRecordType, block: u32) -> RecordBuilder {
        let mut b = RecordBuilder::new(kind);
        b.register_block(0, block, false).block_data(0, b"payload");
        b
    }

    #[test]
    fn test_lsns_increase() {
        let wal = WalWriter::in_memory();
        let a = wal.insert(builder(GinRecordType::Insert, 1), 5).unwrap();
        let b = wal.insert(builder(GinRecordType::Split, 2), 5).unwrap();
        assert!(a.is_valid());
        assert!(b > a);
        assert_eq!(wal.len(), 2);
        let recs = wal.records().unwrap();
        assert_eq!(recs[0].lsn, a);
        assert_eq!(recs[1].prev_lsn, a);
        assert_eq!(recs[1].record_type, GinRecordType::Split);
        assert_eq!(wal.records_from(b).unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_writer_still_numbers() {
        let wal = WalWriter::new(WalWriterConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        let a = wal.insert(builder(GinRecordType::Insert, 1), 1).unwrap();
        let b = wal.insert(builder(GinRecordType::Insert, 1), 1).unwrap();
        assert!(b > a);
        assert!(wal.is_empty());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gin.wal");
        let wal = WalWriter::new(WalWriterConfig {
            wal_path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        for i in 0..3 {
            wal.insert(builder(GinRecordType::InsertListPage, i), 9).unwrap();
        }
        let recs = WalWriter::read_file(&path).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[2].blocks[0].block, 2);
        assert_eq!(recs[2].xid, 9);
    }
}
