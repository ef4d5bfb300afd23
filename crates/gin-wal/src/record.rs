//! WAL log record format.
//!
//! A record carries a record-type specific main payload and up to
//! [`MAX_BLOCK_REFS`] block references. Each block reference names a page
//! touched by the operation and may carry per-block data and a full image
//! of the page after the change.

use crate::constants::{
    BLOCK_HAS_DATA, BLOCK_HAS_IMAGE, BLOCK_WILL_INIT, CHECKSUM_SIZE, HEADER_SIZE, MAX_BLOCK_REFS,
    MAX_RECORD_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use gin_common::page::{BlockNumber, PAGE_SIZE};
use gin_common::{GinError, Result};
use serde::{Deserialize, Serialize};

/// Log Sequence Number - byte position of a record in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(0);

    /// First valid LSN.
    pub const FIRST: Lsn = Lsn(1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the LSN advanced by `bytes`.
    pub fn advance(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 as u32)
    }
}

/// Kinds of index WAL records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GinRecordType {
    /// Metapage and empty root leaf of a new index.
    CreateIndex = 0x00,
    /// Root leaf of a new posting tree.
    CreatePostingTree = 0x10,
    /// Insertion into an entry or data page, plus optional child split-flag clear.
    Insert = 0x20,
    /// Page split: both halves and optionally a new root.
    Split = 0x30,
    /// Entry page rewritten by vacuum.
    VacuumPage = 0x40,
    /// Posting-tree page unlinked and marked deleted.
    DeletePage = 0x50,
    /// Metapage update, optionally with a tail-page append.
    UpdateMetaPage = 0x60,
    /// New pending-list page.
    InsertListPage = 0x70,
    /// Pending-list head pages removed.
    DeleteListPage = 0x80,
    /// Posting-tree leaf recompressed by vacuum.
    VacuumDataLeafPage = 0x90,
}

impl GinRecordType {
    pub fn name(&self) -> &'static str {
        match self {
            GinRecordType::CreateIndex => "CREATE_INDEX",
            GinRecordType::CreatePostingTree => "CREATE_PTREE",
            GinRecordType::Insert => "INSERT",
            GinRecordType::Split => "SPLIT",
            GinRecordType::VacuumPage => "VACUUM_PAGE",
            GinRecordType::DeletePage => "DELETE_PAGE",
            GinRecordType::UpdateMetaPage => "UPDATE_META_PAGE",
            GinRecordType::InsertListPage => "INSERT_LISTPAGE",
            GinRecordType::DeleteListPage => "DELETE_LISTPAGE",
            GinRecordType::VacuumDataLeafPage => "VACUUM_DATA_LEAF_PAGE",
        }
    }
}

impl TryFrom<u8> for GinRecordType {
    type Error = GinError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(GinRecordType::CreateIndex),
            0x10 => Ok(GinRecordType::CreatePostingTree),
            0x20 => Ok(GinRecordType::Insert),
            0x30 => Ok(GinRecordType::Split),
            0x40 => Ok(GinRecordType::VacuumPage),
            0x50 => Ok(GinRecordType::DeletePage),
            0x60 => Ok(GinRecordType::UpdateMetaPage),
            0x70 => Ok(GinRecordType::InsertListPage),
            0x80 => Ok(GinRecordType::DeleteListPage),
            0x90 => Ok(GinRecordType::VacuumDataLeafPage),
            other => Err(GinError::UnknownWalRecord(other)),
        }
    }
}

/// A page referenced by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Caller-chosen slot number, unique within the record.
    pub id: u8,
    pub block: BlockNumber,
    /// The page is initialized from scratch during redo.
    pub will_init: bool,
    /// Image of the page after the change.
    pub image: Option<Bytes>,
    /// Per-block redo data.
    pub data: Bytes,
}

impl BlockRef {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.will_init {
            flags |= BLOCK_WILL_INIT;
        }
        if self.image.is_some() {
            flags |= BLOCK_HAS_IMAGE;
        }
        if !self.data.is_empty() {
            flags |= BLOCK_HAS_DATA;
        }
        flags
    }
}

/// A single log record in the WAL.
///
/// Record format:
/// - header (24 bytes):
///   - lsn: 8 bytes
///   - prev_lsn: 8 bytes
///   - xid: 4 bytes
///   - record_type: 1 byte
///   - info: 1 byte (record-type specific flags)
///   - nblocks: 1 byte
///   - reserved: 1 byte
/// - main_len: 4 bytes, main data
/// - per block: id (1), flags (1), block (4), image_len (2), data_len (4), image, data
/// - checksum: 4 bytes (CRC32 of everything before it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    /// Transaction that wrote the record.
    pub xid: u32,
    pub record_type: GinRecordType,
    pub info: u8,
    pub main_data: Bytes,
    pub blocks: Vec<BlockRef>,
}

impl LogRecord {
    /// Returns the block reference registered under `id`.
    pub fn block(&self, id: u8) -> Option<&BlockRef> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Returns the total size of this record when serialized.
    pub fn size_on_disk(&self) -> usize {
        HEADER_SIZE
            + 4
            + self.main_data.len()
            + self
                .blocks
                .iter()
                .map(|b| 12 + b.image.as_ref().map_or(0, |i| i.len()) + b.data.len())
                .sum::<usize>()
            + CHECKSUM_SIZE
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());

        buf.put_u64_le(self.lsn.0);
        buf.put_u64_le(self.prev_lsn.0);
        buf.put_u32_le(self.xid);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.info);
        buf.put_u8(self.blocks.len() as u8);
        buf.put_u8(0);

        buf.put_u32_le(self.main_data.len() as u32);
        buf.put_slice(&self.main_data);

        for b in &self.blocks {
            buf.put_u8(b.id);
            buf.put_u8(b.flags());
            buf.put_u32_le(b.block);
            buf.put_u16_le(b.image.as_ref().map_or(0, |i| i.len() as u16));
            buf.put_u32_le(b.data.len() as u32);
            if let Some(image) = &b.image {
                buf.put_slice(image);
            }
            buf.put_slice(&b.data);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserializes a record from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + 4 + CHECKSUM_SIZE {
            return Err(corrupted(0, "record too short"));
        }
        if data.len() > MAX_RECORD_SIZE {
            return Err(corrupted(0, format!("record too large: {}", data.len())));
        }

        let body_len = data.len() - CHECKSUM_SIZE;
        let stored_checksum = (&data[body_len..]).get_u32_le();
        let computed_checksum = crc32fast::hash(&data[..body_len]);

        let mut cur = &data[..body_len];
        let lsn = Lsn(cur.get_u64_le());
        if stored_checksum != computed_checksum {
            return Err(corrupted(
                lsn.0,
                format!("checksum mismatch: stored={stored_checksum}, computed={computed_checksum}"),
            ));
        }
        let prev_lsn = Lsn(cur.get_u64_le());
        let xid = cur.get_u32_le();
        let record_type = GinRecordType::try_from(cur.get_u8())?;
        let info = cur.get_u8();
        let nblocks = cur.get_u8() as usize;
        cur.advance(1);

        let main_len = cur.get_u32_le() as usize;
        let main_data = take(&mut cur, main_len, lsn, "main data")?;

        if nblocks > MAX_BLOCK_REFS {
            return Err(corrupted(lsn.0, format!("too many block references: {nblocks}")));
        }
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            if cur.remaining() < 12 {
                return Err(corrupted(lsn.0, "truncated block reference"));
            }
            let id = cur.get_u8();
            let flags = cur.get_u8();
            let block = cur.get_u32_le();
            let image_len = cur.get_u16_le() as usize;
            let data_len = cur.get_u32_le() as usize;
            let image = if flags & BLOCK_HAS_IMAGE != 0 {
                if image_len != PAGE_SIZE {
                    return Err(corrupted(lsn.0, format!("bad image length {image_len}")));
                }
                Some(take(&mut cur, image_len, lsn, "page image")?)
            } else {
                None
            };
            let data = take(&mut cur, data_len, lsn, "block data")?;
            blocks.push(BlockRef {
                id,
                block,
                will_init: flags & BLOCK_WILL_INIT != 0,
                image,
                data,
            });
        }
        if cur.has_remaining() {
            return Err(corrupted(lsn.0, "trailing bytes after record"));
        }

        Ok(Self {
            lsn,
            prev_lsn,
            xid,
            record_type,
            info,
            main_data,
            blocks,
        })
    }
}

fn corrupted(lsn: u64, reason: impl Into<String>) -> GinError {
    GinError::WalCorrupted {
        lsn,
        reason: reason.into(),
    }
}

fn take(cur: &mut &[u8], len: usize, lsn: Lsn, what: &str) -> Result<Bytes> {
    if cur.remaining() < len {
        return Err(corrupted(lsn.0, format!("truncated {what}")));
    }
    let out = Bytes::copy_from_slice(&cur[..len]);
    cur.advance(len);
    Ok(out)
}

/// Assembles a record before it is inserted into the log.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record_type: GinRecordType,
    info: u8,
    main_data: BytesMut,
    blocks: Vec<BlockRef>,
}

impl RecordBuilder {
    pub fn new(record_type: GinRecordType) -> Self {
        Self {
            record_type,
            info: 0,
            main_data: BytesMut::new(),
            blocks: Vec::new(),
        }
    }

    pub fn record_type(&self) -> GinRecordType {
        self.record_type
    }

    pub fn set_info(&mut self, info: u8) -> &mut Self {
        self.info = info;
        self
    }

    /// Appends bytes to the main payload.
    pub fn main_data(&mut self, data: &[u8]) -> &mut Self {
        self.main_data.put_slice(data);
        self
    }

    /// Registers a page under slot `id`.
    pub fn register_block(&mut self, id: u8, block: BlockNumber, will_init: bool) -> &mut Self {
        self.blocks.push(BlockRef {
            id,
            block,
            will_init,
            image: None,
            data: Bytes::new(),
        });
        self
    }

    /// Attaches per-block redo data to slot `id`.
    pub fn block_data(&mut self, id: u8, data: &[u8]) -> &mut Self {
        if let Some(b) = self.blocks.iter_mut().find(|b| b.id == id) {
            let mut buf = BytesMut::from(&b.data[..]);
            buf.put_slice(data);
            b.data = buf.freeze();
        }
        self
    }

    /// Attaches a full page image to slot `id`.
    pub fn block_image(&mut self, id: u8, page: &[u8]) -> &mut Self {
        if let Some(b) = self.blocks.iter_mut().find(|b| b.id == id) {
            b.image = Some(Bytes::copy_from_slice(page));
        }
        self
    }

    pub fn registered_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks.iter().map(|b| b.block)
    }

    /// Finishes the record with the LSNs and transaction assigned by the writer.
    pub fn finish(self, lsn: Lsn, prev_lsn: Lsn, xid: u32) -> LogRecord {
        LogRecord {
            lsn,
            prev_lsn,
            xid,
            record_type: self.record_type,
            info: self.info,
            main_data: self.main_data.freeze(),
            blocks: self.blocks,
        }
    }
}
