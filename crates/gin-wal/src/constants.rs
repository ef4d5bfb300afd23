//! WAL constants for record framing.

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Upper bound on a serialized record (a handful of page images plus data).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Maximum block references per record.
pub const MAX_BLOCK_REFS: usize = 32;

// Block reference flags

/// The page is initialized from scratch on redo.
pub const BLOCK_WILL_INIT: u8 = 0x01;

/// A full page image follows.
pub const BLOCK_HAS_IMAGE: u8 = 0x02;

/// Per-block redo data follows.
pub const BLOCK_HAS_DATA: u8 = 0x04;
