//! Write-ahead log records for the GIN index engine.
//!
//! Every page modification is described by a [`LogRecord`] before the page
//! is released; replaying the records in LSN order over an empty relation
//! reproduces the index.

pub mod constants;
pub mod record;
pub mod writer;

pub use record::{BlockRef, GinRecordType, LogRecord, Lsn, RecordBuilder};
pub use writer::{WalWriter, WalWriterConfig};
