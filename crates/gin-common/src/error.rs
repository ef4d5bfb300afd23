//! Error types for the GIN index engine.

use thiserror::Error;

/// Result type alias using GinError.
pub type Result<T> = std::result::Result<T, GinError>;

/// Errors that can occur in index operations.
#[derive(Debug, Error)]
pub enum GinError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Corruption
    #[error("Page corrupted: {block}, reason: {reason}")]
    PageCorrupted { block: u32, reason: String },

    #[error("index \"{index}\" block {block}: {reason}. Please REINDEX it.")]
    IndexCorrupted {
        index: String,
        block: u32,
        reason: String,
    },

    #[error("Posting list corrupted: {0}")]
    PostingListCorrupted(String),

    #[error("Block {block} does not exist in relation of {nblocks} blocks")]
    BlockOutOfRange { block: u32, nblocks: u32 },

    // Contract violations
    #[error("Posting list overflow: {0}")]
    PostingListOverflow(String),

    #[error("index row size {size} exceeds maximum {max} for inverted index")]
    TupleTooLarge { size: usize, max: usize },

    #[error("Inverted index does not support unique indexes")]
    UniqueNotSupported,

    #[error("Invalid item pointer: ({block},{offset})")]
    InvalidTid { block: u32, offset: u16 },

    #[error("Unknown WAL record type: {0:#04x}")]
    UnknownWalRecord(u8),

    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    // Cancellation
    #[error("canceling statement due to user request")]
    QueryCanceled,

    #[error("Parallel worker failed: {0}")]
    ParallelWorkerFailed(String),

    #[error("Injected fault at {0}")]
    InjectedFault(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GinError {
    /// Returns true for errors that report on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            GinError::PageCorrupted { .. }
                | GinError::IndexCorrupted { .. }
                | GinError::PostingListCorrupted(_)
        )
    }

    /// Shorthand for building an `IndexCorrupted` error.
    pub fn corrupted(index: &str, block: u32, reason: impl Into<String>) -> Self {
        GinError::IndexCorrupted {
            index: index.to_string(),
            block,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: GinError = io_err.into();
        assert!(matches!(err, GinError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_index_corrupted_display() {
        let err = GinError::corrupted("idx_tags", 7, "line pointer points past end of tuple data");
        assert_eq!(
            err.to_string(),
            "index \"idx_tags\" block 7: line pointer points past end of tuple data. Please REINDEX it."
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = GinError::PageCorrupted {
            block: 3,
            reason: "invalid special size".to_string(),
        };
        assert_eq!(err.to_string(), "Page corrupted: 3, reason: invalid special size");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_contract_errors_display() {
        let err = GinError::TupleTooLarge { size: 3000, max: 2712 };
        assert_eq!(
            err.to_string(),
            "index row size 3000 exceeds maximum 2712 for inverted index"
        );
        assert!(!err.is_corruption());

        let err = GinError::UnknownWalRecord(0x90);
        assert_eq!(err.to_string(), "Unknown WAL record type: 0x90");

        let err = GinError::InvalidTid {
            block: 1,
            offset: 4000,
        };
        assert_eq!(err.to_string(), "Invalid item pointer: (1,4000)");
    }

    #[test]
    fn test_cancel_errors_display() {
        assert_eq!(
            GinError::QueryCanceled.to_string(),
            "canceling statement due to user request"
        );
        let err = GinError::InjectedFault("gin-leave-leaf-split-incomplete".to_string());
        assert_eq!(
            err.to_string(),
            "Injected fault at gin-leave-leaf-split-incomplete"
        );
    }

    #[test]
    fn test_config_errors_display() {
        let err = GinError::InvalidParameter {
            name: "pending_list_limit_kb".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: pending_list_limit_kb = 0");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<i32> {
            Err(GinError::Internal("test".to_string()))
        }
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GinError>();
    }
}
