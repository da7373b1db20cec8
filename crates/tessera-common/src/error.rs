//! Error types for Tessera.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur in Tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    // Page store errors
    #[error("Page {page_id} is in use")]
    PageInUse { page_id: PageId },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    CorruptPage { page_id: PageId, reason: String },

    #[error("Source page {page_id} could not be resolved")]
    MissingSourcePage { page_id: PageId },

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Structural operation errors
    #[error("Operation aborted: {reason}")]
    OperationAborted { reason: String },

    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Invalid entry size: expected {expected}, got {actual}")]
    InvalidEntrySize { expected: usize, actual: usize },

    // WAL errors
    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    #[error("WAL is closed")]
    WalClosed,

    #[error("Cannot truncate WAL before {requested}: latest checkpoint is {checkpoint}")]
    TruncateBeyondCheckpoint { requested: u64, checkpoint: u64 },

    #[error("Recovery failed at LSN {lsn} ({record_type} on page {page_id}): {source}")]
    RecoveryFailed {
        lsn: u64,
        page_id: PageId,
        record_type: String,
        #[source]
        source: Box<TesseraError>,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns true for lock contention and aborts that the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::PageInUse { .. } | TesseraError::OperationAborted { .. }
        )
    }

    /// Returns true for conditions that must halt replay and reach the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TesseraError::CorruptPage { .. }
                | TesseraError::MissingSourcePage { .. }
                | TesseraError::WalCorrupted { .. }
                | TesseraError::RecoveryFailed { .. }
        )
    }

    /// Shorthand for an aborted operation.
    pub fn aborted(reason: impl Into<String>) -> Self {
        TesseraError::OperationAborted {
            reason: reason.into(),
        }
    }

    /// Shorthand for a corrupt page.
    pub fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        TesseraError::CorruptPage {
            page_id,
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
        let err: TesseraError = io_err.into();
        assert!(matches!(err, TesseraError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_errors_display() {
        let err = TesseraError::PageInUse {
            page_id: PageId::new(1, 42),
        };
        assert_eq!(err.to_string(), "Page 1:42 is in use");

        let err = TesseraError::CorruptPage {
            page_id: PageId::new(0, 100),
            reason: "invalid checksum".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Page corrupted: 0:100, reason: invalid checksum"
        );

        let err = TesseraError::MissingSourcePage {
            page_id: PageId::new(2, 7),
        };
        assert_eq!(err.to_string(), "Source page 2:7 could not be resolved");
    }

    #[test]
    fn test_recovery_failed_carries_context() {
        let err = TesseraError::RecoveryFailed {
            lsn: 4096,
            page_id: PageId::new(3, 9),
            record_type: "InnerReplace".to_string(),
            source: Box::new(TesseraError::MissingSourcePage {
                page_id: PageId::new(3, 11),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("InnerReplace"));
        assert!(text.contains("3:9"));
        assert!(text.contains("3:11"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_retryable_and_fatal_classes() {
        assert!(TesseraError::aborted("lock timeout").is_retryable());
        assert!(TesseraError::PageInUse {
            page_id: PageId::new(0, 1)
        }
        .is_retryable());
        assert!(!TesseraError::IoFailure("disk".to_string()).is_retryable());

        assert!(TesseraError::corrupt(PageId::new(0, 1), "bad").is_fatal());
        assert!(!TesseraError::aborted("x").is_fatal());
        assert!(!TesseraError::IoFailure("disk".to_string()).is_fatal());
    }

    #[test]
    fn test_wal_errors_display() {
        let err = TesseraError::WalCorrupted {
            lsn: 12345,
            reason: "truncated record".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "WAL corrupted at LSN 12345: truncated record"
        );

        let err = TesseraError::TruncateBeyondCheckpoint {
            requested: 10,
            checkpoint: 5,
        };
        assert!(err.to_string().contains("latest checkpoint is 5"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TesseraError>();
    }
}
