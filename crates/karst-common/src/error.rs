//! Error types for the karst storage engine.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using KarstError.
pub type Result<T> = std::result::Result<T, KarstError>;

/// Errors surfaced by the storage engine core.
///
/// Benign outcomes (duplicate key on insert, missing key on lookup or
/// removal) are reported through return values, not through this enum.
#[derive(Debug, Error)]
pub enum KarstError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Disk manager errors
    #[error("page not found on disk: {page_id}")]
    PageNotFound { page_id: PageId },

    // Buffer pool errors
    #[error("buffer pool full: every frame is pinned")]
    BufferPoolFull,

    #[error("page not resident in buffer pool: {page_id}")]
    PageNotResident { page_id: PageId },

    #[error("unpin of {page_id} with pin count already zero")]
    PageNotPinned { page_id: PageId },

    #[error("cannot delete {page_id}: page is pinned")]
    PagePinned { page_id: PageId },

    // Index errors
    #[error("invalid node type tag: {tag}")]
    InvalidNodeType { tag: u8 },

    #[error("header page full, cannot record index {name}")]
    HeaderPageFull { name: String },

    #[error("b+tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("write-ahead log error: {0}")]
    LogFlush(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KarstError = io_err.into();
        assert!(matches!(err, KarstError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_not_found_display() {
        let err = KarstError::PageNotFound {
            page_id: PageId(42),
        };
        assert_eq!(err.to_string(), "page not found on disk: page:42");
    }

    #[test]
    fn test_buffer_pool_full_display() {
        let err = KarstError::BufferPoolFull;
        assert_eq!(err.to_string(), "buffer pool full: every frame is pinned");
    }

    #[test]
    fn test_pin_errors_display() {
        let err = KarstError::PageNotResident {
            page_id: PageId(3),
        };
        assert_eq!(err.to_string(), "page not resident in buffer pool: page:3");

        let err = KarstError::PageNotPinned {
            page_id: PageId(3),
        };
        assert_eq!(err.to_string(), "unpin of page:3 with pin count already zero");

        let err = KarstError::PagePinned {
            page_id: PageId(9),
        };
        assert_eq!(err.to_string(), "cannot delete page:9: page is pinned");
    }

    #[test]
    fn test_index_errors_display() {
        let err = KarstError::InvalidNodeType { tag: 99 };
        assert_eq!(err.to_string(), "invalid node type tag: 99");

        let err = KarstError::HeaderPageFull {
            name: "users_pk".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "header page full, cannot record index users_pk"
        );

        let err = KarstError::TreeCorrupted("dangling child".to_string());
        assert_eq!(err.to_string(), "b+tree corrupted: dangling child");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(KarstError::BufferPoolFull)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KarstError>();
    }
}
