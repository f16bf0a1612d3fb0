//! Error types for karst.

use thiserror::Error;

/// Result type alias using KarstError.
pub type Result<T> = std::result::Result<T, KarstError>;

/// Errors that can occur in karst operations.
#[derive(Debug, Error)]
pub enum KarstError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database file has no free pages left")]
    OutOfSpace,

    #[error("buffer pool exhausted, every frame is pinned")]
    PoolExhausted,

    #[error("page not resident: {0}")]
    PageNotResident(i32),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("corrupted page {page_id}: {reason}")]
    Corruption { page_id: i32, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}
