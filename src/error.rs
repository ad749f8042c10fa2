//! Error taxonomy for the memory engine.
//!
//! Every public operation returns [`Error`]. The only recoveries applied
//! internally are a bounded retry on [`StorageError::Locked`] and the opt-in
//! fallback embedding path; everything else propagates to the caller.

use thiserror::Error;

/// Top-level error type for all public operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input violates a documented constraint. Never retryable.
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// A recall exceeded its deadline. Partial results are discarded.
    #[error("query timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Lookup by id found nothing. `delete` reports this as `Ok(false)`
    /// instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation (non-unit embedding, index/table mismatch).
    /// Logged at error level and never silenced.
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database failed an integrity check or is unreadable. The store
    /// switches to read-only mode until an operator (or `recover`) replaces
    /// the file.
    #[error("database is corrupt: {0}")]
    Corrupt(String),

    /// The database was locked past the bounded retry window.
    #[error("database is locked")]
    Locked,

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("schema error: {0}")]
    Schema(String),
}

/// Embedding-layer failures. `Clone` lets one in-flight encode result fan
/// out to every de-duplicated waiter.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    /// Model load or forward pass failed.
    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The encoder is not (and will not become) ready. Recoverable only via
    /// the deterministic fallback mode, if the caller enabled it.
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, msg) => match f.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StorageError::Locked
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageError::Corrupt(msg.clone().unwrap_or_else(|| e.to_string()))
                }
                rusqlite::ErrorCode::ReadOnly
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::DiskFull
                | rusqlite::ErrorCode::SystemIoFailure => StorageError::Io(e.to_string()),
                _ => StorageError::Io(e.to_string()),
            },
            _ => StorageError::Io(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(StorageError::from(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(StorageError::Io(e.to_string()))
    }
}

impl StorageError {
    /// True when a short backoff-and-retry is worthwhile.
    pub fn is_locked(&self) -> bool {
        matches!(self, StorageError::Locked)
    }
}
