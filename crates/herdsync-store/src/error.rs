//! Error types for the herdsync-store crate.
//!
//! Fallible storage operations return [`StoreError`] via [`StoreResult`].
//! The read-path wrappers ([`KvStore`](crate::KvStore),
//! [`LocalCache`](crate::LocalCache)) never surface these to callers; they
//! log and degrade to a cache miss instead.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The storage backend could not be opened or is no longer usable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A compressed payload could not be encoded or decoded.
    #[error("compression error: {0}")]
    Compression(String),

    /// A stored value does not match the shape the reader expects.
    #[error("corrupt entry `{key}`: {reason}")]
    Corrupt { key: String, reason: String },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
