//! Error types for the offline queue.

use std::time::Duration;

use herdsync_store::StoreError;

/// Errors surfaced by [`OfflineQueue`](crate::OfflineQueue).
///
/// Executor failures are not returned to callers; they are recorded on the
/// operation (`last_error`) and drive the retry path. The executor variants
/// below exist to give those recorded diagnostics a stable wording.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The operation log could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An enqueue payload could not be serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// No executor is registered for the operation's type.
    #[error("no executor registered for operation type `{op_type}`")]
    ExecutorMissing { op_type: String },

    /// The executor did not finish within the configured timeout.
    #[error("executor for `{op_type}` timed out after {after:?}")]
    ExecutorTimeout { op_type: String, after: Duration },
}

/// Convenience alias used throughout the sync crate.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
