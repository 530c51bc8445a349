//! # herdsync-sync
//!
//! Offline operation queue for herdsync.
//!
//! Mutations made while the device is offline (or before the backend has
//! confirmed them) are persisted through
//! [`OperationStore`](herdsync_store::OperationStore) and replayed in
//! enqueue order by per-type [`OperationExecutor`]s once [`Connectivity`]
//! reports online. Failed deliveries back off exponentially and are parked
//! as `failed` once the retry budget is spent.
//!
//! ```ignore
//! use herdsync_store::StoreConnection;
//! use herdsync_sync::{Connectivity, OfflineQueue, QueueConfig};
//!
//! let connectivity = Connectivity::new(false);
//! let queue = OfflineQueue::new(StoreConnection::file("herdsync.db"), connectivity.clone(), QueueConfig::default());
//! queue.register_fn("update-animal", |op| async move { api.patch(&op).await });
//! let _listener = queue.start();
//!
//! queue.enqueue("update-animal", "animals", &patch, Some("a1")).await?;
//! connectivity.set_online(true); // drains automatically
//! ```

pub mod connectivity;
pub mod error;
pub mod executor;
pub mod queue;

pub use connectivity::Connectivity;
pub use error::{SyncError, SyncResult};
pub use executor::{ExecutorRegistry, OperationExecutor};
pub use queue::{
    DrainOutcome, DrainReport, OfflineQueue, OperationOutcome, QueueConfig, QueueStats,
    StatusSubscription,
};
