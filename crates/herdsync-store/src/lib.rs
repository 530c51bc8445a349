//! # herdsync-store
//!
//! Offline storage for herdsync.
//!
//! Everything persistent lives in one SQLite database (WAL mode) reached
//! through a shared, lazily-opened [`StoreConnection`]. On top of it sit two
//! disjoint owners: the collection cache (`kv_entries`, namespace
//! `collections`) and the operation log (`offline_operations`).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  QueryCache   (moka, TTL memoization)        │
//! ├──────────────────────────────────────────────┤
//! │  IndexedCache (field -> value -> id index)   │
//! │  LocalCache   (versioned, zlib when large)   │   OperationStore
//! │  KvStore      (namespaced, never fails)      │   (pending/processing/failed)
//! ├──────────────────────────────────────────────┤
//! │  StoreConnection (single-flight open)        │
//! │  Database (rusqlite WAL) + Migrations        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use herdsync_store::{CacheConfig, IndexedCache, LocalCache, StoreConnection};
//!
//! let conn = StoreConnection::file("data/herdsync.db");
//! let cache = LocalCache::new(conn.clone(), CacheConfig::default());
//! let animals: IndexedCache<Animal> = IndexedCache::new(cache, "animals");
//!
//! animals.set(&fetched, &["brinco"]).await;
//! let hit = animals.get_by_field("brinco", "BR-001").await;
//! ```

pub mod compression;
pub mod connection;
pub mod db;
pub mod error;
pub mod indexed_cache;
pub mod kv;
pub mod local_cache;
pub mod migration;
pub mod operation_store;
pub mod query_cache;

// ── re-exports ───────────────────────────────────────────────────────

pub use connection::{StorageTarget, StoreConnection};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use indexed_cache::{CacheRecord, IndexedCache};
pub use kv::KvStore;
pub use local_cache::{
    CacheConfig, CacheEntry, CacheStats, Encoding, EntryInfo, LocalCache, StoredEntry,
    StoredPayload,
};
pub use operation_store::{OperationCounts, OperationRecord, OperationStatus, OperationStore};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheStats};
