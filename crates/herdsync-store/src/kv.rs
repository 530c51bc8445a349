//! Namespaced key-value store with best-effort semantics.
//!
//! Values are serialized to JSON text and kept in the `kv_entries` table,
//! scoped by namespace so independent owners never see each other's keys.
//!
//! Nothing here returns an error to the caller. If the storage backend is
//! unusable (disk full, file locked, schema missing) reads resolve to
//! `None`, writes become no-ops, and the failure is logged. The rest of the
//! system then runs in cache-miss mode instead of crashing.

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::connection::StoreConnection;
use crate::error::StoreResult;

/// Key-value view over one namespace of the shared store.
#[derive(Clone)]
pub struct KvStore {
    conn: StoreConnection,
    namespace: String,
}

impl KvStore {
    /// Create a store for `namespace` on the shared connection.
    pub fn new(conn: StoreConnection, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Open the underlying connection. Idempotent; concurrent callers share
    /// one attempt.
    pub async fn init(&self) -> StoreResult<()> {
        self.conn.init().await
    }

    /// Read and deserialize `key`. Any storage or decode error is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv value failed to decode, treating as miss");
                None
            }
        }
    }

    /// Read the stored JSON text for `key`.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv get failed, treating as miss");
                None
            }
        }
    }

    /// Serialize and store `value` under `key`. Returns whether the write
    /// reached storage.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(key, raw).await,
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv value failed to encode, skipping write");
                false
            }
        }
    }

    /// Store pre-serialized JSON text under `key`.
    pub async fn set_raw(&self, key: &str, raw: String) -> bool {
        match self.try_set(key, raw).await {
            Ok(()) => true,
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv set failed, write dropped");
                false
            }
        }
    }

    /// Remove `key`. Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv delete failed");
                false
            }
        }
    }

    /// Remove `key` only while it still holds `raw`. Returns `false` if the
    /// entry is gone or was rewritten since `raw` was read.
    pub async fn delete_if_unchanged(&self, key: &str, raw: &str) -> bool {
        match self.try_delete_if_unchanged(key, raw).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(namespace = %self.namespace, key, %err, "kv conditional delete failed");
                false
            }
        }
    }

    /// Remove every key in this namespace.
    pub async fn clear(&self) {
        if let Err(err) = self.try_clear().await {
            warn!(namespace = %self.namespace, %err, "kv clear failed");
        }
    }

    /// All `(key, raw JSON)` pairs in this namespace, ordered by key.
    pub async fn entries(&self) -> Vec<(String, String)> {
        match self.try_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(namespace = %self.namespace, %err, "kv scan failed, returning nothing");
                Vec::new()
            }
        }
    }

    // ── fallible internals ───────────────────────────────────────────

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn try_get(&self, key: &str) -> StoreResult<Option<String>> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        let key = key.to_string();
        db.execute(move |conn| {
            let result = conn.query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![namespace, key],
                |row| row.get(0),
            );
            match result {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    #[instrument(skip(self, raw), fields(namespace = %self.namespace, bytes = raw.len()))]
    async fn try_set(&self, key: &str, raw: String) -> StoreResult<()> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        db.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![namespace, key, raw, now],
            )?;
            debug!(key = %key, "kv entry written");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn try_delete(&self, key: &str) -> StoreResult<bool> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        let key = key.to_string();
        db.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![namespace, key],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    #[instrument(skip(self, raw), fields(namespace = %self.namespace))]
    async fn try_delete_if_unchanged(&self, key: &str, raw: &str) -> StoreResult<bool> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        let key = key.to_string();
        let raw = raw.to_string();
        db.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2 AND value = ?3",
                rusqlite::params![namespace, key, raw],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn try_clear(&self) -> StoreResult<()> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        db.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM kv_entries WHERE namespace = ?1",
                rusqlite::params![namespace],
            )?;
            debug!(namespace = %namespace, deleted, "kv namespace cleared");
            Ok(())
        })
        .await
    }

    async fn try_entries(&self) -> StoreResult<Vec<(String, String)>> {
        let db = self.conn.database().await?;
        let namespace = self.namespace.clone();
        db.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv_entries WHERE namespace = ?1 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![namespace], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
