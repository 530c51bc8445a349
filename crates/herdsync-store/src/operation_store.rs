//! Durable log of mutations waiting to reach the backend.
//!
//! Each [`OperationRecord`] is one write captured while offline (or not
//! yet confirmed). Records move `pending -> processing -> {deleted |
//! pending | failed}`; only the offline queue drives those transitions.
//! Unlike the cache stores, every method here propagates its errors: a
//! queued write must never vanish silently.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::connection::StoreConnection;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for the next drain pass.
    Pending,
    /// Handed to an executor by the current drain pass.
    Processing,
    /// Retry budget exhausted or no executor; waits for manual action.
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    /// Whether the drain loop will ever pick this status up on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Corrupt {
                key: "offline_operations.status".into(),
                reason: format!("unknown status `{other}`"),
            }),
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// `{op_type}_{created_at}_{random}`; unique and stable.
    pub id: String,
    /// Application-defined kind, used to pick an executor.
    pub op_type: String,
    pub target_collection: String,
    pub target_document_id: Option<String>,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch at enqueue time.
    pub created_at: i64,
    pub retry_count: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

impl OperationRecord {
    /// Build a fresh pending record stamped with the current time.
    pub fn new(
        op_type: impl Into<String>,
        target_collection: impl Into<String>,
        payload: serde_json::Value,
        target_document_id: Option<String>,
    ) -> Self {
        let op_type = op_type.into();
        let created_at = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{op_type}_{created_at}_{}", &suffix[..9]),
            op_type,
            target_collection: target_collection.into(),
            target_document_id,
            payload,
            created_at,
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }
}

/// Number of records in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

impl OperationCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.failed
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  OperationStore
// ═══════════════════════════════════════════════════════════════════════

const SELECT_COLUMNS: &str = "SELECT id, op_type, target_collection, target_document_id, payload, \
     created_at, retry_count, status, last_error FROM offline_operations";

/// CRUD over the `offline_operations` table.
#[derive(Clone)]
pub struct OperationStore {
    conn: StoreConnection,
}

impl OperationStore {
    pub fn new(conn: StoreConnection) -> Self {
        Self { conn }
    }

    /// Persist a new record.
    #[instrument(skip(self, record), fields(id = %record.id, op_type = %record.op_type))]
    pub async fn insert(&self, record: &OperationRecord) -> StoreResult<()> {
        let db = self.conn.database().await?;
        let record = record.clone();
        let payload = serde_json::to_string(&record.payload)?;
        let now = Utc::now().timestamp_millis();

        db.execute(move |conn| {
            conn.execute(
                "INSERT INTO offline_operations (id, op_type, target_collection, target_document_id, \
                 payload, created_at, retry_count, status, last_error, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.id,
                    record.op_type,
                    record.target_collection,
                    record.target_document_id,
                    payload,
                    record.created_at,
                    record.retry_count,
                    record.status.as_str(),
                    record.last_error,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!("operation persisted");
        Ok(())
    }

    /// Fetch one record, `None` if it does not exist.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<OperationRecord>> {
        let db = self.conn.database().await?;
        let id = id.to_string();
        db.execute(move |conn| {
            let result = conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                rusqlite::params![id],
                OperationRow::from_row,
            );
            match result {
                Ok(row) => row.into_record().map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(StoreError::Sqlite(e)),
            }
        })
        .await
    }

    /// Write back status, retry count, and last error of `record`.
    #[instrument(skip(self, record), fields(id = %record.id, status = %record.status))]
    pub async fn update(&self, record: &OperationRecord) -> StoreResult<()> {
        let db = self.conn.database().await?;
        let id = record.id.clone();
        let status = record.status.as_str();
        let retry_count = record.retry_count;
        let last_error = record.last_error.clone();
        let now = Utc::now().timestamp_millis();

        db.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE offline_operations SET status = ?2, retry_count = ?3, last_error = ?4, \
                 updated_at = ?5 WHERE id = ?1",
                rusqlite::params![id, status, retry_count, last_error, now],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound {
                    entity: "operation",
                    id,
                });
            }
            Ok(())
        })
        .await
    }

    /// Remove one record. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let db = self.conn.database().await?;
        let id = id.to_string();
        db.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM offline_operations WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Records in `status`, oldest first; ties keep insertion order.
    #[instrument(skip(self))]
    pub async fn list_by_status(
        &self,
        status: OperationStatus,
        limit: Option<usize>,
    ) -> StoreResult<Vec<OperationRecord>> {
        let db = self.conn.database().await?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        db.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC, seq ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![status.as_str(), limit],
                    OperationRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(OperationRow::into_record).collect()
        })
        .await
    }

    /// Every record, oldest first.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> StoreResult<Vec<OperationRecord>> {
        let db = self.conn.database().await?;
        db.execute(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, seq ASC"))?;
            let rows = stmt
                .query_map([], OperationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(OperationRow::into_record).collect()
        })
        .await
    }

    /// Per-status record counts.
    pub async fn counts(&self) -> StoreResult<OperationCounts> {
        let db = self.conn.database().await?;
        db.execute(move |conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM offline_operations GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = OperationCounts::default();
            for (status, n) in rows {
                let n = n as usize;
                match OperationStatus::parse(&status)? {
                    OperationStatus::Pending => counts.pending = n,
                    OperationStatus::Processing => counts.processing = n,
                    OperationStatus::Failed => counts.failed = n,
                }
            }
            Ok(counts)
        })
        .await
    }

    /// Move every record in `from` to `to` without touching retry counts.
    /// Returns the number of records moved.
    #[instrument(skip(self))]
    pub async fn move_status(
        &self,
        from: OperationStatus,
        to: OperationStatus,
    ) -> StoreResult<usize> {
        let db = self.conn.database().await?;
        let now = Utc::now().timestamp_millis();
        db.execute(move |conn| {
            let moved = conn.execute(
                "UPDATE offline_operations SET status = ?2, updated_at = ?3 WHERE status = ?1",
                rusqlite::params![from.as_str(), to.as_str(), now],
            )?;
            Ok(moved)
        })
        .await
    }

    /// Reset every failed record to pending with a clean retry budget.
    #[instrument(skip(self))]
    pub async fn reset_failed(&self) -> StoreResult<usize> {
        let db = self.conn.database().await?;
        let now = Utc::now().timestamp_millis();
        db.execute(move |conn| {
            let reset = conn.execute(
                "UPDATE offline_operations SET status = 'pending', retry_count = 0, \
                 last_error = NULL, updated_at = ?1 WHERE status = 'failed'",
                rusqlite::params![now],
            )?;
            Ok(reset)
        })
        .await
    }

    /// Delete every record in `status`. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn delete_by_status(&self, status: OperationStatus) -> StoreResult<usize> {
        let db = self.conn.database().await?;
        db.execute(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM offline_operations WHERE status = ?1",
                rusqlite::params![status.as_str()],
            )?;
            Ok(deleted)
        })
        .await
    }

    /// Delete everything. Returns the number removed.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> StoreResult<usize> {
        let db = self.conn.database().await?;
        db.execute(move |conn| Ok(conn.execute("DELETE FROM offline_operations", [])?))
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal helpers
// ═══════════════════════════════════════════════════════════════════════

/// Raw row data before JSON/status parsing.
struct OperationRow {
    id: String,
    op_type: String,
    target_collection: String,
    target_document_id: Option<String>,
    payload: String,
    created_at: i64,
    retry_count: u32,
    status: String,
    last_error: Option<String>,
}

impl OperationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            op_type: row.get(1)?,
            target_collection: row.get(2)?,
            target_document_id: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            retry_count: row.get(6)?,
            status: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_record(self) -> StoreResult<OperationRecord> {
        Ok(OperationRecord {
            payload: serde_json::from_str(&self.payload)?,
            status: OperationStatus::parse(&self.status)?,
            id: self.id,
            op_type: self.op_type,
            target_collection: self.target_collection,
            target_document_id: self.target_document_id,
            created_at: self.created_at,
            retry_count: self.retry_count,
            last_error: self.last_error,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_store() -> OperationStore {
        OperationStore::new(StoreConnection::in_memory())
    }

    fn record(op_type: &str, doc: Option<&str>, created_at: i64) -> OperationRecord {
        let mut rec = OperationRecord::new(
            op_type,
            "animals",
            json!({"peso": 420}),
            doc.map(Into::into),
        );
        rec.created_at = created_at;
        rec
    }

    #[test]
    fn new_record_shape() {
        let rec = OperationRecord::new("update-animal", "animals", json!({}), Some("a1".into()));
        assert_eq!(rec.status, OperationStatus::Pending);
        assert_eq!(rec.retry_count, 0);
        assert!(rec.last_error.is_none());

        let parts: Vec<&str> = rec.id.splitn(3, '_').collect();
        assert_eq!(parts[0], "update-animal");
        assert_eq!(parts[1], rec.created_at.to_string());
        assert_eq!(parts[2].len(), 9);

        let other = OperationRecord::new("update-animal", "animals", json!({}), None);
        assert_ne!(rec.id, other.id);
    }

    #[tokio::test]
    async fn insert_get_delete() {
        let store = make_store();
        let rec = record("update-animal", Some("a1"), 1_000);

        store.insert(&rec).await.unwrap();
        assert_eq!(store.get(&rec.id).await.unwrap(), Some(rec.clone()));

        assert!(store.delete(&rec.id).await.unwrap());
        assert!(!store.delete(&rec.id).await.unwrap());
        assert!(store.get(&rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = make_store();
        let rec = record("create-animal", None, 1_000);
        store.insert(&rec).await.unwrap();
        assert!(matches!(
            store.insert(&rec).await,
            Err(StoreError::Sqlite(_))
        ));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = make_store();
        let rec = record("update-animal", None, 1_000);
        assert!(matches!(
            store.update(&rec).await,
            Err(StoreError::NotFound { entity: "operation", .. })
        ));
    }

    #[tokio::test]
    async fn pending_are_listed_oldest_first_with_stable_ties() {
        let store = make_store();
        let late = record("b", None, 3_000);
        let tie_first = record("c", None, 2_000);
        let tie_second = record("d", None, 2_000);
        let early = record("a", None, 1_000);

        for rec in [&late, &tie_first, &tie_second, &early] {
            store.insert(rec).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_by_status(OperationStatus::Pending, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![early.id, tie_first.id, tie_second.id, late.id]);

        let limited = store
            .list_by_status(OperationStatus::Pending, Some(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn counts_and_status_moves() {
        let store = make_store();
        let mut a = record("x", None, 1);
        let mut b = record("x", None, 2);
        let c = record("x", None, 3);
        for rec in [&a, &b, &c] {
            store.insert(rec).await.unwrap();
        }

        a.status = OperationStatus::Processing;
        store.update(&a).await.unwrap();
        b.status = OperationStatus::Failed;
        b.retry_count = 5;
        b.last_error = Some("timeout".into());
        store.update(&b).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            OperationCounts {
                pending: 1,
                processing: 1,
                failed: 1
            }
        );
        assert_eq!(counts.total(), 3);

        let moved = store
            .move_status(OperationStatus::Processing, OperationStatus::Pending)
            .await
            .unwrap();
        assert_eq!(moved, 1);

        assert_eq!(store.reset_failed().await.unwrap(), 1);
        let b = store.get(&b.id).await.unwrap().unwrap();
        assert_eq!(b.status, OperationStatus::Pending);
        assert_eq!(b.retry_count, 0);
        assert!(b.last_error.is_none());
        assert_eq!(store.counts().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn delete_by_status_and_clear() {
        let store = make_store();
        let mut failed = record("x", None, 1);
        store.insert(&failed).await.unwrap();
        store.insert(&record("x", None, 2)).await.unwrap();
        failed.status = OperationStatus::Failed;
        store.update(&failed).await.unwrap();

        assert_eq!(
            store.delete_by_status(OperationStatus::Failed).await.unwrap(),
            1
        );
        assert_eq!(store.list_all().await.unwrap().len(), 1);

        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(store.clear().await.unwrap(), 0);
        assert_eq!(store.counts().await.unwrap(), OperationCounts::default());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[test]
    fn status_round_trip_and_terminality() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Processing,
            OperationStatus::Failed,
        ] {
            assert_eq!(OperationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OperationStatus::parse("done").is_err());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
    }
}
