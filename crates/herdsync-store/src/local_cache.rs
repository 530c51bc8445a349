//! Versioned, optionally compressed cache of whole collections.
//!
//! Each collection is stored as a single [`StoredEntry`] in the
//! `collections` namespace of the key-value store. An entry is only served
//! back if its `version` matches [`CacheConfig::version`]; bumping the
//! configured version therefore turns every existing entry into a miss and
//! forces a cold re-fetch without any migration code.
//!
//! The cache never refreshes itself. Callers read an entry, check
//! [`LocalCache::is_fresh`] on its timestamp, and decide whether to serve
//! it as-is while re-fetching in the background.
//!
//! Payloads at or above [`CacheConfig::compression_threshold`] bytes of JSON
//! are zlib-compressed. The on-disk shape is a tagged union keyed by an
//! explicit `encoding` field:
//!
//! ```text
//! {"key":"animals","timestamp":..,"version":1,
//!  "payload":{"encoding":"raw","data":[..]}}
//! {"key":"animals","timestamp":..,"version":1,
//!  "payload":{"encoding":"compressed","blob":"eJy..","original_size":4096,"compressed_size":812}}
//! ```

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compression;
use crate::connection::StoreConnection;
use crate::error::StoreResult;
use crate::kv::KvStore;

/// Namespace the collection cache owns in the key-value store.
pub const COLLECTIONS_NAMESPACE: &str = "collections";

// ── configuration ────────────────────────────────────────────────────

/// Tunables for [`LocalCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Payload schema version. Entries written under another version read
    /// as absent.
    pub version: u32,
    /// How long an entry counts as fresh, in minutes.
    pub expiry_minutes: u64,
    /// Whether large payloads are compressed at all.
    pub compression: bool,
    /// Serialized size, in bytes, at which compression kicks in.
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: 1,
            expiry_minutes: 30,
            compression: true,
            compression_threshold: 1024,
        }
    }
}

impl CacheConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_minutes.saturating_mul(60))
    }
}

// ── stored and returned shapes ───────────────────────────────────────

/// Persisted form of one cached collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp: i64,
    pub version: u32,
    pub payload: StoredPayload,
}

/// How the collection data is encoded on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum StoredPayload {
    Raw {
        data: serde_json::Value,
    },
    Compressed {
        /// Base64 zlib stream of the JSON text.
        blob: String,
        original_size: usize,
        compressed_size: usize,
    },
}

impl StoredPayload {
    fn decode<T: DeserializeOwned>(self) -> StoreResult<T> {
        match self {
            Self::Raw { data } => Ok(serde_json::from_value(data)?),
            Self::Compressed { blob, .. } => {
                let json = compression::decompress(&blob)?;
                Ok(serde_json::from_str(&json)?)
            }
        }
    }

    fn encoding(&self) -> Encoding {
        match self {
            Self::Raw { .. } => Encoding::Raw,
            Self::Compressed { .. } => Encoding::Compressed,
        }
    }
}

/// A collection served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub timestamp: i64,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Raw,
    Compressed,
}

/// Storage metadata for one entry, read without decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub timestamp: i64,
    pub version: u32,
    pub encoding: Encoding,
    /// Size of the uncompressed JSON, when known.
    pub original_size: Option<usize>,
    /// Size of the compressed blob, when compressed.
    pub compressed_size: Option<usize>,
}

/// Aggregate figures over everything in the collection namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    /// Approximate bytes used, measured as stored JSON text.
    pub total_size_bytes: usize,
    pub oldest_timestamp: Option<i64>,
}

// ── cache ────────────────────────────────────────────────────────────

/// Collection cache over the shared key-value store.
#[derive(Clone)]
pub struct LocalCache {
    kv: KvStore,
    config: CacheConfig,
}

impl LocalCache {
    pub fn new(conn: StoreConnection, config: CacheConfig) -> Self {
        Self {
            kv: KvStore::new(conn, COLLECTIONS_NAMESPACE),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a collection. `None` when absent, written under another
    /// version, or undecodable.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let stored: StoredEntry = self.kv.get(key).await?;

        if stored.version != self.config.version {
            debug!(
                key,
                stored = stored.version,
                current = self.config.version,
                "cache entry has stale version, treating as miss"
            );
            return None;
        }

        let StoredEntry {
            key: stored_key,
            timestamp,
            version,
            payload,
        } = stored;

        match payload.decode::<T>() {
            Ok(data) => {
                debug!(key, "cache hit");
                Some(CacheEntry {
                    key: stored_key,
                    data,
                    timestamp,
                    version,
                })
            }
            Err(err) => {
                warn!(key, %err, "cache payload failed to decode, treating as miss");
                None
            }
        }
    }

    /// Store a collection, compressing it when large enough. Returns whether
    /// the entry reached storage.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> bool {
        let payload = match self.encode(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, %err, "cache payload failed to encode, skipping write");
                return false;
            }
        };

        if let StoredPayload::Compressed {
            original_size,
            compressed_size,
            ..
        } = &payload
        {
            debug!(key, original_size, compressed_size, "cache payload compressed");
        }

        let entry = StoredEntry {
            key: key.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            version: self.config.version,
            payload,
        };
        self.kv.set(key, &entry).await
    }

    /// Describe how `key` is stored, regardless of its version.
    pub async fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let stored: StoredEntry = self.kv.get(key).await?;
        let (original_size, compressed_size) = match &stored.payload {
            StoredPayload::Raw { .. } => (None, None),
            StoredPayload::Compressed {
                original_size,
                compressed_size,
                ..
            } => (Some(*original_size), Some(*compressed_size)),
        };
        Some(EntryInfo {
            encoding: stored.payload.encoding(),
            key: stored.key,
            timestamp: stored.timestamp,
            version: stored.version,
            original_size,
            compressed_size,
        })
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.kv.delete(key).await
    }

    pub async fn clear(&self) {
        self.kv.clear().await;
        info!("collection cache cleared");
    }

    /// Whether a timestamp is still inside the freshness window.
    pub fn is_fresh(&self, timestamp: i64) -> bool {
        self.is_fresh_at(timestamp, Utc::now().timestamp_millis())
    }

    /// [`LocalCache::is_fresh`] against an explicit `now`. The window is
    /// half-open: an entry exactly `expiry` old is stale.
    pub fn is_fresh_at(&self, timestamp: i64, now: i64) -> bool {
        now.saturating_sub(timestamp) < duration_millis(self.config.expiry())
    }

    /// Whole minutes elapsed since `timestamp`.
    pub fn get_age_minutes(&self, timestamp: i64) -> i64 {
        Utc::now().timestamp_millis().saturating_sub(timestamp) / 60_000
    }

    /// Delete entries older than `max_age`, written under another version,
    /// or unreadable. Returns the number of entries removed.
    ///
    /// An entry rewritten between the scan and its delete is kept.
    pub async fn clean_old_entries(&self, max_age: Duration) -> usize {
        let now = Utc::now().timestamp_millis();
        let max_age_ms = duration_millis(max_age);
        let mut removed = 0;

        for (key, raw) in self.kv.entries().await {
            let expired = match serde_json::from_str::<StoredEntry>(&raw) {
                Ok(entry) => {
                    entry.version != self.config.version
                        || now.saturating_sub(entry.timestamp) > max_age_ms
                }
                Err(_) => true,
            };
            if expired && self.kv.delete_if_unchanged(&key, &raw).await {
                removed += 1;
            }
        }

        info!(removed, "old cache entries cleaned");
        removed
    }

    pub async fn get_stats(&self) -> CacheStats {
        let entries = self.kv.entries().await;
        let oldest_timestamp = entries
            .iter()
            .filter_map(|(_, raw)| serde_json::from_str::<StoredEntry>(raw).ok())
            .map(|entry| entry.timestamp)
            .min();

        CacheStats {
            entry_count: entries.len(),
            total_size_bytes: entries.iter().map(|(_, raw)| raw.len()).sum(),
            oldest_timestamp,
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> StoreResult<StoredPayload> {
        let value = serde_json::to_value(data)?;
        if !self.config.compression {
            return Ok(StoredPayload::Raw { data: value });
        }

        let json = serde_json::to_string(&value)?;
        if json.len() < self.config.compression_threshold {
            return Ok(StoredPayload::Raw { data: value });
        }

        match compression::compress(&json) {
            Ok(blob) => Ok(StoredPayload::Compressed {
                original_size: json.len(),
                compressed_size: blob.len(),
                blob,
            }),
            Err(err) => {
                warn!(%err, "compression failed, storing raw");
                Ok(StoredPayload::Raw { data: value })
            }
        }
    }
}

/// Milliseconds in `duration`, clamped to `i64::MAX`.
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Animal {
        id: String,
        brinco: String,
        notes: String,
    }

    fn animal(id: &str, notes_len: usize) -> Animal {
        Animal {
            id: id.into(),
            brinco: format!("BR-{id}"),
            notes: "x".repeat(notes_len),
        }
    }

    fn make_cache(config: CacheConfig) -> (StoreConnection, LocalCache) {
        let conn = StoreConnection::in_memory();
        (conn.clone(), LocalCache::new(conn, config))
    }

    async fn write_raw_entry(conn: &StoreConnection, entry: &StoredEntry) {
        KvStore::new(conn.clone(), COLLECTIONS_NAMESPACE)
            .set(&entry.key, entry)
            .await;
    }

    #[tokio::test]
    async fn small_payload_round_trips_raw() {
        let (_, cache) = make_cache(CacheConfig::default());
        let data = vec![animal("a1", 10)];

        assert!(cache.set("animals", &data).await);

        let entry = cache.get::<Vec<Animal>>("animals").await.unwrap();
        assert_eq!(entry.data, data);
        assert_eq!(entry.version, 1);
        assert_eq!(
            cache.inspect("animals").await.unwrap().encoding,
            Encoding::Raw
        );
    }

    #[tokio::test]
    async fn large_payload_is_compressed_and_round_trips() {
        let (_, cache) = make_cache(CacheConfig::default());
        let data = vec![animal("a1", 800), animal("a2", 800)];

        cache.set("animals", &data).await;

        let info = cache.inspect("animals").await.unwrap();
        assert_eq!(info.encoding, Encoding::Compressed);
        assert!(info.original_size.unwrap() >= 1024);
        assert!(info.compressed_size.unwrap() < info.original_size.unwrap());

        let entry = cache.get::<Vec<Animal>>("animals").await.unwrap();
        assert_eq!(entry.data, data);
    }

    #[tokio::test]
    async fn compression_disabled_stores_raw() {
        let (_, cache) = make_cache(CacheConfig {
            compression: false,
            ..CacheConfig::default()
        });
        cache.set("animals", &vec![animal("a1", 4000)]).await;
        assert_eq!(
            cache.inspect("animals").await.unwrap().encoding,
            Encoding::Raw
        );
    }

    #[tokio::test]
    async fn version_bump_invalidates_without_delete() {
        let conn = StoreConnection::in_memory();
        let v1 = LocalCache::new(conn.clone(), CacheConfig::default());
        v1.set("animals", &vec![animal("a1", 5)]).await;
        assert!(v1.get::<Vec<Animal>>("animals").await.is_some());

        let v2 = LocalCache::new(
            conn,
            CacheConfig {
                version: 2,
                ..CacheConfig::default()
            },
        );
        assert!(v2.get::<Vec<Animal>>("animals").await.is_none());
        // Still physically present until cleaned.
        assert_eq!(v2.get_stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn corrupt_blob_is_a_miss() {
        let (conn, cache) = make_cache(CacheConfig::default());
        write_raw_entry(
            &conn,
            &StoredEntry {
                key: "animals".into(),
                timestamp: Utc::now().timestamp_millis(),
                version: 1,
                payload: StoredPayload::Compressed {
                    blob: "definitely-not-zlib".into(),
                    original_size: 2048,
                    compressed_size: 19,
                },
            },
        )
        .await;

        assert!(cache.get::<Vec<Animal>>("animals").await.is_none());
    }

    #[tokio::test]
    async fn wrong_shape_is_a_miss() {
        let (_, cache) = make_cache(CacheConfig::default());
        cache.set("animals", &"just a string").await;
        assert!(cache.get::<Vec<Animal>>("animals").await.is_none());
    }

    #[test]
    fn freshness_boundary() {
        let (_, cache) = make_cache(CacheConfig {
            expiry_minutes: 30,
            ..CacheConfig::default()
        });
        let window = 30 * 60 * 1000;
        let now = 10_000_000;

        assert!(cache.is_fresh_at(now, now));
        assert!(cache.is_fresh_at(now - window + 1, now));
        assert!(!cache.is_fresh_at(now - window, now));
        assert!(!cache.is_fresh_at(now - window - 1, now));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let (_, cache) = make_cache(CacheConfig::default());
        let now = Utc::now().timestamp_millis();

        assert!(!cache.is_fresh_at(i64::MIN, now));
        assert!(cache.is_fresh_at(i64::MAX, now));
        assert!(!cache.is_fresh_at(i64::MIN, i64::MAX));
        assert_eq!(cache.get_age_minutes(i64::MIN), i64::MAX / 60_000);
        assert!(cache.get_age_minutes(i64::MAX) < 0);

        let forever = LocalCache::new(
            StoreConnection::in_memory(),
            CacheConfig {
                expiry_minutes: u64::MAX,
                ..CacheConfig::default()
            },
        );
        assert!(forever.is_fresh_at(0, now));
    }

    #[test]
    fn age_in_minutes() {
        let (_, cache) = make_cache(CacheConfig::default());
        let ten_minutes_ago = Utc::now().timestamp_millis() - 10 * 60_000 - 500;
        assert_eq!(cache.get_age_minutes(ten_minutes_ago), 10);
    }

    #[tokio::test]
    async fn clean_old_entries_removes_old_and_stale() {
        let (conn, cache) = make_cache(CacheConfig::default());
        let now = Utc::now().timestamp_millis();
        let hour = 60 * 60 * 1000;

        cache.set("fresh", &vec![animal("a1", 1)]).await;
        write_raw_entry(
            &conn,
            &StoredEntry {
                key: "old".into(),
                timestamp: now - 48 * hour,
                version: 1,
                payload: StoredPayload::Raw {
                    data: serde_json::json!([]),
                },
            },
        )
        .await;
        write_raw_entry(
            &conn,
            &StoredEntry {
                key: "other-version".into(),
                timestamp: now,
                version: 7,
                payload: StoredPayload::Raw {
                    data: serde_json::json!([]),
                },
            },
        )
        .await;

        let removed = cache.clean_old_entries(Duration::from_secs(24 * 3600)).await;
        assert_eq!(removed, 2);

        let stats = cache.get_stats().await;
        assert_eq!(stats.entry_count, 1);
        assert!(cache.get::<Vec<Animal>>("fresh").await.is_some());
    }

    #[tokio::test]
    async fn clean_old_entries_handles_extreme_ages() {
        let (conn, cache) = make_cache(CacheConfig::default());
        for (key, timestamp) in [("ancient", i64::MIN), ("future", i64::MAX)] {
            write_raw_entry(
                &conn,
                &StoredEntry {
                    key: key.into(),
                    timestamp,
                    version: 1,
                    payload: StoredPayload::Raw {
                        data: serde_json::json!([]),
                    },
                },
            )
            .await;
        }

        assert_eq!(cache.clean_old_entries(Duration::MAX).await, 0);
        assert_eq!(cache.clean_old_entries(Duration::from_secs(3600)).await, 1);
        assert!(cache.get::<Vec<Animal>>("future").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_keeps_entry_rewritten_after_scan() {
        let (conn, cache) = make_cache(CacheConfig::default());
        let kv = KvStore::new(conn.clone(), COLLECTIONS_NAMESPACE);
        write_raw_entry(
            &conn,
            &StoredEntry {
                key: "animals".into(),
                timestamp: Utc::now().timestamp_millis() - 48 * 60 * 60 * 1000,
                version: 1,
                payload: StoredPayload::Raw {
                    data: serde_json::json!([]),
                },
            },
        )
        .await;
        let scanned = kv.get_raw("animals").await.unwrap();

        // A fresh write lands between the cleanup scan and its delete.
        cache.set("animals", &vec![animal("a1", 1)]).await;
        assert!(!kv.delete_if_unchanged("animals", &scanned).await);

        assert_eq!(cache.clean_old_entries(Duration::from_secs(24 * 3600)).await, 0);
        assert_eq!(
            cache.get::<Vec<Animal>>("animals").await.unwrap().data,
            vec![animal("a1", 1)]
        );
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let (_, cache) = make_cache(CacheConfig::default());
        assert_eq!(cache.get_stats().await, CacheStats::default());

        cache.set("animals", &vec![animal("a1", 1)]).await;
        cache.set("lots", &vec![animal("l1", 1)]).await;

        let stats = cache.get_stats().await;
        assert_eq!(stats.entry_count, 2);
        assert!(stats.total_size_bytes > 0);
        assert!(stats.oldest_timestamp.is_some());

        cache.clear().await;
        cache.clear().await;
        let stats = cache.get_stats().await;
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.oldest_timestamp, None);
    }
}
