//! Short-lived memoization of derived query results using [`moka`].
//!
//! [`QueryCache`] remembers the output of computations over already-cached
//! data (filtered herd views, per-lot summaries) for a short TTL. It holds
//! no source of truth and has no dependency tracking: any mutation path
//! that could change an answer must call [`QueryCache::invalidate`] with a
//! matching key prefix.
//!
//! Values are stored as JSON strings internally so results of different
//! types can share one cache.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

// ── configuration ────────────────────────────────────────────────────

/// Tunables for [`QueryCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// How long a computed result stays valid, in seconds.
    pub ttl_seconds: u64,
    /// Upper bound on remembered results.
    pub max_capacity: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_capacity: 1_000,
        }
    }
}

// ── counters ─────────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a [`QueryCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryCacheStats {
    /// Live (unexpired) entries.
    pub size: usize,
    /// Keys of the live entries, sorted.
    pub keys: Vec<String>,
    pub hits: u64,
    pub misses: u64,
}

impl QueryCacheStats {
    /// Hit rate between 0.0 and 1.0 (0.0 if nothing was looked up).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

impl fmt::Display for QueryCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} hits={} misses={} rate={:.2}%",
            self.size,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct QueryEntry {
    json: String,
    stored_at: Instant,
}

/// TTL-bounded cache of computed results.
#[derive(Clone)]
pub struct QueryCache {
    inner: Cache<String, Arc<QueryEntry>>,
    ttl: Duration,
    counters: Arc<Counters>,
}

impl QueryCache {
    pub fn new(config: &QueryCacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_seconds);
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(ttl)
            .build();

        debug!(
            max_capacity = config.max_capacity,
            ttl_seconds = config.ttl_seconds,
            "query cache created"
        );

        Self {
            inner,
            ttl,
            counters: Arc::new(Counters::new()),
        }
    }

    /// Return the live result for `key`, or run `compute`, remember its
    /// output, and return it.
    pub async fn get_cached_query<T, F, Fut>(&self, key: &str, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(cached) = self.lookup(key).await {
            return cached;
        }

        let value = compute().await;
        self.remember(key, &value).await;
        value
    }

    /// Like [`QueryCache::get_cached_query`] for fallible computations.
    /// Errors propagate and nothing is remembered.
    pub async fn try_get_cached_query<T, E, F, Fut>(&self, key: &str, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.lookup(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        self.remember(key, &value).await;
        Ok(value)
    }

    /// Drop entries whose key starts with `prefix`, or everything when
    /// `prefix` is `None`.
    pub async fn invalidate(&self, prefix: Option<&str>) {
        match prefix {
            None => {
                self.inner.invalidate_all();
                debug!("query cache cleared");
            }
            Some(prefix) => {
                let doomed: Vec<Arc<String>> = self
                    .inner
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, _)| key)
                    .collect();
                for key in &doomed {
                    self.inner.invalidate(key.as_str()).await;
                }
                debug!(prefix, removed = doomed.len(), "query cache invalidated by prefix");
            }
        }
    }

    pub async fn stats(&self) -> QueryCacheStats {
        self.inner.run_pending_tasks().await;
        let mut keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(_, entry)| self.is_live(entry))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();

        QueryCacheStats {
            size: keys.len(),
            keys,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    fn is_live(&self, entry: &QueryEntry) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(entry) = self.inner.get(key).await else {
            self.counters.record_miss();
            debug!(key, "query cache miss");
            return None;
        };

        if !self.is_live(&entry) {
            self.inner.invalidate(key).await;
            self.counters.record_miss();
            debug!(key, "query cache entry expired");
            return None;
        }

        match serde_json::from_str::<T>(&entry.json) {
            Ok(value) => {
                self.counters.record_hit();
                debug!(key, "query cache hit");
                Some(value)
            }
            Err(err) => {
                // Same key reused for a different result type; recompute.
                warn!(key, %err, "query cache entry has unexpected shape, evicting");
                self.inner.invalidate(key).await;
                self.counters.record_miss();
                None
            }
        }
    }

    async fn remember<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                let entry = QueryEntry {
                    json,
                    stored_at: Instant::now(),
                };
                self.inner.insert(key.to_string(), Arc::new(entry)).await;
            }
            Err(err) => warn!(key, %err, "query result not serializable, not cached"),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn make_cache() -> QueryCache {
        QueryCache::new(&QueryCacheConfig::default())
    }

    async fn counted(cache: &QueryCache, key: &str, calls: &AtomicU32) -> Vec<String> {
        cache
            .get_cached_query(key, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                vec!["a1".to_string(), "a2".to_string()]
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn computes_once_per_ttl_window() {
        let cache = make_cache();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert_eq!(counted(&cache, "animals:lote-a", &calls).await.len(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        counted(&cache, "animals:lote-a", &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        counted(&cache, "animals:lote-a", &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prefix_invalidation_only_hits_matching_keys() {
        let cache = make_cache();
        let animals = AtomicU32::new(0);
        let pastures = AtomicU32::new(0);

        counted(&cache, "animals:lote-a", &animals).await;
        counted(&cache, "animals:lote-b", &animals).await;
        counted(&cache, "pastures:all", &pastures).await;

        cache.invalidate(Some("animals:")).await;

        counted(&cache, "animals:lote-a", &animals).await;
        counted(&cache, "pastures:all", &pastures).await;
        assert_eq!(animals.load(Ordering::SeqCst), 3);
        assert_eq!(pastures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_invalidation_clears_everything() {
        let cache = make_cache();
        let calls = AtomicU32::new(0);
        counted(&cache, "a", &calls).await;
        counted(&cache, "b", &calls).await;

        cache.invalidate(None).await;
        assert_eq!(cache.stats().await.size, 0);

        counted(&cache, "a", &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = make_cache();
        let calls = AtomicU32::new(0);

        let first: Result<u32, String> = cache
            .try_get_cached_query("weights", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("no data".to_string())
            })
            .await;
        assert!(first.is_err());

        let second: Result<u32, String> = cache
            .try_get_cached_query("weights", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await;
        assert_eq!(second, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stats_report_keys_and_counters() {
        let cache = make_cache();
        let calls = AtomicU32::new(0);
        counted(&cache, "b", &calls).await;
        counted(&cache, "a", &calls).await;
        counted(&cache, "a", &calls).await;

        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!(stats.to_string().contains("size=2"));
    }

    #[tokio::test]
    async fn shape_mismatch_recomputes() {
        let cache = make_cache();
        let n: u32 = cache.get_cached_query("k", || async { 7 }).await;
        assert_eq!(n, 7);

        let s: Vec<String> = cache
            .get_cached_query("k", || async { vec!["x".to_string()] })
            .await;
        assert_eq!(s, vec!["x".to_string()]);
    }
}
