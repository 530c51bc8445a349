//! Field-indexed view over one cached collection.
//!
//! [`IndexedCache`] persists a whole collection through [`LocalCache`] and
//! keeps an in-memory secondary index, `field -> normalized value -> id`,
//! for O(1) lookups on designated fields. The persisted collection stays
//! the source of truth: the index only tells a lookup *which* record to
//! return. Fields without an index, and values the index has never seen,
//! fall back to a linear scan.
//!
//! The index is rebuilt wholesale on every [`IndexedCache::set`] and never
//! patched incrementally. Collections here are herd-sized (thousands of
//! records), so a rebuild costs less than keeping patches correct.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::local_cache::LocalCache;

/// A domain record that can live in an [`IndexedCache`].
pub trait CacheRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Stable identifier, unique within the collection.
    fn id(&self) -> &str;
}

/// Normalize a field value for indexing and comparison.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Normalized string form of a record field, if the field is a scalar.
fn field_key(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(normalize(s)),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct CollectionIndex {
    /// field -> normalized value -> record id. First record in collection
    /// order wins when values collide.
    fields: HashMap<String, HashMap<String, String>>,
    /// record id -> position in the persisted collection.
    positions: HashMap<String, usize>,
}

impl CollectionIndex {
    fn build<T: CacheRecord>(data: &[T], index_fields: &[&str]) -> Self {
        let mut index = Self::default();
        for field in index_fields {
            index.fields.insert((*field).to_string(), HashMap::new());
        }

        for (position, record) in data.iter().enumerate() {
            index
                .positions
                .entry(record.id().to_string())
                .or_insert(position);

            if index_fields.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::to_value(record) else {
                continue;
            };
            for (field, values) in index.fields.iter_mut() {
                if let Some(key) = field_key(&value, field) {
                    values
                        .entry(key)
                        .or_insert_with(|| record.id().to_string());
                }
            }
        }
        index
    }
}

/// Collection cache with secondary indices.
pub struct IndexedCache<T> {
    cache: LocalCache,
    key: String,
    index: Arc<RwLock<CollectionIndex>>,
    _marker: PhantomData<T>,
}

impl<T> Clone for IndexedCache<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            key: self.key.clone(),
            index: Arc::clone(&self.index),
            _marker: PhantomData,
        }
    }
}

impl<T: CacheRecord> IndexedCache<T> {
    /// Index the collection stored under `key` in `cache`.
    pub fn new(cache: LocalCache, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
            index: Arc::new(RwLock::new(CollectionIndex::default())),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Persist `data`, then rebuild the index for `index_fields`.
    pub async fn set(&self, data: &[T], index_fields: &[&str]) -> bool {
        let stored = self.cache.set(&self.key, data).await;

        let rebuilt = if stored {
            CollectionIndex::build(data, index_fields)
        } else {
            CollectionIndex::default()
        };
        debug!(
            key = %self.key,
            records = data.len(),
            fields = ?index_fields,
            "collection index rebuilt"
        );
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = rebuilt;
        stored
    }

    /// Every record in the cached collection, or nothing on a miss.
    pub async fn get_all(&self) -> Vec<T> {
        self.cache
            .get::<Vec<T>>(&self.key)
            .await
            .map(|entry| entry.data)
            .unwrap_or_default()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<T> {
        let data = self.get_all().await;
        let position = self.read_index().positions.get(id).copied();
        find_by_id(data, id, position)
    }

    /// First record whose `field` matches `value` after normalization.
    pub async fn get_by_field(&self, field: &str, value: &str) -> Option<T> {
        let data = self.get_all().await;
        let wanted = normalize(value);

        let indexed = {
            let index = self.read_index();
            index.fields.get(field).map(|values| {
                let id = values.get(&wanted)?;
                Some((id.clone(), index.positions.get(id).copied()))
            })
        };

        match indexed {
            // Indexed field, value known: jump straight to the record and
            // confirm it still matches.
            Some(Some((id, position))) => {
                let record = find_by_id(data.clone(), &id, position)?;
                if matches_field(&record, field, &wanted) {
                    Some(record)
                } else {
                    scan_first(data, field, &wanted)
                }
            }
            // Value unknown to the index. Another writer may have replaced
            // the collection since the last rebuild, so storage decides.
            Some(None) | None => scan_first(data, field, &wanted),
        }
    }

    /// Every record whose `field` matches `value` after normalization.
    pub async fn get_many_by_field(&self, field: &str, value: &str) -> Vec<T> {
        let wanted = normalize(value);
        self.get_all()
            .await
            .into_iter()
            .filter(|record| matches_field(record, field, &wanted))
            .collect()
    }

    /// Fields that currently have an index.
    pub fn indexed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.read_index().fields.keys().cloned().collect();
        fields.sort();
        fields
    }

    pub async fn clear(&self) {
        self.cache.delete(&self.key).await;
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = CollectionIndex::default();
    }

    /// Whether the cached collection exists and is inside the freshness
    /// window.
    pub async fn is_fresh(&self) -> bool {
        match self.cache.get::<Value>(&self.key).await {
            Some(entry) => self.cache.is_fresh(entry.timestamp),
            None => false,
        }
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, CollectionIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_by_id<T: CacheRecord>(data: Vec<T>, id: &str, position: Option<usize>) -> Option<T> {
    if let Some(position) = position {
        if data.get(position).is_some_and(|record| record.id() == id) {
            return data.into_iter().nth(position);
        }
    }
    data.into_iter().find(|record| record.id() == id)
}

fn matches_field<T: CacheRecord>(record: &T, field: &str, wanted: &str) -> bool {
    serde_json::to_value(record)
        .ok()
        .and_then(|value| field_key(&value, field))
        .is_some_and(|key| key == wanted)
}

fn scan_first<T: CacheRecord>(data: Vec<T>, field: &str, wanted: &str) -> Option<T> {
    data.into_iter()
        .find(|record| matches_field(record, field, wanted))
}

// ── tests ────────────────────────────────────────────────────────────
