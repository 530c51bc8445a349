//! Subcommands: `herdsync queue`, `herdsync cache`, `herdsync status`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use herdsync_store::{CacheStats, LocalCache, OperationRecord, StoreConnection};
use herdsync_sync::{Connectivity, OfflineQueue, QueueStats};

use crate::cli::{CacheAction, QueueAction};
use crate::config::Settings;

// ---------------------------------------------------------------------------
// Subcommand: queue
// ---------------------------------------------------------------------------

pub async fn queue(settings: &Settings, action: QueueAction) -> Result<()> {
    let queue = open_queue(settings)?;

    match action {
        QueueAction::Stats => {
            let stats = queue.stats().await?;
            print_queue_stats(&stats);
        }
        QueueAction::List { failed, json } => {
            let ops = if failed {
                queue.get_failed().await?
            } else {
                queue.get_all().await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&ops)?);
            } else if ops.is_empty() {
                println!("  (no operations)");
            } else {
                for op in &ops {
                    println!("  {}", format_operation(op));
                }
            }
        }
        QueueAction::RetryFailed => {
            let reset = queue.retry_failed().await?;
            println!("  Requeued {reset} failed operation(s).");
        }
        QueueAction::ClearFailed => {
            let removed = queue.clear_failed().await?;
            println!("  Deleted {removed} failed operation(s).");
        }
        QueueAction::Remove { id } => {
            if queue.remove(&id).await? {
                println!("  Deleted {id}.");
            } else {
                anyhow::bail!("no operation with id {id}");
            }
        }
        QueueAction::Recover => {
            let recovered = queue.recover_interrupted().await?;
            println!("  Returned {recovered} interrupted operation(s) to pending.");
        }
        QueueAction::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete pending operations without --yes");
            }
            let removed = queue.clear_all().await?;
            println!("  Deleted {removed} operation(s).");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: cache
// ---------------------------------------------------------------------------

pub async fn cache(settings: &Settings, action: CacheAction) -> Result<()> {
    let conn = open_connection(settings).await?;
    let cache = LocalCache::new(conn, settings.cache.clone());

    match action {
        CacheAction::Stats => {
            let stats = cache.get_stats().await;
            print_cache_stats(&stats);
        }
        CacheAction::Inspect { key } => {
            let info = cache
                .inspect(&key)
                .await
                .with_context(|| format!("no readable cache entry for `{key}`"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            let fresh = if cache.is_fresh(info.timestamp) {
                "fresh"
            } else {
                "stale"
            };
            println!(
                "  age: {} min ({fresh})",
                cache.get_age_minutes(info.timestamp)
            );
        }
        CacheAction::Clean { max_age_hours } => {
            let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
            let removed = cache.clean_old_entries(max_age).await;
            println!("  Removed {removed} stale cache entries (max age {max_age_hours}h).");
        }
        CacheAction::Delete { key } => {
            if cache.delete(&key).await {
                println!("  Deleted `{key}`.");
            } else {
                println!("  `{key}` was not cached.");
            }
        }
        CacheAction::Clear => {
            cache.clear().await;
            println!("  Cache cleared.");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

pub async fn status(settings: &Settings, config_source: Option<&Path>) -> Result<()> {
    println!();
    println!("  herdsync Status");
    println!("  ===============");
    println!();

    match config_source {
        Some(path) => println!("  Config:           {}", path.display()),
        None => println!("  Config:           defaults (no config file)"),
    }
    println!(
        "  Cache:            v{}, fresh for {} min, compress >= {} bytes ({})",
        settings.cache.version,
        settings.cache.expiry_minutes,
        settings.cache.compression_threshold,
        if settings.cache.compression {
            "on"
        } else {
            "off"
        },
    );
    println!(
        "  Query cache:      ttl {}s, capacity {}",
        settings.query_cache.ttl_seconds, settings.query_cache.max_capacity
    );
    println!(
        "  Queue:            {} retries, backoff {}..{} ms, batch {}",
        settings.queue.max_retries,
        settings.queue.base_delay_ms,
        settings.queue.max_delay_ms,
        settings.queue.batch_size,
    );

    let db_path = &settings.storage.db_path;
    if !db_path.exists() {
        println!("  Database:         NOT INITIALIZED ({})", db_path.display());
        println!();
        return Ok(());
    }
    println!("  Database:         OK ({})", db_path.display());
    println!();

    let conn = open_connection(settings).await?;
    let queue = queue_on(conn.clone(), settings);
    print_queue_stats(&queue.stats().await?);

    let cache = LocalCache::new(conn, settings.cache.clone());
    print_cache_stats(&cache.get_stats().await);
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_queue(settings: &Settings) -> Result<OfflineQueue> {
    ensure_parent_dir(&settings.storage.db_path)?;
    Ok(queue_on(
        StoreConnection::file(&settings.storage.db_path),
        settings,
    ))
}

/// Queue over `conn`. Offline: the CLI has no executors and must never
/// drain.
fn queue_on(conn: StoreConnection, settings: &Settings) -> OfflineQueue {
    OfflineQueue::new(conn, Connectivity::new(false), settings.queue.clone())
}

async fn open_connection(settings: &Settings) -> Result<StoreConnection> {
    ensure_parent_dir(&settings.storage.db_path)?;
    let conn = StoreConnection::file(&settings.storage.db_path);
    conn.init()
        .await
        .with_context(|| format!("failed to open {}", settings.storage.db_path.display()))?;
    Ok(conn)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn print_queue_stats(stats: &QueueStats) {
    println!("  Pending:          {}", stats.pending);
    println!("  Processing:       {}", stats.processing);
    println!("  Failed:           {}", stats.failed);
}

fn print_cache_stats(stats: &CacheStats) {
    println!("  Cached entries:   {}", stats.entry_count);
    println!("  Cache size:       {}", format_bytes(stats.total_size_bytes));
    match stats.oldest_timestamp {
        Some(ts) => println!("  Oldest entry:     {}", format_timestamp(ts)),
        None => println!("  Oldest entry:     -"),
    }
}

/// One-line summary of an operation for table output.
fn format_operation(op: &OperationRecord) -> String {
    let target = match &op.target_document_id {
        Some(doc) => format!("{}/{doc}", op.target_collection),
        None => op.target_collection.clone(),
    };
    let mut line = format!(
        "{:<10} {} {} retries={} {}",
        op.status.as_str(),
        op.id,
        target,
        op.retry_count,
        format_timestamp(op.created_at),
    );
    if let Some(err) = &op.last_error {
        line.push_str(&format!("  error: {err}"));
    }
    line
}

fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{millis}ms"))
}

fn format_bytes(bytes: usize) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{bytes} B")
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsync_store::OperationStatus;
    use serde_json::json;

    fn settings_in(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.storage.db_path = dir.join("nested").join("herdsync.db");
        settings
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(i64::MAX), format!("{}ms", i64::MAX));
    }

    #[test]
    fn operation_line_shows_target_and_error() {
        let mut op = OperationRecord::new("update-animal", "animals", json!({}), Some("a1".into()));
        op.status = OperationStatus::Failed;
        op.retry_count = 5;
        op.last_error = Some("503".into());

        let line = format_operation(&op);
        assert!(line.starts_with("failed"));
        assert!(line.contains("animals/a1"));
        assert!(line.contains("retries=5"));
        assert!(line.ends_with("error: 503"));
    }

    #[tokio::test]
    async fn queue_commands_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());

        let queue_handle = open_queue(&settings).unwrap();
        let id = queue_handle
            .enqueue("create-animal", "animals", &json!({"brinco": "BR-1"}), None)
            .await
            .unwrap();

        queue(&settings, QueueAction::Stats).await.unwrap();
        queue(
            &settings,
            QueueAction::List {
                failed: false,
                json: true,
            },
        )
        .await
        .unwrap();

        assert!(queue(&settings, QueueAction::Clear { yes: false }).await.is_err());
        assert_eq!(queue_handle.stats().await.unwrap().pending, 1);

        queue(&settings, QueueAction::Remove { id: id.clone() })
            .await
            .unwrap();
        assert!(queue(&settings, QueueAction::Remove { id }).await.is_err());
        assert_eq!(queue_handle.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn queue_and_cache_share_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());

        let conn = open_connection(&settings).await.unwrap();
        let queue_handle = queue_on(conn.clone(), &settings);
        let local = LocalCache::new(conn.clone(), settings.cache.clone());

        queue_handle
            .enqueue("create-animal", "animals", &json!({"brinco": "BR-1"}), None)
            .await
            .unwrap();
        assert!(local.set("animals", &json!([{"id": "a1"}])).await);

        assert_eq!(queue_handle.stats().await.unwrap().pending, 1);
        assert_eq!(local.get_stats().await.entry_count, 1);
        assert_eq!(conn.open_attempts(), 1);

        status(&settings, None).await.unwrap();
    }

    #[tokio::test]
    async fn cache_commands_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());

        status(&settings, None).await.unwrap();
        assert!(!settings.storage.db_path.exists());

        let conn = open_connection(&settings).await.unwrap();
        let local = LocalCache::new(conn, settings.cache.clone());
        assert!(local.set("animals", &json!([{"id": "a1"}])).await);

        cache(&settings, CacheAction::Stats).await.unwrap();
        cache(
            &settings,
            CacheAction::Inspect {
                key: "animals".into(),
            },
        )
        .await
        .unwrap();
        assert!(
            cache(
                &settings,
                CacheAction::Inspect {
                    key: "herds".into()
                }
            )
            .await
            .is_err()
        );

        cache(&settings, CacheAction::Clean { max_age_hours: 24 })
            .await
            .unwrap();
        assert_eq!(local.get_stats().await.entry_count, 1);

        status(&settings, None).await.unwrap();
        cache(&settings, CacheAction::Clear).await.unwrap();
        assert_eq!(local.get_stats().await.entry_count, 0);
    }
}
