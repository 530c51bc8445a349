//! The offline queue: durable FIFO replay of mutations.
//!
//! Every mutation the application cannot (or should not yet) send is
//! persisted as an [`OperationRecord`] and later handed to the executor
//! registered for its type. A record moves through
//!
//! ```text
//! pending ──► processing ──► deleted   (executor succeeded)
//!    ▲             │
//!    └─────────────┤                   (failed, retries left, after backoff)
//!                  └──────► failed     (retries exhausted, or no executor)
//! ```
//!
//! `failed` is terminal until [`OfflineQueue::retry_failed`] resets it.
//!
//! Drains are strictly sequential so that operations targeting the same
//! document are applied in enqueue order. One pass handles at most
//! [`QueueConfig::batch_size`] records; if work remains, another pass is
//! scheduled after [`QueueConfig::drain_delay_ms`]. A pass turned away
//! because another one is running leaves a rerun request that the running
//! pass honors once it lets go of the guard.
//!
//! A store error on one record is logged and counted, and the pass moves on
//! to the next record. A record purged while its executor was in flight is
//! skipped.
//!
//! The backoff sleep after a failed attempt runs inline, so a failing
//! backend throttles the whole pass rather than just the one record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use herdsync_store::{
    OperationCounts, OperationRecord, OperationStatus, OperationStore, StoreConnection, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::executor::{ExecutorRegistry, OperationExecutor};

/// Per-status counts published after every enqueue and drain pass.
pub type QueueStats = OperationCounts;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for [`OfflineQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts after which a record is parked as `failed`.
    pub max_retries: u32,
    /// Backoff base, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Records handled per drain pass.
    pub batch_size: usize,
    /// Pause before the follow-up pass when records remain, in milliseconds.
    pub drain_delay_ms: u64,
    /// Upper bound on a single executor call. `None` waits indefinitely.
    pub execution_timeout_ms: Option<u64>,
    /// Buffer of the status broadcast channel.
    pub status_channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            batch_size: 10,
            drain_delay_ms: 1_000,
            execution_timeout_ms: None,
            status_channel_capacity: 64,
        }
    }
}

impl QueueConfig {
    /// `min(base_delay * 2^retry_count, max_delay)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Why a drain pass did or did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Connectivity reported offline; nothing was touched.
    Offline,
    /// Another pass held the drain guard.
    AlreadyRunning,
    /// A batch was processed.
    Drained,
}

/// Summary of one [`OfflineQueue::process_queue`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Records deleted by someone else while being processed.
    pub purged: usize,
    /// Store errors logged during the pass.
    pub errors: usize,
    /// Pending records left once the pass finished.
    pub remaining: usize,
}

impl DrainReport {
    fn skipped(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            attempted: 0,
            succeeded: 0,
            retried: 0,
            failed: 0,
            purged: 0,
            errors: 0,
            remaining: 0,
        }
    }

    fn drained() -> Self {
        Self::skipped(DrainOutcome::Drained)
    }
}

/// Result of processing a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Delivered and deleted.
    Succeeded,
    /// Back to `pending` with one more retry recorded.
    Retried,
    /// Parked as `failed`.
    Failed,
    /// The record disappeared from the store mid-flight.
    Purged,
}

// ---------------------------------------------------------------------------
// Drain guard
// ---------------------------------------------------------------------------

/// Holds the re-entrancy flag for the lifetime of one pass.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Status subscription
// ---------------------------------------------------------------------------

/// Handle returned by [`OfflineQueue::on_status_change`].
///
/// The callback stays registered while this handle is alive; dropping it
/// or calling [`unsubscribe`](Self::unsubscribe) removes it.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct StatusSubscription {
    task: JoinHandle<()>,
}

impl StatusSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// OfflineQueue
// ---------------------------------------------------------------------------

struct Inner {
    store: OperationStore,
    executors: ExecutorRegistry,
    connectivity: Connectivity,
    config: QueueConfig,
    draining: AtomicBool,
    /// Set by a pass that found the guard taken.
    rerun_requested: AtomicBool,
    status_tx: broadcast::Sender<QueueStats>,
}

/// Durable queue of operations awaiting delivery.
///
/// Cheaply cloneable; all clones share the same store, executors, and
/// drain guard.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("connectivity", &self.inner.connectivity)
            .field("config", &self.inner.config)
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    pub fn new(conn: StoreConnection, connectivity: Connectivity, config: QueueConfig) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                store: OperationStore::new(conn),
                executors: ExecutorRegistry::new(),
                connectivity,
                config,
                draining: AtomicBool::new(false),
                rerun_requested: AtomicBool::new(false),
                status_tx,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.inner.executors
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Spawn the background listener.
    ///
    /// It first returns records stranded in `processing` to `pending`, runs
    /// one pass if online, then triggers a pass on every offline-to-online
    /// transition. Abort the returned handle to stop listening.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let mut rx = self.inner.connectivity.subscribe();

        tokio::spawn(async move {
            if let Err(e) = queue.recover_interrupted().await {
                warn!(error = %e, "failed to recover interrupted operations");
            }

            let mut was_online = *rx.borrow_and_update();
            if was_online {
                if let Err(e) = queue.process_queue().await {
                    warn!(error = %e, "startup drain failed");
                }
            }

            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    info!("back online, draining queue");
                    queue.spawn_drain(Duration::ZERO);
                }
                was_online = online;
            }
        })
    }

    // -- executors ----------------------------------------------------------

    pub fn register_executor(
        &self,
        op_type: impl Into<String>,
        executor: Arc<dyn OperationExecutor>,
    ) {
        self.inner.executors.register(op_type, executor);
    }

    pub fn register_fn<F, Fut>(&self, op_type: impl Into<String>, f: F)
    where
        F: Fn(OperationRecord) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.executors.register_fn(op_type, f);
    }

    // -- enqueue ------------------------------------------------------------

    /// Persist a new operation and return its id.
    ///
    /// If online, a drain pass is started in the background; the caller
    /// does not wait for it.
    #[instrument(skip(self, payload))]
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        op_type: &str,
        collection: &str,
        payload: &P,
        document_id: Option<&str>,
    ) -> SyncResult<String> {
        let payload = serde_json::to_value(payload)?;
        let record =
            OperationRecord::new(op_type, collection, payload, document_id.map(str::to_owned));
        self.inner.store.insert(&record).await?;
        info!(id = %record.id, "operation enqueued");

        self.publish_status().await;
        if self.is_online() {
            self.spawn_drain(Duration::ZERO);
        }
        Ok(record.id)
    }

    // -- draining -----------------------------------------------------------

    /// Run one drain pass.
    ///
    /// Does nothing when offline or when another pass is in progress; in
    /// the latter case the running pass is asked to go again once it
    /// finishes. Store errors on individual records are logged and counted
    /// in the report. Only a failure to read the batch itself is returned.
    #[instrument(skip(self))]
    pub async fn process_queue(&self) -> SyncResult<DrainReport> {
        if !self.is_online() {
            debug!("offline, skipping drain");
            return Ok(DrainReport::skipped(DrainOutcome::Offline));
        }
        let Some(guard) = self.acquire_or_request_rerun() else {
            debug!("drain already running, rerun requested");
            return Ok(DrainReport::skipped(DrainOutcome::AlreadyRunning));
        };

        let batch = match self
            .inner
            .store
            .list_by_status(OperationStatus::Pending, Some(self.inner.config.batch_size))
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                drop(guard);
                self.inner.rerun_requested.store(false, Ordering::SeqCst);
                self.spawn_drain(self.inner.config.drain_delay());
                return Err(e.into());
            }
        };

        let mut report = DrainReport::drained();
        for operation in batch {
            report.attempted += 1;
            let id = operation.id.clone();
            match self.process_operation(operation).await {
                Ok(OperationOutcome::Succeeded) => report.succeeded += 1,
                Ok(OperationOutcome::Retried) => report.retried += 1,
                Ok(OperationOutcome::Failed) => report.failed += 1,
                Ok(OperationOutcome::Purged) => report.purged += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "store error while processing operation");
                    report.errors += 1;
                }
            }
        }

        let counts = match self.inner.store.counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "failed to read queue counts");
                report.errors += 1;
                None
            }
        };
        report.remaining = counts.map_or(0, |c| c.pending);
        drop(guard);
        let rerun = self.inner.rerun_requested.swap(false, Ordering::SeqCst);

        if let Some(counts) = counts {
            let _ = self.inner.status_tx.send(counts);
        }
        if report.attempted > 0 || report.errors > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.failed,
                purged = report.purged,
                errors = report.errors,
                remaining = report.remaining,
                "drain pass finished"
            );
        }
        if rerun {
            self.spawn_drain(Duration::ZERO);
        } else if report.remaining > 0 || report.errors > 0 {
            self.spawn_drain(self.inner.config.drain_delay());
        }
        Ok(report)
    }

    /// Take the drain guard, or leave a rerun request for its holder.
    fn acquire_or_request_rerun(&self) -> Option<DrainGuard<'_>> {
        if let Some(guard) = DrainGuard::acquire(&self.inner.draining) {
            self.inner.rerun_requested.store(false, Ordering::SeqCst);
            return Some(guard);
        }
        self.inner.rerun_requested.store(true, Ordering::SeqCst);
        // The holder may have released before seeing the request.
        let guard = DrainGuard::acquire(&self.inner.draining)?;
        self.inner.rerun_requested.store(false, Ordering::SeqCst);
        Some(guard)
    }

    /// Deliver one record and apply the resulting state transition.
    #[instrument(skip(self, operation), fields(id = %operation.id, op_type = %operation.op_type))]
    pub async fn process_operation(
        &self,
        mut operation: OperationRecord,
    ) -> SyncResult<OperationOutcome> {
        let store = &self.inner.store;
        let config = &self.inner.config;

        operation.status = OperationStatus::Processing;
        if !self.save(&operation).await? {
            return Ok(OperationOutcome::Purged);
        }

        let Some(executor) = self.inner.executors.get(&operation.op_type) else {
            let err = SyncError::ExecutorMissing {
                op_type: operation.op_type.clone(),
            };
            warn!(error = %err, "parking operation");
            operation.status = OperationStatus::Failed;
            operation.last_error = Some(err.to_string());
            if !self.save(&operation).await? {
                return Ok(OperationOutcome::Purged);
            }
            return Ok(OperationOutcome::Failed);
        };

        match self.run_executor(executor.as_ref(), &operation).await {
            Ok(()) => {
                if store.delete(&operation.id).await? {
                    debug!("operation delivered");
                } else {
                    debug!("operation delivered, record already purged");
                }
                Ok(OperationOutcome::Succeeded)
            }
            Err(err) => {
                operation.retry_count += 1;
                operation.last_error = Some(format!("{err:#}"));

                if operation.retry_count >= config.max_retries {
                    operation.status = OperationStatus::Failed;
                    if !self.save(&operation).await? {
                        return Ok(OperationOutcome::Purged);
                    }
                    warn!(
                        retry_count = operation.retry_count,
                        error = %err,
                        "retries exhausted, operation failed"
                    );
                    return Ok(OperationOutcome::Failed);
                }

                operation.status = OperationStatus::Pending;
                if !self.save(&operation).await? {
                    return Ok(OperationOutcome::Purged);
                }
                let delay = config.backoff_delay(operation.retry_count);
                warn!(
                    retry_count = operation.retry_count,
                    delay = ?delay,
                    error = %err,
                    "operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
                Ok(OperationOutcome::Retried)
            }
        }
    }

    /// Write back `operation`. `Ok(false)` when the record no longer exists.
    async fn save(&self, operation: &OperationRecord) -> SyncResult<bool> {
        match self.inner.store.update(operation).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound { .. }) => {
                debug!("operation purged while in flight");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_executor(
        &self,
        executor: &dyn OperationExecutor,
        operation: &OperationRecord,
    ) -> anyhow::Result<()> {
        let Some(after) = self.inner.config.execution_timeout() else {
            return executor.execute(operation).await;
        };
        match tokio::time::timeout(after, executor.execute(operation)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ExecutorTimeout {
                op_type: operation.op_type.clone(),
                after,
            }
            .into()),
        }
    }

    fn spawn_drain(&self, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = queue.process_queue().await {
                warn!(error = %e, "background drain failed");
            }
        });
    }

    // -- administration -----------------------------------------------------

    pub async fn stats(&self) -> SyncResult<QueueStats> {
        Ok(self.inner.store.counts().await?)
    }

    /// Whether any record still awaits delivery (pending or in flight).
    pub async fn has_pending(&self) -> SyncResult<bool> {
        let counts = self.stats().await?;
        Ok(counts.pending + counts.processing > 0)
    }

    pub async fn get_all(&self) -> SyncResult<Vec<OperationRecord>> {
        Ok(self.inner.store.list_all().await?)
    }

    pub async fn get_failed(&self) -> SyncResult<Vec<OperationRecord>> {
        Ok(self
            .inner
            .store
            .list_by_status(OperationStatus::Failed, None)
            .await?)
    }

    /// Return every failed record to `pending` with a zero retry count.
    /// Starts a drain if online. Returns the number reset.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let reset = self.inner.store.reset_failed().await?;
        info!(reset, "failed operations requeued");
        self.publish_status().await;
        if reset > 0 && self.is_online() {
            self.spawn_drain(Duration::ZERO);
        }
        Ok(reset)
    }

    pub async fn clear_failed(&self) -> SyncResult<usize> {
        let removed = self
            .inner
            .store
            .delete_by_status(OperationStatus::Failed)
            .await?;
        info!(removed, "failed operations cleared");
        self.publish_status().await;
        Ok(removed)
    }

    pub async fn clear_all(&self) -> SyncResult<usize> {
        let removed = self.inner.store.clear().await?;
        info!(removed, "queue cleared");
        self.publish_status().await;
        Ok(removed)
    }

    /// Purge one record regardless of status.
    pub async fn remove(&self, id: &str) -> SyncResult<bool> {
        let removed = self.inner.store.delete(id).await?;
        if removed {
            info!(id, "operation removed");
            self.publish_status().await;
        }
        Ok(removed)
    }

    /// Move records stranded in `processing` (a drain interrupted by a
    /// crash) back to `pending`. Call before the first drain.
    pub async fn recover_interrupted(&self) -> SyncResult<usize> {
        let recovered = self
            .inner
            .store
            .move_status(OperationStatus::Processing, OperationStatus::Pending)
            .await?;
        if recovered > 0 {
            info!(recovered, "interrupted operations returned to pending");
            self.publish_status().await;
        }
        Ok(recovered)
    }

    // -- status notifications -----------------------------------------------

    /// Receiver of per-status counts. Only changes published after this
    /// call are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueStats> {
        self.inner.status_tx.subscribe()
    }

    /// Invoke `callback` with fresh counts after every enqueue and drain
    /// pass until the returned subscription is dropped.
    pub fn on_status_change<F>(&self, callback: F) -> StatusSubscription
    where
        F: Fn(QueueStats) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(stats) => callback(stats),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "status subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        StatusSubscription { task }
    }

    async fn publish_status(&self) {
        match self.inner.store.counts().await {
            Ok(counts) => {
                // No receivers is fine.
                let _ = self.inner.status_tx.send(counts);
            }
            Err(e) => warn!(error = %e, "failed to read queue counts"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_queue(config: QueueConfig) -> OfflineQueue {
        OfflineQueue::new(
            StoreConnection::in_memory(),
            Connectivity::new(false),
            config,
        )
    }

    #[test]
    fn default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.drain_delay(), Duration::from_secs(1));
        assert!(config.execution_timeout().is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(16_000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(32_000));
        assert_eq!(config.backoff_delay(6), Duration::from_millis(60_000));
        assert_eq!(config.backoff_delay(200), Duration::from_millis(60_000));
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"batch_size": 3, "execution_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.execution_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn drain_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = DrainGuard::acquire(&flag).unwrap();
        assert!(DrainGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(DrainGuard::acquire(&flag).is_some());
    }

    #[test]
    fn busy_guard_leaves_rerun_request() {
        let queue = offline_queue(QueueConfig::default());
        let held = DrainGuard::acquire(&queue.inner.draining).unwrap();

        assert!(queue.acquire_or_request_rerun().is_none());
        assert!(queue.inner.rerun_requested.load(Ordering::SeqCst));

        drop(held);
        assert!(queue.acquire_or_request_rerun().is_some());
        assert!(!queue.inner.rerun_requested.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn offline_pass_is_a_no_op() {
        let queue = offline_queue(QueueConfig::default());
        queue
            .enqueue("update-animal", "animals", &json!({"peso": 410}), Some("a1"))
            .await
            .unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Offline);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
        assert!(queue.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_builds_pending_record() {
        let queue = offline_queue(QueueConfig::default());
        let id = queue
            .enqueue("create-animal", "animals", &json!({"brinco": "BR-7"}), None)
            .await
            .unwrap();

        let all = queue.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let record = &all[0];
        assert_eq!(record.id, id);
        assert!(id.starts_with("create-animal_"));
        assert_eq!(record.status, OperationStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.payload, json!({"brinco": "BR-7"}));
        assert!(record.target_document_id.is_none());
    }

    #[tokio::test]
    async fn remove_purges_one_record() {
        let queue = offline_queue(QueueConfig::default());
        let id = queue
            .enqueue("delete-animal", "animals", &json!({}), Some("a9"))
            .await
            .unwrap();

        assert!(queue.remove(&id).await.unwrap());
        assert!(!queue.remove(&id).await.unwrap());
        assert!(!queue.has_pending().await.unwrap());
    }
}
