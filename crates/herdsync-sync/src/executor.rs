//! Executors and the per-type executor registry.
//!
//! An executor is whatever actually delivers a queued operation to the
//! backend (an HTTP call, an RPC, a sync push). The queue treats it as
//! opaque: `Ok(())` means delivered, any error means "try again later".
//! Delivery is at-least-once, so executors should be idempotent.
//!
//! The registry is backed by [`DashMap`] so executors can be registered
//! from any task while a drain is running.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use herdsync_store::OperationRecord;

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Delivers one operation to the backend.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &OperationRecord) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`OperationExecutor`].
struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> OperationExecutor for FnExecutor<F>
where
    F: Fn(OperationRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, operation: &OperationRecord) -> anyhow::Result<()> {
        (self.0)(operation.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent map from operation type to executor.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    inner: Arc<DashMap<String, Arc<dyn OperationExecutor>>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `op_type`, replacing any previous one.
    pub fn register(&self, op_type: impl Into<String>, executor: Arc<dyn OperationExecutor>) {
        let op_type = op_type.into();
        tracing::info!(op_type = %op_type, "executor registered");
        self.inner.insert(op_type, executor);
    }

    /// Register an async closure for `op_type`.
    pub fn register_fn<F, Fut>(&self, op_type: impl Into<String>, f: F)
    where
        F: Fn(OperationRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(op_type, Arc::new(FnExecutor(f)));
    }

    /// Remove the executor for `op_type`. Returns whether one existed.
    pub fn unregister(&self, op_type: &str) -> bool {
        let removed = self.inner.remove(op_type).is_some();
        if removed {
            tracing::info!(op_type, "executor unregistered");
        }
        removed
    }

    pub fn get(&self, op_type: &str) -> Option<Arc<dyn OperationExecutor>> {
        self.inner.get(op_type).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.inner.contains_key(op_type)
    }

    /// Registered operation types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
