//! Lazily-opened, shared storage connection.
//!
//! Every store in this crate takes a cloned [`StoreConnection`] rather than
//! reaching for a global. The underlying [`Database`] is opened and migrated
//! on first use; concurrent first callers share one attempt, and a failed
//! attempt is not cached so the next caller tries again.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Where the connection should open its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    /// A SQLite file on disk.
    File(PathBuf),
    /// A private in-memory database, discarded when the last clone drops.
    InMemory,
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::InMemory => f.write_str(":memory:"),
        }
    }
}

/// Cheaply cloneable handle to the process-wide storage connection.
#[derive(Clone)]
pub struct StoreConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    target: StorageTarget,
    db: OnceCell<Database>,
    open_attempts: AtomicU32,
}

impl StoreConnection {
    /// Create a connection that will open `target` on first use.
    pub fn new(target: StorageTarget) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                target,
                db: OnceCell::new(),
                open_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Shorthand for a file-backed connection.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(StorageTarget::File(path.into()))
    }

    /// Shorthand for an in-memory connection.
    pub fn in_memory() -> Self {
        Self::new(StorageTarget::InMemory)
    }

    /// Wrap an already opened and migrated database.
    pub fn from_database(db: Database) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                target: StorageTarget::InMemory,
                db: OnceCell::from(db),
                open_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Open and migrate the database if that has not happened yet.
    pub async fn init(&self) -> StoreResult<()> {
        self.database().await.map(|_| ())
    }

    /// Return the shared database, opening it on first call.
    pub async fn database(&self) -> StoreResult<Database> {
        self.inner
            .db
            .get_or_try_init(|| self.open())
            .await
            .cloned()
    }

    /// Whether a database has been successfully opened.
    pub fn is_initialized(&self) -> bool {
        self.inner.db.initialized()
    }

    /// Number of open attempts made so far, successful or not.
    pub fn open_attempts(&self) -> u32 {
        self.inner.open_attempts.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> &StorageTarget {
        &self.inner.target
    }

    async fn open(&self) -> StoreResult<Database> {
        let attempt = self.inner.open_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let result = match &self.inner.target {
            StorageTarget::File(path) => Database::open_and_migrate(path.clone()).await,
            StorageTarget::InMemory => match Database::open_in_memory() {
                Ok(db) => db.run_migrations().await.map(|()| db),
                Err(err) => Err(err),
            },
        };

        match result {
            Ok(db) => {
                info!(attempt, target = %self.inner.target, "storage connection ready");
                Ok(db)
            }
            Err(err) => {
                warn!(attempt, target = %self.inner.target, %err, "storage connection failed");
                Err(StoreError::Unavailable(format!("{}: {err}", self.inner.target)))
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
