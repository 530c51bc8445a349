//! CLI argument definitions for herdsync.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// herdsync -- offline store and queue administration.
#[derive(Parser)]
#[command(
    name = "herdsync",
    version,
    about = "herdsync -- inspect and maintain the offline cache and operation queue",
    long_about = "Administrative access to a herdsync database: queue counts and failed \
                  operations, collection cache statistics and cleanup."
)]
pub struct Cli {
    /// Path to the TOML config file (default: config/herdsync.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config and HERDSYNC_DB.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and manage the offline operation queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect and maintain the collection cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show configuration and a database summary.
    Status,
}

/// Actions on the operation queue.
#[derive(Subcommand)]
pub enum QueueAction {
    /// Show pending / processing / failed counts.
    Stats,
    /// List queued operations, oldest first.
    List {
        /// Only show failed operations.
        #[arg(long)]
        failed: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Requeue every failed operation with a fresh retry budget.
    RetryFailed,
    /// Delete every failed operation.
    ClearFailed,
    /// Delete a single operation by id.
    Remove {
        /// The operation id.
        id: String,
    },
    /// Return operations stranded in `processing` to `pending`.
    Recover,
    /// Delete every queued operation, including pending ones.
    Clear {
        /// Required; pending writes are lost.
        #[arg(long)]
        yes: bool,
    },
}

/// Actions on the collection cache.
#[derive(Subcommand)]
pub enum CacheAction {
    /// Entry count, size, and oldest entry.
    Stats,
    /// Show storage metadata for one collection.
    Inspect {
        /// The collection key, e.g. `animals`.
        key: String,
    },
    /// Delete entries older than the given age or written under another
    /// cache version.
    Clean {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
    /// Delete one collection.
    Delete {
        key: String,
    },
    /// Delete every cached collection.
    Clear,
}
