//! CLI entry point for herdsync.
//!
//! This binary provides the `herdsync` command for inspecting and
//! maintaining the offline cache and operation queue of a herdsync
//! database. It never delivers operations itself; that needs the
//! application's executors.

mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{DB_ENV_VAR, Settings};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let (mut settings, source) = Settings::load(cli.config.as_deref())?;
    settings.apply_overrides(std::env::var(DB_ENV_VAR).ok(), cli.db);
    tracing::debug!(db = %settings.storage.db_path.display(), "settings loaded");

    match cli.command {
        Commands::Queue { action } => commands::queue(&settings, action).await,
        Commands::Cache { action } => commands::cache(&settings, action).await,
        Commands::Status => commands::status(&settings, source.as_deref()).await,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
