//! Scanledger deployment entrypoint.
//!
//! Exposes the one-shot schema-initialization command: it connects to the
//! configured backend, idempotently applies constraints and indexes, and
//! exits. Safe to re-run against an already-initialized store.

use anyhow::Context;
use clap::{Parser, Subcommand};
use scanledger::config::StorageSettings;
use scanledger::storage;
use tracing_subscriber::EnvFilter;

/// Scanledger - persistence for graded website security scans.
#[derive(Parser, Debug)]
#[command(name = "scanledger")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scan store administration", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Storage backend, overriding SCANLEDGER_BACKEND
    #[arg(long, global = true, value_name = "BACKEND")]
    backend: Option<String>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Idempotently apply schema constraints and indexes
    Migrate,
    /// Recompute precomputed aggregates (no-op on the graph backend)
    Refresh,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut settings = StorageSettings::from_env().context("loading storage settings")?;
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }

    let store = storage::connect(&settings)
        .await
        .context("connecting to the scan store")?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await.context("applying schema")?;
        }
        Commands::Refresh => {
            store
                .refresh_materialized_views()
                .await
                .context("refreshing aggregates")?;
        }
    }

    store.close().await.context("closing the scan store")?;
    Ok(())
}
