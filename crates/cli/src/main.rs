mod config;
mod serve;
mod storage;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracksync_engine::{KeyedLocks, SnapshotStore};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{AppConfig, StorageBackend};

/// Long-running sync operations across ticket trackers, with rollback.
#[derive(Parser)]
#[command(name = "tracksync", version, about = "Tracker sync engine")]
struct Cli {
    /// Config file (default: ./tracksync.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend, overriding config and environment
    #[arg(long, global = true, value_enum)]
    storage_backend: Option<StorageBackend>,

    /// Database file or data directory, overriding config and environment
    #[arg(long, global = true)]
    storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Purge expired snapshots once and print how many were removed
    Purge {
        /// Retention window in days (default: engine.snapshot_retention_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tracksync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };
    if let Some(backend) = cli.storage_backend {
        config.storage.backend = backend;
    }
    if let Some(path) = cli.storage_path {
        config.storage.path = Some(path);
    }

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Err(e) = config.validate() {
                eprintln!("error: {e}");
                process::exit(2);
            }
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {e}");
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Purge { older_than_days } => {
            let days = older_than_days.unwrap_or(config.engine.snapshot_retention_days);
            match cmd_purge(&config, days) {
                Ok(purged) => println!("purged {purged} snapshot(s) older than {days} day(s)"),
                Err(e) => {
                    eprintln!("error: {e}");
                    process::exit(1);
                }
            }
        }
        Commands::Config => {
            if let Err(e) = config.validate() {
                eprintln!("error: {e}");
                process::exit(2);
            }
            match serde_json::to_string_pretty(&config.redacted()) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    process::exit(1);
                }
            }
        }
    }
}

fn cmd_purge(config: &AppConfig, days: u32) -> Result<usize, Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let storage = storage::open_storage(&config.storage)?;
        let snapshots = SnapshotStore::new(
            storage,
            Arc::new(KeyedLocks::new()),
            config.engine.storage_retries,
        );
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
        let purged = snapshots.purge(cutoff).await?;
        Ok::<_, Box<dyn std::error::Error>>(purged)
    })
}
