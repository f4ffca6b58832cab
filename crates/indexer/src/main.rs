//! inferwatch indexer: keeps the chain cache warm.
//!
//! This binary provides:
//! - The scheduled pollers (one task per data kind)
//! - One-shot maintenance commands (reward sweep, inference cycle)
//! - Database initialisation and status
//!
//! Note: The HTTP API is provided by the separate `inferwatch-api` service,
//! which can also host the pollers itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use inferwatch_indexer::config::{Config, LoggingConfig};
use inferwatch_indexer::storage::Storage;
use inferwatch_indexer::{spawn_pollers, SyncEngine};

#[derive(Parser)]
#[command(name = "inferwatch-indexer")]
#[command(version, about = "Cache and sync engine for the inference chain", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "inferwatch.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pollers until Ctrl+C
    Run,

    /// Show cache row counts and the latest cached epoch
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://inferwatch.db")]
        database_url: String,
    },

    /// Run one reward total sweep and exit
    SweepRewards,

    /// Run one inference cycle and exit
    PollInferences,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The logging section is optional; fall back to defaults when the config
    // cannot be read yet (init-db, status on a fresh host).
    let logging = Config::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging)?;

    info!("inferwatch indexer starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_indexer(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
        Commands::SweepRewards => sweep_rewards(&cli.config).await?,
        Commands::PollInferences => poll_inferences(&cli.config).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("inferwatch_indexer=debug,sqlx=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("inferwatch_indexer={}", logging.level))
        })
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_line_number(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()
    }
    .context("Failed to initialize logging")?;

    Ok(())
}

async fn load_engine(config_path: &str) -> Result<Arc<SyncEngine>> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    info!("Configuration loaded successfully");
    info!("  Upstream: {}", config.upstream.base_urls.join(", "));
    info!("  Database: {}", config.database.url);

    let engine = SyncEngine::connect(&config).await?;
    Ok(Arc::new(engine))
}

/// Main indexer service - runs every poller until Ctrl+C
async fn run_indexer(config_path: &str) -> Result<()> {
    info!("Starting indexer service with config: {}", config_path);
    let engine = load_engine(config_path).await?;

    let token = CancellationToken::new();
    let handles = spawn_pollers(Arc::clone(&engine), token.clone());
    info!("{} pollers started. Press Ctrl+C to stop.", handles.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received shutdown signal, gracefully shutting down...");

    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Poller task ended abnormally: {}", e);
        }
    }
    engine.storage().close().await;

    Ok(())
}

/// Run one reward total sweep
async fn sweep_rewards(config_path: &str) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let sweep = engine.sweep_reward_totals().await;
    engine.storage().close().await;

    let sweep = sweep.context("Reward sweep failed")?;
    info!(
        "Reward sweep done: {} valid, {} computed, {} pending",
        sweep.valid, sweep.computed, sweep.pending
    );
    Ok(())
}

/// Run one inference cycle
async fn poll_inferences(config_path: &str) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let cycle = engine.poll_inferences().await;
    engine.storage().close().await;

    let cycle = cycle.context("Inference cycle failed")?;
    info!(
        "Inference cycle done: {} records over {} pages, {} rows in {} groups",
        cycle.records, cycle.pages, cycle.rows, cycle.groups
    );
    Ok(())
}

/// Show cache status
async fn show_status(config_path: &str) -> Result<()> {
    info!("Checking indexer status");

    // Fall back to the default database ONLY if the config file doesn't exist
    let (database_url, max_conn, min_conn) = match Config::from_file(config_path) {
        Ok(config) => {
            info!("Using database from config: {}", config.database.url);
            (
                config.database.url,
                Some(config.database.max_connections),
                Some(config.database.min_connections),
            )
        }
        Err(e) => {
            // Config::from_file wraps errors with context, so walk the chain
            let is_not_found = e.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
            });

            if is_not_found {
                info!("Config file not found, using default database: sqlite://inferwatch.db");
                ("sqlite://inferwatch.db".to_string(), None, None)
            } else {
                return Err(e).context("Failed to load config file");
            }
        }
    };

    let storage = Storage::new(&database_url, max_conn, min_conn)
        .await
        .context("Failed to connect to database")?;
    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let stats = storage.stats().await?;

    println!("\n=== inferwatch Cache Status ===\n");
    match stats.latest_epoch {
        Some(epoch) => println!("Latest cached epoch: {}", epoch),
        None => println!("No epochs cached yet."),
    }
    println!("\nDatabase Statistics:");
    println!("  Snapshots: {}", stats.snapshot_count);
    println!("  Finished epochs: {}", stats.finished_epoch_count);
    println!("  Model aggregates: {}", stats.model_aggregate_count);
    println!("  Rewards: {}", stats.reward_count);
    println!("  Reward totals: {}", stats.reward_total_count);
    println!("  Auxiliary records: {}", stats.auxiliary_count);
    println!("  Inference rows: {}", stats.inference_row_count);
    println!("  Jail statuses: {}", stats.jail_status_count);
    println!("  Node health probes: {}", stats.node_health_count);
    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  Snapshots: {}", stats.snapshot_count);
    info!("  Rewards: {}", stats.reward_count);

    storage.close().await;

    Ok(())
}
