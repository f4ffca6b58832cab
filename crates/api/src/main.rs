use anyhow::Context;
use clap::Parser;
use inferwatch_indexer::config::{Config, LoggingConfig};

#[derive(Parser)]
#[command(name = "inferwatch-api")]
#[command(version, about = "HTTP read API for the inferwatch chain cache", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "inferwatch.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config).context("Failed to load configuration")?;
    init_logging(cli.debug, &config.logging)?;

    tracing::info!("inferwatch API starting (version {})", env!("CARGO_PKG_VERSION"));
    inferwatch_api::run_with_config(config).await
}

fn init_logging(debug: bool, logging: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("inferwatch_api=debug,inferwatch_indexer=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "inferwatch_api={level},inferwatch_indexer={level},tower_http=info",
                level = logging.level
            ))
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
