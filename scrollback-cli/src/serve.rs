//! scrollback-serve - long-running service entry point
//!
//! Starts the core lifecycle: opens the store, runs an initial sync in the
//! background, and keeps a periodic sync timer going. Blocks until SIGINT,
//! then shuts down within the configured grace period.
//!
//! The HTTP/SSE layer is hosted by this process but lives outside the core;
//! it consumes the running [`Service`]'s store, sync engine, and watcher
//! hub.

use anyhow::{Context, Result};
use clap::Parser;
use scrollback_core::{Config, Service};

#[derive(Parser)]
#[command(name = "scrollback-serve")]
#[command(about = "Run the scrollback ingestion service")]
#[command(version)]
struct Args {
    /// Override the config file path
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard = scrollback_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    tracing::info!("scrollback-serve starting");
    println!("Database: {}", config.db_path.display());

    let grace = config.shutdown_grace;
    let service = Service::start(config)
        .await
        .context("failed to start service")?;

    println!("Service running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    println!("\nShutting down...");
    service.shutdown(grace).await;
    tracing::info!("scrollback-serve stopped");

    Ok(())
}
