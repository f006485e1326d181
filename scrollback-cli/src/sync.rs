//! scrollback-sync - one-shot sync of agent transcripts into the database
//!
//! Discovers transcript files for every configured agent, parses them into
//! the normalized session model, and populates the scrollback database.
//!
//! File locations follow the XDG Base Directory specification:
//! - Database: ~/.local/share/scrollback/scrollback.db
//! - Logs: ~/.local/state/scrollback/scrollback.log
//! - Config: ~/.config/scrollback/config.toml

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use scrollback_core::discover::Discovery;
use scrollback_core::fsys::{OsFs, SystemClock};
use scrollback_core::sync::SyncEngine;
use scrollback_core::{Config, Store, SyncStats};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "scrollback-sync")]
#[command(about = "Sync agent transcripts to the scrollback database")]
#[command(version)]
struct Args {
    /// Ignore the fingerprint cache and re-parse every file
    #[arg(long)]
    resync: bool,

    /// Dry run - discover files but don't sync
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = scrollback_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    tracing::info!("scrollback-sync starting");

    let fs = Arc::new(OsFs);

    if args.dry_run {
        let discovery = Discovery::new(fs);
        println!("Configured agent roots:");
        for (agent, roots) in &config.agent_roots {
            for root in roots {
                let count = discovery.discover(*agent, std::slice::from_ref(root)).len();
                println!("  - {}: {} file(s) at {}", agent, count, root.display());
            }
        }
        println!("\nDry run - no sync performed");
        tracing::info!("Dry run complete");
        return Ok(());
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db_path = config.db_path.clone();
    let store = tokio::task::spawn_blocking(move || Store::open(&db_path))
        .await?
        .context("failed to open database")?;
    println!("Database: {}", config.db_path.display());

    let engine = SyncEngine::new(
        Arc::new(store),
        fs,
        Arc::new(SystemClock),
        Arc::new(config),
    );

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let progress: scrollback_core::Progress = Arc::new(move |stats: &SyncStats| {
        bar.set_length(stats.total as u64);
        bar.set_position((stats.synced + stats.skipped + stats.errors) as u64);
        bar.set_message(format!("{} synced, {} skipped", stats.synced, stats.skipped));
    });

    let token = CancellationToken::new();
    let result = if args.resync {
        engine.resync_all(token, Some(progress)).await
    } else {
        engine.sync_all(token, Some(progress)).await
    }
    .context("sync failed")?;

    pb.finish_and_clear();

    println!("\nSync complete:");
    println!("  Files synced:  {}", result.synced);
    println!("  Files skipped: {}", result.skipped);
    println!("  Errors:        {}", result.errors);
    println!("  Total files:   {}", result.total);

    tracing::info!(
        synced = result.synced,
        skipped = result.skipped,
        errors = result.errors,
        "scrollback-sync complete"
    );

    Ok(())
}
