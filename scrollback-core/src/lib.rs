//! # scrollback-core
//!
//! Core ingestion pipeline for scrollback - a local, single-process service
//! that turns the JSON-Lines transcripts of several agent CLI tools into one
//! searchable, live-updating session store.
//!
//! This library provides:
//! - Normalized domain types for sessions and messages
//! - Pure per-format transcript parsers (Claude, Codex, Copilot, Gemini,
//!   OpenCode, Cursor, Pi)
//! - Candidate discovery with header-signature classification
//! - A SQLite storage layer with atomic message replacement and an optional
//!   FTS5 full-text shadow
//! - A coalescing sync engine, per-session watchers, and service lifecycle
//!
//! ## Data flow
//!
//! ```text
//! Discovery ──► Sync Engine ──► Parser ──► Store ──► Watcher ticks
//!  (walk +       (fingerprint    (pure)    (atomic     (poll mtime,
//!   sniff)        filter)                   replace)     SSE fan-out)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use scrollback_core::{Config, Service};
//!
//! # async fn run() -> scrollback_core::Result<()> {
//! let config = Config::load()?;
//! let service = Service::start(config).await?;
//! let stats = service.sync().last_sync_stats();
//! println!("{} sessions synced", stats.synced);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::Service;
pub use store::{Deadline, Store};
pub use sync::{Progress, SyncEngine};
pub use types::*;
pub use watch::WatcherHub;

// Public modules
pub mod config;
pub mod discover;
pub mod error;
pub mod fsys;
pub mod lifecycle;
pub mod logging;
pub mod parse;
pub mod render;
pub mod store;
pub mod sync;
pub mod types;
pub mod watch;
