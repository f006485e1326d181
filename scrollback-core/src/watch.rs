//! Session watcher
//!
//! One polling task per subscribed session. Each tick the watcher stats the
//! session's source file; when the mtime advances it re-syncs the session
//! and publishes an `Updated` tick. A `Heartbeat` tick goes out on a fixed
//! interval regardless of activity so subscribers can tell a quiet session
//! from a dead stream.
//!
//! Path cache rules: a stat error that means "the file is gone" clears the
//! cached path so a later tick can re-resolve it (the file may reappear
//! elsewhere); transient errors keep the cache so the next tick retries.

use crate::config::Config;
use crate::fsys::Fs;
use crate::sync::SyncEngine;
use crate::types::Tick;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Subscriber channel depth; a slow consumer drops ticks rather than
/// stalling the poll loop.
const TICK_BUFFER: usize = 16;

/// Spawns and owns per-session watcher tasks.
pub struct WatcherHub {
    engine: Arc<SyncEngine>,
    fs: Arc<dyn Fs>,
    config: Arc<Config>,
}

impl WatcherHub {
    pub fn new(engine: Arc<SyncEngine>, fs: Arc<dyn Fs>, config: Arc<Config>) -> Self {
        Self { engine, fs, config }
    }

    /// Subscribe to updates for one session. The returned channel yields
    /// [`Tick`] values and closes when `cancel` fires.
    pub fn subscribe(&self, session_id: &str, cancel: CancellationToken) -> mpsc::Receiver<Tick> {
        let (tx, rx) = mpsc::channel(TICK_BUFFER);
        let watcher = SessionWatcher {
            engine: self.engine.clone(),
            fs: self.fs.clone(),
            session_id: session_id.to_string(),
            poll_interval: self.config.poll_interval,
            heartbeat_interval: self.config.heartbeat_interval,
        };
        tokio::spawn(watcher.run(cancel, tx));
        rx
    }
}

struct SessionWatcher {
    engine: Arc<SyncEngine>,
    fs: Arc<dyn Fs>,
    session_id: String,
    poll_interval: std::time::Duration,
    heartbeat_interval: std::time::Duration,
}

impl SessionWatcher {
    async fn run(self, cancel: CancellationToken, tx: mpsc::Sender<Tick>) {
        let mut source_path: Option<PathBuf> = None;
        let mut last_mtime_ns: i64 = 0;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let polls_per_heartbeat = (self.heartbeat_interval.as_millis()
            / self.poll_interval.as_millis().max(1))
        .max(1) as u64;
        let mut polls: u64 = 0;

        tracing::debug!(session = %self.session_id, "Watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            polls += 1;
            if polls >= polls_per_heartbeat {
                polls = 0;
                if tx.send(Tick::Heartbeat).await.is_err() {
                    break;
                }
            }

            if source_path.is_none() {
                source_path = self.engine.find_source_file(&self.session_id).await;
                if source_path.is_none() {
                    continue;
                }
                tracing::debug!(
                    session = %self.session_id,
                    path = %source_path.as_ref().unwrap().display(),
                    "Watcher resolved source file"
                );
            }

            let path = source_path.as_ref().unwrap().clone();
            match self.fs.stat(&path) {
                Err(e) if e.is_missing_path() => {
                    tracing::debug!(session = %self.session_id, "Source file gone, clearing cache");
                    source_path = None;
                    last_mtime_ns = 0;
                }
                Err(e) => {
                    // Transient; keep the cached path and retry next tick
                    tracing::warn!(session = %self.session_id, error = %e, "Stat failed");
                }
                Ok(info) => {
                    let mtime_ns = info.mtime_ns();
                    if mtime_ns > last_mtime_ns {
                        last_mtime_ns = mtime_ns;
                        match self.engine.sync_single_session(&self.session_id).await {
                            Ok(()) => {
                                if tx.send(Tick::Updated).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    session = %self.session_id,
                                    error = %e,
                                    "Watcher sync failed"
                                );
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(session = %self.session_id, "Watcher stopped");
        // Dropping tx closes the subscriber's channel
    }
}
