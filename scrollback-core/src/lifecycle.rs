//! Service lifecycle
//!
//! Startup: open the store, run migrations (failure here is fatal), then
//! kick off an initial full sync in the background and a periodic sync
//! timer. Shutdown: cancel outstanding work and let the in-flight sync
//! drain within a grace period; replacement is transactional, so a
//! truncated drain leaves the store consistent.

use crate::config::Config;
use crate::error::Result;
use crate::fsys::{Clock, Fs, OsFs, SystemClock};
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::watch::WatcherHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running scrollback core: store, sync engine, watcher hub, and the
/// background tasks that keep them fresh. This is the surface the HTTP
/// layer consumes.
pub struct Service {
    config: Arc<Config>,
    store: Arc<Store>,
    engine: Arc<SyncEngine>,
    watchers: WatcherHub,
    root: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Start with the OS filesystem and system clock.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, Arc::new(OsFs), Arc::new(SystemClock)).await
    }

    /// Start with explicit filesystem and clock implementations (tests).
    pub async fn start_with(
        config: Config,
        fs: Arc<dyn Fs>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let db_path = config.db_path.clone();
        let store = tokio::task::spawn_blocking(move || Store::open(&db_path))
            .await
            .map_err(|_| crate::error::Error::Cancelled)??;
        let store = Arc::new(store);

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            fs.clone(),
            clock.clone(),
            config.clone(),
        ));
        let watchers = WatcherHub::new(engine.clone(), fs.clone(), config.clone());

        let root = CancellationToken::new();
        let mut tasks = Vec::new();

        // Initial sync runs in the background so startup stays fast
        {
            let engine = engine.clone();
            let token = root.child_token();
            tasks.push(tokio::spawn(async move {
                tracing::info!("Starting initial sync");
                if let Err(e) = engine.sync_all(token, None).await {
                    tracing::warn!(error = %e, "Initial sync failed");
                }
            }));
        }

        // Periodic full sync; triggers queue behind any running sync
        {
            let engine = engine.clone();
            let token = root.child_token();
            let interval = config.sync_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    tracing::debug!("Periodic sync firing");
                    if let Err(e) = engine.sync_all(token.child_token(), None).await {
                        tracing::warn!(error = %e, "Periodic sync failed");
                    }
                }
            }));
        }

        Ok(Self {
            config,
            store,
            engine,
            watchers,
            root,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn sync(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn watchers(&self) -> &WatcherHub {
        &self.watchers
    }

    /// Cancel background work and wait for it to drain, bounded by `grace`.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!("Shutting down");
        self.root.cancel();
        for task in self.tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::warn!("Background task did not drain within grace period");
            }
        }
        // Store closes when the last Arc drops
    }
}
