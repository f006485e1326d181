//! Sync engine
//!
//! Owns the end-to-end ingestion flow: discovery → fingerprint filter →
//! parse → transactional persistence → progress reporting. At most one full
//! sync runs at a time; concurrent triggers coalesce onto the running sync
//! and observe its terminal stats.
//!
//! Ordering: candidates are processed in ascending path order, and for each
//! session the upsert happens before its message replacement, both completing
//! before the next file starts. Cancellation is honored between files, never
//! mid-transaction.

use crate::config::Config;
use crate::discover::Discovery;
use crate::error::{Error, Result};
use crate::fsys::{Clock, Fs};
use crate::parse::{parser_for, project_hint_from_dir, ParseHints};
use crate::store::{Deadline, Store};
use crate::types::{CandidateFile, FileFingerprint, Message, SyncStats};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Progress callback invoked with running counters during a sync.
pub type Progress = Arc<dyn Fn(&SyncStats) + Send + Sync>;

enum FileOutcome {
    Synced,
    Skipped,
}

struct Shared {
    /// Receiver for the in-flight sync's terminal stats, when one is running
    running: Option<watch::Receiver<Option<SyncStats>>>,
    last_sync: Option<DateTime<Utc>>,
    last_stats: SyncStats,
}

/// Coordinates discovery, parsing, and persistence across all agents.
pub struct SyncEngine {
    store: Arc<Store>,
    fs: Arc<dyn Fs>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    shared: Arc<Mutex<Shared>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        fs: Arc<dyn Fs>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            fs,
            clock,
            config,
            shared: Arc::new(Mutex::new(Shared {
                running: None,
                last_sync: None,
                last_stats: SyncStats::default(),
            })),
        }
    }

    /// Full sync of every discovered file, skipping unchanged fingerprints.
    /// A caller arriving while a sync is already running waits for that sync
    /// and observes its stats.
    pub async fn sync_all(
        &self,
        cancel: CancellationToken,
        progress: Option<Progress>,
    ) -> Result<SyncStats> {
        self.run_or_join(false, cancel, progress).await
    }

    /// Full sync ignoring the fingerprint cache (forces re-parse). When the
    /// config opts into purging, sessions whose source files vanished are
    /// deleted afterwards.
    pub async fn resync_all(
        &self,
        cancel: CancellationToken,
        progress: Option<Progress>,
    ) -> Result<SyncStats> {
        self.run_or_join(true, cancel, progress).await
    }

    /// Timestamp of the last completed sync.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().unwrap().last_sync
    }

    /// Stats of the last completed sync.
    pub fn last_sync_stats(&self) -> SyncStats {
        self.shared.lock().unwrap().last_stats
    }

    /// Re-parse exactly one session's source file. Missing source is a
    /// no-op.
    pub async fn sync_single_session(&self, id: &str) -> Result<()> {
        let store = self.store.clone();
        let fs = self.fs.clone();
        let config = self.config.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let Some(path) = find_source_file_blocking(&store, &fs, &config, &id) else {
                tracing::debug!(session = %id, "No source file found, skipping sync");
                return Ok(());
            };
            let discovery = Discovery::new(fs.clone());
            let Some(agent) = discovery.classify(&path) else {
                tracing::warn!(path = %path.display(), "Source file no longer matches any format");
                return Ok(());
            };
            let info = fs.stat(&path)?;
            let candidate = CandidateFile {
                path,
                agent,
                size: info.size,
                mtime_ns: info.mtime_ns(),
            };
            sync_file(&store, fs.as_ref(), &config, &candidate, true).map(|_| ())
        })
        .await
        .map_err(|_| Error::Cancelled)?
    }

    /// Locate the source file for a session: the stored fingerprint path
    /// when it still exists, otherwise a bounded scan of the configured
    /// roots that short-circuits on the first match.
    pub async fn find_source_file(&self, id: &str) -> Option<PathBuf> {
        let store = self.store.clone();
        let fs = self.fs.clone();
        let config = self.config.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || find_source_file_blocking(&store, &fs, &config, &id))
            .await
            .ok()
            .flatten()
    }

    async fn run_or_join(
        &self,
        force: bool,
        cancel: CancellationToken,
        progress: Option<Progress>,
    ) -> Result<SyncStats> {
        enum RunRole {
            Runner(watch::Sender<Option<SyncStats>>),
            Joiner(watch::Receiver<Option<SyncStats>>),
        }

        let role = {
            let mut shared = self.shared.lock().unwrap();
            match &shared.running {
                Some(rx) => RunRole::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    shared.running = Some(rx);
                    RunRole::Runner(tx)
                }
            }
        };

        match role {
            RunRole::Joiner(mut rx) => {
                tracing::debug!("Sync already in flight, waiting for its stats");
                let value = rx
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| Error::Cancelled)?;
                Ok((*value).expect("terminal stats set"))
            }
            RunRole::Runner(tx) => {
                let store = self.store.clone();
                let fs = self.fs.clone();
                let config = self.config.clone();
                let result = tokio::task::spawn_blocking(move || {
                    run_batch_blocking(&store, &fs, &config, force, &cancel, progress.as_ref())
                })
                .await
                .map_err(|_| Error::Cancelled);

                let mut shared = self.shared.lock().unwrap();
                shared.running = None;
                match result {
                    Ok(stats) => {
                        shared.last_stats = stats;
                        shared.last_sync = Some(self.clock.now());
                        drop(shared);
                        let _ = tx.send(Some(stats));
                        tracing::info!(
                            synced = stats.synced,
                            skipped = stats.skipped,
                            errors = stats.errors,
                            total = stats.total,
                            "Sync complete"
                        );
                        Ok(stats)
                    }
                    Err(e) => {
                        // Dropping the sender wakes joiners with an error
                        drop(shared);
                        drop(tx);
                        Err(e)
                    }
                }
            }
        }
    }
}

// ============================================
// Blocking batch internals
// ============================================

fn run_batch_blocking(
    store: &Store,
    fs: &Arc<dyn Fs>,
    config: &Config,
    force: bool,
    cancel: &CancellationToken,
    progress: Option<&Progress>,
) -> SyncStats {
    let discovery = Discovery::new(fs.clone());

    let mut candidates = Vec::new();
    for (agent, roots) in &config.agent_roots {
        candidates.extend(discovery.discover(*agent, roots));
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates.dedup_by(|a, b| a.path == b.path);

    let mut stats = SyncStats {
        total: candidates.len(),
        ..Default::default()
    };
    let mut last_tick = Instant::now();
    let mut files_since_tick = 0usize;

    for candidate in &candidates {
        // Stop between files, never mid-transaction
        if cancel.is_cancelled() {
            tracing::info!("Sync cancelled");
            break;
        }

        match sync_file(store, fs.as_ref(), config, candidate, force) {
            Ok(FileOutcome::Synced) => stats.synced += 1,
            Ok(FileOutcome::Skipped) => stats.skipped += 1,
            Err(e) => {
                tracing::warn!(path = %candidate.path.display(), error = %e, "Failed to sync file");
                stats.errors += 1;
            }
        }

        files_since_tick += 1;
        if let Some(cb) = progress {
            if files_since_tick >= config.progress_every_files
                || last_tick.elapsed() >= config.progress_interval
            {
                cb(&stats);
                files_since_tick = 0;
                last_tick = Instant::now();
            }
        }
    }

    if force && config.purge_missing && !cancel.is_cancelled() {
        purge_missing_sessions(store, fs.as_ref());
    }

    if let Some(cb) = progress {
        cb(&stats);
    }
    stats
}

fn sync_file(
    store: &Store,
    fs: &dyn Fs,
    config: &Config,
    candidate: &CandidateFile,
    force: bool,
) -> Result<FileOutcome> {
    let fingerprint = fingerprint_file(fs, &candidate.path, config.fingerprint_prefix)?;

    if !force {
        if let Some(stored) = store.get_fingerprint(&fingerprint.path)? {
            if stored == fingerprint {
                return Ok(FileOutcome::Skipped);
            }
        }
    }

    let parser = parser_for(candidate.agent);
    let hints = ParseHints {
        project: project_hint_from_dir(&candidate.path),
        machine: config.machine.clone(),
    };
    let units = parser.parse(fs, &candidate.path, &hints)?;

    for unit in units {
        let session = unit.session.into_session(fingerprint.clone());
        let messages: Vec<Message> = unit
            .messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| m.into_message(&session.id, i as i64))
            .collect();
        store.upsert_session(&session)?;
        store.replace_session_messages(&session.id, &messages)?;
    }

    Ok(FileOutcome::Synced)
}

/// Light fingerprint: size + mtime + hash of the file's leading bytes.
fn fingerprint_file(fs: &dyn Fs, path: &Path, prefix_len: usize) -> Result<FileFingerprint> {
    let info = fs.stat(path)?;
    let mut reader = fs.open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 8192];
    let mut remaining = prefix_len;
    while remaining > 0 {
        let want = buf.len().min(remaining);
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n;
    }

    Ok(FileFingerprint {
        path: path.to_string_lossy().to_string(),
        size: info.size as i64,
        mtime_ns: info.mtime_ns(),
        hash: hex::encode(hasher.finalize()),
    })
}

fn purge_missing_sessions(store: &Store, fs: &dyn Fs) {
    let files = match store.list_session_files() {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to enumerate stored sessions for purge");
            return;
        }
    };
    for (id, path) in files {
        match fs.stat(Path::new(&path)) {
            Err(e) if e.is_missing_path() => {
                tracing::info!(session = %id, path = %path, "Purging session with missing source");
                if let Err(e) = store.delete_session(&id) {
                    tracing::warn!(session = %id, error = %e, "Failed to purge session");
                }
            }
            _ => {}
        }
    }
}

fn find_source_file_blocking(
    store: &Store,
    fs: &Arc<dyn Fs>,
    config: &Config,
    id: &str,
) -> Option<PathBuf> {
    // Stored fingerprint path first
    if let Ok(Some(session)) = store.get_session(id, Deadline::none()) {
        let path = PathBuf::from(&session.file.path);
        if fs.stat(&path).is_ok() {
            return Some(path);
        }
    }

    // Bounded scan over configured roots, first match wins
    let discovery = Discovery::new(fs.clone());
    for (agent, roots) in &config.agent_roots {
        for candidate in discovery.discover(*agent, roots) {
            if candidate_has_id(fs.as_ref(), &candidate.path, id) {
                return Some(candidate.path);
            }
        }
    }
    None
}

/// Cheap probe: does this file's stem or header id match the session id?
fn candidate_has_id(fs: &dyn Fs, path: &Path, id: &str) -> bool {
    if path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s == id)
        .unwrap_or(false)
    {
        return true;
    }

    let Ok(mut reader) = fs.open(path) else {
        return false;
    };
    let mut buf = vec![0u8; 8 * 1024];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    let text = String::from_utf8_lossy(&buf[..filled]);
    let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return false;
    };
    ["id", "sessionId", "composerId"]
        .iter()
        .any(|field| value.get(field).and_then(Value::as_str) == Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::OsFs;

    #[test]
    fn test_fingerprint_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "{\"x\":1}\n").unwrap();

        let a = fingerprint_file(&OsFs, &path, 64 * 1024).unwrap();
        let b = fingerprint_file(&OsFs, &path, 64 * 1024).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size, 8);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "one\n").unwrap();
        let a = fingerprint_file(&OsFs, &path, 64 * 1024).unwrap();
        std::fs::write(&path, "two\n").unwrap();
        let b = fingerprint_file(&OsFs, &path, 64 * 1024).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_candidate_has_id() {
        let dir = tempfile::tempdir().unwrap();
        let by_stem = dir.path().join("abc.jsonl");
        std::fs::write(&by_stem, "{}\n").unwrap();
        assert!(candidate_has_id(&OsFs, &by_stem, "abc"));

        let by_header = dir.path().join("random-name.jsonl");
        std::fs::write(
            &by_header,
            "{\"type\":\"session\",\"id\":\"abc\",\"cwd\":\"/p\"}\n",
        )
        .unwrap();
        assert!(candidate_has_id(&OsFs, &by_header, "abc"));
        assert!(!candidate_has_id(&OsFs, &by_header, "xyz"));
    }
}
