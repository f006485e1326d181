//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/scrollback/config.toml`, then
//! overlaid with environment variables. The result is an immutable snapshot
//! produced once at startup; discovery, the sync engine, and the watcher all
//! consult the snapshot and never re-read the environment.
//!
//! ## Agent roots
//!
//! Each agent's transcript roots resolve in precedence order:
//!
//! 1. `<AGENT>_DIRS` environment variable (colon-separated list)
//! 2. `<AGENT>_DIR` environment variable (single path)
//! 3. `[agents]` override in the config file
//! 4. The agent's default directory under `$HOME`

use crate::error::{Error, Result};
use crate::types::AgentKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable runtime configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved transcript roots, one entry per agent (possibly empty).
    pub agent_roots: Vec<(AgentKind, Vec<PathBuf>)>,
    /// Path of the embedded database file.
    pub db_path: PathBuf,
    /// Data directory holding the database.
    pub data_dir: PathBuf,
    /// Host identifier stamped on ingested sessions.
    pub machine: String,
    /// Watcher poll interval.
    pub poll_interval: Duration,
    /// Watcher heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Periodic full-sync interval.
    pub sync_interval: Duration,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_grace: Duration,
    /// Emit a sync progress tick at least every this many files.
    pub progress_every_files: usize,
    /// ...or at least this often, whichever comes first.
    pub progress_interval: Duration,
    /// How many leading bytes of a file feed the fingerprint hash.
    pub fingerprint_prefix: usize,
    /// Delete stored sessions whose source files vanished, on resync only.
    pub purge_missing: bool,
    /// Logging configuration (consumed by the binaries).
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================
// File representation
// ============================================

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    agents: AgentOverrides,
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    watch: WatchConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Override paths for agent transcript directories
#[derive(Debug, Deserialize, Default)]
struct AgentOverrides {
    claude_dir: Option<PathBuf>,
    codex_dir: Option<PathBuf>,
    copilot_dir: Option<PathBuf>,
    gemini_dir: Option<PathBuf>,
    opencode_dir: Option<PathBuf>,
    cursor_dir: Option<PathBuf>,
    pi_dir: Option<PathBuf>,
}

impl AgentOverrides {
    fn for_agent(&self, agent: AgentKind) -> Option<&PathBuf> {
        match agent {
            AgentKind::Claude => self.claude_dir.as_ref(),
            AgentKind::Codex => self.codex_dir.as_ref(),
            AgentKind::Copilot => self.copilot_dir.as_ref(),
            AgentKind::Gemini => self.gemini_dir.as_ref(),
            AgentKind::Opencode => self.opencode_dir.as_ref(),
            AgentKind::Cursor => self.cursor_dir.as_ref(),
            AgentKind::Pi => self.pi_dir.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DatabaseConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SyncConfig {
    #[serde(default = "default_sync_minutes")]
    interval_minutes: u64,
    #[serde(default)]
    purge_missing: bool,
    #[serde(default = "default_grace_secs")]
    shutdown_grace_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_sync_minutes(),
            purge_missing: false,
            shutdown_grace_secs: default_grace_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WatchConfig {
    #[serde(default = "default_poll_ms")]
    poll_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_sync_minutes() -> u64 {
    15
}

fn default_grace_secs() -> u64 {
    5
}

fn default_poll_ms() -> u64 {
    1500
}

fn default_heartbeat_secs() -> u64 {
    30
}

// ============================================
// Loading
// ============================================

impl Config {
    /// Load configuration from the default file path plus the environment.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let file = if config_path.exists() {
            Self::read_file(&config_path)?
        } else {
            tracing::info!(path = %config_path.display(), "No config file found, using defaults");
            FileConfig::default()
        };

        Ok(Self::resolve(file))
    }

    /// Load configuration from a specific file plus the environment.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let file = Self::read_file(path)?;
        Ok(Self::resolve(file))
    }

    fn read_file(path: &PathBuf) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    fn resolve(file: FileConfig) -> Self {
        let mut agent_roots = Vec::new();
        for agent in AgentKind::ALL {
            let roots = resolve_agent_roots(agent, &file.agents);
            agent_roots.push((agent, roots));
        }

        let data_dir = Self::data_dir();
        let db_path = std::env::var_os("SCROLLBACK_DB")
            .map(PathBuf::from)
            .or_else(|| file.database.path.clone())
            .unwrap_or_else(|| data_dir.join("scrollback.db"));

        let machine = std::env::var("SCROLLBACK_MACHINE")
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "local".to_string());

        Self {
            agent_roots,
            db_path,
            data_dir,
            machine,
            poll_interval: Duration::from_millis(file.watch.poll_ms),
            heartbeat_interval: Duration::from_secs(file.watch.heartbeat_secs),
            sync_interval: Duration::from_secs(file.sync.interval_minutes * 60),
            shutdown_grace: Duration::from_secs(file.sync.shutdown_grace_secs),
            progress_every_files: 25,
            progress_interval: Duration::from_millis(500),
            fingerprint_prefix: 64 * 1024,
            purge_missing: file.sync.purge_missing,
            logging: file.logging,
        }
    }

    /// Roots configured for one agent.
    pub fn roots_for(&self, agent: AgentKind) -> &[PathBuf] {
        self.agent_roots
            .iter()
            .find(|(a, _)| *a == agent)
            .map(|(_, roots)| roots.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrollback")
            .join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrollback")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrollback")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("scrollback.log")
    }
}

impl Default for Config {
    /// A snapshot with no agent roots and default tunables. Callers (tests,
    /// embedders) fill in `agent_roots` and `db_path`.
    fn default() -> Self {
        Self::resolve(FileConfig::default())
    }
}

fn resolve_agent_roots(agent: AgentKind, overrides: &AgentOverrides) -> Vec<PathBuf> {
    // List variant takes precedence and supplies multiple roots
    if let Ok(list) = std::env::var(agent.env_dirs_var()) {
        let roots: Vec<PathBuf> = list
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if !roots.is_empty() {
            return roots;
        }
    }

    if let Ok(single) = std::env::var(agent.env_dir_var()) {
        if !single.is_empty() {
            return vec![PathBuf::from(single)];
        }
    }

    if let Some(path) = overrides.for_agent(agent) {
        return vec![path.clone()];
    }

    agent.default_root().map(|p| vec![p]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.machine, "local");
        assert_eq!(config.poll_interval, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.sync_interval, Duration::from_secs(15 * 60));
        assert!(!config.purge_missing);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[agents]
pi_dir = "/tmp/pi-sessions"

[sync]
interval_minutes = 5
purge_missing = true

[watch]
poll_ms = 100

[logging]
level = "debug"
"#;
        let file: FileConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            file.agents.pi_dir.as_deref(),
            Some(std::path::Path::new("/tmp/pi-sessions"))
        );
        assert_eq!(file.sync.interval_minutes, 5);
        assert!(file.sync.purge_missing);
        assert_eq!(file.watch.poll_ms, 100);
        assert_eq!(file.logging.level, "debug");
    }

    #[test]
    fn test_env_dirs_split() {
        // Resolution itself reads the process environment, so exercise the
        // splitting logic through a variable unlikely to collide.
        std::env::set_var("CURSOR_DIRS", "/a:/b::/c");
        let roots = resolve_agent_roots(AgentKind::Cursor, &AgentOverrides::default());
        std::env::remove_var("CURSOR_DIRS");
        assert_eq!(
            roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }
}
