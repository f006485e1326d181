//! Clock and filesystem abstractions
//!
//! The rest of the core reads the filesystem through the three-operation
//! [`Fs`] trait (walk, stat, open) and reads time through [`Clock`]. Keeping
//! the surface this small makes the test suite hermetic and lets tests inject
//! faults at the storage boundary.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Metadata for a single regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: DateTime<Utc>,
}

impl FileInfo {
    /// Modification time as Unix nanoseconds.
    pub fn mtime_ns(&self) -> i64 {
        self.mtime.timestamp_nanos_opt().unwrap_or(0)
    }
}

/// Read-only filesystem access.
pub trait Fs: Send + Sync {
    /// Recursively enumerate regular files under `root`, sorted by path.
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>>;

    /// Stat a path. A missing file or a non-directory parent component maps
    /// to an error for which [`Error::is_missing_path`] returns true.
    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Open a file for streaming read.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
}

/// [`Fs`] over the real operating system filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl Fs for OsFs {
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        walk_into(root, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        let mtime = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FileInfo {
            size: meta.len(),
            mtime,
        })
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(path)?;
        Ok(Box::new(file))
    }
}

fn walk_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unstatable entry");
                continue;
            }
        };
        if file_type.is_dir() {
            walk_into(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}
