//! Candidate file discovery
//!
//! Walks configured agent roots and classifies each file by reading enough
//! of it to identify the transcript format. Directory layout is never
//! authoritative: multiple agents can share a root and users rename
//! directories, so the header signature check decides which agent a file
//! belongs to. Unrelated files are skipped silently.

use crate::fsys::Fs;
use crate::parse::{all_parsers, SessionParser};
use crate::types::{AgentKind, CandidateFile};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Longest header prefix read while sniffing a file, in bytes.
const SNIFF_LIMIT: usize = 8 * 1024;

pub struct Discovery {
    fs: Arc<dyn Fs>,
    parsers: Vec<Box<dyn SessionParser>>,
}

impl Discovery {
    pub fn new(fs: Arc<dyn Fs>) -> Self {
        Self {
            fs,
            parsers: all_parsers(),
        }
    }

    /// Enumerate and classify candidate files under the roots configured for
    /// one agent. The detected agent may differ from `agent` when another
    /// agent's transcripts live in the same tree.
    pub fn discover(&self, agent: AgentKind, roots: &[std::path::PathBuf]) -> Vec<CandidateFile> {
        let mut candidates = Vec::new();

        for root in roots {
            let files = match self.fs.walk(root) {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "Failed to walk root");
                    continue;
                }
            };

            for path in files {
                if path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e != agent.extension())
                    .unwrap_or(true)
                {
                    continue;
                }

                let Some(detected) = self.classify(&path) else {
                    tracing::debug!(path = %path.display(), "No header signature matched");
                    continue;
                };

                let info = match self.fs.stat(&path) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Stat failed");
                        continue;
                    }
                };

                candidates.push(CandidateFile {
                    path,
                    agent: detected,
                    size: info.size,
                    mtime_ns: info.mtime_ns(),
                });
            }
        }

        candidates
    }

    /// Identify the agent format from the file's first non-empty line.
    pub fn classify(&self, path: &Path) -> Option<AgentKind> {
        let first_line = self.sniff_first_line(path)?;
        self.parsers
            .iter()
            .find(|p| p.matches_header(&first_line))
            .map(|p| p.agent())
    }

    fn sniff_first_line(&self, path: &Path) -> Option<String> {
        let mut reader = self.fs.open(path).ok()?;
        let mut buf = vec![0u8; SNIFF_LIMIT];
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Sniff read failed");
                    return None;
                }
            }
        }
        let text = String::from_utf8_lossy(&buf[..filled]);
        text.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::OsFs;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_discover_classifies_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.jsonl",
            "{\"type\":\"session\",\"id\":\"abc\",\"cwd\":\"/p\"}\n",
        );
        // A codex transcript living in the same root is still detected as codex
        write(
            dir.path(),
            "b.jsonl",
            "{\"timestamp\":\"t\",\"type\":\"session_meta\",\"payload\":{\"cwd\":\"/p\"}}\n",
        );
        // Unrelated files are tolerated
        write(dir.path(), "notes.txt", "hello\n");
        write(dir.path(), "junk.jsonl", "not json at all\n");

        let discovery = Discovery::new(Arc::new(OsFs));
        let mut candidates =
            discovery.discover(AgentKind::Pi, &[dir.path().to_path_buf()]);
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].agent, AgentKind::Pi);
        assert_eq!(candidates[1].agent, AgentKind::Codex);
        assert!(candidates[0].size > 0);
    }

    #[test]
    fn test_discover_missing_root() {
        let discovery = Discovery::new(Arc::new(OsFs));
        let candidates = discovery.discover(
            AgentKind::Pi,
            &[std::path::PathBuf::from("/nonexistent/scrollback-roots")],
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_sniff_skips_leading_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.jsonl",
            "\n\n{\"type\":\"session\",\"id\":\"abc\"}\n",
        );
        let discovery = Discovery::new(Arc::new(OsFs));
        assert_eq!(
            discovery.classify(&dir.path().join("a.jsonl")),
            Some(AgentKind::Pi)
        );
    }
}
