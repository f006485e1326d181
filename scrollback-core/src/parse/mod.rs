//! Transcript parsers
//!
//! One parser per agent format. Parsers are pure: they read the file through
//! the [`Fs`] abstraction and produce normalized records, with no database
//! contact and no other I/O.
//!
//! ## Common contract
//!
//! - Input is JSON-Lines: one object per line, UTF-8. Blank lines are
//!   skipped silently; lines that fail to parse as JSON are logged and
//!   skipped without aborting the file.
//! - The session id comes from an explicit header field when the format has
//!   one, otherwise from the filename without extension.
//! - Events are walked in file order and assigned consecutive ordinals
//!   starting at zero (Claude's uuid DAG is linearized first, see
//!   [`claude`]).
//! - A parser returns an error only for truly unreadable input: an I/O
//!   failure, a missing required header, or a file with zero events.

pub mod claude;
pub mod codex;
pub mod copilot;
pub mod cursor;
pub mod gemini;
pub mod opencode;
pub mod pi;

use crate::error::Result;
use crate::fsys::Fs;
use crate::render;
use crate::types::{
    AgentKind, FileFingerprint, Message, RelationshipType, Role, Session, ToolCall,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Longest stored `first_message`, in characters.
const FIRST_MESSAGE_MAX: usize = 200;

/// Context a parser may fall back to when the file omits the information.
#[derive(Debug, Clone, Default)]
pub struct ParseHints {
    /// Project name, typically decoded from the source directory layout
    pub project: Option<String>,
    /// Host identifier
    pub machine: String,
}

/// Session-level parser output; the sync engine attaches the file
/// fingerprint after persisting succeeds.
#[derive(Debug, Clone)]
pub struct ParsedSession {
    pub id: String,
    pub project: String,
    pub machine: String,
    pub agent: AgentKind,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub first_message: Option<String>,
    pub message_count: i64,
    pub user_message_count: i64,
    pub parent_session_id: Option<String>,
    pub relationship: RelationshipType,
}

impl ParsedSession {
    pub(crate) fn new(id: String, agent: AgentKind, hints: &ParseHints) -> Self {
        Self {
            id,
            project: hints.project.clone().unwrap_or_else(|| "unknown".to_string()),
            machine: hints.machine.clone(),
            agent,
            started_at: None,
            ended_at: None,
            first_message: None,
            message_count: 0,
            user_message_count: 0,
            parent_session_id: None,
            relationship: RelationshipType::Root,
        }
    }

    /// Attach a source-file fingerprint, producing a storable [`Session`].
    pub fn into_session(self, file: FileFingerprint) -> Session {
        Session {
            id: self.id,
            project: self.project,
            machine: self.machine,
            agent: self.agent,
            started_at: self.started_at,
            ended_at: self.ended_at,
            first_message: self.first_message,
            message_count: self.message_count,
            user_message_count: self.user_message_count,
            parent_session_id: self.parent_session_id,
            relationship: self.relationship,
            file,
        }
    }
}

/// Message-level parser output; ordinals are assigned by [`finalize`].
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub has_thinking: bool,
    pub has_tool_use: bool,
    pub tool_calls: Vec<ToolCall>,
}

impl ParsedMessage {
    pub(crate) fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            timestamp: None,
            has_thinking: false,
            has_tool_use: false,
            tool_calls: Vec::new(),
        }
    }

    pub(crate) fn with_timestamp(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Convert into a storable [`Message`] at a fixed position.
    pub fn into_message(self, session_id: &str, ordinal: i64) -> Message {
        let content_length = self.content.chars().count() as i64;
        Message {
            session_id: session_id.to_string(),
            ordinal,
            role: self.role,
            content: self.content,
            timestamp: self.timestamp,
            has_thinking: self.has_thinking,
            has_tool_use: self.has_tool_use,
            content_length,
            tool_calls: self.tool_calls,
        }
    }
}

/// One normalized session plus its ordered messages.
///
/// Most formats yield exactly one unit per file; Claude yields one per
/// emitted branch.
#[derive(Debug, Clone)]
pub struct ParsedUnit {
    pub session: ParsedSession,
    pub messages: Vec<ParsedMessage>,
}

/// Trait implemented by all transcript parsers.
pub trait SessionParser: Send + Sync {
    /// Which agent format this parser handles
    fn agent(&self) -> AgentKind;

    /// Header signature check used by discovery to classify candidate files.
    /// `first_line` is the file's first non-empty line.
    fn matches_header(&self, first_line: &str) -> bool;

    /// Parse a transcript into normalized units.
    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>>;
}

/// All registered parsers, in stable order.
pub fn all_parsers() -> Vec<Box<dyn SessionParser>> {
    vec![
        Box::new(claude::ClaudeParser),
        Box::new(codex::CodexParser),
        Box::new(copilot::CopilotParser),
        Box::new(gemini::GeminiParser),
        Box::new(opencode::OpencodeParser),
        Box::new(cursor::CursorParser),
        Box::new(pi::PiParser),
    ]
}

/// The parser for a specific agent.
pub fn parser_for(agent: AgentKind) -> Box<dyn SessionParser> {
    match agent {
        AgentKind::Claude => Box::new(claude::ClaudeParser),
        AgentKind::Codex => Box::new(codex::CodexParser),
        AgentKind::Copilot => Box::new(copilot::CopilotParser),
        AgentKind::Gemini => Box::new(gemini::GeminiParser),
        AgentKind::Opencode => Box::new(opencode::OpencodeParser),
        AgentKind::Cursor => Box::new(cursor::CursorParser),
        AgentKind::Pi => Box::new(pi::PiParser),
    }
}

// ============================================
// Shared helpers
// ============================================

/// Read a file as JSON-Lines values: blank lines skipped, unparseable lines
/// logged and skipped, I/O errors propagated.
pub(crate) fn read_json_lines(fs: &dyn Fs, path: &Path, agent: AgentKind) -> Result<Vec<Value>> {
    let reader = BufReader::new(fs.open(path)?);
    let mut values = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) => values.push(v),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    agent = %agent,
                    error = %e,
                    "Skipping unparseable line"
                );
            }
        }
    }

    Ok(values)
}

/// Session id fallback: the filename without extension.
pub(crate) fn id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Parse an RFC3339 timestamp string.
pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().ok()
}

/// Timestamp field as either an RFC3339 string or Unix milliseconds.
pub(crate) fn ts_from_value(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_ts(s),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Project name from a header working-directory path: its final component.
pub(crate) fn project_from_cwd(cwd: &str) -> Option<String> {
    let trimmed = cwd.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let name = trimmed.rsplit('/').next()?.to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Decode a project hint from a filesystem-encoded parent directory name,
/// where path separators were replaced by dashes (`-home-u-proj` → `proj`).
/// Never authoritative; the header cwd wins when present.
pub fn project_hint_from_dir(path: &Path) -> Option<String> {
    let dir = path.parent()?.file_name()?.to_str()?;
    let last = dir.rsplit('-').find(|seg| !seg.is_empty())?;
    Some(last.to_string())
}

/// Fill in counters, time bounds, and the first-message preview.
/// Parsers call this once after walking all events.
pub(crate) fn finalize(session: &mut ParsedSession, messages: &[ParsedMessage]) {
    session.message_count = messages.len() as i64;
    session.user_message_count = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .count() as i64;

    let first_ts = messages.iter().find_map(|m| m.timestamp);
    let last_ts = messages.iter().rev().find_map(|m| m.timestamp);
    if session.started_at.is_none() {
        session.started_at = first_ts;
    }
    session.ended_at = last_ts.or(session.ended_at).or(session.started_at);
    if let (Some(start), Some(end)) = (session.started_at, session.ended_at) {
        if end < start {
            session.ended_at = Some(start);
        }
    }

    if session.first_message.is_none() {
        session.first_message = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| render::truncate_chars(m.content.trim(), FIRST_MESSAGE_MAX));
    }
}
