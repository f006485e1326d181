//! Core domain types for scrollback
//!
//! These types form the normalized model every agent transcript collapses
//! into: a [`Session`] identified by a string id, and its [`Message`] rows
//! identified by `(session_id, ordinal)` with dense 0-based ordinals.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Agent** | An upstream CLI tool whose transcripts are ingested (closed set) |
//! | **Session** | One conversation transcript; the primary entity |
//! | **Message** | One turn inside a session, addressed by `(session_id, ordinal)` |
//! | **Fingerprint** | `{path, size, mtime, hash}` of the source file at last parse |
//! | **Minimap** | Downsampled message list (role + ordinal + timestamp) for scroll maps |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================
// Agents
// ============================================

/// Supported upstream agents (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    Copilot,
    Gemini,
    Opencode,
    Cursor,
    Pi,
}

impl AgentKind {
    /// Every agent, in stable order.
    pub const ALL: [AgentKind; 7] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Copilot,
        AgentKind::Gemini,
        AgentKind::Opencode,
        AgentKind::Cursor,
        AgentKind::Pi,
    ];

    /// Identifier used in database storage and the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Copilot => "copilot",
            AgentKind::Gemini => "gemini",
            AgentKind::Opencode => "opencode",
            AgentKind::Cursor => "cursor",
            AgentKind::Pi => "pi",
        }
    }

    /// Expected transcript file extension.
    pub fn extension(&self) -> &'static str {
        "jsonl"
    }

    /// Environment variable naming a single transcript root.
    pub fn env_dir_var(&self) -> String {
        format!("{}_DIR", self.as_str().to_uppercase())
    }

    /// Environment variable naming a colon-separated list of roots.
    /// Takes precedence over [`Self::env_dir_var`].
    pub fn env_dirs_var(&self) -> String {
        format!("{}_DIRS", self.as_str().to_uppercase())
    }

    /// Default transcript root under the user's home directory.
    pub fn default_root(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(match self {
            AgentKind::Claude => home.join(".claude/projects"),
            AgentKind::Codex => home.join(".codex/sessions"),
            AgentKind::Copilot => home.join(".copilot/sessions"),
            AgentKind::Gemini => home.join(".gemini/sessions"),
            AgentKind::Opencode => home.join(".local/share/opencode/sessions"),
            AgentKind::Cursor => home.join(".cursor/sessions"),
            AgentKind::Pi => home.join(".pi/agent/sessions"),
        })
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "copilot" => Ok(AgentKind::Copilot),
            "gemini" => Ok(AgentKind::Gemini),
            "opencode" => Ok(AgentKind::Opencode),
            "cursor" => Ok(AgentKind::Cursor),
            "pi" => Ok(AgentKind::Pi),
            _ => Err(format!("unknown agent: {}", s)),
        }
    }
}

// ============================================
// Roles & relationships
// ============================================

/// Role of a normalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
    Meta,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool_result",
            Role::Meta => "meta",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool_result" => Ok(Role::ToolResult),
            "meta" => Ok(Role::Meta),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// How a session relates to its parent session, when it has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Root,
    Branch,
    Continuation,
    Resume,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Root => "root",
            RelationshipType::Branch => "branch",
            RelationshipType::Continuation => "continuation",
            RelationshipType::Resume => "resume",
        }
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(RelationshipType::Root),
            "branch" => Ok(RelationshipType::Branch),
            "continuation" => Ok(RelationshipType::Continuation),
            "resume" => Ok(RelationshipType::Resume),
            _ => Err(format!("unknown relationship type: {}", s)),
        }
    }
}

// ============================================
// Tool calls
// ============================================

/// Normalized tool category shared across all agent formats.
///
/// Raw tool names differ per agent ("bash", "shell", "run_terminal_cmd", ...)
/// but collapse into one category so search, export, and analytics treat them
/// uniformly. Unrecognized names keep the raw name under `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
    Edit,
    Bash,
    Grep,
    Glob,
    Task,
    TodoList,
    PlanEnter,
    PlanExit,
    Question,
    Other(String),
}

impl ToolCategory {
    /// Normalize a raw agent-specific tool name into a category.
    pub fn normalize(raw: &str) -> ToolCategory {
        match raw.to_ascii_lowercase().as_str() {
            "bash" | "shell" | "exec" | "execute" | "run_terminal_cmd" | "terminal" => {
                ToolCategory::Bash
            }
            "read" | "read_file" | "readfile" | "view" | "open_file" | "cat" => ToolCategory::Read,
            "write" | "write_file" | "writefile" | "create_file" | "createfile" | "save_file" => {
                ToolCategory::Write
            }
            "edit" | "edit_file" | "editfile" | "multiedit" | "str_replace"
            | "str_replace_editor" | "apply_patch" | "patch" => ToolCategory::Edit,
            "grep" | "search" | "ripgrep" | "search_file_content" | "codebase_search" => {
                ToolCategory::Grep
            }
            "glob" | "find" | "find_files" | "ls" | "list_files" | "list_directory" => {
                ToolCategory::Glob
            }
            "task" | "agent" | "subagent" | "spawn_agent" => ToolCategory::Task,
            "todowrite" | "todoread" | "todo" | "write_todos" | "update_todo_list" => {
                ToolCategory::TodoList
            }
            "enterplanmode" | "enter_plan_mode" | "plan_enter" => ToolCategory::PlanEnter,
            "exitplanmode" | "exit_plan_mode" | "plan_exit" => ToolCategory::PlanExit,
            "askuserquestion" | "ask_user_question" | "ask_user" | "question" => {
                ToolCategory::Question
            }
            _ => ToolCategory::Other(raw.to_string()),
        }
    }

    /// Display name used in `[Tool ...]` content markers.
    pub fn display_name(&self) -> String {
        match self {
            ToolCategory::Read => "Read".to_string(),
            ToolCategory::Write => "Write".to_string(),
            ToolCategory::Edit => "Edit".to_string(),
            ToolCategory::Bash => "Bash".to_string(),
            ToolCategory::Grep => "Grep".to_string(),
            ToolCategory::Glob => "Glob".to_string(),
            ToolCategory::Task => "Task".to_string(),
            ToolCategory::TodoList => "TodoList".to_string(),
            ToolCategory::PlanEnter => "PlanEnter".to_string(),
            ToolCategory::PlanExit => "PlanExit".to_string(),
            ToolCategory::Question => "Question".to_string(),
            ToolCategory::Other(raw) => capitalize(raw),
        }
    }

    /// Identifier used in database storage.
    pub fn as_str(&self) -> &str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Write => "write",
            ToolCategory::Edit => "edit",
            ToolCategory::Bash => "bash",
            ToolCategory::Grep => "grep",
            ToolCategory::Glob => "glob",
            ToolCategory::Task => "task",
            ToolCategory::TodoList => "todo_list",
            ToolCategory::PlanEnter => "plan_enter",
            ToolCategory::PlanExit => "plan_exit",
            ToolCategory::Question => "question",
            ToolCategory::Other(raw) => raw,
        }
    }

    /// Inverse of [`Self::as_str`]; unknown strings become `Other`.
    pub fn from_db(s: &str) -> ToolCategory {
        match s {
            "read" => ToolCategory::Read,
            "write" => ToolCategory::Write,
            "edit" => ToolCategory::Edit,
            "bash" => ToolCategory::Bash,
            "grep" => ToolCategory::Grep,
            "glob" => ToolCategory::Glob,
            "task" => ToolCategory::Task,
            "todo_list" => ToolCategory::TodoList,
            "plan_enter" => ToolCategory::PlanEnter,
            "plan_exit" => ToolCategory::PlanExit,
            "question" => ToolCategory::Question,
            other => ToolCategory::Other(other.to_string()),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// One tool invocation extracted from an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Raw tool name as it appeared in the transcript
    pub tool_name: String,
    /// Normalized category
    pub category: ToolCategory,
    /// Raw arguments as opaque JSON text
    pub arguments: String,
}

// ============================================
// Sessions & messages
// ============================================

/// Fingerprint of a source file at its last successful parse.
///
/// A changed `(size, mtime_ns, hash)` tuple means the file must be re-parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Absolute path of the source file
    pub path: String,
    /// Size in bytes
    pub size: i64,
    /// Modification time as Unix nanoseconds
    pub mtime_ns: i64,
    /// Hex SHA-256 of the file's leading bytes
    pub hash: String,
}

/// A normalized session (one conversation transcript).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique across all agents; usually the source file's basename
    pub id: String,
    /// Project name derived from the transcript header or directory encoding
    pub project: String,
    /// Host identifier ("local" unless overridden)
    pub machine: String,
    /// Which agent produced the transcript
    pub agent: AgentKind,
    /// Timestamp of the first event, when any event carried one
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the last event
    pub ended_at: Option<DateTime<Utc>>,
    /// Leading user text, truncated
    pub first_message: Option<String>,
    /// Total message count
    pub message_count: i64,
    /// Count of messages with role=user
    pub user_message_count: i64,
    /// Parent session id for branched/continued sessions (may dangle)
    pub parent_session_id: Option<String>,
    /// How this session relates to its parent
    pub relationship: RelationshipType,
    /// Source file fingerprint at last successful parse
    pub file: FileFingerprint,
}

/// A normalized message (one turn inside a session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Session this message belongs to
    pub session_id: String,
    /// 0-based dense position in the session's linear order
    pub ordinal: i64,
    /// Normalized role
    pub role: Role,
    /// Rendered text with tool calls and thinking blocks inlined as markers
    pub content: String,
    /// Event timestamp, when the transcript carried one
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the message contained thinking blocks
    pub has_thinking: bool,
    /// Whether the message contained tool calls
    pub has_tool_use: bool,
    /// Character count of `content`, used by analytics
    pub content_length: i64,
    /// Tool invocations extracted from the message
    pub tool_calls: Vec<ToolCall>,
}

/// One minimap entry: just enough for the UI's scroll map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimapEntry {
    pub ordinal: i64,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================
// Queries & results
// ============================================

/// Filter shared by session listing and search.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent: Option<AgentKind>,
    pub project: Option<String>,
    pub machine: Option<String>,
}

/// Sort direction for message reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One page of a session listing.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    /// Cursor for the next page, absent on the last page
    pub next_cursor: Option<String>,
}

/// One full-text search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub session_id: String,
    pub ordinal: i64,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    /// Match context produced by the full-text engine
    pub snippet: String,
}

/// One page of search hits.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub next_cursor: Option<String>,
}

/// Store-wide aggregate counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub sessions: i64,
    pub messages: i64,
    pub projects: i64,
    pub machines: i64,
}

/// One (name, session count) aggregation row.
#[derive(Debug, Clone)]
pub struct NamedCount {
    pub name: String,
    pub sessions: i64,
}

/// Per-day activity aggregation.
#[derive(Debug, Clone)]
pub struct ActivityDay {
    /// Day in `YYYY-MM-DD` form
    pub day: String,
    pub sessions: i64,
    pub messages: i64,
}

// ============================================
// Sync & discovery
// ============================================

/// Counters reported by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Files parsed and persisted
    pub synced: usize,
    /// Files skipped because their fingerprint was unchanged
    pub skipped: usize,
    /// Total candidate files considered
    pub total: usize,
    /// Files that failed to parse or persist
    pub errors: usize,
}

/// A file discovery produced and classified.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: PathBuf,
    /// Agent detected from the file's header signature
    pub agent: AgentKind,
    pub size: u64,
    pub mtime_ns: i64,
}

/// Opaque event published to a watcher subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The watched session has new data
    Updated,
    /// The watcher is still alive
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_agent_round_trip() {
        for agent in AgentKind::ALL {
            assert_eq!(AgentKind::from_str(agent.as_str()).unwrap(), agent);
        }
        assert!(AgentKind::from_str("aider").is_err());
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(AgentKind::Pi.env_dir_var(), "PI_DIR");
        assert_eq!(AgentKind::Pi.env_dirs_var(), "PI_DIRS");
        assert_eq!(AgentKind::Opencode.env_dir_var(), "OPENCODE_DIR");
    }

    #[test]
    fn test_tool_category_normalize() {
        assert_eq!(ToolCategory::normalize("bash"), ToolCategory::Bash);
        assert_eq!(ToolCategory::normalize("Shell"), ToolCategory::Bash);
        assert_eq!(ToolCategory::normalize("read_file"), ToolCategory::Read);
        assert_eq!(ToolCategory::normalize("str_replace"), ToolCategory::Edit);
        assert_eq!(
            ToolCategory::normalize("webfetch"),
            ToolCategory::Other("webfetch".to_string())
        );
    }

    #[test]
    fn test_tool_category_display() {
        assert_eq!(ToolCategory::Bash.display_name(), "Bash");
        assert_eq!(ToolCategory::TodoList.display_name(), "TodoList");
        assert_eq!(
            ToolCategory::Other("webfetch".to_string()).display_name(),
            "Webfetch"
        );
    }

    #[test]
    fn test_tool_category_db_round_trip() {
        let cats = [
            ToolCategory::Bash,
            ToolCategory::TodoList,
            ToolCategory::PlanExit,
            ToolCategory::Other("webfetch".to_string()),
        ];
        for cat in cats {
            assert_eq!(ToolCategory::from_db(cat.as_str()), cat);
        }
    }

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::ToolResult, Role::Meta] {
            assert_eq!(Role::from_str(role.as_str()).unwrap(), role);
        }
    }
}
