//! Pi session parser
//!
//! Pi transcripts carry an explicit header line `{"type":"session", "id",
//! "cwd", ...}` followed by message entries, top-level tool results, and
//! metadata events. The header is required; a file without one is not a Pi
//! transcript.
//!
//! Cross-file lineage: `branchedFrom` names the source file of the parent
//! session; its basename is stored as `parent_session_id` without checking
//! that the parent was ingested (dangling parents are tolerated by the data
//! model). `parentSession` marks a continuation.

use crate::error::{Error, Result};
use crate::fsys::Fs;
use crate::render;
use crate::types::{AgentKind, RelationshipType, Role, ToolCall, ToolCategory};
use serde_json::Value;
use std::path::Path;

use super::{
    finalize, id_from_path, parse_ts, project_from_cwd, read_json_lines, ParseHints,
    ParsedMessage, ParsedSession, ParsedUnit, SessionParser,
};

pub struct PiParser;

impl SessionParser for PiParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Pi
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        v.get("type").and_then(Value::as_str) == Some("session")
            && v.get("directory").is_none()
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Pi)?;

        let header = values
            .first()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some("session"))
            .ok_or_else(|| Error::Parse {
                agent: AgentKind::Pi.to_string(),
                message: format!("missing session header in {}", path.display()),
            })?;

        let id = header
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id_from_path(path));

        let mut session = ParsedSession::new(id, AgentKind::Pi, hints);
        if let Some(project) = header
            .get("cwd")
            .and_then(Value::as_str)
            .and_then(project_from_cwd)
        {
            session.project = project;
        }
        session.started_at = header
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_ts);

        if let Some(branched) = header.get("branchedFrom").and_then(Value::as_str) {
            session.parent_session_id = Some(id_from_path(Path::new(branched)));
            session.relationship = RelationshipType::Branch;
        } else if let Some(resumed) = header.get("resumedFrom").and_then(Value::as_str) {
            session.parent_session_id = Some(resumed.to_string());
            session.relationship = RelationshipType::Resume;
        } else if let Some(parent) = header.get("parentSession").and_then(Value::as_str) {
            session.parent_session_id = Some(parent.to_string());
            session.relationship = RelationshipType::Continuation;
        }

        let mut messages = Vec::new();
        for value in &values[1..] {
            let ts = value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_ts);

            // Top-level tool results sit outside the message envelope
            if value.get("role").and_then(Value::as_str) == Some("toolResult") {
                let content = text_of_content(value.get("content").unwrap_or(&Value::Null));
                messages.push(
                    ParsedMessage::new(Role::ToolResult, content).with_timestamp(ts),
                );
                continue;
            }

            match value.get("type").and_then(Value::as_str) {
                Some("message") => {
                    if let Some(msg) = parse_message_entry(value, ts) {
                        messages.push(msg);
                    }
                }
                Some("compaction") => {
                    // Summaries stay searchable as synthetic user messages
                    let summary = value
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !summary.is_empty() {
                        messages.push(
                            ParsedMessage::new(Role::User, summary.to_string())
                                .with_timestamp(ts),
                        );
                    }
                }
                Some("model-change") => {
                    if let Some(model) = value.get("model").and_then(Value::as_str) {
                        messages.push(
                            ParsedMessage::new(Role::Meta, format!("Model changed to {}", model))
                                .with_timestamp(ts),
                        );
                    }
                }
                Some("thinking-level-change") => {
                    if let Some(level) = value.get("level").and_then(Value::as_str) {
                        messages.push(
                            ParsedMessage::new(
                                Role::Meta,
                                format!("Thinking level changed to {}", level),
                            )
                            .with_timestamp(ts),
                        );
                    }
                }
                other => {
                    tracing::debug!(entry_type = ?other, "Skipping unrecognized pi entry");
                }
            }
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Pi.to_string(),
                message: format!("no events in {}", path.display()),
            });
        }

        finalize(&mut session, &messages);
        Ok(vec![ParsedUnit { session, messages }])
    }
}

fn parse_message_entry(value: &Value, ts: Option<chrono::DateTime<chrono::Utc>>) -> Option<ParsedMessage> {
    let message = value.get("message")?;
    let role = message.get("role").and_then(Value::as_str)?;
    let content = message.get("content").unwrap_or(&Value::Null);

    match role {
        "user" => {
            let text = text_of_content(content);
            if text.is_empty() {
                return None;
            }
            Some(ParsedMessage::new(Role::User, text).with_timestamp(ts))
        }
        "assistant" => {
            let mut msg = ParsedMessage::new(Role::Assistant, String::new()).with_timestamp(ts);
            let mut parts: Vec<String> = Vec::new();

            match content {
                Value::String(s) => {
                    if !s.trim().is_empty() {
                        parts.push(s.trim().to_string());
                    }
                }
                Value::Array(blocks) => {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    if !text.trim().is_empty() {
                                        parts.push(text.trim().to_string());
                                    }
                                }
                            }
                            Some("thinking") => {
                                if let Some(text) = block.get("thinking").and_then(Value::as_str)
                                {
                                    msg.has_thinking = true;
                                    parts.push(render::thinking_block(text));
                                }
                            }
                            Some("toolCall") => {
                                let name = block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown");
                                let args = block.get("arguments").cloned().unwrap_or(Value::Null);
                                let category = ToolCategory::normalize(name);
                                parts.push(render::tool_marker(&category, &args));
                                msg.has_tool_use = true;
                                msg.tool_calls.push(ToolCall {
                                    tool_name: name.to_string(),
                                    category,
                                    arguments: args.to_string(),
                                });
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }

            if parts.is_empty() {
                return None;
            }
            msg.content = parts.join("\n");
            Some(msg)
        }
        _ => None,
    }
}

/// Join the text of a content field that is either a plain string or an
/// array of `{type:"text", text}` blocks.
fn text_of_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(Value::as_str).unwrap_or("text") == "text" {
                    b.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
