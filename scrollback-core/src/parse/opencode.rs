//! OpenCode session parser
//!
//! OpenCode transcripts open with a `type:"session"` line that carries a
//! `ses_*` id and the project `directory`, followed by message entries whose
//! content is split into typed `parts` (text, reasoning, tool). Timestamps
//! are Unix milliseconds under `time.created`.
//!
//! A `parentID` on the header links a continued session to its predecessor.

use crate::error::{Error, Result};
use crate::fsys::Fs;
use crate::render;
use crate::types::{AgentKind, RelationshipType, Role, ToolCall, ToolCategory};
use serde_json::Value;
use std::path::Path;

use super::{
    finalize, id_from_path, project_from_cwd, read_json_lines, ts_from_value, ParseHints,
    ParsedMessage, ParsedSession, ParsedUnit, SessionParser,
};

pub struct OpencodeParser;

impl SessionParser for OpencodeParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Opencode
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        v.get("type").and_then(Value::as_str) == Some("session")
            && v.get("directory").is_some()
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Opencode)?;

        let header = values
            .first()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some("session"))
            .ok_or_else(|| Error::Parse {
                agent: AgentKind::Opencode.to_string(),
                message: format!("missing session header in {}", path.display()),
            })?;

        let id = header
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id_from_path(path));

        let mut session = ParsedSession::new(id, AgentKind::Opencode, hints);
        if let Some(project) = header
            .get("directory")
            .and_then(Value::as_str)
            .and_then(project_from_cwd)
        {
            session.project = project;
        }
        if let Some(parent) = header.get("parentID").and_then(Value::as_str) {
            session.parent_session_id = Some(parent.to_string());
            session.relationship = RelationshipType::Continuation;
        }
        session.started_at = header
            .get("time")
            .and_then(|t| t.get("created"))
            .and_then(ts_from_value);

        let mut messages = Vec::new();
        for value in &values[1..] {
            if value.get("type").and_then(Value::as_str) != Some("message") {
                tracing::debug!("Skipping unrecognized opencode entry");
                continue;
            }
            let ts = value
                .get("time")
                .and_then(|t| t.get("created"))
                .and_then(ts_from_value);
            let role = value.get("role").and_then(Value::as_str).unwrap_or("");
            let parts = value
                .get("parts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            match role {
                "user" => {
                    let text = parts
                        .iter()
                        .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.is_empty() {
                        messages.push(ParsedMessage::new(Role::User, text).with_timestamp(ts));
                    }
                }
                "assistant" => {
                    let mut msg =
                        ParsedMessage::new(Role::Assistant, String::new()).with_timestamp(ts);
                    let mut rendered = Vec::new();
                    for part in &parts {
                        match part.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = part.get("text").and_then(Value::as_str) {
                                    if !text.trim().is_empty() {
                                        rendered.push(text.trim().to_string());
                                    }
                                }
                            }
                            Some("reasoning") => {
                                if let Some(text) = part.get("text").and_then(Value::as_str) {
                                    msg.has_thinking = true;
                                    rendered.push(render::thinking_block(text));
                                }
                            }
                            Some("tool") => {
                                let tool = part.get("tool").unwrap_or(&Value::Null);
                                let name = tool
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown");
                                let input = tool.get("input").cloned().unwrap_or(Value::Null);
                                let category = ToolCategory::normalize(name);
                                rendered.push(render::tool_marker(&category, &input));
                                msg.has_tool_use = true;
                                msg.tool_calls.push(ToolCall {
                                    tool_name: name.to_string(),
                                    category,
                                    arguments: input.to_string(),
                                });
                            }
                            _ => {}
                        }
                    }
                    if rendered.is_empty() {
                        continue;
                    }
                    msg.content = rendered.join("\n");
                    messages.push(msg);
                }
                other => {
                    tracing::debug!(role = other, "Skipping unrecognized opencode role");
                }
            }
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Opencode.to_string(),
                message: format!("no events in {}", path.display()),
            });
        }

        finalize(&mut session, &messages);
        Ok(vec![ParsedUnit { session, messages }])
    }
}
