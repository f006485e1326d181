//! Cursor session parser
//!
//! Cursor composer transcripts open with a `type:"composer"` line and follow
//! with flat `{role, createdAt, text, toolCalls}` events. `createdAt` is Unix
//! milliseconds; tool arguments arrive pre-serialized in `rawArgs`.

use crate::error::{Error, Result};
use crate::fsys::Fs;
use crate::render;
use crate::types::{AgentKind, Role, ToolCall, ToolCategory};
use serde_json::Value;
use std::path::Path;

use super::{
    finalize, id_from_path, project_from_cwd, read_json_lines, ts_from_value, ParseHints,
    ParsedMessage, ParsedSession, ParsedUnit, SessionParser,
};

pub struct CursorParser;

impl SessionParser for CursorParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Cursor
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        v.get("type").and_then(Value::as_str) == Some("composer")
            && v.get("composerId").is_some()
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Cursor)?;

        let header = values
            .first()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some("composer"))
            .ok_or_else(|| Error::Parse {
                agent: AgentKind::Cursor.to_string(),
                message: format!("missing composer header in {}", path.display()),
            })?;

        let id = header
            .get("composerId")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id_from_path(path));

        let mut session = ParsedSession::new(id, AgentKind::Cursor, hints);
        if let Some(project) = header
            .get("workspaceDir")
            .and_then(Value::as_str)
            .and_then(project_from_cwd)
        {
            session.project = project;
        }
        session.started_at = header.get("createdAt").and_then(ts_from_value);

        let mut messages = Vec::new();
        for value in &values[1..] {
            let ts = value.get("createdAt").and_then(ts_from_value);
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();

            match value.get("role").and_then(Value::as_str) {
                Some("user") => {
                    if !text.is_empty() {
                        messages.push(ParsedMessage::new(Role::User, text).with_timestamp(ts));
                    }
                }
                Some("assistant") => {
                    let mut msg =
                        ParsedMessage::new(Role::Assistant, String::new()).with_timestamp(ts);
                    let mut parts = Vec::new();
                    if !text.is_empty() {
                        parts.push(text);
                    }
                    if let Some(calls) = value.get("toolCalls").and_then(Value::as_array) {
                        for call in calls {
                            let name = call
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            let args = raw_args(call.get("rawArgs"));
                            let category = ToolCategory::normalize(name);
                            parts.push(render::tool_marker(&category, &args));
                            msg.has_tool_use = true;
                            msg.tool_calls.push(ToolCall {
                                tool_name: name.to_string(),
                                category,
                                arguments: args.to_string(),
                            });
                        }
                    }
                    if parts.is_empty() {
                        continue;
                    }
                    msg.content = parts.join("\n");
                    messages.push(msg);
                }
                other => {
                    tracing::debug!(role = ?other, "Skipping unrecognized cursor event");
                }
            }
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Cursor.to_string(),
                message: format!("no events in {}", path.display()),
            });
        }

        finalize(&mut session, &messages);
        Ok(vec![ParsedUnit { session, messages }])
    }
}

/// `rawArgs` is usually a JSON string, occasionally an inline object.
fn raw_args(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(v) => v.clone(),
        None => Value::Null,
    }
}
