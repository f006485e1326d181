//! Copilot session parser
//!
//! Copilot transcripts open with a `session_header` line and follow with flat
//! role-tagged events. Tool invocations ride on assistant events in a
//! `toolRequests` array.

use crate::error::{Error, Result};
use crate::fsys::Fs;
use crate::render;
use crate::types::{AgentKind, Role, ToolCall, ToolCategory};
use serde_json::Value;
use std::path::Path;

use super::{
    finalize, id_from_path, parse_ts, project_from_cwd, read_json_lines, ParseHints,
    ParsedMessage, ParsedSession, ParsedUnit, SessionParser,
};

pub struct CopilotParser;

impl SessionParser for CopilotParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Copilot
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        v.get("type").and_then(Value::as_str) == Some("session_header")
            && v.get("copilotVersion").is_some()
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Copilot)?;

        let header = values
            .first()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some("session_header"))
            .ok_or_else(|| Error::Parse {
                agent: AgentKind::Copilot.to_string(),
                message: format!("missing session header in {}", path.display()),
            })?;

        let id = header
            .get("sessionId")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id_from_path(path));

        let mut session = ParsedSession::new(id, AgentKind::Copilot, hints);
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

        let mut messages = Vec::new();
        for value in &values[1..] {
            let ts = value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_ts);
            let text = value
                .get("content")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();

            match value.get("type").and_then(Value::as_str) {
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
                    if let Some(requests) = value.get("toolRequests").and_then(Value::as_array) {
                        for request in requests {
                            let name = request
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            let args = request.get("arguments").cloned().unwrap_or(Value::Null);
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
                Some("tool_result") => {
                    let content = if text.is_empty() {
                        "[no output]".to_string()
                    } else {
                        text
                    };
                    messages.push(ParsedMessage::new(Role::ToolResult, content).with_timestamp(ts));
                }
                Some("meta") => {
                    if !text.is_empty() {
                        messages.push(ParsedMessage::new(Role::Meta, text).with_timestamp(ts));
                    }
                }
                other => {
                    tracing::debug!(event_type = ?other, "Skipping unrecognized copilot event");
                }
            }
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Copilot.to_string(),
                message: format!("no events in {}", path.display()),
            });
        }

        finalize(&mut session, &messages);
        Ok(vec![ParsedUnit { session, messages }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::OsFs;
    use std::io::Write;

    #[test]
    fn test_basic_session() {
        let mut tmp = tempfile::NamedTempFile::with_suffix(".jsonl").unwrap();
        writeln!(
            tmp,
            r#"{{"type":"session_header","sessionId":"cp-1","cwd":"/home/u/web","copilotVersion":"1.2"}}"#
        )
        .unwrap();
        writeln!(
            tmp,
            r#"{{"type":"user","timestamp":"2025-05-01T12:00:00Z","content":"add a test"}}"#
        )
        .unwrap();
        writeln!(
            tmp,
            r#"{{"type":"assistant","timestamp":"2025-05-01T12:00:04Z","content":"On it.","toolRequests":[{{"id":"t1","name":"editFile","arguments":{{"path":"src/a.ts"}}}}]}}"#
        )
        .unwrap();
        writeln!(
            tmp,
            r#"{{"type":"tool_result","timestamp":"2025-05-01T12:00:05Z","content":"edited"}}"#
        )
        .unwrap();

        let hints = ParseHints::default();
        let units = CopilotParser.parse(&OsFs, tmp.path(), &hints).unwrap();
        let unit = &units[0];
        assert_eq!(unit.session.id, "cp-1");
        assert_eq!(unit.session.project, "web");
        assert_eq!(unit.session.message_count, 3);
        assert!(unit.messages[1].has_tool_use);
        assert!(unit.messages[1].content.contains("[Edit path=src/a.ts]"));
        assert_eq!(unit.messages[2].role, Role::ToolResult);
    }

    #[test]
    fn test_header_signature() {
        assert!(CopilotParser.matches_header(
            r#"{"type":"session_header","sessionId":"x","copilotVersion":"1.0"}"#
        ));
        assert!(!CopilotParser.matches_header(r#"{"type":"session_header"}"#));
        assert!(!CopilotParser.matches_header(r#"{"type":"session"}"#));
    }
}
