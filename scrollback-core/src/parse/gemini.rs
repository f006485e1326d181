//! Gemini session parser
//!
//! Gemini transcripts open with a `kind:"session"` line and follow with flat
//! events tagged `kind:"user"|"model"|"tool"`. Timestamps arrive as either
//! RFC3339 strings or Unix milliseconds.

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

pub struct GeminiParser;

impl SessionParser for GeminiParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Gemini
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        v.get("kind").and_then(Value::as_str) == Some("session")
            && v.get("geminiVersion").is_some()
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Gemini)?;

        let header = values
            .first()
            .filter(|v| v.get("kind").and_then(Value::as_str) == Some("session"))
            .ok_or_else(|| Error::Parse {
                agent: AgentKind::Gemini.to_string(),
                message: format!("missing session header in {}", path.display()),
            })?;

        let id = header
            .get("sessionId")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| id_from_path(path));

        let mut session = ParsedSession::new(id, AgentKind::Gemini, hints);
        if let Some(project) = header
            .get("projectDir")
            .and_then(Value::as_str)
            .and_then(project_from_cwd)
        {
            session.project = project;
        }
        session.started_at = header.get("ts").and_then(ts_from_value);

        let mut messages = Vec::new();
        for value in &values[1..] {
            let ts = value.get("ts").and_then(ts_from_value);
            let text = value
                .get("text")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();

            match value.get("kind").and_then(Value::as_str) {
                Some("user") => {
                    if !text.is_empty() {
                        messages.push(ParsedMessage::new(Role::User, text).with_timestamp(ts));
                    }
                }
                Some("model") => {
                    let mut msg =
                        ParsedMessage::new(Role::Assistant, String::new()).with_timestamp(ts);
                    let mut parts = Vec::new();
                    if !text.is_empty() {
                        parts.push(text);
                    }
                    if let Some(call) = value.get("toolCall").filter(|c| c.is_object()) {
                        let name = call
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        let args = call.get("args").cloned().unwrap_or(Value::Null);
                        let category = ToolCategory::normalize(name);
                        parts.push(render::tool_marker(&category, &args));
                        msg.has_tool_use = true;
                        msg.tool_calls.push(ToolCall {
                            tool_name: name.to_string(),
                            category,
                            arguments: args.to_string(),
                        });
                    }
                    if parts.is_empty() {
                        continue;
                    }
                    msg.content = parts.join("\n");
                    messages.push(msg);
                }
                Some("tool") => {
                    let content = if text.is_empty() {
                        "[no output]".to_string()
                    } else {
                        text
                    };
                    messages.push(ParsedMessage::new(Role::ToolResult, content).with_timestamp(ts));
                }
                other => {
                    tracing::debug!(kind = ?other, "Skipping unrecognized gemini event");
                }
            }
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Gemini.to_string(),
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
    fn test_basic_session_with_millis_timestamps() {
        let mut tmp = tempfile::NamedTempFile::with_suffix(".jsonl").unwrap();
        writeln!(
            tmp,
            r#"{{"kind":"session","sessionId":"g-1","geminiVersion":"0.9","projectDir":"/home/u/site"}}"#
        )
        .unwrap();
        writeln!(tmp, r#"{{"kind":"user","ts":1740000000000,"text":"deploy"}}"#).unwrap();
        writeln!(
            tmp,
            r#"{{"kind":"model","ts":1740000003000,"text":"Deploying.","toolCall":{{"name":"shell","args":{{"command":"make deploy"}}}}}}"#
        )
        .unwrap();
        writeln!(tmp, r#"{{"kind":"tool","ts":1740000005000,"text":"done"}}"#).unwrap();

        let units = GeminiParser
            .parse(&OsFs, tmp.path(), &ParseHints::default())
            .unwrap();
        let unit = &units[0];
        assert_eq!(unit.session.id, "g-1");
        assert_eq!(unit.session.project, "site");
        assert_eq!(unit.session.message_count, 3);
        assert!(unit.session.started_at.is_some());
        assert!(unit.messages[1].content.contains("[Bash command=make deploy]"));
        assert_eq!(unit.messages[2].role, Role::ToolResult);
    }

    #[test]
    fn test_header_signature() {
        assert!(GeminiParser
            .matches_header(r#"{"kind":"session","geminiVersion":"0.9","projectDir":"/x"}"#));
        assert!(!GeminiParser.matches_header(r#"{"kind":"session"}"#));
        assert!(!GeminiParser.matches_header(r#"{"type":"session"}"#));
    }
}
