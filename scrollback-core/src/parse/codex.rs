//! Codex session parser
//!
//! Codex rollout files use a uniform envelope per line:
//! `{"timestamp": "...", "type": "...", "payload": {...}}`. The `type` field
//! routes the payload:
//!
//! | Record type     | Purpose                                        |
//! |-----------------|------------------------------------------------|
//! | `session_meta`  | One-time header with cwd and session metadata  |
//! | `event_msg`     | User input (`user_message` subtype)            |
//! | `response_item` | Assistant output, function calls and outputs   |
//! | `turn_context`  | Model for the upcoming turn                    |
//!
//! Tool interactions span two records (`function_call` then
//! `function_call_output` matched by `call_id`); each becomes its own
//! normalized message. Standalone `reasoning` items fold into the next
//! assistant message as a thinking block.

use crate::error::{Error, Result};
use crate::fsys::Fs;
use crate::render;
use crate::types::{AgentKind, Role, ToolCall, ToolCategory};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::Path;

use super::{
    finalize, id_from_path, parse_ts, project_from_cwd, read_json_lines, ParseHints,
    ParsedMessage, ParsedSession, ParsedUnit, SessionParser,
};

pub struct CodexParser;

impl SessionParser for CodexParser {
    fn agent(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn matches_header(&self, first_line: &str) -> bool {
        let Ok(v) = serde_json::from_str::<Value>(first_line) else {
            return false;
        };
        let known = matches!(
            v.get("type").and_then(Value::as_str),
            Some("session_meta" | "response_item" | "event_msg" | "turn_context")
        );
        known && v.get("payload").map(Value::is_object).unwrap_or(false)
    }

    fn parse(&self, fs: &dyn Fs, path: &Path, hints: &ParseHints) -> Result<Vec<ParsedUnit>> {
        let values = read_json_lines(fs, path, AgentKind::Codex)?;

        let mut session = ParsedSession::new(id_from_path(path), AgentKind::Codex, hints);
        let mut messages: Vec<ParsedMessage> = Vec::new();
        let mut current_model: Option<String> = None;
        // Reasoning items precede the assistant output they belong to
        let mut pending_thinking: Vec<String> = Vec::new();

        for value in &values {
            let ts = value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_ts);
            let payload = value.get("payload").unwrap_or(&Value::Null);

            match value.get("type").and_then(Value::as_str) {
                Some("session_meta") => {
                    if let Some(project) = payload
                        .get("cwd")
                        .and_then(Value::as_str)
                        .and_then(project_from_cwd)
                    {
                        session.project = project;
                    }
                    if session.started_at.is_none() {
                        session.started_at = ts;
                    }
                }
                Some("event_msg") => {
                    if payload.get("type").and_then(Value::as_str) == Some("user_message") {
                        if let Some(text) = payload.get("message").and_then(Value::as_str) {
                            if !text.trim().is_empty() {
                                messages.push(
                                    ParsedMessage::new(Role::User, text.trim().to_string())
                                        .with_timestamp(ts),
                                );
                            }
                        }
                    }
                }
                Some("response_item") => {
                    handle_response_item(payload, ts, &mut messages, &mut pending_thinking);
                }
                Some("turn_context") => {
                    if let Some(model) = payload.get("model").and_then(Value::as_str) {
                        if current_model.as_deref() != Some(model) {
                            if current_model.is_some() {
                                messages.push(
                                    ParsedMessage::new(
                                        Role::Meta,
                                        format!("Model changed to {}", model),
                                    )
                                    .with_timestamp(ts),
                                );
                            }
                            current_model = Some(model.to_string());
                        }
                    }
                }
                other => {
                    tracing::debug!(record_type = ?other, "Skipping unrecognized codex record");
                }
            }
        }

        // A transcript ending on reasoning still keeps that text
        if !pending_thinking.is_empty() {
            let mut msg = ParsedMessage::new(Role::Assistant, String::new());
            msg.has_thinking = true;
            msg.content = pending_thinking
                .iter()
                .map(|t| render::thinking_block(t))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(msg);
        }

        if messages.is_empty() {
            return Err(Error::Parse {
                agent: AgentKind::Codex.to_string(),
                message: format!("no events in {}", path.display()),
            });
        }

        finalize(&mut session, &messages);
        Ok(vec![ParsedUnit { session, messages }])
    }
}

fn handle_response_item(
    payload: &Value,
    ts: Option<DateTime<Utc>>,
    messages: &mut Vec<ParsedMessage>,
    pending_thinking: &mut Vec<String>,
) {
    match payload.get("type").and_then(Value::as_str) {
        Some("message") => {
            // User-role items duplicate event_msg records
            if payload.get("role").and_then(Value::as_str) != Some("assistant") {
                return;
            }
            let text = content_text(payload.get("content").unwrap_or(&Value::Null));
            let mut parts: Vec<String> = pending_thinking
                .drain(..)
                .map(|t| render::thinking_block(&t))
                .collect();
            let had_thinking = !parts.is_empty();
            if !text.is_empty() {
                parts.push(text);
            }
            if parts.is_empty() {
                return;
            }
            let mut msg = ParsedMessage::new(Role::Assistant, parts.join("\n")).with_timestamp(ts);
            msg.has_thinking = had_thinking;
            messages.push(msg);
        }
        Some("reasoning") => {
            let text = reasoning_text(payload);
            if !text.is_empty() {
                pending_thinking.push(text);
            }
        }
        Some("function_call") => {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let raw_args = payload
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let args: Value = serde_json::from_str(raw_args).unwrap_or(Value::Null);
            let category = ToolCategory::normalize(name);

            let mut parts: Vec<String> = pending_thinking
                .drain(..)
                .map(|t| render::thinking_block(&t))
                .collect();
            let had_thinking = !parts.is_empty();
            parts.push(render::tool_marker(&category, &args));

            let mut msg = ParsedMessage::new(Role::Assistant, parts.join("\n")).with_timestamp(ts);
            msg.has_thinking = had_thinking;
            msg.has_tool_use = true;
            msg.tool_calls.push(ToolCall {
                tool_name: name.to_string(),
                category,
                arguments: raw_args.to_string(),
            });
            messages.push(msg);
        }
        Some("function_call_output") => {
            let output = match payload.get("output") {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Object(obj)) => obj
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                _ => String::new(),
            };
            let content = if output.is_empty() {
                "[no output]".to_string()
            } else {
                output
            };
            messages.push(ParsedMessage::new(Role::ToolResult, content).with_timestamp(ts));
        }
        _ => {}
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item.get("type").and_then(Value::as_str) {
                Some("output_text") | Some("input_text") | Some("text") => {
                    item.get("text").and_then(Value::as_str)
                }
                _ => None,
            })
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn reasoning_text(payload: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(summaries) = payload.get("summary").and_then(Value::as_array) {
        for item in summaries {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }
    if parts.is_empty() {
        let text = content_text(payload.get("content").unwrap_or(&Value::Null));
        if !text.is_empty() {
            parts.push(text);
        }
    }
    parts.join("\n")
}
