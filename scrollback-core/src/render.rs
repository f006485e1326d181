//! Content marker rendering
//!
//! Tool calls and thinking blocks are folded into the rendered message text
//! using stable inline markers, so the full-text index and the HTML exporter
//! work from `content` alone without joining side tables. The marker grammar
//! is a contract pinned down by tests:
//!
//! - Thinking: `[Thinking]\n<text>\n[/Thinking]`
//! - Tool call: `[<DisplayName> <inline-params>]`
//!
//! `DisplayName` is the normalized [`ToolCategory`] display name; the inline
//! params render a handful of salient argument fields as `key=value`.

use crate::types::ToolCategory;
use serde_json::Value;

/// Argument keys rendered first when present, in this order.
const SALIENT_KEYS: [&str; 9] = [
    "command",
    "cmd",
    "file_path",
    "filePath",
    "path",
    "pattern",
    "query",
    "description",
    "url",
];

/// Most key=value pairs rendered into one marker.
const MAX_PARAMS: usize = 3;

/// Longest rendered value before truncation.
const MAX_VALUE_LEN: usize = 80;

/// Wrap thinking text in its markers.
pub fn thinking_block(text: &str) -> String {
    format!("[Thinking]\n{}\n[/Thinking]", text.trim_end())
}

/// Render a tool invocation marker, e.g. `[Bash cmd=ls]`.
pub fn tool_marker(category: &ToolCategory, args: &Value) -> String {
    let params = inline_params(args);
    if params.is_empty() {
        format!("[{}]", category.display_name())
    } else {
        format!("[{} {}]", category.display_name(), params)
    }
}

/// Render the salient fields of a tool argument object as `key=value` pairs.
///
/// Salient keys come first, then remaining primitive fields in object order,
/// up to [`MAX_PARAMS`] pairs. Non-object arguments render as truncated JSON.
pub fn inline_params(args: &Value) -> String {
    let obj = match args {
        Value::Object(map) => map,
        Value::Null => return String::new(),
        other => return clean_value(&other.to_string()),
    };

    let mut pairs: Vec<(String, String)> = Vec::new();

    for key in SALIENT_KEYS {
        if pairs.len() >= MAX_PARAMS {
            break;
        }
        if let Some(value) = obj.get(key) {
            if let Some(rendered) = render_primitive(value) {
                pairs.push((key.to_string(), rendered));
            }
        }
    }

    for (key, value) in obj {
        if pairs.len() >= MAX_PARAMS {
            break;
        }
        if SALIENT_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(rendered) = render_primitive(value) {
            pairs.push((key.clone(), rendered));
        }
    }

    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn render_primitive(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(clean_value(s)),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn clean_value(s: &str) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    let trimmed = flat.trim();
    truncate_chars(trimmed, MAX_VALUE_LEN)
}
