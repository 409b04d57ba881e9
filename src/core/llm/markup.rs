use regex::Regex;
use std::sync::LazyLock;

use super::{CallFormat, ToolCall};

static INVOKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<invoke\s+name\s*=\s*["']([^"']+)["']\s*>([\s\S]*?)</invoke>"#)
        .expect("invoke pattern compiles")
});

static LOOSE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?\s*invoke\b").expect("tag pattern compiles"));

/// Extract every `<invoke>` block in order of appearance. Returns the remaining prose and the calls.
///
/// The body may be a JSON object (named arguments), a JSON array (positional arguments) or bare
/// text, which is passed through as a single positional string.
pub fn parse_invocations(text: &str, turn: u32) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    for (idx, caps) in INVOKE_RE.captures_iter(text).enumerate() {
        let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        let arguments = if body.is_empty() {
            serde_json::Value::Array(Vec::new())
        } else {
            serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
        };
        calls.push(ToolCall {
            id: format!("call_{}_{}", turn, idx),
            name: name.to_string(),
            arguments,
            format: CallFormat::Markup,
            turn,
        });
    }
    let prose = INVOKE_RE.replace_all(text, "").trim().to_string();
    (prose, calls)
}

/// Neutralise invoke markup inside untrusted text (tool output, event payloads) before it is
/// placed back into model context.
pub fn sanitize_invoke_tags(text: &str) -> String {
    let stripped = INVOKE_RE.replace_all(text, "[invoke tag removed]");
    LOOSE_TAG_RE.replace_all(&stripped, "[tag]").to_string()
}
