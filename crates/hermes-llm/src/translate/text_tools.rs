//! Tool-call extraction from plain text
//!
//! Weaker models sometimes emit tool invocations as prose instead of
//! structured `tool_calls`. Three shapes are recognized, tried in order:
//!
//! 1. Hermes-style `<tool_call>{…}</tool_call>` tags
//! 2. Fenced ```` ```json ```` blocks
//! 3. A standalone balanced JSON object carrying `"name"` and one of
//!    `"arguments"`, `"input"`, `"parameters"`
//!
//! The object scanner walks braces with string/escape awareness; no
//! regex touches the JSON itself.

use serde_json::Value;

/// Keys accepted as the arguments payload of a textual tool call
const ARGUMENT_KEYS: &[&str] = &["arguments", "input", "parameters"];

const HERMES_OPEN: &str = "<tool_call>";
const HERMES_CLOSE: &str = "</tool_call>";
const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// A tool call recovered from response text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToolCall {
    pub name: String,
    /// JSON-encoded arguments object
    pub arguments: String,
}

/// Recover structured tool calls from response text
///
/// Returns the calls plus the text with the matched spans removed, or
/// `None` when nothing tool-shaped is present.
#[must_use]
pub fn extract_tool_calls(content: &str) -> Option<(Vec<ExtractedToolCall>, String)> {
    for strategy in [extract_hermes_tags, extract_json_fences, extract_bare_objects] {
        if let Some(found) = strategy(content) {
            return Some(found);
        }
    }
    None
}

/// `<tool_call>{…}</tool_call>` segments
fn extract_hermes_tags(content: &str) -> Option<(Vec<ExtractedToolCall>, String)> {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut search_from = 0;

    while let Some(open) = content[search_from..].find(HERMES_OPEN) {
        let open = search_from + open;
        let inner_start = open + HERMES_OPEN.len();
        let Some(close) = content[inner_start..].find(HERMES_CLOSE) else {
            break;
        };
        let inner_end = inner_start + close;
        let span_end = inner_end + HERMES_CLOSE.len();

        if let Some(call) = parse_call(content[inner_start..inner_end].trim(), false) {
            calls.push(call);
            spans.push((open, span_end));
        }
        search_from = span_end;
    }

    if calls.is_empty() {
        return None;
    }
    Some((calls, remove_spans(content, &spans)))
}

/// ```` ```json … ``` ```` fenced blocks
fn extract_json_fences(content: &str) -> Option<(Vec<ExtractedToolCall>, String)> {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut search_from = 0;

    while let Some(open) = content[search_from..].find(FENCE_OPEN) {
        let open = search_from + open;
        let inner_start = open + FENCE_OPEN.len();
        let Some(close) = content[inner_start..].find(FENCE_CLOSE) else {
            break;
        };
        let inner_end = inner_start + close;
        let span_end = inner_end + FENCE_CLOSE.len();

        if let Some(call) = parse_call(content[inner_start..inner_end].trim(), true) {
            calls.push(call);
            spans.push((open, span_end));
        }
        search_from = span_end;
    }

    if calls.is_empty() {
        return None;
    }
    Some((calls, remove_spans(content, &spans)))
}

/// Standalone balanced objects anywhere in the text
fn extract_bare_objects(content: &str) -> Option<(Vec<ExtractedToolCall>, String)> {
    let bytes = content.as_bytes();
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match balanced_object_end(bytes, i) {
            Some(end) => {
                if let Some(call) = parse_call(&content[i..end], true) {
                    calls.push(call);
                    spans.push((i, end));
                }
                i = end;
            }
            None => break,
        }
    }

    if calls.is_empty() {
        return None;
    }
    Some((calls, remove_spans(content, &spans)))
}

/// End offset (exclusive) of the balanced object starting at `start`,
/// honoring JSON string and escape rules
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse one candidate JSON object into a call
///
/// `require_arguments` demands an argument key (used where the text gave
/// no explicit tool-call marker); marked shapes accept a bare name.
fn parse_call(candidate: &str, require_arguments: bool) -> Option<ExtractedToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = ARGUMENT_KEYS.iter().find_map(|key| obj.get(*key));
    if require_arguments && arguments.is_none() {
        return None;
    }

    let arguments = match arguments {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };

    Some(ExtractedToolCall {
        name: name.to_string(),
        arguments,
    })
}

fn remove_spans(content: &str, spans: &[(usize, usize)]) -> String {
    let mut cleaned = String::with_capacity(content.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        cleaned.push_str(&content[cursor..start]);
        cursor = end;
    }
    cleaned.push_str(&content[cursor..]);
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hermes_tags() {
        let text = "Let me check.\n<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}</tool_call>";
        let (calls, cleaned) = extract_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["city"], "Oslo");
        assert_eq!(cleaned, "Let me check.");
    }

    #[test]
    fn test_multiple_hermes_tags() {
        let text = "<tool_call>{\"name\":\"a\",\"arguments\":{}}</tool_call>\n<tool_call>{\"name\":\"b\",\"arguments\":{}}</tool_call>";
        let (calls, cleaned) = extract_tool_calls(text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
        assert!(cleaned.is_empty());
    }

    #[test]
    fn test_json_fence() {
        let text = "I'll call the tool:\n```json\n{\"name\": \"search\", \"input\": {\"q\": \"rust\"}}\n```\nDone.";
        let (calls, cleaned) = extract_tool_calls(text).unwrap();
        assert_eq!(calls[0].name, "search");
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["q"], "rust");
        assert_eq!(cleaned, "I'll call the tool:\n\nDone.");
    }

    #[test]
    fn test_bare_object() {
        let text = "Sure: {\"name\": \"lookup\", \"parameters\": {\"id\": 7}} there.";
        let (calls, cleaned) = extract_tool_calls(text).unwrap();
        assert_eq!(calls[0].name, "lookup");
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["id"], 7);
        assert_eq!(cleaned, "Sure:  there.");
    }

    #[test]
    fn test_bare_object_with_braces_in_strings() {
        let text = "{\"name\": \"echo\", \"arguments\": {\"text\": \"closing } brace \\\" quote\"}}";
        let (calls, _) = extract_tool_calls(text).unwrap();
        assert_eq!(calls[0].name, "echo");
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["text"], "closing } brace \" quote");
    }

    #[test]
    fn test_string_arguments_pass_through() {
        let text = "<tool_call>{\"name\": \"f\", \"arguments\": \"{\\\"a\\\":1}\"}</tool_call>";
        let (calls, _) = extract_tool_calls(text).unwrap();
        assert_eq!(calls[0].arguments, "{\"a\":1}");
    }

    #[test]
    fn test_plain_prose_is_ignored() {
        assert!(extract_tool_calls("No tools here, just text.").is_none());
        // An object without an argument key is not a bare tool call.
        assert!(extract_tool_calls("config: {\"name\": \"prod\"}").is_none());
        // Valid JSON, wrong shape.
        assert!(extract_tool_calls("{\"foo\": 1}").is_none());
    }

    #[test]
    fn test_unterminated_object_is_ignored() {
        assert!(extract_tool_calls("broken {\"name\": \"x\", \"arguments\": {").is_none());
    }
}
