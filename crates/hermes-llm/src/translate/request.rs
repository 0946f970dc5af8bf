//! Request translation between dialects

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use hermes_core::error::{GatewayError, Result};

use crate::protocol::anthropic::{
    self, ContentBlock, Message, MessageContent as AnthropicContent, MessagesRequest, SystemBlock,
    SystemPrompt,
};
use crate::protocol::openai::{
    self, ChatMessage, ChatRequest, ContentPart, MessageContent as OpenAiContent, StreamOptions,
    ToolCall,
};
use crate::tokens;

/// Replacement name for tools whose sanitized name comes out empty
const UNKNOWN_TOOL_NAME: &str = "_unknown";

fn tool_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").expect("hardcoded pattern"))
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`
///
/// Providers reject tool names containing `/`, `:` and friends; an
/// all-invalid name maps to `_unknown`.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized = tool_name_pattern().replace_all(name, "_").to_string();
    if sanitized.is_empty() {
        UNKNOWN_TOOL_NAME.to_string()
    } else {
        sanitized
    }
}

// ============================================================================
// Anthropic -> OpenAI
// ============================================================================

/// Convert an Anthropic Messages request into an OpenAI Chat Completions
/// request
///
/// System blocks concatenate (or survive as text parts when any carries
/// a cache-control breakpoint), tool results become `role:"tool"`
/// messages, assistant thinking becomes `reasoning_content`, and
/// `max_tokens` is clamped to the model's ceiling.
pub fn anthropic_to_openai_request(req: &MessagesRequest) -> Result<ChatRequest> {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        if let Some(msg) = convert_system(system) {
            messages.push(msg);
        }
    }

    for msg in &req.messages {
        match msg.role.as_str() {
            "user" => convert_user_message(msg, &mut messages),
            "assistant" => messages.push(convert_assistant_message(msg)?),
            other => {
                // Unknown role: forward the flattened text unchanged.
                messages.push(ChatMessage::text(other, flatten_blocks_text(&msg.content)));
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| openai::Tool {
                r#type: "function".to_string(),
                function: openai::FunctionDef {
                    name: sanitize_tool_name(&t.name),
                    description: t.description.clone(),
                    parameters: Some(t.input_schema.clone()),
                },
                extra: Map::new(),
            })
            .collect()
    });

    Ok(ChatRequest {
        model: req.model.clone(),
        messages,
        max_tokens: Some(tokens::clamp(&req.model, req.max_tokens)),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stop: req.stop_sequences.as_ref().map(|s| json!(s)),
        tools,
        tool_choice: req.tool_choice.as_ref().map(tool_choice_to_openai),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        extra: req.extra.clone(),
    })
}

fn convert_system(system: &SystemPrompt) -> Option<ChatMessage> {
    match system {
        SystemPrompt::Text(text) if !text.is_empty() => Some(ChatMessage::text("system", text)),
        SystemPrompt::Text(_) => None,
        SystemPrompt::Blocks(blocks) => {
            if blocks.is_empty() {
                return None;
            }
            if blocks.iter().any(|b| b.cache_control.is_some()) {
                // Keep cache breakpoints by emitting an array of parts.
                let parts = blocks
                    .iter()
                    .map(|b| ContentPart::text(b.text.clone(), b.cache_control.clone()))
                    .collect();
                Some(ChatMessage {
                    role: "system".to_string(),
                    content: Some(OpenAiContent::Parts(parts)),
                    ..ChatMessage::default()
                })
            } else {
                let joined = blocks
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                (!joined.is_empty()).then(|| ChatMessage::text("system", joined))
            }
        }
    }
}

fn convert_user_message(msg: &Message, out: &mut Vec<ChatMessage>) {
    let mut text = String::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(&t),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let flattened =
                    ContentBlock::flatten_result_text(&content.unwrap_or(Value::Null));
                out.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAiContent::Text(flattened)),
                    tool_call_id: Some(tool_use_id),
                    ..ChatMessage::default()
                });
            }
            _ => {}
        }
    }

    if !text.is_empty() {
        out.push(ChatMessage::text("user", text));
    }
}

fn convert_assistant_message(msg: &Message) -> Result<ChatMessage> {
    let mut reasoning = String::new();
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in msg.content.as_blocks() {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(&t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse {
                id, name, input, ..
            } => {
                let arguments = serde_json::to_string(&input)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
                tool_calls.push(ToolCall::function(id, sanitize_tool_name(&name), arguments));
            }
            _ => {}
        }
    }

    Ok(ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty() || tool_calls.is_empty())
            .then(|| OpenAiContent::Text(text)),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..ChatMessage::default()
    })
}

fn flatten_blocks_text(content: &AnthropicContent) -> String {
    content
        .as_blocks()
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn tool_choice_to_openai(choice: &Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": choice.get("name").and_then(Value::as_str).unwrap_or_default()}
        }),
        _ => choice.clone(),
    }
}

// ============================================================================
// OpenAI -> Anthropic
// ============================================================================

/// Convert an OpenAI Chat Completions request into an Anthropic Messages
/// request
///
/// `role:"tool"` messages fold back into user messages of `tool_result`
/// blocks; assistant `tool_calls` become `tool_use` blocks with parsed
/// inputs.
pub fn openai_to_anthropic_request(req: &ChatRequest) -> Result<MessagesRequest> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => match &msg.content {
                Some(OpenAiContent::Parts(parts))
                    if parts.iter().any(|p| p.cache_control.is_some()) =>
                {
                    for part in parts {
                        system_blocks.push(SystemBlock {
                            r#type: "text".to_string(),
                            text: part.text.clone().unwrap_or_default(),
                            cache_control: part.cache_control.clone(),
                            extra: Map::new(),
                        });
                    }
                }
                _ => {
                    let text = msg.content_text();
                    if !text.is_empty() {
                        system_texts.push(text);
                    }
                }
            },
            "tool" => {
                pending_results.push(ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: Some(Value::String(msg.content_text())),
                    is_error: None,
                    extra: Map::new(),
                });
            }
            "user" => {
                flush_tool_results(&mut pending_results, &mut messages);
                messages.push(convert_openai_user(msg));
            }
            "assistant" => {
                flush_tool_results(&mut pending_results, &mut messages);
                if let Some(converted) = convert_openai_assistant(msg)? {
                    messages.push(converted);
                }
            }
            _ => {
                flush_tool_results(&mut pending_results, &mut messages);
                messages.push(Message::text("user", msg.content_text()));
            }
        }
    }
    flush_tool_results(&mut pending_results, &mut messages);

    let system = if !system_blocks.is_empty() {
        for text in system_texts {
            system_blocks.push(SystemBlock {
                r#type: "text".to_string(),
                text,
                cache_control: None,
                extra: Map::new(),
            });
        }
        Some(SystemPrompt::Blocks(system_blocks))
    } else if !system_texts.is_empty() {
        Some(SystemPrompt::Text(system_texts.join("\n\n")))
    } else {
        None
    };

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| anthropic::Tool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
                extra: Map::new(),
            })
            .collect()
    });

    Ok(MessagesRequest {
        model: req.model.clone(),
        max_tokens: Some(tokens::clamp(&req.model, req.max_tokens)),
        system,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stop_sequences: req.stop.as_ref().map(stop_to_sequences),
        tools,
        tool_choice: req.tool_choice.as_ref().and_then(tool_choice_to_anthropic),
        extra: req.extra.clone(),
    })
}

fn flush_tool_results(pending: &mut Vec<ContentBlock>, messages: &mut Vec<Message>) {
    if !pending.is_empty() {
        messages.push(Message::blocks("user", std::mem::take(pending)));
    }
}

fn convert_openai_user(msg: &ChatMessage) -> Message {
    match &msg.content {
        Some(OpenAiContent::Parts(parts)) => {
            let blocks = parts
                .iter()
                .filter_map(|p| {
                    p.text.as_ref().map(|text| ContentBlock::Text {
                        text: text.clone(),
                        cache_control: p.cache_control.clone(),
                        extra: Map::new(),
                    })
                })
                .collect();
            Message::blocks("user", blocks)
        }
        _ => Message::text("user", msg.content_text()),
    }
}

fn convert_openai_assistant(msg: &ChatMessage) -> Result<Option<Message>> {
    let mut blocks = Vec::new();

    if let Some(reasoning) = &msg.reasoning_content {
        if !reasoning.is_empty() {
            blocks.push(ContentBlock::thinking(reasoning.clone()));
        }
    }

    let text = msg.content_text();
    if !text.is_empty() {
        blocks.push(ContentBlock::text(text));
    }

    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            let input: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            blocks.push(ContentBlock::tool_use(
                call.id.clone(),
                call.function.name.clone(),
                input,
            ));
        }
    }

    if blocks.is_empty() {
        return Ok(None);
    }
    Ok(Some(Message::blocks("assistant", blocks)))
}

fn stop_to_sequences(stop: &Value) -> Vec<String> {
    match stop {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn tool_choice_to_anthropic(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            // Anthropic has no "none"; dropping the field means auto.
            "none" => None,
            _ => None,
        },
        Value::Object(obj) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

// ============================================================================
// Same-dialect upstream preparation
// ============================================================================

/// Rewrite an OpenAI-dialect body for its routed upstream: swap the
/// model, clamp `max_tokens`, and request usage on streams
pub fn prepare_openai_upstream(req: &mut ChatRequest, routed_model: &str) {
    req.model = routed_model.to_string();
    req.max_tokens = Some(tokens::clamp(routed_model, req.max_tokens));
    if req.stream {
        req.stream_options = Some(StreamOptions {
            include_usage: true,
        });
    }
}

/// Rewrite an Anthropic-dialect body for its routed upstream
pub fn prepare_anthropic_upstream(req: &mut MessagesRequest, routed_model: &str) {
    req.model = routed_model.to_string();
    req.max_tokens = Some(tokens::clamp(routed_model, req.max_tokens));
}

// ============================================================================
// System prefix injection
// ============================================================================

/// Prepend the configured system prefix to an OpenAI-dialect request
///
/// Idempotent: a request already carrying the prefix is left alone.
pub fn inject_system_prefix_openai(req: &mut ChatRequest, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    if let Some(first) = req.messages.first_mut() {
        if first.role == "system" {
            let existing = first.content_text();
            if existing.starts_with(prefix) {
                return;
            }
            first.content = Some(OpenAiContent::Text(format!("{prefix}\n\n{existing}")));
            return;
        }
    }
    req.messages.insert(0, ChatMessage::text("system", prefix));
}

/// Prepend the configured system prefix to an Anthropic-dialect request
///
/// Idempotent on the prefix portion.
pub fn inject_system_prefix_anthropic(req: &mut MessagesRequest, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    match &mut req.system {
        None => req.system = Some(SystemPrompt::Text(prefix.to_string())),
        Some(SystemPrompt::Text(existing)) => {
            if !existing.starts_with(prefix) {
                *existing = format!("{prefix}\n\n{existing}");
            }
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            let already = blocks.first().is_some_and(|b| b.text.starts_with(prefix));
            if !already {
                blocks.insert(
                    0,
                    SystemBlock {
                        r#type: "text".to_string(),
                        text: prefix.to_string(),
                        cache_control: None,
                        extra: Map::new(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("read_file"), "read_file");
        assert_eq!(sanitize_tool_name("fs/read"), "fs_read");
        assert_eq!(sanitize_tool_name("ns:tool.v2"), "ns_tool_v2");
        assert_eq!(sanitize_tool_name(""), "_unknown");
        assert_eq!(sanitize_tool_name("漢字"), "__");
    }

    #[test]
    fn test_minimal_openai_to_anthropic() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "X",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }))
        .unwrap();

        let out = openai_to_anthropic_request(&req).unwrap();
        assert_eq!(out.model, "X");
        assert_eq!(out.max_tokens, Some(tokens::clamp("X", None)));
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, "user");
        assert!(matches!(
            &out.messages[0].content,
            AnthropicContent::Text(t) if t == "hi"
        ));
        assert!(out.system.is_none());
        assert!(!out.stream);
    }

    #[test]
    fn test_anthropic_to_openai_system_and_tools() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1000,
            "system": [
                {"type": "text", "text": "be brief"},
                {"type": "text", "text": "be kind"}
            ],
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "fs/read", "description": "read", "input_schema": {"type": "object"}}],
            "stream": true
        }))
        .unwrap();

        let out = anthropic_to_openai_request(&req).unwrap();
        assert_eq!(out.messages[0].role, "system");
        assert_eq!(out.messages[0].content_text(), "be brief\n\nbe kind");
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].function.name, "fs_read");
        assert!(out.stream);
        assert!(out.stream_options.unwrap().include_usage);
        assert_eq!(out.max_tokens, Some(1000));
    }

    #[test]
    fn test_system_cache_control_survives_as_parts() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "system": [
                {"type": "text", "text": "stable", "cache_control": {"type": "ephemeral"}},
                {"type": "text", "text": "volatile"}
            ],
            "messages": []
        }))
        .unwrap();

        let out = anthropic_to_openai_request(&req).unwrap();
        match &out.messages[0].content {
            Some(OpenAiContent::Parts(parts)) => {
                assert_eq!(parts.len(), 2);
                assert!(parts[0].cache_control.is_some());
                assert!(parts[1].cache_control.is_none());
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_results_become_tool_messages_in_order() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "one"},
                    {"type": "tool_result", "tool_use_id": "t2",
                     "content": [{"type": "text", "text": "two"}]},
                    {"type": "text", "text": "continue"}
                ]
            }]
        }))
        .unwrap();

        let out = anthropic_to_openai_request(&req).unwrap();
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[0].role, "tool");
        assert_eq!(out.messages[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(out.messages[0].content_text(), "one");
        assert_eq!(out.messages[1].tool_call_id.as_deref(), Some("t2"));
        assert_eq!(out.messages[1].content_text(), "two");
        assert_eq!(out.messages[2].role, "user");
        assert_eq!(out.messages[2].content_text(), "continue");
    }

    #[test]
    fn test_assistant_blocks_split_into_fields() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "let me see"},
                    {"type": "text", "text": "answer"},
                    {"type": "tool_use", "id": "t1", "name": "calc", "input": {"a": 1}}
                ]
            }]
        }))
        .unwrap();

        let out = anthropic_to_openai_request(&req).unwrap();
        let assistant = &out.messages[0];
        assert_eq!(assistant.reasoning_content.as_deref(), Some("let me see"));
        assert_eq!(assistant.content_text(), "answer");
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].function.name, "calc");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
    }

    #[test]
    fn test_tool_messages_fold_back_into_user_blocks() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "tool_calls": [
                    {"id": "t1", "type": "function",
                     "function": {"name": "calc", "arguments": "{\"a\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "t1", "content": "42"},
                {"role": "user", "content": "thanks"}
            ]
        }))
        .unwrap();

        let out = openai_to_anthropic_request(&req).unwrap();
        assert_eq!(out.messages.len(), 3);

        match &out.messages[0].content {
            AnthropicContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolUse { id, name, input, .. } => {
                    assert_eq!(id, "t1");
                    assert_eq!(name, "calc");
                    assert_eq!(input["a"], 1);
                }
                other => panic!("expected tool_use, got {other:?}"),
            },
            AnthropicContent::Text(_) => panic!("expected blocks"),
        }

        match &out.messages[1].content {
            AnthropicContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    assert_eq!(tool_use_id, "t1");
                    assert_eq!(
                        ContentBlock::flatten_result_text(content.as_ref().unwrap_or(&Value::Null)),
                        "42"
                    );
                }
                other => panic!("expected tool_result, got {other:?}"),
            },
            AnthropicContent::Text(_) => panic!("expected blocks"),
        }
        assert_eq!(out.messages[1].role, "user");
    }

    #[test]
    fn test_round_trip_preserves_conversation() {
        let original: ChatRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "add 1 and 2"},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function",
                     "function": {"name": "add", "arguments": "{\"a\":1,\"b\":2}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "3"},
                {"role": "user", "content": "now say it"}
            ]
        }))
        .unwrap();

        let there = openai_to_anthropic_request(&original).unwrap();
        let back = anthropic_to_openai_request(&there).unwrap();

        assert_eq!(back.model, "gpt-4o");
        let roles: Vec<&str> = back.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "user"]);
        assert_eq!(back.messages[1].content_text(), "add 1 and 2");
        let call = &back.messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "add");
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args, json!({"a": 1, "b": 2}));
        assert_eq!(back.messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(back.messages[3].content_text(), "3");
        assert_eq!(back.messages[4].content_text(), "now say it");
    }

    #[test]
    fn test_inject_system_prefix_openai_idempotent() {
        let mut req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        inject_system_prefix_openai(&mut req, "routed by hermes");
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[0].content_text(), "routed by hermes");

        inject_system_prefix_openai(&mut req, "routed by hermes");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].content_text(), "routed by hermes");
    }

    #[test]
    fn test_inject_system_prefix_anthropic_idempotent() {
        let mut req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "system": "existing",
            "messages": []
        }))
        .unwrap();

        inject_system_prefix_anthropic(&mut req, "prefix");
        inject_system_prefix_anthropic(&mut req, "prefix");

        match &req.system {
            Some(SystemPrompt::Text(s)) => assert_eq!(s, "prefix\n\nexisting"),
            other => panic!("unexpected system {other:?}"),
        }
    }

    #[test]
    fn test_stop_sequences_convert() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [],
            "stop": ["END", "STOP"]
        }))
        .unwrap();
        let out = openai_to_anthropic_request(&req).unwrap();
        assert_eq!(
            out.stop_sequences,
            Some(vec!["END".to_string(), "STOP".to_string()])
        );
    }
}
