//! Non-streaming response translation

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use hermes_core::error::{GatewayError, Result};

use crate::protocol::anthropic::{
    ContentBlock, MessagesResponse, Usage as AnthropicUsage,
};
use crate::protocol::openai::{
    ChatResponse, Choice, ResponseMessage, ToolCall, Usage as OpenAiUsage,
};
use crate::translate::text_tools;

/// Map an OpenAI finish_reason onto an Anthropic stop_reason
#[must_use]
pub fn map_finish_to_stop(finish: &str) -> &'static str {
    match finish {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Map an Anthropic stop_reason onto an OpenAI finish_reason
#[must_use]
pub fn map_stop_to_finish(stop: &str) -> &'static str {
    match stop {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Split leading `<think>…</think>` tags off assistant content
///
/// Returns `(reasoning, remainder)` when the content opens with a think
/// tag, `None` otherwise.
#[must_use]
pub fn split_think_tags(content: &str) -> Option<(String, String)> {
    let trimmed = content.trim_start();
    let inner_start = trimmed.strip_prefix("<think>")?;
    let close = inner_start.find("</think>")?;
    let reasoning = inner_start[..close].trim().to_string();
    let remainder = inner_start[close + "</think>".len()..]
        .trim_start()
        .to_string();
    Some((reasoning, remainder))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// OpenAI -> Anthropic
// ============================================================================

/// Translate a buffered OpenAI completion into an Anthropic message
///
/// Content block order is thinking, then text, then one `tool_use` per
/// tool call. The returned flag marks a prompt-cache hit (derived from
/// `cached_tokens`), surfaced out-of-band for metrics.
pub fn openai_to_anthropic_response(
    resp: &ChatResponse,
    fallback_model: &str,
) -> Result<(MessagesResponse, bool)> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| GatewayError::Translation("response has no choices".to_string()))?;

    let mut reasoning = choice.message.reasoning_content.clone().unwrap_or_default();
    let mut text = choice.message.content.clone().unwrap_or_default();

    // Some models inline their reasoning instead of using
    // reasoning_content.
    if reasoning.is_empty() {
        if let Some((thought, remainder)) = split_think_tags(&text) {
            reasoning = thought;
            text = remainder;
        }
    }

    let mut finish = choice.finish_reason.clone();
    let mut calls: Vec<(String, String, Value)> = Vec::new();

    match &choice.message.tool_calls {
        Some(tool_calls) if !tool_calls.is_empty() => {
            for call in tool_calls {
                let input: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                calls.push((call.id.clone(), call.function.name.clone(), input));
            }
        }
        _ => {
            // Weak-model fallback: re-materialize tool calls emitted as
            // plain text.
            if let Some((extracted, cleaned)) = text_tools::extract_tool_calls(&text) {
                for (idx, call) in extracted.iter().enumerate() {
                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    calls.push((format!("call_text_{idx}"), call.name.clone(), input));
                }
                text = cleaned;
                finish = Some("tool_calls".to_string());
            }
        }
    }

    let mut content = Vec::new();
    if !reasoning.is_empty() {
        content.push(ContentBlock::thinking(reasoning));
    }
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    for (id, name, input) in calls {
        content.push(ContentBlock::tool_use(id, name, input));
    }

    let usage = resp.usage.clone().unwrap_or_default();
    let cache_hit = usage
        .prompt_tokens_details
        .as_ref()
        .and_then(|d| d.cached_tokens)
        .is_some_and(|cached| cached > 0);

    let message = MessagesResponse {
        id: resp
            .id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: Some(
            resp.model
                .clone()
                .unwrap_or_else(|| fallback_model.to_string()),
        ),
        content,
        stop_reason: Some(
            map_finish_to_stop(finish.as_deref().unwrap_or("stop")).to_string(),
        ),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            extra: Map::new(),
        },
        extra: Map::new(),
    };

    Ok((message, cache_hit))
}

// ============================================================================
// Anthropic -> OpenAI
// ============================================================================

/// Translate a buffered Anthropic message into an OpenAI completion
pub fn anthropic_to_openai_response(resp: &MessagesResponse) -> Result<ChatResponse> {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(thinking),
            ContentBlock::ToolUse {
                id, name, input, ..
            } => {
                let arguments = serde_json::to_string(input)
                    .map_err(|e| GatewayError::Translation(e.to_string()))?;
                tool_calls.push(ToolCall::function(id.clone(), name.clone(), arguments));
            }
            _ => {}
        }
    }

    let finish_reason =
        map_stop_to_finish(resp.stop_reason.as_deref().unwrap_or("end_turn")).to_string();

    let usage = OpenAiUsage {
        prompt_tokens: resp.usage.input_tokens,
        completion_tokens: resp.usage.output_tokens,
        total_tokens: Some(resp.usage.input_tokens + resp.usage.output_tokens),
        prompt_tokens_details: None,
        extra: Map::new(),
    };

    Ok(ChatResponse {
        id: Some(resp.id.clone()),
        object: Some("chat.completion".to_string()),
        created: Some(now_unix()),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: Some("assistant".to_string()),
                content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                extra: Map::new(),
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(usage),
        extra: Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_stop_bijection() {
        for (finish, stop) in [("stop", "end_turn"), ("length", "max_tokens"), ("tool_calls", "tool_use")] {
            assert_eq!(map_finish_to_stop(finish), stop);
            assert_eq!(map_stop_to_finish(stop), finish);
        }
        assert_eq!(map_finish_to_stop("content_filter"), "end_turn");
        assert_eq!(map_stop_to_finish("stop_sequence"), "stop");
    }

    #[test]
    fn test_split_think_tags() {
        let (reasoning, rest) =
            split_think_tags("<think>count the rs</think>\nstrawberry has 3").unwrap();
        assert_eq!(reasoning, "count the rs");
        assert_eq!(rest, "strawberry has 3");

        assert!(split_think_tags("no tags here").is_none());
        assert!(split_think_tags("<think>unterminated").is_none());
    }

    #[test]
    fn test_openai_response_becomes_anthropic_blocks() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "reasoning_content": "thinking hard",
                    "content": "the answer",
                    "tool_calls": [{
                        "id": "c1", "type": "function",
                        "function": {"name": "f", "arguments": "{\"a\":1}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20}
        }))
        .unwrap();

        let (message, cache_hit) = openai_to_anthropic_response(&resp, "fallback").unwrap();
        assert!(!cache_hit);
        assert_eq!(message.id, "chatcmpl-1");
        assert_eq!(message.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(message.usage.input_tokens, 10);
        assert_eq!(message.usage.output_tokens, 20);

        assert_eq!(message.content.len(), 3);
        assert!(matches!(&message.content[0], ContentBlock::Thinking { thinking, .. } if thinking == "thinking hard"));
        assert!(matches!(&message.content[1], ContentBlock::Text { text, .. } if text == "the answer"));
        assert!(matches!(&message.content[2], ContentBlock::ToolUse { id, .. } if id == "c1"));
    }

    #[test]
    fn test_cache_hit_flag() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 100, "completion_tokens": 1,
                "prompt_tokens_details": {"cached_tokens": 64}
            }
        }))
        .unwrap();
        let (_, cache_hit) = openai_to_anthropic_response(&resp, "m").unwrap();
        assert!(cache_hit);
    }

    #[test]
    fn test_inline_think_tags_become_thinking_block() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {"content": "<think>hmm</think>answer"},
                "finish_reason": "stop"
            }]
        }))
        .unwrap();
        let (message, _) = openai_to_anthropic_response(&resp, "m").unwrap();
        assert!(matches!(&message.content[0], ContentBlock::Thinking { thinking, .. } if thinking == "hmm"));
        assert!(matches!(&message.content[1], ContentBlock::Text { text, .. } if text == "answer"));
    }

    #[test]
    fn test_textual_tool_call_is_rematerialized() {
        let resp: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {"content": "<tool_call>{\"name\":\"f\",\"arguments\":{\"x\":1}}</tool_call>"},
                "finish_reason": "stop"
            }]
        }))
        .unwrap();
        let (message, _) = openai_to_anthropic_response(&resp, "m").unwrap();
        assert_eq!(message.stop_reason.as_deref(), Some("tool_use"));
        match &message.content[0] {
            ContentBlock::ToolUse { id, name, input, .. } => {
                assert_eq!(id, "call_text_0");
                assert_eq!(name, "f");
                assert_eq!(input["x"], 1);
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn test_no_choices_is_translation_failure() {
        let resp: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(openai_to_anthropic_response(&resp, "m").is_err());
    }

    #[test]
    fn test_anthropic_response_becomes_openai_choice() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "thinking", "thinking": "hm"},
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t1", "name": "f", "input": {"a": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 7, "output_tokens": 9}
        }))
        .unwrap();

        let out = anthropic_to_openai_response(&resp).unwrap();
        let choice = &out.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.content.as_deref(), Some("hello"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("hm"));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "t1");
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args, json!({"a": 1}));

        let usage = out.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, Some(16));
    }

    #[test]
    fn test_usage_round_trip_exact() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": "x"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 123, "output_tokens": 456}
        }))
        .unwrap();

        let openai = anthropic_to_openai_response(&resp).unwrap();
        let (back, _) = openai_to_anthropic_response(&openai, "m").unwrap();
        assert_eq!(back.usage.input_tokens, 123);
        assert_eq!(back.usage.output_tokens, 456);
        assert_eq!(back.stop_reason.as_deref(), Some("max_tokens"));
    }
}
