//! Cross-crate integration tests
//!
//! Exercise the routing and translation subsystems together, without
//! the HTTP layer: weighted routing against the in-memory DAL, full
//! request translation round trips, and the streaming tape invariants.

use std::sync::Arc;

use serde_json::{json, Value};

use hermes_core::{MemoryDal, ProviderType, QuotaItem};
use hermes_llm::protocol::anthropic::{MessagesRequest, StreamEvent};
use hermes_llm::protocol::openai::{ChatChunk, ChatRequest};
use hermes_llm::translate::{
    anthropic_to_openai_request, dedup_tool_results, openai_to_anthropic_request,
    OpenAiToAnthropic, StreamRelay,
};
use hermes_llm::{QuotaRpmLimiter, Router, ScriptedRoller};

fn item(quota_id: i64, model: &str, weight: f64, rpm: Option<i64>) -> QuotaItem {
    QuotaItem {
        quota_id,
        sub_id: 42,
        model_id: quota_id,
        model_name: model.to_string(),
        percentage_weight: weight,
        base_url: "https://upstream.example".to_string(),
        upstream_api_key: "sk-x".to_string(),
        provider_type: ProviderType::OpenaiCompatible,
        provider_id: 1,
        rpm,
        tpm: None,
        rpd: None,
    }
}

#[tokio::test]
async fn routing_respects_weights_and_failover_together() {
    let dal = Arc::new(MemoryDal::new());
    dal.add_quota_items(
        42,
        vec![
            item(1, "small", 20.0, Some(1)),
            item(2, "large", 80.0, None),
        ],
    )
    .await;

    // First roll lands on "small", exhausting its single-request minute.
    // The second roll lands on "small" again, which fails over to
    // "large" via the retry roll.
    let router = Router::with_roller(
        dal.clone(),
        Arc::new(QuotaRpmLimiter::new()),
        Box::new(ScriptedRoller::new([5.0, 10.0, 50.0])),
    );

    assert_eq!(router.route(42, "any").await.unwrap().model, "small");
    assert_eq!(router.route(42, "any").await.unwrap().model, "large");
}

#[test]
fn request_survives_dialect_round_trip_with_tools() {
    let original: ChatRequest = serde_json::from_value(json!({
        "model": "gpt-4o",
        "stream": true,
        "messages": [
            {"role": "system", "content": "terse please"},
            {"role": "user", "content": "weather in Oslo?"},
            {"role": "assistant", "tool_calls": [{
                "id": "c9", "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
            }]},
            {"role": "tool", "tool_call_id": "c9", "content": "rainy, 7C"}
        ],
        "tools": [{
            "type": "function",
            "function": {"name": "get_weather", "description": "wx",
                         "parameters": {"type": "object"}}
        }]
    }))
    .unwrap();

    let anthropic = openai_to_anthropic_request(&original).unwrap();
    let back = anthropic_to_openai_request(&anthropic).unwrap();

    assert_eq!(back.model, original.model);
    assert!(back.stream);
    let roles: Vec<&str> = back.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);

    let call = &back.messages[2].tool_calls.as_ref().unwrap()[0];
    assert_eq!(call.function.name, "get_weather");
    let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
    assert_eq!(args["city"], "Oslo");

    assert_eq!(back.messages[3].tool_call_id.as_deref(), Some("c9"));
    assert_eq!(back.messages[3].content_text(), "rainy, 7C");

    let tools = back.tools.as_ref().unwrap();
    assert_eq!(tools[0].function.name, "get_weather");
}

#[test]
fn dedup_keeps_last_result_across_messages() {
    let mut req: MessagesRequest = serde_json::from_value(json!({
        "model": "m",
        "messages": [
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "T1", "content": "stale"},
                {"type": "tool_result", "tool_use_id": "T1", "content": "stale too"}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "T1", "content": "fresh"},
                {"type": "text", "text": "carry on"}
            ]}
        ]
    }))
    .unwrap();

    dedup_tool_results(&mut req);
    let encoded = serde_json::to_value(&req).unwrap();

    assert_eq!(encoded["messages"].as_array().unwrap().len(), 1);
    assert_eq!(encoded["messages"][0]["content"][0]["content"], "fresh");
}

#[test]
fn streaming_relay_produces_well_formed_tape() {
    let mut machine = OpenAiToAnthropic::new("routed");
    let mut events: Vec<StreamEvent> = Vec::new();

    for payload in [
        json!({"choices": [{"delta": {"reasoning_content": "mull"}}]}),
        json!({"choices": [{"delta": {"content": "verdict"}}]}),
        json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 4}}),
    ] {
        let chunk: ChatChunk = serde_json::from_value(payload).unwrap();
        events.extend(machine.on_chunk(&chunk));
    }
    events.extend(machine.on_done());

    // Starts with message_start, ends with message_stop.
    assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));

    // Every started block is stopped, in nesting order.
    let mut open: Vec<usize> = Vec::new();
    for event in &events {
        match event {
            StreamEvent::ContentBlockStart { index, .. } => open.push(*index),
            StreamEvent::ContentBlockStop { index } => {
                assert_eq!(open.pop(), Some(*index));
            }
            _ => {}
        }
    }
    assert!(open.is_empty());
    assert_eq!(machine.tokens(), (9, 4));
}

#[test]
fn relay_line_interface_matches_machine_interface() {
    let mut machine = OpenAiToAnthropic::new("routed");
    let events = machine.on_line("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}");
    assert!(events
        .iter()
        .any(|e| e.event.as_deref() == Some("content_block_delta")));

    let closing = machine.on_line("data: [DONE]");
    assert_eq!(
        closing.last().and_then(|e| e.event.as_deref()),
        Some("message_stop")
    );
    assert!(machine.finish().is_empty());
}
