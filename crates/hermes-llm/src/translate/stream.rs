//! Streaming SSE translation
//!
//! Each direction is an incremental state machine: feed it upstream SSE
//! payloads one line at a time, collect downstream events to write. No
//! machine buffers content; the only accumulated state is the per-index
//! tool-call fragments the OpenAI protocol forces us to hold until
//! `finish_reason` arrives.
//!
//! Framing is line-based. Lines longer than [`MAX_SSE_LINE_BYTES`]
//! abort the stream as a translation failure.

use std::collections::{BTreeMap, HashMap};

use futures::TryStreamExt;
use serde_json::{Map, Value};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::protocol::anthropic::{
    BlockDelta, ContentBlock, DeltaUsage, MessageDeltaBody, MessagesResponse, StreamEvent,
};
use crate::protocol::openai::{
    ChatChunk, ChunkDelta, FunctionCallDelta, ToolCallDelta, Usage,
};
use crate::translate::response::{map_finish_to_stop, map_stop_to_finish};

/// Upper bound on one SSE line; longer lines abort translation
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// The `data:` payload that terminates an OpenAI stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Payload of a `data:` line, if this is one
#[must_use]
pub fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// One downstream SSE event: optional `event:` name plus `data:` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub event: Option<String>,
    pub data: String,
}

impl RelayEvent {
    fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    fn from_stream_event(event: &StreamEvent) -> Self {
        Self {
            event: Some(event.name().to_string()),
            data: serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    fn from_chunk(chunk: &ChatChunk) -> Self {
        Self::data_only(serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string()))
    }
}

/// A streaming translator fed upstream SSE lines
pub trait StreamRelay: Send {
    /// Consume one upstream line, producing downstream events
    fn on_line(&mut self, line: &str) -> Vec<RelayEvent>;

    /// The upstream stream ended; flush whatever closes the response
    fn finish(&mut self) -> Vec<RelayEvent>;

    /// Token totals observed so far as `(input, output)`
    fn usage(&self) -> (u64, u64);
}

/// Line stream over an upstream SSE response body
///
/// A line above the cap surfaces as `LinesCodecError::MaxLineLengthExceeded`.
pub fn sse_line_stream(
    response: reqwest::Response,
) -> impl futures::Stream<Item = Result<String, LinesCodecError>> + Send {
    let reader = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES))
}

// ============================================================================
// OpenAI upstream -> Anthropic client
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Thinking,
    Text,
}

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    arguments: String,
}

/// Translates an OpenAI chunk stream into the Anthropic event sequence
pub struct OpenAiToAnthropic {
    message_id: String,
    model: String,
    started: bool,
    done: bool,
    block: OpenBlock,
    open_index: usize,
    next_index: usize,
    tools: BTreeMap<u32, PendingTool>,
    tools_emitted: bool,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAiToAnthropic {
    /// Create a machine for one response
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            started: false,
            done: false,
            block: OpenBlock::None,
            open_index: 0,
            next_index: 0,
            tools: BTreeMap::new(),
            tools_emitted: false,
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Consume one upstream chunk
    pub fn on_chunk(&mut self, chunk: &ChatChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.ensure_started(&mut out);

        if let Some(usage) = &chunk.usage {
            self.record_usage(usage);
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;

            if let Some(reasoning) = &delta.reasoning_content {
                if !reasoning.is_empty() {
                    self.switch_block(OpenBlock::Thinking, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.open_index,
                        delta: BlockDelta::ThinkingDelta {
                            thinking: reasoning.clone(),
                        },
                    });
                }
            }

            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    self.switch_block(OpenBlock::Text, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.open_index,
                        delta: BlockDelta::TextDelta {
                            text: content.clone(),
                        },
                    });
                }
            }

            if let Some(calls) = &delta.tool_calls {
                for call in calls {
                    let pending = self.tools.entry(call.index).or_default();
                    if let Some(id) = &call.id {
                        pending.id = id.clone();
                    }
                    if let Some(function) = &call.function {
                        if let Some(name) = &function.name {
                            pending.name.push_str(name);
                        }
                        if let Some(arguments) = &function.arguments {
                            pending.arguments.push_str(arguments);
                        }
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(map_finish_to_stop(reason).to_string());
                self.close_block(&mut out);
                self.emit_tools(&mut out);
            }
        }

        out
    }

    /// The upstream sent `[DONE]` (or closed); emit the closing events
    pub fn on_done(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.done = true;
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        // A stream that never carried finish_reason still owes its tool
        // blocks.
        self.emit_tools(&mut out);

        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(
                    self.stop_reason
                        .clone()
                        .unwrap_or_else(|| "end_turn".to_string()),
                ),
                stop_sequence: None,
            },
            usage: Some(DeltaUsage {
                input_tokens: Some(self.input_tokens),
                output_tokens: Some(self.output_tokens),
            }),
        });
        out.push(StreamEvent::MessageStop);
        out
    }

    /// Token totals observed so far
    #[must_use]
    pub fn tokens(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    fn record_usage(&mut self, usage: &Usage) {
        if usage.prompt_tokens > 0 {
            self.input_tokens = usage.prompt_tokens;
        }
        if usage.completion_tokens > 0 {
            self.output_tokens = usage.completion_tokens;
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                message: MessagesResponse::envelope(self.message_id.clone(), self.model.clone()),
            });
        }
    }

    fn switch_block(&mut self, target: OpenBlock, out: &mut Vec<StreamEvent>) {
        if self.block == target {
            return;
        }
        self.close_block(out);
        self.open_index = self.next_index;
        self.next_index += 1;
        self.block = target;
        let content_block = match target {
            OpenBlock::Thinking => ContentBlock::thinking(""),
            _ => ContentBlock::text(""),
        };
        out.push(StreamEvent::ContentBlockStart {
            index: self.open_index,
            content_block,
        });
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        if self.block != OpenBlock::None {
            out.push(StreamEvent::ContentBlockStop {
                index: self.open_index,
            });
            self.block = OpenBlock::None;
        }
    }

    fn emit_tools(&mut self, out: &mut Vec<StreamEvent>) {
        if self.tools_emitted || self.tools.is_empty() {
            return;
        }
        self.tools_emitted = true;

        for pending in self.tools.values() {
            let index = self.next_index;
            self.next_index += 1;

            out.push(StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::tool_use(
                    pending.id.clone(),
                    pending.name.clone(),
                    Value::Object(Map::new()),
                ),
            });
            if !pending.arguments.is_empty() {
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: pending.arguments.clone(),
                    },
                });
            }
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }
}

impl StreamRelay for OpenAiToAnthropic {
    fn on_line(&mut self, line: &str) -> Vec<RelayEvent> {
        let Some(data) = sse_data(line) else {
            return Vec::new();
        };
        if data == DONE_SENTINEL {
            return self
                .on_done()
                .iter()
                .map(RelayEvent::from_stream_event)
                .collect();
        }
        match serde_json::from_str::<ChatChunk>(data) {
            Ok(chunk) => self
                .on_chunk(&chunk)
                .iter()
                .map(RelayEvent::from_stream_event)
                .collect(),
            Err(err) => {
                debug!(%err, "skipping unparseable upstream chunk");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<RelayEvent> {
        self.on_done()
            .iter()
            .map(RelayEvent::from_stream_event)
            .collect()
    }

    fn usage(&self) -> (u64, u64) {
        self.tokens()
    }
}

// ============================================================================
// Anthropic upstream -> OpenAI client
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Text,
    Thinking,
    Tool { openai_index: u32 },
}

/// Translates an Anthropic event stream into OpenAI chunks
pub struct AnthropicToOpenAi {
    id: String,
    model: String,
    done: bool,
    finish_emitted: bool,
    blocks: HashMap<usize, BlockKind>,
    next_tool_index: u32,
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicToOpenAi {
    /// Create a machine for one response
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            done: false,
            finish_emitted: false,
            blocks: HashMap::new(),
            next_tool_index: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Consume one upstream event
    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<ChatChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        match event {
            StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id.clone();
                }
                if let Some(model) = &message.model {
                    self.model = model.clone();
                }
                self.input_tokens = message.usage.input_tokens;
                self.output_tokens = message.usage.output_tokens;

                out.push(ChatChunk::delta(
                    &self.id,
                    &self.model,
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..ChunkDelta::default()
                    },
                ));
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { .. } => {
                    self.blocks.insert(*index, BlockKind::Text);
                }
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                    self.blocks.insert(*index, BlockKind::Thinking);
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    let openai_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.blocks
                        .insert(*index, BlockKind::Tool { openai_index });

                    out.push(ChatChunk::delta(
                        &self.id,
                        &self.model,
                        ChunkDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index: openai_index,
                                id: Some(id.clone()),
                                r#type: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(name.clone()),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                    ));
                }
                ContentBlock::ToolResult { .. } => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    out.push(ChatChunk::delta(
                        &self.id,
                        &self.model,
                        ChunkDelta {
                            content: Some(text.clone()),
                            ..ChunkDelta::default()
                        },
                    ));
                }
                BlockDelta::ThinkingDelta { thinking } => {
                    out.push(ChatChunk::delta(
                        &self.id,
                        &self.model,
                        ChunkDelta {
                            reasoning_content: Some(thinking.clone()),
                            ..ChunkDelta::default()
                        },
                    ));
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(BlockKind::Tool { openai_index }) = self.blocks.get(index) {
                        out.push(ChatChunk::delta(
                            &self.id,
                            &self.model,
                            ChunkDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index: *openai_index,
                                    id: None,
                                    r#type: None,
                                    function: Some(FunctionCallDelta {
                                        name: None,
                                        arguments: Some(partial_json.clone()),
                                    }),
                                }]),
                                ..ChunkDelta::default()
                            },
                        ));
                    }
                }
                BlockDelta::SignatureDelta { .. } => {}
            },
            StreamEvent::ContentBlockStop { .. } => {}
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    if let Some(input) = usage.input_tokens {
                        self.input_tokens = input;
                    }
                    if let Some(output) = usage.output_tokens {
                        self.output_tokens = output;
                    }
                }
                if let Some(stop) = &delta.stop_reason {
                    self.finish_emitted = true;
                    let mut chunk =
                        ChatChunk::finish(&self.id, &self.model, map_stop_to_finish(stop));
                    chunk.usage = Some(Usage {
                        prompt_tokens: self.input_tokens,
                        completion_tokens: self.output_tokens,
                        total_tokens: Some(self.input_tokens + self.output_tokens),
                        prompt_tokens_details: None,
                        extra: Map::new(),
                    });
                    out.push(chunk);
                }
            }
            StreamEvent::MessageStop => {
                self.done = true;
            }
            StreamEvent::Ping | StreamEvent::Error { .. } => {}
        }

        out
    }

    /// The upstream ended; close the choice if it never finished
    pub fn on_done(&mut self) -> Vec<ChatChunk> {
        if self.finish_emitted {
            return Vec::new();
        }
        self.finish_emitted = true;
        vec![ChatChunk::finish(&self.id, &self.model, "stop")]
    }

    /// Token totals observed so far
    #[must_use]
    pub fn tokens(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }
}

impl StreamRelay for AnthropicToOpenAi {
    fn on_line(&mut self, line: &str) -> Vec<RelayEvent> {
        let Some(data) = sse_data(line) else {
            return Vec::new();
        };
        let event = match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => event,
            Err(err) => {
                debug!(%err, "skipping unparseable upstream event");
                return Vec::new();
            }
        };

        let mut out: Vec<RelayEvent> = self
            .on_event(&event)
            .iter()
            .map(RelayEvent::from_chunk)
            .collect();
        if matches!(event, StreamEvent::MessageStop) {
            out.extend(self.on_done().iter().map(RelayEvent::from_chunk));
            out.push(RelayEvent::data_only(DONE_SENTINEL));
        }
        out
    }

    fn finish(&mut self) -> Vec<RelayEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out: Vec<RelayEvent> =
            self.on_done().iter().map(RelayEvent::from_chunk).collect();
        out.push(RelayEvent::data_only(DONE_SENTINEL));
        out
    }

    fn usage(&self) -> (u64, u64) {
        self.tokens()
    }
}

// ============================================================================
// Same-dialect pass-through with a usage tap
// ============================================================================

/// Relays an OpenAI stream unchanged while recording usage
#[derive(Default)]
pub struct OpenAiPassThrough {
    done: bool,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAiPassThrough {
    /// Create the tap
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamRelay for OpenAiPassThrough {
    fn on_line(&mut self, line: &str) -> Vec<RelayEvent> {
        let Some(data) = sse_data(line) else {
            return Vec::new();
        };
        if data == DONE_SENTINEL {
            self.done = true;
            return vec![RelayEvent::data_only(DONE_SENTINEL)];
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
                if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_u64) {
                    self.input_tokens = prompt;
                }
                if let Some(completion) = usage.get("completion_tokens").and_then(Value::as_u64) {
                    self.output_tokens = completion;
                }
            }
        }
        vec![RelayEvent::data_only(data)]
    }

    fn finish(&mut self) -> Vec<RelayEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![RelayEvent::data_only(DONE_SENTINEL)]
    }

    fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }
}

/// Relays an Anthropic stream unchanged while recording usage
#[derive(Default)]
pub struct AnthropicPassThrough {
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicPassThrough {
    /// Create the tap
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamRelay for AnthropicPassThrough {
    fn on_line(&mut self, line: &str) -> Vec<RelayEvent> {
        let Some(data) = sse_data(line) else {
            return Vec::new();
        };
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let event_name = value.get("type").and_then(Value::as_str).map(str::to_string);

        match event_name.as_deref() {
            Some("message_start") => {
                if let Some(usage) = value.pointer("/message/usage") {
                    if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                        self.input_tokens = input;
                    }
                    if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                        self.output_tokens = output;
                    }
                }
            }
            Some("message_delta") => {
                if let Some(usage) = value.get("usage") {
                    if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                        self.input_tokens = input;
                    }
                    if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                        self.output_tokens = output;
                    }
                }
            }
            _ => {}
        }

        vec![RelayEvent {
            event: event_name,
            data: data.to_string(),
        }]
    }

    fn finish(&mut self) -> Vec<RelayEvent> {
        Vec::new()
    }

    fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }
}
