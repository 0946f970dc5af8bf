//! Dialect translation
//!
//! Pure functions and incremental state machines converting between the
//! OpenAI Chat Completions and Anthropic Messages protocols, in both
//! directions, for requests, buffered responses, and SSE streams.

pub mod dedup;
pub mod request;
pub mod response;
pub mod stream;
pub mod text_tools;

pub use dedup::dedup_tool_results;
pub use request::{
    anthropic_to_openai_request, inject_system_prefix_anthropic, inject_system_prefix_openai,
    openai_to_anthropic_request, prepare_anthropic_upstream, prepare_openai_upstream,
    sanitize_tool_name,
};
pub use response::{
    anthropic_to_openai_response, map_finish_to_stop, map_stop_to_finish,
    openai_to_anthropic_response,
};
pub use stream::{
    AnthropicPassThrough, AnthropicToOpenAi, OpenAiPassThrough, OpenAiToAnthropic, RelayEvent,
    StreamRelay, MAX_SSE_LINE_BYTES,
};
