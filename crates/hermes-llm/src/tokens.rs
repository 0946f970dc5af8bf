//! Per-model max_tokens ceilings
//!
//! Upstream providers reject requests whose `max_tokens` exceeds the
//! model's output window, so the gateway clamps before forwarding.
//! Unknown models get a conservative default; nothing ever exceeds the
//! hard cap.

/// Ceiling applied to models not present in the table
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Absolute upper bound regardless of model
pub const HARD_CAP_MAX_TOKENS: u32 = 128_000;

/// Longest-prefix table of per-model output ceilings
///
/// Order matters: more specific prefixes come first.
const CEILINGS: &[(&str, u32)] = &[
    ("gpt-3.5-turbo", 4096),
    ("gpt-4-turbo", 16384),
    ("gpt-4o-mini", 16384),
    ("gpt-4o", 16384),
    ("gpt-4", 8192),
    ("claude-3-5-sonnet", 8192),
    ("claude-3.5-sonnet", 8192),
    ("claude-3", 4096),
    ("claude-sonnet-4", 16384),
    ("claude-opus-4", 32768),
    ("llama3-", 8192),
    ("mixtral-8x7b-32768", 32768),
    ("moonshot-v1-8k", 8192),
    ("moonshot-v1-32k", 32768),
    ("moonshot-v1-128k", 128_000),
    ("deepseek-chat", 8192),
    ("deepseek-reasoner", 64000),
];

/// Output-token ceiling for a model
#[must_use]
pub fn ceiling(model: &str) -> u32 {
    for (prefix, cap) in CEILINGS {
        if model.starts_with(prefix) {
            return (*cap).min(HARD_CAP_MAX_TOKENS);
        }
    }
    DEFAULT_MAX_TOKENS
}

/// Clamp a requested `max_tokens` to the model's ceiling
///
/// Absent or zero requests get the model's full ceiling.
#[must_use]
pub fn clamp(model: &str, requested: Option<u32>) -> u32 {
    let cap = ceiling(model);
    match requested {
        Some(n) if n > 0 => n.min(cap),
        _ => cap,
    }
}
