//! Wire protocol types for the two supported dialects
//!
//! Known fields are typed; every envelope carries a flattened `extra`
//! map so provider-specific extensions (e.g. `extra_content.google.
//! thought_signature`) round-trip byte-for-byte through translation.

pub mod anthropic;
pub mod openai;

use serde::{Deserialize, Serialize};

/// A wire protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI Chat Completions
    OpenAi,
    /// Anthropic Messages
    Anthropic,
}

impl Dialect {
    /// Short name for log lines
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}
