//! Domain types shared across the gateway
//!
//! These mirror the persisted rows the DAL reads, plus the in-memory
//! shapes the routing and accounting paths pass around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// An authenticated API user, attached to the request context by the
/// auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub api_token: String,
    pub subscription_id: i64,
    pub subscription_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Principal {
    /// A principal is valid iff it is active and not expired
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Upstream provider wire family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenaiCompatible,
    AnthropicCompatible,
    Groq,
    AntigravityProxy,
    Cliproxy,
}

impl ProviderType {
    /// Whether this provider speaks the Anthropic Messages dialect
    #[must_use]
    pub fn is_anthropic(&self) -> bool {
        matches!(self, Self::AnthropicCompatible)
    }

    /// Chat-completion path relative to the provider base URL
    #[must_use]
    pub fn chat_path(&self) -> &'static str {
        match self {
            // Groq serves the OpenAI-compatible API under /openai
            Self::Groq => "/openai/v1/chat/completions",
            Self::AnthropicCompatible => "/v1/messages",
            Self::OpenaiCompatible | Self::AntigravityProxy | Self::Cliproxy => {
                "/v1/chat/completions"
            }
        }
    }

    /// Snake-case name as stored in the providers table
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai_compatible",
            Self::AnthropicCompatible => "anthropic_compatible",
            Self::Groq => "groq",
            Self::AntigravityProxy => "antigravity_proxy",
            Self::Cliproxy => "cliproxy",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai_compatible" => Ok(Self::OpenaiCompatible),
            "anthropic_compatible" => Ok(Self::AnthropicCompatible),
            "groq" => Ok(Self::Groq),
            "antigravity_proxy" => Ok(Self::AntigravityProxy),
            "cliproxy" => Ok(Self::Cliproxy),
            other => Err(GatewayError::Database(format!(
                "unknown provider_type '{other}'"
            ))),
        }
    }
}

/// One routing target: the join of a subscription to a concrete provider
/// endpoint and its rate caps. Two items may share a model name while
/// pointing at different upstreams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaItem {
    pub quota_id: i64,
    pub sub_id: i64,
    pub model_id: i64,
    pub model_name: String,
    pub percentage_weight: f64,
    pub base_url: String,
    pub upstream_api_key: String,
    pub provider_type: ProviderType,
    pub provider_id: i64,
    pub rpm: Option<i64>,
    pub tpm: Option<i64>,
    pub rpd: Option<i64>,
}

/// Account-pool limit dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Rpm,
    Rpd,
}

impl FromStr for LimitType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rpm" => Ok(Self::Rpm),
            "rpd" => Ok(Self::Rpd),
            other => Err(GatewayError::Database(format!("unknown limit_type '{other}'"))),
        }
    }
}

/// A rotating sub-key for a BYOK provider, as persisted. Hit counters
/// live in the in-memory pool, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: i64,
    pub provider_id: i64,
    pub email: String,
    pub api_key: String,
    pub limit_type: LimitType,
    pub limit_value: i64,
    pub is_active: bool,
}

/// One appended usage row. Written exactly once per request, with zero
/// token counts when the request failed before or during the upstream
/// exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub quota_item_id: Option<i64>,
    pub user_id: i64,
    pub requested_model: String,
    pub routed_model: String,
    pub upstream_provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub status_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// A zero-token row for a request that failed with `status_code`
    #[must_use]
    pub fn failure(
        user_id: i64,
        requested_model: impl Into<String>,
        status_code: i32,
    ) -> Self {
        Self {
            quota_item_id: None,
            user_id,
            requested_model: requested_model.into(),
            routed_model: String::new(),
            upstream_provider: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            status_code,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn principal(active: bool, expires_at: Option<DateTime<Utc>>) -> Principal {
        Principal {
            id: 1,
            username: "alice".to_string(),
            api_token: "hm_test".to_string(),
            subscription_id: 10,
            subscription_name: "pro".to_string(),
            active,
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn test_principal_validity() {
        let now = Utc::now();
        assert!(principal(true, None).is_valid(now));
        assert!(principal(true, Some(now + Duration::hours(1))).is_valid(now));
        assert!(!principal(true, Some(now - Duration::hours(1))).is_valid(now));
        assert!(!principal(false, None).is_valid(now));
    }

    #[test]
    fn test_provider_type_paths() {
        assert_eq!(
            ProviderType::OpenaiCompatible.chat_path(),
            "/v1/chat/completions"
        );
        assert_eq!(
            ProviderType::Groq.chat_path(),
            "/openai/v1/chat/completions"
        );
        assert_eq!(ProviderType::AnthropicCompatible.chat_path(), "/v1/messages");
        assert_eq!(ProviderType::Cliproxy.chat_path(), "/v1/chat/completions");
    }

    #[test]
    fn test_provider_type_round_trip() {
        for pt in [
            ProviderType::OpenaiCompatible,
            ProviderType::AnthropicCompatible,
            ProviderType::Groq,
            ProviderType::AntigravityProxy,
            ProviderType::Cliproxy,
        ] {
            assert_eq!(pt.as_str().parse::<ProviderType>().ok(), Some(pt));
        }
        assert!("gopher".parse::<ProviderType>().is_err());
    }
}
