//! Upstream provider clients
//!
//! Thin by design: build the URL, set the provider family's auth
//! headers, POST, hand the response back untouched. Transports are
//! pooled and shared; streaming calls get no response-read timeout.

use std::time::Duration;

use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use hermes_core::error::{GatewayError, Result};
use hermes_core::types::ProviderType;

use crate::protocol::anthropic::API_VERSION;

/// Idle connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Idle connection lifetime
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default non-streaming timeout for OpenAI-family providers
pub const OPENAI_TIMEOUT: Duration = Duration::from_secs(300);

/// Default non-streaming timeout for Anthropic-family providers
pub const ANTHROPIC_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared upstream HTTP clients, one transport per timeout profile
pub struct UpstreamClient {
    /// No overall timeout; used for streaming responses
    streaming: Client,
    /// Bounded by the OpenAI-family non-streaming timeout
    openai: Client,
    /// Bounded by the Anthropic-family non-streaming timeout
    anthropic: Client,
}

impl UpstreamClient {
    /// Build the pooled transports
    pub fn new() -> Result<Self> {
        Ok(Self {
            streaming: build_client(None)?,
            openai: build_client(Some(OPENAI_TIMEOUT))?,
            anthropic: build_client(Some(ANTHROPIC_TIMEOUT))?,
        })
    }

    /// POST a chat request to a provider, returning the raw response
    pub async fn post_chat(
        &self,
        provider_type: ProviderType,
        base_url: &str,
        api_key: &str,
        body: &Value,
        streaming: bool,
    ) -> Result<Response> {
        let url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            provider_type.chat_path()
        );
        debug!(%url, provider = %provider_type, streaming, "sending upstream request");

        let client = if streaming {
            &self.streaming
        } else if provider_type.is_anthropic() {
            &self.anthropic
        } else {
            &self.openai
        };

        let mut request = client
            .post(&url)
            .header("Content-Type", "application/json");

        request = if provider_type.is_anthropic() {
            request
                .header("x-api-key", api_key)
                .header("anthropic-version", API_VERSION)
        } else {
            request.header("Authorization", format!("Bearer {api_key}"))
        };

        request
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))
    }
}

fn build_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}
