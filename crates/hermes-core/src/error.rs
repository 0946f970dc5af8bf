//! Error types for the Hermes gateway

use serde_json::{json, Value};
use thiserror::Error;

/// Gateway error type
///
/// Every variant maps to a fixed HTTP status and renders as valid JSON in
/// whichever wire dialect the client spoke on ingress.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No token was supplied on the request
    #[error("authentication required: provide Authorization: Bearer <token> or x-api-key")]
    MissingCredentials,

    /// Authorization header present but not a Bearer scheme
    #[error("malformed authorization header")]
    MalformedAuth,

    /// Token unknown, inactive, or expired
    #[error("invalid or expired token")]
    InvalidToken,

    /// Subscription has no quota items configured
    #[error("no quota configured for subscription {0}")]
    NoQuotaConfigured(i64),

    /// Every routing candidate was rejected by its rate limit
    #[error("all rate limits exceeded, retry later")]
    AllLimitsExceeded,

    /// Unparseable request body or missing required fields
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Network-level failure contacting the upstream provider
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Protocol conversion failed
    #[error("translation failed: {0}")]
    Translation(String),

    /// Configuration error (startup only)
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCredentials | Self::MalformedAuth => 401,
            Self::InvalidToken => 403,
            Self::BadRequest(_) => 400,
            Self::AllLimitsExceeded => 429,
            Self::UpstreamUnreachable(_) => 502,
            Self::NoQuotaConfigured(_)
            | Self::Translation(_)
            | Self::Config(_)
            | Self::Database(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Anthropic error type tag for this error
    #[must_use]
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            Self::MissingCredentials | Self::MalformedAuth => "authentication_error",
            Self::InvalidToken => "permission_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::AllLimitsExceeded => "rate_limit_error",
            Self::UpstreamUnreachable(_) => "overloaded_error",
            _ => "api_error",
        }
    }

    /// Error body in the OpenAI dialect
    #[must_use]
    pub fn openai_body(&self) -> Value {
        json!({ "error": self.to_string() })
    }

    /// Error body in the Anthropic dialect
    #[must_use]
    pub fn anthropic_body(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.anthropic_type(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::MissingCredentials.status_code(), 401);
        assert_eq!(GatewayError::MalformedAuth.status_code(), 401);
        assert_eq!(GatewayError::InvalidToken.status_code(), 403);
        assert_eq!(GatewayError::NoQuotaConfigured(1).status_code(), 500);
        assert_eq!(GatewayError::AllLimitsExceeded.status_code(), 429);
        assert_eq!(GatewayError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(GatewayError::UpstreamUnreachable("x".into()).status_code(), 502);
        assert_eq!(GatewayError::Translation("x".into()).status_code(), 500);
    }

    #[test]
    fn test_openai_body_shape() {
        let body = GatewayError::AllLimitsExceeded.openai_body();
        assert!(body["error"].is_string());
    }

    #[test]
    fn test_anthropic_body_shape() {
        let body = GatewayError::AllLimitsExceeded.anthropic_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body["error"]["message"].is_string());
    }
}
