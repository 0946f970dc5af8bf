//! Authentication middleware
//!
//! Extracts the opaque bearer token from `Authorization: Bearer <t>` or
//! `x-api-key`, validates it through the DAL, and attaches the resulting
//! principal to the request. Rejections render in the dialect of the
//! route being hit, so an Anthropic client never sees an OpenAI-shaped
//! error body.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use tracing::{debug, warn};

use hermes_core::dal::SharedDal;
use hermes_core::{mask_token, GatewayError, Principal};
use hermes_llm::Dialect;

/// Rejection carrying a dialect-shaped JSON error body
pub struct AuthRejection {
    status: StatusCode,
    body: serde_json::Value,
}

impl AuthRejection {
    fn new(dialect: Dialect, err: &GatewayError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: match dialect {
                Dialect::OpenAi => err.openai_body(),
                Dialect::Anthropic => err.anthropic_body(),
            },
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Axum extractor requiring a valid principal
///
/// Token sources, in order:
/// 1. `Authorization: Bearer <token>` (any other scheme is rejected)
/// 2. `x-api-key: <token>`
pub struct RequirePrincipal(pub Principal);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequirePrincipal
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let dialect = dialect_of(parts);

        let dal = parts.extensions.get::<SharedDal>().cloned().ok_or_else(|| {
            AuthRejection::new(
                dialect,
                &GatewayError::Internal("DAL not configured".to_string()),
            )
        })?;

        let token = extract_token(parts).map_err(|err| AuthRejection::new(dialect, &err))?;

        let principal = match dal.user_by_token(&token).await {
            Ok(found) => found,
            Err(err) => {
                warn!(token = %mask_token(&token), %err, "token lookup failed");
                return Err(AuthRejection::new(dialect, &err));
            }
        };

        match principal {
            Some(principal) if principal.is_valid(Utc::now()) => {
                debug!(
                    token = %mask_token(&token),
                    user = %principal.username,
                    subscription = %principal.subscription_name,
                    "authenticated"
                );
                Ok(RequirePrincipal(principal))
            }
            Some(principal) => {
                debug!(
                    token = %mask_token(&token),
                    user = %principal.username,
                    "token inactive or expired"
                );
                Err(AuthRejection::new(dialect, &GatewayError::InvalidToken))
            }
            None => {
                debug!(token = %mask_token(&token), "unknown token");
                Err(AuthRejection::new(dialect, &GatewayError::InvalidToken))
            }
        }
    }
}

/// The wire dialect of the route being requested
fn dialect_of(parts: &Parts) -> Dialect {
    if parts.uri.path().starts_with("/v1/messages") {
        Dialect::Anthropic
    } else {
        Dialect::OpenAi
    }
}

fn extract_token(parts: &Parts) -> std::result::Result<String, GatewayError> {
    if let Some(header) = parts.headers.get("authorization") {
        let value = header.to_str().map_err(|_| GatewayError::MalformedAuth)?;
        return match value.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(GatewayError::MalformedAuth),
        };
    }

    if let Some(header) = parts.headers.get("x-api-key") {
        if let Ok(value) = header.to_str() {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
    }

    Err(GatewayError::MissingCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/v1/chat/completions");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_bearer_token_extracted() {
        let parts = parts_for(&[("authorization", "Bearer hm_abc123")]);
        assert_eq!(extract_token(&parts).unwrap(), "hm_abc123");
    }

    #[test]
    fn test_malformed_scheme_rejected() {
        let parts = parts_for(&[("authorization", "Basic dXNlcg==")]);
        assert!(matches!(
            extract_token(&parts),
            Err(GatewayError::MalformedAuth)
        ));
    }

    #[test]
    fn test_api_key_fallback() {
        let parts = parts_for(&[("x-api-key", "hm_xyz")]);
        assert_eq!(extract_token(&parts).unwrap(), "hm_xyz");
    }

    #[test]
    fn test_missing_credentials() {
        let parts = parts_for(&[]);
        assert!(matches!(
            extract_token(&parts),
            Err(GatewayError::MissingCredentials)
        ));
    }

    #[test]
    fn test_dialect_from_path() {
        let mut parts = parts_for(&[]);
        assert_eq!(dialect_of(&parts), Dialect::OpenAi);

        let (messages_parts, ()) = Request::builder()
            .uri("/v1/messages")
            .body(())
            .unwrap()
            .into_parts();
        parts = messages_parts;
        assert_eq!(dialect_of(&parts), Dialect::Anthropic);
    }
}
