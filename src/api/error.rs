//! Dialect-aware error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use hermes_core::GatewayError;
use hermes_llm::Dialect;

/// Render a gateway error as JSON in the client's dialect
pub fn error_response(dialect: Dialect, err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match dialect {
        Dialect::OpenAi => err.openai_body(),
        Dialect::Anthropic => err.anthropic_body(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_error() {
        let resp = error_response(Dialect::OpenAi, &GatewayError::AllLimitsExceeded);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = error_response(Dialect::Anthropic, &GatewayError::MissingCredentials);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
