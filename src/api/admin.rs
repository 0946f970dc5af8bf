//! Admin key management
//!
//! One endpoint, gated by the shared admin secret. Token creation is a
//! DAL concern; this handler only shapes the HTTP exchange.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use hermes_core::mask_token;

use crate::server::AppState;

/// `POST /admin/create-key` request body
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub username: String,
    pub sub_id: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// `POST /admin/create-key` response body
#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    pub api_token: String,
    pub username: String,
    pub sub_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Create a new API token for a subscription
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    let supplied = headers
        .get("x-admin-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied != state.config.admin_secret {
        warn!("create-key rejected: bad admin secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid admin secret"})),
        )
            .into_response();
    }

    match state
        .dal
        .create_user(&req.username, req.sub_id, req.expires_at)
        .await
    {
        Ok(principal) => {
            info!(
                username = %principal.username,
                sub_id = principal.subscription_id,
                token = %mask_token(&principal.api_token),
                "created api token"
            );
            Json(CreateKeyResponse {
                api_token: principal.api_token,
                username: principal.username,
                sub_id: principal.subscription_id,
                expires_at: principal.expires_at,
            })
            .into_response()
        }
        Err(err) => {
            warn!(%err, "create-key failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}
