//! Health check endpoint

use axum::response::Json;
use serde::Serialize;

/// Health response body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// `GET /health`: unauthenticated liveness probe
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "hermes",
        version: env!("CARGO_PKG_VERSION"),
    })
}
