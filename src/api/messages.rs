//! Anthropic-dialect chat route

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;

use hermes_llm::Dialect;

use crate::middleware::auth::RequirePrincipal;
use crate::server::AppState;

use super::proxy;

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    RequirePrincipal(principal): RequirePrincipal,
    body: Bytes,
) -> Response {
    proxy::handle_chat(state, principal, Dialect::Anthropic, body).await
}
