//! Server wiring
//!
//! Builds the shared application state, assembles the axum router, and
//! serves it.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use hermes_core::dal::SharedDal;
use hermes_core::{GatewayConfig, PgDal, UsageWriter};
use hermes_llm::{ModelLimiter, PoolManager, QuotaRpmLimiter, UpstreamClient};

use crate::api;

/// Shared state behind every handler
pub struct AppState {
    pub config: GatewayConfig,
    pub dal: SharedDal,
    pub router: hermes_llm::Router,
    pub model_limiter: ModelLimiter,
    pub pools: PoolManager,
    pub upstream: UpstreamClient,
    pub usage: UsageWriter,
}

impl AppState {
    /// Assemble state over an arbitrary DAL (tests pass `MemoryDal`)
    pub fn new(config: GatewayConfig, dal: SharedDal) -> Result<Self> {
        let limiter = Arc::new(QuotaRpmLimiter::new());
        let router = hermes_llm::Router::new(dal.clone(), limiter);

        let mut usage = UsageWriter::new(dal.clone());
        if let Some(sink) = &config.usage_sink_url {
            usage = usage.with_sink(sink.clone());
        }

        Ok(Self {
            router,
            model_limiter: ModelLimiter::new(),
            pools: PoolManager::new(dal.clone()),
            upstream: UpstreamClient::new()?,
            usage,
            dal,
            config,
        })
    }
}

/// Build the gateway router over prepared state
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_body_bytes;
    let dal = state.dal.clone();

    Router::new()
        .route("/health", get(api::health::health))
        .route("/admin/create-key", post(api::admin::create_key))
        .route("/v1/chat/completions", post(api::chat::chat_completions))
        .route("/v1/messages", post(api::messages::messages))
        .layer(Extension(dal))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Connect to persistence and serve until shutdown
pub async fn run(config: GatewayConfig) -> Result<()> {
    let dal: SharedDal = Arc::new(PgDal::connect(&config.database_url).await?);
    let addr = format!("0.0.0.0:{}", config.port);
    let state = Arc::new(AppState::new(config, dal)?);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
