//! Hermes - multi-tenant LLM API gateway
//!
//! Binary entry point: load the environment, wire up logging, start the
//! server.

#![forbid(unsafe_code)]

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hermes_core::GatewayConfig;

mod api;
mod middleware;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hermes=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    let config = GatewayConfig::from_env()?;
    info!(
        port = config.port,
        "starting hermes gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    server::run(config).await
}
