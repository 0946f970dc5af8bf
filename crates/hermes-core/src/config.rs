//! Gateway configuration
//!
//! All options come from the environment; `.env` is loaded by the binary
//! before this runs.

use crate::error::{GatewayError, Result};

/// Default listen port
pub const DEFAULT_PORT: u16 = 8081;

/// Default cap on a buffered ingress request body
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen port
    pub port: u16,
    /// DAL connection string
    pub database_url: String,
    /// Shared secret gating the admin endpoint
    pub admin_secret: String,
    /// Dashboard base URL (device-auth verification redirect; unused by the core)
    pub dashboard_url: Option<String>,
    /// Cap on a buffered ingress request body
    pub max_body_bytes: usize,
    /// Optional system prefix injected into non-agentic requests
    pub system_prefix: Option<String>,
    /// Optional remote usage sink; when set, usage rows are committed
    /// asynchronously with an idempotency key
    pub usage_sink_url: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| GatewayError::Config(format!("invalid PORT '{raw}'")))?,
            None => DEFAULT_PORT,
        };

        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Config("DATABASE_URL not set".to_string()))?;

        let admin_secret = lookup("ADMIN_SECRET")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Config("ADMIN_SECRET not set".to_string()))?;

        let max_body_bytes = match lookup("HERMES_MAX_BODY_BYTES") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                GatewayError::Config(format!("invalid HERMES_MAX_BODY_BYTES '{raw}'"))
            })?,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(Self {
            port,
            database_url,
            admin_secret,
            dashboard_url: lookup("DASHBOARD_URL").filter(|v| !v.is_empty()),
            max_body_bytes,
            system_prefix: lookup("HERMES_SYSTEM_PREFIX").filter(|v| !v.is_empty()),
            usage_sink_url: lookup("HERMES_USAGE_SINK_URL").filter(|v| !v.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_string())
    }

    #[test]
    fn test_minimal_config() {
        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hermes"),
            ("ADMIN_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert!(cfg.system_prefix.is_none());
        assert!(cfg.usage_sink_url.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let err = GatewayConfig::from_lookup(lookup(&[("ADMIN_SECRET", "s")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_missing_admin_secret() {
        let err =
            GatewayConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(err.to_string().contains("ADMIN_SECRET"));
    }

    #[test]
    fn test_port_and_overrides() {
        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("PORT", "9090"),
            ("DATABASE_URL", "postgres://x"),
            ("ADMIN_SECRET", "s"),
            ("HERMES_MAX_BODY_BYTES", "1024"),
            ("HERMES_SYSTEM_PREFIX", "You are routed through Hermes."),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.max_body_bytes, 1024);
        assert_eq!(
            cfg.system_prefix.as_deref(),
            Some("You are routed through Hermes.")
        );
    }

    #[test]
    fn test_invalid_port() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("PORT", "nine"),
            ("DATABASE_URL", "postgres://x"),
            ("ADMIN_SECRET", "s"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
