//! Hermes LLM - dialect translation and routing
//!
//! The request-path machinery of the Hermes gateway:
//! - Protocol: typed OpenAI and Anthropic wire shapes with extension
//!   pass-through
//! - Translate: request/response/stream conversion between the dialects
//! - Router: subscription-weighted selection with rate-limit failover
//! - Limiter: per-quota-item RPM and per-model RPM/TPM/RPD counters
//! - Pool: rotating per-provider account pools
//! - Upstream: pooled HTTP clients per provider family

#![forbid(unsafe_code)]

pub mod limiter;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod tokens;
pub mod translate;
pub mod upstream;

pub use limiter::{ModelLimiter, QuotaRpmLimiter};
pub use pool::{AccountPool, PoolManager, PooledAccount};
pub use protocol::Dialect;
pub use router::{EntropyRoller, Roller, Router, RoutingDecision, ScriptedRoller};
pub use translate::{RelayEvent, StreamRelay};
pub use upstream::UpstreamClient;
