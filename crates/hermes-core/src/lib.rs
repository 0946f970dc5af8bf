//! Hermes Core - domain model and persistence access
//!
//! This crate holds everything the gateway shares below the HTTP layer:
//! - Config: environment-driven gateway configuration
//! - Types: principals, quota items, provider accounts, usage rows
//! - Dal: the persistence trait plus Postgres and in-memory backends
//! - Usage: exactly-once usage accounting with an optional remote sink
//! - Errors: the gateway error taxonomy and its HTTP/dialect mapping

#![forbid(unsafe_code)]

pub mod config;
pub mod dal;
pub mod error;
pub mod types;
pub mod usage;
pub mod util;

pub use config::GatewayConfig;
pub use dal::{Dal, MemoryDal, PgDal, SharedDal};
pub use error::{GatewayError, Result};
pub use types::{
    LimitType, Principal, ProviderAccount, ProviderType, QuotaItem, UsageRecord,
};
pub use usage::UsageWriter;
pub use util::mask_token;
