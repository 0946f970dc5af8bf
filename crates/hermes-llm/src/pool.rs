//! Per-provider account pools
//!
//! Some BYOK providers are fronted by a rotating set of sub-keys with
//! their own per-minute or per-day caps. A pool walks its accounts
//! round-robin, skipping any at their cap; when nothing is ready,
//! callers fall back to the static key from the quota item. The limit is a
//! counter, not exclusive ownership: any number of in-flight requests
//! may share an account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use hermes_core::dal::SharedDal;
use hermes_core::error::Result;
use hermes_core::types::{LimitType, ProviderAccount};

/// One pooled account plus its in-memory hit counters
#[derive(Debug, Clone)]
pub struct PooledAccount {
    pub id: i64,
    pub email: String,
    pub api_key: String,
    pub limit_type: LimitType,
    pub limit_value: i64,
    pub minute_hits: i64,
    pub day_hits: i64,
}

impl PooledAccount {
    fn at_capacity(&self) -> bool {
        match self.limit_type {
            LimitType::Rpm => self.limit_value > 0 && self.minute_hits >= self.limit_value,
            LimitType::Rpd => self.limit_value > 0 && self.day_hits >= self.limit_value,
        }
    }
}

struct PoolState {
    accounts: Vec<PooledAccount>,
    cursor: usize,
}

/// A rotating set of sub-keys for one provider
pub struct AccountPool {
    state: Arc<Mutex<PoolState>>,
    tickers: Vec<JoinHandle<()>>,
}

impl AccountPool {
    /// Build a pool from the provider's active accounts and start its
    /// reset tickers. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(accounts: Vec<ProviderAccount>) -> Self {
        let pooled = accounts
            .into_iter()
            .filter(|a| a.is_active)
            .map(|a| PooledAccount {
                id: a.id,
                email: a.email,
                api_key: a.api_key,
                limit_type: a.limit_type,
                limit_value: a.limit_value,
                minute_hits: 0,
                day_hits: 0,
            })
            .collect();

        let state = Arc::new(Mutex::new(PoolState {
            accounts: pooled,
            cursor: 0,
        }));

        let minute_state = Arc::clone(&state);
        let minute_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut state = minute_state.lock().await;
                for account in &mut state.accounts {
                    account.minute_hits = 0;
                }
            }
        });

        let day_state = Arc::clone(&state);
        let day_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut state = day_state.lock().await;
                for account in &mut state.accounts {
                    account.day_hits = 0;
                }
            }
        });

        Self {
            state,
            tickers: vec![minute_ticker, day_ticker],
        }
    }

    /// Next account with remaining capacity, starting from the
    /// round-robin cursor
    ///
    /// Increments both hit counters on a match and advances the cursor
    /// past it. Returns `None` after one full pass without a match.
    pub async fn ready_account(&self) -> Option<PooledAccount> {
        let mut state = self.state.lock().await;
        let len = state.accounts.len();
        if len == 0 {
            return None;
        }

        let start = state.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if state.accounts[idx].at_capacity() {
                continue;
            }
            state.accounts[idx].minute_hits += 1;
            state.accounts[idx].day_hits += 1;
            state.cursor = idx + 1;
            return Some(state.accounts[idx].clone());
        }

        None
    }

    /// Number of accounts in the pool
    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    /// True when the pool holds no accounts
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Drop for AccountPool {
    fn drop(&mut self) {
        for ticker in &self.tickers {
            ticker.abort();
        }
    }
}

/// Lazily-built map of provider id to account pool
///
/// Accounts are loaded from the DAL once, on a provider's first use,
/// and live for the life of the process.
pub struct PoolManager {
    dal: SharedDal,
    pools: Mutex<HashMap<i64, Arc<AccountPool>>>,
}

impl PoolManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(dal: SharedDal) -> Self {
        Self {
            dal,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for a provider, loading its accounts on first use
    pub async fn pool_for(&self, provider_id: i64) -> Result<Arc<AccountPool>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&provider_id) {
            return Ok(Arc::clone(pool));
        }

        let accounts = self.dal.provider_accounts(provider_id).await?;
        debug!(provider_id, count = accounts.len(), "loaded provider account pool");
        let pool = Arc::new(AccountPool::new(accounts));
        pools.insert(provider_id, Arc::clone(&pool));
        Ok(pool)
    }

    /// Convenience: a ready pooled key for the provider, if any
    pub async fn ready_key(&self, provider_id: i64) -> Result<Option<String>> {
        let pool = self.pool_for(provider_id).await?;
        Ok(pool.ready_account().await.map(|a| a.api_key))
    }
}
