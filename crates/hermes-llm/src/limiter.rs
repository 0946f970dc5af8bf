//! In-process rate limiting
//!
//! Two independent mechanisms share this module:
//!
//! - [`QuotaRpmLimiter`]: a fixed-minute RPM window per quota item,
//!   reset lazily when the minute epoch rolls over. The router consults
//!   this during selection.
//! - [`ModelLimiter`]: RPM/TPM/RPD counters per model, reset by
//!   background tickers owned by the aggregate.
//!
//! Fixed windows are intentional: up to 2x the nominal rate can burst
//! across a window boundary, which is accepted for the simplicity of a
//! single counter per key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Per-quota-item RPM
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MinuteBucket {
    epoch: u64,
    count: i64,
}

/// Fixed-minute-window RPM limiter keyed by quota item
#[derive(Default)]
pub struct QuotaRpmLimiter {
    buckets: Mutex<HashMap<i64, MinuteBucket>>,
}

impl QuotaRpmLimiter {
    /// Create an empty limiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `quota_id` under `limit` requests/minute
    ///
    /// A missing or non-positive limit means unlimited.
    pub async fn allow(&self, quota_id: i64, limit: Option<i64>) -> bool {
        self.allow_at(quota_id, limit, now_unix_seconds()).await
    }

    async fn allow_at(&self, quota_id: i64, limit: Option<i64>, now_secs: u64) -> bool {
        let limit = match limit {
            Some(l) if l > 0 => l,
            _ => return true,
        };

        let epoch = now_secs / 60;
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(quota_id)
            .or_insert(MinuteBucket { epoch, count: 0 });

        if bucket.epoch != epoch {
            bucket.epoch = epoch;
            bucket.count = 0;
        }

        if bucket.count < limit {
            bucket.count += 1;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Per-model RPM / TPM / RPD
// ============================================================================

#[derive(Debug, Default, Clone)]
struct ModelState {
    rpm: Option<i64>,
    tpm: Option<i64>,
    rpd: Option<i64>,
    minute_requests: i64,
    minute_tokens: i64,
    day_requests: i64,
}

/// RPM/TPM/RPD counters per model, with ticker-driven resets
pub struct ModelLimiter {
    state: Arc<Mutex<HashMap<i64, ModelState>>>,
    tickers: Vec<JoinHandle<()>>,
}

impl ModelLimiter {
    /// Create the limiter and start its reset tickers
    ///
    /// Must be called from within a tokio runtime; the tickers live as
    /// long as the aggregate and are aborted on drop.
    #[must_use]
    pub fn new() -> Self {
        let state: Arc<Mutex<HashMap<i64, ModelState>>> = Arc::new(Mutex::new(HashMap::new()));

        let minute_state = Arc::clone(&state);
        let minute_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut models = minute_state.lock().await;
                for model in models.values_mut() {
                    model.minute_requests = 0;
                    model.minute_tokens = 0;
                }
            }
        });

        let day_state = Arc::clone(&state);
        let day_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut models = day_state.lock().await;
                for model in models.values_mut() {
                    model.day_requests = 0;
                }
            }
        });

        Self {
            state,
            tickers: vec![minute_ticker, day_ticker],
        }
    }

    /// Install (or refresh) the caps for a model
    pub async fn set_limits(
        &self,
        model_id: i64,
        rpm: Option<i64>,
        tpm: Option<i64>,
        rpd: Option<i64>,
    ) {
        let mut models = self.state.lock().await;
        let state = models.entry(model_id).or_default();
        state.rpm = rpm;
        state.tpm = tpm;
        state.rpd = rpd;
    }

    /// Admit one request: checks RPM and RPD, incrementing both on success
    pub async fn allow_request(&self, model_id: i64) -> bool {
        let mut models = self.state.lock().await;
        let state = models.entry(model_id).or_default();

        if let Some(rpm) = state.rpm {
            if rpm > 0 && state.minute_requests >= rpm {
                debug!(model_id, rpm, "model RPM exhausted");
                return false;
            }
        }
        if let Some(rpd) = state.rpd {
            if rpd > 0 && state.day_requests >= rpd {
                debug!(model_id, rpd, "model RPD exhausted");
                return false;
            }
        }

        state.minute_requests += 1;
        state.day_requests += 1;
        true
    }

    /// Non-incrementing TPM check
    pub async fn check_tpm(&self, model_id: i64) -> bool {
        let models = self.state.lock().await;
        match models.get(&model_id) {
            Some(state) => match state.tpm {
                Some(tpm) if tpm > 0 => state.minute_tokens < tpm,
                _ => true,
            },
            None => true,
        }
    }

    /// Record observed token spend for a model
    pub async fn record_tokens(&self, model_id: i64, tokens: i64) {
        let mut models = self.state.lock().await;
        let state = models.entry(model_id).or_default();
        state.minute_tokens += tokens;
    }
}

impl Default for ModelLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModelLimiter {
    fn drop(&mut self) {
        for ticker in &self.tickers {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quota_rpm_within_bucket() {
        let limiter = QuotaRpmLimiter::new();
        let now = 1_700_000_000;

        for _ in 0..3 {
            assert!(limiter.allow_at(1, Some(3), now).await);
        }
        assert!(!limiter.allow_at(1, Some(3), now).await);
        assert!(!limiter.allow_at(1, Some(3), now + 59).await);
    }

    #[tokio::test]
    async fn test_quota_rpm_resets_on_new_minute() {
        let limiter = QuotaRpmLimiter::new();
        let now = 1_700_000_000;

        assert!(limiter.allow_at(1, Some(1), now).await);
        assert!(!limiter.allow_at(1, Some(1), now).await);
        assert!(limiter.allow_at(1, Some(1), now + 60).await);
    }

    #[tokio::test]
    async fn test_quota_rpm_unlimited() {
        let limiter = QuotaRpmLimiter::new();
        for _ in 0..100 {
            assert!(limiter.allow_at(1, None, 0).await);
            assert!(limiter.allow_at(1, Some(0), 0).await);
            assert!(limiter.allow_at(1, Some(-5), 0).await);
        }
    }

    #[tokio::test]
    async fn test_quota_rpm_separate_keys() {
        let limiter = QuotaRpmLimiter::new();
        let now = 1_700_000_000;

        assert!(limiter.allow_at(1, Some(1), now).await);
        assert!(!limiter.allow_at(1, Some(1), now).await);
        assert!(limiter.allow_at(2, Some(1), now).await);
    }

    #[tokio::test]
    async fn test_model_limiter_rpm() {
        let limiter = ModelLimiter::new();
        limiter.set_limits(7, Some(2), None, None).await;

        assert!(limiter.allow_request(7).await);
        assert!(limiter.allow_request(7).await);
        assert!(!limiter.allow_request(7).await);
    }

    #[tokio::test]
    async fn test_model_limiter_rpd() {
        let limiter = ModelLimiter::new();
        limiter.set_limits(7, None, None, Some(1)).await;

        assert!(limiter.allow_request(7).await);
        assert!(!limiter.allow_request(7).await);
    }

    #[tokio::test]
    async fn test_model_limiter_tpm() {
        let limiter = ModelLimiter::new();
        limiter.set_limits(7, None, Some(100), None).await;

        assert!(limiter.check_tpm(7).await);
        limiter.record_tokens(7, 100).await;
        assert!(!limiter.check_tpm(7).await);
    }

    #[tokio::test]
    async fn test_model_limiter_unknown_model_allows() {
        let limiter = ModelLimiter::new();
        assert!(limiter.allow_request(99).await);
        assert!(limiter.check_tpm(99).await);
    }
}
