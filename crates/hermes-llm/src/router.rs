//! Subscription-weighted routing with rate-limit failover
//!
//! Selection draws a uniform roll over the working set's total weight,
//! walks items in DAL order, and picks the first whose cumulative
//! weight strictly exceeds the roll. An item whose per-quota-item RPM
//! limiter refuses the request is removed from the working set and the
//! draw repeats; an exhausted set surfaces as `AllLimitsExceeded`.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hermes_core::dal::SharedDal;
use hermes_core::error::{GatewayError, Result};
use hermes_core::types::{ProviderType, QuotaItem};

use crate::limiter::QuotaRpmLimiter;

/// The outcome of routing one request
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: String,
    pub model_id: i64,
    pub base_url: String,
    pub api_key: String,
    pub provider_type: ProviderType,
    pub quota_item_id: i64,
    pub provider_id: i64,
    pub tpm: Option<i64>,
    pub rpm: Option<i64>,
    pub rpd: Option<i64>,
}

impl RoutingDecision {
    fn from_item(item: &QuotaItem) -> Self {
        Self {
            model: item.model_name.clone(),
            model_id: item.model_id,
            base_url: item.base_url.clone(),
            api_key: item.upstream_api_key.clone(),
            provider_type: item.provider_type,
            quota_item_id: item.quota_id,
            provider_id: item.provider_id,
            tpm: item.tpm,
            rpm: item.rpm,
            rpd: item.rpd,
        }
    }
}

/// Source of uniform rolls in `[0, total)`
///
/// Production uses a per-process non-cryptographic RNG; tests script the
/// exact sequence of rolls.
pub trait Roller: Send {
    /// Draw a roll in `[0, total)`
    fn roll(&mut self, total: f64) -> f64;
}

/// Entropy-seeded `SmallRng` roller
pub struct EntropyRoller(SmallRng);

impl EntropyRoller {
    /// Seed from OS entropy
    #[must_use]
    pub fn new() -> Self {
        Self(SmallRng::from_entropy())
    }
}

impl Default for EntropyRoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Roller for EntropyRoller {
    fn roll(&mut self, total: f64) -> f64 {
        self.0.gen_range(0.0..total)
    }
}

/// Roller replaying a fixed sequence, for deterministic tests
pub struct ScriptedRoller {
    rolls: std::collections::VecDeque<f64>,
}

impl ScriptedRoller {
    /// Replay `rolls` in order; panics in tests if the script runs dry
    #[must_use]
    pub fn new(rolls: impl IntoIterator<Item = f64>) -> Self {
        Self {
            rolls: rolls.into_iter().collect(),
        }
    }
}

impl Roller for ScriptedRoller {
    fn roll(&mut self, total: f64) -> f64 {
        match self.rolls.pop_front() {
            Some(roll) => roll.min(total),
            None => 0.0,
        }
    }
}

/// Weighted router over a subscription's quota items
pub struct Router {
    dal: SharedDal,
    limiter: Arc<QuotaRpmLimiter>,
    roller: Mutex<Box<dyn Roller>>,
}

impl Router {
    /// Production router with an entropy-seeded roll source
    #[must_use]
    pub fn new(dal: SharedDal, limiter: Arc<QuotaRpmLimiter>) -> Self {
        Self::with_roller(dal, limiter, Box::new(EntropyRoller::new()))
    }

    /// Router with an explicit roll source
    #[must_use]
    pub fn with_roller(
        dal: SharedDal,
        limiter: Arc<QuotaRpmLimiter>,
        roller: Box<dyn Roller>,
    ) -> Self {
        Self {
            dal,
            limiter,
            roller: Mutex::new(roller),
        }
    }

    /// Pick an upstream target for one request
    ///
    /// `requested_model` participates only in log lines; the quota items
    /// decide what actually runs.
    pub async fn route(&self, sub_id: i64, requested_model: &str) -> Result<RoutingDecision> {
        let mut working = self.dal.quota_items(sub_id).await?;
        if working.is_empty() {
            warn!(sub_id, requested_model, "subscription has no quota items");
            return Err(GatewayError::NoQuotaConfigured(sub_id));
        }

        while !working.is_empty() {
            let total: f64 = working.iter().map(|i| i.percentage_weight.max(0.0)).sum();

            if total <= 0.0 {
                // Degenerate weights: first admissible item in DAL order.
                for item in &working {
                    if self.limiter.allow(item.quota_id, item.rpm).await {
                        return Ok(self.decide(item, requested_model));
                    }
                }
                return Err(GatewayError::AllLimitsExceeded);
            }

            let roll = self.roller.lock().await.roll(total);
            let picked = pick_index(&working, roll);

            let item = &working[picked];
            if self.limiter.allow(item.quota_id, item.rpm).await {
                return Ok(self.decide(item, requested_model));
            }

            debug!(
                quota_id = item.quota_id,
                model = %item.model_name,
                "quota item at RPM cap, removed from working set"
            );
            working.remove(picked);
        }

        Err(GatewayError::AllLimitsExceeded)
    }

    fn decide(&self, item: &QuotaItem, requested_model: &str) -> RoutingDecision {
        debug!(
            sub_id = item.sub_id,
            quota_id = item.quota_id,
            requested_model,
            routed_model = %item.model_name,
            provider = %item.provider_type,
            "routed request"
        );
        RoutingDecision::from_item(item)
    }
}

/// First index whose cumulative weight strictly exceeds the roll
fn pick_index(items: &[QuotaItem], roll: f64) -> usize {
    let mut cumulative = 0.0;
    for (idx, item) in items.iter().enumerate() {
        cumulative += item.percentage_weight.max(0.0);
        if cumulative > roll {
            return idx;
        }
    }
    items.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_core::MemoryDal;

    fn item(quota_id: i64, model: &str, weight: f64, rpm: Option<i64>) -> QuotaItem {
        QuotaItem {
            quota_id,
            sub_id: 10,
            model_id: quota_id,
            model_name: model.to_string(),
            percentage_weight: weight,
            base_url: "https://upstream.example".to_string(),
            upstream_api_key: format!("key-{quota_id}"),
            provider_type: ProviderType::OpenaiCompatible,
            provider_id: 1,
            rpm,
            tpm: None,
            rpd: None,
        }
    }

    async fn router_with(
        items: Vec<QuotaItem>,
        rolls: Vec<f64>,
    ) -> (Router, Arc<MemoryDal>) {
        let dal = Arc::new(MemoryDal::new());
        dal.add_quota_items(10, items).await;
        let limiter = Arc::new(QuotaRpmLimiter::new());
        let router = Router::with_roller(
            dal.clone(),
            limiter,
            Box::new(ScriptedRoller::new(rolls)),
        );
        (router, dal)
    }

    #[tokio::test]
    async fn test_weighted_selection_follows_rolls() {
        // A(20) then B(80); rolls 5, 25, 75, 19 pick A, B, B, A.
        let (router, _dal) = router_with(
            vec![item(1, "model-a", 20.0, None), item(2, "model-b", 80.0, None)],
            vec![5.0, 25.0, 75.0, 19.0],
        )
        .await;

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(router.route(10, "any").await.unwrap().model);
        }
        assert_eq!(picks, vec!["model-a", "model-b", "model-b", "model-a"]);
    }

    #[tokio::test]
    async fn test_rpm_failover_removes_item() {
        // A admits one request per minute; the second draw lands on A
        // again, which is now denied and removed, falling over to B.
        let (router, _dal) = router_with(
            vec![
                item(1, "model-a", 50.0, Some(1)),
                item(2, "model-b", 50.0, Some(1000)),
            ],
            vec![10.0, 10.0, 60.0],
        )
        .await;

        assert_eq!(router.route(10, "any").await.unwrap().model, "model-a");
        // Roll 10 picks A again; A is at cap, so the retry roll (60 over
        // a 50-weight set) picks B.
        assert_eq!(router.route(10, "any").await.unwrap().model, "model-b");
    }

    #[tokio::test]
    async fn test_empty_subscription_errors() {
        let (router, _dal) = router_with(Vec::new(), Vec::new()).await;
        let err = router.route(10, "gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoQuotaConfigured(10)));
    }

    #[tokio::test]
    async fn test_all_items_at_cap_errors() {
        let (router, _dal) = router_with(
            vec![
                item(1, "model-a", 50.0, Some(1)),
                item(2, "model-b", 50.0, Some(1)),
            ],
            vec![0.0, 60.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await;

        router.route(10, "any").await.unwrap();
        router.route(10, "any").await.unwrap();
        let err = router.route(10, "any").await.unwrap_err();
        assert!(matches!(err, GatewayError::AllLimitsExceeded));
    }

    #[tokio::test]
    async fn test_zero_total_weight_falls_back_to_order() {
        let (router, _dal) = router_with(
            vec![
                item(1, "model-a", 0.0, Some(1)),
                item(2, "model-b", 0.0, None),
            ],
            Vec::new(),
        )
        .await;

        assert_eq!(router.route(10, "any").await.unwrap().model, "model-a");
        // A is now at cap; in-order scan falls through to B.
        assert_eq!(router.route(10, "any").await.unwrap().model, "model-b");
    }

    #[tokio::test]
    async fn test_decision_carries_item_fields() {
        let (router, _dal) = router_with(vec![item(7, "model-a", 100.0, None)], vec![1.0]).await;
        let decision = router.route(10, "requested").await.unwrap();
        assert_eq!(decision.quota_item_id, 7);
        assert_eq!(decision.provider_id, 1);
        assert_eq!(decision.api_key, "key-7");
        assert_eq!(decision.provider_type, ProviderType::OpenaiCompatible);
    }

    #[tokio::test]
    async fn test_selection_distribution_converges() {
        // With a real RNG, an 80/20 split should land near 80/20 over
        // many trials.
        let dal = Arc::new(MemoryDal::new());
        dal.add_quota_items(
            10,
            vec![item(1, "model-a", 20.0, None), item(2, "model-b", 80.0, None)],
        )
        .await;
        let router = Router::new(dal, Arc::new(QuotaRpmLimiter::new()));

        let mut a_count = 0;
        const TRIALS: usize = 2000;
        for _ in 0..TRIALS {
            if router.route(10, "any").await.unwrap().model == "model-a" {
                a_count += 1;
            }
        }
        let share = a_count as f64 / TRIALS as f64;
        assert!((0.14..=0.26).contains(&share), "a share was {share}");
    }
}
