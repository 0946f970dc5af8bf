//! Data-access layer
//!
//! The gateway core only ever touches persistence through the [`Dal`]
//! trait: token lookup, quota-item reads, provider-account reads, and
//! append-only usage writes. `PgDal` is the production implementation
//! over Postgres; `MemoryDal` backs tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::types::{LimitType, Principal, ProviderAccount, ProviderType, QuotaItem, UsageRecord};

/// Read/append operations the gateway core needs from persistence
#[async_trait]
pub trait Dal: Send + Sync {
    /// Look up a user by its opaque API token, joined to its subscription
    async fn user_by_token(&self, token: &str) -> Result<Option<Principal>>;

    /// All quota items for a subscription, in `quota_id` order
    async fn quota_items(&self, sub_id: i64) -> Result<Vec<QuotaItem>>;

    /// Active pool accounts for a provider
    async fn provider_accounts(&self, provider_id: i64) -> Result<Vec<ProviderAccount>>;

    /// Append one usage row
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Create a new user with a fresh token (admin endpoint)
    async fn create_user(
        &self,
        username: &str,
        sub_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Principal>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    api_token: String,
    sub_id: i64,
    sub_name: String,
    active: bool,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_principal(self) -> Principal {
        Principal {
            id: self.id,
            username: self.username,
            api_token: self.api_token,
            subscription_id: self.sub_id,
            subscription_name: self.sub_name,
            active: self.active,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(FromRow)]
struct QuotaItemRow {
    quota_id: i64,
    sub_id: i64,
    model_id: i64,
    model_name: String,
    percentage_weight: f64,
    base_url: String,
    api_key: String,
    provider_type: String,
    provider_id: i64,
    rpm: Option<i64>,
    tpm: Option<i64>,
    rpd: Option<i64>,
}

impl QuotaItemRow {
    fn into_item(self) -> Result<QuotaItem> {
        Ok(QuotaItem {
            quota_id: self.quota_id,
            sub_id: self.sub_id,
            model_id: self.model_id,
            model_name: self.model_name,
            percentage_weight: self.percentage_weight.max(0.0),
            base_url: self.base_url,
            upstream_api_key: self.api_key,
            provider_type: ProviderType::from_str(&self.provider_type)?,
            provider_id: self.provider_id,
            rpm: self.rpm,
            tpm: self.tpm,
            rpd: self.rpd,
        })
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    provider_id: i64,
    email: String,
    api_key: String,
    limit_type: String,
    limit_value: i64,
    is_active: bool,
}

impl AccountRow {
    fn into_account(self) -> Result<ProviderAccount> {
        Ok(ProviderAccount {
            id: self.id,
            provider_id: self.provider_id,
            email: self.email,
            api_key: self.api_key,
            limit_type: LimitType::from_str(&self.limit_type)?,
            limit_value: self.limit_value,
            is_active: self.is_active,
        })
    }
}

/// Postgres-backed DAL
pub struct PgDal {
    pool: PgPool,
}

impl PgDal {
    /// Connect to the database named by `DATABASE_URL`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        debug!("connected to database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Dal for PgDal {
    async fn user_by_token(&self, token: &str) -> Result<Option<Principal>> {
        let row: Option<UserRow> = sqlx::query_as(
            r"SELECT u.id, u.username, u.api_token, u.sub_id,
                     s.name AS sub_name, u.active, u.created_at, u.expires_at
              FROM users u
              JOIN subscriptions s ON s.sub_id = u.sub_id
              WHERE u.api_token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRow::into_principal))
    }

    async fn quota_items(&self, sub_id: i64) -> Result<Vec<QuotaItem>> {
        let rows: Vec<QuotaItemRow> = sqlx::query_as(
            r"SELECT q.quota_id, q.sub_id, m.id AS model_id, m.model_name,
                     q.percentage_weight, p.base_url, p.api_key, p.provider_type,
                     p.id AS provider_id, m.rpm, m.tpm, m.rpd
              FROM quota_items q
              JOIN llm_models m ON m.id = q.llm_model_id
              JOIN providers p ON p.id = m.provider_id
              WHERE q.sub_id = $1
              ORDER BY q.quota_id",
        )
        .bind(sub_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QuotaItemRow::into_item).collect()
    }

    async fn provider_accounts(&self, provider_id: i64) -> Result<Vec<ProviderAccount>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            r"SELECT id, provider_id, email, api_key, limit_type, limit_value, is_active
              FROM provider_accounts
              WHERE provider_id = $1 AND is_active
              ORDER BY id",
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r"INSERT INTO usage_logs
                (quota_item_id, user_id, requested_model, routed_model,
                 upstream_provider, input_tokens, output_tokens, status_code, timestamp)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(record.quota_item_id)
        .bind(record.user_id)
        .bind(&record.requested_model)
        .bind(&record.routed_model)
        .bind(&record.upstream_provider)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.status_code)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_user(
        &self,
        username: &str,
        sub_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Principal> {
        let token = format!("hm_{}", uuid::Uuid::new_v4().simple());

        let row: UserRow = sqlx::query_as(
            r"WITH inserted AS (
                  INSERT INTO users (username, api_token, sub_id, active, created_at, expires_at)
                  VALUES ($1, $2, $3, TRUE, NOW(), $4)
                  RETURNING id, username, api_token, sub_id, active, created_at, expires_at
              )
              SELECT i.id, i.username, i.api_token, i.sub_id,
                     s.name AS sub_name, i.active, i.created_at, i.expires_at
              FROM inserted i
              JOIN subscriptions s ON s.sub_id = i.sub_id",
        )
        .bind(username)
        .bind(&token)
        .bind(sub_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_principal())
    }
}

// ============================================================================
// In-memory implementation (tests, local development)
// ============================================================================

/// In-memory DAL backing tests and local development
///
/// Usage rows are collected rather than discarded so tests can assert
/// exactly-once accounting.
#[derive(Default)]
pub struct MemoryDal {
    users: Mutex<Vec<Principal>>,
    items: Mutex<HashMap<i64, Vec<QuotaItem>>>,
    accounts: Mutex<HashMap<i64, Vec<ProviderAccount>>>,
    usage: Mutex<Vec<UsageRecord>>,
    subscription_names: Mutex<HashMap<i64, String>>,
}

impl MemoryDal {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user
    pub async fn add_user(&self, principal: Principal) {
        self.subscription_names
            .lock()
            .await
            .insert(principal.subscription_id, principal.subscription_name.clone());
        self.users.lock().await.push(principal);
    }

    /// Seed quota items for a subscription
    pub async fn add_quota_items(&self, sub_id: i64, items: Vec<QuotaItem>) {
        self.items.lock().await.insert(sub_id, items);
    }

    /// Seed pool accounts for a provider
    pub async fn add_provider_accounts(&self, provider_id: i64, accounts: Vec<ProviderAccount>) {
        self.accounts.lock().await.insert(provider_id, accounts);
    }

    /// All usage rows recorded so far
    pub async fn usage(&self) -> Vec<UsageRecord> {
        self.usage.lock().await.clone()
    }
}

#[async_trait]
impl Dal for MemoryDal {
    async fn user_by_token(&self, token: &str) -> Result<Option<Principal>> {
        Ok(self
            .users
            .lock()
            .await
            .iter()
            .find(|u| u.api_token == token)
            .cloned())
    }

    async fn quota_items(&self, sub_id: i64) -> Result<Vec<QuotaItem>> {
        Ok(self
            .items
            .lock()
            .await
            .get(&sub_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn provider_accounts(&self, provider_id: i64) -> Result<Vec<ProviderAccount>> {
        Ok(self
            .accounts
            .lock()
            .await
            .get(&provider_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| a.is_active)
            .collect())
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage.lock().await.push(record.clone());
        Ok(())
    }

    async fn create_user(
        &self,
        username: &str,
        sub_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Principal> {
        let sub_name = self
            .subscription_names
            .lock()
            .await
            .get(&sub_id)
            .cloned()
            .unwrap_or_default();
        let mut users = self.users.lock().await;
        let principal = Principal {
            id: users.len() as i64 + 1,
            username: username.to_string(),
            api_token: format!("hm_{}", uuid::Uuid::new_v4().simple()),
            subscription_id: sub_id,
            subscription_name: sub_name,
            active: true,
            created_at: Utc::now(),
            expires_at,
        };
        users.push(principal.clone());
        Ok(principal)
    }
}

/// Shared handle type used throughout the gateway
pub type SharedDal = Arc<dyn Dal>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderType;

    fn item(quota_id: i64, sub_id: i64) -> QuotaItem {
        QuotaItem {
            quota_id,
            sub_id,
            model_id: 1,
            model_name: "claude-sonnet-4".to_string(),
            percentage_weight: 100.0,
            base_url: "https://api.anthropic.com".to_string(),
            upstream_api_key: "sk-ant-test".to_string(),
            provider_type: ProviderType::AnthropicCompatible,
            provider_id: 7,
            rpm: Some(10),
            tpm: None,
            rpd: None,
        }
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let dal = MemoryDal::new();
        dal.add_user(Principal {
            id: 1,
            username: "alice".to_string(),
            api_token: "hm_alice".to_string(),
            subscription_id: 10,
            subscription_name: "pro".to_string(),
            active: true,
            created_at: Utc::now(),
            expires_at: None,
        })
        .await;

        let found = dal.user_by_token("hm_alice").await.unwrap();
        assert_eq!(found.map(|p| p.username), Some("alice".to_string()));
        assert!(dal.user_by_token("hm_bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_items_empty_for_unknown_sub() {
        let dal = MemoryDal::new();
        dal.add_quota_items(10, vec![item(1, 10)]).await;
        assert_eq!(dal.quota_items(10).await.unwrap().len(), 1);
        assert!(dal.quota_items(11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_append() {
        let dal = MemoryDal::new();
        dal.insert_usage(&UsageRecord::failure(1, "gpt-4o", 429))
            .await
            .unwrap();
        let rows = dal.usage().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status_code, 429);
        assert_eq!(rows[0].input_tokens, 0);
        assert_eq!(rows[0].output_tokens, 0);
    }

    #[tokio::test]
    async fn test_create_user_generates_token() {
        let dal = MemoryDal::new();
        let p = dal.create_user("bob", 10, None).await.unwrap();
        assert!(p.api_token.starts_with("hm_"));
        assert!(dal.user_by_token(&p.api_token).await.unwrap().is_some());
    }
}
