//! Usage accounting
//!
//! Every request ends in exactly one usage row. The writer commits
//! synchronously through the DAL; when a remote sink is configured the
//! row is additionally posted fire-and-forget with an idempotency key,
//! so a flaky sink never slows the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::dal::Dal;
use crate::types::UsageRecord;

/// Attempts made against the remote sink before giving up
const SINK_MAX_ATTEMPTS: u32 = 3;

/// Base delay for the sink's linear backoff
const SINK_BASE_DELAY: Duration = Duration::from_millis(500);

/// Records usage rows through the DAL and, optionally, a remote sink
pub struct UsageWriter {
    dal: Arc<dyn Dal>,
    sink: Option<UsageSink>,
}

struct UsageSink {
    client: reqwest::Client,
    url: String,
}

impl UsageWriter {
    /// Create a writer that commits synchronously through the DAL
    #[must_use]
    pub fn new(dal: Arc<dyn Dal>) -> Self {
        Self { dal, sink: None }
    }

    /// Also mirror rows to a remote sink (async commit mode)
    #[must_use]
    pub fn with_sink(mut self, url: impl Into<String>) -> Self {
        self.sink = Some(UsageSink {
            client: reqwest::Client::new(),
            url: url.into(),
        });
        self
    }

    /// Append one usage row
    ///
    /// Accounting must never fail the request it describes, so DAL errors
    /// are logged and swallowed here.
    pub async fn record(&self, record: UsageRecord) {
        if let Err(err) = self.dal.insert_usage(&record).await {
            warn!(
                user_id = record.user_id,
                status = record.status_code,
                %err,
                "failed to persist usage row"
            );
        }

        if let Some(sink) = &self.sink {
            let client = sink.client.clone();
            let url = sink.url.clone();
            tokio::spawn(async move {
                post_to_sink(client, url, record).await;
            });
        }
    }
}

/// POST a usage row to the remote sink with linear backoff
///
/// The idempotency key makes retried deliveries safe to replay on the
/// sink side.
async fn post_to_sink(client: reqwest::Client, url: String, record: UsageRecord) {
    let idempotency_key = ulid::Ulid::new().to_string();

    for attempt in 1..=SINK_MAX_ATTEMPTS {
        let result = client
            .post(&url)
            .header("Idempotency-Key", &idempotency_key)
            .json(&record)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(%idempotency_key, attempt, "usage row delivered to sink");
                return;
            }
            Ok(resp) => {
                warn!(%idempotency_key, attempt, status = %resp.status(), "usage sink rejected row");
            }
            Err(err) => {
                warn!(%idempotency_key, attempt, %err, "usage sink unreachable");
            }
        }

        if attempt < SINK_MAX_ATTEMPTS {
            sleep(SINK_BASE_DELAY * attempt).await;
        }
    }

    warn!(%idempotency_key, "usage row dropped after {SINK_MAX_ATTEMPTS} sink attempts");
}
