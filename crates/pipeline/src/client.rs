//! Queue-style provider client and the poll-to-completion helper.
//!
//! Providers expose `submit → status → result`; [`PollingInvoker`] turns that into a
//! single `invoke(endpoint, input)` call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::provider::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    InQueue,
    InProgress,
    Completed,
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

/// Low-level provider queue API.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a request; returns the provider's request id.
    async fn submit(&self, endpoint: &str, input: &serde_json::Value) -> Result<String, ProviderError>;

    async fn status(&self, endpoint: &str, request_id: &str) -> Result<ProviderStatus, ProviderError>;

    async fn result(&self, endpoint: &str, request_id: &str) -> Result<serde_json::Value, ProviderError>;
}

/// Result of an invocation: the raw provider document plus every URL found in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub urls: Vec<String>,
    pub data: serde_json::Value,
}

impl ProviderOutput {
    pub fn from_data(data: serde_json::Value) -> Self {
        let mut urls = Vec::new();
        collect_urls(&data, &mut urls);
        Self { urls, data }
    }

    /// First result URL; missing is an error.
    pub fn first_url(&self) -> Result<String, ProviderError> {
        self.urls
            .first()
            .cloned()
            .ok_or_else(|| ProviderError::Empty("provider result has no url".to_string()))
    }
}

/// `invoke(endpoint, payload) → resultUrl | resultUrls`.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &str,
        input: serde_json::Value,
    ) -> Result<ProviderOutput, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(15 * 60),
        }
    }
}

/// [`ModelInvoker`] that submits and polls a [`ProviderClient`] until a terminal status.
#[derive(Debug, Clone)]
pub struct PollingInvoker<C> {
    client: C,
    poll: PollConfig,
}

impl<C> PollingInvoker<C>
where
    C: ProviderClient,
{
    pub fn new(client: C, poll: PollConfig) -> Self {
        Self { client, poll }
    }

    pub async fn poll_until_complete(
        &self,
        endpoint: &str,
        request_id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let deadline = Instant::now() + self.poll.max_wait;
        loop {
            match self.client.status(endpoint, request_id).await? {
                ProviderStatus::Completed => {
                    return self.client.result(endpoint, request_id).await;
                }
                ProviderStatus::Failed { error } => {
                    warn!(endpoint, request_id, ?error, "provider request failed");
                    return Err(ProviderError::Failed {
                        request_id: request_id.to_string(),
                        message: error.unwrap_or_else(|| "unknown provider error".to_string()),
                    });
                }
                ProviderStatus::InQueue | ProviderStatus::InProgress => {}
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout(self.poll.max_wait));
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }
}

#[async_trait]
impl<C> ModelInvoker for PollingInvoker<C>
where
    C: ProviderClient,
{
    async fn invoke(
        &self,
        endpoint: &str,
        input: serde_json::Value,
    ) -> Result<ProviderOutput, ProviderError> {
        let request_id = self.client.submit(endpoint, &input).await?;
        debug!(endpoint, request_id = %request_id, "provider request submitted");

        let data = self.poll_until_complete(endpoint, &request_id).await?;
        Ok(ProviderOutput::from_data(data))
    }
}

/// Every string found under a `url` key, depth-first in document order.
fn collect_urls(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                match v {
                    serde_json::Value::String(s) if key == "url" && !s.trim().is_empty() => {
                        out.push(s.clone())
                    }
                    other => collect_urls(other, out),
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_urls(item, out);
            }
        }
        _ => {}
    }
}
