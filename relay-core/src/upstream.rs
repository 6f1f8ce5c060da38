//! Upstream alert source: the monitoring API, consumed read-only.
//!
//! Provides an `AlertSource` trait and `MonitorApiClient`, its HTTP
//! implementation. Fetches are idempotent, so transient failures (timeouts,
//! connection errors, 429 and 5xx) are retried with jittered exponential
//! backoff. Auth and decode failures are returned at once.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::UpstreamConfig;
use crate::models::{Alert, Credentials, FailingComponent};

// ============================================================================
// AlertSource trait
// ============================================================================

#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Alerts with `id > last_id` and source time `>= floor`, ascending by id.
    async fn fetch_since(
        &self,
        credentials: &Credentials,
        last_id: i64,
        floor: DateTime<Utc>,
    ) -> Result<Vec<Alert>, UpstreamError>;

    /// Connectivity and credential check. Never fails; problems show up as `false`.
    async fn ping(&self, credentials: &Credentials) -> PingStatus;

    /// Source name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PingStatus {
    pub reachable: bool,
    pub authenticated: bool,
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("All {attempts} attempts failed, last error: {last_error}")]
    RetryExhausted { attempts: usize, last_error: String },
}

impl UpstreamError {
    fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            UpstreamError::Api { code, .. } => {
                *code == StatusCode::TOO_MANY_REQUESTS.as_u16() || *code >= 500
            }
            UpstreamError::Decode(_) | UpstreamError::RetryExhausted { .. } => false,
        }
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertDto {
    id: i64,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    failing_miners: Vec<FailingMinerDto>,
    #[serde(default, alias = "date")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailingMinerDto {
    miner_id: i64,
    miner: String,
    #[serde(default)]
    diagnosis: Vec<String>,
}

impl From<AlertDto> for Alert {
    fn from(dto: AlertDto) -> Self {
        Alert {
            id: dto.id,
            subject: dto.subject,
            failing_components: dto
                .failing_miners
                .into_iter()
                .map(|m| FailingComponent {
                    component_id: m.miner_id,
                    label: m.miner,
                    diagnosis_lines: m.diagnosis,
                })
                .collect(),
            created_at: dto.timestamp,
            degraded: false,
        }
    }
}

/// Decode entries one at a time so a single bad entry cannot sink the batch.
///
/// An entry with a readable id but an unreadable body becomes a degraded
/// placeholder. An entry without a readable id is dropped: it cannot be
/// ordered against the cursor.
pub fn decode_alerts(entries: Vec<serde_json::Value>) -> Vec<Alert> {
    let mut alerts = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = entry.get("id").and_then(|v| v.as_i64());
        match serde_json::from_value::<AlertDto>(entry) {
            Ok(dto) => alerts.push(Alert::from(dto)),
            Err(e) => match id {
                Some(id) => {
                    tracing::warn!(alert_id = id, error = %e, "Malformed alert, using placeholder");
                    alerts.push(Alert::degraded(id));
                }
                None => {
                    tracing::warn!(error = %e, "Dropping alert without a readable id");
                }
            },
        }
    }
    alerts
}

// ============================================================================
// MonitorApiClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct MonitorApiClient {
    client: Client,
    base_url: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl MonitorApiClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    async fn fetch_once(
        &self,
        credentials: &Credentials,
        last_id: i64,
        floor: DateTime<Utc>,
    ) -> Result<Vec<Alert>, UpstreamError> {
        let url = format!(
            "{}/api/notifications/{}/slack",
            self.base_url, credentials.client_id
        );
        let start_date = floor.to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Token {}", credentials.api_key))
            .query(&[("startId", last_id.to_string()), ("startDate", start_date)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Decode(format!("expected a JSON array: {}", e)))?;

        Ok(decode_alerts(entries))
    }

    async fn get_ok(&self, url: &str, api_key: Option<&str>) -> bool {
        let mut request = self.client.get(url);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Token {}", key));
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Ping request failed");
                false
            }
        }
    }
}

#[async_trait]
impl AlertSource for MonitorApiClient {
    async fn fetch_since(
        &self,
        credentials: &Credentials,
        last_id: i64,
        floor: DateTime<Utc>,
    ) -> Result<Vec<Alert>, UpstreamError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.fetch_once(credentials, last_id, floor),
            |e: &UpstreamError| e.is_transient(),
        )
        .await;

        match result {
            Ok(alerts) => Ok(alerts),
            Err(e) if e.is_transient() => Err(UpstreamError::RetryExhausted {
                attempts: self.max_retries + 1,
                last_error: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self, credentials: &Credentials) -> PingStatus {
        let reachable = self.get_ok(&format!("{}/api/ping", self.base_url), None).await;
        let authenticated = self
            .get_ok(
                &format!("{}/api/ping/{}", self.base_url, credentials.client_id),
                Some(&credentials.api_key),
            )
            .await;
        PingStatus {
            reachable,
            authenticated,
        }
    }

    fn name(&self) -> &str {
        "monitor-api"
    }
}

// ============================================================================
// TESTS
// ============================================================================
