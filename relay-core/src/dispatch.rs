//! Dispatch channel: delivers rendered alerts to a chat destination.
//!
//! Rate limiting lives here, not in the polling engine: `SlackChannel` spaces
//! posts to the same destination by `min_send_interval_ms` and honours
//! `Retry-After` on HTTP 429. It is safe to share across session tasks.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::SlackConfig;

#[async_trait]
pub trait DispatchChannel: Send + Sync {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DispatchError>;

    /// Channel name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Missing bot token")]
    MissingToken,
}

// ============================================================================
// Slack wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    unfurl_links: bool,
    unfurl_media: bool,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

// ============================================================================
// SlackChannel
// ============================================================================

#[derive(Debug)]
pub struct SlackChannel {
    client: Client,
    base_url: String,
    bot_token: String,
    min_interval: Duration,
    max_rate_limit_retries: usize,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig) -> Result<Self, DispatchError> {
        if config.bot_token.is_empty() {
            return Err(DispatchError::MissingToken);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            min_interval: Duration::from_millis(config.min_send_interval_ms),
            max_rate_limit_retries: config.max_rate_limit_retries,
            next_slot: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve the next send slot for `destination` and wait until it opens.
    async fn wait_for_slot(&self, destination: &str) {
        if self.min_interval.is_zero() {
            return;
        }

        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(destination)
                .copied()
                .filter(|t| *t > now)
                .unwrap_or(now);
            slots.insert(destination.to_string(), slot + self.min_interval);
            slot - now
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn post_once(&self, destination: &str, text: &str) -> Result<(), DispatchError> {
        let url = format!("{}/chat.postMessage", self.base_url);
        let request = PostMessageRequest {
            channel: destination,
            text,
            unfurl_links: false,
            unfurl_media: false,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Err(DispatchError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: PostMessageResponse = response.json().await?;
        if !body.ok {
            return Err(DispatchError::Rejected(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl DispatchChannel for SlackChannel {
    async fn send(&self, destination: &str, text: &str) -> Result<(), DispatchError> {
        let mut rate_limited = 0usize;
        loop {
            self.wait_for_slot(destination).await;
            match self.post_once(destination, text).await {
                Err(DispatchError::RateLimited { retry_after_secs })
                    if rate_limited < self.max_rate_limit_retries =>
                {
                    rate_limited += 1;
                    tracing::debug!(
                        destination = %destination,
                        retry_after_secs,
                        attempt = rate_limited,
                        "Slack rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                }
                other => return other,
            }
        }
    }

    fn name(&self) -> &str {
        "slack"
    }
}

// ============================================================================
// TESTS
// ============================================================================
