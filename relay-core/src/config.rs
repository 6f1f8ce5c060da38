use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub api_url: String,
    pub dashboard_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_timeout_seconds() -> u64 {
    5
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SlackConfig {
    pub api_url: String,
    pub bot_token: String,
    pub signing_secret: String,
    pub timeout_seconds: u64,
    pub min_send_interval_ms: u64,
    pub max_rate_limit_retries: usize,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            api_url: "https://slack.com/api".to_string(),
            bot_token: String::new(),
            signing_secret: String::new(),
            timeout_seconds: 5,
            min_send_interval_ms: 1000,
            max_rate_limit_retries: 2,
        }
    }
}

/// How far the cursor moves after a batch has been attempted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Advance to the last fetched alert, whatever the send outcomes were.
    #[default]
    LastFetched,
    /// Stop at the first failed send and advance only past the alerts sent before it.
    LastSent,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub initial_delay_seconds: u64,
    pub interval_seconds: u64,
    pub max_concurrency: usize,
    pub session_timeout_seconds: u64,
    pub max_components: usize,
    pub cursor_policy: CursorPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_seconds: 10,
            interval_seconds: 60,
            max_concurrency: num_cpus::get() * 4,
            session_timeout_seconds: 30,
            max_components: 10,
            cursor_policy: CursorPolicy::LastFetched,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8780,
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file, overlaid with `RELAY__SECTION__KEY` env vars.
    ///
    /// Slack secrets left empty in both fall back to `SLACK_BOT_TOKEN` and
    /// `SLACK_SIGNING_SECRET`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("RELAY").separator("__"))
            .build()?;
        let mut config: Self = s.try_deserialize()?;
        config.apply_secret_fallbacks();
        Ok(config)
    }

    fn apply_secret_fallbacks(&mut self) {
        if self.slack.bot_token.is_empty() {
            self.slack.bot_token = std::env::var("SLACK_BOT_TOKEN").unwrap_or_default();
        }
        if self.slack.signing_secret.is_empty() {
            self.slack.signing_secret = std::env::var("SLACK_SIGNING_SECRET").unwrap_or_default();
        }
    }
}
