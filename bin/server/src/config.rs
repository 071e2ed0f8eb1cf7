//! Centralized server configuration.
//!
//! Loaded via the `config` crate from `THINKONE_*` environment variables,
//! e.g. `THINKONE_BIND_PORT=8080`. List-valued settings are comma-separated.

use serde::Deserialize;
use std::time::Duration;
use thinkone_core::{AccountKey, ParseIdError};
use thinkone_dispatch::DispatcherConfig;
use thinkone_governor::GovernorConfig;
use thinkone_session::SessionConfig;

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// `memory:` or a sqlite URI.
    #[serde(default = "default_store_uri")]
    pub store_uri: String,

    /// Where the credential encryption key lives: `env:NAME` or `file:/path`.
    pub encryption_key_ref: String,

    /// Seconds a session may sit idle before it is released.
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,

    /// Token bucket capacity per account.
    #[serde(default = "default_bucket_size")]
    pub default_bucket_size: u32,

    /// Tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Longest rate-limit wait absorbed in a session queue, in milliseconds.
    #[serde(default = "default_max_queue_wait_ms")]
    pub max_queue_wait_ms: u64,

    /// Per-operation caller timeout, in milliseconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default = "default_idempotency_ttl_s")]
    pub idempotency_ttl_s: u64,

    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,

    /// Connect every registered account at startup.
    #[serde(default = "default_eager_connect")]
    pub eager_connect: bool,

    /// Account used by the news routes when none is given.
    #[serde(default)]
    pub default_account: Option<String>,

    /// Channels read by the news routes when none are given.
    #[serde(default)]
    pub default_channels: String,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,

    /// Bot API endpoint.
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_store_uri() -> String {
    "sqlite://thinkone.db?mode=rwc".to_string()
}

fn default_idle_timeout_s() -> u64 {
    900
}

fn default_bucket_size() -> u32 {
    20
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_max_queue_wait_ms() -> u64 {
    5_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_idempotency_ttl_s() -> u64 {
    600
}

fn default_idempotency_capacity() -> usize {
    10_000
}

fn default_eager_connect() -> bool {
    true
}

fn default_cors_origins() -> String {
    "http://localhost:5174".to_string()
}

fn default_telegram_api_base() -> String {
    thinkone_telegram::DEFAULT_API_BASE.to_string()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("THINKONE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn from_environment(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }

    /// Address string suitable for binding a listener.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    /// Configured default channels.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        split_list(&self.default_channels)
    }

    /// Configured CORS origins.
    #[must_use]
    pub fn cors_origin_list(&self) -> Vec<String> {
        split_list(&self.cors_origins)
    }

    /// The default account, validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured key is malformed.
    pub fn default_account_key(&self) -> Result<Option<AccountKey>, ParseIdError> {
        self.default_account
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(AccountKey::new)
            .transpose()
    }

    /// Rate governor settings.
    #[must_use]
    pub fn governor(&self) -> GovernorConfig {
        GovernorConfig::new(self.default_bucket_size, self.refill_rate)
    }

    /// Session worker settings.
    #[must_use]
    pub fn sessions(&self) -> SessionConfig {
        SessionConfig::default()
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_s))
            .with_max_queue_wait(Duration::from_millis(self.max_queue_wait_ms))
    }

    /// Dispatcher settings.
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_s),
            idempotency_capacity: self.idempotency_capacity,
            ..DispatcherConfig::default()
        }
    }
}
