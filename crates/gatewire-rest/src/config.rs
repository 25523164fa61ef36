//! Configuration for the REST subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for retry behavior on server and transport errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff in milliseconds (default: 500).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 16000).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 16_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Initial backoff as a duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff ceiling as a duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// REST client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Base URL every compiled path is appended to.
    pub base_url: String,
    /// Authorization token, sent as `Authorization: <token_type> <token>`.
    pub token: Option<String>,
    /// Token scheme (default: "Bot").
    pub token_type: String,
    /// User agent header value.
    pub user_agent: String,
    /// Per-attempt request timeout in seconds (default: 30).
    pub request_timeout_secs: u64,
    /// Longest rate-limit wait accepted before failing fast (default: 300).
    pub max_rate_limit_secs: u64,
    /// How many 429 responses are retried before surfacing (default: 5).
    pub max_rate_limit_retries: u32,
    /// Requests admitted per global window (default: 50).
    pub global_capacity: u32,
    /// Global window length in milliseconds (default: 1000).
    pub global_period_ms: u64,
    /// Requests admitted per authentication-sensitive window (default: 5).
    pub auth_capacity: u32,
    /// Authentication-sensitive window length in milliseconds (default: 5000).
    pub auth_period_ms: u64,
    /// Backoff policy for 5xx and transport failures.
    pub retry: RetryConfig,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://discord.com/api/v10"),
            token: None,
            token_type: String::from("Bot"),
            user_agent: format!("gatewire/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            max_rate_limit_secs: 300,
            max_rate_limit_retries: 5,
            global_capacity: 50,
            global_period_ms: 1_000,
            auth_capacity: 5,
            auth_period_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl RestConfig {
    /// Per-attempt timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Longest acceptable rate-limit wait.
    pub fn max_rate_limit(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_secs)
    }

    /// Global window length.
    pub fn global_period(&self) -> Duration {
        Duration::from_millis(self.global_period_ms)
    }

    /// Authentication-sensitive window length.
    pub fn auth_period(&self) -> Duration {
        Duration::from_millis(self.auth_period_ms)
    }

    /// Value for the `Authorization` header, if a token is configured.
    pub fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|token| {
            if self.token_type.is_empty() {
                token.clone()
            } else {
                format!("{} {}", self.token_type, token)
            }
        })
    }
}
