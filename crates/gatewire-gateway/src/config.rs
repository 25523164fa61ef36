//! Gateway and whole-client configuration.

use std::path::Path;
use std::time::Duration;

use gatewire_rest::{RestConfig, RetryConfig};
use serde::{Deserialize, Serialize};

/// Gateway shard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway base URL, without query string.
    pub url: String,
    /// Authentication token sent with identify and resume.
    pub token: String,
    /// Gateway intents bitfield (default: 1, guilds).
    pub intents: u64,
    /// Member count above which offline members are omitted (default: 250).
    pub large_threshold: u32,
    /// Gateway API version (default: 10).
    pub api_version: u32,
    /// Total number of shards (default: 1).
    pub shard_count: u32,
    /// Identify operations allowed per window (default: 1).
    pub max_concurrency: u32,
    /// Identify window length in milliseconds (default: 5000).
    pub identify_window_ms: u64,
    /// How long to wait for HELLO after connecting, in seconds (default: 20).
    pub hello_timeout_secs: u64,
    /// Socket connect timeout in seconds (default: 30).
    pub connect_timeout_secs: u64,
    /// Consecutive unacknowledged heartbeats before the connection is zombied (default: 2).
    pub max_missed_acks: u32,
    /// Events buffered per shard before its receive loop is suspended (default: 1024).
    pub event_buffer: usize,
    /// Outbound commands allowed per command window (default: 120).
    pub command_capacity: u32,
    /// Command window length in milliseconds (default: 60000).
    pub command_period_ms: u64,
    /// Reconnect backoff. `max_retries` bounds consecutive failed
    /// reconnects before a shard reports a recoverable disconnect.
    pub reconnect: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::from("wss://gateway.discord.gg"),
            token: String::new(),
            intents: 1,
            large_threshold: 250,
            api_version: 10,
            shard_count: 1,
            max_concurrency: 1,
            identify_window_ms: 5_000,
            hello_timeout_secs: 20,
            connect_timeout_secs: 30,
            max_missed_acks: 2,
            event_buffer: 1024,
            command_capacity: 120,
            command_period_ms: 60_000,
            reconnect: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                backoff_multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

impl GatewayConfig {
    /// Connection URL for `base`, with version and encoding query.
    pub fn connect_url(&self, base: &str) -> String {
        let base = base.trim_end_matches('/');
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}v={}&encoding=json", base, separator, self.api_version)
    }

    /// HELLO wait.
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs)
    }

    /// Socket connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Identify window length.
    pub fn identify_window(&self) -> Duration {
        Duration::from_millis(self.identify_window_ms)
    }

    /// Command window length.
    pub fn command_period(&self) -> Duration {
        Duration::from_millis(self.command_period_ms)
    }
}

/// Configuration for a whole client: REST and gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// REST settings.
    pub rest: RestConfig,
    /// Gateway settings.
    pub gateway: GatewayConfig,
}

impl ClientConfig {
    /// Loads a configuration file; the format follows the extension
    /// (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ClientConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ClientConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Uses `token` for both REST and gateway.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.rest.token = Some(token.clone());
        self.gateway.token = token;
        self
    }
}
