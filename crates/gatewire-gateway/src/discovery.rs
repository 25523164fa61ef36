//! Gateway bot discovery over REST.

use std::time::Duration;

use gatewire_rest::{Method, RestExecutor, RestRequest, Route};
use serde::Deserialize;
use tracing::info;

use crate::config::GatewayConfig;

/// Limits on starting new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    /// Session starts allowed per reset period.
    pub total: u32,
    /// Session starts left in the current period.
    pub remaining: u32,
    /// Milliseconds until the limit resets.
    pub reset_after: u64,
    /// Identifies allowed per identify window.
    pub max_concurrency: u32,
}

impl SessionStartLimit {
    /// Time until the limit resets.
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after)
    }
}

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBot {
    /// Gateway URL to connect to.
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    /// Session start limit.
    pub session_start_limit: SessionStartLimit,
}

impl GatewayBot {
    /// Fetches the recommended settings through `rest`.
    pub async fn fetch(rest: &RestExecutor) -> gatewire_rest::Result<Self> {
        let route = Route::new(Method::Get, "/gateway/bot").compile(&[])?;
        let bot: GatewayBot = rest.execute_json(RestRequest::new(route)).await?;
        info!(
            url = %bot.url,
            shards = bot.shards,
            remaining = bot.session_start_limit.remaining,
            max_concurrency = bot.session_start_limit.max_concurrency,
            "fetched gateway bot settings"
        );
        Ok(bot)
    }

    /// Applies URL, shard count and identify concurrency to `config`.
    pub fn apply(&self, config: &mut GatewayConfig) {
        config.url = self.url.clone();
        config.shard_count = self.shards.max(1);
        config.max_concurrency = self.session_start_limit.max_concurrency.max(1);
    }
}
