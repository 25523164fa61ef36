//! Rate-limit information carried by HTTP responses.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use serde::Deserialize;

/// Bucket hash header.
pub const BUCKET: &str = "x-ratelimit-bucket";
/// Requests per window.
pub const LIMIT: &str = "x-ratelimit-limit";
/// Requests left in the current window.
pub const REMAINING: &str = "x-ratelimit-remaining";
/// Absolute reset time, seconds since the UNIX epoch.
pub const RESET: &str = "x-ratelimit-reset";
/// Relative reset time in seconds.
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
/// Present and `true` when a 429 is global.
pub const GLOBAL: &str = "x-ratelimit-global";
/// Scope of a 429: `user`, `global` or `shared`.
pub const SCOPE: &str = "x-ratelimit-scope";
/// Standard retry delay in seconds.
pub const RETRY_AFTER: &str = "retry-after";

/// Longest delay taken from a response. Larger values are clamped to it.
pub const MAX_SERVER_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bucket state reported by a response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    /// Opaque bucket hash.
    pub bucket: Option<String>,
    /// Requests per window.
    pub limit: Option<u32>,
    /// Requests left in the window.
    pub remaining: Option<u32>,
    /// Time until the window resets.
    pub reset_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parses bucket headers. Returns `None` when the response carries none.
    ///
    /// `reset-after` is preferred; the absolute `reset` is only used when it
    /// is missing, relative to the local wall clock.
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let bucket = header_str(headers, BUCKET).map(str::to_string);
        let limit = header_str(headers, LIMIT).and_then(|v| v.parse().ok());
        let remaining = header_str(headers, REMAINING).and_then(|v| v.parse().ok());
        let reset_after = header_secs(headers, RESET_AFTER).or_else(|| {
            let reset_at = header_str(headers, RESET)?.parse::<f64>().ok()?;
            let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
            delay_secs((reset_at - now).max(0.0))
        });

        if bucket.is_none() && limit.is_none() && remaining.is_none() && reset_after.is_none() {
            return None;
        }

        Some(Self {
            bucket,
            limit,
            remaining,
            reset_after,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
    #[serde(default)]
    message: String,
}

/// A parsed 429 response.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitedResponse {
    /// Server-given delay before retrying.
    pub retry_after: Duration,
    /// Whether the limit applies to every request of this client.
    pub is_global: bool,
    /// `user`, `global` or `shared` when reported.
    pub scope: Option<String>,
    /// Service message, empty if absent.
    pub message: String,
    /// Bucket headers sent alongside the 429, if any.
    pub bucket: Option<RateLimitHeaders>,
}

impl RateLimitedResponse {
    /// Parses a 429 response. The JSON body takes precedence over headers for
    /// the delay and global flag.
    pub fn parse(headers: &HeaderMap, body: &[u8]) -> Self {
        let parsed: Option<RateLimitedBody> = serde_json::from_slice(body).ok();
        let scope = header_str(headers, SCOPE).map(str::to_string);

        let header_global = header_str(headers, GLOBAL)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
            || scope.as_deref() == Some("global");

        let retry_after = parsed
            .as_ref()
            .and_then(|b| b.retry_after)
            .and_then(delay_secs)
            .or_else(|| header_secs(headers, RETRY_AFTER))
            .or_else(|| header_secs(headers, RESET_AFTER))
            .unwrap_or(Duration::from_secs(1));

        let is_global = parsed.as_ref().map(|b| b.global).unwrap_or(false) || header_global;
        let message = parsed.map(|b| b.message).unwrap_or_default();

        Self {
            retry_after,
            is_global,
            scope,
            message,
            bucket: RateLimitHeaders::parse(headers),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<Duration> {
    header_str(headers, name)
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(delay_secs)
}

/// Converts server-given seconds, clamped to [`MAX_SERVER_DELAY`].
fn delay_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    if secs >= MAX_SERVER_DELAY.as_secs_f64() {
        return Some(MAX_SERVER_DELAY);
    }
    Some(Duration::from_secs_f64(secs))
}
