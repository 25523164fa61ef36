//! Error types for the REST subsystem.

use std::fmt;
use std::time::Duration;

use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Maximum number of body characters rendered into an error message.
const MAX_RENDERED_BODY: usize = 200;

/// Details of an erroneous HTTP response.
#[derive(Debug, Clone)]
pub struct HttpErrorDetail {
    /// URL that produced the response.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Service-specific JSON error code, 0 when absent.
    pub code: i64,
    /// Service-provided message, empty when absent.
    pub message: String,
    /// Field-level error tree returned with 400 responses.
    pub errors: Option<Value>,
    /// Raw response body.
    pub raw_body: String,
}

impl HttpErrorDetail {
    /// Builds a detail record from a response body, extracting `code`,
    /// `message` and `errors` when the body is a JSON object.
    pub fn from_body(url: impl Into<String>, status: u16, body: &[u8]) -> Self {
        let raw_body = String::from_utf8_lossy(body).into_owned();
        let parsed: Option<Value> = serde_json::from_slice(body).ok();

        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let errors = parsed.as_ref().and_then(|v| v.get("errors")).cloned();

        Self {
            url: url.into(),
            status,
            code,
            message,
            errors,
            raw_body,
        }
    }

    /// Renders the field-level error tree, one `path:` header per leaf list.
    pub fn field_errors(&self) -> Option<String> {
        let errors = self.errors.as_ref()?;
        let mut out = String::new();
        dump_errors(errors, "", &mut out);
        let trimmed = out.trim_matches('\n');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

fn dump_errors(value: &Value, path: &str, out: &mut String) {
    let Some(object) = value.as_object() else {
        return;
    };

    for (key, child) in object {
        if key == "_errors" {
            if let Some(items) = child.as_array() {
                out.push_str(if path.is_empty() { "root" } else { path });
                out.push(':');
                for item in items {
                    let message = item
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    out.push_str("\n - ");
                    out.push_str(message);
                }
                out.push_str("\n\n");
            }
            continue;
        }

        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        dump_errors(child, &child_path, out);
    }
}

impl fmt::Display for HttpErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
        {
            Some(reason) => write!(f, "{} {}:", reason, self.status)?,
            None => write!(f, "Unknown Status {}:", self.status)?,
        }

        if self.code != 0 {
            write!(f, " ({})", self.code)?;
        }

        let body = if self.message.is_empty() {
            self.raw_body.as_str()
        } else {
            self.message.as_str()
        };
        let chomped: String = body.chars().take(MAX_RENDERED_BODY).collect();
        let ellipsis = if body.chars().count() > MAX_RENDERED_BODY {
            "..."
        } else {
            ""
        };
        write!(f, " '{}{}' for {}", chomped, ellipsis, self.url)?;

        if let Some(fields) = self.field_errors() {
            write!(f, "\n\n{}", fields)?;
        }
        Ok(())
    }
}

/// Errors surfaced by the request executor and the rate limiter.
#[derive(Debug, Error)]
pub enum RestError {
    /// The request never produced a response (reset, timeout, DNS, TLS).
    #[error("transport error: {reason}")]
    Transport {
        /// Underlying failure description.
        reason: String,
    },

    /// Waiting for a rate limit would exceed the caller's ceiling.
    #[error(
        "the request has been rejected, as you would be waiting for more than the max retry-after ({max_retry_after:?}) on route '{route}' [is_global={is_global}]"
    )]
    RateLimitTooLong {
        /// Route that produced this rejection.
        route: String,
        /// Whether the blocking limiter is the global one.
        is_global: bool,
        /// How long the caller would have had to wait.
        retry_after: Duration,
        /// The configured ceiling.
        max_retry_after: Duration,
        /// Requests per window, if known.
        limit: Option<u32>,
        /// Window length, if known.
        period: Option<Duration>,
    },

    /// The service kept answering 429 after the bounded retry count.
    #[error("rate limited on route '{route}' (retry after {retry_after:?}, global={is_global})")]
    RateLimited {
        /// Route that was rate limited.
        route: String,
        /// Last server-given delay.
        retry_after: Duration,
        /// Whether the last limit was global.
        is_global: bool,
    },

    /// 400: the request was malformed.
    #[error("{0}")]
    BadRequest(HttpErrorDetail),

    /// 401: missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(HttpErrorDetail),

    /// 403: authenticated but not allowed.
    #[error("{0}")]
    Forbidden(HttpErrorDetail),

    /// 404: the resource does not exist.
    #[error("{0}")]
    NotFound(HttpErrorDetail),

    /// Any other 4xx response.
    #[error("{0}")]
    Client(HttpErrorDetail),

    /// 5xx response after retries were exhausted.
    #[error("{0}")]
    InternalServer(HttpErrorDetail),

    /// A path parameter required by the route template was not supplied.
    #[error("route '{route}' is missing path parameter '{param}'")]
    MissingPathParam {
        /// Route template.
        route: String,
        /// Name of the missing parameter.
        param: String,
    },

    /// A configured header value, such as the token or user agent, is not a
    /// valid HTTP header value.
    #[error("invalid value for header '{header}': {reason}")]
    InvalidHeader {
        /// Header name.
        header: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Request body or response decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The executor was shut down while the request was in flight.
    #[error("request cancelled")]
    Cancelled,
}

impl RestError {
    /// Always 0 for [`RestError::RateLimitTooLong`]; `None` for other variants.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            RestError::RateLimitTooLong { .. } => Some(0),
            _ => None,
        }
    }

    /// HTTP status of the response that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::BadRequest(d)
            | RestError::Unauthorized(d)
            | RestError::Forbidden(d)
            | RestError::NotFound(d)
            | RestError::Client(d)
            | RestError::InternalServer(d) => Some(d.status),
            RestError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Maps a non-success, non-429 status to its error kind.
    pub fn from_status(detail: HttpErrorDetail) -> Self {
        match detail.status {
            400 => RestError::BadRequest(detail),
            401 => RestError::Unauthorized(detail),
            403 => RestError::Forbidden(detail),
            404 => RestError::NotFound(detail),
            500..=599 => RestError::InternalServer(detail),
            _ => RestError::Client(detail),
        }
    }
}

/// Returns true for errors the executor retries internally with backoff.
///
/// Rate-limit conditions are retried on their own schedule, so they are not
/// considered retryable here.
pub fn is_retryable(error: &RestError) -> bool {
    match error {
        RestError::Transport { .. } => true,
        RestError::InternalServer(_) => true,
        RestError::RateLimitTooLong { .. } => false,
        RestError::RateLimited { .. } => false,
        RestError::BadRequest(_) => false,
        RestError::Unauthorized(_) => false,
        RestError::Forbidden(_) => false,
        RestError::NotFound(_) => false,
        RestError::Client(_) => false,
        RestError::MissingPathParam { .. } => false,
        RestError::InvalidHeader { .. } => false,
        RestError::Serialization(_) => false,
        RestError::Cancelled => false,
    }
}

/// Result type alias using RestError as the error type.
pub type Result<T> = std::result::Result<T, RestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_from_json_body() {
        let body = br#"{"code": 10003, "message": "Unknown Channel"}"#;
        let detail = HttpErrorDetail::from_body("https://api.test/channels/1", 404, body);
        assert_eq!(detail.code, 10003);
        assert_eq!(detail.message, "Unknown Channel");
        assert!(detail.errors.is_none());
        assert_eq!(
            detail.to_string(),
            "Not Found 404: (10003) 'Unknown Channel' for https://api.test/channels/1"
        );
    }

    #[test]
    fn test_detail_from_plain_body() {
        let detail = HttpErrorDetail::from_body("https://api.test/x", 502, b"bad gateway");
        assert_eq!(detail.code, 0);
        assert_eq!(detail.to_string(), "Bad Gateway 502: 'bad gateway' for https://api.test/x");
    }

    #[test]
    fn test_detail_unknown_status() {
        let detail = HttpErrorDetail::from_body("u", 599, b"");
        assert!(detail.to_string().starts_with("Unknown Status 599:"));
    }

    #[test]
    fn test_detail_truncates_long_body() {
        let body = "x".repeat(250);
        let detail = HttpErrorDetail::from_body("u", 500, body.as_bytes());
        let rendered = detail.to_string();
        assert!(rendered.contains(&format!("'{}...'", "x".repeat(200))));
    }

    #[test]
    fn test_bad_request_field_errors() {
        let body = br#"{
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                "embed": {
                    "title": {"_errors": [{"code": "BASE_TYPE_MAX_LENGTH", "message": "Too long"}]}
                },
                "content": {"_errors": [{"code": "X", "message": "Required"}]}
            }
        }"#;
        let detail = HttpErrorDetail::from_body("u", 400, body);
        let fields = detail.field_errors().unwrap();
        assert!(fields.contains("embed.title:\n - Too long"));
        assert!(fields.contains("content:\n - Required"));

        let err = RestError::from_status(detail);
        assert!(matches!(err, RestError::BadRequest(_)));
        assert!(err.to_string().contains("Invalid Form Body"));
    }

    #[test]
    fn test_from_status_mapping() {
        let detail = |status| HttpErrorDetail::from_body("u", status, b"{}");
        assert!(matches!(RestError::from_status(detail(400)), RestError::BadRequest(_)));
        assert!(matches!(RestError::from_status(detail(401)), RestError::Unauthorized(_)));
        assert!(matches!(RestError::from_status(detail(403)), RestError::Forbidden(_)));
        assert!(matches!(RestError::from_status(detail(404)), RestError::NotFound(_)));
        assert!(matches!(RestError::from_status(detail(409)), RestError::Client(_)));
        assert!(matches!(RestError::from_status(detail(503)), RestError::InternalServer(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&RestError::Transport {
            reason: "reset".to_string()
        }));
        assert!(is_retryable(&RestError::InternalServer(HttpErrorDetail::from_body(
            "u", 500, b""
        ))));
        assert!(!is_retryable(&RestError::NotFound(HttpErrorDetail::from_body(
            "u", 404, b""
        ))));
        assert!(!is_retryable(&RestError::Cancelled));
        assert!(!is_retryable(&RestError::RateLimited {
            route: "GET /x".to_string(),
            retry_after: Duration::from_secs(1),
            is_global: false,
        }));
    }

    #[test]
    fn test_rate_limit_too_long_remaining() {
        let err = RestError::RateLimitTooLong {
            route: "POST /channels/{channel}/messages".to_string(),
            is_global: false,
            retry_after: Duration::from_secs(90),
            max_retry_after: Duration::from_secs(60),
            limit: Some(5),
            period: Some(Duration::from_secs(5)),
        };
        assert_eq!(err.remaining(), Some(0));
        assert!(err.to_string().contains("[is_global=false]"));
        assert_eq!(err.status(), None);
    }
}
