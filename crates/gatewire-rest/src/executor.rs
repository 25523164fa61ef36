//! The request executor.
//!
//! Drives one request through rate-limit admission, transmission, response
//! classification and bucket update, retrying where the failure allows it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RestConfig;
use crate::error::{HttpErrorDetail, RestError, Result};
use crate::headers::{RateLimitHeaders, RateLimitedResponse};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::ratelimit::{RateLimiter, ReleaseOutcome};
use crate::retry::RetryExecutor;
use crate::route::CompiledRoute;

/// Header carrying the audit-log reason of a moderation action.
pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// An outbound request.
#[derive(Debug, Clone)]
pub struct RestRequest {
    /// Target route.
    pub route: CompiledRoute,
    /// JSON body.
    pub body: Option<Value>,
    /// Query parameters, appended url-encoded.
    pub query: Vec<(String, String)>,
    /// Audit-log reason.
    pub reason: Option<String>,
    /// Passes the stricter authentication-sensitive gate when set.
    pub auth_sensitive: bool,
}

impl RestRequest {
    /// A bodiless request to `route`.
    pub fn new(route: CompiledRoute) -> Self {
        Self {
            route,
            body: None,
            query: Vec::new(),
            reason: None,
            auth_sensitive: false,
        }
    }

    /// Sets a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Sets the audit-log reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Marks the request as authentication-sensitive.
    pub fn auth_sensitive(mut self) -> Self {
        self.auth_sensitive = true;
        self
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    /// Status code, always 2xx.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

impl RestResponse {
    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// True when the body is empty (for example a 204).
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// A request with everything computed that does not change between attempts.
#[derive(Debug)]
struct Prepared {
    method: http::Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

/// Executes requests against the REST API under rate limits.
///
/// Cloning is cheap; clones share the rate limiter, the transport and the
/// shutdown signal.
#[derive(Clone)]
pub struct RestExecutor {
    config: Arc<RestConfig>,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    cancel: CancellationToken,
}

impl RestExecutor {
    /// Creates an executor backed by `reqwest`.
    pub fn new(config: RestConfig) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::new()))
    }

    /// Creates an executor with a custom transport.
    pub fn with_transport(config: RestConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config));
        let retry = RetryExecutor::new(config.retry.clone());
        Self {
            config: Arc::new(config),
            transport,
            limiter,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// The shared rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Executes `request` and returns the successful response.
    ///
    /// 429s are retried after the server-given delay up to
    /// `max_rate_limit_retries` times; 5xx and transport failures are retried
    /// with backoff per the retry policy; other 4xx fail immediately.
    pub async fn execute(&self, request: RestRequest) -> Result<RestResponse> {
        if self.cancel.is_cancelled() {
            return Err(RestError::Cancelled);
        }
        let prepared = self.prepare(&request)?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(route = %request.route, "request cancelled by shutdown");
                Err(RestError::Cancelled)
            }
            outcome = self.retry.execute(|| self.attempt(&request, &prepared)) => {
                outcome.into_result()
            }
        }
    }

    /// Executes `request` and decodes the JSON body.
    pub async fn execute_json<T: DeserializeOwned>(&self, request: RestRequest) -> Result<T> {
        self.execute(request).await?.json()
    }

    /// One attempt as seen by the retry policy. Rate-limited responses are
    /// retried inside the attempt on their own schedule.
    async fn attempt(&self, request: &RestRequest, prepared: &Prepared) -> Result<RestResponse> {
        let mut rate_limited = 0u32;
        loop {
            let ticket = self
                .limiter
                .acquire(&request.route, request.auth_sensitive)
                .await?;

            let response = match self.transport.send(self.to_http(prepared)).await {
                Ok(response) => response,
                Err(e) => {
                    self.limiter.release(ticket, ReleaseOutcome::Failed);
                    return Err(e);
                }
            };

            if response.status == 429 {
                let limited = RateLimitedResponse::parse(&response.headers, &response.body);
                let retry_after = limited.retry_after;
                let is_global = limited.is_global;
                self.limiter.release(ticket, ReleaseOutcome::RateLimited(limited));

                rate_limited += 1;
                if retry_after > self.limiter.max_wait() {
                    return Err(RestError::RateLimitTooLong {
                        route: request.route.to_string(),
                        is_global,
                        retry_after,
                        max_retry_after: self.limiter.max_wait(),
                        limit: None,
                        period: None,
                    });
                }
                if rate_limited > self.config.max_rate_limit_retries {
                    return Err(RestError::RateLimited {
                        route: request.route.to_string(),
                        retry_after,
                        is_global,
                    });
                }
                // The throttled gate now holds the next acquire back.
                continue;
            }

            let headers = RateLimitHeaders::parse(&response.headers);
            self.limiter.release(ticket, ReleaseOutcome::Completed(headers));
            return classify(prepared, response);
        }
    }

    fn prepare(&self, request: &RestRequest) -> Result<Prepared> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(USER_AGENT.as_str(), &self.config.user_agent)?);
        if let Some(authorization) = self.config.authorization() {
            let mut value = header_value(AUTHORIZATION.as_str(), &authorization)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(reason) = &request.reason {
            headers.insert(
                HeaderName::from_static(AUDIT_LOG_REASON),
                header_value(AUDIT_LOG_REASON, &urlencoding::encode(reason))?,
            );
        }

        let body = match &request.body {
            Some(body) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(Bytes::from(serde_json::to_vec(body)?))
            }
            None => None,
        };

        Ok(Prepared {
            method: request.route.method().into(),
            url: request.route.url(&self.config.base_url, &request.query),
            headers,
            body,
        })
    }

    fn to_http(&self, prepared: &Prepared) -> HttpRequest {
        HttpRequest {
            method: prepared.method.clone(),
            url: prepared.url.clone(),
            headers: prepared.headers.clone(),
            body: prepared.body.clone(),
            timeout: self.config.request_timeout(),
        }
    }

    /// Periodically drops idle buckets until shutdown.
    pub fn spawn_bucket_gc(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.table().purge_expired();
                    }
                }
            }
        })
    }

    /// Cancels every in-flight and future request. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("shutting down rest executor");
            self.cancel.cancel();
        }
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for RestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExecutor")
            .field("base_url", &self.config.base_url)
            .field("buckets", &self.limiter.table().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn classify(prepared: &Prepared, response: HttpResponse) -> Result<RestResponse> {
    if response.is_success() {
        return Ok(RestResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        });
    }

    let detail = HttpErrorDetail::from_body(prepared.url.clone(), response.status, &response.body);
    let error = RestError::from_status(detail);
    if response.status >= 500 {
        warn!(url = %prepared.url, status = response.status, "server error");
    } else {
        debug!(url = %prepared.url, status = response.status, "client error");
    }
    Err(error)
}

fn header_value(header: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| RestError::InvalidHeader {
        header: header.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Method, Route};

    fn route() -> CompiledRoute {
        Route::new(Method::Post, "/channels/{channel}/messages")
            .compile(&[("channel", "1")])
            .unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = RestRequest::new(route())
            .json(&serde_json::json!({"content": "hi"}))
            .unwrap()
            .query("wait", true)
            .reason("cleanup")
            .auth_sensitive();
        assert_eq!(request.query, vec![("wait".to_string(), "true".to_string())]);
        assert_eq!(request.reason.as_deref(), Some("cleanup"));
        assert!(request.auth_sensitive);
        assert!(request.body.is_some());
    }

    #[test]
    fn test_prepare_headers() {
        let executor = RestExecutor::new(RestConfig {
            base_url: "https://api.test/v10".to_string(),
            token: Some("secret".to_string()),
            ..Default::default()
        });
        let request = RestRequest::new(route())
            .json(&serde_json::json!({"content": "hi"}))
            .unwrap()
            .reason("spam cleanup");
        let prepared = executor.prepare(&request).unwrap();

        assert_eq!(prepared.url, "https://api.test/v10/channels/1/messages");
        assert_eq!(prepared.method, http::Method::POST);
        assert_eq!(prepared.headers[AUTHORIZATION], "Bot secret");
        assert!(prepared.headers[AUTHORIZATION].is_sensitive());
        assert_eq!(prepared.headers[CONTENT_TYPE], "application/json");
        assert_eq!(prepared.headers[AUDIT_LOG_REASON], "spam%20cleanup");
        assert_eq!(prepared.body.as_deref(), Some(&br#"{"content":"hi"}"#[..]));
    }

    #[test]
    fn test_prepare_rejects_bad_token() {
        let executor = RestExecutor::new(RestConfig {
            token: Some("bad\ntoken".to_string()),
            ..Default::default()
        });
        let err = executor.prepare(&RestRequest::new(route())).unwrap_err();
        assert!(matches!(err, RestError::InvalidHeader { ref header, .. } if header == "authorization"));
        assert!(!crate::error::is_retryable(&err));
    }

    #[tokio::test]
    async fn test_execute_after_shutdown() {
        let executor = RestExecutor::new(RestConfig::default());
        executor.shutdown();
        executor.shutdown();
        assert!(executor.is_shut_down());
        let err = executor.execute(RestRequest::new(route())).await.unwrap_err();
        assert!(matches!(err, RestError::Cancelled));
    }
}
