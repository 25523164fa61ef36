#![warn(missing_docs)]

//! Gatewire REST subsystem: route compilation, bucket discovery, rate-limited request execution
//!
//! Request path: Route → Compile → Resolve bucket → Bucket gate → Auth gate → Global gate → Send → Classify → Update bucket

pub mod bucket;
pub mod config;
pub mod error;
pub mod executor;
pub mod headers;
pub mod transport;
pub mod ratelimit;
pub mod retry;
pub mod route;

pub use bucket::{Bucket, BucketSnapshot, BucketTable};
pub use config::{RestConfig, RetryConfig};
pub use error::{is_retryable, HttpErrorDetail, RestError, Result};
pub use executor::{RestExecutor, RestRequest, RestResponse};
pub use headers::{RateLimitHeaders, RateLimitedResponse, MAX_SERVER_DELAY};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use ratelimit::{RateLimiter, ReleaseOutcome, Ticket, WindowLimiter, WindowSnapshot};
pub use retry::{RetryExecutor, RetryOutcome};
pub use route::{CompiledRoute, Method, Route};
