//! Rate limiting for outbound requests.
//!
//! Three kinds of gates are combined by [`RateLimiter`]:
//! - one [`Bucket`] per discovered service bucket, driven by response headers,
//! - one global [`WindowLimiter`] consumed by every request,
//! - one stricter [`WindowLimiter`] for authentication-sensitive requests.
//!
//! Each gate admits waiters in FIFO order and keeps its own exclusive section,
//! so requests to different buckets never contend with each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketSnapshot, BucketTable};
use crate::config::RestConfig;
use crate::error::{RestError, Result};
use crate::headers::{RateLimitHeaders, RateLimitedResponse, MAX_SERVER_DELAY};
use crate::route::CompiledRoute;

/// A fixed window of `limit` admissions that renews every `period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) limit: u32,
    pub(crate) remaining: u32,
    pub(crate) reset_at: Instant,
    pub(crate) period: Duration,
}

impl Window {
    pub(crate) fn new(limit: u32, period: Duration, now: Instant) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_at: deadline(now, period),
            period,
        }
    }

    /// Admits one request, or returns how long until one could be admitted.
    pub(crate) fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = deadline(now, self.period);
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            Ok(())
        } else {
            Err(self.reset_at - now)
        }
    }

    /// Returns an admission taken in the window that ended at `reset_at`.
    pub(crate) fn refund(&mut self, reset_at: Instant) {
        if self.reset_at == reset_at && self.remaining < self.limit {
            self.remaining += 1;
        }
    }

    pub(crate) fn exhaust_for(&mut self, now: Instant, delay: Duration) {
        self.remaining = 0;
        self.reset_at = deadline(now, delay);
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn deadline(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_SERVER_DELAY))
        .unwrap_or(now)
}

/// Waits in FIFO order until `attempt` admits the caller.
///
/// The queue lock is held for the whole wait, so later arrivals cannot
/// overtake. `attempt` runs under the gate's own state lock; a `notify`
/// wakes the waiter early when the state is overwritten.
pub(crate) async fn wait_turn<F>(
    queue: &tokio::sync::Mutex<()>,
    notify: &Notify,
    max_wait: Duration,
    mut attempt: F,
) -> std::result::Result<(), Duration>
where
    F: FnMut(Instant) -> std::result::Result<(), Duration>,
{
    let _turn = queue.lock().await;
    loop {
        let notified = notify.notified();
        let wait = match attempt(Instant::now()) {
            Ok(()) => return Ok(()),
            Err(wait) => wait,
        };
        if wait > max_wait {
            return Err(wait);
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = notified => {}
        }
    }
}

/// Point-in-time view of a [`WindowLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Admissions per window.
    pub capacity: u32,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// Time until the current window ends.
    pub resets_in: Duration,
    /// Configured window length.
    pub period: Duration,
}

/// A fixed-window gate: at most `capacity` admissions per `period`.
///
/// Used for the process-wide global limit, the authentication-sensitive
/// limit, and by the gateway for identify and command pacing.
pub struct WindowLimiter {
    name: &'static str,
    queue: tokio::sync::Mutex<()>,
    notify: Notify,
    state: Mutex<Window>,
}

impl WindowLimiter {
    /// Creates a limiter. A zero capacity is treated as one.
    pub fn new(name: &'static str, capacity: u32, period: Duration) -> Self {
        let mut window = Window::new(capacity.max(1), period, Instant::now());
        window.reset_at = Instant::now();
        Self {
            name,
            queue: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
            state: Mutex::new(window),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for one admission.
    ///
    /// Fails immediately with the required wait if it would exceed `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> std::result::Result<(), Duration> {
        wait_turn(&self.queue, &self.notify, max_wait, |now| {
            let mut window = self.lock_state();
            let taken = window.try_take(now);
            if let Err(wait) = taken {
                debug!(limiter = self.name, wait_ms = wait.as_millis() as u64, "window exhausted, waiting");
            }
            taken
        })
        .await
    }

    /// Admits one request without waiting, if possible.
    pub fn try_acquire(&self) -> bool {
        self.lock_state().try_take(Instant::now()).is_ok()
    }

    /// Blocks every admission for `retry_after`, overriding local accounting.
    pub fn throttle(&self, retry_after: Duration) {
        self.lock_state().exhaust_for(Instant::now(), retry_after);
        self.notify.notify_waiters();
    }

    /// Returns current state.
    pub fn snapshot(&self) -> WindowSnapshot {
        let window = self.lock_state();
        let now = Instant::now();
        let (remaining, resets_in) = if now >= window.reset_at {
            (window.limit, Duration::ZERO)
        } else {
            (window.remaining, window.reset_at - now)
        };
        WindowSnapshot {
            capacity: window.limit,
            remaining,
            resets_in,
            period: window.period,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for WindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowLimiter")
            .field("name", &self.name)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Admission granted by [`RateLimiter::acquire`].
///
/// Hand it back through [`RateLimiter::release`] with the response outcome.
#[derive(Debug)]
pub struct Ticket {
    route: CompiledRoute,
    bucket_key: String,
    bucket: Arc<Bucket>,
}

impl Ticket {
    /// Route the ticket was issued for.
    pub fn route(&self) -> &CompiledRoute {
        &self.route
    }

    /// Bucket key the request was admitted under.
    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }
}

/// What happened to a request admitted with a [`Ticket`].
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// A response arrived; carries its bucket headers, if any.
    Completed(Option<RateLimitHeaders>),
    /// The service answered 429.
    RateLimited(RateLimitedResponse),
    /// No response arrived.
    Failed,
}

/// Per-bucket, global and authentication-sensitive admission control.
pub struct RateLimiter {
    table: BucketTable,
    global: WindowLimiter,
    auth: WindowLimiter,
    max_wait: Duration,
}

impl RateLimiter {
    /// Creates a limiter from the REST configuration.
    pub fn new(config: &RestConfig) -> Self {
        Self {
            table: BucketTable::new(),
            global: WindowLimiter::new("global", config.global_capacity, config.global_period()),
            auth: WindowLimiter::new("auth", config.auth_capacity, config.auth_period()),
            max_wait: config.max_rate_limit(),
        }
    }

    /// The bucket table.
    pub fn table(&self) -> &BucketTable {
        &self.table
    }

    /// The global gate.
    pub fn global(&self) -> &WindowLimiter {
        &self.global
    }

    /// The authentication-sensitive gate.
    pub fn auth(&self) -> &WindowLimiter {
        &self.auth
    }

    /// Longest wait accepted before failing fast.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Waits for admission through the bucket gate, then the
    /// authentication-sensitive gate if requested, then the global gate.
    ///
    /// Fails fast with [`RestError::RateLimitTooLong`] when any gate would
    /// need longer than the configured ceiling. Dropping the returned future
    /// gives back anything acquired so far.
    pub async fn acquire(&self, route: &CompiledRoute, auth_sensitive: bool) -> Result<Ticket> {
        let (bucket_key, bucket) = self.table.resolve(route);

        let permit = bucket.acquire(self.max_wait).await.map_err(|wait| {
            let snapshot = bucket.snapshot();
            too_long(route, false, wait, self.max_wait, snapshot.limit, Some(snapshot.period))
        })?;

        if auth_sensitive {
            self.acquire_window(&self.auth, route).await?;
        }
        self.acquire_window(&self.global, route).await?;

        permit.commit();
        Ok(Ticket {
            route: route.clone(),
            bucket_key,
            bucket,
        })
    }

    async fn acquire_window(&self, window: &WindowLimiter, route: &CompiledRoute) -> Result<()> {
        window.acquire(self.max_wait).await.map_err(|wait| {
            let snapshot = window.snapshot();
            too_long(
                route,
                true,
                wait,
                self.max_wait,
                Some(snapshot.capacity),
                Some(snapshot.period),
            )
        })
    }

    /// Feeds the response outcome back into the bucket table.
    ///
    /// Server-reported state always overwrites the local prediction.
    pub fn release(&self, ticket: Ticket, outcome: ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Completed(Some(headers)) => {
                let bucket = match headers.bucket.as_deref() {
                    Some(hash) => self.table.discover(&ticket.route, hash),
                    None => ticket.bucket,
                };
                bucket.update(&headers);
            }
            ReleaseOutcome::Completed(None) | ReleaseOutcome::Failed => {}
            ReleaseOutcome::RateLimited(limited) => {
                warn!(
                    route = %ticket.route,
                    bucket = %ticket.bucket_key,
                    retry_after_ms = limited.retry_after.as_millis() as u64,
                    is_global = limited.is_global,
                    scope = limited.scope.as_deref().unwrap_or("unknown"),
                    "received 429, local rate limit state was wrong"
                );
                if limited.is_global {
                    self.global.throttle(limited.retry_after);
                    return;
                }
                let bucket = match limited.bucket.as_ref().and_then(|h| h.bucket.as_deref()) {
                    Some(hash) => self.table.discover(&ticket.route, hash),
                    None => ticket.bucket,
                };
                if let Some(headers) = limited.bucket.as_ref() {
                    bucket.update(headers);
                }
                bucket.throttle(limited.retry_after);
            }
        }
    }

    /// Current state of the bucket `route` resolves to.
    pub fn bucket_snapshot(&self, route: &CompiledRoute) -> BucketSnapshot {
        self.table.resolve(route).1.snapshot()
    }
}

fn too_long(
    route: &CompiledRoute,
    is_global: bool,
    retry_after: Duration,
    max_retry_after: Duration,
    limit: Option<u32>,
    period: Option<Duration>,
) -> RestError {
    RestError::RateLimitTooLong {
        route: route.to_string(),
        is_global,
        retry_after,
        max_retry_after,
        limit,
        period,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Method, Route};

    fn config(max_secs: u64) -> RestConfig {
        RestConfig {
            max_rate_limit_secs: max_secs,
            global_capacity: 50,
            global_period_ms: 1_000,
            auth_capacity: 2,
            auth_period_ms: 10_000,
            ..Default::default()
        }
    }

    fn channel_route(channel: &str) -> CompiledRoute {
        Route::new(Method::Post, "/channels/{channel}/messages")
            .compile(&[("channel", channel)])
            .unwrap()
    }

    fn bucket_headers(hash: &str, limit: u32, remaining: u32, reset_ms: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: Some(hash.to_string()),
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(Duration::from_millis(reset_ms)),
        }
    }

    #[test]
    fn test_window_try_take() {
        let now = Instant::now();
        let mut window = Window::new(2, Duration::from_secs(1), now);
        assert!(window.try_take(now).is_ok());
        assert!(window.try_take(now).is_ok());
        assert_eq!(window.try_take(now), Err(Duration::from_secs(1)));
        assert!(window.try_take(now + Duration::from_secs(1)).is_ok());
        assert_eq!(window.remaining, 1);
    }

    #[test]
    fn test_window_refund_same_window_only() {
        let now = Instant::now();
        let mut window = Window::new(1, Duration::from_secs(1), now);
        let reset_at = window.reset_at;
        window.try_take(now).unwrap();
        window.refund(reset_at);
        assert_eq!(window.remaining, 1);

        window.try_take(now).unwrap();
        window.refund(reset_at + Duration::from_secs(5));
        assert_eq!(window.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limiter_waits_for_reset() {
        let limiter = WindowLimiter::new("test", 2, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(Duration::from_secs(5)).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limiter_rejects_long_wait() {
        let limiter = WindowLimiter::new("test", 1, Duration::from_secs(10));
        limiter.acquire(Duration::from_secs(1)).await.unwrap();
        let wait = limiter.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limiter_throttle_overrides() {
        let limiter = WindowLimiter::new("test", 100, Duration::from_secs(1));
        limiter.throttle(Duration::from_secs(3));
        assert!(!limiter.try_acquire());
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.resets_in, Duration::from_secs(3));
    }

    #[test]
    fn test_window_limiter_zero_capacity() {
        let limiter = WindowLimiter::new("test", 0, Duration::from_secs(1));
        assert_eq!(limiter.snapshot().capacity, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_bucket_admits_freely() {
        let limiter = RateLimiter::new(&config(60));
        let route = channel_route("1");
        for _ in 0..10 {
            let ticket = limiter.acquire(&route, false).await.unwrap();
            assert!(ticket.bucket_key().starts_with("UNKNOWN;"));
            limiter.release(ticket, ReleaseOutcome::Completed(None));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_overwrites_bucket() {
        let limiter = RateLimiter::new(&config(60));
        let route = channel_route("1");

        let ticket = limiter.acquire(&route, false).await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::Completed(Some(bucket_headers("abc", 5, 4, 2_000))),
        );

        let snapshot = limiter.bucket_snapshot(&route);
        assert_eq!(snapshot.hash.as_deref(), Some("abc"));
        assert_eq!(snapshot.limit, Some(5));
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.reset_after, Duration::from_secs(2));

        let ticket = limiter.acquire(&route, false).await.unwrap();
        assert_eq!(ticket.bucket_key(), "abc;1");
        assert_eq!(limiter.bucket_snapshot(&route).remaining, 3);

        // Server says more remain than predicted; server wins.
        limiter.release(
            ticket,
            ReleaseOutcome::Completed(Some(bucket_headers("abc", 5, 4, 1_500))),
        );
        let snapshot = limiter.bucket_snapshot(&route);
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.reset_after, Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_too_long_fails_fast() {
        let limiter = RateLimiter::new(&config(1));
        let route = channel_route("1");

        let ticket = limiter.acquire(&route, false).await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::Completed(Some(bucket_headers("abc", 1, 0, 30_000))),
        );

        let start = Instant::now();
        let err = limiter.acquire(&route, false).await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::ZERO);
        match err {
            RestError::RateLimitTooLong {
                is_global,
                retry_after,
                limit,
                ..
            } => {
                assert!(!is_global);
                assert_eq!(retry_after, Duration::from_secs(30));
                assert_eq!(limit, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_gate_is_stricter() {
        let limiter = RateLimiter::new(&config(1));
        let route = channel_route("1");
        for _ in 0..2 {
            let ticket = limiter.acquire(&route, true).await.unwrap();
            limiter.release(ticket, ReleaseOutcome::Failed);
        }
        let err = limiter.acquire(&route, true).await.unwrap_err();
        assert!(matches!(err, RestError::RateLimitTooLong { is_global: true, .. }));

        // Non-sensitive requests are unaffected by the auth window.
        assert!(limiter.acquire(&route, false).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_global_refunds_bucket() {
        let limiter = RateLimiter::new(&config(1));
        let route = channel_route("1");
        let ticket = limiter.acquire(&route, false).await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::Completed(Some(bucket_headers("abc", 5, 5, 60_000))),
        );
        limiter.global().throttle(Duration::from_secs(30));

        assert!(limiter.acquire(&route, false).await.is_err());
        assert_eq!(limiter.bucket_snapshot(&route).remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_429_leaves_global_untouched() {
        let limiter = RateLimiter::new(&config(60));
        let route = channel_route("1");
        let ticket = limiter.acquire(&route, false).await.unwrap();
        let before = limiter.global().snapshot();

        limiter.release(
            ticket,
            ReleaseOutcome::RateLimited(RateLimitedResponse {
                retry_after: Duration::from_millis(2_500),
                is_global: false,
                scope: Some("user".to_string()),
                message: String::new(),
                bucket: Some(bucket_headers("abc", 5, 0, 2_500)),
            }),
        );

        assert_eq!(limiter.global().snapshot(), before);
        let snapshot = limiter.bucket_snapshot(&route);
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.reset_after, Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_429_throttles_global_only() {
        let limiter = RateLimiter::new(&config(60));
        let route = channel_route("1");
        let ticket = limiter.acquire(&route, false).await.unwrap();
        limiter.release(
            ticket,
            ReleaseOutcome::RateLimited(RateLimitedResponse {
                retry_after: Duration::from_secs(4),
                is_global: true,
                scope: Some("global".to_string()),
                message: String::new(),
                bucket: None,
            }),
        );
        assert_eq!(limiter.global().snapshot().resets_in, Duration::from_secs(4));

        let other = channel_route("2");
        let start = Instant::now();
        let ticket = limiter.acquire(&other, false).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
        limiter.release(ticket, ReleaseOutcome::Failed);
    }
}
