//! Rate-limit buckets and the table that maps routes onto them.
//!
//! Before the service reports a bucket hash for a route, requests are grouped
//! under a provisional key derived from the route and its major parameter.
//! When the hash arrives, the provisional bucket is promoted to the real key
//! (or retired if another one already lives there) so every request sharing
//! the bucket converges on one instance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::headers::RateLimitHeaders;
use crate::ratelimit::{deadline, wait_turn, Window};
use crate::route::CompiledRoute;

#[derive(Debug)]
struct BucketState {
    hash: Option<String>,
    /// `None` until the service has reported a limit.
    window: Option<Window>,
    /// One-shot block from a 429 received while the limit was unknown.
    blocked_until: Option<Instant>,
}

/// Point-in-time view of a [`Bucket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Service-assigned hash, if known.
    pub hash: Option<String>,
    /// Requests per window, `None` while the bucket is still unknown.
    pub limit: Option<u32>,
    /// Requests left in the window. Zero while the limit is unknown.
    pub remaining: u32,
    /// Time until the window resets.
    pub reset_after: Duration,
    /// Longest window observed so far.
    pub period: Duration,
}

/// One service rate-limit bucket.
///
/// Admission is FIFO. An unknown bucket admits every request; once headers
/// have been seen, `remaining` is decremented optimistically and callers wait
/// for the reset when it reaches zero.
pub struct Bucket {
    queue: tokio::sync::Mutex<()>,
    notify: Notify,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(hash: Option<String>) -> Self {
        Self {
            queue: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
            state: Mutex::new(BucketState {
                hash,
                window: None,
                blocked_until: None,
            }),
        }
    }

    /// Waits for one admission, failing with the required wait if it would
    /// exceed `max_wait`.
    pub async fn acquire(
        &self,
        max_wait: Duration,
    ) -> std::result::Result<BucketPermit<'_>, Duration> {
        let mut window_end = None;
        wait_turn(&self.queue, &self.notify, max_wait, |now| {
            let mut state = self.lock_state();
            let hash = state.hash.clone();
            if let Some(until) = state.blocked_until {
                if now < until {
                    return Err(until - now);
                }
                state.blocked_until = None;
            }
            let Some(window) = state.window.as_mut() else {
                return Ok(());
            };
            match window.try_take(now) {
                Ok(()) => {
                    window_end = Some(window.reset_at);
                    Ok(())
                }
                Err(wait) => {
                    debug!(
                        bucket = hash.as_deref().unwrap_or("unknown"),
                        wait_ms = wait.as_millis() as u64,
                        "bucket exhausted, waiting for reset"
                    );
                    Err(wait)
                }
            }
        })
        .await?;

        Ok(BucketPermit {
            bucket: self,
            window_end,
            committed: false,
        })
    }

    /// Overwrites local state with what the service reported.
    pub fn update(&self, headers: &RateLimitHeaders) {
        let now = Instant::now();
        let mut state = self.lock_state();
        if let Some(hash) = &headers.bucket {
            state.hash = Some(hash.clone());
        }

        let current = state.window.clone();
        let Some(limit) = headers.limit.or(current.as_ref().map(|w| w.limit)) else {
            return;
        };
        let limit = limit.max(1);
        let reset_after = headers
            .reset_after
            .or_else(|| current.as_ref().map(|w| w.reset_at.saturating_duration_since(now)))
            .unwrap_or_default();
        let period = current.as_ref().map(|w| w.period).unwrap_or_default().max(reset_after);

        state.window = Some(Window {
            limit,
            remaining: headers.remaining.unwrap_or(limit).min(limit),
            reset_at: deadline(now, reset_after),
            period,
        });
        trace!(
            bucket = state.hash.as_deref().unwrap_or("unknown"),
            limit,
            remaining = headers.remaining,
            reset_after_ms = reset_after.as_millis() as u64,
            "bucket updated"
        );
        drop(state);
        self.notify.notify_waiters();
    }

    /// Blocks the bucket for `retry_after` after a 429.
    ///
    /// A bucket whose limit is still unknown stays unknown; it is only held
    /// back until the delay has passed.
    pub fn throttle(&self, retry_after: Duration) {
        let now = Instant::now();
        let mut state = self.lock_state();
        match state.window.as_mut() {
            Some(window) => window.exhaust_for(now, retry_after),
            None => state.blocked_until = Some(deadline(now, retry_after)),
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Returns current state.
    pub fn snapshot(&self) -> BucketSnapshot {
        let now = Instant::now();
        let state = self.lock_state();
        match &state.window {
            None => BucketSnapshot {
                hash: state.hash.clone(),
                limit: None,
                remaining: 0,
                reset_after: state
                    .blocked_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default(),
                period: Duration::ZERO,
            },
            Some(window) => {
                let expired = now >= window.reset_at;
                BucketSnapshot {
                    hash: state.hash.clone(),
                    limit: Some(window.limit),
                    remaining: if expired { window.limit } else { window.remaining },
                    reset_after: window.reset_at.saturating_duration_since(now),
                    period: window.period,
                }
            }
        }
    }

    fn adopt_hash(&self, hash: &str) {
        let mut state = self.lock_state();
        if state.hash.is_none() {
            state.hash = Some(hash.to_string());
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        let state = self.lock_state();
        let unblocked = state.blocked_until.map_or(true, |until| now >= until);
        match &state.window {
            None => unblocked,
            Some(window) => unblocked && now >= window.reset_at,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("snapshot", &self.snapshot()).finish()
    }
}

/// One admission taken from a [`Bucket`].
///
/// Dropped without [`commit`](BucketPermit::commit), it gives the admission
/// back if the window it was taken from is still current.
#[must_use]
#[derive(Debug)]
pub struct BucketPermit<'a> {
    bucket: &'a Bucket,
    window_end: Option<Instant>,
    committed: bool,
}

impl BucketPermit<'_> {
    /// Keeps the admission; the request is about to be sent.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for BucketPermit<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(end) = self.window_end {
            if let Some(window) = self.bucket.lock_state().window.as_mut() {
                window.refund(end);
            }
        }
    }
}

/// Maps compiled routes to buckets.
#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: DashMap<String, Arc<Bucket>>,
    route_hashes: DashMap<String, String>,
}

impl BucketTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bucket key and bucket for `route`, creating it if needed.
    pub fn resolve(&self, route: &CompiledRoute) -> (String, Arc<Bucket>) {
        let route_key = route.route().key();
        loop {
            if let Some(hash) = self.known_hash(&route_key) {
                return self.promote(route, &hash);
            }

            let key = route.grouping_key();
            let bucket = self
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Bucket::new(None)))
                .clone();
            if !self.route_hashes.contains_key(&route_key) {
                return (key, bucket);
            }
            // The hash was discovered while we were inserting.
            self.buckets.remove_if(&key, |_, b| Arc::ptr_eq(b, &bucket));
        }
    }

    /// Records that the service assigned `hash` to `route` and returns the
    /// bucket now responsible for it.
    pub fn discover(&self, route: &CompiledRoute, hash: &str) -> Arc<Bucket> {
        let route_key = route.route().key();
        if self.known_hash(&route_key).as_deref() != Some(hash) {
            debug!(route = %route_key, hash, "discovered bucket hash");
            self.route_hashes.insert(route_key, hash.to_string());
        }
        self.promote(route, hash).1
    }

    fn promote(&self, route: &CompiledRoute, hash: &str) -> (String, Arc<Bucket>) {
        let provisional = self
            .buckets
            .remove(&route.grouping_key())
            .map(|(_, bucket)| bucket);
        let key = route.bucket_key(hash);
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| match provisional {
                Some(bucket) => {
                    bucket.adopt_hash(hash);
                    bucket
                }
                None => Arc::new(Bucket::new(Some(hash.to_string()))),
            })
            .clone();
        (key, bucket)
    }

    /// Hash the service assigned to a route key (`METHOD template`), if known.
    pub fn known_hash(&self, route_key: &str) -> Option<String> {
        self.route_hashes.get(route_key).map(|h| h.value().clone())
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True if no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drops buckets that nobody holds and whose window has expired.
    ///
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.is_idle(now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "purged expired buckets");
        }
        removed
    }
}
