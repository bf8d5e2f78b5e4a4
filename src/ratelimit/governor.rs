//! Adaptive per-bucket rate-limit governor
//!
//! Budget state is learned from the `X-Rate-Limit-*` response headers and
//! consulted before each request. A bucket nobody has heard from yet admits
//! everything; the first response populates it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tracing::{debug, trace};

/// Remote capacity header
pub const LIMIT_HEADER: &str = "x-rate-limit-limit";
/// Remote remaining-credits header
pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
/// Remote window reset header (epoch seconds)
pub const RESET_HEADER: &str = "x-rate-limit-reset";

/// Seconds in a rate-limit window, used when the local view rolls it forward.
const WINDOW_SECS: i64 = 60;

/// Budget view of a single bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Window capacity
    pub limit: u64,
    /// Credits left in the current window
    pub remaining: u64,
    /// Epoch seconds at which the window rolls
    pub reset_at: i64,
    /// When the state last changed
    pub last_updated: Instant,
}

/// Parsed `X-Rate-Limit-*` triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `X-Rate-Limit-Limit`
    pub limit: u64,
    /// `X-Rate-Limit-Remaining`
    pub remaining: u64,
    /// `X-Rate-Limit-Reset`
    pub reset: i64,
}

impl RateLimitHeaders {
    /// Extract the triple; `None` unless all three are present and numeric.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Some(Self {
            limit: header_number(headers, LIMIT_HEADER)?,
            remaining: header_number(headers, REMAINING_HEADER)?,
            reset: header_number(headers, RESET_HEADER)?,
        })
    }
}

/// Numeric header value
pub(crate) fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Time from `now` until the epoch-seconds instant `at`, zero if passed
pub(crate) fn until_epoch(at: i64, now: DateTime<Utc>) -> Duration {
    let millis = at.saturating_mul(1000).saturating_sub(now.timestamp_millis());
    u64::try_from(millis).map_or(Duration::ZERO, Duration::from_millis)
}

/// Per-bucket admission control driven by remote hints
#[derive(Debug)]
pub struct RateLimitGovernor {
    buckets: DashMap<String, Arc<Mutex<BucketState>>>,
    capacity_fraction: f64,
    max_wait: Duration,
}

impl RateLimitGovernor {
    /// Create a governor using `max_api_capacity` percent of each bucket.
    ///
    /// The percentage is clamped to 1..=100.
    #[must_use]
    pub fn new(max_api_capacity: u8, max_wait: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity_fraction: f64::from(max_api_capacity.clamp(1, 100)) / 100.0,
            max_wait,
        }
    }

    /// Credits this client may still spend out of `remaining`.
    ///
    /// Floors, so with a 50% share a single remaining credit admits nothing.
    #[must_use]
    pub fn effective_remaining(&self, remaining: u64) -> u64 {
        (remaining as f64 * self.capacity_fraction).floor() as u64
    }

    /// Ask to send one request against `bucket`.
    ///
    /// Returns zero and reserves a credit when capacity remains, otherwise the
    /// time until the bucket resets, capped at `max_wait`. With a zero
    /// `max_wait` an exhausted bucket also yields zero: the request goes out
    /// unthrottled and any 429 is left to the retry schedule.
    pub fn admit(&self, bucket: &str, now: DateTime<Utc>) -> Duration {
        let Some(entry) = self.buckets.get(bucket).map(|e| Arc::clone(e.value())) else {
            trace!(bucket, "Unobserved bucket, admitting");
            return Duration::ZERO;
        };
        let mut state = entry.lock();

        if now.timestamp() >= state.reset_at {
            state.remaining = state.limit;
            state.reset_at = now.timestamp() + WINDOW_SECS;
            state.last_updated = Instant::now();
        }

        if self.effective_remaining(state.remaining) > 0 {
            state.remaining -= 1;
            return Duration::ZERO;
        }

        let wait = until_epoch(state.reset_at, now).min(self.max_wait);
        debug!(
            bucket,
            remaining = state.remaining,
            limit = state.limit,
            wait_ms = wait.as_millis(),
            "Bucket exhausted, delaying request"
        );
        wait
    }

    /// Fold a response's rate-limit headers into the bucket.
    ///
    /// Responses without the full header triple leave the bucket untouched.
    pub fn observe(&self, bucket: &str, headers: &HeaderMap, status: u16, now: DateTime<Utc>) {
        let Some(hint) = RateLimitHeaders::from_headers(headers) else {
            return;
        };

        let reset_at = hint.reset.max(now.timestamp());
        let mut remaining = hint.remaining.min(hint.limit);
        if status == 429 {
            remaining = 0;
        }

        let entry = Arc::clone(
            self.buckets
                .entry(bucket.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(BucketState {
                        limit: hint.limit,
                        remaining,
                        reset_at,
                        last_updated: Instant::now(),
                    }))
                })
                .value(),
        );
        let mut state = entry.lock();

        // Within one window the budget only shrinks; a late response must not
        // hand back credits already spent.
        if state.reset_at == reset_at {
            state.remaining = state.remaining.min(remaining);
        } else {
            state.remaining = remaining;
            state.reset_at = reset_at;
        }
        state.limit = hint.limit;
        state.remaining = state.remaining.min(state.limit);
        state.last_updated = Instant::now();

        trace!(
            bucket,
            limit = state.limit,
            remaining = state.remaining,
            reset_at = state.reset_at,
            "Updated bucket from response"
        );
    }

    /// Current state of a bucket, if it has been observed
    #[must_use]
    pub fn snapshot(&self, bucket: &str) -> Option<BucketState> {
        self.buckets.get(bucket).map(|e| *e.value().lock())
    }
}
