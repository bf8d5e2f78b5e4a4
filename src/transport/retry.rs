//! Rate-limit aware retry transport
//!
//! Every attempt is first admitted by the [`RateLimitGovernor`] for the
//! request's bucket, then dispatched, and its response headers are folded back
//! into the governor. Throttled responses, transport failures and (for
//! idempotent requests) server errors are retried on an exponential schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{DATE, HeaderMap, RETRY_AFTER};
use tracing::{debug, warn};

use super::{ApiRequest, ApiResponse, RequestContext, Transport};
use crate::ratelimit::{EndpointResolver, RESET_HEADER, RateLimitGovernor, header_number};
use crate::{Error, Result};

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whether throttled or failed requests are retried at all
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff delay
    pub min_wait: Duration,
    /// Upper bound for any single delay
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            min_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub fn new(enabled: bool, max_retries: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            enabled,
            max_retries,
            min_wait,
            max_wait,
        }
    }

    /// Delays `min_wait`, `2 * min_wait`, `4 * min_wait`, ... capped at `max_wait`
    #[must_use]
    pub fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.min_wait)
            .with_max_delay(self.max_wait)
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
            .build()
    }

    /// Whether another attempt may follow attempt number `attempts`
    fn allows_retry_after(&self, attempts: u32) -> bool {
        self.enabled && attempts <= self.max_retries
    }
}

enum Verdict {
    Done,
    Throttled(Option<Duration>),
    ServerError,
}

fn classify(response: &ApiResponse, idempotent: bool, now: DateTime<Utc>) -> Verdict {
    if response.status == StatusCode::TOO_MANY_REQUESTS {
        Verdict::Throttled(throttle_hint(&response.headers, now))
    } else if response.status.is_server_error() && idempotent {
        Verdict::ServerError
    } else {
        Verdict::Done
    }
}

/// Delay requested by a throttled response.
///
/// `Retry-After` wins. Otherwise the reset epoch is measured against the
/// response's own `Date` (falling back to `now`) plus one second of slack, so
/// a retry never lands in the window that rejected it.
pub(crate) fn throttle_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(seconds) = header_number::<u64>(headers, RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(seconds));
    }

    let reset: i64 = header_number(headers, RESET_HEADER)?;
    let reference = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map_or(now.timestamp(), |d| d.timestamp());
    let seconds = u64::try_from(reset.saturating_sub(reference).saturating_add(1))
        .unwrap_or(0)
        .max(1);
    Some(Duration::from_secs(seconds))
}

fn is_retryable(error: &Error) -> bool {
    matches!(error, Error::Transport(_) | Error::Http(_))
}

/// Transport that admits, dispatches, observes and retries
pub struct RetryTransport {
    inner: Arc<dyn Transport>,
    governor: Arc<RateLimitGovernor>,
    resolver: Arc<EndpointResolver>,
    policy: RetryPolicy,
}

impl RetryTransport {
    /// Wrap `inner`
    #[must_use]
    pub fn new(
        inner: Arc<dyn Transport>,
        governor: Arc<RateLimitGovernor>,
        resolver: Arc<EndpointResolver>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            governor,
            resolver,
            policy,
        }
    }

    /// Governor shared with other transports of the same provider
    #[must_use]
    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    /// Retry schedule in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn round_trip(&self, request: &ApiRequest, ctx: &RequestContext) -> Result<ApiResponse> {
        let endpoint = self
            .resolver
            .resolve(request.method.as_str(), request.url.path());
        let bucket = endpoint.bucket;
        let mut backoff = self.policy.create_backoff();
        let mut attempts = 0u32;

        loop {
            let admission = self.governor.admit(&bucket, Utc::now());
            if !admission.is_zero() {
                debug!(
                    bucket = %bucket,
                    path = %endpoint.canonical_path,
                    wait_ms = admission.as_millis(),
                    "Waiting for rate-limit window"
                );
                ctx.sleep(admission).await?;
            }

            // The body is an immutable `Bytes`, so every attempt sends the
            // same payload from the start.
            attempts += 1;
            let outcome = self.inner.round_trip(request, ctx).await;

            let delay = match outcome {
                Ok(response) => {
                    let now = Utc::now();
                    self.governor
                        .observe(&bucket, &response.headers, response.status.as_u16(), now);

                    match classify(&response, request.idempotent, now) {
                        Verdict::Done => return Ok(response),
                        Verdict::Throttled(_) if !self.policy.allows_retry_after(attempts) => {
                            warn!(bucket = %bucket, attempts, "Giving up on throttled request");
                            return Err(Error::RateLimited { bucket, attempts });
                        }
                        Verdict::ServerError if !self.policy.allows_retry_after(attempts) => {
                            return Ok(response);
                        }
                        Verdict::Throttled(hint) => {
                            hint.unwrap_or_else(|| next_delay(&mut backoff, &self.policy))
                        }
                        Verdict::ServerError => next_delay(&mut backoff, &self.policy),
                    }
                }
                Err(e) if is_retryable(&e) && self.policy.allows_retry_after(attempts) => {
                    debug!(error = %e, attempt = attempts, "Transport failure, will retry");
                    next_delay(&mut backoff, &self.policy)
                }
                Err(e) => return Err(e),
            };

            let delay = delay.min(self.policy.max_wait);
            debug!(
                method = %request.method,
                path = %endpoint.canonical_path,
                bucket = %bucket,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                "Retrying after backoff"
            );
            ctx.sleep(delay).await?;
        }
    }
}

fn next_delay(backoff: &mut ExponentialBackoff, policy: &RetryPolicy) -> Duration {
    backoff.next().unwrap_or(policy.max_wait)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use reqwest::Method;
    use reqwest::header::HeaderValue;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::*;
    use crate::ratelimit::{BucketRule, LIMIT_HEADER, REMAINING_HEADER};

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<ApiResponse>>>,
        bodies: Mutex<Vec<Option<Bytes>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ApiResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                bodies: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.bodies.lock().len()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn round_trip(&self, request: &ApiRequest, _ctx: &RequestContext) -> Result<ApiResponse> {
            self.bodies.lock().push(request.body.clone());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(status(200)))
        }
    }

    fn status(code: u16) -> ApiResponse {
        ApiResponse::new(
            StatusCode::from_u16(code).unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        )
    }

    fn throttled(retry_after: u64) -> ApiResponse {
        let mut response = status(429);
        response
            .headers
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }

    fn transport(fake: &Arc<Scripted>, policy: RetryPolicy) -> RetryTransport {
        let resolver = EndpointResolver::from_rules(vec![BucketRule {
            pattern: "/api/v1/users/ID".into(),
            method: "POST".into(),
            bucket: "user-write".into(),
        }]);
        RetryTransport::new(
            Arc::clone(fake) as Arc<dyn Transport>,
            Arc::new(RateLimitGovernor::new(100, policy.max_wait)),
            Arc::new(resolver),
            policy,
        )
    }

    fn policy(max_retries: u32, min: u64, max: u64) -> RetryPolicy {
        RetryPolicy::new(
            true,
            max_retries,
            Duration::from_secs(min),
            Duration::from_secs(max),
        )
    }

    fn request(method: Method) -> ApiRequest {
        let url = Url::parse("https://example.okta.com/api/v1/users/00u1").unwrap();
        ApiRequest::new(method, url).with_body(r#"{"profile":{}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_request_is_replayed_with_same_body() {
        let fake = Scripted::new(vec![Ok(throttled(1)), Ok(status(200))]);
        let started = Instant::now();
        let response = transport(&fake, policy(5, 30, 300))
            .round_trip(&request(Method::POST), &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fake.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
        let bodies = fake.bodies.lock();
        assert_eq!(bodies[0], bodies[1]);
        assert!(bodies[0].is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_throttling_is_bounded() {
        let fake = Scripted::new((0..10).map(|_| Ok(throttled(1))).collect());
        let err = transport(&fake, policy(2, 1, 5))
            .round_trip(&request(Method::POST), &RequestContext::new())
            .await
            .unwrap_err();

        match err {
            Error::RateLimited { bucket, attempts } => {
                assert_eq!(bucket, "user-write");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_backoff_never_retries() {
        let fake = Scripted::new(vec![Ok(throttled(1)), Ok(status(200))]);
        let mut policy = policy(5, 1, 5);
        policy.enabled = false;
        let started = Instant::now();
        let err = transport(&fake, policy)
            .round_trip(&request(Method::GET), &RequestContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RateLimited { attempts: 1, .. }));
        assert_eq!(fake.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_only_when_idempotent() {
        let fake = Scripted::new(vec![Ok(status(503)), Ok(status(200))]);
        let response = transport(&fake, policy(3, 1, 5))
            .round_trip(&request(Method::POST), &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fake.calls(), 1);

        let fake = Scripted::new(vec![Ok(status(503)), Ok(status(200))]);
        let response = transport(&fake, policy(3, 1, 5))
            .round_trip(&request(Method::GET), &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_up_to_max_wait() {
        let fake = Scripted::new((0..3).map(|_| Ok(status(500))).collect());
        let started = Instant::now();
        let response = transport(&fake, policy(3, 1, 3))
            .round_trip(&request(Method::GET), &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fake.calls(), 4);
        // 1s + 2s + 3s (capped)
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried_then_surfaced() {
        let fake = Scripted::new(vec![
            Err(Error::Transport("connection reset".into())),
            Err(Error::Transport("connection reset".into())),
        ]);
        let err = transport(&fake, policy(1, 1, 5))
            .round_trip(&request(Method::POST), &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_returned_untouched() {
        let fake = Scripted::new(vec![Ok(status(400))]);
        let response = transport(&fake, policy(5, 1, 5))
            .round_trip(&request(Method::GET), &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let fake = Scripted::new(vec![Ok(throttled(60))]);
        let token = CancellationToken::new();
        let ctx = RequestContext::with_cancellation(token.clone());
        let retry = transport(&fake, policy(5, 1, 300));
        let request = request(Method::GET);

        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(retry.round_trip(&request, &ctx), canceller);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_admission_wait() {
        let fake = Scripted::new(Vec::new());
        let token = CancellationToken::new();
        let ctx = RequestContext::with_cancellation(token.clone());
        let retry = transport(&fake, policy(5, 1, 300));

        let mut exhausted = HeaderMap::new();
        exhausted.insert(LIMIT_HEADER, HeaderValue::from(10u64));
        exhausted.insert(REMAINING_HEADER, HeaderValue::from(0u64));
        exhausted.insert(RESET_HEADER, HeaderValue::from(Utc::now().timestamp() + 120));
        retry.governor().observe("user-write", &exhausted, 200, Utc::now());

        let request = request(Method::POST);
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(retry.round_trip(&request, &ctx), canceller);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_whole_call() {
        let fake = Scripted::new(vec![Ok(throttled(60))]);
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(2));
        let err = transport(&fake, policy(5, 1, 300))
            .round_trip(&request(Method::GET), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn hint_prefers_retry_after() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from(7u64));
        headers.insert(RESET_HEADER, HeaderValue::from(now.timestamp() + 30));
        assert_eq!(throttle_hint(&headers, now), Some(Duration::from_secs(7)));
    }

    #[test]
    fn hint_from_reset_uses_response_date() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let date = now - chrono::Duration::seconds(5);
        let mut headers = HeaderMap::new();
        headers.insert(RESET_HEADER, HeaderValue::from(now.timestamp() + 1));
        headers.insert(
            DATE,
            HeaderValue::from_str(&date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()).unwrap(),
        );
        assert_eq!(throttle_hint(&headers, now), Some(Duration::from_secs(7)));

        headers.remove(DATE);
        assert_eq!(throttle_hint(&headers, now), Some(Duration::from_secs(2)));
        assert_eq!(throttle_hint(&HeaderMap::new(), now), None);
    }

    #[test]
    fn hint_survives_extreme_reset_values() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(RESET_HEADER, HeaderValue::from(i64::MIN));
        assert_eq!(throttle_hint(&headers, now), Some(Duration::from_secs(1)));

        headers.insert(RESET_HEADER, HeaderValue::from(i64::MAX));
        assert_eq!(
            throttle_hint(&headers, now),
            Some(Duration::from_secs((i64::MAX - 1_699_999_999).unsigned_abs()))
        );
    }
}
