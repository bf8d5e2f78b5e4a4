//! End-to-end transport tests against a local HTTP server
//!
//! The retry transport runs over the real reqwest-backed base transport so
//! headers, bodies and timing go through the network stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use reqwest::Method;
use tokio::net::TcpListener;
use url::Url;

use okta_provider_core::USER_AGENT;
use okta_provider_core::error::Error;
use okta_provider_core::ratelimit::{EndpointResolver, RateLimitGovernor};
use okta_provider_core::transport::{
    ApiRequest, HttpTransport, RequestContext, RetryPolicy, RetryTransport, Transport,
};

#[derive(Default)]
struct Recorded {
    calls: AtomicUsize,
    bodies: Mutex<Vec<Bytes>>,
    user_agents: Mutex<Vec<String>>,
}

type Shared = Arc<Recorded>;

async fn spawn(app: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

fn retrying(policy: RetryPolicy) -> RetryTransport {
    let base = Arc::new(HttpTransport::new(USER_AGENT, None).unwrap());
    RetryTransport::new(
        base,
        Arc::new(RateLimitGovernor::new(100, policy.max_wait)),
        EndpointResolver::embedded(),
        policy,
    )
}

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// First call is throttled until the next second, every later call succeeds
async fn throttle_once(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> (StatusCode, HeaderMap, &'static str) {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().push(body);
    if let Some(agent) = headers.get("user-agent").and_then(|v| v.to_str().ok()) {
        state.user_agents.lock().push(agent.to_string());
    }

    let mut reply = HeaderMap::new();
    reply.insert("x-rate-limit-limit", HeaderValue::from(10));
    reply.insert("x-rate-limit-reset", HeaderValue::from(epoch_now() + 1));
    if call == 0 {
        reply.insert("x-rate-limit-remaining", HeaderValue::from(0));
        (StatusCode::TOO_MANY_REQUESTS, reply, r#"{"errorCode":"E0000047"}"#)
    } else {
        reply.insert("x-rate-limit-remaining", HeaderValue::from(9));
        (StatusCode::OK, reply, r#"{"id":"00u1"}"#)
    }
}

async fn always_throttled(State(state): State<Shared>) -> (StatusCode, HeaderMap, &'static str) {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let mut reply = HeaderMap::new();
    reply.insert("retry-after", HeaderValue::from(0));
    (StatusCode::TOO_MANY_REQUESTS, reply, "")
}

async fn unavailable_once(State(state): State<Shared>) -> (StatusCode, &'static str) {
    if state.calls.fetch_add(1, Ordering::SeqCst) == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "")
    } else {
        (StatusCode::OK, "[]")
    }
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(true, max_retries, Duration::ZERO, Duration::from_secs(5))
}

/// Test that a 429 with a reset hint is retried once the window has passed
#[tokio::test]
async fn test_retry_on_429_with_reset() {
    let state = Shared::default();
    let base = spawn(
        Router::new()
            .route("/api/v1/users", post(throttle_once))
            .with_state(Arc::clone(&state)),
    )
    .await;

    let transport = retrying(RetryPolicy::new(
        true,
        3,
        Duration::from_secs(1),
        Duration::from_secs(5),
    ));
    let request = ApiRequest::new(Method::POST, base.join("/api/v1/users").unwrap())
        .with_body(r#"{"profile":{"login":"a@example.com"}}"#);

    let started = Instant::now();
    let response = transport
        .round_trip(&request, &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_secs(1));

    let bodies = state.bodies.lock();
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(&bodies[0][..], br#"{"profile":{"login":"a@example.com"}}"#);

    let bucket = transport.governor().snapshot("users-create").unwrap();
    assert_eq!(bucket.limit, 10);
}

/// Test that persistent throttling stops after max_retries + 1 attempts
#[tokio::test]
async fn test_retry_bound() {
    let state = Shared::default();
    let base = spawn(
        Router::new()
            .route("/api/v1/groups", get(always_throttled))
            .with_state(Arc::clone(&state)),
    )
    .await;

    let request = ApiRequest::new(Method::GET, base.join("/api/v1/groups").unwrap());
    let err = retrying(fast_policy(2))
        .round_trip(&request, &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RateLimited { attempts: 3, .. }), "{err}");
    assert!(err.to_string().starts_with("rate-limit"));
    assert_eq!(state.calls.load(Ordering::SeqCst), 3);
}

/// Test that 5xx is retried for reads but surfaced for creates
#[tokio::test]
async fn test_server_error_idempotency() {
    let state = Shared::default();
    let base = spawn(
        Router::new()
            .route("/api/v1/apps", get(unavailable_once).post(unavailable_once))
            .with_state(Arc::clone(&state)),
    )
    .await;
    let url = base.join("/api/v1/apps").unwrap();
    let transport = retrying(fast_policy(3));

    let created = transport
        .round_trip(
            &ApiRequest::new(Method::POST, url.clone()).with_body("{}"),
            &RequestContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(created.status.as_u16(), 503);
    assert_eq!(state.calls.load(Ordering::SeqCst), 1);

    state.calls.store(0, Ordering::SeqCst);
    let listed = transport
        .round_trip(&ApiRequest::new(Method::GET, url), &RequestContext::new())
        .await
        .unwrap();
    assert_eq!(listed.status.as_u16(), 200);
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);
}

/// Test that every request identifies the client
#[tokio::test]
async fn test_user_agent_is_sent() {
    let state = Shared::default();
    let base = spawn(
        Router::new()
            .route("/api/v1/users", post(throttle_once))
            .with_state(Arc::clone(&state)),
    )
    .await;
    state.calls.store(1, Ordering::SeqCst);

    let request = ApiRequest::new(Method::POST, base.join("/api/v1/users").unwrap());
    retrying(fast_policy(0))
        .round_trip(&request, &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(state.user_agents.lock().as_slice(), [USER_AGENT.to_string()]);
}

/// Test that the request timeout bounds a slow response
#[tokio::test]
async fn test_request_timeout() {
    let base = spawn(Router::new().route("/api/v1/logs", get(slow))).await;
    let request = ApiRequest::new(Method::GET, base.join("/api/v1/logs").unwrap());
    let ctx = RequestContext::new().with_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = retrying(fast_policy(3))
        .round_trip(&request, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DeadlineExceeded), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Test that connection failures surface as transport errors after retries
#[tokio::test]
async fn test_connection_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("http://{addr}/api/v1/users")).unwrap();
    let err = retrying(fast_policy(1))
        .round_trip(&ApiRequest::new(Method::GET, url), &RequestContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
}
