//! HTTP transport chain
//!
//! Requests flow `client -> RetryTransport -> HttpTransport -> network`.
//! Every layer implements [`Transport`], so tests can swap the network for a
//! scripted fake and the retry layer can wrap any base transport.

mod http;
mod retry;

pub use self::http::HttpTransport;
pub use self::retry::{RetryPolicy, RetryTransport};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Error, Result};

/// A single HTTP exchange
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the buffered response.
    ///
    /// Implementations must give up promptly when `ctx` is cancelled or its
    /// deadline passes.
    async fn round_trip(&self, request: &ApiRequest, ctx: &RequestContext) -> Result<ApiResponse>;
}

/// Outbound request with a replayable body
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Body, captured once; cloning hands every attempt the same bytes
    pub body: Option<Bytes>,
    /// Whether repeating the request is free of extra side effects
    pub idempotent: bool,
}

impl ApiRequest {
    /// Create a request; reads and deletes are marked idempotent
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        let idempotent = matches!(
            method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE
        );
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            idempotent,
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a raw body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a JSON body
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body))
    }

    /// Override the idempotency marking
    #[must_use]
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// Buffered response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Create a response
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Decode the body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as lossy UTF-8
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// True for a literal `{}` or `[]` body, which the API returns for some
    /// lookups of resources that no longer exist
    #[must_use]
    pub fn is_empty_envelope(&self) -> bool {
        matches!(self.body.trim_ascii(), b"{}" | b"[]")
    }
}

/// Cancellation and deadline shared by every suspension point of a request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no deadline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an existing cancellation token
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Bound the whole request, retries included; zero means no bound
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        }
        self
    }

    /// Deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token that cancels this request
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast if the request is already over
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `DeadlineExceeded`.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires, or `DeadlineExceeded` if the
    /// deadline falls inside the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let wake = Instant::now() + duration;
        let (until, past_deadline) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };

        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep_until(until) => {
                if past_deadline {
                    Err(Error::DeadlineExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drive `fut` unless the request is cancelled or times out first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled`, `DeadlineExceeded`, or the future's own error.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = deadline => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}
