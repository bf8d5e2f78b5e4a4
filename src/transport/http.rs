//! Base HTTP transport over a pooled reqwest client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderValue, USER_AGENT};
use tracing::trace;
use url::Url;

use super::{ApiRequest, ApiResponse, RequestContext, Transport};
use crate::{Error, Result};

/// Sends requests straight to the network.
///
/// No retries and no rate limiting happen here; wrap it in a
/// [`RetryTransport`](super::RetryTransport) for that.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    user_agent: HeaderValue,
}

impl HttpTransport {
    /// Create a transport, optionally routed through `proxy`.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy URL is rejected or the client cannot be
    /// built.
    pub fn new(user_agent: &str, proxy: Option<&Url>) -> Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| Error::Config(format!("Invalid http_proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|e| Error::Config(format!("Invalid user agent: {e}")))?;

        Ok(Self { client, user_agent })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: &ApiRequest, ctx: &RequestContext) -> Result<ApiResponse> {
        let mut headers = request.headers.clone();
        headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        trace!(method = %request.method, url = %request.url, "Sending request");

        ctx.run(async {
            let response = builder.send().await.map_err(|e| {
                Error::Transport(format!("{} {}: {e}", request.method, request.url))
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| {
                Error::Transport(format!("Reading response from {}: {e}", request.url))
            })?;
            trace!(status = status.as_u16(), bytes = body.len(), "Received response");
            Ok(ApiResponse::new(status, headers, body))
        })
        .await
    }
}
