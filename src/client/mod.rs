//! API clients sharing one transport chain and credential source

mod error;

pub(crate) use error::api_error;

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::auth::CredentialSource;
use crate::transport::{ApiRequest, ApiResponse, RequestContext, Transport};
use crate::{Error, Result};

/// Path prefix of the access-governance surface
pub const GOVERNANCE_BASE_PATH: &str = "/governance/api/v1";

/// State shared by every client of one provider instance
pub struct ClientContext {
    org_url: Url,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    permits: Semaphore,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl ClientContext {
    /// Create a context.
    ///
    /// At most `parallelism` calls are in flight at once; each holds its
    /// slot for all of its retries. A zero `request_timeout` means no bound.
    #[must_use]
    pub fn new(
        org_url: Url,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        parallelism: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            org_url,
            transport,
            credentials,
            permits: Semaphore::new(parallelism.max(1)),
            request_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie every request to `cancel`
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Org base URL
    #[must_use]
    pub fn org_url(&self) -> &Url {
        &self.org_url
    }

    /// Token cancelling all requests of this context
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fresh context for one logical call
    #[must_use]
    pub fn request_context(&self) -> RequestContext {
        RequestContext::with_cancellation(self.cancel.child_token()).with_timeout(self.request_timeout)
    }
}

/// REST client rooted at a base path of the org
#[derive(Clone)]
pub struct ApiClient {
    context: Arc<ClientContext>,
    base_path: &'static str,
}

impl ApiClient {
    fn new(context: Arc<ClientContext>, base_path: &'static str) -> Self {
        Self { context, base_path }
    }

    /// Shared context
    #[must_use]
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    /// Absolute URL for `path` (which may carry a query string)
    ///
    /// # Errors
    ///
    /// Returns an error if the result is not a valid URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        let full = format!("{}/{}", self.base_path, path.trim_start_matches('/'));
        self.context
            .org_url
            .join(&full)
            .map_err(|e| Error::Internal(format!("Invalid request path {full}: {e}")))
    }

    /// Request builder for `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built.
    pub fn request(&self, method: Method, path: &str) -> Result<ApiRequest> {
        Ok(ApiRequest::new(method, self.url(path)?)
            .with_header(ACCEPT, HeaderValue::from_static("application/json")))
    }

    /// Send a request and return the response whatever its status.
    ///
    /// A 401 makes the credential source drop its cached token; if it can
    /// mint a new one the request is replayed once.
    ///
    /// # Errors
    ///
    /// Returns transport, rate-limit, credential and cancellation errors.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let ctx = self.context.request_context();
        let _permit = ctx
            .run(async {
                self.context
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::Internal("request gate closed".to_string()))
            })
            .await?;

        let (used, response) = self.dispatch(&request, &ctx).await?;
        if response.status == StatusCode::UNAUTHORIZED && self.context.credentials.invalidate(&used) {
            debug!(url = %request.url, "Credential rejected, retrying with a fresh token");
            return self.dispatch(&request, &ctx).await.map(|(_, response)| response);
        }
        Ok(response)
    }

    /// Send with the current credential; returns the header that was used
    async fn dispatch(
        &self,
        request: &ApiRequest,
        ctx: &RequestContext,
    ) -> Result<(HeaderValue, ApiResponse)> {
        let mut request = request.clone();
        let authorization = self.context.credentials.authorization(ctx).await?;
        request.headers.insert(AUTHORIZATION, authorization.clone());
        let response = self.context.transport.round_trip(&request, ctx).await?;
        Ok((authorization, response))
    }

    /// Send a request, turning error statuses into [`Error::Api`]
    ///
    /// # Errors
    ///
    /// Returns the remote error for non-2xx responses, plus everything
    /// [`send`](Self::send) can return.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self.send(request).await?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(api_error(&response))
        }
    }

    /// `GET` and decode
    ///
    /// # Errors
    ///
    /// Returns remote errors and decoding failures.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(self.request(Method::GET, path)?).await?.json()
    }

    /// `POST` a JSON body and decode the reply
    ///
    /// # Errors
    ///
    /// Returns remote errors and (de)serialization failures.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, path)?.with_json(body)?;
        self.execute(request).await?.json()
    }

    /// `PUT` a JSON body and decode the reply
    ///
    /// # Errors
    ///
    /// Returns remote errors and (de)serialization failures.
    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::PUT, path)?.with_json(body)?;
        self.execute(request).await?.json()
    }

    /// `DELETE`; a resource that is already gone counts as deleted
    ///
    /// # Errors
    ///
    /// Returns remote errors other than 404.
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self.execute(self.request(Method::DELETE, path)?).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read a single resource, `None` if it does not exist.
    ///
    /// Both a 404 and a successful `{}` or `[]` body mean "not found".
    ///
    /// # Errors
    ///
    /// Returns other remote errors and decoding failures.
    pub async fn get_resource<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status.is_success() {
            return Err(api_error(&response));
        }
        if response.is_empty_envelope() {
            debug!(path, "Empty body, treating resource as missing");
            return Ok(None);
        }
        response.json().map(Some)
    }

    /// Whether the org exposes the endpoint at `path`.
    ///
    /// Authorization failures and 404 mean the feature is unavailable.
    ///
    /// # Errors
    ///
    /// Returns any other remote or transport error.
    pub async fn check_feature(&self, path: &str) -> Result<bool> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        match response.status {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!(path, status = response.status.as_u16(), "Feature unavailable");
                Ok(false)
            }
            _ => Err(api_error(&response)),
        }
    }
}

/// Client for the identity-as-a-service REST surface
#[derive(Clone)]
pub struct IdaasClient(ApiClient);

impl IdaasClient {
    /// Create a client rooted at the org
    #[must_use]
    pub fn new(context: Arc<ClientContext>) -> Self {
        Self(ApiClient::new(context, ""))
    }

    /// The user the credentials belong to
    ///
    /// # Errors
    ///
    /// Returns the remote error, typically 401 for a bad token.
    pub async fn current_user(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/users/me").await
    }
}

impl Deref for IdaasClient {
    type Target = ApiClient;

    fn deref(&self) -> &ApiClient {
        &self.0
    }
}

/// Client for the access-governance surface on the same host
#[derive(Clone)]
pub struct GovernanceClient(ApiClient);

impl GovernanceClient {
    /// Create a client rooted at `/governance/api/v1`
    #[must_use]
    pub fn new(context: Arc<ClientContext>) -> Self {
        Self(ApiClient::new(context, GOVERNANCE_BASE_PATH))
    }
}

impl Deref for GovernanceClient {
    type Target = ApiClient;

    fn deref(&self) -> &ApiClient {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderMap;

    use super::*;
    use crate::auth::StaticCredentials;

    #[derive(Default)]
    struct Recorder {
        replies: Mutex<VecDeque<ApiResponse>>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn round_trip(&self, request: &ApiRequest, _ctx: &RequestContext) -> Result<ApiResponse> {
            self.seen.lock().push(request.clone());
            Ok(self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| reply(200, "{}")))
        }
    }

    fn reply(status: u16, body: &'static str) -> ApiResponse {
        ApiResponse::new(StatusCode::from_u16(status).unwrap(), HeaderMap::new(), body)
    }

    fn context(replies: Vec<ApiResponse>) -> (Arc<Recorder>, Arc<ClientContext>) {
        let recorder = Arc::new(Recorder {
            replies: Mutex::new(replies.into()),
            ..Recorder::default()
        });
        let context = ClientContext::new(
            Url::parse("https://acme.okta.com").unwrap(),
            Arc::clone(&recorder) as Arc<dyn Transport>,
            Arc::new(StaticCredentials::api_token("00tok").unwrap()),
            1,
            Duration::ZERO,
        );
        (recorder, Arc::new(context))
    }

    #[test]
    fn urls_respect_base_path() {
        let (_, ctx) = context(Vec::new());
        let idaas = IdaasClient::new(Arc::clone(&ctx));
        let governance = GovernanceClient::new(ctx);
        assert_eq!(
            idaas.url("/api/v1/users?limit=2").unwrap().as_str(),
            "https://acme.okta.com/api/v1/users?limit=2"
        );
        assert_eq!(
            governance.url("campaigns/c1").unwrap().as_str(),
            "https://acme.okta.com/governance/api/v1/campaigns/c1"
        );
    }

    #[tokio::test]
    async fn requests_carry_authorization() {
        let (recorder, ctx) = context(vec![reply(200, r#"{"id":"00u1"}"#)]);
        let user = IdaasClient::new(ctx).current_user().await.unwrap();
        assert_eq!(user["id"], "00u1");
        let seen = recorder.seen.lock();
        assert_eq!(seen[0].headers[AUTHORIZATION], "SSWS 00tok");
        assert_eq!(seen[0].headers[ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn missing_resources_are_none() {
        let (_, ctx) = context(vec![
            reply(404, r#"{"errorCode":"E0000007","errorSummary":"Not found"}"#),
            reply(200, "{}"),
            reply(200, "[]"),
            reply(200, r#"{"id":"0oa1"}"#),
        ]);
        let client = IdaasClient::new(ctx);
        for _ in 0..3 {
            let found: Option<serde_json::Value> = client.get_resource("/api/v1/apps/0oa1").await.unwrap();
            assert!(found.is_none());
        }
        let found: Option<serde_json::Value> = client.get_resource("/api/v1/apps/0oa1").await.unwrap();
        assert_eq!(found.unwrap()["id"], "0oa1");
    }

    #[tokio::test]
    async fn feature_check_swallows_authorization_failures() {
        let (_, ctx) = context(vec![reply(401, ""), reply(403, ""), reply(200, "[]"), reply(500, "")]);
        let client = IdaasClient::new(ctx);
        assert!(!client.check_feature("/api/v1/features").await.unwrap());
        assert!(!client.check_feature("/api/v1/features").await.unwrap());
        assert!(client.check_feature("/api/v1/features").await.unwrap());
        let err = client.check_feature("/api/v1/features").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn static_token_is_not_replayed_on_401() {
        let (recorder, ctx) = context(vec![reply(401, r#"{"errorCode":"E0000011","errorSummary":"Invalid token provided"}"#)]);
        let err = IdaasClient::new(ctx).current_user().await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(err.to_string().contains("Invalid token provided"));
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    /// Hands out `Bearer t1`, `Bearer t2`, ... and records what was rejected
    #[derive(Default)]
    struct Rotating {
        issued: Mutex<u32>,
        rejected: Mutex<Vec<HeaderValue>>,
    }

    #[async_trait]
    impl CredentialSource for Rotating {
        async fn authorization(&self, _ctx: &RequestContext) -> Result<HeaderValue> {
            let mut issued = self.issued.lock();
            *issued += 1;
            Ok(HeaderValue::from_str(&format!("Bearer t{issued}")).unwrap())
        }

        fn invalidate(&self, rejected: &HeaderValue) -> bool {
            self.rejected.lock().push(rejected.clone());
            true
        }
    }

    #[tokio::test]
    async fn rejected_token_is_named_and_replayed_once() {
        let recorder = Arc::new(Recorder {
            replies: Mutex::new(vec![reply(401, ""), reply(401, "")].into()),
            ..Recorder::default()
        });
        let credentials = Arc::new(Rotating::default());
        let ctx = Arc::new(ClientContext::new(
            Url::parse("https://acme.okta.com").unwrap(),
            Arc::clone(&recorder) as Arc<dyn Transport>,
            Arc::clone(&credentials) as Arc<dyn CredentialSource>,
            1,
            Duration::ZERO,
        ));

        let err = IdaasClient::new(ctx).current_user().await.unwrap_err();
        assert_eq!(err.status(), Some(401));

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].headers[AUTHORIZATION], "Bearer t1");
        assert_eq!(seen[1].headers[AUTHORIZATION], "Bearer t2");
        assert_eq!(*credentials.rejected.lock(), vec![HeaderValue::from_static("Bearer t1")]);
    }

    #[tokio::test]
    async fn delete_of_missing_resource_succeeds() {
        let (_, ctx) = context(vec![reply(404, ""), reply(400, r#"{"errorSummary":"bad"}"#)]);
        let client = IdaasClient::new(ctx);
        client.delete("/api/v1/groups/00g1").await.unwrap();
        assert!(client.delete("/api/v1/groups/00g1").await.is_err());
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let (recorder, ctx) = context(Vec::new());
        ctx.cancellation().cancel();
        let err = IdaasClient::new(ctx).current_user().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(recorder.seen.lock().is_empty());
    }
}
