//! Private-key JWT client credentials
//!
//! A short-lived assertion signed with the configured key is exchanged at the
//! org's token endpoint for a bearer token. The token is cached until shortly
//! before it expires and shared by every client built from the same
//! provider, so one refresh serves them all.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::CredentialSource;
use crate::transport::{ApiRequest, RequestContext, Transport};
use crate::{Error, Result};

const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a signed assertion
const ASSERTION_TTL_SECS: i64 = 3600;

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Used when the token response omits `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Claims of the client assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// Issuer, the client id
    pub iss: String,
    /// Subject, the client id
    pub sub: String,
    /// Audience, the token endpoint
    pub aud: String,
    /// Issued at (epoch seconds)
    pub iat: i64,
    /// Expiry (epoch seconds)
    pub exp: i64,
    /// Unique assertion id
    pub jti: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    header: HeaderValue,
    expires_at: Instant,
}

/// Credential source for the private-key mode
pub struct PrivateKeyJwt {
    client_id: String,
    key: EncodingKey,
    key_id: Option<String>,
    scopes: Vec<String>,
    token_url: Url,
    transport: Arc<dyn Transport>,
    cache: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl PrivateKeyJwt {
    /// Create a source that exchanges assertions at `token_url` through
    /// `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if `private_key` is not a PEM-encoded RSA key.
    pub fn new(
        client_id: impl Into<String>,
        private_key: &str,
        key_id: Option<String>,
        scopes: Vec<String>,
        token_url: Url,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key.trim().as_bytes())
            .map_err(|e| Error::Auth(format!("Invalid private key: {e}")))?;

        Ok(Self {
            client_id: client_id.into(),
            key,
            key_id: key_id.filter(|k| !k.is_empty()),
            scopes,
            token_url,
            transport,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    /// Token endpoint assertions are exchanged at
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Sign a fresh client assertion
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn mint_assertion(&self) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = ClientAssertionClaims {
            iss: self.client_id.clone(),
            sub: self.client_id.clone(),
            aud: self.token_url.to_string(),
            iat,
            exp: iat + ASSERTION_TTL_SECS,
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid.clone_from(&self.key_id);

        encode(&header, &claims, &self.key)
            .map_err(|e| Error::Auth(format!("Signing client assertion failed: {e}")))
    }

    fn cached(&self) -> Option<HeaderValue> {
        self.cache
            .read()
            .as_ref()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.header.clone())
    }

    async fn exchange(&self, ctx: &RequestContext) -> Result<CachedToken> {
        let assertion = self.mint_assertion()?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("client_assertion_type", ASSERTION_TYPE)
            .append_pair("client_assertion", &assertion)
            .finish();

        let request = ApiRequest::new(Method::POST, self.token_url.clone())
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .with_header(ACCEPT, HeaderValue::from_static("application/json"))
            .with_body(body)
            .idempotent(true);

        debug!(client_id = %self.client_id, url = %self.token_url, "Requesting access token");
        let response = self.transport.round_trip(&request, ctx).await?;

        if !response.status.is_success() {
            let detail = match response.json::<TokenErrorResponse>() {
                Ok(TokenErrorResponse {
                    error: Some(error),
                    error_description,
                }) => match error_description {
                    Some(description) => format!("{error}: {description}"),
                    None => error,
                },
                _ => response.text(),
            };
            return Err(Error::Auth(format!(
                "Token request failed ({}): {detail}",
                response.status
            )));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| Error::Auth(format!("Invalid token response: {e}")))?;
        let scheme = token.token_type.as_deref().unwrap_or("Bearer");
        let mut header = HeaderValue::from_str(&format!("{scheme} {}", token.access_token))
            .map_err(|_| Error::Auth("Access token contains invalid characters".to_string()))?;
        header.set_sensitive(true);

        let ttl = token
            .expires_in
            .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs)
            .saturating_sub(EXPIRY_SKEW);

        info!(
            client_id = %self.client_id,
            scope = token.scope.as_deref().unwrap_or_default(),
            expires_in_secs = ttl.as_secs(),
            "Obtained access token"
        );

        Ok(CachedToken {
            header,
            expires_at: Instant::now() + ttl,
        })
    }
}

impl fmt::Debug for PrivateKeyJwt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKeyJwt")
            .field("client_id", &self.client_id)
            .field("key", &"[REDACTED]")
            .field("key_id", &self.key_id)
            .field("scopes", &self.scopes)
            .field("token_url", &self.token_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialSource for PrivateKeyJwt {
    async fn authorization(&self, ctx: &RequestContext) -> Result<HeaderValue> {
        if let Some(header) = self.cached() {
            return Ok(header);
        }

        // Concurrent callers wait for a single exchange instead of each
        // minting their own token.
        let _gate = ctx.run(async { Ok(self.refresh.lock().await) }).await?;
        if let Some(header) = self.cached() {
            return Ok(header);
        }

        let token = self.exchange(ctx).await?;
        let header = token.header.clone();
        *self.cache.write() = Some(token);
        Ok(header)
    }

    fn invalidate(&self, rejected: &HeaderValue) -> bool {
        let mut cache = self.cache.write();
        // A token refreshed since the rejected request went out stays.
        if cache.as_ref().is_some_and(|t| t.header == *rejected) {
            debug!(client_id = %self.client_id, "Discarding cached access token");
            *cache = None;
        }
        true
    }
}
