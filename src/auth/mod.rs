//! Credential sources
//!
//! Each authentication mode produces the `Authorization` header for outbound
//! requests. The private-key mode exchanges a signed assertion for a bearer
//! token and caches it; the static modes hand out a fixed header.

mod jwt;

pub use jwt::{ClientAssertionClaims, PrivateKeyJwt};

use std::fmt;

use async_trait::async_trait;
use reqwest::header::HeaderValue;

use crate::transport::RequestContext;
use crate::{Error, Result};

/// Selected authentication strategy
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// `Authorization: SSWS <token>`
    ApiToken(String),
    /// `Authorization: Bearer <token>`, issued elsewhere
    AccessToken(String),
    /// OAuth client credentials with a private-key JWT assertion
    PrivateKey {
        /// OAuth client id
        client_id: String,
        /// PEM-encoded private key
        private_key: String,
        /// Key id placed in the assertion header
        private_key_id: Option<String>,
        /// Requested scopes
        scopes: Vec<String>,
    },
}

impl AuthMode {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApiToken(_) => "api_token",
            Self::AccessToken(_) => "access_token",
            Self::PrivateKey { .. } => "private_key",
        }
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiToken(_) => f.write_str("ApiToken([REDACTED])"),
            Self::AccessToken(_) => f.write_str("AccessToken([REDACTED])"),
            Self::PrivateKey {
                client_id,
                private_key_id,
                scopes,
                ..
            } => f
                .debug_struct("PrivateKey")
                .field("client_id", client_id)
                .field("private_key", &"[REDACTED]")
                .field("private_key_id", private_key_id)
                .field("scopes", scopes)
                .finish(),
        }
    }
}

/// Produces the `Authorization` header for API requests
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Header value for the next request
    async fn authorization(&self, ctx: &RequestContext) -> Result<HeaderValue>;

    /// Drop the cached credential if it is still `rejected`.
    ///
    /// Returns `true` when a fresh credential can be obtained, meaning the
    /// rejected request is worth replaying.
    fn invalidate(&self, _rejected: &HeaderValue) -> bool {
        false
    }
}

/// Fixed `SSWS` or `Bearer` header
pub struct StaticCredentials {
    header: HeaderValue,
}

impl StaticCredentials {
    /// `SSWS` API token
    ///
    /// # Errors
    ///
    /// Returns an error if the token contains characters not allowed in a
    /// header.
    pub fn api_token(token: &str) -> Result<Self> {
        Self::with_scheme("SSWS", token)
    }

    /// Pre-issued bearer token
    ///
    /// # Errors
    ///
    /// Returns an error if the token contains characters not allowed in a
    /// header.
    pub fn access_token(token: &str) -> Result<Self> {
        Self::with_scheme("Bearer", token)
    }

    fn with_scheme(scheme: &str, token: &str) -> Result<Self> {
        let mut header = HeaderValue::from_str(&format!("{scheme} {}", token.trim()))
            .map_err(|_| Error::Config(format!("{scheme} token contains invalid characters")))?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("header", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn authorization(&self, _ctx: &RequestContext) -> Result<HeaderValue> {
        Ok(self.header.clone())
    }
}
