//! Provider assembly
//!
//! Turns a validated [`ProviderConfig`] into the shared transport chain
//! `base -> retry/rate-limit`, one credential source and the two API clients
//! built on top of them.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{AuthMode, CredentialSource, PrivateKeyJwt, StaticCredentials};
use crate::client::{ClientContext, GovernanceClient, IdaasClient};
use crate::config::ProviderConfig;
use crate::ratelimit::{EndpointResolver, RateLimitGovernor};
use crate::transport::{HttpTransport, RetryTransport, Transport};
use crate::{Error, Result, USER_AGENT};

/// Which engine the org runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrgFlavor {
    /// Classic engine
    #[default]
    Classic,
    /// Identity engine
    IdentityEngine,
}

impl OrgFlavor {
    /// Lower-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::IdentityEngine => "identity-engine",
        }
    }
}

impl fmt::Display for OrgFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct OrganizationMetadata {
    pipeline: Option<String>,
}

/// Builder for [`ProviderContext`]
pub struct ProviderBuilder {
    config: ProviderConfig,
    endpoint: Option<Url>,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<EndpointResolver>>,
    cancel: CancellationToken,
}

impl ProviderBuilder {
    /// Talk to `endpoint` instead of `https://{org_name}.{base_url}`
    #[must_use]
    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Replace the network-facing transport (the retry layer still wraps it)
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom bucket table instead of the embedded one
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Cancel every request when `cancel` fires
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration, assemble the clients and, for API tokens,
    /// verify the credentials with one request.
    ///
    /// # Errors
    ///
    /// Returns configuration errors before any request is made, and the
    /// verification failure for a rejected API token.
    pub async fn build(self) -> Result<ProviderContext> {
        self.config.validate()?;
        let mode = self.config.auth_mode()?;

        let org_url = match self.endpoint {
            Some(url) => url,
            None => self.config.org_url()?,
        };

        let base: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(USER_AGENT, self.config.proxy_url()?.as_ref())?),
        };
        let governor = Arc::new(RateLimitGovernor::new(
            self.config.max_api_capacity,
            self.config.max_wait(),
        ));
        let transport: Arc<dyn Transport> = Arc::new(RetryTransport::new(
            base,
            Arc::clone(&governor),
            self.resolver.unwrap_or_else(EndpointResolver::embedded),
            self.config.retry_policy(),
        ));

        let credentials: Arc<dyn CredentialSource> = match &mode {
            AuthMode::ApiToken(token) => Arc::new(StaticCredentials::api_token(token)?),
            AuthMode::AccessToken(token) => Arc::new(StaticCredentials::access_token(token)?),
            AuthMode::PrivateKey {
                client_id,
                private_key,
                private_key_id,
                scopes,
            } => {
                let token_url = org_url
                    .join("/oauth2/v1/token")
                    .map_err(|e| Error::Config(format!("Invalid token endpoint: {e}")))?;
                Arc::new(PrivateKeyJwt::new(
                    client_id.clone(),
                    private_key,
                    private_key_id.clone(),
                    scopes.clone(),
                    token_url,
                    Arc::clone(&transport),
                )?)
            }
        };

        let context = Arc::new(
            ClientContext::new(
                org_url,
                transport,
                credentials,
                self.config.parallelism,
                self.config.request_timeout(),
            )
            .with_cancellation(self.cancel),
        );

        let provider = ProviderContext {
            idaas: IdaasClient::new(Arc::clone(&context)),
            governance: GovernanceClient::new(context),
            governor,
            mode: mode.name(),
            flavor: OnceCell::new(),
            config: self.config,
        };

        if matches!(mode, AuthMode::ApiToken(_)) {
            provider.verify_credentials().await?;
        }

        info!(
            org = %provider.org_url(),
            auth = provider.mode,
            "Provider configured"
        );
        Ok(provider)
    }
}

/// Everything a resource handler needs to talk to the org
pub struct ProviderContext {
    config: ProviderConfig,
    idaas: IdaasClient,
    governance: GovernanceClient,
    governor: Arc<RateLimitGovernor>,
    mode: &'static str,
    flavor: OnceCell<OrgFlavor>,
}

impl ProviderContext {
    /// Start building a provider from `config`
    #[must_use]
    pub fn builder(config: ProviderConfig) -> ProviderBuilder {
        ProviderBuilder {
            config,
            endpoint: None,
            transport: None,
            resolver: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build with the default transport and endpoint
    ///
    /// # Errors
    ///
    /// See [`ProviderBuilder::build`].
    pub async fn configure(config: ProviderConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Identity API client
    #[must_use]
    pub fn idaas(&self) -> &IdaasClient {
        &self.idaas
    }

    /// Governance API client
    #[must_use]
    pub fn governance(&self) -> &GovernanceClient {
        &self.governance
    }

    /// Rate-limit state shared by both clients
    #[must_use]
    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Org base URL
    #[must_use]
    pub fn org_url(&self) -> &Url {
        self.idaas.context().org_url()
    }

    /// Name of the selected authentication mode
    #[must_use]
    pub fn auth_mode(&self) -> &'static str {
        self.mode
    }

    async fn verify_credentials(&self) -> Result<()> {
        match self.idaas.current_user().await {
            Ok(_) => {
                debug!("API token verified");
                Ok(())
            }
            Err(e @ Error::Api { .. }) => Err(Error::Auth(format!("API token rejected: {e}"))),
            Err(e) => Err(e),
        }
    }

    /// Engine flavor of the org, discovered on first use.
    ///
    /// A failed discovery is not retried and reports [`OrgFlavor::Classic`].
    pub async fn org_flavor(&self) -> OrgFlavor {
        *self
            .flavor
            .get_or_init(|| async {
                match self
                    .idaas
                    .get_json::<OrganizationMetadata>("/.well-known/okta-organization")
                    .await
                {
                    Ok(meta) if meta.pipeline.as_deref() == Some("idx") => OrgFlavor::IdentityEngine,
                    Ok(_) => OrgFlavor::Classic,
                    Err(e) => {
                        warn!(error = %e, "Org flavor discovery failed, assuming classic");
                        OrgFlavor::Classic
                    }
                }
            })
            .await
    }

    /// Whether the org runs the classic engine
    pub async fn is_classic_org(&self) -> bool {
        self.org_flavor().await == OrgFlavor::Classic
    }
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("org_url", &self.org_url().as_str())
            .field("auth_mode", &self.mode)
            .field("flavor", &self.flavor.get())
            .finish_non_exhaustive()
    }
}
