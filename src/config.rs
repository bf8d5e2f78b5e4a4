//! Provider configuration
//!
//! Values are layered, lowest priority first: built-in defaults, `OKTA_*`
//! environment variables, an optional YAML file, and the attribute map handed
//! over by the host. Empty values never shadow a lower layer, so an attribute
//! the operator left blank falls through to the environment.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Level;
use url::Url;

use crate::auth::AuthMode;
use crate::transport::RetryPolicy;
use crate::{Error, Result};

/// Environment variable -> attribute
const ENV_VARS: [(&str, &str); 9] = [
    ("OKTA_ORG_NAME", "org_name"),
    ("OKTA_BASE_URL", "base_url"),
    ("OKTA_API_TOKEN", "api_token"),
    ("OKTA_ACCESS_TOKEN", "access_token"),
    ("OKTA_API_CLIENT_ID", "client_id"),
    ("OKTA_API_PRIVATE_KEY", "private_key"),
    ("OKTA_API_PRIVATE_KEY_ID", "private_key_id"),
    ("OKTA_API_SCOPES", "scopes"),
    ("OKTA_HTTP_PROXY", "http_proxy"),
];

const MAX_API_CAPACITY_VAR: &str = "MAX_API_CAPACITY";
const TF_LOG_VAR: &str = "TF_LOG";

/// Credential attributes that may not be set together
pub const CONFLICTING_ATTRIBUTES: [(&str, &str); 9] = [
    ("api_token", "access_token"),
    ("api_token", "client_id"),
    ("api_token", "scopes"),
    ("api_token", "private_key"),
    ("api_token", "private_key_id"),
    ("access_token", "client_id"),
    ("access_token", "scopes"),
    ("access_token", "private_key"),
    ("access_token", "private_key_id"),
];

/// Validated provider settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Organization subdomain, e.g. `acme` in `acme.okta.com`
    pub org_name: String,
    /// API domain
    pub base_url: String,
    /// Static API token (`SSWS`)
    pub api_token: Option<String>,
    /// Pre-issued bearer token
    pub access_token: Option<String>,
    /// OAuth client id for the private-key mode
    pub client_id: Option<String>,
    /// Scopes requested in the private-key mode
    pub scopes: Vec<String>,
    /// PEM-encoded private key
    pub private_key: Option<String>,
    /// Key id of `private_key`
    pub private_key_id: Option<String>,
    /// Proxy for all API traffic
    pub http_proxy: Option<String>,
    /// Retry throttled and failed requests
    pub backoff: bool,
    /// First retry delay
    pub min_wait_seconds: u64,
    /// Longest single delay
    pub max_wait_seconds: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Concurrent requests
    pub parallelism: usize,
    /// 1 (trace) to 5 (error)
    pub log_level: u8,
    /// Percentage of each rate-limit bucket this provider may use
    pub max_api_capacity: u8,
    /// Bound on a whole call including retries, 0 for none
    pub request_timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            org_name: String::new(),
            base_url: "okta.com".to_string(),
            api_token: None,
            access_token: None,
            client_id: None,
            scopes: Vec::new(),
            private_key: None,
            private_key_id: None,
            http_proxy: None,
            backoff: true,
            min_wait_seconds: 30,
            max_wait_seconds: 300,
            max_retries: 5,
            parallelism: 1,
            log_level: 5,
            max_api_capacity: 100,
            request_timeout: 0,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("ProviderConfig")
            .field("org_name", &self.org_name)
            .field("base_url", &self.base_url)
            .field("api_token", &redact(&self.api_token))
            .field("access_token", &redact(&self.access_token))
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("private_key", &redact(&self.private_key))
            .field("private_key_id", &self.private_key_id)
            .field("http_proxy", &self.http_proxy)
            .field("backoff", &self.backoff)
            .field("min_wait_seconds", &self.min_wait_seconds)
            .field("max_wait_seconds", &self.max_wait_seconds)
            .field("max_retries", &self.max_retries)
            .field("parallelism", &self.parallelism)
            .field("log_level", &self.log_level)
            .field("max_api_capacity", &self.max_api_capacity)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Load from the process environment, an optional YAML file and the
    /// host's attribute map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed, an attribute is
    /// unknown or has the wrong type, or an environment value cannot be
    /// parsed.
    pub fn load(file: Option<&Path>, attributes: Option<&Value>) -> Result<Self> {
        Self::load_with_env(file, attributes, |name| std::env::var(name).ok())
    }

    /// [`load`](Self::load) with an explicit environment lookup
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_with_env<F>(file: Option<&Path>, attributes: Option<&Value>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Serialized::defaults(env_layer(&env)?));

        if let Some(path) = file {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            let yaml: Value = Figment::from(Yaml::file(path))
                .extract()
                .map_err(|e| Error::Config(e.to_string()))?;
            figment = figment.merge(Serialized::defaults(non_empty(yaml)));
        }

        if let Some(attributes) = attributes {
            figment = figment.merge(Serialized::defaults(non_empty(attributes.clone())));
        }

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(level) = env(TF_LOG_VAR).as_deref().and_then(log_level_from_name) {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Check ranges, required values and credential exclusivity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] naming both attributes for mutually
    /// exclusive credentials, and [`Error::Config`] for everything else.
    pub fn validate(&self) -> Result<()> {
        if self.org_name.trim().is_empty() {
            return Err(Error::Config(
                "org_name is required (or set OKTA_ORG_NAME)".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        range("max_retries", u64::from(self.max_retries), 0, 100)?;
        range("request_timeout", self.request_timeout, 0, 300)?;
        range("log_level", u64::from(self.log_level), 1, 5)?;
        range("max_api_capacity", u64::from(self.max_api_capacity), 1, 100)?;
        if self.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".to_string()));
        }
        if self.min_wait_seconds > self.max_wait_seconds {
            return Err(Error::Config(format!(
                "min_wait_seconds ({}) must not exceed max_wait_seconds ({})",
                self.min_wait_seconds, self.max_wait_seconds
            )));
        }

        for (first, second) in CONFLICTING_ATTRIBUTES {
            if self.is_set(first) && self.is_set(second) {
                return Err(Error::Conflict { first, second });
            }
        }

        self.auth_mode()?;
        self.proxy_url()?;
        Ok(())
    }

    fn is_set(&self, attribute: &str) -> bool {
        match attribute {
            "api_token" => present(self.api_token.as_ref()),
            "access_token" => present(self.access_token.as_ref()),
            "client_id" => present(self.client_id.as_ref()),
            "scopes" => !self.scopes.is_empty(),
            "private_key" => present(self.private_key.as_ref()),
            "private_key_id" => present(self.private_key_id.as_ref()),
            _ => false,
        }
    }

    /// Authentication mode selected by the populated attributes
    ///
    /// # Errors
    ///
    /// Returns an error when no credentials are set or the private-key group
    /// is incomplete.
    pub fn auth_mode(&self) -> Result<AuthMode> {
        if let Some(token) = self.api_token.as_ref().filter(|t| present(Some(*t))) {
            return Ok(AuthMode::ApiToken(token.clone()));
        }
        if let Some(token) = self.access_token.as_ref().filter(|t| present(Some(*t))) {
            return Ok(AuthMode::AccessToken(token.clone()));
        }

        let group = ["client_id", "private_key", "scopes"];
        let missing: Vec<&str> = group.into_iter().filter(|a| !self.is_set(a)).collect();
        if missing.len() == group.len() && !self.is_set("private_key_id") {
            return Err(Error::Config(
                "no credentials: set api_token, access_token, or client_id with private_key and scopes"
                    .to_string(),
            ));
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "private key authentication also requires {}",
                missing.join(", ")
            )));
        }

        Ok(AuthMode::PrivateKey {
            client_id: self.client_id.clone().unwrap_or_default(),
            private_key: self.private_key.clone().unwrap_or_default(),
            private_key_id: self.private_key_id.clone().filter(|k| !k.is_empty()),
            scopes: self.scopes.clone(),
        })
    }

    /// `https://{org_name}.{base_url}`
    ///
    /// # Errors
    ///
    /// Returns an error if the pieces do not form a valid URL.
    pub fn org_url(&self) -> Result<Url> {
        let raw = format!("https://{}.{}", self.org_name.trim(), self.base_url.trim());
        Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid org URL {raw}: {e}")))
    }

    /// Parsed `http_proxy`
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy is not a valid URL.
    pub fn proxy_url(&self) -> Result<Option<Url>> {
        self.http_proxy
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                Url::parse(p.trim()).map_err(|e| Error::Config(format!("Invalid http_proxy {p}: {e}")))
            })
            .transpose()
    }

    /// First retry delay
    #[must_use]
    pub fn min_wait(&self) -> Duration {
        Duration::from_secs(self.min_wait_seconds)
    }

    /// Longest single delay
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    /// Per-call bound, zero for none
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Retry schedule for the transport
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff, self.max_retries, self.min_wait(), self.max_wait())
    }

    /// Tracing level for `log_level`
    #[must_use]
    pub fn tracing_level(&self) -> Level {
        level_for(self.log_level)
    }
}

fn present(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

fn range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{name} must be between {min} and {max}, got {value}"
        )))
    }
}

fn env_layer<F>(env: &F) -> Result<Map<String, Value>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = Map::new();
    for (var, attribute) in ENV_VARS {
        let Some(value) = env(var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let value = if attribute == "scopes" {
            Value::Array(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )
        } else {
            Value::String(value)
        };
        layer.insert(attribute.to_string(), value);
    }

    if let Some(raw) = env(MAX_API_CAPACITY_VAR).filter(|v| !v.trim().is_empty()) {
        let capacity: u8 = raw.trim().parse().map_err(|_| {
            Error::Config(format!("{MAX_API_CAPACITY_VAR} must be an integer from 1 to 100, got {raw:?}"))
        })?;
        layer.insert("max_api_capacity".to_string(), Value::from(capacity));
    }

    Ok(non_empty(Value::Object(layer))
        .as_object()
        .cloned()
        .unwrap_or_default())
}

/// Drop nulls, blank strings and empty lists so they do not mask lower layers.
fn non_empty(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| match v {
                    Value::Null => false,
                    Value::String(s) => !s.trim().is_empty(),
                    Value::Array(a) => !a.is_empty(),
                    _ => true,
                })
                .collect(),
        ),
        other => other,
    }
}

/// `TF_LOG` level name to the numeric scale
#[must_use]
pub fn log_level_from_name(name: &str) -> Option<u8> {
    match name.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some(1),
        "DEBUG" => Some(2),
        "INFO" => Some(3),
        "WARN" => Some(4),
        "ERROR" => Some(5),
        _ => None,
    }
}

/// Numeric level to tracing level; out-of-range values clamp
#[must_use]
pub fn level_for(log_level: u8) -> Level {
    match log_level {
        0 | 1 => Level::TRACE,
        2 => Level::DEBUG,
        3 => Level::INFO,
        4 => Level::WARN,
        _ => Level::ERROR,
    }
}
