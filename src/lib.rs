//! Okta Provider Core
//!
//! Runtime core of an infrastructure-as-code provider for the Okta API.
//!
//! # Features
//!
//! - **Credential assembly**: layered configuration, API token, bearer token
//!   or private-key JWT client credentials with a shared token cache
//! - **Rate-limit governor**: per-bucket budgets learned from
//!   `X-Rate-Limit-*` headers, capped to a configurable share
//! - **Retry transport**: exponential backoff honoring server reset hints,
//!   replayable bodies, cancellation and deadlines
//! - **Expression validator**: plan-time syntax checks for policy conditions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod expression;
pub mod provider;
pub mod ratelimit;
pub mod transport;

pub use error::{Error, Result};
pub use provider::{OrgFlavor, ProviderContext};

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// `User-Agent` sent with every request
pub const USER_AGENT: &str = concat!("okta-provider-core/", env!("CARGO_PKG_VERSION"));

/// `YYYY/MM/DD HH:MM:SS` in local time
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTimer;

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y/%m/%d %H:%M:%S"))
    }
}

/// Formatting layer for `format` ("json" or text) writing to `writer`
fn log_layer<S, W>(format: Option<&str>, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        Some("json") => fmt::layer()
            .json()
            .with_timer(LogTimer)
            .with_writer(writer)
            .boxed(),
        _ => fmt::layer().with_timer(LogTimer).with_writer(writer).boxed(),
    }
}

/// Setup tracing/logging
///
/// Logs always go to stderr; stdout belongs to the host. `RUST_LOG`
/// directives, when present, refine the default `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: Level, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(log_layer(format, std::io::stderr))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
