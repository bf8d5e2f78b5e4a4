//! Error types for the provider core

use thiserror::Error;

/// Result type alias for the provider core
pub type Result<T> = std::result::Result<T, Error>;

/// Provider core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mutually exclusive credential fields were both set
    #[error("Conflicting configuration: {} and {} cannot be set together", first, second)]
    Conflict {
        /// First offending attribute
        first: &'static str,
        /// Second offending attribute
        second: &'static str,
    },

    /// Transport failed after all retries
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote kept answering 429 after all retries
    #[error("rate-limit: bucket {bucket} still throttled after {attempts} attempts")]
    RateLimited {
        /// Bucket the request was charged against
        bucket: String,
        /// Number of attempts issued
        attempts: u32,
    },

    /// Remote API returned an error status
    #[error("API error {status}: {summary}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Remote error code (e.g. `E0000007`)
        error_code: Option<String>,
        /// Remote error summary including causes
        summary: String,
    },

    /// Authentication failure (token minting or exchange)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Request context was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Request timeout elapsed
    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the higher layers treat as "resource does not exist"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// HTTP status carried by the error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
