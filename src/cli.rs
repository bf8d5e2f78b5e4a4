//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use url::Url;

use crate::config::{level_for, log_level_from_name};

/// Operator tooling for the Okta provider core
#[derive(Parser, Debug)]
#[command(name = "okta-provider-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level: 1 (trace) to 5 (error), or a level name
    #[arg(long, env = "TF_LOG", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Tracing level requested on the command line, ERROR when unset or
    /// unrecognized
    #[must_use]
    pub fn tracing_level(&self) -> Level {
        let numeric = self.log_level.as_deref().and_then(|raw| {
            raw.trim()
                .parse::<u8>()
                .ok()
                .or_else(|| log_level_from_name(raw))
        });
        level_for(numeric.unwrap_or(5))
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check the syntax of a policy condition expression
    ValidateExpression {
        /// Expression text
        expression: String,
    },

    /// Show the rate-limit bucket a request is charged against
    ResolveBucket {
        /// HTTP method
        method: String,
        /// Request path, e.g. /api/v1/users/00u1/factors
        path: String,
    },

    /// Load and validate configuration, then connect to the org
    CheckConfig {
        /// YAML file with provider attributes
        #[arg(short, long, env = "OKTA_PROVIDER_CONFIG")]
        config: Option<PathBuf>,

        /// Talk to this URL instead of https://{org_name}.{base_url}
        #[arg(long)]
        endpoint: Option<Url>,

        /// Only validate; make no requests
        #[arg(long)]
        offline: bool,
    },

    /// List the compiled rate-limit bucket table
    Buckets {
        /// Only rows whose path or bucket contains this text
        #[arg(long)]
        filter: Option<String>,
    },
}
