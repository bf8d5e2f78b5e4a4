//! Okta provider core - operator CLI

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;

use okta_provider_core::{
    ProviderContext,
    cli::{Cli, Command},
    config::ProviderConfig,
    expression::parse_expression,
    ratelimit::EndpointResolver,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(cli.tracing_level(), cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::ValidateExpression { expression } => Ok(run_validate_expression(&expression)),
        Command::ResolveBucket { method, path } => Ok(run_resolve_bucket(&method, &path)),
        Command::CheckConfig {
            config,
            endpoint,
            offline,
        } => run_check_config(config.as_deref(), endpoint, offline).await,
        Command::Buckets { filter } => Ok(run_buckets(filter.as_deref())),
    };

    result.unwrap_or_else(|e| {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        ExitCode::FAILURE
    })
}

fn run_validate_expression(expression: &str) -> ExitCode {
    match parse_expression(expression) {
        Ok(_) => {
            println!("valid");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("invalid: {e}");
            println!("  kind:     {}", e.kind.as_str());
            println!("  position: {}", e.offset());
            if let Some(token) = &e.token {
                println!("  token:    {token:?}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run_resolve_bucket(method: &str, path: &str) -> ExitCode {
    let resolved = EndpointResolver::embedded().resolve(method, path);
    println!("bucket:    {}", resolved.bucket);
    println!("canonical: {}", resolved.canonical_path);
    ExitCode::SUCCESS
}

async fn run_check_config(
    file: Option<&std::path::Path>,
    endpoint: Option<url::Url>,
    offline: bool,
) -> anyhow::Result<ExitCode> {
    let config = ProviderConfig::load(file, None).context("loading configuration")?;
    config.validate().context("validating configuration")?;
    let mode = config.auth_mode()?;
    println!("configuration ok ({} authentication)", mode.name());

    if offline {
        return Ok(ExitCode::SUCCESS);
    }

    let mut builder = ProviderContext::builder(config);
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint(endpoint);
    }
    let provider = builder.build().await.context("connecting to the org")?;
    println!("org:    {}", provider.org_url());
    println!("flavor: {}", provider.org_flavor().await);
    Ok(ExitCode::SUCCESS)
}

fn run_buckets(filter: Option<&str>) -> ExitCode {
    let resolver = EndpointResolver::embedded();
    let rows = resolver
        .rules()
        .iter()
        .filter(|r| filter.is_none_or(|f| r.pattern.contains(f) || r.bucket.contains(f)));

    let mut count = 0usize;
    for rule in rows {
        println!("{:<7} {:<60} {}", rule.method, rule.pattern, rule.bucket);
        count += 1;
    }
    println!("\n{count} rule(s)");
    ExitCode::SUCCESS
}
