// ABOUTME: Main entry point for midclt, the middleware command line client
//
// Binary: midclt
// Usage: midclt [OPTIONS] <COMMAND>
// - call: invoke a method (--job to wait for a job)
// - subscribe: print collection updates
// - ping: check connectivity

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_json, args.log_file.as_deref())?;

    let config = args.client_config()?;
    tracing::debug!(url = %config.url, "Loaded configuration");

    match args.command {
        cli::Commands::Call(call_args) => cli::call::execute(call_args, config, args.format).await,
        cli::Commands::Subscribe(sub_args) => {
            cli::subscribe::execute(sub_args, config, args.format).await
        }
        cli::Commands::Ping => cli::ping::execute(config, args.format).await,
    }
}

fn setup_logging(json: bool, log_file: Option<&Path>) -> Result<()> {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "middleware_client=warn,midclt=info".into());

    // JSON Lines to a file
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(file)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let to_stderr = file_layer.is_none();
    let json_layer = (to_stderr && json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (to_stderr && !json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(json_layer)
        .with(text_layer)
        .with(filter)
        .init();

    Ok(())
}
