// ABOUTME: CLI call command - invoke one method, optionally as a tracked job
//
// Parameters are parsed as JSON; anything that is not valid JSON is sent as a
// string. With --job the returned job id is polled to completion and
// progress is printed on stderr.

use super::{CallArgs, OutputFormat};
use anyhow::{Context, Result};
use middleware_client::{CallContext, Client, ClientConfig, JobProgress};
use serde_json::Value;

/// Parse one command line parameter.
pub fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Execute the call command
pub async fn execute(args: CallArgs, config: ClientConfig, format: OutputFormat) -> Result<()> {
    let params: Vec<Value> = args.params.iter().map(|p| parse_param(p)).collect();

    let client = Client::connect(config)
        .await
        .context("Failed to connect to middleware")?;
    let ctx = CallContext::new();

    let result = if args.job {
        client
            .call_job_with_progress::<Value, _>(&ctx, &args.method, params, print_progress)
            .await
    } else {
        client.call_raw(&ctx, &args.method, params).await
    };

    client.close().await?;
    let value = result.with_context(|| format!("{} failed", args.method))?;

    println!("{}", render(&value, format)?);
    Ok(())
}

fn print_progress(progress: &JobProgress) {
    let percent = progress.percent.map_or_else(|| "--".to_string(), |p| format!("{p:.0}%"));
    eprintln!(
        "[{percent:>4}] {}",
        progress.description.as_deref().unwrap_or_default()
    );
}

/// Render a result: strings bare and values pretty-printed for text, compact
/// JSON otherwise.
pub fn render(value: &Value, format: OutputFormat) -> Result<String> {
    Ok(match (format, value) {
        (OutputFormat::Text, Value::String(s)) => s.clone(),
        (OutputFormat::Text, other) => serde_json::to_string_pretty(other)?,
        (OutputFormat::Json, other) => serde_json::to_string(other)?,
    })
}
