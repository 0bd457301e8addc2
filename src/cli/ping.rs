// ABOUTME: CLI ping command - connect and time a core.ping round trip

use super::OutputFormat;
use anyhow::{Context, Result};
use middleware_client::{CallContext, Client, ClientConfig};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
struct PingReport {
    url: String,
    reply: String,
    rtt_ms: f64,
}

/// Execute the ping command
pub async fn execute(config: ClientConfig, format: OutputFormat) -> Result<()> {
    let url = config.url.clone();
    let client = Client::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    let started = Instant::now();
    let reply = client
        .call::<String>(&CallContext::new(), "core.ping", vec![])
        .await;
    let rtt = started.elapsed();
    client.close().await?;

    let report = PingReport {
        url,
        reply: reply.context("core.ping failed")?,
        rtt_ms: rtt.as_secs_f64() * 1000.0,
    };

    match format {
        OutputFormat::Text => println!("{} from {} in {:.1} ms", report.reply, report.url, report.rtt_ms),
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }
    Ok(())
}
