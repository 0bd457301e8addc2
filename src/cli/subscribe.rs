// ABOUTME: CLI subscribe command - print collection updates until done
//
// Updates are handed from the subscription worker thread to this task over a
// channel. Stops after --count updates or on Ctrl-C, then unsubscribes.

use super::{OutputFormat, SubscribeArgs};
use anyhow::{Context, Result};
use chrono::Local;
use middleware_client::{CallContext, Client, ClientConfig, CollectionUpdate};
use tokio::sync::mpsc;
use tracing::info;

/// Execute the subscribe command
pub async fn execute(args: SubscribeArgs, config: ClientConfig, format: OutputFormat) -> Result<()> {
    let queue_size = config.subscription_queue_size.max(1);
    let client = Client::connect(config)
        .await
        .context("Failed to connect to middleware")?;
    let ctx = CallContext::new();

    let (tx, mut rx) = mpsc::channel::<CollectionUpdate>(queue_size);
    client
        .subscribe(&ctx, &args.collection, move |update| {
            tx.blocking_send(update).map_err(Into::into)
        })
        .await
        .with_context(|| format!("Failed to subscribe to {}", args.collection))?;

    info!(collection = %args.collection, "Waiting for updates");

    let mut received = 0usize;
    loop {
        if args.count.is_some_and(|limit| received >= limit) {
            break;
        }
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };
        received += 1;
        println!("{}", render(&update, format)?);
    }

    client.unsubscribe(&ctx, &args.collection).await?;
    client.close().await?;
    Ok(())
}

fn render(update: &CollectionUpdate, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(update)?,
        OutputFormat::Text => format!(
            "{} {} {:?} id={} {}",
            Local::now().format("%H:%M:%S%.3f"),
            update.collection,
            update.kind,
            update.id.as_ref().map_or_else(|| "-".to_string(), ToString::to_string),
            update
                .fields
                .as_ref()
                .map_or_else(String::new, ToString::to_string),
        ),
    })
}
