//! `shardline tail`: copy a stream's payloads to stdout
//!
//! With a Redis URL the tail starts from the fleet's stored checkpoints in
//! read-only mode: nothing is written and no lease is taken, so a running
//! fleet is never disturbed.

use super::Settings;
use crate::format::TerminalFaultHandler;
use anyhow::{Context, Result};
use shardline_consumer::{CheckpointerOptions, KvCheckpointer, StreamConsumer};
use shardline_kinesis::{KinesisOptions, KinesisStream};
use shardline_store::RedisKvStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub async fn handle_tail(stream: String, replay: Option<Duration>, settings: &Settings) -> Result<()> {
    let client = KinesisStream::connect(KinesisOptions {
        region: settings.region.clone(),
        endpoint_url: settings.endpoint_url.clone(),
    })
    .await;

    let mut builder = StreamConsumer::builder()
        .stream(stream.clone())
        .client(Arc::new(client))
        .fault_handler(TerminalFaultHandler::new(settings.colored));

    if let Some(window) = replay {
        builder = builder.replay(window);
    }

    if let Some(url) = &settings.redis_url {
        let store = RedisKvStore::connect(url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {url}"))?;
        let options = CheckpointerOptions {
            prefix: settings.redis_prefix.clone(),
            read_only: true,
            ..CheckpointerOptions::default()
        };
        let checkpointer =
            KvCheckpointer::new(Arc::new(store), options).context("Invalid checkpoint options")?;
        builder = builder.checkpointer(Arc::new(checkpointer));
    }

    let consumer = builder.build().context("Invalid consumer configuration")?;
    let partitions = consumer
        .begin()
        .await
        .with_context(|| format!("Failed to start tailing {stream}"))?;
    info!(stream = %stream, partitions, "Tailing stream");

    let mut records = consumer
        .records()
        .context("Record stream already taken")?;
    let mut stdout = tokio::io::stdout();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, stopping");
                break;
            }
            record = records.recv() => {
                let Some(record) = record else { break };
                stdout.write_all(&record.data).await?;
                stdout.write_all(b"\n").await?;
                record.done().await?;
            }
        }
    }

    stdout.flush().await?;
    consumer.end().await.context("Failed to stop consumer")?;
    Ok(())
}
