//! Broker relay: producer → in queue → conduit → out queue → consumer,
//! all over the in-memory broker. Demonstrates the full wiring a real
//! broker host would use: reserve a slot per delivery, load, acknowledge,
//! and publish each drained result.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use conduit::{Conduit, ConduitConfig, MessageIn, MessageOut};
use conduit_channel::{ChannelReader, ChannelWriter, MemoryBroker};
use rand::Rng;

#[derive(Debug, Args)]
pub struct RelayArgs {
    /// Number of worker pods
    #[arg(long, default_value_t = 3)]
    pub pods: usize,

    /// Recycle a fixed pod pool instead of building one per message
    #[arg(long)]
    pub reuse_pods: bool,

    /// Messages the producer publishes before hanging up
    #[arg(long, default_value_t = 10)]
    pub messages: usize,

    #[arg(long, default_value = "in-queue")]
    pub in_queue: String,

    #[arg(long, default_value = "out-queue")]
    pub out_queue: String,

    /// Processing cost is rolled from this range as each delivery is
    /// taken off the in queue
    #[arg(long, default_value_t = 100)]
    pub min_delay_ms: u64,

    #[arg(long, default_value_t = 200)]
    pub max_delay_ms: u64,
}

pub async fn run(args: RelayArgs) -> Result<()> {
    let broker = MemoryBroker::new();
    let outputs = relay(&args, &broker).await?;
    tracing::info!(delivered = outputs.len(), "relay complete");
    Ok(())
}

async fn relay(args: &RelayArgs, broker: &MemoryBroker) -> Result<Vec<MessageOut>> {
    if args.min_delay_ms > args.max_delay_ms {
        anyhow::bail!("min delay exceeds max delay");
    }

    let in_writer = broker.writer(&args.in_queue)?;
    let in_reader = broker.reader(&args.in_queue)?;
    let out_writer = Arc::new(broker.writer(&args.out_queue)?);
    let out_reader = broker.reader(&args.out_queue)?;

    let conduit = Conduit::new(ConduitConfig {
        pod_count: args.pods,
        reuse_pods: args.reuse_pods,
    })?;

    // Every drained result goes straight to the out queue, still in
    // admission order.
    let mut ready = conduit.subscribe();
    let publisher = {
        let out_writer = Arc::clone(&out_writer);
        tokio::spawn(async move {
            while let Some(out) = ready.recv().await {
                let body = match serde_json::to_vec(&out) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode result");
                        continue;
                    }
                };
                if let Err(e) = out_writer.publish(&body).await {
                    tracing::error!(error = %e, "failed to publish result");
                    break;
                }
            }
        })
    };

    // The upstream system pushing raw records at us.
    let count = args.messages as u64;
    let producer = tokio::spawn(async move {
        for id in 1..=count {
            let message = MessageIn {
                id,
                payload: id.to_string(),
                processing_ms: 0,
            };
            let body = serde_json::to_vec(&message)?;
            in_writer.publish(&body).await?;
        }
        in_writer.close().await?;
        Ok::<(), anyhow::Error>(())
    });

    // The downstream system logging results off the out queue.
    let mut out_deliveries = out_reader.connect().await?;
    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(delivery) = out_deliveries.recv().await {
            match serde_json::from_slice::<MessageOut>(&delivery.body) {
                Ok(out) => {
                    tracing::info!(%out, "out-queue");
                    let _ = out_reader.acknowledge(delivery.tag);
                    seen.push(out);
                }
                Err(e) => tracing::error!(error = %e, "bad outbound record"),
            }
            if seen.len() as u64 == count {
                break;
            }
        }
        seen
    });

    // The relay proper: admission-gated loading from the in queue.
    let mut deliveries = in_reader.connect().await?;
    while let Some(delivery) = deliveries.recv().await {
        let mut message: MessageIn =
            serde_json::from_slice(&delivery.body).context("bad inbound record")?;
        message.processing_ms = rand::thread_rng().gen_range(args.min_delay_ms..=args.max_delay_ms);

        let claim = conduit.wait_for_slot().await?;
        conduit.load_message(claim, message).await?;
        in_reader.acknowledge(delivery.tag)?;
    }

    producer.await.context("producer died")??;
    conduit.stop().await;
    // Dropping the conduit hangs up the subscription so the publisher
    // drains out.
    drop(conduit);
    publisher.await.context("publisher died")?;
    out_writer.close().await?;

    let outputs = consumer.await.context("consumer died")?;
    in_reader.close().await?;
    Ok(outputs)
}
