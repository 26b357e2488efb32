//! Walk-through of out-of-order message correlation with a file-backed
//! group store and a discard log.
//!
//! Run with: `cargo run --example correlate`
//!
//! Set `RUST_LOG=message_aggregator=debug` to watch actors spawn and
//! groups change.

use message_aggregator::{
    ChannelSink, ControlBus, FileGroupStore, GroupChange, InboundMessage, MessageAggregator,
};

// ---------------------------------------------------------------------------
// Inbound messages, as a broker binding would deliver them
// ---------------------------------------------------------------------------

fn message(kind: &str, event_id: &str, payload: &str) -> InboundMessage {
    InboundMessage::new(payload)
        .with_header("messageEventType", kind)
        .with_header("messageEventId", event_id)
        .with_header("appName", "shop")
        .with_header("contentType", "application/json")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,message_aggregator=info".into()),
        )
        .init();

    let dir = std::env::temp_dir().join("message-aggregator-demo");
    let (sink, mut results) = ChannelSink::new();
    let aggregator = MessageAggregator::builder()
        .name("orders")
        .sink(sink)
        .group_store(FileGroupStore::new(&dir))
        .discard_log(dir.join("discards.jsonl"))
        .on_group_change(|change| match change {
            GroupChange::Saved {
                correlation_id,
                size,
            } => println!("  group {correlation_id} now holds {size} fragment(s)"),
            GroupChange::Deleted { correlation_id } => {
                println!("  group {correlation_id} removed")
            }
        })
        .build()?;

    let mut bus = ControlBus::new();
    bus.register(aggregator.clone());

    // The payment is thrown before the process waiting for it exists.
    println!("-> MESSAGE_SENT");
    aggregator
        .submit_message(message(
            "MESSAGE_SENT",
            "evt-1",
            r#"{"name":"order-paid","correlationKey":"42","variables":{"amount":99}}"#,
        ))
        .await?;

    println!("-> MESSAGE_WAITING");
    let released = aggregator
        .submit_message(message(
            "MESSAGE_WAITING",
            "evt-2",
            r#"{"name":"order-paid","correlationKey":"42","businessKey":"order-42"}"#,
        ))
        .await?;
    println!("  released {} result(s)", released.len());

    // A redelivery of the same event is rejected and logged.
    println!("-> MESSAGE_SENT (redelivered)");
    if let Err(e) = aggregator
        .submit_message(message(
            "MESSAGE_SENT",
            "evt-1",
            r#"{"name":"order-paid","correlationKey":"42"}"#,
        ))
        .await
    {
        println!("  rejected: {e}");
    }

    // Paused aggregators refuse new work.
    bus.execute("@orders.stop()")?;
    if let Err(e) = aggregator
        .submit_message(message(
            "MESSAGE_RECEIVED",
            "evt-3",
            r#"{"name":"order-paid","correlationKey":"42"}"#,
        ))
        .await
    {
        println!("  rejected: {e}");
    }
    bus.execute("@orders.start()")?;

    while let Ok(result) = results.try_recv() {
        println!("merged: {}", serde_json::to_string_pretty(&result)?);
    }
    println!("discarded: {}", aggregator.discards()?.len());

    for id in aggregator.group_ids()? {
        aggregator.remove_group(&id).await?;
    }
    Ok(())
}
