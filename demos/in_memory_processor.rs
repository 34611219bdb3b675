//! Two event processors sharing an in-memory store and mock event hub.
//!
//! Shows partitions being split between processors, events delivered in
//! order per partition, checkpoints written from the callback, and a
//! processor leaving the group so the other takes over its partitions.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example in_memory_processor --features test-utilities
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=eventhub_processor=debug \
//!     cargo run --example in_memory_processor --features test-utilities
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eventhub_processor::prelude::*;
use eventhub_processor::processor::in_memory_store::InMemoryCheckpointStore;
use eventhub_processor::processor::metrics;
use eventhub_processor::processor::mock_transport::{MockConnectionFactory, MockEventHub};
use eventhub_processor::telemetry::{LogFormat, init_logging};
use tracing::info;

const PARTITIONS: usize = 6;
const EVENTS_PER_PARTITION: usize = 20;

fn processor(
    owner_id: &str,
    hub: &Arc<MockEventHub>,
    store: &InMemoryCheckpointStore,
    processed: &Arc<AtomicU64>,
) -> ProcessorResult<EventProcessor> {
    let owner = owner_id.to_string();
    let processed = processed.clone();
    let config = ProcessorConfig::default()
        .with_load_balancing_interval(Duration::from_millis(250))
        .with_ownership_expiration(Duration::from_secs(2))
        .with_prefetch_count(8);

    EventProcessorBuilder::new()
        .fully_qualified_namespace("demo.servicebus.windows.net")
        .event_hub_name(hub.event_hub_name())
        .consumer_group("$Default")
        .owner_id(owner_id)
        .checkpoint_store(Arc::new(store.clone()))
        .connection_factory(MockConnectionFactory::new(hub.clone()))
        .config(config)
        .process_event(move |event: ProcessorEvent| {
            let owner = owner.clone();
            let processed = processed.clone();
            async move {
                info!(
                    owner = %owner,
                    partition_id = %event.partition_context().partition_id,
                    sequence_number = event.data().sequence_number,
                    body = event.data().body_as_str().unwrap_or("<binary>"),
                    "Processing event"
                );
                processed.fetch_add(1, Ordering::Relaxed);
                event.update_checkpoint().await?;
                Ok(())
            }
        })
        .process_error(|ctx: ProcessorErrorContext| async move {
            tracing::warn!(
                partition = %ctx.partition_context,
                operation = ctx.operation,
                error = %ctx.error,
                "Processor reported an error"
            );
            Ok(())
        })
        .process_partition_close(|ctx: CloseContext| async move {
            info!(partition = %ctx.partition_context, reason = %ctx.reason, "Partition closed");
            Ok(())
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    metrics::init_metrics();

    let hub = MockEventHub::new("telemetry", PARTITIONS);
    let store = InMemoryCheckpointStore::new();
    let processed = Arc::new(AtomicU64::new(0));

    let first = processor("processor-a", &hub, &store, &processed)?;
    let second = processor("processor-b", &hub, &store, &processed)?;
    first.start().await;
    second.start().await;

    for round in 0..EVENTS_PER_PARTITION {
        for pid in hub.partition_ids() {
            hub.publish(&pid, format!("reading {} from partition {}", round, pid));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!(
        processor_a = ?first.active_partition_ids(),
        processor_b = ?second.active_partition_ids(),
        processed = processed.load(Ordering::Relaxed),
        "Partitions split"
    );

    // processor-b leaves; its records expire and processor-a takes over.
    second.close().await;
    for pid in hub.partition_ids() {
        hub.publish(&pid, "after handover");
    }
    tokio::time::sleep(Duration::from_secs(4)).await;

    info!(
        processor_a = ?first.active_partition_ids(),
        processed = processed.load(Ordering::Relaxed),
        "Handover complete"
    );

    for checkpoint in store
        .list_checkpoints("demo.servicebus.windows.net", "telemetry", "$Default")
        .await?
    {
        info!(
            partition_id = %checkpoint.partition_id,
            sequence_number = ?checkpoint.sequence_number,
            "Checkpoint"
        );
    }

    first.close().await;
    println!("{}", metrics::encode_metrics()?);
    Ok(())
}
