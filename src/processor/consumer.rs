//! Caller-driven consumer, for reading partitions without load balancing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info};

use super::partition_consumer::{PartitionConsumer, PartitionReceiver};
use super::transport::{EventHubTransport, ReceiveOptions};
use crate::constants::RECEIVE_ALL_KEY_PREFIX;
use crate::error::{ProcessorError, ProcessorResult, ReceiveError};
use crate::types::{EventPosition, PartitionContext, PartitionEvent};

/// Reads one or all partitions of an event hub.
///
/// The transport is borrowed, not owned: `close` shuts the links this
/// consumer opened but leaves the connection to its creator.
pub struct EventHubConsumer {
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    transport: Arc<dyn EventHubTransport>,
    options: ReceiveOptions,
    open_consumers: DashMap<String, Arc<PartitionConsumer>>,
    disposed: AtomicBool,
}

impl EventHubConsumer {
    pub fn new(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
        transport: Arc<dyn EventHubTransport>,
        options: ReceiveOptions,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_string(),
            event_hub_name: event_hub_name.to_string(),
            consumer_group: consumer_group.to_string(),
            transport,
            options,
            open_consumers: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn consumer_for(&self, key: String, partition_id: &str) -> Arc<PartitionConsumer> {
        self.open_consumers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(PartitionConsumer::new(
                    PartitionContext::new(
                        &self.fully_qualified_namespace,
                        &self.event_hub_name,
                        &self.consumer_group,
                        partition_id,
                    ),
                    self.transport.clone(),
                    self.options.clone(),
                ))
            })
            .clone()
    }

    fn ensure_open(&self) -> ProcessorResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ProcessorError::Closed(format!(
                "consumer for {} is closed",
                self.event_hub_name
            )));
        }
        Ok(())
    }

    /// Subscribe to one partition from `position`.
    pub fn receive(
        &self,
        partition_id: &str,
        position: EventPosition,
    ) -> ProcessorResult<PartitionReceiver> {
        self.ensure_open()?;
        if partition_id.is_empty() {
            return Err(ProcessorError::InvalidArgument(
                "partition_id cannot be empty".to_string(),
            ));
        }
        let consumer = self.consumer_for(partition_id.to_string(), partition_id);
        Ok(consumer.receive(position))
    }

    /// Subscribe to every partition and merge the streams.
    ///
    /// Events from one partition stay in order; there is no order across
    /// partitions.
    pub async fn receive_from_all_partitions(
        &self,
        position: EventPosition,
    ) -> ProcessorResult<BoxStream<'static, Result<PartitionEvent, ReceiveError>>> {
        self.ensure_open()?;
        let partition_ids = self.partition_ids().await?;
        debug!(
            event_hub = %self.event_hub_name,
            partitions = partition_ids.len(),
            "Receiving from all partitions"
        );

        let receivers: Vec<PartitionReceiver> = partition_ids
            .iter()
            .map(|id| {
                self.consumer_for(format!("{}{}", RECEIVE_ALL_KEY_PREFIX, id), id)
                    .receive(position)
            })
            .collect();
        Ok(futures::stream::select_all(receivers).boxed())
    }

    pub async fn partition_ids(&self) -> ProcessorResult<Vec<String>> {
        Ok(self.transport.partition_ids(&self.event_hub_name).await?)
    }

    /// Number of partition consumers created so far.
    pub fn open_consumer_count(&self) -> usize {
        self.open_consumers.len()
    }

    /// Close every partition consumer. Idempotent.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers: Vec<Arc<PartitionConsumer>> = self
            .open_consumers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.open_consumers.clear();

        for consumer in consumers {
            consumer.close().await;
        }
        info!(event_hub = %self.event_hub_name, "Consumer closed");
    }
}
