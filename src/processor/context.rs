//! Values handed to user callbacks.

use std::fmt;
use std::sync::Arc;

use super::checkpoint_store::CheckpointStore;
use super::metrics;
use super::retry::with_store_policy;
use crate::error::{CallbackError, ProcessorResult};
use crate::types::{
    EventData, EventPosition, LastEnqueuedEventProperties, PartitionContext, PartitionEvent,
};

/// Why a partition processor is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Another processor took the partition, or the link failed.
    LostPartitionOwnership,
    /// The processor is stopping, or the stream completed.
    EventProcessorShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::LostPartitionOwnership => "lost_partition_ownership",
            CloseReason::EventProcessorShutdown => "event_processor_shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passed to `initialize` before any event flows.
///
/// `initial_position` is where the pump will start unless a checkpoint
/// exists; the callback may change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationContext {
    pub partition_context: PartitionContext,
    pub initial_position: EventPosition,
}

impl InitializationContext {
    pub fn new(partition_context: PartitionContext, initial_position: EventPosition) -> Self {
        Self {
            partition_context,
            initial_position,
        }
    }

    pub fn set_initial_position(&mut self, position: EventPosition) {
        self.initial_position = position;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseContext {
    pub partition_context: PartitionContext,
    pub reason: CloseReason,
}

/// An error routed to `process_error`, tagged with the operation that failed.
///
/// For processor-level failures (load balancing) the partition id is empty.
#[derive(Debug, Clone)]
pub struct ProcessorErrorContext {
    pub partition_context: PartitionContext,
    pub error: Arc<dyn std::error::Error + Send + Sync>,
    pub operation: &'static str,
}

impl ProcessorErrorContext {
    pub fn new(
        partition_context: PartitionContext,
        error: impl Into<CallbackError>,
        operation: &'static str,
    ) -> Self {
        Self {
            partition_context,
            error: Arc::from(error.into()),
            operation,
        }
    }
}

/// One event delivered to `process_event`.
#[derive(Clone)]
pub struct ProcessorEvent {
    partition_context: PartitionContext,
    data: EventData,
    last_enqueued: Option<LastEnqueuedEventProperties>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl ProcessorEvent {
    pub(crate) fn new(event: PartitionEvent, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            partition_context: event.partition_context,
            data: event.data,
            last_enqueued: event.last_enqueued,
            checkpoints,
        }
    }

    pub fn partition_context(&self) -> &PartitionContext {
        &self.partition_context
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn into_data(self) -> EventData {
        self.data
    }

    /// Present only when last-enqueued tracking is enabled.
    pub fn last_enqueued_event_properties(&self) -> Option<&LastEnqueuedEventProperties> {
        self.last_enqueued.as_ref()
    }

    /// Record this event's position as the partition checkpoint.
    pub async fn update_checkpoint(&self) -> ProcessorResult<()> {
        let checkpoint = self
            .partition_context
            .checkpoint(Some(self.data.offset), Some(self.data.sequence_number));
        let store = self.checkpoints.clone();
        let result = with_store_policy(|| {
            let store = store.clone();
            let checkpoint = checkpoint.clone();
            async move { store.update_checkpoint(checkpoint).await }
        })
        .await;
        metrics::record_checkpoint_update(result.is_ok());
        result
    }
}

impl fmt::Debug for ProcessorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorEvent")
            .field("partition_context", &self.partition_context)
            .field("data", &self.data)
            .field("last_enqueued", &self.last_enqueued)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::in_memory_store::InMemoryCheckpointStore;
    use bytes::Bytes;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_update_checkpoint_writes_event_position() {
        let store = InMemoryCheckpointStore::new();
        let ctx = PartitionContext::new("ns", "hub", "$Default", "2");
        let event = ProcessorEvent::new(
            PartitionEvent {
                partition_context: ctx,
                data: EventData {
                    body: Bytes::from_static(b"x"),
                    properties: HashMap::new(),
                    sequence_number: 2,
                    offset: 250,
                    enqueued_time: None,
                    partition_key: None,
                },
                last_enqueued: None,
            },
            Arc::new(store.clone()),
        );

        event.update_checkpoint().await.unwrap();
        let checkpoint = store
            .get_checkpoint("ns", "hub", "$Default", "2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.offset, Some(250));
        assert_eq!(checkpoint.sequence_number, Some(2));
    }

    #[test]
    fn test_error_context_from_string() {
        let ctx = ProcessorErrorContext::new(
            PartitionContext::new("ns", "hub", "cg", "1"),
            "boom",
            crate::constants::OPERATION_USER_CODE,
        );
        assert_eq!(ctx.error.to_string(), "boom");
        assert_eq!(ctx.operation, "user code error");
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(CloseReason::LostPartitionOwnership.to_string(), "lost_partition_ownership");
        assert_eq!(CloseReason::EventProcessorShutdown.as_str(), "event_processor_shutdown");
    }
}
