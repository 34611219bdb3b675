//! # eventhub-processor
//! Partition-owning, checkpointing event processor for partitioned event
//! streams.
//!
//! Several processes running an [`EventProcessor`](processor::EventProcessor)
//! against the same event hub and consumer group divide its partitions
//! fairly between them, keep exactly one receive pump per owned partition,
//! hand events to user callbacks in partition order, and pick up where the
//! previous owner left off when a partition changes hands.
//!
//! The crate is transport and storage agnostic. Two traits connect it to the
//! outside world:
//! - [`CheckpointStore`](processor::CheckpointStore) persists ownership
//!   records and checkpoints with optimistic concurrency.
//! - [`ConnectionFactory`](processor::ConnectionFactory) opens an
//!   [`EventHubTransport`](processor::EventHubTransport) that creates
//!   credit-based receive links.
//!
//! ## Getting started
//!
//! ```rust,ignore
//! use eventhub_processor::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ProcessorResult<()> {
//!     let processor = EventProcessorBuilder::new()
//!         .fully_qualified_namespace("myns.servicebus.windows.net")
//!         .event_hub_name("telemetry")
//!         .consumer_group("$Default")
//!         .checkpoint_store(my_store())
//!         .connection_factory(my_connection_factory())
//!         .config(ProcessorConfig::from_env()?)
//!         .process_event(|event: ProcessorEvent| async move {
//!             println!("{}: {:?}", event.partition_context(), event.data().body_as_str());
//!             event.update_checkpoint().await?;
//!             Ok(())
//!         })
//!         .process_error(|ctx: ProcessorErrorContext| async move {
//!             eprintln!("[{}] {}: {}", ctx.partition_context, ctx.operation, ctx.error);
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     processor.start().await;
//!     tokio::signal::ctrl_c().await.ok();
//!     processor.close().await;
//!     Ok(())
//! }
//! ```
//!
//! See `demos/in_memory_processor.rs` for a runnable version on the
//! in-memory store and mock transport.

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod processor;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for building a processor.
    pub use crate::error::{
        CallbackError, ProcessorError, ProcessorResult, ReceiveError, TransportError,
    };
    pub use crate::processor::{
        CallbackResult, CheckpointPolicy, CheckpointStore, CloseContext, CloseReason,
        ConnectionFactory, EventHubConsumer, EventHubTransport, EventProcessor,
        EventProcessorBuilder, InitializationContext, PartitionProcessor,
        PartitionProcessorFactory, ProcessorConfig, ProcessorErrorContext, ProcessorEvent,
        ReceiveLink, ReceiveOptions,
    };
    pub use crate::types::{
        Checkpoint, EventData, EventPosition, PartitionContext, PartitionEvent,
        PartitionOwnership,
    };

    pub use async_trait::async_trait;
    pub use bytes;
}
