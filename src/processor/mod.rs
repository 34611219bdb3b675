//! Partition-owning event processor.
//!
//! A fleet of [`EventProcessor`]s reading the same event hub and consumer
//! group splits the partitions between them. They coordinate only through a
//! shared [`CheckpointStore`]: ownership records with optimistic concurrency
//! tokens decide who reads what, and checkpoints decide where a new owner
//! resumes.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────── EventProcessor ────────────────────────────┐
//!   │                                                                        │
//!   │  fixed-delay task ──► OwnershipBalancer ──list/claim──► CheckpointStore │
//!   │                             │                               ▲          │
//!   │                   claimed / lost partitions                 │          │
//!   │                             ▼                               │          │
//!   │                    PartitionPumpManager                checkpoints     │
//!   │                  ┌──────────┼──────────┐                    │          │
//!   │                  ▼          ▼          ▼                    │          │
//!   │               pump 0     pump 1     pump 2 ──► PartitionProcessor      │
//!   │                  │          │          │                               │
//!   │                  └──── PartitionConsumer (credit flow) ────┐           │
//!   └────────────────────────────────────────────────────────────┼───────────┘
//!                                                                ▼
//!                                                       EventHubTransport
//! ```
//!
//! # Delivery
//!
//! Events of one partition reach `process_event` in order, one at a time.
//! Delivery is at-least-once: after a restart or an ownership change a
//! partition resumes after its last checkpoint, so events processed since
//! then are delivered again.
//!
//! # Testing
//!
//! [`InMemoryCheckpointStore`](in_memory_store::InMemoryCheckpointStore) and
//! [`MockEventHub`](mock_transport::MockEventHub) are available with the
//! `test-utilities` feature.

pub mod background_tasks;
pub mod builder;
pub mod callbacks;
pub mod checkpoint_store;
pub mod config;
pub mod consumer;
pub mod context;
pub mod event_processor;
pub mod metrics;
pub mod ownership_balancer;
pub mod partition_consumer;
pub mod pump_manager;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "test-utilities"))]
pub mod in_memory_store;
#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_transport;

pub use builder::EventProcessorBuilder;
pub use callbacks::{
    CallbackResult, ClosureHandlers, ClosureProcessor, PartitionProcessor,
    PartitionProcessorFactory,
};
pub use checkpoint_store::{CheckpointStore, ClaimOutcome};
pub use config::{CheckpointPolicy, ProcessorConfig};
pub use consumer::EventHubConsumer;
pub use context::{
    CloseContext, CloseReason, InitializationContext, ProcessorErrorContext, ProcessorEvent,
};
pub use event_processor::EventProcessor;
pub use ownership_balancer::{BalancingOutcome, ClaimPlan, OwnershipBalancer, StealDecision};
pub use partition_consumer::{PartitionConsumer, PartitionReceiver};
pub use pump_manager::{PartitionPumpManager, PumpState};
pub use transport::{
    ConnectionFactory, EventHubTransport, ReceiveLink, ReceiveOptions, SharedConnection,
};
