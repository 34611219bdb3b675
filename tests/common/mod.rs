//! Shared harness for processor integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventhub_processor::processor::in_memory_store::InMemoryCheckpointStore;
use eventhub_processor::processor::mock_transport::{MockConnectionFactory, MockEventHub};
use eventhub_processor::processor::{
    CallbackResult, CloseContext, CloseReason, EventProcessor, EventProcessorBuilder,
    InitializationContext, OwnershipBalancer, PartitionProcessor, ProcessorConfig,
    ProcessorErrorContext, ProcessorEvent, SharedConnection,
};

pub const NAMESPACE: &str = "test.servicebus.windows.net";
pub const HUB: &str = "telemetry";
pub const GROUP: &str = "$Default";

/// Everything the processors observed, shared across all callback instances.
#[derive(Default)]
pub struct Observed {
    /// (partition id, sequence number) per delivered event.
    pub events: Mutex<Vec<(String, i64)>>,
    /// (partition id, operation) per reported error.
    pub errors: Mutex<Vec<(String, &'static str)>>,
    pub closes: Mutex<Vec<(String, CloseReason)>>,
    pub initialized: Mutex<Vec<String>>,
}

impl Observed {
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn sequence_numbers(&self, partition_id: &str) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(pid, _)| pid == partition_id)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn errors_for(&self, operation: &str) -> usize {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, op)| *op == operation)
            .count()
    }

    pub fn close_reasons(&self, partition_id: &str) -> Vec<CloseReason> {
        self.closes
            .lock()
            .unwrap()
            .iter()
            .filter(|(pid, _)| pid == partition_id)
            .map(|(_, reason)| *reason)
            .collect()
    }
}

/// Records every callback. Optionally rejects events or checkpoints each one.
pub struct RecordingProcessor {
    pub observed: Arc<Observed>,
    /// Reject every n-th event of a partition (1-based).
    pub fail_every: Option<usize>,
    pub checkpoint_each: bool,
    seen: usize,
}

impl RecordingProcessor {
    pub fn new(observed: Arc<Observed>) -> Self {
        Self {
            observed,
            fail_every: None,
            checkpoint_each: false,
            seen: 0,
        }
    }
}

#[async_trait]
impl PartitionProcessor for RecordingProcessor {
    async fn initialize(&mut self, context: &mut InitializationContext) -> CallbackResult {
        self.observed
            .initialized
            .lock()
            .unwrap()
            .push(context.partition_context.partition_id.clone());
        Ok(())
    }

    async fn process_event(&mut self, event: ProcessorEvent) -> CallbackResult {
        self.seen += 1;
        self.observed.events.lock().unwrap().push((
            event.partition_context().partition_id.clone(),
            event.data().sequence_number,
        ));
        if let Some(n) = self.fail_every {
            if self.seen % n == 0 {
                return Err(format!("rejected event #{}", self.seen).into());
            }
        }
        if self.checkpoint_each {
            event.update_checkpoint().await?;
        }
        Ok(())
    }

    async fn process_error(&mut self, context: ProcessorErrorContext) -> CallbackResult {
        self.observed.errors.lock().unwrap().push((
            context.partition_context.partition_id.clone(),
            context.operation,
        ));
        Ok(())
    }

    async fn close(&mut self, context: CloseContext) -> CallbackResult {
        self.observed
            .closes
            .lock()
            .unwrap()
            .push((context.partition_context.partition_id.clone(), context.reason));
        Ok(())
    }
}

pub fn fast_config() -> ProcessorConfig {
    ProcessorConfig::default()
        .with_load_balancing_interval(Duration::from_millis(40))
        .with_ownership_expiration(Duration::from_secs(30))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub struct ProcessorOptions {
    pub owner_id: String,
    pub config: ProcessorConfig,
    pub fail_every: Option<usize>,
    pub checkpoint_each: bool,
}

impl ProcessorOptions {
    pub fn owner(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            config: fast_config(),
            fail_every: None,
            checkpoint_each: false,
        }
    }
}

pub fn build_processor(
    hub: &Arc<MockEventHub>,
    store: &InMemoryCheckpointStore,
    observed: &Arc<Observed>,
    options: ProcessorOptions,
) -> EventProcessor {
    let observed = observed.clone();
    let fail_every = options.fail_every;
    let checkpoint_each = options.checkpoint_each;
    EventProcessorBuilder::new()
        .fully_qualified_namespace(NAMESPACE)
        .event_hub_name(HUB)
        .consumer_group(GROUP)
        .owner_id(options.owner_id)
        .checkpoint_store(Arc::new(store.clone()))
        .connection_factory(MockConnectionFactory::new(hub.clone()))
        .config(options.config)
        .processor_factory(Arc::new(move || -> Box<dyn PartitionProcessor> {
            let mut processor = RecordingProcessor::new(observed.clone());
            processor.fail_every = fail_every;
            processor.checkpoint_each = checkpoint_each;
            Box::new(processor)
        }))
        .build()
        .expect("processor should build")
}

pub fn balancer(
    owner_id: &str,
    hub: &Arc<MockEventHub>,
    store: &InMemoryCheckpointStore,
) -> OwnershipBalancer {
    OwnershipBalancer::new(
        NAMESPACE,
        HUB,
        GROUP,
        owner_id,
        Duration::from_secs(30),
        Arc::new(store.clone()),
        Arc::new(SharedConnection::new(MockConnectionFactory::new(hub.clone()))),
    )
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn as_set(ids: &[String]) -> HashSet<String> {
    ids.iter().cloned().collect()
}
