//! The public coordinator.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::background_tasks::FixedDelayTask;
use super::callbacks::{PartitionProcessorFactory, report_error};
use super::checkpoint_store::CheckpointStore;
use super::config::ProcessorConfig;
use super::context::{CloseReason, ProcessorErrorContext};
use super::ownership_balancer::OwnershipBalancer;
use super::pump_manager::{PartitionPumpManager, PumpState};
use super::transport::{ConnectionFactory, SharedConnection};
use crate::constants::OPERATION_LOAD_BALANCING;
use crate::error::ProcessorError;
use crate::types::PartitionContext;

const LOAD_BALANCING_TASK: &str = "load_balancing";

/// Everything the balancing loop needs, shared with its task.
struct ProcessorCore {
    identifier: String,
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    config: ProcessorConfig,
    balancer: OwnershipBalancer,
    pumps: PartitionPumpManager,
    factory: Arc<dyn PartitionProcessorFactory>,
}

impl ProcessorCore {
    /// One load-balancing cycle: claim, then start and stop pumps.
    async fn balance(&self) {
        let active: HashSet<String> = self.pumps.active_partition_ids().into_iter().collect();

        let outcome = match self.balancer.run_cycle(&active).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    owner_id = %self.identifier,
                    error = %e,
                    "Load balancing cycle failed"
                );
                self.report_processor_error(e).await;
                return;
            }
        };

        futures::future::join_all(
            outcome.lost.iter().map(|pid| {
                self.pumps
                    .stop_partition_pump(pid, CloseReason::LostPartitionOwnership)
            }),
        )
        .await;

        for ownership in &outcome.newly_claimed {
            self.pumps.start_partition_pump(ownership);
        }

        debug!(
            owner_id = %self.identifier,
            owned = outcome.owned.len(),
            started = outcome.newly_claimed.len(),
            stopped = outcome.lost.len(),
            "Load balancing cycle complete"
        );
    }

    /// Errors that belong to no partition go to a dedicated callback instance.
    async fn report_processor_error(&self, error: ProcessorError) {
        let mut processor = self.factory.create_processor();
        let context = ProcessorErrorContext::new(
            PartitionContext::processor_level(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            ),
            error,
            OPERATION_LOAD_BALANCING,
        );
        report_error(processor.as_mut(), context).await;
    }
}

/// Consumes every partition of an event hub, sharing the work with other
/// processors in the same consumer group through the checkpoint store.
///
/// Build one with [`EventProcessorBuilder`](super::builder::EventProcessorBuilder).
pub struct EventProcessor {
    core: Arc<ProcessorCore>,
    connection: Arc<SharedConnection>,
    balancing_task: Mutex<Option<FixedDelayTask>>,
    running: AtomicBool,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        identifier: String,
        fully_qualified_namespace: String,
        event_hub_name: String,
        consumer_group: String,
        config: ProcessorConfig,
        checkpoint_store: Arc<dyn CheckpointStore>,
        connection_factory: Arc<dyn ConnectionFactory>,
        factory: Arc<dyn PartitionProcessorFactory>,
    ) -> Self {
        let connection = Arc::new(SharedConnection::new(connection_factory));
        let balancer = OwnershipBalancer::new(
            &fully_qualified_namespace,
            &event_hub_name,
            &consumer_group,
            &identifier,
            config.ownership_expiration,
            checkpoint_store.clone(),
            connection.clone(),
        );
        let pumps = PartitionPumpManager::new(
            config.clone(),
            checkpoint_store,
            connection.clone(),
            factory.clone(),
        );

        Self {
            core: Arc::new(ProcessorCore {
                identifier,
                fully_qualified_namespace,
                event_hub_name,
                consumer_group,
                config,
                balancer,
                pumps,
                factory,
            }),
            connection,
            balancing_task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Owner id written into ownership records.
    pub fn identifier(&self) -> &str {
        &self.core.identifier
    }

    pub fn event_hub_name(&self) -> &str {
        &self.core.event_hub_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.core.consumer_group
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.core.config
    }

    /// Start balancing and pumping. Does nothing if already running.
    pub async fn start(&self) {
        let mut balancing_task = self.balancing_task.lock().await;
        if balancing_task.is_some() {
            info!(owner_id = %self.core.identifier, "Event processor already running");
            return;
        }

        let core = self.core.clone();
        *balancing_task = Some(FixedDelayTask::spawn(
            LOAD_BALANCING_TASK,
            self.core.config.load_balancing_interval,
            move |_tick| {
                let core = core.clone();
                async move { core.balance().await }
            },
        ));
        self.running.store(true, Ordering::SeqCst);

        info!(
            owner_id = %self.core.identifier,
            event_hub = %self.core.event_hub_name,
            consumer_group = %self.core.consumer_group,
            interval_ms = self.core.config.load_balancing_interval.as_millis() as u64,
            "Event processor started"
        );
    }

    /// Stop balancing and close every pump.
    ///
    /// Ownership records are left in place, so a restart within the
    /// expiration window picks up the same partitions.
    pub async fn stop(&self) {
        let mut balancing_task = self.balancing_task.lock().await;
        let Some(mut task) = balancing_task.take() else {
            debug!(owner_id = %self.core.identifier, "Event processor not running");
            return;
        };

        task.shutdown(self.core.config.shutdown_timeout).await;
        self.core.pumps.stop_all_partition_pumps().await;
        self.running.store(false, Ordering::SeqCst);
        info!(owner_id = %self.core.identifier, "Event processor stopped");
    }

    /// Stop, then release the transport connection. A later `start` opens a
    /// new one.
    pub async fn close(&self) {
        self.stop().await;
        self.connection.close().await;
        info!(owner_id = %self.core.identifier, "Event processor closed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Partitions with a pump, in partition order.
    pub fn active_partition_ids(&self) -> Vec<String> {
        self.core.pumps.active_partition_ids()
    }

    pub fn pump_state(&self, partition_id: &str) -> Option<PumpState> {
        self.core.pumps.pump_state(partition_id)
    }

    pub fn pump_count(&self) -> usize {
        self.core.pumps.pump_count()
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("identifier", &self.core.identifier)
            .field("event_hub_name", &self.core.event_hub_name)
            .field("consumer_group", &self.core.consumer_group)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
