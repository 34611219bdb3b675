//! One receive pump per owned partition.
//!
//! The pump table is the mutual-exclusion point of the processor: a slot is
//! reserved in the [`DashMap`] before any async work happens, so a second
//! start for the same partition always sees the first one.
//!
//! ```text
//!   start ─► reserve slot ─► initialize ─► read checkpoint ─► open receiver
//!                                                                 │
//!                  ┌──────────────────────────────────────────────┘
//!                  ▼
//!               Running ──event──► process_event ──► checkpoint policy
//!                  │
//!     stop signal / receive error / stream end
//!                  │
//!                  ▼
//!            close callback ─► close consumer ─► free slot
//! ```
//!
//! A pump removes only its own slot (matched by pump id), so a pump that is
//! still winding down never evicts its successor.
//!
//! The processor instance and the open consumer live in a [`PumpResources`]
//! shared between the task and its slot. A pump that overruns the shutdown
//! timeout is aborted, and the stopping side then closes its links and runs
//! the close callback itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::callbacks::{
    PartitionProcessor, PartitionProcessorFactory, close_processor, guarded, report_error,
};
use super::checkpoint_store::CheckpointStore;
use super::config::ProcessorConfig;
use super::context::{
    CloseContext, CloseReason, InitializationContext, ProcessorErrorContext, ProcessorEvent,
};
use super::metrics;
use super::partition_consumer::{PartitionConsumer, PartitionReceiver};
use super::retry::with_store_policy;
use super::transport::SharedConnection;
use crate::constants::{
    DIAGNOSTIC_ID_PROPERTY, OPERATION_CHECKPOINT_UPDATE, OPERATION_PARTITION_INITIALIZATION,
    OPERATION_RECEIVE, OPERATION_USER_CODE,
};
use crate::types::{EventPosition, PartitionContext, PartitionEvent, PartitionOwnership};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a registered pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Slot reserved; initializing or connecting.
    Starting,
    /// Receiving events.
    Running,
}

/// Per-pump state reachable from both the task and its slot.
struct PumpResources {
    partition_context: PartitionContext,
    processor: tokio::sync::Mutex<Box<dyn PartitionProcessor>>,
    /// Set once the receiver is open; taken when it is closed.
    consumer: Mutex<Option<PartitionConsumer>>,
    close_started: AtomicBool,
}

impl PumpResources {
    fn new(partition_context: PartitionContext, processor: Box<dyn PartitionProcessor>) -> Self {
        Self {
            partition_context,
            processor: tokio::sync::Mutex::new(processor),
            consumer: Mutex::new(None),
            close_started: AtomicBool::new(false),
        }
    }

    /// Run the close callback. Only the first call does anything.
    async fn close(&self, reason: CloseReason) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut processor = self.processor.lock().await;
        close_processor(
            processor.as_mut(),
            CloseContext {
                partition_context: self.partition_context.clone(),
                reason,
            },
        )
        .await;
    }

    async fn close_consumer(&self) -> bool {
        let consumer = lock(&self.consumer).take();
        match consumer {
            Some(consumer) => {
                consumer.close().await;
                true
            }
            None => false,
        }
    }

    /// Clean up after the pump task was aborted.
    ///
    /// A pump that never opened its receiver owes no close callback.
    async fn abandon(&self, reason: CloseReason, timeout: Duration) {
        if !self.close_consumer().await {
            return;
        }
        if tokio::time::timeout(timeout, self.close(reason)).await.is_err() {
            warn!(
                partition_id = %self.partition_context.partition_id,
                "Close callback of aborted pump did not finish in time"
            );
        }
        metrics::record_pump_closed(reason.as_str());
    }
}

struct PumpEntry {
    pump_id: u64,
    /// Taken by the first stop signal, so later signals cannot change the reason.
    stop_tx: Mutex<Option<oneshot::Sender<CloseReason>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    resources: Arc<PumpResources>,
}

impl PumpEntry {
    fn signal(&self, reason: CloseReason) {
        if let Some(stop_tx) = lock(&self.stop_tx).take() {
            // The pump may already have finished.
            let _ = stop_tx.send(reason);
        }
    }

    fn take_task(&self) -> Option<StoppingPump> {
        lock(&self.task).take().map(|handle| StoppingPump {
            pump_id: self.pump_id,
            handle,
            resources: self.resources.clone(),
        })
    }
}

/// A signalled pump the caller waits for.
struct StoppingPump {
    pump_id: u64,
    handle: JoinHandle<()>,
    resources: Arc<PumpResources>,
}

type PumpTable = Arc<DashMap<String, PumpEntry>>;

/// Free a slot if it still belongs to `pump_id`.
fn release_slot(pumps: &PumpTable, partition_id: &str, pump_id: u64) {
    if pumps
        .remove_if(partition_id, |_, entry| entry.pump_id == pump_id)
        .is_some()
    {
        metrics::pump_unregistered();
    }
}

pub struct PartitionPumpManager {
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    connection: Arc<SharedConnection>,
    factory: Arc<dyn PartitionProcessorFactory>,
    pumps: PumpTable,
    next_pump_id: AtomicU64,
}

impl PartitionPumpManager {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn CheckpointStore>,
        connection: Arc<SharedConnection>,
        factory: Arc<dyn PartitionProcessorFactory>,
    ) -> Self {
        Self {
            config,
            store,
            connection,
            factory,
            pumps: Arc::new(DashMap::new()),
            next_pump_id: AtomicU64::new(1),
        }
    }

    /// Start a pump for a claimed partition.
    ///
    /// Returns `false`, and does nothing else, when a pump for this
    /// partition is already registered.
    pub fn start_partition_pump(&self, ownership: &PartitionOwnership) -> bool {
        let partition_id = ownership.partition_id.clone();
        let (stop_tx, stop_rx) = oneshot::channel();

        let pump = match self.pumps.entry(partition_id.clone()) {
            Entry::Occupied(_) => {
                info!(
                    partition_id = %partition_id,
                    "Partition pump already active, ignoring start"
                );
                return false;
            }
            Entry::Vacant(slot) => {
                let pump = self.new_pump(ownership);
                slot.insert(PumpEntry {
                    pump_id: pump.pump_id,
                    stop_tx: Mutex::new(Some(stop_tx)),
                    task: Mutex::new(None),
                    running: pump.running.clone(),
                    resources: pump.resources.clone(),
                });
                pump
            }
        };
        metrics::pump_registered();

        let pump_id = pump.pump_id;
        let handle = tokio::spawn(pump.run(stop_rx));

        if let Some(entry) = self.pumps.get(&partition_id) {
            if entry.pump_id == pump_id {
                *lock(&entry.task) = Some(handle);
            }
        }
        debug!(partition_id = %partition_id, pump_id, "Partition pump spawned");
        true
    }

    fn new_pump(&self, ownership: &PartitionOwnership) -> Pump {
        let partition_context = ownership.partition_context();
        Pump {
            pump_id: self.next_pump_id.fetch_add(1, Ordering::SeqCst),
            resources: Arc::new(PumpResources::new(
                partition_context.clone(),
                self.factory.create_processor(),
            )),
            partition_context,
            config: self.config.clone(),
            store: self.store.clone(),
            connection: self.connection.clone(),
            pumps: self.pumps.clone(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop one pump and wait for it, up to the shutdown timeout.
    ///
    /// Returns `false` if no pump was registered for the partition.
    pub async fn stop_partition_pump(&self, partition_id: &str, reason: CloseReason) -> bool {
        let stopping = match self.pumps.get(partition_id) {
            Some(entry) => {
                entry.signal(reason);
                entry.take_task()
            }
            None => return false,
        };
        info!(partition_id, reason = %reason, "Stopping partition pump");

        if let Some(stopping) = stopping {
            self.await_pump(partition_id, stopping, reason).await;
        }
        true
    }

    async fn await_pump(&self, partition_id: &str, stopping: StoppingPump, reason: CloseReason) {
        let StoppingPump {
            pump_id,
            mut handle,
            resources,
        } = stopping;

        match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(partition_id, error = %e, "Partition pump task failed");
                resources.abandon(reason, self.config.shutdown_timeout).await;
                release_slot(&self.pumps, partition_id, pump_id);
            }
            Err(_) => {
                warn!(partition_id, "Partition pump did not stop in time, aborting");
                handle.abort();
                // Once the task is gone its hold on the processor is released.
                let _ = handle.await;
                resources.abandon(reason, self.config.shutdown_timeout).await;
                release_slot(&self.pumps, partition_id, pump_id);
            }
        }
    }

    /// Stop every pump concurrently. One slow pump does not hold up the
    /// others beyond the shutdown timeout.
    pub async fn stop_all_partition_pumps(&self) {
        let reason = CloseReason::EventProcessorShutdown;
        let stopping: Vec<(String, Option<StoppingPump>)> = self
            .pumps
            .iter()
            .map(|entry| {
                entry.signal(reason);
                (entry.key().clone(), entry.take_task())
            })
            .collect();

        if stopping.is_empty() {
            return;
        }
        info!(pumps = stopping.len(), "Stopping all partition pumps");

        futures::future::join_all(stopping.into_iter().filter_map(|(partition_id, stopping)| {
            stopping.map(|stopping| async move {
                self.await_pump(&partition_id, stopping, reason).await
            })
        }))
        .await;

        // Slots whose task handle was never recorded.
        self.pumps.retain(|_, _| {
            metrics::pump_unregistered();
            false
        });
        info!("All partition pumps stopped");
    }

    /// Partition ids with a registered pump, in partition order.
    pub fn active_partition_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pumps.iter().map(|e| e.key().clone()).collect();
        ids.sort_by(|a, b| crate::types::compare_partition_ids(a, b));
        ids
    }

    pub fn is_pump_active(&self, partition_id: &str) -> bool {
        self.pumps.contains_key(partition_id)
    }

    pub fn pump_state(&self, partition_id: &str) -> Option<PumpState> {
        self.pumps.get(partition_id).map(|entry| {
            if entry.running.load(Ordering::SeqCst) {
                PumpState::Running
            } else {
                PumpState::Starting
            }
        })
    }

    pub fn pump_count(&self) -> usize {
        self.pumps.len()
    }
}

// =============================================================================
// Pump Task
// =============================================================================

struct Pump {
    partition_context: PartitionContext,
    pump_id: u64,
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    connection: Arc<SharedConnection>,
    resources: Arc<PumpResources>,
    pumps: PumpTable,
    running: Arc<AtomicBool>,
}

impl Pump {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<CloseReason>) {
        if let Some(receiver) = self.open().await {
            self.running.store(true, Ordering::SeqCst);
            info!(
                partition_id = %self.partition_context.partition_id,
                pump_id = self.pump_id,
                "Partition pump running"
            );

            let reason = self.pump(receiver, &mut stop_rx).await;

            self.resources.close(reason).await;
            self.resources.close_consumer().await;
            metrics::record_pump_closed(reason.as_str());
            info!(
                partition_id = %self.partition_context.partition_id,
                reason = %reason,
                "Partition pump closed"
            );
        }

        release_slot(&self.pumps, &self.partition_context.partition_id, self.pump_id);
    }

    async fn report(
        &mut self,
        error: impl Into<crate::error::CallbackError>,
        operation: &'static str,
    ) {
        let context = ProcessorErrorContext::new(self.partition_context.clone(), error, operation);
        let mut processor = self.resources.processor.lock().await;
        report_error(processor.as_mut(), context).await;
    }

    /// Initialize, pick the start position, and open the receiver.
    async fn open(&mut self) -> Option<PartitionReceiver> {
        let ctx = self.partition_context.clone();

        let mut init = InitializationContext::new(ctx.clone(), self.config.initial_position);
        let initialized = {
            let mut processor = self.resources.processor.lock().await;
            guarded(processor.initialize(&mut init)).await
        };
        if let Err(e) = initialized {
            warn!(partition_id = %ctx.partition_id, error = %e, "Partition initialization failed");
            self.report(e, OPERATION_PARTITION_INITIALIZATION).await;
            return None;
        }

        let position = start_position(self.store.as_ref(), &ctx, init.initial_position).await;

        let transport = match self.connection.get().await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    partition_id = %ctx.partition_id,
                    error = %e,
                    "Could not connect partition pump"
                );
                self.report(e, OPERATION_PARTITION_INITIALIZATION).await;
                return None;
            }
        };

        debug!(
            partition_id = %ctx.partition_id,
            position = %position,
            "Opening partition receiver"
        );
        let consumer = PartitionConsumer::new(ctx, transport, self.config.receive_options());
        let receiver = consumer.receive(position);
        *lock(&self.resources.consumer) = Some(consumer);
        Some(receiver)
    }

    async fn pump(
        &mut self,
        mut receiver: PartitionReceiver,
        stop_rx: &mut oneshot::Receiver<CloseReason>,
    ) -> CloseReason {
        let mut since_checkpoint = 0u64;
        let mut last_checkpoint = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                reason = &mut *stop_rx => {
                    // A dropped sender means the slot is gone.
                    return reason.unwrap_or(CloseReason::EventProcessorShutdown);
                }
                next = receiver.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let offset = event.data.offset;
                    let sequence_number = event.data.sequence_number;
                    if !self.dispatch(event).await {
                        continue;
                    }
                    since_checkpoint += 1;
                    if self
                        .config
                        .checkpoint_policy
                        .is_due(since_checkpoint, last_checkpoint.elapsed())
                    {
                        self.policy_checkpoint(offset, sequence_number).await;
                        since_checkpoint = 0;
                        last_checkpoint = Instant::now();
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        partition_id = %self.partition_context.partition_id,
                        error = %e,
                        "Receive failed, closing partition pump"
                    );
                    self.report(e, OPERATION_RECEIVE).await;
                    return CloseReason::LostPartitionOwnership;
                }
                None => {
                    debug!(
                        partition_id = %self.partition_context.partition_id,
                        "Receive stream completed"
                    );
                    return CloseReason::EventProcessorShutdown;
                }
            }
        }
    }

    /// Hand one event to `process_event`. Returns whether it succeeded.
    async fn dispatch(&mut self, event: PartitionEvent) -> bool {
        let diagnostic_id = event.data.properties.get(DIAGNOSTIC_ID_PROPERTY).cloned();
        let sequence_number = event.data.sequence_number;
        let processor_event = ProcessorEvent::new(event, self.store.clone());

        let result = {
            let mut processor = self.resources.processor.lock().await;
            match diagnostic_id {
                Some(diagnostic_id) => {
                    let span = info_span!(
                        "process_event",
                        partition_id = %self.partition_context.partition_id,
                        sequence_number,
                        diagnostic_id = %diagnostic_id,
                    );
                    guarded(processor.process_event(processor_event))
                        .instrument(span)
                        .await
                }
                None => guarded(processor.process_event(processor_event)).await,
            }
        };

        metrics::record_event_processed(result.is_ok());
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    partition_id = %self.partition_context.partition_id,
                    sequence_number,
                    error = %e,
                    "process_event failed"
                );
                self.report(e, OPERATION_USER_CODE).await;
                false
            }
        }
    }

    async fn policy_checkpoint(&mut self, offset: i64, sequence_number: i64) {
        let checkpoint = self
            .partition_context
            .checkpoint(Some(offset), Some(sequence_number));
        let store = self.store.clone();
        let result = with_store_policy(|| {
            let store = store.clone();
            let checkpoint = checkpoint.clone();
            async move { store.update_checkpoint(checkpoint).await }
        })
        .await;
        metrics::record_checkpoint_update(result.is_ok());

        if let Err(e) = result {
            self.report(e, OPERATION_CHECKPOINT_UPDATE).await;
        }
    }
}

/// Resume after the stored checkpoint, or fall back to `fallback`.
async fn start_position(
    store: &dyn CheckpointStore,
    ctx: &PartitionContext,
    fallback: EventPosition,
) -> EventPosition {
    match store
        .get_checkpoint(
            &ctx.fully_qualified_namespace,
            &ctx.event_hub_name,
            &ctx.consumer_group,
            &ctx.partition_id,
        )
        .await
    {
        Ok(Some(checkpoint)) => checkpoint.resume_position().unwrap_or(fallback),
        Ok(None) => fallback,
        Err(e) => {
            warn!(
                partition_id = %ctx.partition_id,
                error = %e,
                "Failed to read checkpoint, using initial position"
            );
            fallback
        }
    }
}
