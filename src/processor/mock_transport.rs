//! In-memory transport for tests and local runs.
//!
//! [`MockEventHub`] holds one append-only log per partition. Every connection
//! opened through [`MockConnectionFactory`] reads from the same hub, so
//! several processors can compete for the same partitions in one process.
//!
//! Links obey credits strictly: a message leaves a [`MockReceiveLink`] only
//! when the reader polls and a credit is available. When credits run out the
//! link asks its empty-credit listener before parking.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::{BoxStream, Stream, StreamExt};

use super::transport::{
    ConnectionFactory, CreditListener, EventHubTransport, ReceiveLink, ReceiveOptions,
};
use crate::constants::{
    ENQUEUED_TIME_ANNOTATION, LAST_ENQUEUED_OFFSET_ANNOTATION,
    LAST_ENQUEUED_SEQUENCE_NUMBER_ANNOTATION, LAST_ENQUEUED_TIME_ANNOTATION, OFFSET_ANNOTATION,
    SEQUENCE_NUMBER_ANNOTATION,
};
use crate::error::{ShutdownSignal, TransportError, TransportResult};
use crate::types::{EventPosition, LinkMessage};

/// Offset distance between consecutive events in a mock partition.
pub const MOCK_OFFSET_STRIDE: i64 = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stored event with its system properties.
#[derive(Debug, Clone)]
struct StoredEvent {
    sequence_number: i64,
    offset: i64,
    enqueued_ms: i64,
    message: LinkMessage,
}

fn admits(position: &EventPosition, event: &StoredEvent) -> bool {
    match position {
        EventPosition::Earliest => true,
        EventPosition::Latest => false,
        EventPosition::Offset { offset, inclusive } => {
            event.offset > *offset || (*inclusive && event.offset == *offset)
        }
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive,
        } => {
            event.sequence_number > *sequence_number
                || (*inclusive && event.sequence_number == *sequence_number)
        }
        EventPosition::EnqueuedTime(t) => event.enqueued_ms > t.timestamp_millis(),
    }
}

// =============================================================================
// Hub
// =============================================================================

pub struct MockEventHub {
    event_hub_name: String,
    partitions: Mutex<BTreeMap<String, Vec<StoredEvent>>>,
    links: Mutex<Vec<Arc<MockReceiveLink>>>,
    failing_partition_queries: AtomicU64,
    failing_links: AtomicU64,
}

impl MockEventHub {
    /// Hub with partitions "0".."count-1".
    pub fn new(event_hub_name: &str, partition_count: usize) -> Arc<Self> {
        let ids: Vec<String> = (0..partition_count).map(|i| i.to_string()).collect();
        Self::with_partition_ids(event_hub_name, &ids)
    }

    pub fn with_partition_ids<S: AsRef<str>>(event_hub_name: &str, ids: &[S]) -> Arc<Self> {
        let partitions = ids
            .iter()
            .map(|id| (id.as_ref().to_string(), Vec::new()))
            .collect();
        Arc::new(Self {
            event_hub_name: event_hub_name.to_string(),
            partitions: Mutex::new(partitions),
            links: Mutex::new(Vec::new()),
            failing_partition_queries: AtomicU64::new(0),
            failing_links: AtomicU64::new(0),
        })
    }

    pub fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    pub fn partition_ids(&self) -> Vec<String> {
        lock(&self.partitions).keys().cloned().collect()
    }

    /// Append an event; returns its sequence number.
    pub fn publish(&self, partition_id: &str, body: impl Into<Bytes>) -> i64 {
        self.publish_message(partition_id, LinkMessage::new(body))
    }

    /// Append a message, stamping system annotations on it.
    pub fn publish_message(&self, partition_id: &str, message: LinkMessage) -> i64 {
        let mut partitions = lock(&self.partitions);
        let log = partitions.entry(partition_id.to_string()).or_default();
        let sequence_number = log.len() as i64;
        let offset = sequence_number * MOCK_OFFSET_STRIDE;
        let enqueued_ms = Utc::now().timestamp_millis();
        let message = message
            .with_annotation(SEQUENCE_NUMBER_ANNOTATION, sequence_number)
            .with_annotation(OFFSET_ANNOTATION, offset)
            .with_annotation(ENQUEUED_TIME_ANNOTATION, enqueued_ms);
        let event = StoredEvent {
            sequence_number,
            offset,
            enqueued_ms,
            message,
        };
        log.push(event.clone());

        // Links are notified under the partitions lock so a link opened
        // concurrently sees the event exactly once.
        for link in lock(&self.links).iter() {
            if link.partition_id == partition_id && !link.is_closed() {
                let live = matches!(link.position, EventPosition::Latest)
                    || admits(&link.position, &event);
                if live {
                    link.enqueue(link.annotate_last_enqueued(&event, &event));
                }
            }
        }
        sequence_number
    }

    fn open_link(
        &self,
        link_name: &str,
        entity_path: &str,
        position: EventPosition,
        options: &ReceiveOptions,
    ) -> TransportResult<Arc<MockReceiveLink>> {
        let partition_id = entity_path
            .rsplit_once("/Partitions/")
            .map(|(_, id)| id.to_string())
            .ok_or_else(|| TransportError::link("amqp:not-found", entity_path, false))?;

        let partitions = lock(&self.partitions);
        let log = partitions.get(&partition_id).ok_or_else(|| {
            TransportError::link(
                "amqp:not-found",
                format!("partition {} does not exist", partition_id),
                false,
            )
        })?;

        let link = Arc::new(MockReceiveLink::new(
            link_name,
            entity_path,
            &partition_id,
            position,
            options.clone(),
        ));
        if let Some(last) = log.last() {
            for event in log.iter().filter(|e| admits(&position, e)) {
                link.enqueue(link.annotate_last_enqueued(event, last));
            }
        }
        lock(&self.links).push(link.clone());
        Ok(link)
    }

    /// Every link ever opened, in creation order.
    pub fn links(&self) -> Vec<Arc<MockReceiveLink>> {
        lock(&self.links).clone()
    }

    pub fn links_for(&self, partition_id: &str) -> Vec<Arc<MockReceiveLink>> {
        lock(&self.links)
            .iter()
            .filter(|l| l.partition_id == partition_id)
            .cloned()
            .collect()
    }

    pub fn open_links_for(&self, partition_id: &str) -> Vec<Arc<MockReceiveLink>> {
        self.links_for(partition_id)
            .into_iter()
            .filter(|l| !l.is_closed())
            .collect()
    }

    /// Fail the next `count` partition metadata queries.
    pub fn fail_next_partition_queries(&self, count: u64) {
        self.failing_partition_queries.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` link creations with a non-transient error.
    pub fn fail_next_links(&self, count: u64) {
        self.failing_links.store(count, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Link
// =============================================================================

#[derive(Default)]
struct LinkState {
    credits: u32,
    pending: VecDeque<LinkMessage>,
    listener: Option<CreditListener>,
    /// Every `add_credits` call, in order.
    credit_log: Vec<u32>,
    /// Credits granted by the empty-credit listener.
    listener_grants: Vec<u32>,
    delivered: u64,
    closed: bool,
    receive_taken: bool,
    waker: Option<Waker>,
}

pub struct MockReceiveLink {
    name: String,
    entity_path: String,
    partition_id: String,
    position: EventPosition,
    options: ReceiveOptions,
    state: Arc<Mutex<LinkState>>,
    errors_tx: mpsc::UnboundedSender<TransportError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportError>>>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownSignal>,
    shutdown_rx: Mutex<Option<mpsc::UnboundedReceiver<ShutdownSignal>>>,
}

impl MockReceiveLink {
    fn new(
        name: &str,
        entity_path: &str,
        partition_id: &str,
        position: EventPosition,
        options: ReceiveOptions,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded();
        Self {
            name: name.to_string(),
            entity_path: entity_path.to_string(),
            partition_id: partition_id.to_string(),
            position,
            options,
            state: Arc::new(Mutex::new(LinkState::default())),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    fn annotate_last_enqueued(&self, event: &StoredEvent, last: &StoredEvent) -> LinkMessage {
        if !self.options.track_last_enqueued_event_properties {
            return event.message.clone();
        }
        event
            .message
            .clone()
            .with_annotation(LAST_ENQUEUED_SEQUENCE_NUMBER_ANNOTATION, last.sequence_number)
            .with_annotation(LAST_ENQUEUED_OFFSET_ANNOTATION, last.offset)
            .with_annotation(LAST_ENQUEUED_TIME_ANNOTATION, last.enqueued_ms)
    }

    fn enqueue(&self, message: LinkMessage) {
        let mut state = lock(&self.state);
        state.pending.push_back(message);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn position(&self) -> EventPosition {
        self.position
    }

    pub fn options(&self) -> &ReceiveOptions {
        &self.options
    }

    /// Push a raw message, bypassing annotation stamping.
    pub fn push_raw(&self, message: LinkMessage) {
        self.enqueue(message);
    }

    pub fn inject_error(&self, error: TransportError) {
        let _ = self.errors_tx.unbounded_send(error);
    }

    pub fn inject_shutdown(&self, signal: ShutdownSignal) {
        let _ = self.shutdown_tx.unbounded_send(signal);
    }

    /// End the message stream as if the service completed it.
    pub fn complete(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn credit_log(&self) -> Vec<u32> {
        lock(&self.state).credit_log.clone()
    }

    pub fn listener_grants(&self) -> Vec<u32> {
        lock(&self.state).listener_grants.clone()
    }

    pub fn delivered(&self) -> u64 {
        lock(&self.state).delivered
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Call the registered empty-credit listener without delivering anything.
    pub fn query_empty_credit_listener(&self) -> Option<u32> {
        let listener = lock(&self.state).listener.clone();
        listener.map(|l| l())
    }
}

struct MockMessageStream {
    state: Arc<Mutex<LinkState>>,
}

impl Stream for MockMessageStream {
    type Item = LinkMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Poll::Ready(None);
        }
        if state.pending.is_empty() {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if state.credits == 0 {
            if let Some(listener) = state.listener.clone() {
                let granted = listener();
                if granted > 0 {
                    state.credits += granted;
                    state.listener_grants.push(granted);
                }
            }
        }
        if state.credits == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        state.credits -= 1;
        state.delivered += 1;
        Poll::Ready(state.pending.pop_front())
    }
}

#[async_trait]
impl ReceiveLink for MockReceiveLink {
    fn link_name(&self) -> &str {
        &self.name
    }

    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn receive(&self) -> BoxStream<'static, LinkMessage> {
        let mut state = lock(&self.state);
        if state.receive_taken {
            return futures::stream::empty().boxed();
        }
        state.receive_taken = true;
        MockMessageStream {
            state: self.state.clone(),
        }
        .boxed()
    }

    fn add_credits(&self, credits: u32) {
        let mut state = lock(&self.state);
        state.credits += credits;
        state.credit_log.push(credits);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    fn credits(&self) -> u32 {
        lock(&self.state).credits
    }

    fn set_empty_credit_listener(&self, listener: CreditListener) {
        lock(&self.state).listener = Some(listener);
    }

    fn shutdown_signals(&self) -> BoxStream<'static, ShutdownSignal> {
        match lock(&self.shutdown_rx).take() {
            Some(rx) => rx.boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    fn errors(&self) -> BoxStream<'static, TransportError> {
        match lock(&self.errors_rx).take() {
            Some(rx) => rx.boxed(),
            None => futures::stream::empty().boxed(),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.complete();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

// =============================================================================
// Connections
// =============================================================================

pub struct MockConnection {
    id: usize,
    hub: Arc<MockEventHub>,
    closed: AtomicBool,
    links: Mutex<Vec<Arc<MockReceiveLink>>>,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn link_count(&self) -> usize {
        lock(&self.links).len()
    }
}

#[async_trait]
impl EventHubTransport for MockConnection {
    async fn partition_ids(&self, event_hub_name: &str) -> TransportResult<Vec<String>> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(format!("connection {}", self.id)));
        }
        if take_one(&self.hub.failing_partition_queries) {
            return Err(TransportError::Management("injected metadata failure".to_string()));
        }
        if event_hub_name != self.hub.event_hub_name {
            return Err(TransportError::Management(format!(
                "event hub {} not found",
                event_hub_name
            )));
        }
        Ok(self.hub.partition_ids())
    }

    async fn create_receive_link(
        &self,
        link_name: &str,
        entity_path: &str,
        position: EventPosition,
        options: &ReceiveOptions,
    ) -> TransportResult<Arc<dyn ReceiveLink>> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(format!("connection {}", self.id)));
        }
        if take_one(&self.hub.failing_links) {
            return Err(TransportError::link(
                "amqp:resource-limit-exceeded",
                "injected link failure",
                false,
            ));
        }
        let link = self.hub.open_link(link_name, entity_path, position, options)?;
        lock(&self.links).push(link.clone());
        Ok(link)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let links = std::mem::take(&mut *lock(&self.links));
        for link in links {
            link.complete();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens a new [`MockConnection`] on every `connect()`.
pub struct MockConnectionFactory {
    hub: Arc<MockEventHub>,
    next_id: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    pub fn new(hub: Arc<MockEventHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            next_id: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn hub(&self) -> &Arc<MockEventHub> {
        &self.hub
    }

    pub fn connect_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self) -> TransportResult<Arc<dyn EventHubTransport>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            id,
            hub: self.hub.clone(),
            closed: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
        });
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}
