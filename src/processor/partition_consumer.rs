//! Per-partition receive streams with credit-based backpressure.
//!
//! Each call to [`PartitionConsumer::receive`] opens its own link, so a pump
//! and a manual reader can read the same partition side by side.
//!
//! # Flow control
//!
//! ```text
//!   open          add_credits(prefetch)                    (exactly once)
//!   poll          demand == 0  ──► request(1)
//!   request(n)    demand += n; if credits < demand ──► add_credits(demand - credits)
//!   link empty    empty-credit listener returns current demand (0 when idle)
//!   delivery      demand -= 1
//! ```
//!
//! Credits are never granted beyond outstanding demand after the initial
//! prefetch, so a slow callback cannot make the link buffer without bound.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use tracing::{debug, warn};

use super::metrics;
use super::transport::{
    CreditListener, EventHubTransport, ReceiveLink, ReceiveOptions, generate_link_name,
    partition_entity_path,
};
use crate::constants::{
    LAST_ENQUEUED_OFFSET_ANNOTATION, LAST_ENQUEUED_SEQUENCE_NUMBER_ANNOTATION,
    LAST_ENQUEUED_TIME_ANNOTATION,
};
use crate::error::{ReceiveError, ShutdownSignal, TransportError, TransportResult};
use crate::types::{
    EventData, EventPosition, LastEnqueuedEventProperties, LinkMessage, PartitionContext,
    PartitionEvent,
};

type OpenLinks = Arc<DashMap<String, Arc<dyn ReceiveLink>>>;
type ReceiveItem = Result<PartitionEvent, ReceiveError>;

/// Reads one partition. Cheap to share behind an `Arc`.
pub struct PartitionConsumer {
    partition_context: PartitionContext,
    transport: Arc<dyn EventHubTransport>,
    options: ReceiveOptions,
    links: OpenLinks,
    closed: Arc<AtomicBool>,
}

impl PartitionConsumer {
    pub fn new(
        partition_context: PartitionContext,
        transport: Arc<dyn EventHubTransport>,
        options: ReceiveOptions,
    ) -> Self {
        Self {
            partition_context,
            transport,
            options,
            links: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn partition_context(&self) -> &PartitionContext {
        &self.partition_context
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_context.partition_id
    }

    /// Open a new subscription starting at `position`.
    ///
    /// The link is created lazily on first poll.
    pub fn receive(&self, position: EventPosition) -> PartitionReceiver {
        let link_name = generate_link_name();
        let entity_path = partition_entity_path(
            &self.partition_context.event_hub_name,
            &self.partition_context.consumer_group,
            &self.partition_context.partition_id,
        );
        let transport = self.transport.clone();
        let options = self.options.clone();

        debug!(
            partition_id = %self.partition_context.partition_id,
            link_name = %link_name,
            position = %position,
            "Creating receive subscription"
        );

        let connect: BoxFuture<'static, TransportResult<Arc<dyn ReceiveLink>>> = async move {
            transport
                .create_receive_link(&link_name, &entity_path, position, &options)
                .await
        }
        .boxed();

        let state = if self.closed.load(Ordering::SeqCst) {
            ReceiverState::Done
        } else {
            ReceiverState::Connecting(connect)
        };

        PartitionReceiver {
            partition_context: self.partition_context.clone(),
            prefetch_count: self.options.prefetch_count,
            track_last_enqueued: self.options.track_last_enqueued_event_properties,
            demand: Arc::new(AtomicU64::new(0)),
            state,
            links: self.links.clone(),
            consumer_closed: self.closed.clone(),
        }
    }

    /// Links currently open for this partition.
    pub fn open_link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every link. Idempotent; a failing link does not stop the others.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let links: Vec<Arc<dyn ReceiveLink>> =
            self.links.iter().map(|entry| entry.value().clone()).collect();
        self.links.clear();

        for link in links {
            if let Err(e) = link.close().await {
                warn!(
                    partition_id = %self.partition_context.partition_id,
                    link_name = %link.link_name(),
                    error = %e,
                    "Failed to close receive link"
                );
            }
        }
        debug!(partition_id = %self.partition_context.partition_id, "Partition consumer closed");
    }
}

// =============================================================================
// Receiver
// =============================================================================

struct OpenLink {
    link: Arc<dyn ReceiveLink>,
    messages: BoxStream<'static, LinkMessage>,
    errors: Option<BoxStream<'static, TransportError>>,
    shutdowns: Option<BoxStream<'static, ShutdownSignal>>,
}

enum ReceiverState {
    Connecting(BoxFuture<'static, TransportResult<Arc<dyn ReceiveLink>>>),
    Open(OpenLink),
    Done,
}

/// Ordered event stream of one subscription.
///
/// Ends with `None` on graceful completion or after exactly one
/// `Err(ReceiveError)`.
pub struct PartitionReceiver {
    partition_context: PartitionContext,
    prefetch_count: u32,
    track_last_enqueued: bool,
    /// Outstanding downstream demand.
    demand: Arc<AtomicU64>,
    state: ReceiverState,
    links: OpenLinks,
    consumer_closed: Arc<AtomicBool>,
}

fn top_up(link: &Arc<dyn ReceiveLink>, outstanding: u64) {
    let credits = u64::from(link.credits());
    if credits < outstanding {
        let grant = u32::try_from(outstanding - credits).unwrap_or(u32::MAX);
        link.add_credits(grant);
        metrics::record_credits_added(grant);
    }
}

fn last_enqueued(annotations: &HashMap<String, String>) -> LastEnqueuedEventProperties {
    let parse = |key: &str| annotations.get(key).and_then(|v| v.parse::<i64>().ok());
    LastEnqueuedEventProperties {
        sequence_number: parse(LAST_ENQUEUED_SEQUENCE_NUMBER_ANNOTATION),
        offset: parse(LAST_ENQUEUED_OFFSET_ANNOTATION),
        enqueued_time: parse(LAST_ENQUEUED_TIME_ANNOTATION)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}

impl PartitionReceiver {
    pub fn partition_context(&self) -> &PartitionContext {
        &self.partition_context
    }

    /// Signal demand for `n` more events.
    pub fn request(&self, n: u32) {
        let outstanding = self.demand.fetch_add(u64::from(n), Ordering::SeqCst) + u64::from(n);
        if let ReceiverState::Open(open) = &self.state {
            top_up(&open.link, outstanding);
        }
    }

    pub fn outstanding_demand(&self) -> u64 {
        self.demand.load(Ordering::SeqCst)
    }

    /// Name of the underlying link, once open.
    pub fn link_name(&self) -> Option<String> {
        match &self.state {
            ReceiverState::Open(open) => Some(open.link.link_name().to_string()),
            _ => None,
        }
    }

    fn open(&mut self, link: Arc<dyn ReceiveLink>) {
        let demand = self.demand.clone();
        let listener: CreditListener =
            Arc::new(move || u32::try_from(demand.load(Ordering::SeqCst)).unwrap_or(u32::MAX));
        link.set_empty_credit_listener(listener);

        if self.prefetch_count > 0 {
            link.add_credits(self.prefetch_count);
            metrics::record_credits_added(self.prefetch_count);
        }
        top_up(&link, self.demand.load(Ordering::SeqCst));

        self.links
            .insert(link.link_name().to_string(), link.clone());

        debug!(
            partition_id = %self.partition_context.partition_id,
            link_name = %link.link_name(),
            prefetch = self.prefetch_count,
            "Receive link open"
        );

        // Raced with consumer close: the link missed the sweep.
        if self.consumer_closed.load(Ordering::SeqCst) {
            self.links.remove(link.link_name());
            let stray = link.clone();
            tokio::spawn(async move {
                let _ = stray.close().await;
            });
            self.state = ReceiverState::Done;
            return;
        }

        self.state = ReceiverState::Open(OpenLink {
            messages: link.receive(),
            errors: Some(link.errors()),
            shutdowns: Some(link.shutdown_signals()),
            link,
        });
    }

    fn finish(&mut self, item: Option<ReceiveItem>) -> Poll<Option<ReceiveItem>> {
        self.state = ReceiverState::Done;
        Poll::Ready(item)
    }

    fn poll_open(&mut self, cx: &mut Context<'_>) -> Poll<Option<ReceiveItem>> {
        if self.consumer_closed.load(Ordering::SeqCst) {
            return self.finish(None);
        }

        let ReceiverState::Open(open) = &mut self.state else {
            return Poll::Ready(None);
        };

        if let Some(shutdowns) = open.shutdowns.as_mut() {
            match shutdowns.poll_next_unpin(cx) {
                Poll::Ready(Some(signal)) => {
                    return self.finish(Some(Err(ReceiveError::Shutdown(signal))));
                }
                Poll::Ready(None) => open.shutdowns = None,
                Poll::Pending => {}
            }
        }

        if let Some(errors) = open.errors.as_mut() {
            match errors.poll_next_unpin(cx) {
                Poll::Ready(Some(error)) => {
                    return self.finish(Some(Err(ReceiveError::Link(error))));
                }
                Poll::Ready(None) => open.errors = None,
                Poll::Pending => {}
            }
        }

        if self.demand.load(Ordering::SeqCst) == 0 {
            let outstanding = self.demand.fetch_add(1, Ordering::SeqCst) + 1;
            top_up(&open.link, outstanding);
        }

        match open.messages.poll_next_unpin(cx) {
            Poll::Ready(Some(message)) => {
                let _ = self
                    .demand
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
                let last = self
                    .track_last_enqueued
                    .then(|| last_enqueued(&message.message_annotations));
                match EventData::from_message(message) {
                    Ok(data) => Poll::Ready(Some(Ok(PartitionEvent {
                        partition_context: self.partition_context.clone(),
                        data,
                        last_enqueued: last,
                    }))),
                    Err(e) => self.finish(Some(Err(e))),
                }
            }
            Poll::Ready(None) => self.finish(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for PartitionReceiver {
    type Item = Result<PartitionEvent, ReceiveError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReceiverState::Done => return Poll::Ready(None),
                ReceiverState::Connecting(connect) => match connect.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        return this.finish(Some(Err(ReceiveError::Connect(e))));
                    }
                    Poll::Ready(Ok(link)) => {
                        this.open(link);
                    }
                },
                ReceiverState::Open(_) => return this.poll_open(cx),
            }
        }
    }
}
