//! The transport seam.
//!
//! The processor never speaks a wire protocol itself. It asks an
//! [`EventHubTransport`] for partition metadata and receive links, and drives
//! each [`ReceiveLink`] purely through credits.
//!
//! ```text
//!   ConnectionFactory ──connect()──► EventHubTransport ──create_receive_link()──► ReceiveLink
//!          ▲                                                                     │
//!          │                                                     messages / errors / shutdowns
//!   SharedConnection (lazy, reset by close)                                      ▼
//!                                                                         PartitionReceiver
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::retry::with_connect_policy;
use crate::constants::DEFAULT_OWNER_LEVEL;
use crate::error::{ShutdownSignal, TransportError, TransportResult};
use crate::types::{EventPosition, LinkMessage};

/// Supplier the link calls when it runs out of credits.
///
/// Returns the number of credits the consumer wants right now, zero if none.
pub type CreditListener = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Per-link receive options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Epoch of this reader; a higher level disconnects lower ones.
    pub owner_level: Option<i64>,
    pub track_last_enqueued_event_properties: bool,
    /// Credits granted when a subscription opens.
    pub prefetch_count: u32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            owner_level: Some(DEFAULT_OWNER_LEVEL),
            track_last_enqueued_event_properties: false,
            prefetch_count: crate::constants::DEFAULT_PREFETCH_COUNT,
        }
    }
}

/// One receive link bound to one partition and one start position.
///
/// The three streams may each be taken once. A second call returns an empty
/// stream.
#[async_trait]
pub trait ReceiveLink: Send + Sync {
    fn link_name(&self) -> &str;

    fn entity_path(&self) -> &str;

    /// Messages, metered by credits. Ends when the link closes.
    fn receive(&self) -> BoxStream<'static, LinkMessage>;

    fn add_credits(&self, credits: u32);

    /// Credits granted but not yet consumed.
    fn credits(&self) -> u32;

    fn set_empty_credit_listener(&self, listener: CreditListener);

    fn shutdown_signals(&self) -> BoxStream<'static, ShutdownSignal>;

    fn errors(&self) -> BoxStream<'static, TransportError>;

    async fn close(&self) -> TransportResult<()>;

    fn is_closed(&self) -> bool;
}

/// An open connection to one namespace.
#[async_trait]
pub trait EventHubTransport: Send + Sync {
    /// Partition ids of the event hub, from management metadata.
    async fn partition_ids(&self, event_hub_name: &str) -> TransportResult<Vec<String>>;

    async fn create_receive_link(
        &self,
        link_name: &str,
        entity_path: &str,
        position: EventPosition,
        options: &ReceiveOptions,
    ) -> TransportResult<Arc<dyn ReceiveLink>>;

    async fn close(&self) -> TransportResult<()>;

    fn is_closed(&self) -> bool;
}

/// Opens fresh transport connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> TransportResult<Arc<dyn EventHubTransport>>;
}

/// Entity path of a partition receive link.
pub fn partition_entity_path(
    event_hub_name: &str,
    consumer_group: &str,
    partition_id: &str,
) -> String {
    format!(
        "{}/ConsumerGroups/{}/Partitions/{}",
        event_hub_name, consumer_group, partition_id
    )
}

/// Random link name (`PR` + alphanumeric suffix).
pub fn generate_link_name() -> String {
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(crate::constants::LINK_NAME_SUFFIX_LEN)
        .collect();
    format!("{}{}", crate::constants::LINK_NAME_PREFIX, suffix)
}

/// Lazily-opened connection shared by the balancer and all pumps.
///
/// `close()` drops the connection; the next `get()` opens a new one through
/// the factory.
pub struct SharedConnection {
    factory: Arc<dyn ConnectionFactory>,
    current: Mutex<Option<Arc<dyn EventHubTransport>>>,
}

impl SharedConnection {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// The open connection, connecting first if needed.
    pub async fn get(&self) -> TransportResult<Arc<dyn EventHubTransport>> {
        let mut current = self.current.lock().await;
        if let Some(transport) = current.as_ref() {
            if !transport.is_closed() {
                return Ok(transport.clone());
            }
            debug!("Cached transport connection is closed, reconnecting");
        }

        let factory = self.factory.clone();
        let transport = with_connect_policy(|| {
            let factory = factory.clone();
            async move { factory.connect().await }
        })
        .await?;
        info!("Opened transport connection");
        *current = Some(transport.clone());
        Ok(transport)
    }

    pub async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_closed())
    }

    /// Close and forget the current connection. Failures are logged.
    pub async fn close(&self) {
        let taken = self.current.lock().await.take();
        if let Some(transport) = taken {
            match transport.close().await {
                Ok(()) => info!("Closed transport connection"),
                Err(e) => warn!(error = %e, "Failed to close transport connection"),
            }
        }
    }
}
