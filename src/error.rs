//! Error types for the event processor.
//!
//! # Error Handling Patterns
//!
//! The processor uses two error handling patterns, picked by who can act on
//! the failure:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used at the collaborator seams, where the caller decides what a failure means:
//! - Checkpoint store calls (`list_ownership`, `claim_ownership`, checkpoint writes)
//! - Transport calls (partition metadata, link creation)
//! - Builder validation
//!
//! ## Best-Effort (Report and Continue)
//!
//! Used inside the running processor, where nothing above us can act on the
//! error and the loop must keep going:
//! - A failed balancing cycle is handed to `process_error` and retried next cycle
//! - A failed user callback is handed to `process_error`; the pump keeps running
//! - A failure inside `process_error` or `close` is logged at warn and dropped
//!
//! Lost ownership races are neither: they are folded into the claim result and
//! never surface as an error value.

use thiserror::Error;

/// Result type for processor operations.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error returned from a user callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Processor-level errors.
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The checkpoint store could not complete the call.
    #[error("Checkpoint store error: {0}")]
    Store(String),

    /// The checkpoint store timed out or is temporarily unreachable.
    #[error("Checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transport failure (metadata, link creation, connection).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Missing or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller passed an argument that can never succeed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint without offset and without sequence number.
    #[error("Invalid checkpoint for partition {partition_id}: {reason}")]
    InvalidCheckpoint {
        partition_id: String,
        reason: String,
    },

    /// The processor or client has been closed.
    #[error("Closed: {0}")]
    Closed(String),

    /// Operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A user callback failed or panicked.
    #[error("Callback error: {0}")]
    Callback(String),
}

impl ProcessorError {
    /// Whether retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProcessorError::StoreUnavailable(_) => true,
            ProcessorError::Timeout(_) => true,
            ProcessorError::Transport(e) => e.is_transient(),

            ProcessorError::Store(_) => false,
            ProcessorError::Config(_) => false,
            ProcessorError::InvalidArgument(_) => false,
            ProcessorError::InvalidCheckpoint { .. } => false,
            ProcessorError::Closed(_) => false,
            ProcessorError::Callback(_) => false,
        }
    }

    /// Whether this error came from the checkpoint store.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            ProcessorError::Store(_) | ProcessorError::StoreUnavailable(_)
        )
    }
}

/// Errors raised by the transport seam (connection, management, links).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The link reported an error condition.
    #[error("Link error [{condition}]: {description}")]
    Link {
        condition: String,
        description: String,
        transient: bool,
    },

    /// The connection is closed or was never opened.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A management (metadata) request failed.
    #[error("Management request failed: {0}")]
    Management(String),

    /// The remote end is busy or throttling.
    #[error("Server busy: {0}")]
    ServerBusy(String),
}

impl TransportError {
    /// Build a link error from an AMQP-style condition.
    pub fn link(
        condition: impl Into<String>,
        description: impl Into<String>,
        transient: bool,
    ) -> Self {
        TransportError::Link {
            condition: condition.into(),
            description: description.into(),
            transient,
        }
    }

    /// Whether reconnecting or retrying is expected to help.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Link { transient, .. } => *transient,
            TransportError::ServerBusy(_) => true,
            TransportError::Management(_) => true,
            TransportError::ConnectionClosed(_) => false,
        }
    }
}

/// Shutdown notification raised by a link when its connection goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub is_transient: bool,
    pub is_initiated_by_client: bool,
    pub message: String,
}

impl ShutdownSignal {
    pub fn new(
        is_transient: bool,
        is_initiated_by_client: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            is_transient,
            is_initiated_by_client,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (transient: {}, client initiated: {})",
            self.message, self.is_transient, self.is_initiated_by_client
        )
    }
}

/// Terminal signal of a partition receive stream.
///
/// A receive stream ends either with `None` (graceful completion) or with
/// exactly one of these.
#[derive(Debug, Clone, Error)]
pub enum ReceiveError {
    /// The underlying connection shut down.
    #[error("Link shut down: {0}")]
    Shutdown(ShutdownSignal),

    /// The link raised an error.
    #[error("Link failed: {0}")]
    Link(TransportError),

    /// The link could not be created.
    #[error("Could not open receive link: {0}")]
    Connect(TransportError),

    /// A received message could not be turned into an event.
    #[error("Could not decode message: {0}")]
    Transform(String),
}

impl ReceiveError {
    /// Whether the failure originated from the connection going away rather
    /// than from the payload.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, ReceiveError::Transform(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retriable() {
        assert!(ProcessorError::StoreUnavailable("503".into()).is_retriable());
        assert!(!ProcessorError::Store("bad request".into()).is_retriable());
    }

    #[test]
    fn test_transport_classification_flows_through() {
        let transient =
            ProcessorError::from(TransportError::link("amqp:link:detach-forced", "idle", true));
        let fatal = ProcessorError::from(TransportError::ConnectionClosed("disposed".into()));
        assert!(transient.is_retriable());
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn test_invalid_checkpoint_message() {
        let err = ProcessorError::InvalidCheckpoint {
            partition_id: "3".into(),
            reason: "missing offset and sequence number".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("partition 3"));
        assert!(msg.contains("missing offset"));
    }

    #[test]
    fn test_receive_error_link_failure() {
        let shutdown = ReceiveError::Shutdown(ShutdownSignal::new(true, false, "connection reset"));
        assert!(shutdown.is_link_failure());
        assert!(!ReceiveError::Transform("no sequence number".into()).is_link_failure());
        assert!(shutdown.to_string().contains("connection reset"));
    }

    #[test]
    fn test_store_error_predicate() {
        assert!(ProcessorError::Store("x".into()).is_store_error());
        assert!(!ProcessorError::Config("x".into()).is_store_error());
    }
}
