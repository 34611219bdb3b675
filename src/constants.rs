//! Centralized defaults and wire-level constants.
//!
//! # Categories
//!
//! - **Scheduling Constants**: balancing cadence and ownership expiry
//! - **Flow Control Constants**: prefetch and credit defaults
//! - **Message Annotation Keys**: system properties stamped by the service
//! - **Error Operation Tags**: values of `ProcessorErrorContext::operation`

use std::time::Duration;

// =============================================================================
// Scheduling Constants
// =============================================================================

/// Delay between the end of one load-balancing cycle and the start of the next.
pub const DEFAULT_LOAD_BALANCING_INTERVAL: Duration = Duration::from_secs(10);

/// Ownership records not modified within this window are treated as unowned.
///
/// Must stay comfortably above the balancing interval so a healthy owner
/// renews several times before anyone may take over.
pub const DEFAULT_OWNERSHIP_EXPIRATION: Duration = Duration::from_secs(30);

/// Upper bound on how long stop waits for a single pump or the balancing
/// task before aborting it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Flow Control Constants
// =============================================================================

/// Credits granted to a receive link when a subscription opens.
pub const DEFAULT_PREFETCH_COUNT: u32 = 500;

/// Owner level (epoch) used by pumps so a newer owner evicts an older reader.
pub const DEFAULT_OWNER_LEVEL: i64 = 0;

/// Prefix of generated receive link names.
pub const LINK_NAME_PREFIX: &str = "PR";

/// Length of the random suffix appended to link names.
pub const LINK_NAME_SUFFIX_LEN: usize = 8;

/// Key prefix for consumers opened by `receive_from_all_partitions`.
pub const RECEIVE_ALL_KEY_PREFIX: &str = "receive-all-";

// =============================================================================
// Message Annotation Keys
// =============================================================================

pub const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
pub const OFFSET_ANNOTATION: &str = "x-opt-offset";
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";
pub const PARTITION_KEY_ANNOTATION: &str = "x-opt-partition-key";

/// Application property carrying a W3C/hierarchical trace id.
pub const DIAGNOSTIC_ID_PROPERTY: &str = "Diagnostic-Id";

/// Delivery annotations present when last-enqueued tracking is enabled.
pub const LAST_ENQUEUED_SEQUENCE_NUMBER_ANNOTATION: &str = "last-enqueued-sequence-number";
pub const LAST_ENQUEUED_OFFSET_ANNOTATION: &str = "last-enqueued-offset";
pub const LAST_ENQUEUED_TIME_ANNOTATION: &str = "last-enqueued-time-utc";

// =============================================================================
// Error Operation Tags
// =============================================================================

/// `process_event` returned an error or panicked.
pub const OPERATION_USER_CODE: &str = "user code error";

/// The receive stream ended with a link error or shutdown signal.
pub const OPERATION_RECEIVE: &str = "event hub error on receive";

/// Opening a pump failed (connection or `initialize`).
pub const OPERATION_PARTITION_INITIALIZATION: &str = "partition initialization";

/// A policy-driven checkpoint write failed.
pub const OPERATION_CHECKPOINT_UPDATE: &str = "checkpoint update";

/// Listing ownership or partition metadata failed during a cycle.
pub const OPERATION_LOAD_BALANCING: &str = "load balancing";
