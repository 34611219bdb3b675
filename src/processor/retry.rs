//! Retry policies for calls into the store and the transport.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 20ms | 1s | 3 | Checkpoint writes |
//! | `connect_policy` | 100ms | 10s | 5 | Opening the transport connection |
//!
//! Balancing cycles are not retried here: the next cycle is the retry.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventhub_processor::processor::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), std::io::Error> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::store_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{ProcessorResult, TransportResult};

/// Policy for checkpoint store writes.
///
/// Short, few retries: a checkpoint that cannot be written soon will be
/// superseded by the next one anyway.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for establishing the transport connection.
pub fn connect_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(5)
        .with_jitter()
}

/// Run a store operation with `store_policy`, retrying retriable errors only.
pub async fn with_store_policy<F, Fut, T>(operation: F) -> ProcessorResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProcessorResult<T>>,
{
    operation
        .retry(store_policy())
        .when(|e| e.is_retriable())
        .notify(|e, delay| {
            super::metrics::record_retry("store");
            tracing::debug!(error = %e, ?delay, "Retrying checkpoint store call");
        })
        .await
}

/// Run a connect operation with `connect_policy`, retrying transient errors only.
pub async fn with_connect_policy<F, Fut, T>(operation: F) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TransportResult<T>>,
{
    operation
        .retry(connect_policy())
        .when(|e| e.is_transient())
        .notify(|e, delay| {
            super::metrics::record_retry("connect");
            tracing::debug!(error = %e, ?delay, "Retrying transport connect");
        })
        .await
}
