//! Prometheus metrics for the event processor.
//!
//! Metrics cover:
//! - Load balancing (cycles, claim outcomes, owned partitions)
//! - Pump lifecycle (active pumps, close reasons)
//! - Event delivery (processed events, callback errors by operation)
//! - Checkpoints and flow control (checkpoint writes, credits granted)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the
//! "eventhub_processor" prefix. If a metric fails to register, an
//! unregistered fallback is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for processor metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("eventhub_processor".to_string()), None)
        .unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    (
        $name:ident,
        $metric_name:expr,
        $help:expr,
        [$($label:expr),+ $(,)?],
        [$($bucket:expr),+ $(,)?]
    ) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(
                &REGISTRY,
                $metric_name,
                $help,
                &[$($label),+],
                vec![$($bucket),+],
            )
        });
    };
}

// =============================================================================
// Load balancing
// =============================================================================

define_counter_vec!(
    OWNERSHIP_CLAIMS,
    "ownership_claims_total",
    "Ownership claim attempts by result",
    ["result"]
);
define_histogram_vec!(
    BALANCING_CYCLE_DURATION,
    "balancing_cycle_duration_seconds",
    "Duration of load-balancing cycles",
    ["status"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
);
define_gauge_vec!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Partitions each processor holds after its last cycle",
    ["owner_id"]
);

// =============================================================================
// Pumps
// =============================================================================

define_gauge!(
    ACTIVE_PUMPS,
    "active_pumps",
    "Partition pumps currently registered"
);
define_counter_vec!(
    PUMP_CLOSES,
    "pump_closes_total",
    "Partition pumps closed by reason",
    ["reason"]
);

// =============================================================================
// Delivery
// =============================================================================

define_counter_vec!(
    EVENTS_PROCESSED,
    "events_processed_total",
    "Events handed to process_event by outcome",
    ["status"]
);
define_counter_vec!(
    CALLBACK_ERRORS,
    "callback_errors_total",
    "Errors routed to process_error by operation",
    ["operation"]
);
define_counter_vec!(
    CHECKPOINT_UPDATES,
    "checkpoint_updates_total",
    "Checkpoint writes by outcome",
    ["status"]
);
define_counter!(
    CREDITS_ADDED,
    "credits_added_total",
    "Credits granted to receive links"
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retried store and transport calls",
    ["policy"]
);

// =============================================================================
// Safe Registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(
                name,
                error = %e,
                "Failed to register IntGauge metric, using unregistered fallback"
            );
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(
                name,
                error = %e,
                "Failed to register IntGaugeVec metric, using unregistered fallback"
            );
            gauge
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(
                name,
                error = %e,
                "Failed to register IntCounter metric, using unregistered fallback"
            );
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(
                name,
                error = %e,
                "Failed to register IntCounterVec metric, using unregistered fallback"
            );
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(
                name,
                error = %e,
                "Failed to register HistogramVec metric, using unregistered fallback"
            );
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*OWNERSHIP_CLAIMS;
    let _ = &*BALANCING_CYCLE_DURATION;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*ACTIVE_PUMPS;
    let _ = &*PUMP_CLOSES;
    let _ = &*EVENTS_PROCESSED;
    let _ = &*CALLBACK_ERRORS;
    let _ = &*CHECKPOINT_UPDATES;
    let _ = &*CREDITS_ADDED;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

// =============================================================================
// Recording
// =============================================================================

/// Record claim results: `claimed`, `lost_race` or `error`.
pub fn record_ownership_claims(result: &str, count: usize) {
    OWNERSHIP_CLAIMS
        .with_label_values(&[result])
        .inc_by(count as u64);
}

pub fn record_balancing_cycle(status: &str, duration_secs: f64) {
    BALANCING_CYCLE_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Partitions held by `owner_id`. Labelled so processors sharing a process
/// do not overwrite each other.
pub fn set_owned_partitions(owner_id: &str, count: usize) {
    OWNED_PARTITIONS
        .with_label_values(&[owner_id])
        .set(count as i64);
}

pub fn pump_registered() {
    ACTIVE_PUMPS.inc();
}

pub fn pump_unregistered() {
    ACTIVE_PUMPS.dec();
}

pub fn record_pump_closed(reason: &str) {
    PUMP_CLOSES.with_label_values(&[reason]).inc();
}

pub fn record_event_processed(success: bool) {
    let status = if success { "ok" } else { "error" };
    EVENTS_PROCESSED.with_label_values(&[status]).inc();
}

pub fn record_callback_error(operation: &str) {
    CALLBACK_ERRORS.with_label_values(&[operation]).inc();
}

pub fn record_checkpoint_update(success: bool) {
    let status = if success { "ok" } else { "error" };
    CHECKPOINT_UPDATES.with_label_values(&[status]).inc();
}

pub fn record_credits_added(credits: u32) {
    CREDITS_ADDED.inc_by(credits as u64);
}

pub fn record_retry(policy: &str) {
    RETRY_ATTEMPTS.with_label_values(&[policy]).inc();
}
