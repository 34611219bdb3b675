//! Tests for the metrics module.
//!
//! Metrics live in a process-global registry and other tests in this binary
//! record into it concurrently, so assertions compare deltas with `>=`
//! rather than exact values.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use eventhub_processor::processor::in_memory_store::InMemoryCheckpointStore;
use eventhub_processor::processor::metrics;
use eventhub_processor::processor::mock_transport::{MockConnectionFactory, MockEventHub};
use eventhub_processor::processor::{OwnershipBalancer, SharedConnection};
use serial_test::serial;

fn counter(vec: &prometheus::IntCounterVec, label: &str) -> u64 {
    vec.with_label_values(&[label]).get()
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_all_metrics_registered_with_prefix() {
    metrics::init_metrics();
    metrics::record_ownership_claims("claimed", 0);
    metrics::record_balancing_cycle("ok", 0.0);
    metrics::record_pump_closed("lost_partition_ownership");
    metrics::record_event_processed(true);
    metrics::record_callback_error("checkpoint update");
    metrics::record_checkpoint_update(true);
    metrics::record_retry("store");

    let names: HashSet<String> = metrics::gather_metrics()
        .iter()
        .map(|family| family.get_name().to_string())
        .collect();
    for expected in [
        "eventhub_processor_ownership_claims_total",
        "eventhub_processor_balancing_cycle_duration_seconds",
        "eventhub_processor_owned_partitions",
        "eventhub_processor_active_pumps",
        "eventhub_processor_pump_closes_total",
        "eventhub_processor_events_processed_total",
        "eventhub_processor_callback_errors_total",
        "eventhub_processor_checkpoint_updates_total",
        "eventhub_processor_credits_added_total",
        "eventhub_processor_retry_attempts_total",
    ] {
        assert!(names.contains(expected), "missing {}", expected);
    }
}

#[test]
fn test_encode_is_prometheus_text() {
    metrics::record_event_processed(false);
    let text = metrics::encode_metrics().unwrap();
    assert!(text.contains("# HELP eventhub_processor_events_processed_total"));
    assert!(text.contains("# TYPE eventhub_processor_events_processed_total counter"));
    assert!(text.contains("status=\"error\""));
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_event_outcomes_counted_separately() {
    let ok_before = counter(&metrics::EVENTS_PROCESSED, "ok");
    let err_before = counter(&metrics::EVENTS_PROCESSED, "error");

    metrics::record_event_processed(true);
    metrics::record_event_processed(true);
    metrics::record_event_processed(false);

    assert!(counter(&metrics::EVENTS_PROCESSED, "ok") >= ok_before + 2);
    assert!(counter(&metrics::EVENTS_PROCESSED, "error") > err_before);
}

#[test]
fn test_credits_accumulate() {
    let before = metrics::CREDITS_ADDED.get();
    metrics::record_credits_added(500);
    metrics::record_credits_added(1);
    assert!(metrics::CREDITS_ADDED.get() >= before + 501);
}

#[test]
#[serial]
fn test_active_pumps_follow_registrations() {
    let before = metrics::ACTIVE_PUMPS.get();
    metrics::pump_registered();
    metrics::pump_registered();
    assert_eq!(metrics::ACTIVE_PUMPS.get(), before + 2);
    metrics::pump_unregistered();
    metrics::pump_unregistered();
    assert_eq!(metrics::ACTIVE_PUMPS.get(), before);
}

#[test]
fn test_owned_partitions_kept_per_owner() {
    metrics::set_owned_partitions("gauge-owner-a", 5);
    metrics::set_owned_partitions("gauge-owner-b", 2);
    let owned = |owner: &str| metrics::OWNED_PARTITIONS.with_label_values(&[owner]).get();
    assert_eq!(owned("gauge-owner-a"), 5);
    assert_eq!(owned("gauge-owner-b"), 2);

    metrics::set_owned_partitions("gauge-owner-b", 0);
    assert_eq!(owned("gauge-owner-a"), 5);
}

// ============================================================================
// Balancer Instrumentation
// ============================================================================

#[tokio::test]
#[serial]
async fn test_balancing_cycle_records_claims_and_owned_gauge() {
    let hub = MockEventHub::new("metrics-hub", 3);
    let store = InMemoryCheckpointStore::new();
    let balancer = OwnershipBalancer::new(
        "ns",
        "metrics-hub",
        "$Default",
        "metrics-owner",
        Duration::from_secs(30),
        Arc::new(store.clone()),
        Arc::new(SharedConnection::new(MockConnectionFactory::new(hub))),
    );

    let claimed_before = counter(&metrics::OWNERSHIP_CLAIMS, "claimed");
    let cycles_before = metrics::BALANCING_CYCLE_DURATION
        .with_label_values(&["ok"])
        .get_sample_count();

    balancer.run_cycle(&HashSet::new()).await.unwrap();

    assert!(counter(&metrics::OWNERSHIP_CLAIMS, "claimed") >= claimed_before + 3);
    assert!(
        metrics::BALANCING_CYCLE_DURATION
            .with_label_values(&["ok"])
            .get_sample_count()
            > cycles_before
    );
    assert_eq!(
        metrics::OWNED_PARTITIONS
            .with_label_values(&["metrics-owner"])
            .get(),
        3
    );

    let errors_before = counter(&metrics::OWNERSHIP_CLAIMS, "error");
    store.fail_next_claims(1);
    let active: HashSet<String> = ["0", "1", "2"].iter().map(|s| s.to_string()).collect();
    balancer.run_cycle(&active).await.unwrap();
    assert!(counter(&metrics::OWNERSHIP_CLAIMS, "error") >= errors_before + 3);
}
