//! Credit-based flow control between a partition receiver and its link.
//!
//! Credits are the only throttle: the link hands over a message only when a
//! credit is available, and the receiver only grants credits for the
//! prefetch window plus what its reader has asked for.

use std::sync::Arc;
use std::time::Duration;

use eventhub_processor::processor::mock_transport::{MockConnectionFactory, MockEventHub};
use eventhub_processor::processor::{
    ConnectionFactory, PartitionConsumer, ProcessorConfig, ReceiveOptions,
};
use eventhub_processor::types::{EventPosition, PartitionContext};
use futures::{FutureExt, StreamExt};

async fn consumer(hub: &Arc<MockEventHub>, prefetch_count: u32) -> PartitionConsumer {
    let transport = MockConnectionFactory::new(hub.clone()).connect().await.unwrap();
    PartitionConsumer::new(
        PartitionContext::new("ns", hub.event_hub_name(), "$Default", "0"),
        transport,
        ReceiveOptions {
            prefetch_count,
            ..ReceiveOptions::default()
        },
    )
}

// ============================================================================
// Credit Accounting
// ============================================================================

#[tokio::test]
async fn test_prefetch_then_one_credit_per_pull() {
    let hub = MockEventHub::new("hub", 1);
    for i in 0..8 {
        hub.publish("0", format!("event-{}", i));
    }
    let consumer = consumer(&hub, 5).await;
    let mut receiver = consumer.receive(EventPosition::Earliest);

    let mut sequence_numbers = Vec::new();
    for _ in 0..8 {
        let event = receiver.next().await.unwrap().unwrap();
        sequence_numbers.push(event.data.sequence_number);
    }
    assert_eq!(sequence_numbers, (0..8).collect::<Vec<i64>>());

    let link = hub.links_for("0").pop().unwrap();
    let credits = link.credit_log();
    assert_eq!(credits[0], 5, "prefetch is granted when the link opens");
    assert!(
        credits[1..].iter().all(|&c| c == 1),
        "after the prefetch window, credits follow single pulls: {:?}",
        credits
    );
    assert_eq!(credits.iter().map(|&c| u64::from(c)).sum::<u64>(), 8);
    assert_eq!(link.delivered(), 8);
}

#[tokio::test]
async fn test_slow_reader_leaves_events_on_the_service() {
    let hub = MockEventHub::new("hub", 1);
    for i in 0..50 {
        hub.publish("0", format!("event-{}", i));
    }
    let consumer = consumer(&hub, 5).await;
    let mut receiver = consumer.receive(EventPosition::Earliest);

    receiver.next().await.unwrap().unwrap();
    receiver.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let link = hub.links_for("0").pop().unwrap();
    let granted: u32 = link.credit_log().iter().sum();
    assert!(granted <= 5 + 2, "granted {} credits for 2 reads", granted);
    assert_eq!(link.delivered(), 2);
    assert_eq!(link.pending(), 48);
}

#[tokio::test]
async fn test_explicit_demand_tops_up_to_outstanding() {
    let hub = MockEventHub::new("hub", 1);
    let consumer = consumer(&hub, 5).await;
    let mut receiver = consumer.receive(EventPosition::Earliest);

    // Opens the link; nothing to read yet.
    assert!(receiver.next().now_or_never().is_none());
    let link = hub.links_for("0").pop().unwrap();
    assert_eq!(link.credit_log(), vec![5]);
    assert_eq!(receiver.outstanding_demand(), 1);

    receiver.request(10);
    assert_eq!(receiver.outstanding_demand(), 11);
    assert_eq!(link.credit_log(), vec![5, 6]);

    // The empty-credit listener answers with the outstanding demand.
    assert_eq!(link.query_empty_credit_listener(), Some(11));
}

#[tokio::test]
async fn test_zero_prefetch_pulls_on_demand_only() {
    let hub = MockEventHub::new("hub", 1);
    for i in 0..3 {
        hub.publish("0", format!("event-{}", i));
    }
    let consumer = consumer(&hub, 0).await;
    let mut receiver = consumer.receive(EventPosition::Earliest);

    let first = receiver.next().await.unwrap().unwrap();
    assert_eq!(first.data.sequence_number, 0);

    let link = hub.links_for("0").pop().unwrap();
    assert_eq!(link.credit_log(), vec![1]);
    assert_eq!(link.pending(), 2);
}

// ============================================================================
// Processor Wiring
// ============================================================================

#[test]
fn test_prefetch_flows_into_receive_options() {
    let config = ProcessorConfig::default()
        .with_prefetch_count(7)
        .with_track_last_enqueued_event_properties(true);
    let options = config.receive_options();
    assert_eq!(options.prefetch_count, 7);
    assert!(options.track_last_enqueued_event_properties);
}
