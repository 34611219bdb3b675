//! Criterion micro-benchmarks for ownership planning.
//!
//! These benchmarks measure the pure planning step of a balancing cycle:
//! - A fresh processor joining a fully owned table (steal path)
//! - A settled processor renewing its share (steady state)
//! - Partition id ordering used throughout planning
//!
//! Run with: `cargo bench --bench balancer_bench`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use eventhub_processor::processor::in_memory_store::InMemoryCheckpointStore;
use eventhub_processor::processor::mock_transport::{MockConnectionFactory, MockEventHub};
use eventhub_processor::processor::{OwnershipBalancer, SharedConnection};
use eventhub_processor::types::{PartitionOwnership, compare_partition_ids};

const NOW_MS: i64 = 1_700_000_000_000;

fn balancer(owner_id: &str) -> OwnershipBalancer {
    let hub = MockEventHub::new("bench", 1);
    OwnershipBalancer::new(
        "ns",
        "bench",
        "$Default",
        owner_id,
        Duration::from_secs(30),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SharedConnection::new(MockConnectionFactory::new(hub))),
    )
}

/// Ownership table with `partitions` records spread round-robin over `owners`.
fn table(partitions: usize, owners: usize) -> (Vec<PartitionOwnership>, Vec<String>) {
    let ids: Vec<String> = (0..partitions).map(|i| i.to_string()).collect();
    let records = ids
        .iter()
        .enumerate()
        .map(|(i, pid)| PartitionOwnership {
            fully_qualified_namespace: "ns".to_string(),
            event_hub_name: "bench".to_string(),
            consumer_group: "$Default".to_string(),
            partition_id: pid.clone(),
            owner_id: format!("owner-{}", i % owners),
            last_modified_time: NOW_MS - 1_000,
            etag: Some(format!("etag-{}", i)),
        })
        .collect();
    (records, ids)
}

fn bench_plan_new_member(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_new_member");
    let newcomer = balancer("newcomer");
    let active = HashSet::new();

    for partitions in [32usize, 256, 1024, 4096] {
        let (records, ids) = table(partitions, 8);
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            &(records, ids),
            |b, (records, ids)| {
                b.iter(|| black_box(newcomer.plan(records, ids, &active, NOW_MS)));
            },
        );
    }
    group.finish();
}

fn bench_plan_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_steady_state");
    let member = balancer("owner-0");

    for partitions in [32usize, 256, 1024, 4096] {
        let (records, ids) = table(partitions, 8);
        let active: HashSet<String> = records
            .iter()
            .filter(|r| r.owner_id == "owner-0")
            .map(|r| r.partition_id.clone())
            .collect();
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            &(records, ids),
            |b, (records, ids)| {
                b.iter(|| black_box(member.plan(records, ids, &active, NOW_MS)));
            },
        );
    }
    group.finish();
}

fn bench_partition_id_sort(c: &mut Criterion) {
    let ids: Vec<String> = (0..4096).rev().map(|i| i.to_string()).collect();
    c.bench_function("sort_partition_ids_4096", |b| {
        b.iter(|| {
            let mut sorted = ids.clone();
            sorted.sort_by(|a, b| compare_partition_ids(a, b));
            black_box(sorted)
        });
    });
}

criterion_group!(
    benches,
    bench_plan_new_member,
    bench_plan_steady_state,
    bench_partition_id_sort
);
criterion_main!(benches);
