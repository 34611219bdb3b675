//! Ownership balancing across several processors sharing one store.
//!
//! These tests drive `OwnershipBalancer::run_cycle` directly, one owner at a
//! time, so the interleaving is deterministic.

mod common;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use common::{GROUP, HUB, NAMESPACE, balancer};
use eventhub_processor::processor::CheckpointStore;
use eventhub_processor::processor::OwnershipBalancer;
use eventhub_processor::processor::in_memory_store::InMemoryCheckpointStore;
use eventhub_processor::processor::mock_transport::MockEventHub;
use eventhub_processor::types::PartitionOwnership;

/// Run `rounds` cycles for every balancer, feeding each its own previous
/// result as the set of running pumps.
async fn run_rounds(
    balancers: &[OwnershipBalancer],
    active: &mut HashMap<String, HashSet<String>>,
    rounds: usize,
) {
    for _ in 0..rounds {
        for balancer in balancers {
            let local = active.entry(balancer.owner_id().to_string()).or_default();
            let outcome = balancer.run_cycle(local).await.unwrap();
            for pid in &outcome.lost {
                local.remove(pid);
            }
            for ownership in &outcome.owned {
                local.insert(ownership.partition_id.clone());
            }
        }
    }
}

fn assert_partitioned(active: &HashMap<String, HashSet<String>>, partition_count: usize) {
    let mut union = HashSet::new();
    for held in active.values() {
        for pid in held {
            assert!(union.insert(pid.clone()), "partition {} held twice", pid);
        }
    }
    assert_eq!(union.len(), partition_count);
}

// ============================================================================
// Fair Share
// ============================================================================

#[tokio::test]
async fn test_three_owners_converge_on_eight_partitions() {
    let hub = MockEventHub::new(HUB, 8);
    let store = InMemoryCheckpointStore::new();
    let balancers: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|owner| balancer(owner, &hub, &store))
        .collect();
    let mut active = HashMap::new();

    run_rounds(&balancers, &mut active, 6).await;

    assert_partitioned(&active, 8);
    for (owner, held) in &active {
        assert!(
            held.len() == 2 || held.len() == 3,
            "{} holds {} partitions",
            owner,
            held.len()
        );
    }

    // Settled: another round moves nothing.
    for balancer in &balancers {
        let local = &active[balancer.owner_id()];
        let outcome = balancer.run_cycle(local).await.unwrap();
        assert!(outcome.newly_claimed.is_empty());
        assert!(outcome.lost.is_empty());
        assert_eq!(outcome.owned.len(), local.len());
    }
}

#[tokio::test]
async fn test_seven_partitions_do_not_stall_at_three_three_one() {
    let hub = MockEventHub::new(HUB, 7);
    let store = InMemoryCheckpointStore::new();
    let balancers: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|owner| balancer(owner, &hub, &store))
        .collect();
    let mut active = HashMap::new();

    run_rounds(&balancers, &mut active, 8).await;

    assert_partitioned(&active, 7);
    let mut counts: Vec<usize> = active.values().map(HashSet::len).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![2, 2, 3]);
}

#[tokio::test]
async fn test_single_owner_takes_everything_in_one_cycle() {
    let hub = MockEventHub::new(HUB, 4);
    let store = InMemoryCheckpointStore::new();
    let solo = balancer("solo", &hub, &store);

    let outcome = solo.run_cycle(&HashSet::new()).await.unwrap();
    let mut claimed: Vec<_> = outcome
        .newly_claimed
        .iter()
        .map(|o| o.partition_id.clone())
        .collect();
    claimed.sort();
    assert_eq!(claimed, vec!["0", "1", "2", "3"]);
    assert_eq!(store.partitions_owned_by("solo").await.len(), 4);
}

// ============================================================================
// Concurrency Tokens
// ============================================================================

fn request(owner: &str, pid: &str, etag: Option<&str>) -> PartitionOwnership {
    PartitionOwnership {
        fully_qualified_namespace: NAMESPACE.to_string(),
        event_hub_name: HUB.to_string(),
        consumer_group: GROUP.to_string(),
        partition_id: pid.to_string(),
        owner_id: owner.to_string(),
        last_modified_time: 0,
        etag: etag.map(str::to_string),
    }
}

#[tokio::test]
async fn test_concurrent_first_claims_have_one_winner() {
    let store = InMemoryCheckpointStore::new();

    let (first, second) = tokio::join!(
        store.claim_ownership(vec![request("a", "0", None)]),
        store.claim_ownership(vec![request("b", "0", None)]),
    );
    let winners = first.unwrap().len() + second.unwrap().len();
    assert_eq!(winners, 1);
    assert_eq!(store.ownership_snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_stale_token_loses_after_renewal() {
    let store = InMemoryCheckpointStore::new();
    let created = store
        .claim_ownership(vec![request("a", "0", None)])
        .await
        .unwrap()
        .remove(0);
    let token = created.etag.clone();

    let renewed = store
        .claim_ownership(vec![request("a", "0", token.as_deref())])
        .await
        .unwrap();
    assert_eq!(renewed.len(), 1);
    assert_ne!(renewed[0].etag, token);

    // "b" read the record before the renewal.
    let stolen = store
        .claim_ownership(vec![request("b", "0", token.as_deref())])
        .await
        .unwrap();
    assert!(stolen.is_empty());
    assert_eq!(store.partitions_owned_by("a").await, vec!["0"]);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test]
async fn test_expired_owner_is_replaced() {
    let hub = MockEventHub::new(HUB, 4);
    let store = InMemoryCheckpointStore::new();
    let a = balancer("a", &hub, &store);
    let b = balancer("b", &hub, &store);

    let a_outcome = a.run_cycle(&HashSet::new()).await.unwrap();
    assert_eq!(a_outcome.owned.len(), 4);
    let a_active: HashSet<String> = a_outcome
        .owned
        .iter()
        .map(|o| o.partition_id.clone())
        .collect();

    // "a" stops renewing.
    store.expire_owner("a", Duration::from_secs(60)).await;

    let b_outcome = b.run_cycle(&HashSet::new()).await.unwrap();
    assert_eq!(b_outcome.newly_claimed.len(), 4);
    assert_eq!(store.partitions_owned_by("b").await.len(), 4);

    // "a" comes back, notices it lost its partitions, and takes back one.
    let a_outcome = a.run_cycle(&a_active).await.unwrap();
    assert_eq!(a_outcome.owned.len(), 1);
    assert_eq!(a_outcome.lost.len(), 3);
    assert!(a_outcome.newly_claimed.is_empty());
}

#[tokio::test]
async fn test_idle_owner_steals_down_to_even_split() {
    let hub = MockEventHub::new(HUB, 2);
    let store = InMemoryCheckpointStore::new();
    let a = balancer("a", &hub, &store);
    let b = balancer("b", &hub, &store);

    a.run_cycle(&HashSet::new()).await.unwrap();
    let b_outcome = b.run_cycle(&HashSet::new()).await.unwrap();

    // Two partitions, two owners: "a" holds 2, "b" holds 0, so "b" steals one.
    assert_eq!(b_outcome.owned.len(), 1);
    assert_eq!(store.partitions_owned_by("a").await.len(), 1);

    // Balanced now; nobody moves.
    let b_active: HashSet<String> = b_outcome
        .owned
        .iter()
        .map(|o| o.partition_id.clone())
        .collect();
    let again = b.run_cycle(&b_active).await.unwrap();
    assert_eq!(again.owned.len(), 1);
    assert!(again.newly_claimed.is_empty());
}
