//! In-memory checkpoint store for tests and local runs.
//!
//! Several processors sharing one `InMemoryCheckpointStore` (it is cheap to
//! clone; clones share state) behave like a fleet sharing a real store.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! eventhub-processor = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use super::checkpoint_store::{CheckpointStore, ClaimOutcome, validate_checkpoint};
use crate::error::{ProcessorError, ProcessorResult};
use crate::types::{Checkpoint, PartitionOwnership};

/// Records are keyed the way a blob store names them:
/// namespace / hub / group / partition.
pub type RecordKey = (String, String, String, String);

fn record_key(
    fully_qualified_namespace: &str,
    event_hub_name: &str,
    consumer_group: &str,
    partition_id: &str,
) -> RecordKey {
    (
        fully_qualified_namespace.to_lowercase(),
        event_hub_name.to_lowercase(),
        consumer_group.to_lowercase(),
        partition_id.to_string(),
    )
}

fn ownership_key(o: &PartitionOwnership) -> RecordKey {
    record_key(
        &o.fully_qualified_namespace,
        &o.event_hub_name,
        &o.consumer_group,
        &o.partition_id,
    )
}

fn checkpoint_key(c: &Checkpoint) -> RecordKey {
    record_key(
        &c.fully_qualified_namespace,
        &c.event_hub_name,
        &c.consumer_group,
        &c.partition_id,
    )
}

fn in_group(
    key: &RecordKey,
    fully_qualified_namespace: &str,
    event_hub_name: &str,
    consumer_group: &str,
) -> bool {
    key.0 == fully_qualified_namespace.to_lowercase()
        && key.1 == event_hub_name.to_lowercase()
        && key.2 == consumer_group.to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    /// Ownership records, including stale ones.
    pub ownership: Arc<RwLock<HashMap<RecordKey, PartitionOwnership>>>,
    pub checkpoints: Arc<RwLock<HashMap<RecordKey, Checkpoint>>>,
    /// When set, every call fails with `StoreUnavailable`.
    unavailable: Arc<AtomicBool>,
    /// Number of upcoming `list_ownership` calls that fail.
    failing_lists: Arc<AtomicU64>,
    /// Number of upcoming `claim_ownership` calls that fail.
    failing_claims: Arc<AtomicU64>,
    claim_calls: Arc<AtomicU64>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> ProcessorResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessorError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Claim one record against the current map.
    fn try_claim(
        map: &mut HashMap<RecordKey, PartitionOwnership>,
        mut requested: PartitionOwnership,
    ) -> ClaimOutcome {
        let key = ownership_key(&requested);
        let accepted = match (&requested.etag, map.get(&key)) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(_), None) => false,
            (Some(wanted), Some(current)) => current.etag.as_deref() == Some(wanted.as_str()),
        };

        if !accepted {
            info!(
                partition_id = %requested.partition_id,
                owner_id = %requested.owner_id,
                "Couldn't claim ownership of partition"
            );
            return ClaimOutcome::LostRace {
                partition_id: requested.partition_id,
            };
        }

        requested.etag = Some(uuid::Uuid::new_v4().to_string());
        requested.last_modified_time = Utc::now().timestamp_millis();
        map.insert(key, requested.clone());
        ClaimOutcome::Claimed(requested)
    }

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `list_ownership`.
    pub fn fail_next_lists(&self, count: u64) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `claim_ownership`.
    pub fn fail_next_claims(&self, count: u64) {
        self.failing_claims.store(count, Ordering::SeqCst);
    }

    /// Number of `claim_ownership` calls served so far.
    pub fn claim_calls(&self) -> u64 {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Insert or replace a record verbatim, bypassing token checks.
    pub async fn put_ownership(&self, ownership: PartitionOwnership) {
        self.ownership
            .write()
            .await
            .insert(ownership_key(&ownership), ownership);
    }

    /// Move the last-modified time of one partition's record into the past.
    pub async fn backdate_ownership(&self, partition_id: &str, by: Duration) {
        let mut map = self.ownership.write().await;
        for record in map.values_mut() {
            if record.partition_id == partition_id {
                record.last_modified_time -= by.as_millis() as i64;
            }
        }
    }

    /// Backdate every record owned by `owner_id`.
    pub async fn expire_owner(&self, owner_id: &str, by: Duration) {
        let mut map = self.ownership.write().await;
        for record in map.values_mut().filter(|r| r.owner_id == owner_id) {
            record.last_modified_time -= by.as_millis() as i64;
        }
    }

    /// Current records, sorted by partition id.
    pub async fn ownership_snapshot(&self) -> Vec<PartitionOwnership> {
        let mut records: Vec<_> = self.ownership.read().await.values().cloned().collect();
        records.sort_by(|a, b| {
            crate::types::compare_partition_ids(&a.partition_id, &b.partition_id)
        });
        records
    }

    /// Partitions currently held by `owner_id`, ignoring expiry.
    pub async fn partitions_owned_by(&self, owner_id: &str) -> Vec<String> {
        self.ownership_snapshot()
            .await
            .into_iter()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.partition_id)
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> ProcessorResult<Vec<PartitionOwnership>> {
        self.check_available()?;
        if self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProcessorError::StoreUnavailable(
                "injected list_ownership failure".to_string(),
            ));
        }

        let map = self.ownership.read().await;
        Ok(map
            .iter()
            .filter(|(key, _)| {
                in_group(key, fully_qualified_namespace, event_hub_name, consumer_group)
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> ProcessorResult<Vec<PartitionOwnership>> {
        self.check_available()?;
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProcessorError::StoreUnavailable(
                "injected claim_ownership failure".to_string(),
            ));
        }

        let mut map = self.ownership.write().await;
        let outcomes: Vec<_> = requested
            .into_iter()
            .map(|request| Self::try_claim(&mut map, request))
            .collect();
        Ok(ClaimOutcome::collect_claimed(outcomes))
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> ProcessorResult<Vec<Checkpoint>> {
        self.check_available()?;
        let map = self.checkpoints.read().await;
        Ok(map
            .iter()
            .filter(|(key, _)| {
                in_group(key, fully_qualified_namespace, event_hub_name, consumer_group)
            })
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> ProcessorResult<()> {
        self.check_available()?;
        validate_checkpoint(&checkpoint)?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint_key(&checkpoint), checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionContext;

    fn request(pid: &str, owner: &str, etag: Option<String>) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: "ns".into(),
            event_hub_name: "hub".into(),
            consumer_group: "$Default".into(),
            partition_id: pid.into(),
            owner_id: owner.into(),
            last_modified_time: 0,
            etag,
        }
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = InMemoryCheckpointStore::new();
        let won = store.claim_ownership(vec![request("0", "a", None)]).await.unwrap();
        assert_eq!(won.len(), 1);
        assert!(won[0].etag.is_some());
        assert!(won[0].last_modified_time > 0);

        // Second create for the same partition loses.
        let lost = store.claim_ownership(vec![request("0", "b", None)]).await.unwrap();
        assert!(lost.is_empty());
        assert_eq!(store.partitions_owned_by("a").await, vec!["0"]);
    }

    #[tokio::test]
    async fn test_update_if_match() {
        let store = InMemoryCheckpointStore::new();
        let first = store.claim_ownership(vec![request("0", "a", None)]).await.unwrap();
        let etag = first[0].etag.clone();

        let renewed = store
            .claim_ownership(vec![request("0", "a", etag.clone())])
            .await
            .unwrap();
        assert_eq!(renewed.len(), 1);
        assert_ne!(renewed[0].etag, etag);

        // Stale token loses.
        let stale = store.claim_ownership(vec![request("0", "b", etag)]).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_partial_success() {
        let store = InMemoryCheckpointStore::new();
        store.claim_ownership(vec![request("1", "a", None)]).await.unwrap();

        let won = store
            .claim_ownership(vec![request("0", "b", None), request("1", "b", None)])
            .await
            .unwrap();
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].partition_id, "0");
    }

    #[tokio::test]
    async fn test_list_filters_consumer_group() {
        let store = InMemoryCheckpointStore::new();
        let mut other = request("0", "a", None);
        other.consumer_group = "other".into();
        store
            .claim_ownership(vec![request("0", "a", None), other])
            .await
            .unwrap();

        let listed = store.list_ownership("ns", "hub", "$default").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].consumer_group, "$Default");
    }

    #[tokio::test]
    async fn test_backdate_touches_one_partition() {
        let store = InMemoryCheckpointStore::new();
        store
            .claim_ownership(vec![request("0", "a", None), request("1", "a", None)])
            .await
            .unwrap();
        let before = store.ownership_snapshot().await;

        store.backdate_ownership("1", Duration::from_secs(60)).await;
        let after = store.ownership_snapshot().await;
        assert_eq!(after[0].last_modified_time, before[0].last_modified_time);
        assert_eq!(after[1].last_modified_time, before[1].last_modified_time - 60_000);
        // Backdating is not a write; tokens stay valid.
        assert_eq!(after[1].etag, before[1].etag);
    }

    #[tokio::test]
    async fn test_same_hub_in_two_namespaces_is_separate() {
        let store = InMemoryCheckpointStore::new();
        let mut elsewhere = request("0", "b", None);
        elsewhere.fully_qualified_namespace = "other-ns".into();

        let won = store
            .claim_ownership(vec![request("0", "a", None), elsewhere])
            .await
            .unwrap();
        assert_eq!(won.len(), 2);

        let here = store.list_ownership("ns", "hub", "$Default").await.unwrap();
        assert_eq!(here.len(), 1);
        assert_eq!(here[0].owner_id, "a");
        let there = store.list_ownership("other-ns", "hub", "$Default").await.unwrap();
        assert_eq!(there.len(), 1);
        assert_eq!(there[0].owner_id, "b");

        let ctx = PartitionContext::new("ns", "hub", "$Default", "0");
        store
            .update_checkpoint(ctx.checkpoint(Some(100), Some(1)))
            .await
            .unwrap();
        assert!(
            store
                .get_checkpoint("other-ns", "hub", "$Default", "0")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryCheckpointStore::new();
        store.fail_next_lists(1);
        assert!(store.list_ownership("ns", "hub", "$Default").await.is_err());
        assert!(store.list_ownership("ns", "hub", "$Default").await.is_ok());

        store.set_unavailable(true);
        let err = store.claim_ownership(vec![]).await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let store = InMemoryCheckpointStore::new();
        let ctx = PartitionContext::new("ns", "hub", "$Default", "4");
        store.update_checkpoint(ctx.checkpoint(Some(250), Some(2))).await.unwrap();

        let found = store
            .get_checkpoint("ns", "hub", "$Default", "4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.offset, Some(250));
        assert_eq!(found.sequence_number, Some(2));
        assert!(store.get_checkpoint("ns", "hub", "$Default", "5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_requires_position() {
        let store = InMemoryCheckpointStore::new();
        let ctx = PartitionContext::new("ns", "hub", "$Default", "4");
        let err = store.update_checkpoint(ctx.checkpoint(None, None)).await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidCheckpoint { .. }));
    }
}
