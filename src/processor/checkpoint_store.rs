//! The persistence seam shared by every processor in a consumer group.
//!
//! The store is the only coordination medium between processors. Nothing in
//! this crate takes a distributed lock; all mutual exclusion comes from the
//! store honouring concurrency tokens on `claim_ownership`.

use async_trait::async_trait;

use crate::error::ProcessorResult;
use crate::types::{Checkpoint, PartitionOwnership};

/// Outcome of a single claim inside a `claim_ownership` batch.
///
/// Stores build one of these per requested record and fold the batch with
/// [`ClaimOutcome::collect_claimed`]. A lost race is an ordinary outcome and
/// never becomes an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The write went through; the record carries the refreshed token.
    Claimed(PartitionOwnership),
    /// Another writer got there first (token mismatch or record already exists).
    LostRace { partition_id: String },
}

impl ClaimOutcome {
    pub fn into_claimed(self) -> Option<PartitionOwnership> {
        match self {
            ClaimOutcome::Claimed(ownership) => Some(ownership),
            ClaimOutcome::LostRace { .. } => None,
        }
    }

    /// Keep only the records that were won.
    pub fn collect_claimed<I>(outcomes: I) -> Vec<PartitionOwnership>
    where
        I: IntoIterator<Item = ClaimOutcome>,
    {
        outcomes
            .into_iter()
            .filter_map(ClaimOutcome::into_claimed)
            .collect()
    }
}

/// Persists partition ownership and checkpoints with optimistic concurrency.
///
/// Implementations must:
/// - create a record only if absent when the request carries no `etag`
/// - overwrite only when the stored `etag` equals the requested one
/// - stamp `last_modified_time` and issue a fresh `etag` on every successful write
/// - return from `claim_ownership` only the records that were written
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    // =========================================================================
    // Ownership
    // =========================================================================

    /// All ownership records for the consumer group, stale ones included.
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> ProcessorResult<Vec<PartitionOwnership>>;

    /// Attempt every requested claim; return the subset that succeeded.
    ///
    /// Partial success is normal. Only store-wide failures are errors.
    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> ProcessorResult<Vec<PartitionOwnership>>;

    // =========================================================================
    // Checkpoints
    // =========================================================================

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> ProcessorResult<Vec<Checkpoint>>;

    /// Write a checkpoint.
    ///
    /// Fails with `InvalidCheckpoint` if neither offset nor sequence number is set.
    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> ProcessorResult<()>;

    /// Checkpoint for a single partition, if one has been written.
    async fn get_checkpoint(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> ProcessorResult<Option<Checkpoint>> {
        let checkpoints = self
            .list_checkpoints(fully_qualified_namespace, event_hub_name, consumer_group)
            .await?;
        Ok(checkpoints
            .into_iter()
            .find(|c| c.partition_id == partition_id))
    }
}

/// Reject checkpoints that carry no position at all.
pub fn validate_checkpoint(checkpoint: &Checkpoint) -> ProcessorResult<()> {
    if checkpoint.offset.is_none() && checkpoint.sequence_number.is_none() {
        return Err(crate::error::ProcessorError::InvalidCheckpoint {
            partition_id: checkpoint.partition_id.clone(),
            reason: "both offset and sequence number are missing".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ownership(pid: &str) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: "ns".into(),
            event_hub_name: "hub".into(),
            consumer_group: "cg".into(),
            partition_id: pid.into(),
            owner_id: "me".into(),
            last_modified_time: 0,
            etag: Some("e1".into()),
        }
    }

    #[test]
    fn test_collect_claimed_drops_lost_races() {
        let claimed = ClaimOutcome::collect_claimed(vec![
            ClaimOutcome::Claimed(ownership("0")),
            ClaimOutcome::LostRace {
                partition_id: "1".into(),
            },
            ClaimOutcome::Claimed(ownership("2")),
        ]);
        let ids: Vec<_> = claimed.iter().map(|o| o.partition_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "2"]);
    }

    #[test]
    fn test_validate_checkpoint() {
        let ctx = crate::types::PartitionContext::new("ns", "hub", "cg", "0");
        assert!(validate_checkpoint(&ctx.checkpoint(Some(1), None)).is_ok());
        assert!(validate_checkpoint(&ctx.checkpoint(None, Some(1))).is_ok());
        assert!(validate_checkpoint(&ctx.checkpoint(None, None)).is_err());
    }
}
