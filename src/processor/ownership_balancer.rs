//! Fair-share partition ownership.
//!
//! Every cycle the balancer reads the full ownership table and decides, on
//! its own, which partitions this processor should hold. Processors never
//! talk to each other; the store's concurrency tokens settle every race.
//!
//! # Algorithm
//!
//! 1. Split the partition ids into unowned (no record or expired record),
//!    mine, and held by each other active owner.
//! 2. `fair_share = ceil(partitions / active_owners)`, where active owners are
//!    the distinct owners of non-expired records plus this processor.
//! 3. Renew everything that is mine, carrying the stored token.
//! 4. Below fair share: claim unowned partitions in partition-id order, up to
//!    the deficit. If none are left, steal one partition from the most-loaded
//!    owner (ties go to the lowest owner id), but only when it holds at least
//!    two more partitions than this processor.
//! 5. Submit all requests in one `claim_ownership` call. Whatever comes back
//!    is owned; requested partitions that do not come back are not.
//!
//! The steal threshold makes the steady state one where no two owners differ
//! by more than one partition, i.e. every owner holds `floor(N/K)` or `ceil(N/K)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::checkpoint_store::CheckpointStore;
use super::metrics;
use super::transport::SharedConnection;
use crate::error::ProcessorResult;
use crate::types::{PartitionOwnership, compare_partition_ids};

/// A partition taken from another owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealDecision {
    pub partition_id: String,
    pub from_owner: String,
}

/// What one cycle intends to do, before talking to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimPlan {
    /// Renewals first, then new claims, then the steal if any.
    pub requests: Vec<PartitionOwnership>,
    pub renewals: Vec<String>,
    pub new_claims: Vec<String>,
    pub steal: Option<StealDecision>,
    /// Locally pumped partitions this processor is no longer asking for.
    pub lost: Vec<String>,
    pub fair_share: usize,
    pub active_owners: usize,
}

/// Result of a cycle after the claim went through.
#[derive(Debug, Clone, Default)]
pub struct BalancingOutcome {
    /// Every partition held after this cycle, with fresh tokens.
    pub owned: Vec<PartitionOwnership>,
    /// Subset of `owned` that has no running pump yet.
    pub newly_claimed: Vec<PartitionOwnership>,
    /// Running pumps that must stop.
    pub lost: Vec<String>,
}

pub struct OwnershipBalancer {
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    owner_id: String,
    ownership_expiration: Duration,
    store: Arc<dyn CheckpointStore>,
    connection: Arc<SharedConnection>,
}

impl OwnershipBalancer {
    pub fn new(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
        owner_id: &str,
        ownership_expiration: Duration,
        store: Arc<dyn CheckpointStore>,
        connection: Arc<SharedConnection>,
    ) -> Self {
        info!(
            owner_id,
            event_hub = event_hub_name,
            consumer_group,
            expiration_ms = ownership_expiration.as_millis() as u64,
            "Ownership balancer created"
        );
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_string(),
            event_hub_name: event_hub_name.to_string(),
            consumer_group: consumer_group.to_string(),
            owner_id: owner_id.to_string(),
            ownership_expiration,
            store,
            connection,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn request_for(
        &self,
        partition_id: &str,
        existing: Option<&PartitionOwnership>,
    ) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: self.fully_qualified_namespace.clone(),
            event_hub_name: self.event_hub_name.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: partition_id.to_string(),
            owner_id: self.owner_id.clone(),
            last_modified_time: existing.map(|r| r.last_modified_time).unwrap_or(0),
            etag: existing.and_then(|r| r.etag.clone()),
        }
    }

    /// Decide this cycle's claims. Pure; does no I/O.
    pub fn plan(
        &self,
        records: &[PartitionOwnership],
        partition_ids: &[String],
        active_local: &HashSet<String>,
        now_ms: i64,
    ) -> ClaimPlan {
        let expiration_ms = self.ownership_expiration.as_millis() as i64;

        let mut universe: Vec<&str> = partition_ids.iter().map(String::as_str).collect();
        universe.sort_by(|a, b| compare_partition_ids(a, b));
        universe.dedup();

        // Newest record per partition.
        let mut latest: HashMap<&str, &PartitionOwnership> = HashMap::new();
        for record in records {
            let slot = latest.entry(record.partition_id.as_str()).or_insert(record);
            if record.last_modified_time > slot.last_modified_time {
                *slot = record;
            }
        }

        let mut mine: Vec<&PartitionOwnership> = Vec::new();
        let mut unowned: Vec<(&str, Option<&PartitionOwnership>)> = Vec::new();
        let mut others: BTreeMap<&str, Vec<&PartitionOwnership>> = BTreeMap::new();
        for &pid in &universe {
            match latest.get(pid) {
                None => unowned.push((pid, None)),
                Some(r) if r.is_expired(now_ms, expiration_ms) => unowned.push((pid, Some(*r))),
                Some(r) if r.owner_id == self.owner_id => mine.push(*r),
                Some(r) => others.entry(r.owner_id.as_str()).or_default().push(*r),
            }
        }

        let active_owners = others.len() + 1;
        let fair_share = universe.len().div_ceil(active_owners);
        let deficit = fair_share.saturating_sub(mine.len());

        let mut plan = ClaimPlan {
            fair_share,
            active_owners,
            ..ClaimPlan::default()
        };

        for record in &mine {
            plan.renewals.push(record.partition_id.clone());
            plan.requests
                .push(self.request_for(&record.partition_id, Some(record)));
        }

        for (pid, existing) in unowned.iter().take(deficit) {
            plan.new_claims.push(pid.to_string());
            plan.requests.push(self.request_for(pid, *existing));
        }

        if deficit > 0 && unowned.is_empty() {
            let victim = others.iter().max_by(|(a_id, a), (b_id, b)| {
                a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id))
            });
            if let Some((victim_id, held)) = victim {
                if held.len() >= mine.len() + 2 {
                    if let Some(record) = held.first() {
                        plan.steal = Some(StealDecision {
                            partition_id: record.partition_id.clone(),
                            from_owner: victim_id.to_string(),
                        });
                        plan.requests
                            .push(self.request_for(&record.partition_id, Some(record)));
                    }
                } else {
                    debug!(
                        owner_id = %self.owner_id,
                        victim = victim_id,
                        victim_count = held.len(),
                        mine = mine.len(),
                        "Below fair share but no owner is overloaded enough to steal from"
                    );
                }
            }
        }

        let requested: HashSet<&str> = plan
            .requests
            .iter()
            .map(|r| r.partition_id.as_str())
            .collect();
        let mut lost: Vec<String> = active_local
            .iter()
            .filter(|pid| !requested.contains(pid.as_str()))
            .cloned()
            .collect();
        lost.sort_by(|a, b| compare_partition_ids(a, b));
        plan.lost = lost;

        plan
    }

    /// Run one full cycle: list, plan, claim.
    ///
    /// Listing and metadata failures are returned. A failing claim call is
    /// logged and counts as "acquired nothing"; running pumps are left alone.
    pub async fn run_cycle(
        &self,
        active_local: &HashSet<String>,
    ) -> ProcessorResult<BalancingOutcome> {
        let started = Instant::now();
        let result = self.run_cycle_inner(active_local).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::record_balancing_cycle(status, started.elapsed().as_secs_f64());
        result
    }

    async fn run_cycle_inner(
        &self,
        active_local: &HashSet<String>,
    ) -> ProcessorResult<BalancingOutcome> {
        let records = self
            .store
            .list_ownership(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            )
            .await?;
        let transport = self.connection.get().await?;
        let partition_ids = transport.partition_ids(&self.event_hub_name).await?;

        let now_ms = Utc::now().timestamp_millis();
        let plan = self.plan(&records, &partition_ids, active_local, now_ms);

        debug!(
            owner_id = %self.owner_id,
            partitions = partition_ids.len(),
            active_owners = plan.active_owners,
            fair_share = plan.fair_share,
            renewals = plan.renewals.len(),
            new_claims = plan.new_claims.len(),
            steal = ?plan.steal,
            "Planned ownership claims"
        );

        if plan.requests.is_empty() {
            metrics::set_owned_partitions(&self.owner_id, 0);
            return Ok(BalancingOutcome {
                lost: plan.lost,
                ..BalancingOutcome::default()
            });
        }

        let request_count = plan.requests.len();
        let claimed = match self.store.claim_ownership(plan.requests.clone()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(
                    owner_id = %self.owner_id,
                    requested = request_count,
                    error = %e,
                    "Claim call failed, treating as nothing acquired"
                );
                metrics::record_ownership_claims("error", request_count);
                return Ok(BalancingOutcome {
                    lost: plan.lost,
                    ..BalancingOutcome::default()
                });
            }
        };

        metrics::record_ownership_claims("claimed", claimed.len());
        metrics::record_ownership_claims("lost_race", request_count.saturating_sub(claimed.len()));
        metrics::set_owned_partitions(&self.owner_id, claimed.len());

        let claimed_ids: HashSet<&str> = claimed.iter().map(|o| o.partition_id.as_str()).collect();
        let mut lost = plan.lost;
        for request in &plan.requests {
            let pid = request.partition_id.as_str();
            if active_local.contains(pid) && !claimed_ids.contains(pid) {
                lost.push(pid.to_string());
            }
        }
        lost.sort_by(|a, b| compare_partition_ids(a, b));
        lost.dedup();

        let newly_claimed: Vec<PartitionOwnership> = claimed
            .iter()
            .filter(|o| !active_local.contains(&o.partition_id))
            .cloned()
            .collect();

        if !newly_claimed.is_empty() {
            let partitions: Vec<&str> =
                newly_claimed.iter().map(|o| o.partition_id.as_str()).collect();
            info!(
                owner_id = %self.owner_id,
                partitions = ?partitions,
                "Claimed partitions"
            );
        }
        if !lost.is_empty() {
            info!(owner_id = %self.owner_id, partitions = ?lost, "Lost partitions");
        }

        Ok(BalancingOutcome {
            owned: claimed,
            newly_claimed,
            lost,
        })
    }
}
