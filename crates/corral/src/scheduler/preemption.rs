use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::api::condition::reasons;
use crate::api::{PreemptionRule, Workload};
use crate::cache::Snapshot;
use crate::events::{Event, EventRecorder};
use crate::resources::quantities::quantity_of;
use crate::resources::{FlavorName, FlavorResourceQuantities, ResourceName};
use crate::scheduler::flavorassigner::Assignment;
use crate::store::{update_with_retry, RetryPolicy, StatusUpdate, StoreError, WorkloadStore};
use crate::workload::WorkloadInfo;
use crate::{Map, Set};

/// Selects admitted workloads to evict so that an incoming workload with a
/// preempting assignment fits, and issues the evictions.
pub struct Preemptor {
    store: Arc<dyn WorkloadStore>,
    events: Arc<dyn EventRecorder>,
    retry: RetryPolicy,
}

impl Preemptor {
    pub fn new(
        store: Arc<dyn WorkloadStore>,
        events: Arc<dyn EventRecorder>,
        retry: RetryPolicy,
    ) -> Self {
        Preemptor {
            store,
            events,
            retry,
        }
    }

    /// Issues the evictions concurrently, one status update per victim, and
    /// returns the per-victim outcomes in target order. Errors are logged and
    /// aggregated; the number of successes is the issued count.
    pub async fn issue_preemptions(
        &self,
        preemptor: &WorkloadInfo,
        targets: &[WorkloadInfo],
        now: DateTime<Utc>,
    ) -> Vec<Result<Workload, StoreError>> {
        let updates = targets.iter().map(|victim| {
            let update = StatusUpdate::Evict {
                reason: reasons::PREEMPTED.to_string(),
                message: format!("Preempted to accommodate {}", preemptor.key),
            };
            update_with_retry(self.store.as_ref(), &victim.key, update, now, &self.retry)
        });
        let results: Vec<_> = futures::future::join_all(updates).await;
        let mut failures = 0;
        for (victim, result) in targets.iter().zip(&results) {
            match result {
                Ok(_) => self.events.record(Event::Preempted {
                    workload: victim.key.clone(),
                    preemptor: preemptor.key.clone(),
                }),
                Err(e) => {
                    failures += 1;
                    log::warn!("evicting {} failed: {e}", victim.key);
                }
            }
        }
        if failures > 0 {
            log::warn!(
                "issued {} of {} preemptions for {}",
                results.len() - failures,
                results.len(),
                preemptor.key
            );
        }
        results
    }
}

/// Returns the workloads to evict so that `assignment` becomes a fit, or an
/// empty set when no feasible set exists under policy.
///
/// The snapshot is mutated while simulating victim removal but is restored
/// to its input state before returning; with no preempting resources it is
/// not touched at all.
pub fn get_targets(
    wl: &WorkloadInfo,
    assignment: &Assignment,
    snapshot: &mut Snapshot,
) -> Vec<WorkloadInfo> {
    let preempting = assignment.preempting_resources();
    if preempting.is_empty() {
        return Vec::new();
    }
    let Some(cq_name) = wl.cluster_queue.clone() else {
        return Vec::new();
    };
    let mut candidates = find_candidates(wl, &cq_name, snapshot, &preempting);
    if candidates.is_empty() {
        return Vec::new();
    }
    candidates.sort_by(|a, b| candidates_ordering(a, b, &cq_name));

    let requests = assignment.total_requests(wl);

    // First attempt: anyone in the pool, but without borrowing. If that
    // fails, preempting within the queue while borrowing is still allowed.
    minimal_preemptions(&requests, &cq_name, snapshot, &preempting, &candidates, false)
        .or_else(|| {
            let own: Vec<WorkloadInfo> = candidates
                .iter()
                .filter(|c| c.cluster_queue.as_deref() == Some(cq_name.as_str()))
                .cloned()
                .collect();
            minimal_preemptions(&requests, &cq_name, snapshot, &preempting, &own, true)
        })
        .unwrap_or_default()
}

fn find_candidates(
    wl: &WorkloadInfo,
    cq_name: &str,
    snapshot: &Snapshot,
    preempting: &Map<FlavorName, Set<ResourceName>>,
) -> Vec<WorkloadInfo> {
    let cq = &snapshot.cluster_queues[cq_name];
    let mut candidates = Vec::new();

    if cq.preemption.within_cluster_queue != PreemptionRule::Never {
        let same_priority_ok =
            cq.preemption.within_cluster_queue == PreemptionRule::LowerOrNewerEqualPriority;
        for candidate in cq.workloads.values() {
            if candidate.priority > wl.priority {
                continue;
            }
            if candidate.priority == wl.priority
                && !(same_priority_ok && wl.created < candidate.admission_order_time())
            {
                continue;
            }
            if candidate.uses_any_flavor_resource(preempting) {
                candidates.push(candidate.clone());
            }
        }
    }

    if cq.preemption.reclaim_within_cohort != PreemptionRule::Never {
        if let Some(cohort) = cq.cohort.as_ref().and_then(|c| snapshot.cohorts.get(c)) {
            let only_lower = cq.preemption.reclaim_within_cohort != PreemptionRule::Any;
            for member in &cohort.members {
                if member == cq_name {
                    continue;
                }
                let Some(member_cq) = snapshot.cluster_queues.get(member) else {
                    continue;
                };
                // Quota can only be reclaimed from queues that borrow it.
                if !member_cq.is_borrowing_in(preempting) {
                    continue;
                }
                for candidate in member_cq.workloads.values() {
                    if only_lower && candidate.priority >= wl.priority {
                        continue;
                    }
                    if candidate.uses_any_flavor_resource(preempting) {
                        candidates.push(candidate.clone());
                    }
                }
            }
        }
    }
    candidates
}

/// Strict ordering of preemption candidates:
///   1. workloads from other cluster-queues in the cohort first (reclaiming
///      borrowed quota beats self-preemption),
///   2. lower priority first,
///   3. more recently admitted first,
///   4. workload identity.
pub fn candidates_ordering(a: &WorkloadInfo, b: &WorkloadInfo, cq: &str) -> Ordering {
    let a_own = a.cluster_queue.as_deref() == Some(cq);
    let b_own = b.cluster_queue.as_deref() == Some(cq);
    a_own
        .cmp(&b_own)
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| b.admission_order_time().cmp(&a.admission_order_time()))
        .then_with(|| a.key.cmp(&b.key))
}

/// Greedily removes candidates from the snapshot until the incoming demand
/// fits, then puts back every victim whose absence turned out unnecessary.
/// Leaves the snapshot as it was on entry.
fn minimal_preemptions(
    requests: &FlavorResourceQuantities,
    cq_name: &str,
    snapshot: &mut Snapshot,
    preempting: &Map<FlavorName, Set<ResourceName>>,
    candidates: &[WorkloadInfo],
    allow_borrowing: bool,
) -> Option<Vec<WorkloadInfo>> {
    let mut targets: Vec<WorkloadInfo> = Vec::new();
    let mut fits = false;
    for candidate in candidates {
        let own_queue = candidate.cluster_queue.as_deref() == Some(cq_name);
        if !own_queue {
            // Re-checked against the live simulation: earlier removals may
            // have stopped this queue from borrowing.
            let still_borrowing = candidate
                .cluster_queue
                .as_deref()
                .and_then(|cq| snapshot.cluster_queues.get(cq))
                .is_some_and(|cq| cq.is_borrowing_in(preempting));
            if !still_borrowing {
                continue;
            }
        }
        snapshot.remove_workload(candidate);
        targets.push(candidate.clone());
        if workload_fits(requests, cq_name, snapshot, allow_borrowing) {
            fits = true;
            break;
        }
    }
    if !fits {
        for target in &targets {
            snapshot.add_workload(target.clone());
        }
        return None;
    }
    // Minimality: in reverse selection order, try to put each victim back.
    for i in (0..targets.len().saturating_sub(1)).rev() {
        snapshot.add_workload(targets[i].clone());
        if workload_fits(requests, cq_name, snapshot, allow_borrowing) {
            targets.remove(i);
        } else {
            snapshot.remove_workload(&targets[i]);
        }
    }
    for target in &targets {
        snapshot.add_workload(target.clone());
    }
    Some(targets)
}

/// Whether the given demand fits the cluster-queue with its current snapshot
/// usage, optionally borrowing up to the per-resource borrowing limits.
fn workload_fits(
    requests: &FlavorResourceQuantities,
    cq_name: &str,
    snapshot: &Snapshot,
    allow_borrowing: bool,
) -> bool {
    let cq = &snapshot.cluster_queues[cq_name];
    let cohort = cq.cohort.as_ref().and_then(|c| snapshot.cohorts.get(c));
    for group in &cq.resource_groups {
        for flavor_quotas in &group.flavors {
            let Some(flavor_requests) = requests.get(&flavor_quotas.name) else {
                continue;
            };
            for (resource, needed) in flavor_requests {
                let Some(quota) = flavor_quotas.quota_for(resource) else {
                    continue;
                };
                let used = cq.usage_of(&flavor_quotas.name, resource);
                let within_local = match (allow_borrowing && cohort.is_some(), quota.borrowing_limit)
                {
                    (true, Some(limit)) => used + *needed <= quota.nominal_quota + limit,
                    (true, None) => true,
                    (false, _) => used + *needed <= quota.nominal_quota,
                };
                if !within_local {
                    return false;
                }
                if let Some(cohort) = cohort {
                    let cohort_used = quantity_of(&cohort.usage, &flavor_quotas.name, resource);
                    let requestable =
                        quantity_of(&cohort.requestable, &flavor_quotas.name, resource);
                    if cohort_used + *needed > requestable {
                        return false;
                    }
                }
            }
        }
    }
    true
}
