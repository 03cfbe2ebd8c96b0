use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::api::workload::PodSetAssignment;
use crate::api::{Admission, PreemptionRule, ResourceFlavor, Taint};
use crate::cache::{ClusterQueueState, Snapshot};
use crate::resources::quantities::{add_quantity, quantity_of};
use crate::resources::{FlavorName, FlavorResourceQuantities, ResourceAmount, ResourceName};
use crate::workload::{PodSetResources, WorkloadInfo};
use crate::{Map, Set};

/// How a single (pod-set, resource) pair can be satisfied by a flavor.
/// The representative mode of a whole assignment is the worst of its parts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum AssignmentMode {
    NoFit,
    /// Fits only if admitted workloads are evicted first.
    Preempt,
    Fit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlavorAssignment {
    pub name: FlavorName,
    pub mode: AssignmentMode,
    /// Amount consumed beyond the queue's nominal quota.
    pub borrow: ResourceAmount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodSetDraft {
    pub name: String,
    /// Admitted pod count; lower than the requested count under partial
    /// admission.
    pub count: u32,
    pub flavors: BTreeMap<ResourceName, FlavorAssignment>,
}

/// The outcome of flavor assignment for one workload against one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub mode: AssignmentMode,
    pub pod_sets: SmallVec<[PodSetDraft; 1]>,
    /// Human-readable explanations for every flavor that was ruled out.
    pub reasons: Vec<String>,
}

impl Assignment {
    /// (flavor, resource) pairs that need preemption to fit.
    pub fn preempting_resources(&self) -> Map<FlavorName, Set<ResourceName>> {
        let mut wanted: Map<FlavorName, Set<ResourceName>> = Map::default();
        for ps in &self.pod_sets {
            for (resource, fa) in &ps.flavors {
                if fa.mode == AssignmentMode::Preempt {
                    wanted
                        .entry(fa.name.clone())
                        .or_default()
                        .insert(resource.clone());
                }
            }
        }
        wanted
    }

    /// Total demand of the assignment keyed by (flavor, resource).
    pub fn total_requests(&self, wl: &WorkloadInfo) -> FlavorResourceQuantities {
        let mut totals = FlavorResourceQuantities::default();
        for (draft, ps) in self.pod_sets.iter().zip(&wl.pod_sets) {
            for (resource, fa) in &draft.flavors {
                if let Some(request) = ps.requests.get(resource) {
                    add_quantity(&mut totals, &fa.name, resource, *request * draft.count);
                }
            }
        }
        totals
    }

    pub fn to_admission(&self, cluster_queue: &str, wl: &WorkloadInfo) -> Admission {
        Admission {
            cluster_queue: cluster_queue.to_string(),
            pod_set_assignments: self
                .pod_sets
                .iter()
                .zip(&wl.pod_sets)
                .map(|(draft, ps)| PodSetAssignment {
                    name: draft.name.clone(),
                    count: draft.count,
                    flavors: draft
                        .flavors
                        .iter()
                        .map(|(r, fa)| (r.clone(), fa.name.clone()))
                        .collect(),
                    resource_usage: ps
                        .requests
                        .iter()
                        .map(|(r, req)| (r.clone(), *req * draft.count))
                        .collect(),
                })
                .collect(),
        }
    }

    /// The incoming workload as it will be accounted once admitted: flavors
    /// bound, counts possibly reduced, owned by the cluster-queue.
    pub fn admitted_info(
        &self,
        wl: &WorkloadInfo,
        cluster_queue: &str,
        admitted_at: chrono::DateTime<chrono::Utc>,
    ) -> WorkloadInfo {
        let mut info = wl.clone();
        info.cluster_queue = Some(cluster_queue.to_string());
        info.admitted_at = Some(admitted_at);
        for (ps, draft) in info.pod_sets.iter_mut().zip(&self.pod_sets) {
            ps.count = draft.count;
            ps.flavors = draft
                .flavors
                .iter()
                .map(|(r, fa)| (r.clone(), fa.name.clone()))
                .collect();
        }
        info
    }
}

/// Attempts to bind every (pod-set, resource) of the workload to a flavor of
/// the snapshot's cluster-queue `cq`.
///
/// Output depends only on the workload and the snapshot; resources are
/// visited in sorted request order and flavors in spec order, so repeated
/// runs produce identical assignments.
pub fn assign(wl: &WorkloadInfo, cq: &ClusterQueueState, snapshot: &Snapshot) -> Assignment {
    let full_counts: Vec<u32> = wl.pod_sets.iter().map(|ps| ps.active_count()).collect();
    let full = assign_with_counts(wl, &full_counts, cq, snapshot);
    if full.mode == AssignmentMode::Fit {
        return full;
    }

    // Partial admission: look for the largest reduced counts that fit
    // outright. Reduction is never combined with preemption.
    let reducible: Vec<usize> = wl
        .pod_sets
        .iter()
        .enumerate()
        .filter(|(_, ps)| ps.min_count.is_some_and(|min| min < ps.count))
        .map(|(i, _)| i)
        .collect();
    if reducible.is_empty() {
        return full;
    }

    let mut counts = full_counts.clone();
    for &i in &reducible {
        counts[i] = wl.pod_sets[i].min_count.unwrap();
    }
    if assign_with_counts(wl, &counts, cq, snapshot).mode != AssignmentMode::Fit {
        return full;
    }
    // Raise each reducible pod-set as far as it goes, left to right.
    for &i in &reducible {
        let mut lo = counts[i];
        let mut hi = full_counts[i];
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            counts[i] = mid;
            if assign_with_counts(wl, &counts, cq, snapshot).mode == AssignmentMode::Fit {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        counts[i] = lo;
    }
    let reduced = assign_with_counts(wl, &counts, cq, snapshot);
    debug_assert_eq!(reduced.mode, AssignmentMode::Fit);
    reduced
}

fn assign_with_counts(
    wl: &WorkloadInfo,
    counts: &[u32],
    cq: &ClusterQueueState,
    snapshot: &Snapshot,
) -> Assignment {
    let mut assignment = Assignment {
        mode: AssignmentMode::Fit,
        pod_sets: SmallVec::with_capacity(wl.pod_sets.len()),
        reasons: Vec::new(),
    };
    // Demand already placed by earlier pod-sets of this workload.
    let mut pass_usage = FlavorResourceQuantities::default();
    for (ps, &count) in wl.pod_sets.iter().zip(counts) {
        let mut draft = PodSetDraft {
            name: ps.name.clone(),
            count,
            flavors: BTreeMap::new(),
        };
        for (resource, request) in &ps.requests {
            let needed = *request * count;
            match find_flavor_for_resource(
                ps,
                resource,
                needed,
                cq,
                snapshot,
                &pass_usage,
                &mut assignment.reasons,
            ) {
                Some(fa) => {
                    add_quantity(&mut pass_usage, &fa.name, resource, needed);
                    assignment.mode = assignment.mode.min(fa.mode);
                    draft.flavors.insert(resource.clone(), fa);
                }
                None => assignment.mode = AssignmentMode::NoFit,
            }
        }
        assignment.pod_sets.push(draft);
    }
    assignment
}

fn can_preempt(cq: &ClusterQueueState) -> bool {
    cq.preemption.within_cluster_queue != PreemptionRule::Never
        || (cq.cohort.is_some() && cq.preemption.reclaim_within_cohort != PreemptionRule::Never)
}

fn find_flavor_for_resource(
    ps: &PodSetResources,
    resource: &ResourceName,
    needed: ResourceAmount,
    cq: &ClusterQueueState,
    snapshot: &Snapshot,
    pass_usage: &FlavorResourceQuantities,
    reasons: &mut Vec<String>,
) -> Option<FlavorAssignment> {
    let Some(group_idx) = cq.group_for(resource) else {
        reasons.push(format!("resource {resource} is not covered by any resource group"));
        return None;
    };
    let group = &cq.resource_groups[group_idx];
    let relevant_keys = &cq.group_label_keys[group_idx];

    let mut best_preempt: Option<FlavorAssignment> = None;
    for flavor_quotas in &group.flavors {
        let Some(flavor) = snapshot.flavors.get(&flavor_quotas.name) else {
            reasons.push(format!("flavor {} does not exist", flavor_quotas.name));
            continue;
        };
        if let Some(taint) = untolerated_taint(flavor, ps) {
            reasons.push(format!(
                "flavor {} has untolerated taint {}",
                flavor.name, taint.key
            ));
            continue;
        }
        if !selector_matches(ps, flavor, relevant_keys) {
            reasons.push(format!(
                "flavor {} does not match the pod-set node selector",
                flavor.name
            ));
            continue;
        }
        let Some(quota) = flavor_quotas.quota_for(resource) else {
            continue;
        };
        let used = cq.usage_of(&flavor_quotas.name, resource)
            + quantity_of(pass_usage, &flavor_quotas.name, resource);
        let cohort = cq
            .cohort
            .as_ref()
            .and_then(|name| snapshot.cohorts.get(name));

        // Local ceiling: nominal plus the borrowing limit when a cohort can
        // lend, nominal alone otherwise.
        let local_fit = match (cohort.is_some(), quota.borrowing_limit) {
            (true, Some(limit)) => used + needed <= quota.nominal_quota + limit,
            (true, None) => true,
            (false, _) => used + needed <= quota.nominal_quota,
        };
        let cohort_fit = cohort.is_none_or(|cohort| {
            let cohort_used = quantity_of(&cohort.usage, &flavor_quotas.name, resource)
                + quantity_of(pass_usage, &flavor_quotas.name, resource);
            cohort_used + needed
                <= quantity_of(&cohort.requestable, &flavor_quotas.name, resource)
        });
        let borrow = (used + needed).saturating_sub(quota.nominal_quota);
        if local_fit && cohort_fit {
            return Some(FlavorAssignment {
                name: flavor_quotas.name.clone(),
                mode: AssignmentMode::Fit,
                borrow,
            });
        }

        // Even with every admitted workload evicted, the demand must fit
        // under the queue's ceiling and the cohort's total nominal quota.
        let max_capacity = match cohort {
            Some(cohort) => {
                let requestable =
                    quantity_of(&cohort.requestable, &flavor_quotas.name, resource);
                match quota.borrowing_limit {
                    Some(limit) => requestable.min(quota.nominal_quota + limit),
                    None => requestable,
                }
            }
            None => quota.nominal_quota,
        };
        if needed > max_capacity {
            reasons.push(format!(
                "insufficient total quota for {resource} in flavor {}, requested {needed}",
                flavor_quotas.name
            ));
            continue;
        }
        reasons.push(format!(
            "insufficient unused quota for {resource} in flavor {}, {needed} more needed",
            flavor_quotas.name
        ));
        if can_preempt(cq) {
            let candidate = FlavorAssignment {
                name: flavor_quotas.name.clone(),
                mode: AssignmentMode::Preempt,
                borrow,
            };
            // Least borrowed wins; spec order breaks ties.
            if best_preempt
                .as_ref()
                .is_none_or(|best| candidate.borrow < best.borrow)
            {
                best_preempt = Some(candidate);
            }
        }
    }
    best_preempt
}

fn untolerated_taint<'a>(flavor: &'a ResourceFlavor, ps: &PodSetResources) -> Option<&'a Taint> {
    flavor.node_taints.iter().find(|taint| {
        taint.effect.blocks_scheduling() && !ps.tolerations.iter().any(|t| t.tolerates(taint))
    })
}

/// Matches the pod-set node selector against the flavor's labels. Selector
/// keys no flavor of the group carries belong to node-level scheduling and
/// are ignored here.
fn selector_matches(ps: &PodSetResources, flavor: &ResourceFlavor, relevant_keys: &Set<String>) -> bool {
    ps.node_selector.iter().all(|(key, value)| {
        match flavor.node_labels.get(key) {
            Some(label) => label == value,
            None => !relevant_keys.contains(key),
        }
    })
}
