use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use crate::api::condition::{find_condition, ConditionType};
use crate::api::{Toleration, Workload};
use crate::resources::quantities::add_quantity;
use crate::resources::{FlavorName, FlavorResourceQuantities, ResourceAmount, ResourceName};
use crate::Priority;

/// Identity of a workload: `namespace/name`.
#[derive(Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WorkloadKey(String);

impl WorkloadKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        WorkloadKey(format!("{namespace}/{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkloadKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for WorkloadKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Summary of a workload as the cache, assigner and preemption engine see it.
/// For an admitted workload the per-resource flavor bindings are filled in
/// and `total_requests` yields its quota contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadInfo {
    pub key: WorkloadKey,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    /// Target cluster-queue; from the admission for admitted workloads, from
    /// queue resolution for pending ones.
    pub cluster_queue: Option<String>,
    /// Transition time of the `Admitted` condition, if any.
    pub admitted_at: Option<DateTime<Utc>>,
    /// Almost every workload has exactly one pod-set.
    pub pod_sets: SmallVec<[PodSetResources; 1]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodSetResources {
    pub name: String,
    /// Effective pod count: the admission's count for admitted workloads,
    /// otherwise the spec count.
    pub count: u32,
    pub min_count: Option<u32>,
    /// Pods already finished whose quota share is returned.
    pub reclaimable: u32,
    /// Requests per pod.
    pub requests: BTreeMap<ResourceName, ResourceAmount>,
    /// Flavor bound per resource; empty while pending.
    pub flavors: BTreeMap<ResourceName, FlavorName>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

impl PodSetResources {
    pub fn active_count(&self) -> u32 {
        self.count.saturating_sub(self.reclaimable)
    }
}

impl WorkloadInfo {
    pub fn new(workload: &Workload) -> Self {
        let admission = workload.status.admission.as_ref();
        let admitted_at = find_condition(&workload.status.conditions, ConditionType::Admitted)
            .filter(|c| c.is_true())
            .map(|c| c.last_transition_time);
        let pod_sets = workload
            .spec
            .pod_sets
            .iter()
            .map(|ps| {
                let assignment = admission
                    .and_then(|a| a.pod_set_assignments.iter().find(|psa| psa.name == ps.name));
                PodSetResources {
                    name: ps.name.clone(),
                    count: assignment.map(|a| a.count).unwrap_or(ps.count),
                    min_count: ps.min_count,
                    reclaimable: workload.reclaimable_count(&ps.name),
                    requests: ps.template.requests.clone(),
                    flavors: assignment.map(|a| a.flavors.clone()).unwrap_or_default(),
                    node_selector: ps.template.node_selector.clone(),
                    tolerations: ps.template.tolerations.clone(),
                }
            })
            .collect();
        WorkloadInfo {
            key: workload.key(),
            priority: workload.priority(),
            created: workload.creation_timestamp,
            cluster_queue: admission.map(|a| a.cluster_queue.clone()),
            admitted_at,
            pod_sets,
        }
    }

    pub fn with_cluster_queue(workload: &Workload, cluster_queue: &str) -> Self {
        let mut info = Self::new(workload);
        info.cluster_queue = Some(cluster_queue.to_string());
        info
    }

    /// The workload's quota contribution, keyed by (flavor, resource).
    /// Reclaimed pods no longer count. Meaningful once flavors are bound.
    pub fn total_requests(&self) -> FlavorResourceQuantities {
        let mut totals = FlavorResourceQuantities::default();
        for ps in &self.pod_sets {
            let count = ps.active_count();
            for (resource, request) in &ps.requests {
                if let Some(flavor) = ps.flavors.get(resource) {
                    add_quantity(&mut totals, flavor, resource, *request * count);
                }
            }
        }
        totals
    }

    /// Timestamp used when ordering admitted workloads by recency: the
    /// `Admitted` transition, or creation for workloads never observed as
    /// admitted.
    pub fn admission_order_time(&self) -> DateTime<Utc> {
        self.admitted_at.unwrap_or(self.created)
    }

    /// Whether any (flavor, resource) pair in `wanted` is used by this
    /// workload.
    pub fn uses_any_flavor_resource(
        &self,
        wanted: &crate::Map<FlavorName, crate::Set<ResourceName>>,
    ) -> bool {
        self.pod_sets.iter().any(|ps| {
            ps.flavors.iter().any(|(resource, flavor)| {
                wanted
                    .get(flavor)
                    .is_some_and(|resources| resources.contains(resource))
            })
        })
    }
}
