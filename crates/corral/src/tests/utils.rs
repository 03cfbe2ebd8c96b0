use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::api::condition::{reasons, Condition, ConditionStatus, ConditionType};
use crate::api::workload::PodSetAssignment;
use crate::api::{
    Admission, ClusterQueue, FlavorQuotas, LocalQueue, PodSet, PreemptionRule, QueueingStrategy,
    ReclaimablePods, ResourceFlavor, ResourceGroup, ResourceQuota, Workload, WorkloadSpec,
};
use crate::cache::Cache;
use crate::queue::QueueManager;
use crate::resources::ResourceAmount;
use crate::scheduler::flavorassigner::{Assignment, AssignmentMode, FlavorAssignment, PodSetDraft};
use crate::workload::WorkloadInfo;
use crate::Priority;

pub fn amount(s: &str) -> ResourceAmount {
    s.parse().unwrap()
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

pub fn at_secs(secs: i64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
}

pub fn flavor(name: &str) -> ResourceFlavor {
    ResourceFlavor::new(name)
}

// FlavorQuotas

pub struct FlavorQuotasBuilder(FlavorQuotas);

pub fn quotas(flavor: &str) -> FlavorQuotasBuilder {
    FlavorQuotasBuilder(FlavorQuotas {
        name: flavor.to_string(),
        resources: Vec::new(),
    })
}

impl FlavorQuotasBuilder {
    pub fn resource(mut self, name: &str, nominal: &str) -> Self {
        self.0.resources.push(ResourceQuota {
            name: name.to_string(),
            nominal_quota: amount(nominal),
            borrowing_limit: None,
        });
        self
    }

    pub fn resource_with_limit(mut self, name: &str, nominal: &str, limit: &str) -> Self {
        self.0.resources.push(ResourceQuota {
            name: name.to_string(),
            nominal_quota: amount(nominal),
            borrowing_limit: Some(amount(limit)),
        });
        self
    }

    pub fn build(self) -> FlavorQuotas {
        self.0
    }
}

// ClusterQueue

pub struct ClusterQueueBuilder(ClusterQueue);

pub fn cluster_queue(name: &str) -> ClusterQueueBuilder {
    ClusterQueueBuilder(ClusterQueue::new(name))
}

impl ClusterQueueBuilder {
    pub fn cohort(mut self, name: &str) -> Self {
        self.0.cohort = Some(name.to_string());
        self
    }

    /// Adds a group covering the union of the flavors' resource names.
    pub fn resource_group(mut self, flavors: Vec<FlavorQuotas>) -> Self {
        let mut covered: Vec<String> = Vec::new();
        for fq in &flavors {
            for quota in &fq.resources {
                if !covered.contains(&quota.name) {
                    covered.push(quota.name.clone());
                }
            }
        }
        self.0.resource_groups.push(ResourceGroup {
            covered_resources: covered,
            flavors,
        });
        self
    }

    pub fn preempt_within(mut self, rule: PreemptionRule) -> Self {
        self.0.preemption.within_cluster_queue = rule;
        self
    }

    pub fn reclaim_within_cohort(mut self, rule: PreemptionRule) -> Self {
        self.0.preemption.reclaim_within_cohort = rule;
        self
    }

    pub fn strategy(mut self, strategy: QueueingStrategy) -> Self {
        self.0.queueing_strategy = strategy;
        self
    }

    pub fn build(self) -> ClusterQueue {
        self.0
    }
}

// PodSet

pub struct PodSetBuilder(PodSet);

pub fn pod_set(name: &str, count: u32) -> PodSetBuilder {
    PodSetBuilder(PodSet {
        name: name.to_string(),
        count,
        min_count: None,
        template: Default::default(),
    })
}

impl PodSetBuilder {
    pub fn request(mut self, resource: &str, qty: &str) -> Self {
        self.0
            .template
            .requests
            .insert(resource.to_string(), amount(qty));
        self
    }

    pub fn min_count(mut self, count: u32) -> Self {
        self.0.min_count = Some(count);
        self
    }

    pub fn node_selector(mut self, key: &str, value: &str) -> Self {
        self.0
            .template
            .node_selector
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> PodSet {
        self.0
    }
}

// Workload

pub struct WorkloadBuilder {
    workload: Workload,
    explicit_pod_sets: bool,
}

pub fn workload(name: &str, namespace: &str) -> WorkloadBuilder {
    WorkloadBuilder {
        workload: Workload {
            name: name.to_string(),
            namespace: namespace.to_string(),
            creation_timestamp: epoch(),
            spec: WorkloadSpec {
                pod_sets: vec![pod_set("main", 1).build()],
                ..Default::default()
            },
            status: Default::default(),
        },
        explicit_pod_sets: false,
    }
}

impl WorkloadBuilder {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.workload.spec.priority = priority;
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.workload.creation_timestamp = at;
        self
    }

    pub fn queue(mut self, queue_name: &str) -> Self {
        self.workload.spec.queue_name = queue_name.to_string();
        self
    }

    /// Adds a request to the default single-pod pod-set.
    pub fn request(mut self, resource: &str, qty: &str) -> Self {
        assert!(!self.explicit_pod_sets);
        self.workload.spec.pod_sets[0]
            .template
            .requests
            .insert(resource.to_string(), amount(qty));
        self
    }

    /// Replaces the default pod-set with explicit ones.
    pub fn pod_sets(mut self, pod_sets: Vec<PodSet>) -> Self {
        self.workload.spec.pod_sets = pod_sets;
        self.explicit_pod_sets = true;
        self
    }

    pub fn reclaimable(mut self, pod_set: &str, count: u32) -> Self {
        self.workload.status.reclaimable_pods.push(ReclaimablePods {
            name: pod_set.to_string(),
            count,
        });
        self
    }

    /// Marks the workload admitted by `cluster_queue`, binding the given
    /// resource -> flavor pairs in every pod-set at its full count.
    pub fn admit(mut self, cluster_queue: &str, flavors: &[(&str, &str)]) -> Self {
        let pod_set_assignments = self
            .workload
            .spec
            .pod_sets
            .iter()
            .map(|ps| PodSetAssignment {
                name: ps.name.clone(),
                count: ps.count,
                flavors: flavors
                    .iter()
                    .filter(|(resource, _)| ps.template.requests.contains_key(*resource))
                    .map(|(resource, flavor)| (resource.to_string(), flavor.to_string()))
                    .collect(),
                resource_usage: ps
                    .template
                    .requests
                    .iter()
                    .map(|(r, req)| (r.clone(), *req * ps.count))
                    .collect(),
            })
            .collect();
        self.workload.status.admission = Some(Admission {
            cluster_queue: cluster_queue.to_string(),
            pod_set_assignments,
        });
        let now = self.workload.creation_timestamp;
        crate::api::condition::set_condition(
            &mut self.workload.status.conditions,
            Condition::new(
                ConditionType::QuotaReserved,
                ConditionStatus::True,
                reasons::QUOTA_RESERVED,
                String::new(),
                now,
            ),
        );
        self
    }

    /// Sets the `Admitted` condition transition explicitly; used by the
    /// preemption-ordering tests.
    pub fn admitted_at(mut self, at: DateTime<Utc>) -> Self {
        crate::api::condition::set_condition(
            &mut self.workload.status.conditions,
            Condition::new(
                ConditionType::Admitted,
                ConditionStatus::True,
                reasons::ADMITTED,
                String::new(),
                at,
            ),
        );
        self
    }

    pub fn build(self) -> Workload {
        self.workload
    }

    pub fn build_arc(self) -> Arc<Workload> {
        Arc::new(self.build())
    }

    pub fn info(self) -> WorkloadInfo {
        WorkloadInfo::new(&self.build())
    }
}

// Assignments used when driving the preemption engine directly.

pub fn assignment_for(
    wl: &WorkloadInfo,
    per_pod_set: &[&[(&str, &str, AssignmentMode)]],
) -> Assignment {
    assert_eq!(wl.pod_sets.len(), per_pod_set.len());
    let mut mode = AssignmentMode::Fit;
    let mut pod_sets = smallvec::SmallVec::with_capacity(wl.pod_sets.len());
    for (ps, entries) in wl.pod_sets.iter().zip(per_pod_set) {
        let mut draft = PodSetDraft {
            name: ps.name.clone(),
            count: ps.active_count(),
            flavors: Default::default(),
        };
        for (resource, flavor, entry_mode) in entries.iter() {
            mode = mode.min(*entry_mode);
            draft.flavors.insert(
                resource.to_string(),
                FlavorAssignment {
                    name: flavor.to_string(),
                    mode: *entry_mode,
                    borrow: ResourceAmount::ZERO,
                },
            );
        }
        pod_sets.push(draft);
    }
    Assignment {
        mode,
        pod_sets,
        reasons: Vec::new(),
    }
}

pub fn single_pod_set_assignment(
    wl: &WorkloadInfo,
    entries: &[(&str, &str, AssignmentMode)],
) -> Assignment {
    assignment_for(wl, &[entries])
}

// Cache and queue assembly helpers.

pub fn build_cache(
    flavors: &[ResourceFlavor],
    cluster_queues: &[ClusterQueue],
    admitted: &[Workload],
) -> Cache {
    let cache = Cache::new();
    for flavor in flavors {
        cache.add_or_update_flavor(flavor.clone());
    }
    for cq in cluster_queues {
        cache.add_cluster_queue(cq).unwrap();
    }
    for workload in admitted {
        cache.add_workload(WorkloadInfo::new(workload)).unwrap();
    }
    cache
}

/// Registers each cluster-queue in the manager together with a local queue
/// named after it in the empty namespace.
pub fn build_queues(cluster_queues: &[ClusterQueue]) -> QueueManager {
    let manager = QueueManager::new();
    for cq in cluster_queues {
        manager.add_cluster_queue(&cq.name, cq.queueing_strategy);
        manager.add_local_queue(&LocalQueue::new("", &cq.name, &cq.name));
    }
    manager
}
