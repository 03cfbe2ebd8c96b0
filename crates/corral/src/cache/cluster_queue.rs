use crate::api::{
    ClusterQueue, PreemptionPolicy, QueueingStrategy, ResourceFlavor, ResourceGroup, ResourceQuota,
};
use crate::resources::quantities::add_all;
use crate::resources::{FlavorName, FlavorResourceQuantities, ResourceAmount, ResourceName};
use crate::workload::{WorkloadInfo, WorkloadKey};
use crate::{Map, Set};

/// A cluster-queue as tracked by the cache and copied into snapshots: the
/// validated spec pieces plus runtime usage and the admitted workloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterQueueState {
    pub name: String,
    pub cohort: Option<String>,
    pub resource_groups: Vec<ResourceGroup>,
    /// Per group, the node-selector keys that are relevant when matching
    /// pod-sets against the group's flavors.
    pub group_label_keys: Vec<Set<String>>,
    pub queueing_strategy: QueueingStrategy,
    pub preemption: PreemptionPolicy,
    pub usage: FlavorResourceQuantities,
    pub workloads: Map<WorkloadKey, WorkloadInfo>,
    /// `Some` iff the queue is inactive and skipped by the scheduler.
    pub inactive_reason: Option<String>,
}

impl ClusterQueueState {
    pub fn new(spec: &ClusterQueue, flavors: &Map<FlavorName, ResourceFlavor>) -> Self {
        let mut state = ClusterQueueState {
            name: spec.name.clone(),
            cohort: spec.cohort.clone(),
            resource_groups: spec.resource_groups.clone(),
            group_label_keys: Vec::new(),
            queueing_strategy: spec.queueing_strategy,
            preemption: spec.preemption.clone(),
            usage: FlavorResourceQuantities::default(),
            workloads: Map::default(),
            inactive_reason: None,
        };
        state.refresh(flavors);
        state
    }

    /// Re-applies an updated spec, keeping the admitted workloads.
    pub fn update_spec(&mut self, spec: &ClusterQueue, flavors: &Map<FlavorName, ResourceFlavor>) {
        self.cohort = spec.cohort.clone();
        self.resource_groups = spec.resource_groups.clone();
        self.queueing_strategy = spec.queueing_strategy;
        self.preemption = spec.preemption.clone();
        self.refresh(flavors);
    }

    /// Revalidates the spec against the known flavors and rebuilds the
    /// derived state: activity, relevant label keys and the usage vector
    /// (zeroed quota entries plus the admitted contributions).
    pub fn refresh(&mut self, flavors: &Map<FlavorName, ResourceFlavor>) {
        self.inactive_reason = validate(&self.resource_groups, flavors).err();
        self.group_label_keys = self
            .resource_groups
            .iter()
            .map(|group| {
                group
                    .flavors
                    .iter()
                    .filter_map(|fq| flavors.get(&fq.name))
                    .flat_map(|flavor| flavor.node_labels.keys().cloned())
                    .collect()
            })
            .collect();

        let mut usage = FlavorResourceQuantities::default();
        for group in &self.resource_groups {
            for flavor_quotas in &group.flavors {
                let resources = usage.entry(flavor_quotas.name.clone()).or_default();
                for quota in &flavor_quotas.resources {
                    resources.insert(quota.name.clone(), ResourceAmount::ZERO);
                }
            }
        }
        for info in self.workloads.values() {
            add_all(&mut usage, &info.total_requests());
        }
        self.usage = usage;
    }

    pub fn is_active(&self) -> bool {
        self.inactive_reason.is_none()
    }

    pub fn add_workload(&mut self, info: WorkloadInfo) {
        add_all(&mut self.usage, &info.total_requests());
        self.workloads.insert(info.key.clone(), info);
    }

    pub fn remove_workload(&mut self, key: &WorkloadKey) -> Option<WorkloadInfo> {
        let info = self.workloads.remove(key)?;
        crate::resources::quantities::sub_all(&mut self.usage, &info.total_requests());
        Some(info)
    }

    /// Index of the resource group covering `resource`, if any.
    pub fn group_for(&self, resource: &str) -> Option<usize> {
        self.resource_groups
            .iter()
            .position(|g| g.covered_resources.iter().any(|r| r == resource))
    }

    pub fn quota_for(&self, flavor: &str, resource: &str) -> Option<&ResourceQuota> {
        self.resource_groups
            .iter()
            .flat_map(|g| &g.flavors)
            .find(|fq| fq.name == flavor)
            .and_then(|fq| fq.quota_for(resource))
    }

    pub fn usage_of(&self, flavor: &str, resource: &str) -> ResourceAmount {
        crate::resources::quantities::quantity_of(&self.usage, flavor, resource)
    }

    /// Whether this queue consumes beyond its nominal quota in any of the
    /// given (flavor, resource) pairs.
    pub fn is_borrowing_in(&self, wanted: &Map<FlavorName, Set<ResourceName>>) -> bool {
        wanted.iter().any(|(flavor, resources)| {
            resources.iter().any(|resource| {
                self.quota_for(flavor, resource)
                    .is_some_and(|quota| self.usage_of(flavor, resource) > quota.nominal_quota)
            })
        })
    }

    /// Largest usage/nominal ratio over the queue's quota entries; the
    /// scheduler's fairness key.
    pub fn dominant_usage_share(&self) -> f64 {
        let mut share: f64 = 0.0;
        for group in &self.resource_groups {
            for flavor_quotas in &group.flavors {
                for quota in &flavor_quotas.resources {
                    if quota.nominal_quota.is_zero() {
                        continue;
                    }
                    let used = self.usage_of(&flavor_quotas.name, &quota.name);
                    share = share.max(used.as_f64() / quota.nominal_quota.as_f64());
                }
            }
        }
        share
    }
}

/// A malformed spec does not fail the cache operation; it deactivates the
/// queue until the spec or the flavors change.
fn validate(
    groups: &[ResourceGroup],
    flavors: &Map<FlavorName, ResourceFlavor>,
) -> Result<(), String> {
    let mut covered: Set<&str> = Set::default();
    for group in groups {
        if group.flavors.is_empty() {
            return Err("resource group without flavors".to_string());
        }
        for resource in &group.covered_resources {
            if !covered.insert(resource.as_str()) {
                return Err(format!("resource {resource} appears in multiple groups"));
            }
        }
        for flavor_quotas in &group.flavors {
            if !flavors.contains_key(&flavor_quotas.name) {
                return Err(format!("unknown flavor {}", flavor_quotas.name));
            }
            for resource in &group.covered_resources {
                if flavor_quotas.quota_for(resource).is_none() {
                    return Err(format!(
                        "flavor {} lacks a quota for {resource}",
                        flavor_quotas.name
                    ));
                }
            }
            for quota in &flavor_quotas.resources {
                if !group.covered_resources.contains(&quota.name) {
                    return Err(format!(
                        "flavor {} lists {} outside the group's resources",
                        flavor_quotas.name, quota.name
                    ));
                }
            }
        }
    }
    Ok(())
}
