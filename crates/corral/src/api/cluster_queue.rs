use serde::{Deserialize, Serialize};

use crate::resources::{FlavorName, ResourceAmount, ResourceName};

/// Cluster-scope quota bucket with admission policy.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<String>,
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
    #[serde(default)]
    pub queueing_strategy: QueueingStrategy,
    #[serde(default)]
    pub preemption: PreemptionPolicy,
}

/// A set of resources quota-managed together. Within a group the flavor
/// assigner tries flavors left-to-right; a resource belongs to at most one
/// group of its cluster-queue.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub covered_resources: Vec<ResourceName>,
    pub flavors: Vec<FlavorQuotas>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorQuotas {
    pub name: FlavorName,
    pub resources: Vec<ResourceQuota>,
}

impl FlavorQuotas {
    pub fn quota_for(&self, resource: &str) -> Option<&ResourceQuota> {
        self.resources.iter().find(|q| q.name == resource)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub name: ResourceName,
    pub nominal_quota: ResourceAmount,
    /// Maximum amount this queue may consume beyond its nominal quota by
    /// borrowing from its cohort. `None` only bounds borrowing by the
    /// cohort's unused nominal quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrowing_limit: Option<ResourceAmount>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum QueueingStrategy {
    /// Head-of-line blocking: a head that cannot be admitted makes the whole
    /// cluster-queue yield for the pass.
    StrictFIFO,
    /// A blocked head is set aside and the next workload is considered;
    /// relative order is preserved across passes.
    #[default]
    BestEffortFIFO,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreemptionPolicy {
    #[serde(default)]
    pub within_cluster_queue: PreemptionRule,
    #[serde(default)]
    pub reclaim_within_cohort: PreemptionRule,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum PreemptionRule {
    #[default]
    Never,
    LowerPriority,
    /// Also allows equal priority when the victim was admitted after the
    /// incoming workload was created. Only meaningful within a cluster-queue.
    LowerOrNewerEqualPriority,
    /// Any priority. Only meaningful for cohort reclaim.
    Any,
}

impl ClusterQueue {
    pub fn new(name: &str) -> Self {
        ClusterQueue {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Whether any preemption at all is enabled for this queue.
    pub fn preemption_enabled(&self) -> bool {
        self.preemption.within_cluster_queue != PreemptionRule::Never
            || (self.cohort.is_some() && self.preemption.reclaim_within_cohort != PreemptionRule::Never)
    }
}
