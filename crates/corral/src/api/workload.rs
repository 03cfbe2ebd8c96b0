use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::api::condition::{condition_is_true, Condition, ConditionType};
use crate::api::flavor::Toleration;
use crate::resources::{FlavorName, ResourceAmount, ResourceName};
use crate::Priority;

/// The admission unit: a uniform description of a batch job's resource shape,
/// produced by the job controllers out of concrete job kinds.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "epoch")]
    pub creation_timestamp: DateTime<Utc>,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Name of the local queue this workload submits to, resolved within the
    /// workload's namespace.
    #[serde(default)]
    pub queue_name: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority_class_name: String,
    pub pod_sets: Vec<PodSet>,
}

/// A named group of `count` identical pods.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    pub name: String,
    pub count: u32,
    /// Present iff partial admission is enabled for this pod-set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    #[serde(default)]
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Resource requests per pod, summed over the pod's containers.
    #[serde(default)]
    pub requests: BTreeMap<ResourceName, ResourceAmount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<Admission>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reclaimable_pods: Vec<ReclaimablePods>,
}

/// The reservation binding a workload to a cluster-queue and, per pod-set,
/// each requested resource to a flavor. Present iff quota is reserved.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub cluster_queue: String,
    pub pod_set_assignments: Vec<PodSetAssignment>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSetAssignment {
    pub name: String,
    /// Admitted pod count; lower than the pod-set's spec count under partial
    /// admission.
    pub count: u32,
    pub flavors: BTreeMap<ResourceName, FlavorName>,
    /// Total usage of the pod-set (request per pod times admitted count).
    pub resource_usage: BTreeMap<ResourceName, ResourceAmount>,
}

/// Pods of a pod-set that are no longer running; their quota share is
/// returned without dropping the admission.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimablePods {
    pub name: String,
    pub count: u32,
}

impl Workload {
    /// `namespace/name`, the identity used throughout the engine.
    pub fn key(&self) -> crate::workload::WorkloadKey {
        crate::workload::WorkloadKey::new(&self.namespace, &self.name)
    }

    pub fn priority(&self) -> Priority {
        self.spec.priority
    }

    pub fn has_quota_reserved(&self) -> bool {
        condition_is_true(&self.status.conditions, ConditionType::QuotaReserved)
    }

    pub fn is_finished(&self) -> bool {
        condition_is_true(&self.status.conditions, ConditionType::Finished)
    }

    /// A workload belongs in a pending queue iff it neither holds quota nor
    /// has finished.
    pub fn is_pending(&self) -> bool {
        !self.has_quota_reserved() && !self.is_finished()
    }

    pub fn reclaimable_count(&self, pod_set: &str) -> u32 {
        self.status
            .reclaimable_pods
            .iter()
            .find(|r| r.name == pod_set)
            .map(|r| r.count)
            .unwrap_or(0)
    }
}
