use crate::api::ResourceFlavor;
use crate::cache::cluster_queue::ClusterQueueState;
use crate::resources::quantities::{add_all, sub_all};
use crate::resources::{FlavorName, FlavorResourceQuantities};
use crate::workload::{WorkloadInfo, WorkloadKey};
use crate::Map;

/// A consistent copy of the cache taken for one scheduling pass.
///
/// The pass mutates the snapshot freely (tentative admissions, simulated
/// victim removal); the cache is only changed by the distinct commit step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Active cluster-queues only; inactive ones are invisible to a pass.
    pub cluster_queues: Map<String, ClusterQueueState>,
    pub cohorts: Map<String, CohortSnapshot>,
    pub flavors: Map<FlavorName, ResourceFlavor>,
}

/// Totals of a cohort, computed by iterating its members when the snapshot
/// is taken. Never maintained incrementally in the cache, so it cannot drift.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CohortSnapshot {
    pub name: String,
    pub members: Vec<String>,
    /// Sum of the members' nominal quotas per (flavor, resource).
    pub requestable: FlavorResourceQuantities,
    /// Sum of the members' usage per (flavor, resource).
    pub usage: FlavorResourceQuantities,
}

impl Snapshot {
    /// Removes an admitted workload, returning its quota to the owning
    /// cluster-queue and cohort. Returns false for an unknown workload.
    pub fn remove_workload(&mut self, info: &WorkloadInfo) -> bool {
        let Some(cq_name) = info.cluster_queue.as_deref() else {
            return false;
        };
        let Some(cq) = self.cluster_queues.get_mut(cq_name) else {
            return false;
        };
        if cq.remove_workload(&info.key).is_none() {
            return false;
        }
        if let Some(cohort) = cq.cohort.clone() {
            if let Some(cohort) = self.cohorts.get_mut(&cohort) {
                sub_all(&mut cohort.usage, &info.total_requests());
            }
        }
        true
    }

    /// Adds an admitted workload to its cluster-queue, charging the queue and
    /// cohort usage.
    pub fn add_workload(&mut self, info: WorkloadInfo) {
        let Some(cq_name) = info.cluster_queue.clone() else {
            log::error!("adding workload {} without a cluster-queue", info.key);
            return;
        };
        let Some(cq) = self.cluster_queues.get_mut(&cq_name) else {
            log::error!("adding workload {} to unknown cluster-queue {cq_name}", info.key);
            return;
        };
        if let Some(cohort) = cq.cohort.clone() {
            if let Some(cohort) = self.cohorts.get_mut(&cohort) {
                add_all(&mut cohort.usage, &info.total_requests());
            }
        }
        cq.add_workload(info);
    }

    pub fn find_workload(&self, cq: &str, key: &WorkloadKey) -> Option<&WorkloadInfo> {
        self.cluster_queues.get(cq)?.workloads.get(key)
    }

    pub fn cohort_of(&self, cq: &str) -> Option<&CohortSnapshot> {
        let cohort = self.cluster_queues.get(cq)?.cohort.as_deref()?;
        self.cohorts.get(cohort)
    }
}
