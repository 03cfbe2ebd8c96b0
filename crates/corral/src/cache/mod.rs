pub mod cluster_queue;
pub mod snapshot;

pub use cluster_queue::ClusterQueueState;
pub use snapshot::{CohortSnapshot, Snapshot};

use parking_lot::RwLock;

use crate::api::{ClusterQueue, ResourceFlavor, Workload};
use crate::common::error::error;
use crate::resources::quantities::add_all;
use crate::resources::{FlavorName, FlavorResourceQuantities};
use crate::workload::{WorkloadInfo, WorkloadKey};
use crate::{Map, Set};

/// The authoritative in-memory view of cluster-queues, cohorts, flavors and
/// admitted workloads.
///
/// All methods are callable from concurrent controller workers; a single
/// read-write lock protects the state. Snapshots are taken under the read
/// lock and are owned by the caller afterwards.
pub struct Cache {
    state: RwLock<CacheState>,
}

#[derive(Default)]
struct CacheState {
    flavors: Map<FlavorName, ResourceFlavor>,
    cluster_queues: Map<String, ClusterQueueState>,
    /// Cohort membership index. Cluster-queues only store their cohort name;
    /// the cohort owns the member set.
    cohorts: Map<String, Set<String>>,
    /// Where each admitted workload lives.
    workloads: Map<WorkloadKey, String>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn add_or_update_flavor(&self, flavor: ResourceFlavor) {
        let mut state = self.state.write();
        state.flavors.insert(flavor.name.clone(), flavor);
        state.refresh_cluster_queues();
    }

    pub fn delete_flavor(&self, name: &str) {
        let mut state = self.state.write();
        if state.flavors.remove(name).is_some() {
            // Dependent queues turn inactive until the flavor reappears.
            state.refresh_cluster_queues();
        }
    }

    pub fn add_cluster_queue(&self, spec: &ClusterQueue) -> crate::Result<()> {
        let mut state = self.state.write();
        if state.cluster_queues.contains_key(&spec.name) {
            return error(format!("cluster-queue {} already exists", spec.name));
        }
        let cq = ClusterQueueState::new(spec, &state.flavors);
        if let Some(reason) = &cq.inactive_reason {
            log::info!("cluster-queue {} added inactive: {reason}", spec.name);
        }
        if let Some(cohort) = &spec.cohort {
            state
                .cohorts
                .entry(cohort.clone())
                .or_default()
                .insert(spec.name.clone());
        }
        state.cluster_queues.insert(spec.name.clone(), cq);
        Ok(())
    }

    pub fn update_cluster_queue(&self, spec: &ClusterQueue) -> crate::Result<()> {
        let mut state = self.state.write();
        let Some(old_cohort) = state
            .cluster_queues
            .get(&spec.name)
            .map(|cq| cq.cohort.clone())
        else {
            return error(format!("cluster-queue {} not found", spec.name));
        };
        if old_cohort != spec.cohort {
            state.unlink_cohort(&spec.name, old_cohort.as_deref());
            if let Some(cohort) = &spec.cohort {
                state
                    .cohorts
                    .entry(cohort.clone())
                    .or_default()
                    .insert(spec.name.clone());
            }
        }
        let flavors = std::mem::take(&mut state.flavors);
        state
            .cluster_queues
            .get_mut(&spec.name)
            .unwrap()
            .update_spec(spec, &flavors);
        state.flavors = flavors;
        Ok(())
    }

    pub fn delete_cluster_queue(&self, name: &str) {
        let mut state = self.state.write();
        if let Some(cq) = state.cluster_queues.remove(name) {
            state.unlink_cohort(name, cq.cohort.as_deref());
            state.workloads.retain(|_, owner| owner != name);
        }
    }

    /// Records the quota contribution of an admitted workload. Admitting a
    /// workload that is already accounted is a programmer invariant
    /// violation and fails.
    pub fn add_workload(&self, info: WorkloadInfo) -> crate::Result<()> {
        let mut state = self.state.write();
        if state.workloads.contains_key(&info.key) {
            return error(format!("workload {} is already admitted", info.key));
        }
        state.add_locked(info)
    }

    /// Replaces an admitted workload's contribution in one step, e.g. after a
    /// reclaimable-pods update.
    pub fn update_workload(&self, info: WorkloadInfo) -> crate::Result<()> {
        let mut state = self.state.write();
        if let Some(cq_name) = state.workloads.remove(&info.key) {
            if let Some(cq) = state.cluster_queues.get_mut(&cq_name) {
                cq.remove_workload(&info.key);
            }
        }
        state.add_locked(info)
    }

    pub fn delete_workload(&self, key: &WorkloadKey) -> Option<WorkloadInfo> {
        let mut state = self.state.write();
        let cq_name = state.workloads.remove(key)?;
        state
            .cluster_queues
            .get_mut(&cq_name)
            .and_then(|cq| cq.remove_workload(key))
    }

    pub fn is_active(&self, cq: &str) -> bool {
        self.state
            .read()
            .cluster_queues
            .get(cq)
            .is_some_and(|cq| cq.is_active())
    }

    pub fn inactive_reason(&self, cq: &str) -> Option<String> {
        self.state
            .read()
            .cluster_queues
            .get(cq)
            .and_then(|cq| cq.inactive_reason.clone())
    }

    /// The cluster-queues sharing a cohort with `cq`, including `cq` itself.
    pub fn cohort_peers(&self, cq: &str) -> Vec<String> {
        let state = self.state.read();
        let Some(queue) = state.cluster_queues.get(cq) else {
            return Vec::new();
        };
        match queue.cohort.as_ref().and_then(|c| state.cohorts.get(c)) {
            Some(members) => {
                let mut peers: Vec<String> = members.iter().cloned().collect();
                peers.sort();
                peers
            }
            None => vec![cq.to_string()],
        }
    }

    /// Copies everything a scheduling pass reads. Inactive cluster-queues are
    /// omitted; cohort totals are recomputed from the active members.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let mut snapshot = Snapshot {
            flavors: state.flavors.clone(),
            ..Default::default()
        };
        for (name, cq) in &state.cluster_queues {
            if !cq.is_active() {
                continue;
            }
            if let Some(cohort_name) = &cq.cohort {
                let cohort = snapshot
                    .cohorts
                    .entry(cohort_name.clone())
                    .or_insert_with(|| CohortSnapshot {
                        name: cohort_name.clone(),
                        ..Default::default()
                    });
                cohort.members.push(name.clone());
                for group in &cq.resource_groups {
                    for flavor_quotas in &group.flavors {
                        for quota in &flavor_quotas.resources {
                            crate::resources::quantities::add_quantity(
                                &mut cohort.requestable,
                                &flavor_quotas.name,
                                &quota.name,
                                quota.nominal_quota,
                            );
                        }
                    }
                }
                add_all(&mut cohort.usage, &cq.usage);
            }
            snapshot.cluster_queues.insert(name.clone(), cq.clone());
        }
        for cohort in snapshot.cohorts.values_mut() {
            cohort.members.sort();
        }
        snapshot
    }

    /// Rebuilds the admitted-workload accounting from a listing of persisted
    /// workloads, replaying their admissions. Used after process restart; no
    /// scheduler state survives outside the store.
    pub fn rebuild<I: IntoIterator<Item = Workload>>(&self, workloads: I) {
        {
            let mut state = self.state.write();
            state.workloads.clear();
            for cq in state.cluster_queues.values_mut() {
                cq.workloads.clear();
            }
            state.refresh_cluster_queues();
        }
        let mut replayed = 0usize;
        for workload in workloads {
            if workload.status.admission.is_none() || workload.is_finished() {
                continue;
            }
            match self.add_workload(WorkloadInfo::new(&workload)) {
                Ok(()) => replayed += 1,
                Err(e) => log::error!("replaying admission of {}: {e}", workload.key()),
            }
        }
        log::info!("cache rebuilt, {replayed} admissions replayed");
    }

    pub fn cluster_queue_usage(&self, name: &str) -> Option<FlavorResourceQuantities> {
        self.state
            .read()
            .cluster_queues
            .get(name)
            .map(|cq| cq.usage.clone())
    }

    pub fn admitted_workload_count(&self, name: &str) -> Option<usize> {
        self.state
            .read()
            .cluster_queues
            .get(name)
            .map(|cq| cq.workloads.len())
    }
}

impl CacheState {
    fn add_locked(&mut self, info: WorkloadInfo) -> crate::Result<()> {
        let Some(cq_name) = info.cluster_queue.clone() else {
            return error(format!("workload {} has no cluster-queue", info.key));
        };
        let Some(cq) = self.cluster_queues.get_mut(&cq_name) else {
            return error(format!(
                "workload {} targets unknown cluster-queue {cq_name}",
                info.key
            ));
        };
        self.workloads.insert(info.key.clone(), cq_name);
        cq.add_workload(info);
        Ok(())
    }

    fn refresh_cluster_queues(&mut self) {
        let flavors = std::mem::take(&mut self.flavors);
        for cq in self.cluster_queues.values_mut() {
            cq.refresh(&flavors);
        }
        self.flavors = flavors;
    }

    fn unlink_cohort(&mut self, cq: &str, cohort: Option<&str>) {
        if let Some(cohort) = cohort {
            if let Some(members) = self.cohorts.get_mut(cohort) {
                members.remove(cq);
                if members.is_empty() {
                    self.cohorts.remove(cohort);
                }
            }
        }
    }
}
