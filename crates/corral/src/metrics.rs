use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};

use crate::cache::ClusterQueueState;

/// Per-cluster-queue gauges, registered into a caller-supplied registry.
pub struct CoreMetrics {
    admitted_active_workloads: IntGaugeVec,
    pending_workloads: IntGaugeVec,
    resource_nominal_quota: GaugeVec,
    resource_borrowing_limit: GaugeVec,
    resource_usage: GaugeVec,
}

impl CoreMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let admitted_active_workloads = IntGaugeVec::new(
            Opts::new(
                "admitted_active_workloads",
                "Number of admitted workloads currently holding quota, per cluster-queue",
            ),
            &["cluster_queue"],
        )?;
        let pending_workloads = IntGaugeVec::new(
            Opts::new(
                "pending_workloads",
                "Number of pending workloads, per cluster-queue and status",
            ),
            &["cluster_queue", "status"],
        )?;
        let quota_labels = ["cohort", "cluster_queue", "flavor", "resource"];
        let resource_nominal_quota = GaugeVec::new(
            Opts::new("resource_nominal_quota", "Nominal quota in resource units"),
            &quota_labels,
        )?;
        let resource_borrowing_limit = GaugeVec::new(
            Opts::new(
                "resource_borrowing_limit",
                "Borrowing limit in resource units",
            ),
            &quota_labels,
        )?;
        let resource_usage = GaugeVec::new(
            Opts::new(
                "resource_usage",
                "Admitted usage in resource units",
            ),
            &quota_labels,
        )?;
        registry.register(Box::new(admitted_active_workloads.clone()))?;
        registry.register(Box::new(pending_workloads.clone()))?;
        registry.register(Box::new(resource_nominal_quota.clone()))?;
        registry.register(Box::new(resource_borrowing_limit.clone()))?;
        registry.register(Box::new(resource_usage.clone()))?;
        Ok(CoreMetrics {
            admitted_active_workloads,
            pending_workloads,
            resource_nominal_quota,
            resource_borrowing_limit,
            resource_usage,
        })
    }

    /// Publishes quota, usage and admitted-count gauges of one cluster-queue.
    pub fn observe_cluster_queue(&self, cq: &ClusterQueueState) {
        let cohort = cq.cohort.as_deref().unwrap_or("");
        self.admitted_active_workloads
            .with_label_values(&[cq.name.as_str()])
            .set(cq.workloads.len() as i64);
        for group in &cq.resource_groups {
            for flavor_quotas in &group.flavors {
                for quota in &flavor_quotas.resources {
                    let labels = [
                        cohort,
                        cq.name.as_str(),
                        flavor_quotas.name.as_str(),
                        quota.name.as_str(),
                    ];
                    self.resource_nominal_quota
                        .with_label_values(&labels)
                        .set(quota.nominal_quota.as_f64());
                    self.resource_borrowing_limit
                        .with_label_values(&labels)
                        .set(quota.borrowing_limit.unwrap_or_default().as_f64());
                    self.resource_usage
                        .with_label_values(&labels)
                        .set(cq.usage_of(&flavor_quotas.name, &quota.name).as_f64());
                }
            }
        }
    }

    pub fn observe_pending(&self, cluster_queue: &str, active: usize, inadmissible: usize) {
        self.pending_workloads
            .with_label_values(&[cluster_queue, "active"])
            .set(active as i64);
        self.pending_workloads
            .with_label_values(&[cluster_queue, "inadmissible"])
            .set(inadmissible as i64);
    }

    /// Drops the gauges of a deleted cluster-queue.
    pub fn forget_cluster_queue(&self, cluster_queue: &str) {
        let _ = self
            .admitted_active_workloads
            .remove_label_values(&[cluster_queue]);
        for status in ["active", "inadmissible"] {
            let _ = self
                .pending_workloads
                .remove_label_values(&[cluster_queue, status]);
        }
    }
}
