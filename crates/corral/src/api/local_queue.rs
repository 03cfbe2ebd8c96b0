use serde::{Deserialize, Serialize};

/// Namespaced pointer to a cluster-queue. Workloads name a local queue; the
/// admission engine resolves it to the cluster-queue behind it.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueue {
    pub namespace: String,
    pub name: String,
    pub cluster_queue: String,
}

impl LocalQueue {
    pub fn new(namespace: &str, name: &str, cluster_queue: &str) -> Self {
        LocalQueue {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cluster_queue: cluster_queue.to_string(),
        }
    }
}
