//! The persisted object model.
//!
//! Field names stay wire-compatible with the `kueue.x-k8s.io/v1beta1` schema
//! so that objects round-trip through the external store unchanged.

pub mod cluster_queue;
pub mod condition;
pub mod flavor;
pub mod local_queue;
pub mod workload;

pub use cluster_queue::{
    ClusterQueue, FlavorQuotas, PreemptionPolicy, PreemptionRule, QueueingStrategy, ResourceGroup,
    ResourceQuota,
};
pub use condition::{Condition, ConditionStatus, ConditionType};
pub use flavor::{ResourceFlavor, Taint, TaintEffect, Toleration, TolerationOperator};
pub use local_queue::LocalQueue;
pub use workload::{
    Admission, PodSet, PodSetAssignment, PodTemplate, ReclaimablePods, Workload, WorkloadSpec,
    WorkloadStatus,
};

pub const API_GROUP: &str = "kueue.x-k8s.io";
pub const API_VERSION: &str = "v1beta1";

/// Label carrying the local queue a job submits to.
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";
/// Deprecated annotation form of [`QUEUE_NAME_LABEL`], same semantics.
pub const QUEUE_NAME_ANNOTATION: &str = "kueue.x-k8s.io/queue-name";
/// Child jobs carrying this annotation share the parent's admission.
pub const PARENT_WORKLOAD_ANNOTATION: &str = "kueue.x-k8s.io/parent-workload";
/// Enables partial admission for a job, giving the minimum parallelism.
pub const JOB_MIN_PARALLELISM_ANNOTATION: &str = "kueue.x-k8s.io/job-min-parallelism";
