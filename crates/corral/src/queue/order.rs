use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::api::Workload;
use crate::workload::WorkloadKey;
use crate::Priority;

/// Heap priority of a pending workload: higher priority first, then earlier
/// creation, then name. The greatest value is the head of the queue.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueueOrder {
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub key: WorkloadKey,
}

impl QueueOrder {
    pub fn of(workload: &Workload) -> Self {
        QueueOrder {
            priority: workload.priority(),
            created: workload.creation_timestamp,
            key: workload.key(),
        }
    }
}

impl Ord for QueueOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for QueueOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
