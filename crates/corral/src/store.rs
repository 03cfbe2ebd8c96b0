use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::api::condition::{reasons, set_condition, Condition, ConditionStatus, ConditionType};
use crate::api::{Admission, Workload};
use crate::workload::WorkloadKey;
use crate::Map;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency loss; the operation may be retried.
    #[error("conflicting update")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("status update timed out")]
    Timeout,
    #[error("workload {0} not found")]
    NotFound(WorkloadKey),
}

/// A semantic status mutation of a persisted workload.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// Bind the admission and flip `QuotaReserved`/`Admitted` to true.
    ReserveQuota { admission: Admission },
    /// Drop the admission and mark the workload evicted.
    Evict { reason: String, message: String },
    /// Flip `QuotaReserved` to false with reason `Inadmissible`.
    MarkInadmissible { message: String },
    /// Mark the workload finished.
    Finish,
}

/// Boundary to the external object store. The engine only ever mutates
/// workload status; everything else it reads.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Applies `update` with optimistic concurrency; [`StoreError::Conflict`]
    /// signals a lost update race. Returns the workload after the update.
    async fn update_status(
        &self,
        key: &WorkloadKey,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Workload, StoreError>;

    /// Lists every persisted workload; used to rebuild the cache on restart.
    async fn list_workloads(&self) -> Result<Vec<Workload>, StoreError>;
}

/// Retry schedule for conflicting status updates, with a per-call timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Vec<Duration>,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_millis(2000),
            ],
            timeout: Duration::from_secs(2),
        }
    }
}

/// Runs a status update, retrying conflicts along the backoff schedule.
/// A timeout is not retried; the next scheduler pass reconciles instead.
pub async fn update_with_retry(
    store: &dyn WorkloadStore,
    key: &WorkloadKey,
    update: StatusUpdate,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<Workload, StoreError> {
    let mut attempt = 0;
    loop {
        let result = tokio::time::timeout(
            policy.timeout,
            store.update_status(key, update.clone(), now),
        )
        .await
        .unwrap_or(Err(StoreError::Timeout));
        match result {
            Err(StoreError::Conflict) if attempt < policy.backoff.len() => {
                log::debug!("conflict updating {key}, retrying");
                tokio::time::sleep(policy.backoff[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Applies a [`StatusUpdate`] to a workload object. Store implementations
/// share this so status semantics cannot drift between them.
pub fn apply_status_update(workload: &mut Workload, update: &StatusUpdate, now: DateTime<Utc>) {
    let conditions = &mut workload.status.conditions;
    match update {
        StatusUpdate::ReserveQuota { admission } => {
            let message = format!("Admitted by clusterQueue {}", admission.cluster_queue);
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::QuotaReserved,
                    ConditionStatus::True,
                    reasons::QUOTA_RESERVED,
                    message.clone(),
                    now,
                ),
            );
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::Admitted,
                    ConditionStatus::True,
                    reasons::ADMITTED,
                    message,
                    now,
                ),
            );
            workload.status.admission = Some(admission.clone());
        }
        StatusUpdate::Evict { reason, message } => {
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::Evicted,
                    ConditionStatus::True,
                    reason,
                    message.clone(),
                    now,
                ),
            );
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::QuotaReserved,
                    ConditionStatus::False,
                    reason,
                    message.clone(),
                    now,
                ),
            );
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::Admitted,
                    ConditionStatus::False,
                    reason,
                    message.clone(),
                    now,
                ),
            );
            workload.status.admission = None;
        }
        StatusUpdate::MarkInadmissible { message } => {
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::QuotaReserved,
                    ConditionStatus::False,
                    reasons::INADMISSIBLE,
                    message.clone(),
                    now,
                ),
            );
        }
        StatusUpdate::Finish => {
            set_condition(
                conditions,
                Condition::new(
                    ConditionType::Finished,
                    ConditionStatus::True,
                    reasons::FINISHED,
                    String::new(),
                    now,
                ),
            );
        }
    }
}

/// Store keeping workloads in memory. Backs the tests and any embedded use;
/// supports injecting conflicts to exercise the retry path.
#[derive(Default)]
pub struct InMemoryStore {
    workloads: Mutex<Map<WorkloadKey, Workload>>,
    inject_conflicts: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workload: Workload) {
        self.workloads.lock().insert(workload.key(), workload);
    }

    pub fn get(&self, key: &WorkloadKey) -> Option<Workload> {
        self.workloads.lock().get(key).cloned()
    }

    /// The next `count` status updates fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: u32) {
        self.inject_conflicts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkloadStore for InMemoryStore {
    async fn update_status(
        &self,
        key: &WorkloadKey,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Workload, StoreError> {
        if self
            .inject_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict);
        }
        let mut workloads = self.workloads.lock();
        let workload = workloads
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        apply_status_update(workload, &update, now);
        Ok(workload.clone())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, StoreError> {
        Ok(self.workloads.lock().values().cloned().collect())
    }
}
