pub mod flavorassigner;
pub mod preemption;

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::api::{QueueingStrategy, Workload};
use crate::cache::Cache;
use crate::events::{Event, EventRecorder};
use crate::metrics::CoreMetrics;
use crate::queue::QueueManager;
use crate::scheduler::flavorassigner::{Assignment, AssignmentMode};
use crate::scheduler::preemption::Preemptor;
use crate::store::{update_with_retry, RetryPolicy, StatusUpdate, WorkloadStore};
use crate::workload::{WorkloadInfo, WorkloadKey};
use crate::Set;

/// The one bundle of shared engine state, created at startup and passed
/// explicitly; there are no ambient singletons. External controllers talk to
/// the engine exclusively through the narrow capabilities below.
#[derive(Clone)]
pub struct SchedulerContext {
    pub cache: Arc<Cache>,
    pub queues: Arc<QueueManager>,
    pub store: Arc<dyn WorkloadStore>,
    pub events: Arc<dyn EventRecorder>,
    pub metrics: Option<Arc<CoreMetrics>>,
}

impl SchedulerContext {
    pub fn new(
        cache: Arc<Cache>,
        queues: Arc<QueueManager>,
        store: Arc<dyn WorkloadStore>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        SchedulerContext {
            cache,
            queues,
            store,
            events,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A controller observed a new or updated pending workload.
    pub fn enqueue_workload(&self, workload: Arc<Workload>) {
        self.events.record(Event::WorkloadCreated {
            workload: workload.key(),
        });
        self.queues.update_workload(workload);
    }

    /// Capacity around `cluster_queue` changed; pending work parked as
    /// inadmissible anywhere in its cohort gets another chance.
    pub fn admission_changed(&self, cluster_queue: &str) {
        let peers = self.cache.cohort_peers(cluster_queue);
        self.queues
            .admission_changed(peers.iter().map(String::as_str));
    }

    /// A controller observed a workload finishing; its reservation is
    /// released and peers are re-evaluated.
    pub fn workload_finished(&self, key: &WorkloadKey) {
        self.queues.delete_workload(key);
        if let Some(info) = self.cache.delete_workload(key) {
            if let Some(cq) = &info.cluster_queue {
                self.admission_changed(cq);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lower bound between two passes.
    pub minimum_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            minimum_delay: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub admitted: Vec<WorkloadKey>,
    /// Victims successfully evicted.
    pub preempted: usize,
    /// Workloads parked as inadmissible.
    pub inadmissible: usize,
}

/// One admission decided during a pass, applied to cache and store after it.
struct Decision {
    workload: Arc<Workload>,
    admitted: WorkloadInfo,
    assignment: Assignment,
    victims: Vec<WorkloadInfo>,
}

pub struct Scheduler {
    ctx: SchedulerContext,
    config: SchedulerConfig,
    preemptor: Preemptor,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext, config: SchedulerConfig) -> Self {
        let preemptor = Preemptor::new(
            ctx.store.clone(),
            ctx.events.clone(),
            config.retry.clone(),
        );
        Scheduler {
            ctx,
            config,
            preemptor,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Runs passes until cancelled, woken by queue activity and paced by the
    /// configured minimum delay.
    pub async fn run(&self, cancel: CancellationToken) {
        let wakeup = self.ctx.queues.wakeup();
        let mut last_pass = Instant::now() - self.config.minimum_delay * 2;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = wakeup.notified() => {}
            }
            let since_last = Instant::now() - last_pass;
            if self.config.minimum_delay > since_last {
                sleep(self.config.minimum_delay - since_last).await;
            }
            if cancel.is_cancelled() {
                return;
            }
            let summary = self.schedule_pass(&cancel).await;
            last_pass = Instant::now();
            if !summary.admitted.is_empty() || summary.preempted > 0 {
                log::debug!(
                    "pass admitted {} workload(s), preempted {}",
                    summary.admitted.len(),
                    summary.preempted
                );
            }
        }
    }

    /// One scheduling pass: snapshot, assign per cluster-queue in fairness
    /// order, then apply the recorded decisions to the cache and the store.
    pub async fn schedule_pass(&self, cancel: &CancellationToken) -> PassSummary {
        let mut snapshot = self.ctx.cache.snapshot();
        let now = Utc::now();

        let mut order: Vec<String> = snapshot.cluster_queues.keys().cloned().collect();
        order.sort_by(|a, b| {
            let share_a = snapshot.cluster_queues[a].dominant_usage_share();
            let share_b = snapshot.cluster_queues[b].dominant_usage_share();
            share_a.total_cmp(&share_b).then_with(|| a.cmp(b))
        });

        let mut decisions: Vec<Decision> = Vec::new();
        let mut unmatched: Vec<(String, Arc<Workload>, String)> = Vec::new();
        'queues: for cq_name in &order {
            let strict = snapshot.cluster_queues[cq_name].queueing_strategy
                == QueueingStrategy::StrictFIFO;
            for workload in self.ctx.queues.candidates(cq_name) {
                if cancel.is_cancelled() {
                    break 'queues;
                }
                let info = WorkloadInfo::with_cluster_queue(&workload, cq_name);
                let assignment =
                    flavorassigner::assign(&info, &snapshot.cluster_queues[cq_name], &snapshot);
                match assignment.mode {
                    AssignmentMode::Fit => {
                        let admitted = assignment.admitted_info(&info, cq_name, now);
                        snapshot.add_workload(admitted.clone());
                        decisions.push(Decision {
                            workload,
                            admitted,
                            assignment,
                            victims: Vec::new(),
                        });
                        continue 'queues;
                    }
                    AssignmentMode::Preempt => {
                        let victims = preemption::get_targets(&info, &assignment, &mut snapshot);
                        if victims.is_empty() {
                            log::debug!("workload {} needs preemption, no victims", info.key);
                            unmatched.push((
                                cq_name.clone(),
                                workload,
                                "insufficient quota and no eligible preemption victims"
                                    .to_string(),
                            ));
                        } else {
                            for victim in &victims {
                                snapshot.remove_workload(victim);
                            }
                            let admitted = assignment.admitted_info(&info, cq_name, now);
                            snapshot.add_workload(admitted.clone());
                            decisions.push(Decision {
                                workload,
                                admitted,
                                assignment,
                                victims,
                            });
                            continue 'queues;
                        }
                    }
                    AssignmentMode::NoFit => {
                        unmatched.push((
                            cq_name.clone(),
                            workload,
                            assignment.reasons.join("; "),
                        ));
                    }
                }
                if strict {
                    // Head-of-line blocking: the queue yields for this pass.
                    continue 'queues;
                }
            }
        }

        let mut summary = PassSummary::default();
        let mut changed: Set<String> = Set::default();
        for decision in decisions {
            if cancel.is_cancelled() {
                break;
            }
            self.apply_decision(decision, now, &mut summary, &mut changed)
                .await;
        }
        for (cq_name, workload, message) in unmatched {
            let key = workload.key();
            if let Err(e) = update_with_retry(
                self.ctx.store.as_ref(),
                &key,
                StatusUpdate::MarkInadmissible { message },
                now,
                &self.config.retry,
            )
            .await
            {
                log::warn!("marking {key} inadmissible failed: {e}");
            }
            if snapshot.cluster_queues[&cq_name].queueing_strategy
                == QueueingStrategy::BestEffortFIFO
            {
                self.ctx.queues.move_to_inadmissible(&cq_name, &key);
            }
            summary.inadmissible += 1;
        }
        for cq_name in changed {
            self.ctx.admission_changed(&cq_name);
        }
        self.refresh_metrics();
        summary
    }

    /// Applies one admission: victims first, then the incoming workload. A
    /// preempting admission only commits when every eviction was issued; the
    /// cache stays consistent at every step and anything skipped is retried
    /// by the next pass.
    async fn apply_decision(
        &self,
        decision: Decision,
        now: chrono::DateTime<Utc>,
        summary: &mut PassSummary,
        changed: &mut Set<String>,
    ) {
        let key = decision.workload.key();
        let cq_name = match decision.admitted.cluster_queue.clone() {
            Some(name) => name,
            None => return,
        };
        if !decision.victims.is_empty() {
            let results = self
                .preemptor
                .issue_preemptions(&decision.admitted, &decision.victims, now)
                .await;
            let mut evicted_all = true;
            for (victim, result) in decision.victims.iter().zip(results) {
                match result {
                    Ok(updated) => {
                        summary.preempted += 1;
                        self.ctx.cache.delete_workload(&victim.key);
                        self.ctx.events.record(Event::EvictionAcknowledged {
                            workload: victim.key.clone(),
                        });
                        if let Some(victim_cq) = &victim.cluster_queue {
                            changed.insert(victim_cq.clone());
                        }
                        // Back to pending; it competes again from the heap.
                        self.ctx.queues.add_workload(Arc::new(updated));
                    }
                    Err(_) => evicted_all = false,
                }
            }
            if !evicted_all {
                log::warn!("admission of {key} deferred, evictions incomplete");
                return;
            }
        }

        if let Err(e) = self.ctx.cache.add_workload(decision.admitted.clone()) {
            // Programmer invariant violation; abort the commit, the periodic
            // resync recovers the cache.
            log::error!("commit of {key} failed: {e}");
            return;
        }
        let admission = decision.assignment.to_admission(&cq_name, &decision.admitted);
        match update_with_retry(
            self.ctx.store.as_ref(),
            &key,
            StatusUpdate::ReserveQuota { admission },
            now,
            &self.config.retry,
        )
        .await
        {
            Ok(_) => {
                self.ctx.queues.remove_admitted(&cq_name, &key);
                self.ctx.events.record(Event::Admitted {
                    workload: key.clone(),
                    cluster_queue: cq_name,
                });
                summary.admitted.push(key);
            }
            Err(e) => {
                log::warn!("reserving quota for {key} failed, rolling back: {e}");
                self.ctx.cache.delete_workload(&key);
            }
        }
    }

    fn refresh_metrics(&self) {
        let Some(metrics) = &self.ctx.metrics else {
            return;
        };
        let snapshot = self.ctx.cache.snapshot();
        for (name, cq) in &snapshot.cluster_queues {
            let (active, inadmissible) = self.ctx.queues.pending_counts(name);
            metrics.observe_cluster_queue(cq);
            metrics.observe_pending(name, active, inadmissible);
        }
    }
}
