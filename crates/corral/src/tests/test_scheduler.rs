use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::condition::{condition_is_true, find_condition, ConditionType};
use crate::api::{ClusterQueue, PreemptionRule, QueueingStrategy, ResourceFlavor, Workload};
use crate::cache::Cache;
use crate::events::{CollectingRecorder, Event};
use crate::queue::QueueManager;
use crate::resources::quantities::quantity_of;
use crate::resources::ResourceAmount;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerContext};
use crate::store::{InMemoryStore, RetryPolicy, WorkloadStore};
use crate::tests::utils::*;

struct TestEngine {
    cache: Arc<Cache>,
    queues: Arc<QueueManager>,
    store: Arc<InMemoryStore>,
    events: Arc<CollectingRecorder>,
    scheduler: Scheduler,
}

fn engine(flavors: &[ResourceFlavor], cqs: &[ClusterQueue], admitted: &[Workload]) -> TestEngine {
    let cache = Arc::new(build_cache(flavors, cqs, admitted));
    let queues = Arc::new(build_queues(cqs));
    let store = Arc::new(InMemoryStore::new());
    for workload in admitted {
        store.insert(workload.clone());
    }
    let events = Arc::new(CollectingRecorder::new());
    let ctx = SchedulerContext::new(
        cache.clone(),
        queues.clone(),
        store.clone(),
        events.clone(),
    );
    let config = SchedulerConfig {
        minimum_delay: Duration::from_millis(1),
        retry: RetryPolicy {
            backoff: vec![Duration::ZERO, Duration::ZERO, Duration::ZERO],
            timeout: Duration::from_secs(1),
        },
    };
    TestEngine {
        cache,
        queues,
        store,
        events,
        scheduler: Scheduler::new(ctx, config),
    }
}

impl TestEngine {
    fn enqueue(&self, workload: Workload) {
        self.store.insert(workload.clone());
        self.scheduler
            .context()
            .enqueue_workload(Arc::new(workload));
    }

    async fn pass(&self) -> crate::scheduler::PassSummary {
        self.scheduler
            .schedule_pass(&CancellationToken::new())
            .await
    }

    fn cpu_usage(&self, cq: &str) -> ResourceAmount {
        quantity_of(
            &self.cache.cluster_queue_usage(cq).unwrap(),
            "default",
            "cpu",
        )
    }
}

fn single_queue(nominal_cpu: &str, strategy: QueueingStrategy) -> Vec<ClusterQueue> {
    vec![cluster_queue("main")
        .strategy(strategy)
        .preempt_within(PreemptionRule::LowerPriority)
        .resource_group(vec![quotas("default").resource("cpu", nominal_cpu).build()])
        .build()]
}

#[tokio::test]
async fn admits_a_fitting_workload() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    engine.enqueue(workload("wl", "").queue("main").request("cpu", "2").build());

    let summary = engine.pass().await;

    assert_eq!(summary.admitted.len(), 1);
    assert_eq!(engine.cpu_usage("main"), amount("2"));
    let stored = engine.store.get(&workload("wl", "").build().key()).unwrap();
    assert!(stored.has_quota_reserved());
    assert!(condition_is_true(
        &stored.status.conditions,
        ConditionType::Admitted
    ));
    let admission = stored.status.admission.unwrap();
    assert_eq!(admission.cluster_queue, "main");
    assert_eq!(admission.pod_set_assignments[0].flavors["cpu"], "default");
    assert_eq!(engine.queues.pending_counts("main"), (0, 0));
    assert!(engine
        .events
        .recorded()
        .iter()
        .any(|e| matches!(e, Event::Admitted { cluster_queue, .. } if cluster_queue == "main")));
}

#[tokio::test]
async fn higher_priority_is_admitted_first() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("2", QueueingStrategy::StrictFIFO),
        &[],
    );
    engine.enqueue(
        workload("low", "")
            .queue("main")
            .created(at_secs(0))
            .request("cpu", "2")
            .build(),
    );
    engine.enqueue(
        workload("high", "")
            .queue("main")
            .priority(1)
            .created(at_secs(10))
            .request("cpu", "2")
            .build(),
    );

    let summary = engine.pass().await;

    assert_eq!(
        summary.admitted,
        vec![workload("high", "").build().key()]
    );
    // The lower-priority workload stays pending at the head.
    assert_eq!(engine.queues.pending_counts("main"), (1, 0));
}

#[tokio::test]
async fn preempts_and_admits_in_one_pass() {
    let admitted = vec![
        workload("low", "")
            .queue("main")
            .priority(-1)
            .request("cpu", "2")
            .admit("main", &[("cpu", "default")])
            .build(),
        workload("mid", "")
            .queue("main")
            .request("cpu", "2")
            .admit("main", &[("cpu", "default")])
            .build(),
        workload("high", "")
            .queue("main")
            .priority(1)
            .request("cpu", "2")
            .admit("main", &[("cpu", "default")])
            .build(),
    ];
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &admitted,
    );
    engine.enqueue(
        workload("in", "")
            .queue("main")
            .priority(1)
            .request("cpu", "2")
            .build(),
    );

    let summary = engine.pass().await;

    assert_eq!(summary.preempted, 1);
    assert_eq!(summary.admitted, vec![workload("in", "").build().key()]);
    assert_eq!(engine.cpu_usage("main"), amount("6"));
    assert_eq!(engine.cache.admitted_workload_count("main"), Some(3));

    let low = engine.store.get(&workload("low", "").build().key()).unwrap();
    assert!(condition_is_true(&low.status.conditions, ConditionType::Evicted));
    assert_eq!(
        find_condition(&low.status.conditions, ConditionType::Evicted)
            .unwrap()
            .message,
        "Preempted to accommodate /in"
    );
    assert!(low.status.admission.is_none());
    // The victim is pending again.
    assert_eq!(engine.queues.pending_counts("main"), (1, 0));
    assert!(engine
        .events
        .recorded()
        .iter()
        .any(|e| matches!(e, Event::Preempted { .. })));
}

#[tokio::test]
async fn partial_admission_records_the_reduced_count() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    let key = workload("batch", "").build().key();
    engine.enqueue(
        workload("batch", "")
            .queue("main")
            .pod_sets(vec![pod_set("workers", 5)
                .min_count(1)
                .request("cpu", "2")
                .build()])
            .build(),
    );

    let summary = engine.pass().await;

    assert_eq!(summary.admitted.len(), 1);
    let stored = engine.store.get(&key).unwrap();
    let assignment = &stored.status.admission.as_ref().unwrap().pod_set_assignments[0];
    assert_eq!(assignment.count, 3);
    assert_eq!(assignment.resource_usage["cpu"], amount("6"));
    // The spec keeps the full parallelism for when the admission is removed.
    assert_eq!(stored.spec.pod_sets[0].count, 5);
    assert_eq!(engine.cpu_usage("main"), amount("6"));

    engine.scheduler.context().workload_finished(&key);
    assert_eq!(engine.cpu_usage("main"), ResourceAmount::ZERO);
}

#[tokio::test]
async fn best_effort_fifo_skips_a_blocked_head() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    engine.enqueue(
        workload("huge", "")
            .queue("main")
            .priority(1)
            .request("cpu", "100")
            .build(),
    );
    engine.enqueue(workload("small", "").queue("main").request("cpu", "2").build());

    let summary = engine.pass().await;

    assert_eq!(
        summary.admitted,
        vec![workload("small", "").build().key()]
    );
    assert_eq!(summary.inadmissible, 1);
    // The blocked head rests in the inadmissible set with the reason on its
    // status.
    assert_eq!(engine.queues.pending_counts("main"), (0, 1));
    let huge = engine.store.get(&workload("huge", "").build().key()).unwrap();
    let reserved = find_condition(&huge.status.conditions, ConditionType::QuotaReserved).unwrap();
    assert!(!reserved.is_true());
    assert_eq!(reserved.reason, "Inadmissible");
}

#[tokio::test]
async fn strict_fifo_blocks_behind_the_head() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::StrictFIFO),
        &[],
    );
    engine.enqueue(
        workload("huge", "")
            .queue("main")
            .priority(1)
            .request("cpu", "100")
            .build(),
    );
    engine.enqueue(workload("small", "").queue("main").request("cpu", "2").build());

    let summary = engine.pass().await;

    assert!(summary.admitted.is_empty());
    // Head-of-line blocking keeps both workloads pending.
    assert_eq!(engine.queues.pending_counts("main"), (2, 0));
}

#[tokio::test]
async fn inadmissible_workloads_reenter_after_capacity_frees_up() {
    let admitted = vec![workload("busy", "")
        .queue("main")
        .priority(1)
        .request("cpu", "6")
        .admit("main", &[("cpu", "default")])
        .build()];
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &admitted,
    );
    let key = workload("waiting", "").build().key();
    engine.enqueue(workload("waiting", "").queue("main").request("cpu", "2").build());

    let summary = engine.pass().await;
    assert!(summary.admitted.is_empty());
    assert_eq!(engine.queues.pending_counts("main"), (0, 1));

    // The running workload finishes; the parked workload gets another chance.
    engine
        .scheduler
        .context()
        .workload_finished(&workload("busy", "").build().key());
    assert_eq!(engine.queues.pending_counts("main"), (1, 0));

    let summary = engine.pass().await;
    assert_eq!(summary.admitted, vec![key]);
}

#[tokio::test]
async fn conflicting_status_updates_are_retried() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    engine.enqueue(workload("wl", "").queue("main").request("cpu", "2").build());
    engine.store.inject_conflicts(2);

    let summary = engine.pass().await;

    assert_eq!(summary.admitted.len(), 1);
    assert!(engine
        .store
        .get(&workload("wl", "").build().key())
        .unwrap()
        .has_quota_reserved());
}

#[tokio::test]
async fn failed_admission_commit_rolls_the_cache_back() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    engine.enqueue(workload("wl", "").queue("main").request("cpu", "2").build());
    // More conflicts than one retry schedule absorbs.
    engine.store.inject_conflicts(5);

    let summary = engine.pass().await;

    assert!(summary.admitted.is_empty());
    assert_eq!(engine.cpu_usage("main"), ResourceAmount::ZERO);
    // Still pending; the next pass retries.
    assert_eq!(engine.queues.pending_counts("main"), (1, 0));
    let summary = engine.pass().await;
    assert_eq!(summary.admitted.len(), 1);
    assert_eq!(engine.cpu_usage("main"), amount("2"));
}

#[tokio::test]
async fn scheduler_loop_admits_until_cancelled() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    let engine = Arc::new(engine);
    let cancel = CancellationToken::new();
    let looped = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.scheduler.run(cancel).await })
    };

    engine.enqueue(workload("wl", "").queue("main").request("cpu", "2").build());
    let key = workload("wl", "").build().key();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if engine
            .store
            .get(&key)
            .is_some_and(|wl| wl.has_quota_reserved())
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "admission timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    looped.await.unwrap();
}

#[tokio::test]
async fn reclaim_from_borrower_end_to_end() {
    let cqs = vec![
        cluster_queue("c1")
            .cohort("cohort")
            .preempt_within(PreemptionRule::LowerPriority)
            .reclaim_within_cohort(PreemptionRule::LowerPriority)
            .resource_group(vec![quotas("default")
                .resource_with_limit("cpu", "6", "6")
                .build()])
            .build(),
        cluster_queue("c2")
            .cohort("cohort")
            .reclaim_within_cohort(PreemptionRule::Any)
            .resource_group(vec![quotas("default")
                .resource_with_limit("cpu", "6", "6")
                .build()])
            .build(),
    ];
    let admitted = vec![
        workload("c1-low", "")
            .queue("c1")
            .priority(-1)
            .request("cpu", "3")
            .admit("c1", &[("cpu", "default")])
            .build(),
        workload("c2-mid", "")
            .queue("c2")
            .request("cpu", "3")
            .admit("c2", &[("cpu", "default")])
            .build(),
        workload("c2-high", "")
            .queue("c2")
            .priority(1)
            .request("cpu", "6")
            .admit("c2", &[("cpu", "default")])
            .build(),
    ];
    let engine = engine(&[flavor("default")], &cqs, &admitted);
    engine.enqueue(
        workload("in", "")
            .queue("c1")
            .priority(1)
            .request("cpu", "3")
            .build(),
    );

    let summary = engine.pass().await;

    assert_eq!(summary.admitted, vec![workload("in", "").build().key()]);
    assert_eq!(summary.preempted, 1);
    // The borrower in the cohort was evicted, not the local low-priority one.
    let evicted = engine.store.get(&workload("c2-mid", "").build().key()).unwrap();
    assert!(condition_is_true(&evicted.status.conditions, ConditionType::Evicted));
    assert_eq!(engine.cpu_usage("c1"), amount("6"));
    assert_eq!(engine.cpu_usage("c2"), amount("6"));
}

#[tokio::test]
async fn cache_rebuild_matches_the_store_after_restart() {
    let engine = engine(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    engine.enqueue(workload("wl", "").queue("main").request("cpu", "4").build());
    engine.pass().await;
    let usage_before = engine.cpu_usage("main");

    // A fresh cache fed from the store converges to the same accounting.
    let rebuilt = build_cache(
        &[flavor("default")],
        &single_queue("6", QueueingStrategy::BestEffortFIFO),
        &[],
    );
    rebuilt.rebuild(engine.store.list_workloads().await.unwrap());
    assert_eq!(
        quantity_of(&rebuilt.cluster_queue_usage("main").unwrap(), "default", "cpu"),
        usage_before
    );
}
