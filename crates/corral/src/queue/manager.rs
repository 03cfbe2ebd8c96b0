use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::api::{LocalQueue, QueueingStrategy, Workload};
use crate::queue::order::QueueOrder;
use crate::workload::WorkloadKey;
use crate::Map;

/// Groups pending workloads by their target cluster-queue, each in a
/// priority-ordered heap. Thread-safe behind a single mutex; heap operations
/// are O(log n).
pub struct QueueManager {
    state: Mutex<ManagerState>,
    /// Woken whenever new work may be admissible; the scheduler loop waits
    /// on this.
    wakeup: Arc<Notify>,
}

#[derive(Default)]
struct ManagerState {
    cluster_queues: Map<String, QueuedClusterQueue>,
    /// `namespace/queueName` -> cluster-queue.
    local_queues: Map<String, String>,
    /// Workloads whose local queue does not resolve yet, keyed by
    /// `namespace/queueName`. Re-examined when a matching queue appears.
    unresolved: Map<String, Map<WorkloadKey, Arc<Workload>>>,
}

struct QueuedClusterQueue {
    strategy: QueueingStrategy,
    heap: PriorityQueue<WorkloadKey, QueueOrder>,
    items: Map<WorkloadKey, Arc<Workload>>,
    /// Workloads that could not be admitted until cluster state changes.
    inadmissible: Map<WorkloadKey, Arc<Workload>>,
}

impl QueuedClusterQueue {
    fn new(strategy: QueueingStrategy) -> Self {
        QueuedClusterQueue {
            strategy,
            heap: PriorityQueue::new(),
            items: Map::default(),
            inadmissible: Map::default(),
        }
    }

    fn push(&mut self, workload: Arc<Workload>) {
        let key = workload.key();
        self.heap.push(key.clone(), QueueOrder::of(&workload));
        self.items.insert(key, workload);
    }

    fn remove(&mut self, key: &WorkloadKey) -> Option<Arc<Workload>> {
        self.heap.remove(key);
        self.items
            .remove(key)
            .or_else(|| self.inadmissible.remove(key))
    }

    fn requeue_inadmissible(&mut self) -> usize {
        let requeued = self.inadmissible.len();
        for (key, workload) in std::mem::take(&mut self.inadmissible) {
            self.heap.push(key.clone(), QueueOrder::of(&workload));
            self.items.insert(key, workload);
        }
        requeued
    }

    fn drain(&mut self) -> impl Iterator<Item = Arc<Workload>> {
        self.heap.clear();
        let items = std::mem::take(&mut self.items);
        let inadmissible = std::mem::take(&mut self.inadmissible);
        items.into_values().chain(inadmissible.into_values())
    }
}

fn local_queue_key(namespace: &str, queue_name: &str) -> String {
    format!("{namespace}/{queue_name}")
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        QueueManager {
            state: Mutex::new(ManagerState::default()),
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// The notifier the scheduler loop blocks on.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    pub fn add_cluster_queue(&self, name: &str, strategy: QueueingStrategy) {
        let mut state = self.state.lock();
        state
            .cluster_queues
            .entry(name.to_string())
            .or_insert_with(|| QueuedClusterQueue::new(strategy))
            .strategy = strategy;
        // Workloads may have been waiting for this queue through an already
        // registered local queue.
        let routable: Vec<String> = state
            .local_queues
            .iter()
            .filter(|(_, cq)| cq.as_str() == name)
            .map(|(lq, _)| lq.clone())
            .collect();
        for lq in routable {
            state.resolve_pending(&lq);
        }
        self.wakeup.notify_one();
    }

    /// Removes the heap; its workloads return to the unresolved side-set so a
    /// re-created queue picks them up again.
    pub fn delete_cluster_queue(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(mut queue) = state.cluster_queues.remove(name) else {
            return;
        };
        for workload in queue.drain() {
            state.hold_unresolved(workload);
        }
    }

    pub fn add_local_queue(&self, local_queue: &LocalQueue) {
        let mut state = self.state.lock();
        let key = local_queue_key(&local_queue.namespace, &local_queue.name);
        state
            .local_queues
            .insert(key.clone(), local_queue.cluster_queue.clone());
        state.resolve_pending(&key);
        self.wakeup.notify_one();
    }

    /// Re-points a local queue; its pending workloads move to the new
    /// cluster-queue's heap.
    pub fn update_local_queue(&self, local_queue: &LocalQueue) {
        let mut state = self.state.lock();
        let key = local_queue_key(&local_queue.namespace, &local_queue.name);
        let moved: Vec<Arc<Workload>> = state
            .cluster_queues
            .values_mut()
            .flat_map(|cq| {
                let keys: Vec<WorkloadKey> = cq
                    .items
                    .values()
                    .chain(cq.inadmissible.values())
                    .filter(|wl| local_queue_key(&wl.namespace, &wl.spec.queue_name) == key)
                    .map(|wl| wl.key())
                    .collect();
                keys.into_iter()
                    .filter_map(|k| cq.remove(&k))
                    .collect::<Vec<_>>()
            })
            .collect();
        state
            .local_queues
            .insert(key.clone(), local_queue.cluster_queue.clone());
        for workload in moved {
            state.route(workload);
        }
        state.resolve_pending(&key);
        self.wakeup.notify_one();
    }

    pub fn delete_local_queue(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        state.local_queues.remove(&local_queue_key(namespace, name));
    }

    /// Enqueues a pending workload, routing `(namespace, queueName)` through
    /// the local queues. Returns false when the workload is held aside
    /// because the route does not resolve.
    pub fn add_workload(&self, workload: Arc<Workload>) -> bool {
        if !workload.is_pending() {
            return false;
        }
        let routed = {
            let mut state = self.state.lock();
            state.route(workload)
        };
        if routed {
            self.wakeup.notify_one();
        }
        routed
    }

    pub fn update_workload(&self, workload: Arc<Workload>) -> bool {
        self.delete_workload(&workload.key());
        self.add_workload(workload)
    }

    pub fn delete_workload(&self, key: &WorkloadKey) -> bool {
        let mut state = self.state.lock();
        for queue in state.cluster_queues.values_mut() {
            if queue.remove(key).is_some() {
                return true;
            }
        }
        for held in state.unresolved.values_mut() {
            if held.remove(key).is_some() {
                return true;
            }
        }
        false
    }

    /// The admission candidates of a cluster-queue for one pass: the head
    /// under StrictFIFO, every pending workload in heap order under
    /// BestEffortFIFO.
    pub fn candidates(&self, cq: &str) -> Vec<Arc<Workload>> {
        let state = self.state.lock();
        let Some(queue) = state.cluster_queues.get(cq) else {
            return Vec::new();
        };
        match queue.strategy {
            QueueingStrategy::StrictFIFO => queue
                .heap
                .peek()
                .and_then(|(key, _)| queue.items.get(key).cloned())
                .into_iter()
                .collect(),
            QueueingStrategy::BestEffortFIFO => queue
                .heap
                .clone()
                .into_sorted_iter()
                .filter_map(|(key, _)| queue.items.get(&key).cloned())
                .collect(),
        }
    }

    pub fn peek_head(&self, cq: &str) -> Option<Arc<Workload>> {
        let state = self.state.lock();
        let queue = state.cluster_queues.get(cq)?;
        queue
            .heap
            .peek()
            .and_then(|(key, _)| queue.items.get(key).cloned())
    }

    pub fn pop_head(&self, cq: &str) -> Option<Arc<Workload>> {
        let mut state = self.state.lock();
        let queue = state.cluster_queues.get_mut(cq)?;
        let (key, _) = queue.heap.pop()?;
        queue.items.remove(&key)
    }

    /// Drops a workload from the heap after its admission committed.
    pub fn remove_admitted(&self, cq: &str, key: &WorkloadKey) {
        let mut state = self.state.lock();
        if let Some(queue) = state.cluster_queues.get_mut(cq) {
            queue.remove(key);
        }
    }

    /// Parks a workload in the inadmissible side-set of its cluster-queue; it
    /// stays there until `admission_changed` wakes the queue.
    pub fn move_to_inadmissible(&self, cq: &str, key: &WorkloadKey) {
        let mut state = self.state.lock();
        if let Some(queue) = state.cluster_queues.get_mut(cq) {
            queue.heap.remove(key);
            if let Some(workload) = queue.items.remove(key) {
                queue.inadmissible.insert(key.clone(), workload);
            }
        }
    }

    /// Returns inadmissible workloads of the given cluster-queues to their
    /// heaps. Called when an admission or eviction changed capacity anywhere
    /// in a cohort.
    pub fn admission_changed<'a, I: IntoIterator<Item = &'a str>>(&self, cluster_queues: I) {
        let mut state = self.state.lock();
        let mut requeued = 0;
        for cq in cluster_queues {
            if let Some(queue) = state.cluster_queues.get_mut(cq) {
                requeued += queue.requeue_inadmissible();
            }
        }
        drop(state);
        if requeued > 0 {
            log::debug!("requeued {requeued} inadmissible workloads");
            self.wakeup.notify_one();
        }
    }

    /// (active, inadmissible) pending counts of a cluster-queue.
    pub fn pending_counts(&self, cq: &str) -> (usize, usize) {
        let state = self.state.lock();
        state
            .cluster_queues
            .get(cq)
            .map(|queue| (queue.items.len(), queue.inadmissible.len()))
            .unwrap_or((0, 0))
    }
}

impl ManagerState {
    /// Places a pending workload into its cluster-queue's heap, or into the
    /// unresolved side-set when the route is incomplete.
    fn route(&mut self, workload: Arc<Workload>) -> bool {
        let lq_key = local_queue_key(&workload.namespace, &workload.spec.queue_name);
        let target = self.local_queues.get(&lq_key).cloned();
        match target.and_then(|cq| self.cluster_queues.get_mut(&cq)) {
            Some(queue) => {
                queue.push(workload);
                true
            }
            None => {
                self.hold_unresolved(workload);
                false
            }
        }
    }

    fn hold_unresolved(&mut self, workload: Arc<Workload>) {
        let lq_key = local_queue_key(&workload.namespace, &workload.spec.queue_name);
        log::debug!("holding workload {} for queue {lq_key}", workload.key());
        self.unresolved
            .entry(lq_key)
            .or_default()
            .insert(workload.key(), workload);
    }

    /// Retries routing of workloads held under the given local-queue key.
    fn resolve_pending(&mut self, lq_key: &str) {
        if let Some(held) = self.unresolved.remove(lq_key) {
            for (_, workload) in held {
                self.route(workload);
            }
        }
    }
}
