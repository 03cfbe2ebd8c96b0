use parking_lot::Mutex;
use serde::Serialize;

use crate::workload::WorkloadKey;

/// Structured events emitted at the admission lifecycle edges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    WorkloadCreated {
        workload: WorkloadKey,
    },
    Admitted {
        workload: WorkloadKey,
        cluster_queue: String,
    },
    Preempted {
        workload: WorkloadKey,
        preemptor: WorkloadKey,
    },
    EvictionAcknowledged {
        workload: WorkloadKey,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Event::WorkloadCreated { workload } => write!(f, "Workload {workload} created"),
            Event::Admitted {
                workload,
                cluster_queue,
            } => write!(f, "{workload}: Admitted by clusterQueue {cluster_queue}"),
            Event::Preempted {
                workload,
                preemptor,
            } => write!(f, "{workload}: Preempted to accommodate {preemptor}"),
            Event::EvictionAcknowledged { workload } => {
                write!(f, "{workload}: eviction acknowledged")
            }
        }
    }
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Forwards events to the log; the default recorder.
#[derive(Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: Event) {
        log::info!("{event}");
    }
}

/// Keeps every recorded event; used by tests and embedders that forward
/// events elsewhere.
#[derive(Default)]
pub struct CollectingRecorder {
    events: Mutex<Vec<Event>>,
}

impl CollectingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn recorded(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventRecorder for CollectingRecorder {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}
