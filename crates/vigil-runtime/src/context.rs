//! Dependencies shared by every orchestrator of a fleet.

use std::sync::Arc;

use uuid::Uuid;
use vigil_middleware::{EventBus, Topic};
use vigil_perception::SnapshotSource;
use vigil_types::{Event, EventPayload, PatrolSettings, ViolationSnapshot};

use crate::collaborators::{AlertDispatcher, NoopAlerts, PatrolJournal, TracingJournal};

/// Bus, settings, detection feed and collaborators handed to orchestrators.
#[derive(Clone)]
pub struct PatrolContext {
    pub bus: EventBus,
    pub settings: Arc<PatrolSettings>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub journal: Arc<dyn PatrolJournal>,
    pub alerts: Arc<dyn AlertDispatcher>,
}

impl PatrolContext {
    /// Context with a tracing journal, no alerts and an empty detection feed.
    pub fn new(bus: EventBus, settings: PatrolSettings) -> Self {
        Self {
            bus,
            settings: Arc::new(settings),
            snapshots: Arc::new(ViolationSnapshot::default),
            journal: Arc::new(TracingJournal),
            alerts: Arc::new(NoopAlerts),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn PatrolJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts = alerts;
        self
    }

    pub(crate) fn emit(&self, topic: Topic, source: &str, payload: EventPayload) {
        self.bus.publish_to(topic, Event::new(source, payload));
    }
}

/// What a finished run reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRun {
    pub robot_id: String,
    pub run_id: Uuid,
    pub route_id: String,
    pub completed_loops: u32,
}

/// Called once by a worker when its run reaches a terminal state, before the
/// terminal event is broadcast.
pub type FinishHook = Box<dyn Fn(&FinishedRun) + Send + Sync>;
