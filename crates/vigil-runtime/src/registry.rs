//! Patrol Registry – at most one active run per robot.
//!
//! The registry owns the robot id → run map, the fleet's
//! [`ViolationDebouncer`], and the wiring between runs and the outside
//! world:
//!
//! - runs are only started for robots whose link is connected;
//! - a run removes itself from the map through its finish hook when it
//!   completes, stops or fails, so the map never holds a finished run;
//! - individual violations from the detection feed are debounced against
//!   the robot's current waypoint and, when reportable, journaled,
//!   broadcast and handed to the alert dispatcher.
//!
//! Every run shares the registry's [`PatrolContext`], so all of their events
//! arrive on one [`EventBus`][vigil_middleware::EventBus].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_middleware::{
    CommandPublisher, LinkDirectory, NewViolation, Topic, TopicReceiver, WaypointEvent,
};
use vigil_perception::{
    DebounceConfig, Decision, ViolationDebouncer, ViolationObservation, WindowStats,
};
use vigil_types::{
    EventPayload, InspectionState, PatrolStatus, PatrolSummary, Route, VigilError, ViolationRecord,
};

use crate::collaborators::{PipelineControl, spawn_alert};
use crate::context::{FinishHook, FinishedRun, PatrolContext};
use crate::inspection::InspectionOrchestrator;
use crate::orchestrator::PatrolOrchestrator;

const SOURCE: &str = "vigil-runtime::registry";

#[derive(Clone)]
enum ActiveRun {
    Patrol(Arc<PatrolOrchestrator>),
    Inspection(Arc<InspectionOrchestrator>),
}

impl ActiveRun {
    fn run_id(&self) -> Uuid {
        match self {
            ActiveRun::Patrol(p) => p.patrol_id(),
            ActiveRun::Inspection(i) => i.run_id(),
        }
    }

    fn current_waypoint(&self) -> (usize, Option<String>) {
        match self {
            ActiveRun::Patrol(p) => p.current_waypoint(),
            ActiveRun::Inspection(i) => i.current_waypoint(),
        }
    }

    async fn stop(&self) -> bool {
        match self {
            ActiveRun::Patrol(p) => p.stop().await,
            ActiveRun::Inspection(i) => i.stop().await,
        }
    }

    async fn wait_finished(&self) {
        match self {
            ActiveRun::Patrol(p) => p.wait_finished().await,
            ActiveRun::Inspection(i) => i.wait_finished().await,
        }
    }
}

pub struct PatrolRegistry {
    links: Arc<dyn LinkDirectory>,
    ctx: PatrolContext,
    pipeline: Option<Arc<dyn PipelineControl>>,
    debouncer: Mutex<ViolationDebouncer>,
    active: Mutex<HashMap<String, ActiveRun>>,
    me: Weak<PatrolRegistry>,
}

impl PatrolRegistry {
    /// `pipeline` is handed to inspection runs so they can start the
    /// detection pipeline.
    pub fn new(
        links: Arc<dyn LinkDirectory>,
        ctx: PatrolContext,
        debounce: DebounceConfig,
        pipeline: Option<Arc<dyn PipelineControl>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            links,
            ctx,
            pipeline,
            debouncer: Mutex::new(ViolationDebouncer::new(debounce)),
            active: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn context(&self) -> &PatrolContext {
        &self.ctx
    }

    // ────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────────────

    /// Start patrolling `route` with `robot_id`.  Returns the run id.
    ///
    /// # Errors
    ///
    /// [`VigilError::AlreadyActive`], [`VigilError::UnknownRobot`],
    /// [`VigilError::NotConnected`], or whatever
    /// [`PatrolOrchestrator::start`] rejects.  No state changes on error.
    pub fn start_patrol(&self, robot_id: &str, route: Route) -> Result<Uuid, VigilError> {
        let mut active = lock(&self.active);
        let publisher = self.admit(&active, robot_id)?;
        let orchestrator = Arc::new(PatrolOrchestrator::new(route, publisher, self.ctx.clone()));
        orchestrator.on_finish(self.finish_hook());
        orchestrator.start()?;
        let run_id = orchestrator.patrol_id();
        active.insert(robot_id.to_string(), ActiveRun::Patrol(orchestrator));
        info!(%robot_id, %run_id, active = active.len(), "patrol registered");
        Ok(run_id)
    }

    /// Start an inspection of `route` with `robot_id`.  Same rules as
    /// [`start_patrol`][Self::start_patrol].
    pub fn start_inspection(&self, robot_id: &str, route: Route) -> Result<Uuid, VigilError> {
        let mut active = lock(&self.active);
        let publisher = self.admit(&active, robot_id)?;
        let inspection = Arc::new(InspectionOrchestrator::new(
            route,
            publisher,
            self.ctx.clone(),
            self.pipeline.clone(),
        ));
        inspection.on_finish(self.finish_hook());
        inspection.start()?;
        let run_id = inspection.run_id();
        active.insert(robot_id.to_string(), ActiveRun::Inspection(inspection));
        info!(%robot_id, %run_id, active = active.len(), "inspection registered");
        Ok(run_id)
    }

    fn admit(
        &self,
        active: &HashMap<String, ActiveRun>,
        robot_id: &str,
    ) -> Result<Arc<dyn CommandPublisher>, VigilError> {
        if active.contains_key(robot_id) {
            return Err(VigilError::AlreadyActive(robot_id.to_string()));
        }
        let publisher = self
            .links
            .publisher(robot_id)
            .ok_or_else(|| VigilError::UnknownRobot(robot_id.to_string()))?;
        if !self.links.is_connected(robot_id) {
            return Err(VigilError::NotConnected(robot_id.to_string()));
        }
        Ok(publisher)
    }

    /// Stop the robot's run and drop it once its worker has exited.
    /// Returns `false` when nothing was stopped.
    ///
    /// The slot stays taken until the worker is gone, so a new run for the
    /// same robot can never overlap with the old one's last commands.
    pub async fn stop_patrol(&self, robot_id: &str) -> bool {
        let Some(run) = self.get(robot_id) else {
            return false;
        };
        let stopped = run.stop().await;
        if stopped {
            run.wait_finished().await;
            self.remove_if(robot_id, run.run_id());
        }
        stopped
    }

    pub async fn stop_all(&self) {
        for robot_id in self.active_robots() {
            self.stop_patrol(&robot_id).await;
        }
    }

    pub async fn pause_patrol(&self, robot_id: &str) -> bool {
        match self.get(robot_id) {
            Some(ActiveRun::Patrol(p)) => p.pause().await,
            Some(ActiveRun::Inspection(i)) => i.pause(),
            None => false,
        }
    }

    pub async fn resume_patrol(&self, robot_id: &str) -> bool {
        match self.get(robot_id) {
            Some(ActiveRun::Patrol(p)) => p.resume().await,
            Some(ActiveRun::Inspection(i)) => i.resume(),
            None => false,
        }
    }

    /// Returns the applied speed, or `None` without an active patrol.
    pub fn set_speed(&self, robot_id: &str, speed: f64) -> Option<f64> {
        match self.get(robot_id)? {
            ActiveRun::Patrol(p) => Some(p.set_speed(speed)),
            ActiveRun::Inspection(_) => None,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Robot input
    // ────────────────────────────────────────────────────────────────────────

    pub async fn update_battery(&self, robot_id: &str, level: u8, is_charging: bool) {
        if let Some(ActiveRun::Patrol(p)) = self.get(robot_id) {
            p.update_battery(level, is_charging).await;
        }
    }

    pub fn on_waypoint_event(&self, robot_id: &str, event: &WaypointEvent) {
        if let Some(ActiveRun::Patrol(p)) = self.get(robot_id) {
            p.on_waypoint_event(event);
        }
    }

    /// Debounce an individual violation against the robot's current
    /// waypoint.  `None` when the robot has no active run.
    pub fn report_violation(
        &self,
        robot_id: &str,
        violation: &NewViolation,
        at: DateTime<Utc>,
    ) -> Option<Decision> {
        let run = self.get(robot_id)?;
        let run_id = run.run_id();
        let (waypoint_index, waypoint) = run.current_waypoint();
        let observation = ViolationObservation::new(
            at,
            violation.confidence,
            violation.violation_type.clone(),
            waypoint_index,
        );
        let decision = lock(&self.debouncer).observe(run_id, observation);
        if !decision.should_report {
            debug!(%robot_id, reason = %decision.reason, "violation suppressed");
            return Some(decision);
        }

        let record = ViolationRecord {
            robot_id: robot_id.to_string(),
            patrol_id: run_id,
            waypoint_index,
            waypoint,
            violation_type: violation.violation_type.clone(),
            confidence: violation.confidence,
            viewport: violation.viewport.clone(),
            timestamp: at,
            reason: decision.reason.clone(),
        };
        warn!(
            %robot_id,
            violation_type = %record.violation_type,
            confidence = record.confidence,
            "violation reported"
        );
        self.ctx.journal.append_violation(&record);
        self.ctx
            .emit(Topic::Detections, SOURCE, EventPayload::ViolationReported(record.clone()));
        spawn_alert(&self.ctx.alerts, move |alerts| async move {
            alerts.dispatch_violation(record).await;
        });
        Some(decision)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────────────

    pub fn status(&self, robot_id: &str) -> Option<PatrolStatus> {
        match self.get(robot_id)? {
            ActiveRun::Patrol(p) => Some(p.status()),
            ActiveRun::Inspection(_) => None,
        }
    }

    pub fn inspection_state(&self, robot_id: &str) -> Option<InspectionState> {
        match self.get(robot_id)? {
            ActiveRun::Inspection(i) => Some(i.state()),
            ActiveRun::Patrol(_) => None,
        }
    }

    /// Debounce window statistics for the robot's current waypoint.
    pub fn violation_stats(&self, robot_id: &str) -> Option<WindowStats> {
        let run = self.get(robot_id)?;
        let (index, _) = run.current_waypoint();
        Some(lock(&self.debouncer).stats(run.run_id(), index))
    }

    pub fn is_active(&self, robot_id: &str) -> bool {
        lock(&self.active).contains_key(robot_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Robots with an active run, sorted.
    pub fn active_robots(&self) -> Vec<String> {
        let mut robots: Vec<_> = lock(&self.active).keys().cloned().collect();
        robots.sort();
        robots
    }

    /// Status, waypoint, completion and error events from every run.
    pub fn subscribe(&self) -> TopicReceiver {
        self.ctx.bus.subscribe_to(Topic::Patrol)
    }

    // ────────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────────

    fn get(&self, robot_id: &str) -> Option<ActiveRun> {
        lock(&self.active).get(robot_id).cloned()
    }

    fn remove_if(&self, robot_id: &str, run_id: Uuid) -> bool {
        let mut active = lock(&self.active);
        if active.get(robot_id).is_some_and(|run| run.run_id() == run_id) {
            active.remove(robot_id);
            true
        } else {
            false
        }
    }

    fn finish_hook(&self) -> FinishHook {
        let registry = self.me.clone();
        Box::new(move |finished| {
            if let Some(registry) = registry.upgrade() {
                registry.release(finished);
            }
        })
    }

    fn release(&self, finished: &FinishedRun) {
        self.remove_if(&finished.robot_id, finished.run_id);
        let tally = lock(&self.debouncer).finish_patrol(finished.run_id);
        info!(
            robot_id = %finished.robot_id,
            run_id = %finished.run_id,
            observations = tally.observations,
            triggers = tally.triggers,
            "run released"
        );
        let summary = PatrolSummary {
            robot_id: finished.robot_id.clone(),
            patrol_id: finished.run_id,
            route_id: finished.route_id.clone(),
            completed_loops: finished.completed_loops,
            observations: tally.observations,
            triggers: tally.triggers,
            effectiveness: tally.effectiveness,
            finished_at: Utc::now(),
        };
        spawn_alert(&self.ctx.alerts, move |alerts| async move {
            alerts.dispatch_patrol_summary(summary).await;
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use vigil_middleware::{EventBus, WaypointEventKind};
    use vigil_types::{ActivityLevel, LowBatteryPolicy, PatrolSettings, PatrolState};

    use crate::collaborators::AlertDispatcher;
    use crate::testing::{
        FakeLinks, RecordingJournal, RecordingPublisher, quick_settings, route,
    };

    #[derive(Default)]
    struct RecordingAlerts {
        violations: Mutex<Vec<ViolationRecord>>,
        summaries: Mutex<Vec<PatrolSummary>>,
    }

    #[async_trait]
    impl AlertDispatcher for RecordingAlerts {
        async fn dispatch_violation(&self, record: ViolationRecord) {
            self.violations.lock().unwrap().push(record);
        }

        async fn dispatch_patrol_summary(&self, summary: PatrolSummary) {
            self.summaries.lock().unwrap().push(summary);
        }
    }

    struct Fixture {
        registry: Arc<PatrolRegistry>,
        links: Arc<FakeLinks>,
        publisher: Arc<RecordingPublisher>,
        journal: Arc<RecordingJournal>,
        alerts: Arc<RecordingAlerts>,
        bus: EventBus,
    }

    fn fixture(settings: PatrolSettings) -> Fixture {
        let (links, publisher) = FakeLinks::with("temi-1", "001", true);
        let journal = Arc::new(RecordingJournal::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let bus = EventBus::default();
        let ctx = PatrolContext::new(bus.clone(), settings)
            .with_journal(journal.clone())
            .with_alerts(alerts.clone());
        let registry = PatrolRegistry::new(links.clone(), ctx, DebounceConfig::default(), None);
        Fixture {
            registry,
            links,
            publisher,
            journal,
            alerts,
            bus,
        }
    }

    fn violation(confidence: f64) -> NewViolation {
        NewViolation {
            event_id: None,
            violation_type: "no_helmet".into(),
            viewport: Some("front".into()),
            confidence,
            serial: None,
        }
    }

    async fn until_inactive(registry: &PatrolRegistry, robot_id: &str) {
        while registry.is_active(robot_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_run_per_robot_and_connected_links_only() {
        let f = fixture(quick_settings());
        f.links.add("temi-2", "002", false);

        let run_id = f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("start");
        assert_eq!(
            f.registry.start_patrol("temi-1", route(&["a"], 1)),
            Err(VigilError::AlreadyActive("temi-1".into()))
        );
        assert_eq!(
            f.registry.start_inspection("temi-1", route(&["a"], 1)),
            Err(VigilError::AlreadyActive("temi-1".into()))
        );
        assert_eq!(
            f.registry.start_patrol("temi-2", route(&["a"], 1)),
            Err(VigilError::NotConnected("temi-2".into()))
        );
        assert_eq!(
            f.registry.start_patrol("ghost", route(&["a"], 1)),
            Err(VigilError::UnknownRobot("ghost".into()))
        );
        assert_eq!(f.registry.active_count(), 1);
        assert_ne!(run_id, Uuid::nil());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_removes_the_run() {
        let f = fixture(quick_settings());
        f.registry.start_patrol("temi-1", route(&["a", "b"], 1)).expect("start");

        assert!(f.registry.stop_patrol("temi-1").await);
        assert!(!f.registry.is_active("temi-1"));
        assert!(!f.registry.stop_patrol("temi-1").await);
        assert!(f.registry.status("temi-1").is_none());

        // The slot is free again.
        f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("restart");
        assert_eq!(f.registry.active_robots(), vec!["temi-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_low_battery_stop_sends_no_stale_goto() {
        let settings = PatrolSettings {
            low_battery_action: LowBatteryPolicy::StopImmediately,
            ..quick_settings()
        };
        let f = fixture(settings);
        f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("start");
        f.publisher.wait_for_gotos(1).await;

        f.registry.update_battery("temi-1", 5, false).await;
        assert!(f.registry.stop_patrol("temi-1").await);
        f.registry.start_patrol("temi-1", route(&["x", "y"], 1)).expect("restart");
        f.publisher.wait_for_gotos(2).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.publisher.gotos(), vec!["a", "x"]);
        assert_eq!(f.registry.active_count(), 1);
        assert_eq!(
            f.registry.status("temi-1").map(|s| s.state),
            Some(PatrolState::Waiting)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completed_run_releases_itself_and_sends_summary() {
        let f = fixture(quick_settings());
        let mut events = f.registry.subscribe();
        f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("start");

        f.publisher.wait_for_gotos(1).await;
        f.registry.on_waypoint_event(
            "temi-1",
            &WaypointEvent {
                kind: WaypointEventKind::Arrived,
                location: "a".into(),
                status: None,
            },
        );
        until_inactive(&f.registry, "temi-1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let summaries = f.alerts.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].completed_loops, 1);
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event.payload, EventPayload::PatrolComplete { .. });
        }
        assert!(completed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_not_left_active() {
        let settings = PatrolSettings {
            waypoint_timeout_secs: 1.0,
            waypoint_max_retries: 0,
            ..quick_settings()
        };
        let f = fixture(settings);
        f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("start");
        until_inactive(&f.registry, "temi-1").await;
        assert_eq!(f.registry.active_count(), 0);
        assert!(
            f.journal
                .activity
                .lock()
                .unwrap()
                .iter()
                .any(|(_, level, _)| *level == ActivityLevel::Error)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn third_violation_in_window_is_reported() {
        let f = fixture(quick_settings());
        let mut detections = f.bus.subscribe_to(Topic::Detections);
        assert!(f.registry.report_violation("temi-1", &violation(0.9), Utc::now()).is_none());

        f.registry.start_patrol("temi-1", route(&["a"], 1)).expect("start");
        let now = Utc::now();
        let first = f.registry.report_violation("temi-1", &violation(0.9), now).expect("active");
        let second = f
            .registry
            .report_violation("temi-1", &violation(0.91), now + chrono::Duration::seconds(1))
            .expect("active");
        let third = f
            .registry
            .report_violation("temi-1", &violation(0.9), now + chrono::Duration::seconds(2))
            .expect("active");
        assert!(!first.should_report);
        assert!(!second.should_report);
        assert!(third.should_report);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let recorded = f.journal.violations.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].waypoint.as_deref(), Some("a"));
        assert_eq!(f.alerts.violations.lock().unwrap().len(), 1);
        let mut reported = 0;
        while let Ok(event) = detections.try_recv() {
            if matches!(event.payload, EventPayload::ViolationReported(_)) {
                reported += 1;
            }
        }
        assert_eq!(reported, 1);
        assert_eq!(f.registry.violation_stats("temi-1").map(|s| s.count), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn battery_reaches_the_active_patrol() {
        let f = fixture(quick_settings());
        f.registry.start_patrol("temi-1", route(&["a", "b"], 1)).expect("start");
        f.registry.update_battery("temi-1", 50, false).await;
        assert_eq!(f.registry.status("temi-1").and_then(|s| s.battery_level), Some(50));
        assert!(
            f.registry
                .status("temi-1")
                .is_some_and(|s| s.state.is_traversing())
        );
        assert_eq!(f.registry.set_speed("temi-1", 0.7), Some(0.7));
    }
}
