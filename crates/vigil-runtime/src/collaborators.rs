//! Seams to the systems the control plane talks to but does not own.
//!
//! | Trait | Stands in for |
//! |---|---|
//! | [`PatrolJournal`] | append-only persistence: activity log, violations, waypoint summaries |
//! | [`RouteSource`] | read-only persistence: routes and fleet settings |
//! | [`AlertDispatcher`] | e-mail / SMS / chat delivery, fire-and-forget |
//! | [`PipelineControl`] | the detection pipeline's start command |
//!
//! [`TracingJournal`] and [`NoopAlerts`] are the defaults used when nothing
//! else is wired in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use vigil_middleware::CloudMonitor;
use vigil_types::{
    ActivityLevel, PatrolSettings, PatrolSummary, Route, ViolationRecord, WaypointSummary,
};

/// Append-only record of what patrols did.
///
/// Calls happen on orchestrator workers, so implementations should return
/// quickly and log their own failures.
pub trait PatrolJournal: Send + Sync {
    fn append_activity(&self, robot_id: &str, level: ActivityLevel, message: &str);

    fn append_violation(&self, record: &ViolationRecord);

    fn append_waypoint_summary(&self, summary: &WaypointSummary);
}

pub trait RouteSource: Send + Sync {
    fn route(&self, route_id: &str) -> Option<Route>;

    fn settings(&self) -> PatrolSettings;
}

/// Outbound alert delivery.  Always invoked from a spawned task.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn dispatch_violation(&self, record: ViolationRecord);

    async fn dispatch_patrol_summary(&self, summary: PatrolSummary);
}

/// Starts the external detection pipeline.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    /// Returns `false` when the command could not be sent.
    async fn start_pipeline(&self) -> bool;
}

#[async_trait]
impl PipelineControl for CloudMonitor {
    async fn start_pipeline(&self) -> bool {
        self.send_pipeline_command("start").await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Defaults
// ────────────────────────────────────────────────────────────────────────────

/// Writes journal entries to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJournal;

impl PatrolJournal for TracingJournal {
    fn append_activity(&self, robot_id: &str, level: ActivityLevel, message: &str) {
        match level {
            ActivityLevel::Info => info!(target: "vigil::activity", %robot_id, "{message}"),
            ActivityLevel::Warning => warn!(target: "vigil::activity", %robot_id, "{message}"),
            ActivityLevel::Error => error!(target: "vigil::activity", %robot_id, "{message}"),
        }
    }

    fn append_violation(&self, record: &ViolationRecord) {
        warn!(
            target: "vigil::activity",
            robot_id = %record.robot_id,
            patrol_id = %record.patrol_id,
            waypoint = record.waypoint.as_deref().unwrap_or("-"),
            violation_type = %record.violation_type,
            confidence = record.confidence,
            "violation recorded"
        );
    }

    fn append_waypoint_summary(&self, summary: &WaypointSummary) {
        info!(
            target: "vigil::activity",
            robot_id = %summary.robot_id,
            waypoint = %summary.waypoint,
            people = summary.total_people,
            violations = summary.total_violations,
            action = summary.action_taken.as_deref().unwrap_or("-"),
            notes = %summary.notes,
            "waypoint summary"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlerts;

#[async_trait]
impl AlertDispatcher for NoopAlerts {
    async fn dispatch_violation(&self, _record: ViolationRecord) {}

    async fn dispatch_patrol_summary(&self, _summary: PatrolSummary) {}
}

/// Routes and settings held in memory, e.g. loaded from a config file.
#[derive(Debug, Default, Clone)]
pub struct StaticRoutes {
    routes: HashMap<String, Route>,
    settings: PatrolSettings,
}

impl StaticRoutes {
    pub fn new(routes: impl IntoIterator<Item = Route>, settings: PatrolSettings) -> Self {
        Self {
            routes: routes.into_iter().map(|r| (r.id.clone(), r)).collect(),
            settings,
        }
    }

    /// Route ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl RouteSource for StaticRoutes {
    fn route(&self, route_id: &str) -> Option<Route> {
        self.routes.get(route_id).cloned()
    }

    fn settings(&self) -> PatrolSettings {
        self.settings.clone()
    }
}

/// Hand `dispatch` a clone of `alerts` on a fresh task.
pub(crate) fn spawn_alert<F, Fut>(alerts: &Arc<dyn AlertDispatcher>, dispatch: F)
where
    F: FnOnce(Arc<dyn AlertDispatcher>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(dispatch(Arc::clone(alerts)));
}
