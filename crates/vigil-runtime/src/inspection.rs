//! Inspection Orchestrator – a pipeline-gated walk over a route.
//!
//! Before moving, the run makes sure the detection pipeline is alive: a
//! snapshot newer than the liveness window means it is already running,
//! otherwise a start command is sent and the snapshot is polled every
//! second until the pipeline reports in or the start timeout expires.
//!
//! Each waypoint is then visited once:
//!
//! 1. `MovingToWaypoint` – goto, then a fixed travel wait (the robot's
//!    arrival event is not consulted here).
//! 2. `Inspecting` – announce, then sample the detection snapshot at a fixed
//!    interval for the waypoint's checking duration.
//! 3. `WaypointComplete` – the outcome is taken from the last sample, shown
//!    on the robot and spoken, and an [`InspectionResult`] is emitted.
//!
//! Progress is mirrored onto the robot's inspection webview through
//! `{base}/command/webview/update`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;
use vigil_middleware::{CommandPublisher, Topic};
use vigil_types::{
    ActivityLevel, EventPayload, InspectionResult, InspectionState, Route, VigilError, Waypoint,
    WaypointSummary, secs,
};

use crate::actions::check_delivery;
use crate::collaborators::PipelineControl;
use crate::context::{FinishHook, FinishedRun, PatrolContext};
use crate::pacing::{Pacer, StopSignal};

const SOURCE: &str = "vigil-runtime::inspection";

const PIPELINE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct InspectionRun {
    state: InspectionState,
    index: usize,
    paused: bool,
    inspected: usize,
    total_violations: u32,
    total_people: u32,
}

impl InspectionRun {
    /// Count one inspected waypoint.  Totals saturate instead of wrapping.
    fn tally(&mut self, violations: u32, people: u32) {
        self.inspected += 1;
        self.total_violations = self.total_violations.saturating_add(violations);
        self.total_people = self.total_people.saturating_add(people);
    }
}

struct Shared {
    robot_id: String,
    run_id: Uuid,
    route: Route,
    ctx: PatrolContext,
    publisher: Arc<dyn CommandPublisher>,
    pipeline: Option<Arc<dyn PipelineControl>>,
    run: Mutex<InspectionRun>,
    signal: Arc<StopSignal>,
    on_finish: Mutex<Option<FinishHook>>,
    webview_shown: AtomicBool,
}

/// Handle to one inspection run.
pub struct InspectionOrchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InspectionOrchestrator {
    /// `pipeline` is used to start the detection pipeline when it is not
    /// live; without one the run only waits for it.
    pub fn new(
        route: Route,
        publisher: Arc<dyn CommandPublisher>,
        ctx: PatrolContext,
        pipeline: Option<Arc<dyn PipelineControl>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                robot_id: publisher.robot_id().to_string(),
                run_id: Uuid::new_v4(),
                route,
                ctx,
                publisher,
                pipeline,
                run: Mutex::new(InspectionRun {
                    state: InspectionState::Idle,
                    index: 0,
                    paused: false,
                    inspected: 0,
                    total_violations: 0,
                    total_people: 0,
                }),
                signal: StopSignal::new(),
                on_finish: Mutex::new(None),
                webview_shown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn on_finish(&self, hook: FinishHook) {
        *lock(&self.shared.on_finish) = Some(hook);
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    pub fn robot_id(&self) -> &str {
        &self.shared.robot_id
    }

    pub fn route(&self) -> &Route {
        &self.shared.route
    }

    pub fn state(&self) -> InspectionState {
        self.shared.run().state
    }

    pub fn is_paused(&self) -> bool {
        self.shared.run().paused
    }

    pub fn current_waypoint(&self) -> (usize, Option<String>) {
        let index = self.shared.run().index;
        let name = self.shared.route.waypoints.get(index).map(|w| w.name.clone());
        (index, name)
    }

    /// Begin the inspection.
    ///
    /// # Errors
    ///
    /// Same as [`PatrolOrchestrator::start`][crate::PatrolOrchestrator::start].
    pub fn start(&self) -> Result<(), VigilError> {
        let shared = &self.shared;
        {
            let mut run = shared.run();
            if run.state != InspectionState::Idle {
                return Err(VigilError::AlreadyActive(shared.robot_id.clone()));
            }
            if shared.route.waypoints.is_empty() {
                run.state = InspectionState::Error;
                drop(run);
                let err = VigilError::NoWaypoints(shared.route.id.clone());
                shared.report_error(&err);
                return Err(err);
            }
            run.state = InspectionState::CheckingPipeline;
        }
        info!(robot_id = %shared.robot_id, route = %shared.route.name, "inspection started");
        shared.journal(
            ActivityLevel::Info,
            &format!("Inspection started on route '{}'", shared.route.name),
        );
        shared.emit_status();

        let span = info_span!("inspection", robot_id = %shared.robot_id, route = %shared.route.name);
        let worker = tokio::spawn(Arc::clone(shared).run_worker().instrument(span));
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    pub async fn stop(&self) -> bool {
        let shared = &self.shared;
        {
            let mut run = shared.run();
            if run.state == InspectionState::Idle || run.state.is_terminal() {
                return false;
            }
            run.state = InspectionState::Stopped;
        }
        shared.signal.request_stop();
        check_delivery(&shared.robot_id, "stop", shared.publisher.stop_movement().await);
        info!(robot_id = %shared.robot_id, "inspection stopped");
        shared.journal(ActivityLevel::Info, "Inspection stopped");
        shared.emit_status();
        true
    }

    /// Pause before the next waypoint.
    pub fn pause(&self) -> bool {
        let mut run = self.shared.run();
        if run.paused || run.state == InspectionState::Idle || run.state.is_terminal() {
            return false;
        }
        run.paused = true;
        true
    }

    pub fn resume(&self) -> bool {
        {
            let mut run = self.shared.run();
            if !run.paused {
                return false;
            }
            run.paused = false;
        }
        self.shared.signal.notify();
        true
    }

    pub async fn wait_finished(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(robot_id = %self.shared.robot_id, %err, "inspection worker panicked");
            }
        }
    }
}

impl Shared {
    fn run(&self) -> MutexGuard<'_, InspectionRun> {
        lock(&self.run)
    }

    fn journal(&self, level: ActivityLevel, message: &str) {
        self.ctx.journal.append_activity(&self.robot_id, level, message);
    }

    fn emit_status(&self) {
        let (state, index) = {
            let run = self.run();
            (run.state, run.index)
        };
        self.ctx.emit(
            Topic::Patrol,
            SOURCE,
            EventPayload::InspectionStatus {
                robot_id: self.robot_id.clone(),
                state,
                current_waypoint_index: index,
                total_waypoints: self.route.waypoints.len(),
            },
        );
    }

    /// Move to `state` unless the run already ended.
    fn transition(&self, state: InspectionState) -> bool {
        {
            let mut run = self.run();
            if run.state.is_terminal() {
                return false;
            }
            run.state = state;
        }
        info!(?state, "inspection state");
        self.emit_status();
        true
    }

    fn report_error(&self, err: &VigilError) {
        error!(robot_id = %self.robot_id, %err, "inspection failed");
        self.journal(ActivityLevel::Error, &err.to_string());
        self.emit_status();
        self.ctx.emit(
            Topic::Patrol,
            SOURCE,
            EventPayload::PatrolError {
                robot_id: self.robot_id.clone(),
                kind: err.kind(),
                message: err.to_string(),
            },
        );
    }

    async fn run_worker(self: Arc<Self>) {
        let mut pacer = self.signal.pacer();
        let result = self.inspect_route(&mut pacer).await;
        self.finish(result);
    }

    async fn inspect_route(&self, pacer: &mut Pacer) -> Result<(), VigilError> {
        self.ensure_pipeline(pacer).await?;
        if !self.transition(InspectionState::Running) {
            return Ok(());
        }
        for (index, waypoint) in self.route.waypoints.iter().enumerate() {
            if !self.wait_while_paused(pacer).await {
                return Ok(());
            }
            self.run().index = index;
            if !self.inspect_waypoint(index, waypoint, pacer).await {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn wait_while_paused(&self, pacer: &mut Pacer) -> bool {
        loop {
            if pacer.is_stopped() {
                return false;
            }
            if !self.run().paused {
                return true;
            }
            pacer.wait_until(None).await;
        }
    }

    /// Make sure the detection pipeline is publishing, starting it if needed.
    async fn ensure_pipeline(&self, pacer: &mut Pacer) -> Result<(), VigilError> {
        let settings = &self.ctx.settings;
        let snapshot = self.ctx.snapshots.snapshot();
        if let Some(last) = snapshot.last_message_time {
            let age = Utc::now().signed_duration_since(last).to_std().unwrap_or_default();
            if age < settings.pipeline_liveness() {
                info!(?age, "detection pipeline already running");
                return Ok(());
            }
        }

        if !self.transition(InspectionState::StartingPipeline) {
            return Ok(());
        }
        self.update_webview("starting_pipeline", json!({})).await;
        if let Some(pipeline) = &self.pipeline {
            if !pipeline.start_pipeline().await {
                return Err(VigilError::Pipeline(
                    "failed to send pipeline start command".to_string(),
                ));
            }
        }

        let timeout = settings.pipeline_start_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.ctx.snapshots.snapshot();
            if snapshot.enabled && snapshot.total_violations.is_some() {
                info!("detection pipeline started");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VigilError::Pipeline(format!(
                    "pipeline did not start within {}s",
                    timeout.as_secs_f64()
                )));
            }
            if !pacer.sleep(PIPELINE_POLL).await {
                return Ok(());
            }
        }
    }

    /// Returns `false` on stop.
    async fn inspect_waypoint(&self, index: usize, waypoint: &Waypoint, pacer: &mut Pacer) -> bool {
        let settings = &self.ctx.settings;
        let name = waypoint.name.as_str();
        let step = &waypoint.inspection;

        if !self.transition(InspectionState::MovingToWaypoint) {
            return false;
        }
        let progress = format!("{}/{}", index + 1, self.route.waypoints.len());
        self.update_webview("moving_to", json!({ "waypoint_name": name, "progress": progress }))
            .await;
        check_delivery(&self.robot_id, "goto", self.publisher.goto(name).await);
        if !pacer.sleep(secs(settings.inspection_arrival_wait_secs)).await {
            return false;
        }

        if !self.transition(InspectionState::Inspecting) {
            return false;
        }
        self.update_webview(
            "inspecting",
            json!({ "waypoint_name": name, "violations": 0, "people": 0 }),
        )
        .await;
        let announcement = step.tts_start.replace("{waypoint}", name);
        check_delivery(&self.robot_id, "tts", self.publisher.speak(&announcement).await);
        if !pacer.sleep(secs(settings.tts_wait_secs)).await {
            return false;
        }

        let checking = secs(step.checking_secs);
        let sample_every = secs(settings.inspection_sample_secs).max(Duration::from_millis(100));
        let started = Instant::now();
        let mut last = None;
        while started.elapsed() < checking {
            let sample = self.ctx.snapshots.snapshot();
            let remaining = checking.saturating_sub(started.elapsed()).as_secs();
            self.update_webview(
                "inspecting",
                json!({
                    "waypoint_name": name,
                    "violations": sample.violations(),
                    "people": sample.total_people,
                    "duration": remaining,
                }),
            )
            .await;
            last = Some(sample);
            if !pacer.sleep(sample_every).await {
                return false;
            }
        }
        let last = last.unwrap_or_default();
        let violations = last.violations();
        let people = last.total_people;

        let (screen, data, speech) = if violations == 0 {
            (
                "no_violation",
                json!({ "waypoint_name": name }),
                step.tts_no_violation.replace("{waypoint}", name),
            )
        } else {
            (
                "violation_detected",
                json!({ "waypoint_name": name, "violations": violations, "people": people }),
                step.tts_violation
                    .replace("{waypoint}", name)
                    .replace("{count}", &violations.to_string()),
            )
        };
        self.update_webview(screen, data).await;
        check_delivery(&self.robot_id, "tts", self.publisher.speak(&speech).await);
        info!(waypoint = %name, violations, people, "waypoint inspected");

        let result = InspectionResult {
            robot_id: self.robot_id.clone(),
            waypoint: name.to_string(),
            violations,
            people,
            viewports: last.viewports.clone(),
            violation_found: violations > 0,
            duration_secs: checking.as_secs_f64(),
        };
        self.ctx.journal.append_waypoint_summary(&WaypointSummary {
            robot_id: self.robot_id.clone(),
            route_id: self.route.id.clone(),
            waypoint: name.to_string(),
            waypoint_index: index,
            timestamp: Utc::now(),
            total_people: people,
            total_violations: violations,
            total_compliant: people.saturating_sub(violations),
            viewports: last.viewports,
            action_taken: None,
            notes: if violations > 0 { "violation_found" } else { "no_violation" }.to_string(),
        });
        self.ctx
            .emit(Topic::Detections, SOURCE, EventPayload::InspectionResult(result));
        self.run().tally(violations, people);

        if !pacer.sleep(secs(settings.tts_wait_secs)).await {
            return false;
        }
        self.transition(InspectionState::WaypointComplete)
    }

    /// Show the inspection webview once, then push `state` and `data` to it.
    async fn update_webview(&self, state: &str, data: Value) {
        if !self.webview_shown.swap(true, Ordering::SeqCst) {
            let url = &self.ctx.settings.inspection_webview_url;
            check_delivery(&self.robot_id, "webview", self.publisher.show_webview(url).await);
        }
        let mut payload = json!({ "state": state, "timestamp": Utc::now().to_rfc3339() });
        if let (Some(fields), Value::Object(extra)) = (payload.as_object_mut(), data) {
            fields.extend(extra);
        }
        check_delivery(&self.robot_id, "webview update", self.publisher.update_webview(payload).await);
    }

    fn finish(&self, result: Result<(), VigilError>) {
        match result {
            Ok(()) => {
                let stopped = self.signal.is_stopped();
                let (inspected, total_violations, total_people) = {
                    let mut run = self.run();
                    if !run.state.is_terminal() {
                        run.state = if stopped {
                            InspectionState::Stopped
                        } else {
                            InspectionState::Completed
                        };
                    }
                    (run.inspected, run.total_violations, run.total_people)
                };
                self.release(!stopped);
                self.emit_status();
                if stopped {
                    return;
                }
                info!(inspected, total_violations, total_people, "inspection complete");
                self.journal(
                    ActivityLevel::Info,
                    &format!(
                        "Inspection complete: {inspected} waypoint(s), {total_violations} violation(s)"
                    ),
                );
                self.ctx.emit(
                    Topic::Patrol,
                    SOURCE,
                    EventPayload::InspectionComplete {
                        robot_id: self.robot_id.clone(),
                        waypoints_inspected: inspected,
                        total_violations,
                        total_people,
                    },
                );
            }
            Err(err) => {
                self.run().state = InspectionState::Error;
                self.release(false);
                self.report_error(&err);
            }
        }
    }

    fn release(&self, completed: bool) {
        let hook = lock(&self.on_finish).take();
        if let Some(hook) = hook {
            hook(&FinishedRun {
                robot_id: self.robot_id.clone(),
                run_id: self.run_id,
                route_id: self.route.id.clone(),
                completed_loops: u32::from(completed),
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
