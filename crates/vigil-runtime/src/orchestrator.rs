//! Patrol Orchestrator – drives one robot along one route.
//!
//! # State machine
//!
//! | From | Trigger | To |
//! |---|---|---|
//! | `Idle` | [`start`][PatrolOrchestrator::start] | `Running` |
//! | `Running` | goto issued | `Waiting` |
//! | `Waiting` | arrival event | `Running` |
//! | `Running`/`Waiting` | [`pause`][PatrolOrchestrator::pause] | `Paused` |
//! | `Paused` | [`resume`][PatrolOrchestrator::resume] | `Running` (or `Waiting` with the goto re-sent) |
//! | any active | battery at or below threshold | `LowBattery` |
//! | any active | [`stop`][PatrolOrchestrator::stop], low-battery return | `Stopped` |
//! | any active | arrival retries exhausted | `Error` |
//! | `Running` | last loop finished | `Idle` |
//!
//! # Worker
//!
//! [`start`][PatrolOrchestrator::start] spawns a single worker task.  All
//! externally delivered inputs (arrival events, battery readings, operator
//! commands) mutate the shared run state under one mutex and wake the worker
//! through its [`StopSignal`]; the worker never polls on a fixed interval
//! for those.  Waits are timer-driven and end immediately on stop.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;
use vigil_middleware::{CommandPublisher, Topic, WaypointEvent, WaypointEventKind};
use vigil_types::{
    ActivityLevel, ErrorKind, EventPayload, LowBatteryPolicy, PatrolState, PatrolStatus, Route,
    VigilError, Waypoint, secs,
};

use crate::actions::{self, check_delivery};
use crate::context::{FinishHook, FinishedRun, PatrolContext};
use crate::detection_gate::{self, GateSite};
use crate::pacing::{Pacer, StopSignal, Wake};

const SOURCE: &str = "vigil-runtime::orchestrator";

const DEFAULT_SPEED: f64 = 0.5;
const MIN_SPEED: f64 = 0.1;
const MAX_SPEED: f64 = 1.0;

// ────────────────────────────────────────────────────────────────────────────
// Run state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PatrolRun {
    state: PatrolState,
    waypoint_index: usize,
    current_loop: u32,
    completed_loops: u32,
    battery_level: Option<u8>,
    is_low_battery: bool,
    /// Finish the current waypoint, then head home.
    return_after_current: bool,
    /// Head home as soon as the worker unwinds.
    pending_return: bool,
    /// A goto is in flight and an arrival event is expected.
    awaiting_arrival: bool,
    arrived: bool,
    target: Option<String>,
    /// Bumped whenever the arrival wait must restart its timeout.
    arm_epoch: u64,
    speed: f64,
}

impl PatrolRun {
    fn new() -> Self {
        Self {
            state: PatrolState::Idle,
            waypoint_index: 0,
            current_loop: 0,
            completed_loops: 0,
            battery_level: None,
            is_low_battery: false,
            return_after_current: false,
            pending_return: false,
            awaiting_arrival: false,
            arrived: false,
            target: None,
            arm_epoch: 0,
            speed: DEFAULT_SPEED,
        }
    }

    /// Worker-driven transitions only apply while traversing; operator and
    /// battery states take precedence.
    fn advance(&mut self, to: PatrolState) {
        if self.state.is_traversing() {
            self.state = to;
        }
    }
}

/// How the traversal ended.
enum Outcome {
    Completed,
    ReturnHome,
    Interrupted,
}

enum Arrival {
    Arrived,
    TimedOut,
    Stopped,
}

enum BatteryChange {
    Unchanged,
    Low(LowBatteryPolicy),
    Recovered,
}

struct Shared {
    robot_id: String,
    patrol_id: Uuid,
    route: Route,
    ctx: PatrolContext,
    publisher: Arc<dyn CommandPublisher>,
    run: Mutex<PatrolRun>,
    signal: Arc<StopSignal>,
    on_finish: Mutex<Option<FinishHook>>,
}

// ────────────────────────────────────────────────────────────────────────────
// PatrolOrchestrator
// ────────────────────────────────────────────────────────────────────────────

/// Handle to one patrol run.
pub struct PatrolOrchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PatrolOrchestrator {
    pub fn new(route: Route, publisher: Arc<dyn CommandPublisher>, ctx: PatrolContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                robot_id: publisher.robot_id().to_string(),
                patrol_id: Uuid::new_v4(),
                route,
                ctx,
                publisher,
                run: Mutex::new(PatrolRun::new()),
                signal: StopSignal::new(),
                on_finish: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register the callback invoked once when the run ends.
    pub fn on_finish(&self, hook: FinishHook) {
        *lock(&self.shared.on_finish) = Some(hook);
    }

    pub fn patrol_id(&self) -> Uuid {
        self.shared.patrol_id
    }

    pub fn robot_id(&self) -> &str {
        &self.shared.robot_id
    }

    pub fn route(&self) -> &Route {
        &self.shared.route
    }

    pub fn state(&self) -> PatrolState {
        self.shared.run().state
    }

    pub fn status(&self) -> PatrolStatus {
        self.shared.status()
    }

    /// Index and name of the waypoint being worked on.
    pub fn current_waypoint(&self) -> (usize, Option<String>) {
        let index = self.shared.run().waypoint_index;
        let name = self.shared.route.waypoints.get(index).map(|w| w.name.clone());
        (index, name)
    }

    /// Begin the patrol.
    ///
    /// # Errors
    ///
    /// [`VigilError::AlreadyActive`] unless the run is still `Idle`, and
    /// [`VigilError::NoWaypoints`] for an empty route (the run moves to
    /// `Error`).
    pub fn start(&self) -> Result<(), VigilError> {
        let shared = &self.shared;
        {
            let mut run = shared.run();
            if run.state != PatrolState::Idle {
                return Err(VigilError::AlreadyActive(shared.robot_id.clone()));
            }
            if shared.route.waypoints.is_empty() {
                run.state = PatrolState::Error;
                drop(run);
                let err = VigilError::NoWaypoints(shared.route.id.clone());
                shared.report_error(&err);
                return Err(err);
            }
            run.state = PatrolState::Running;
            run.current_loop = 1;
        }

        info!(
            robot_id = %shared.robot_id,
            route = %shared.route.name,
            waypoints = shared.route.waypoints.len(),
            loops = shared.route.total_loops(),
            "patrol started"
        );
        shared.journal(
            ActivityLevel::Info,
            &format!("Patrol started on route '{}'", shared.route.name),
        );
        shared.emit_status();

        let span = info_span!("patrol", robot_id = %shared.robot_id, route = %shared.route.name);
        let worker = tokio::spawn(Arc::clone(shared).run_worker().instrument(span));
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    /// Stop the run.  Returns `false` when there was nothing to stop.
    pub async fn stop(&self) -> bool {
        let shared = &self.shared;
        {
            let mut run = shared.run();
            if !run.state.can_stop() {
                return false;
            }
            run.state = PatrolState::Stopped;
            run.awaiting_arrival = false;
            // An operator stop overrides any pending low-battery return.
            run.pending_return = false;
            run.return_after_current = false;
        }
        shared.signal.request_stop();
        check_delivery(&shared.robot_id, "stop", shared.publisher.stop_movement().await);
        info!(robot_id = %shared.robot_id, "patrol stopped");
        shared.journal(ActivityLevel::Info, "Patrol stopped");
        shared.emit_status();
        true
    }

    pub async fn pause(&self) -> bool {
        let shared = &self.shared;
        {
            let mut run = shared.run();
            if !run.state.can_pause() {
                return false;
            }
            run.state = PatrolState::Paused;
        }
        shared.signal.notify();
        check_delivery(&shared.robot_id, "stop", shared.publisher.stop_movement().await);
        info!(robot_id = %shared.robot_id, "patrol paused");
        shared.emit_status();
        true
    }

    /// Resume a paused run, re-sending the goto that was in flight.
    pub async fn resume(&self) -> bool {
        let shared = &self.shared;
        let regoto = {
            let mut run = shared.run();
            if run.state != PatrolState::Paused {
                return false;
            }
            let regoto = if run.awaiting_arrival {
                run.state = PatrolState::Waiting;
                run.arm_epoch = run.arm_epoch.wrapping_add(1);
                run.target.clone()
            } else {
                run.state = PatrolState::Running;
                None
            };
            // Low battery seen while paused: return after the current waypoint.
            if run.return_after_current {
                run.state = PatrolState::LowBattery;
            }
            regoto
        };
        if let Some(location) = regoto {
            info!(robot_id = %shared.robot_id, %location, "re-sending goto after resume");
            check_delivery(&shared.robot_id, "goto", shared.publisher.goto(&location).await);
        }
        shared.signal.notify();
        info!(robot_id = %shared.robot_id, "patrol resumed");
        shared.emit_status();
        true
    }

    /// Set the movement speed, clamped to `[0.1, 1.0]`.  Returns the value
    /// applied.
    pub fn set_speed(&self, speed: f64) -> f64 {
        let speed = if speed.is_finite() { speed.clamp(MIN_SPEED, MAX_SPEED) } else { DEFAULT_SPEED };
        self.shared.run().speed = speed;
        debug!(robot_id = %self.shared.robot_id, speed, "speed set");
        speed
    }

    /// Feed a battery reading from the robot.
    pub async fn update_battery(&self, level: u8, is_charging: bool) {
        let shared = &self.shared;
        let settings = &shared.ctx.settings;
        let change = {
            let mut run = shared.run();
            run.battery_level = Some(level);
            let active = run.state != PatrolState::Idle && !run.state.is_terminal();
            if active && !is_charging && level <= settings.low_battery_threshold && !run.is_low_battery {
                run.is_low_battery = true;
                match settings.low_battery_action {
                    LowBatteryPolicy::StopImmediately => {
                        run.pending_return = true;
                        run.awaiting_arrival = false;
                        run.state = PatrolState::LowBattery;
                    }
                    LowBatteryPolicy::CompleteCurrent => {
                        run.return_after_current = true;
                        if run.state.is_traversing() {
                            run.state = PatrolState::LowBattery;
                        }
                    }
                }
                BatteryChange::Low(settings.low_battery_action)
            } else if is_charging && run.is_low_battery {
                run.is_low_battery = false;
                if run.return_after_current && !run.pending_return {
                    run.return_after_current = false;
                    if run.state == PatrolState::LowBattery {
                        run.state = if run.awaiting_arrival {
                            PatrolState::Waiting
                        } else {
                            PatrolState::Running
                        };
                    }
                }
                BatteryChange::Recovered
            } else {
                BatteryChange::Unchanged
            }
        };

        match change {
            BatteryChange::Unchanged => {}
            BatteryChange::Recovered => {
                info!(robot_id = %shared.robot_id, level, "charging, low battery cleared");
                shared.emit_status();
            }
            BatteryChange::Low(policy) => {
                warn!(robot_id = %shared.robot_id, level, ?policy, "low battery");
                if policy == LowBatteryPolicy::StopImmediately {
                    shared.signal.request_stop();
                    check_delivery(&shared.robot_id, "stop", shared.publisher.stop_movement().await);
                }
                shared.journal(
                    ActivityLevel::Warning,
                    &format!("Low battery ({level}%), returning to {}", settings.home_base_location),
                );
                shared.emit_status();
                shared.show_low_battery_notice().await;
            }
        }
    }

    /// Feed a waypoint event from the robot.
    pub fn on_waypoint_event(&self, event: &WaypointEvent) {
        let shared = &self.shared;
        let status = event.status.as_deref().unwrap_or_default();
        match (event.kind, status) {
            (WaypointEventKind::Goto, "start") => {
                let mut run = shared.run();
                if run.awaiting_arrival {
                    run.arm_epoch = run.arm_epoch.wrapping_add(1);
                    drop(run);
                    debug!(robot_id = %shared.robot_id, location = %event.location, "goto started");
                    shared.signal.notify();
                }
            }
            (WaypointEventKind::Goto, "complete") | (WaypointEventKind::Arrived, _) => {
                let index = {
                    let mut run = shared.run();
                    let matches = run.target.as_deref().is_some_and(|target| {
                        event.location.is_empty() || target.eq_ignore_ascii_case(&event.location)
                    });
                    if !run.awaiting_arrival || !matches {
                        None
                    } else {
                        run.awaiting_arrival = false;
                        run.arrived = true;
                        Some(run.waypoint_index)
                    }
                };
                let Some(index) = index else {
                    debug!(robot_id = %shared.robot_id, location = %event.location, "ignoring unexpected arrival");
                    return;
                };
                shared.signal.notify();
                info!(robot_id = %shared.robot_id, location = %event.location, "arrived at waypoint");
                shared.journal(ActivityLevel::Info, &format!("Arrived at {}", event.location));
                shared.ctx.emit(
                    Topic::Patrol,
                    SOURCE,
                    EventPayload::WaypointReached {
                        robot_id: shared.robot_id.clone(),
                        route_id: shared.route.id.clone(),
                        waypoint: event.location.clone(),
                        index,
                    },
                );
            }
            (WaypointEventKind::Goto, "abort" | "fail" | "failed") => {
                let message = format!("failed to reach waypoint: {}", event.location);
                warn!(robot_id = %shared.robot_id, %message);
                shared.journal(ActivityLevel::Warning, &message);
                shared.ctx.emit(
                    Topic::Patrol,
                    SOURCE,
                    EventPayload::PatrolError {
                        robot_id: shared.robot_id.clone(),
                        kind: ErrorKind::Reachability,
                        message,
                    },
                );
            }
            _ => debug!(robot_id = %shared.robot_id, ?event, "waypoint event"),
        }
    }

    /// Wait for the worker to exit.  Returns immediately if it never started.
    pub async fn wait_finished(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(robot_id = %self.shared.robot_id, %err, "patrol worker panicked");
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

impl Shared {
    fn run(&self) -> MutexGuard<'_, PatrolRun> {
        lock(&self.run)
    }

    fn status(&self) -> PatrolStatus {
        let run = self.run();
        PatrolStatus {
            robot_id: self.robot_id.clone(),
            route_id: self.route.id.clone(),
            state: run.state,
            current_waypoint_index: run.waypoint_index,
            total_waypoints: self.route.waypoints.len(),
            current_waypoint: self.route.waypoints.get(run.waypoint_index).map(|w| w.name.clone()),
            current_loop: run.current_loop,
            total_loops: self.route.total_loops(),
            is_infinite_loop: self.route.is_infinite(),
            battery_level: run.battery_level,
            is_low_battery: run.is_low_battery,
            speed: run.speed,
            timestamp: Utc::now(),
        }
    }

    fn emit_status(&self) {
        self.ctx.emit(Topic::Patrol, SOURCE, EventPayload::PatrolStatus(self.status()));
    }

    fn journal(&self, level: ActivityLevel, message: &str) {
        self.ctx.journal.append_activity(&self.robot_id, level, message);
    }

    fn report_error(&self, err: &VigilError) {
        error!(robot_id = %self.robot_id, %err, "patrol failed");
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
        let outcome = self.traverse(&mut pacer).await;
        self.finish(outcome).await;
    }

    async fn traverse(&self, pacer: &mut Pacer) -> Result<Outcome, VigilError> {
        let route = &self.route;
        let mut loop_no: u32 = 0;
        loop {
            loop_no += 1;
            self.run().current_loop = loop_no;
            info!(loop_no, total = route.total_loops(), "loop started");

            for (index, waypoint) in route.waypoints.iter().enumerate() {
                if !self.wait_while_paused(pacer).await {
                    return Ok(Outcome::Interrupted);
                }
                self.run().waypoint_index = index;
                self.emit_status();

                if !self.reach(waypoint, pacer).await? {
                    return Ok(Outcome::Interrupted);
                }
                if !self.visit(index, waypoint, pacer).await {
                    return Ok(Outcome::Interrupted);
                }
                if self.run().return_after_current {
                    info!(waypoint = %waypoint.name, "waypoint finished, returning for low battery");
                    return Ok(Outcome::ReturnHome);
                }
            }

            self.run().completed_loops = loop_no;
            if pacer.is_stopped() {
                return Ok(Outcome::Interrupted);
            }
            let last_loop = u32::try_from(route.loop_count).unwrap_or(0);
            if !route.is_infinite() && loop_no >= last_loop {
                return Ok(Outcome::Completed);
            }
        }
    }

    /// Block while paused.  Returns `false` on stop.
    async fn wait_while_paused(&self, pacer: &mut Pacer) -> bool {
        loop {
            if pacer.is_stopped() {
                return false;
            }
            if self.run().state != PatrolState::Paused {
                return true;
            }
            pacer.wait_until(None).await;
        }
    }

    /// Issue the goto and wait for arrival, retrying on timeout.
    ///
    /// Returns `Ok(false)` on stop.
    async fn reach(&self, waypoint: &Waypoint, pacer: &mut Pacer) -> Result<bool, VigilError> {
        let settings = &self.ctx.settings;
        let arrival = waypoint.arrival.unwrap_or_default();
        let timeout = arrival
            .timeout_secs
            .map(secs)
            .unwrap_or_else(|| settings.waypoint_timeout());
        let max_retries = arrival.max_retries.unwrap_or(settings.waypoint_max_retries);

        if let Some(url) = settings.patrolling_webview_url.as_deref().filter(|u| !u.is_empty()) {
            check_delivery(&self.robot_id, "webview", self.publisher.show_webview(url).await);
        }

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            {
                let mut run = self.run();
                if pacer.is_stopped() {
                    return Ok(false);
                }
                run.awaiting_arrival = true;
                run.arrived = false;
                run.target = Some(waypoint.name.clone());
                run.arm_epoch = run.arm_epoch.wrapping_add(1);
                run.advance(PatrolState::Waiting);
            }
            info!(waypoint = %waypoint.name, attempt = attempts, "goto");
            check_delivery(&self.robot_id, "goto", self.publisher.goto(&waypoint.name).await);
            self.emit_status();

            match self.await_arrival(timeout, pacer).await {
                Arrival::Arrived => {
                    self.run().advance(PatrolState::Running);
                    return Ok(true);
                }
                Arrival::Stopped => return Ok(false),
                Arrival::TimedOut if attempts > max_retries => {
                    self.run().awaiting_arrival = false;
                    return Err(VigilError::Reachability {
                        waypoint: waypoint.name.clone(),
                        attempts,
                    });
                }
                Arrival::TimedOut => {
                    warn!(waypoint = %waypoint.name, attempt = attempts, max_retries, "arrival timed out, retrying");
                }
            }
        }
    }

    /// Wait for the arrival event.  Time spent paused does not count
    /// against `timeout`; a fresh goto restarts it.
    async fn await_arrival(&self, timeout: Duration, pacer: &mut Pacer) -> Arrival {
        let mut deadline = Instant::now() + timeout;
        let mut epoch = self.run().arm_epoch;
        let mut paused_at: Option<Instant> = None;
        loop {
            if pacer.is_stopped() {
                return Arrival::Stopped;
            }
            let now = Instant::now();
            let (state, arrived, arm_epoch) = {
                let run = self.run();
                (run.state, run.arrived, run.arm_epoch)
            };
            if arrived {
                return Arrival::Arrived;
            }
            if state == PatrolState::Paused {
                paused_at.get_or_insert(now);
                pacer.wait_until(None).await;
                continue;
            }
            if let Some(since) = paused_at.take() {
                deadline += now - since;
            }
            if arm_epoch != epoch {
                epoch = arm_epoch;
                deadline = now + timeout;
            }
            if pacer.wait_until(Some(deadline)).await == Wake::Deadline {
                if pacer.is_stopped() {
                    return Arrival::Stopped;
                }
                let run = self.run();
                if run.arrived {
                    return Arrival::Arrived;
                }
                if run.arm_epoch == epoch && run.state != PatrolState::Paused {
                    return Arrival::TimedOut;
                }
            }
        }
    }

    /// Post-arrival delay, detection gate and waypoint actions.
    ///
    /// Returns `false` on stop.
    async fn visit(&self, index: usize, waypoint: &Waypoint, pacer: &mut Pacer) -> bool {
        let settings = &self.ctx.settings;
        if !pacer.sleep(settings.arrival_delay()).await {
            return false;
        }

        if waypoint.detection.enabled {
            let site = GateSite {
                robot_id: &self.robot_id,
                route_id: &self.route.id,
                waypoint,
                index,
            };
            let summary = detection_gate::run(
                site,
                self.publisher.as_ref(),
                self.ctx.snapshots.as_ref(),
                settings,
                pacer,
            )
            .await;
            self.ctx.journal.append_waypoint_summary(&summary);
            self.ctx
                .emit(Topic::Detections, SOURCE, EventPayload::WaypointSummary(summary));
            if pacer.is_stopped() {
                return false;
            }
        }

        actions::perform(self.publisher.as_ref(), waypoint, settings, pacer).await
    }

    fn home_base(&self) -> &str {
        &self.ctx.settings.home_base_location
    }

    async fn finish(&self, outcome: Result<Outcome, VigilError>) {
        match outcome {
            Ok(Outcome::Completed) => {
                let destination = self
                    .route
                    .return_location
                    .as_deref()
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| self.home_base())
                    .to_string();
                let completed_loops = {
                    let mut run = self.run();
                    if run.state.is_terminal() {
                        None
                    } else {
                        run.state = PatrolState::Idle;
                        Some(run.completed_loops)
                    }
                };
                let Some(completed_loops) = completed_loops else {
                    return self.finish_interrupted().await;
                };
                info!(%destination, completed_loops, "patrol complete, returning");
                check_delivery(&self.robot_id, "goto", self.publisher.goto(&destination).await);
                self.release();
                self.journal(
                    ActivityLevel::Info,
                    &format!("Patrol complete after {completed_loops} loop(s)"),
                );
                self.emit_status();
                self.ctx.emit(
                    Topic::Patrol,
                    SOURCE,
                    EventPayload::PatrolComplete {
                        robot_id: self.robot_id.clone(),
                        route_id: self.route.id.clone(),
                        current_loop: completed_loops,
                        total_loops: self.route.total_loops(),
                    },
                );
            }
            Ok(Outcome::ReturnHome) => {
                let home = self.home_base().to_string();
                check_delivery(&self.robot_id, "goto", self.publisher.goto(&home).await);
                self.run().state = PatrolState::Stopped;
                info!(%home, "low battery return issued");
                self.release();
                self.emit_status();
            }
            Ok(Outcome::Interrupted) => self.finish_interrupted().await,
            Err(err) => {
                self.run().state = PatrolState::Error;
                self.release();
                self.report_error(&err);
            }
        }
    }

    async fn finish_interrupted(&self) {
        let mut returned = false;
        let pending_return = self.run().pending_return;
        if pending_return {
            // Let the stop-movement command settle before the return goto.
            tokio::time::sleep(secs(self.ctx.settings.low_battery_settle_secs)).await;
            let still_pending = self.run().pending_return;
            if still_pending {
                let home = self.home_base().to_string();
                check_delivery(&self.robot_id, "goto", self.publisher.goto(&home).await);
                info!(%home, "low battery return issued");
                returned = true;
            } else {
                info!("low battery return cancelled by stop");
            }
        }
        {
            let mut run = self.run();
            if !run.state.is_terminal() {
                run.state = PatrolState::Stopped;
            }
        }
        info!("patrol interrupted");
        self.release();
        if returned {
            self.emit_status();
        }
    }

    /// Run the finish hook, at most once.
    fn release(&self) {
        let hook = lock(&self.on_finish).take();
        if let Some(hook) = hook {
            hook(&FinishedRun {
                robot_id: self.robot_id.clone(),
                run_id: self.patrol_id,
                route_id: self.route.id.clone(),
                completed_loops: self.run().completed_loops,
            });
        }
    }

    async fn show_low_battery_notice(&self) {
        let Some(url) = self
            .ctx
            .settings
            .low_battery_webview_url
            .clone()
            .filter(|u| !u.is_empty())
        else {
            return;
        };
        if !check_delivery(&self.robot_id, "webview", self.publisher.show_webview(&url).await) {
            return;
        }
        let delay = secs(self.ctx.settings.webview_close_delay_secs);
        if !delay.is_zero() {
            let publisher = Arc::clone(&self.publisher);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                check_delivery(publisher.robot_id(), "webview close", publisher.close_webview().await);
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
