//! Telemetry Router – turns inbound broker traffic into registry calls.
//!
//! | Inbound | Goes to |
//! |---|---|
//! | detection summary / counts | [`DetectionAggregator::apply`] (the clamp stage) |
//! | detection `new` violation | [`PatrolRegistry::report_violation`] |
//! | robot battery | `Telemetry` bus lane and [`PatrolRegistry::update_battery`] |
//! | robot waypoint event | [`PatrolRegistry::on_waypoint_event`] |
//! | robot position | [`PositionTracker`] |
//! | robot info / offline | activity journal |
//!
//! Messages from the detection broker carry the pseudo robot id
//! [`CLOUD_ID`]; robot telemetry relayed through that broker is attributed
//! to a robot by the serial in its topic.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_middleware::cloud::CLOUD_ID;
use vigil_middleware::topics::serial_of;
use vigil_middleware::{
    DetectionMessage, EventBus, InboundMessage, LinkDirectory, NewViolation, RobotMessage, Topic,
};
use vigil_perception::{
    CountsUpdate, DetectionAggregator, PositionSample, PositionTracker, SnapshotSource,
    shared_source,
};
use vigil_perception::position::DEFAULT_HISTORY;
use vigil_types::{ActivityLevel, Event, EventPayload};

use crate::collaborators::PatrolJournal;
use crate::registry::PatrolRegistry;

const SOURCE: &str = "vigil-runtime::router";

pub struct TelemetryRouter {
    registry: Arc<PatrolRegistry>,
    links: Arc<dyn LinkDirectory>,
    aggregator: Arc<Mutex<DetectionAggregator>>,
    positions: Arc<PositionTracker>,
    bus: EventBus,
    journal: Arc<dyn PatrolJournal>,
    detection_prefix: String,
}

impl TelemetryRouter {
    pub fn new(
        registry: Arc<PatrolRegistry>,
        links: Arc<dyn LinkDirectory>,
        detection_prefix: impl Into<String>,
    ) -> Self {
        let bus = registry.context().bus.clone();
        let journal = Arc::clone(&registry.context().journal);
        Self {
            registry,
            links,
            aggregator: Arc::new(Mutex::new(DetectionAggregator::new())),
            positions: Arc::new(PositionTracker::new(DEFAULT_HISTORY)),
            bus,
            journal,
            detection_prefix: detection_prefix.into(),
        }
    }

    /// Use an existing aggregator, e.g. the one behind the registry's
    /// snapshot source.
    pub fn with_aggregator(mut self, aggregator: Arc<Mutex<DetectionAggregator>>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_positions(mut self, positions: Arc<PositionTracker>) -> Self {
        self.positions = positions;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn PatrolJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn aggregator(&self) -> &Arc<Mutex<DetectionAggregator>> {
        &self.aggregator
    }

    /// Snapshot source backed by this router's aggregator.
    pub fn snapshot_source(&self) -> Arc<dyn SnapshotSource> {
        shared_source(Arc::clone(&self.aggregator))
    }

    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.positions
    }

    /// Route one inbound message.
    pub async fn handle(&self, message: InboundMessage) {
        if message.robot_id != CLOUD_ID {
            self.on_robot(&message.robot_id, &message.topic, &message.payload)
                .await;
            return;
        }
        if let Some(detection) =
            DetectionMessage::parse(&self.detection_prefix, &message.topic, &message.payload)
        {
            self.on_detection(detection);
            return;
        }
        match serial_of(&message.topic).and_then(|serial| self.links.robot_for_serial(serial)) {
            Some(robot_id) => {
                self.on_robot(&robot_id, &message.topic, &message.payload)
                    .await
            }
            None => debug!(topic = %message.topic, "unattributed cloud message"),
        }
    }

    /// Drain `inbound` on a background task until the channel closes.
    pub fn spawn(self: Arc<Self>, mut inbound: broadcast::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(message) => self.handle(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "telemetry router lagging, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("telemetry router stopped");
        })
    }

    fn on_detection(&self, message: DetectionMessage) {
        let update = match message {
            DetectionMessage::Summary {
                total_violations,
                total_people,
                robot_id,
                viewports,
            } => CountsUpdate {
                total_violations,
                total_people,
                robot_id,
                viewports,
            },
            DetectionMessage::Counts {
                total_people,
                total_violations,
                robot_id,
                viewports,
            } => CountsUpdate {
                total_violations,
                total_people: Some(total_people),
                robot_id,
                viewports,
            },
            DetectionMessage::New(violation) => {
                self.on_new_violation(&violation);
                return;
            }
        };
        let snapshot = lock(&self.aggregator).apply(update, Utc::now());
        debug!(
            violations = snapshot.violations(),
            people = snapshot.total_people,
            "detection snapshot updated"
        );
    }

    /// Attribute a violation to a robot by serial, falling back to the only
    /// robot with an active run.
    fn on_new_violation(&self, violation: &NewViolation) {
        let robot_id = violation
            .serial
            .as_deref()
            .and_then(|serial| self.links.robot_for_serial(serial))
            .or_else(|| {
                let mut active = self.registry.active_robots();
                if active.len() == 1 { active.pop() } else { None }
            });
        let Some(robot_id) = robot_id else {
            debug!(violation_type = %violation.violation_type, "violation without an active patrol");
            return;
        };
        self.registry.report_violation(&robot_id, violation, Utc::now());
    }

    async fn on_robot(&self, robot_id: &str, topic: &str, payload: &serde_json::Value) {
        let now_secs = Utc::now().timestamp_millis() as f64 / 1000.0;
        match RobotMessage::parse(topic, payload, now_secs) {
            RobotMessage::Battery { level, is_charging } => {
                debug!(%robot_id, level, is_charging, "battery");
                self.bus.publish_to(
                    Topic::Telemetry,
                    Event::new(
                        SOURCE,
                        EventPayload::Battery {
                            robot_id: robot_id.to_string(),
                            level,
                            is_charging,
                        },
                    ),
                );
                self.registry.update_battery(robot_id, level, is_charging).await;
            }
            RobotMessage::Position { x, y, theta, timestamp } => {
                self.positions
                    .update(robot_id, PositionSample { x, y, theta, timestamp });
            }
            RobotMessage::Waypoint(event) => {
                debug!(%robot_id, ?event, "waypoint event");
                self.registry.on_waypoint_event(robot_id, &event);
            }
            RobotMessage::Info { waypoints, battery } => {
                info!(%robot_id, waypoints = waypoints.len(), ?battery, "robot info");
                self.journal.append_activity(
                    robot_id,
                    ActivityLevel::Info,
                    &format!("Robot reported {} waypoint(s)", waypoints.len()),
                );
            }
            RobotMessage::Offline => {
                warn!(%robot_id, "robot went offline");
                self.journal
                    .append_activity(robot_id, ActivityLevel::Warning, "Robot went offline");
            }
            RobotMessage::Other { topic, .. } => debug!(%robot_id, %topic, "unhandled robot message"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
