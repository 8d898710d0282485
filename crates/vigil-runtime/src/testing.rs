//! Test doubles shared by the runtime's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use vigil_middleware::topics::command_topic;
use vigil_middleware::{CommandPublisher, LinkDirectory};
use vigil_types::{ActivityLevel, PatrolSettings, Route, ViolationRecord, Waypoint, WaypointSummary};

use crate::collaborators::PatrolJournal;

/// Captures every command instead of sending it.
pub(crate) struct RecordingPublisher {
    robot_id: String,
    base: String,
    sent: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn new() -> Arc<Self> {
        Self::for_robot("temi-1", "entity/001")
    }

    pub(crate) fn for_robot(robot_id: &str, base: &str) -> Arc<Self> {
        Arc::new(Self {
            robot_id: robot_id.to_string(),
            base: base.to_string(),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    /// Make every publish report failure (still recorded).
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub(crate) fn payloads(&self, suffix: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t.ends_with(suffix))
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub(crate) fn count(&self, suffix: &str) -> usize {
        self.payloads(suffix).len()
    }

    /// Locations of every goto, in order.
    pub(crate) fn gotos(&self) -> Vec<String> {
        self.payloads("waypoint/goto")
            .iter()
            .filter_map(|p| p["location"].as_str().map(str::to_string))
            .collect()
    }

    /// Yield (advancing paused time) until at least `n` gotos were sent.
    pub(crate) async fn wait_for_gotos(&self, n: usize) {
        while self.count("waypoint/goto") < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl CommandPublisher for RecordingPublisher {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    fn base_topic(&self) -> &str {
        &self.base
    }

    async fn publish_command(&self, category: &str, command: &str, payload: Value) -> bool {
        let topic = command_topic(&self.base, category, command);
        self.publish_raw(&topic, payload).await
    }

    async fn publish_raw(&self, topic: &str, payload: Value) -> bool {
        self.sent.lock().unwrap().push((topic.to_string(), payload));
        !self.failing.load(Ordering::SeqCst)
    }
}

/// In-memory [`LinkDirectory`].
#[derive(Default)]
pub(crate) struct FakeLinks {
    links: Mutex<HashMap<String, (Arc<RecordingPublisher>, bool, String)>>,
}

impl FakeLinks {
    pub(crate) fn with(robot_id: &str, serial: &str, connected: bool) -> (Arc<Self>, Arc<RecordingPublisher>) {
        let links = Arc::new(Self::default());
        let publisher = links.add(robot_id, serial, connected);
        (links, publisher)
    }

    pub(crate) fn add(&self, robot_id: &str, serial: &str, connected: bool) -> Arc<RecordingPublisher> {
        let publisher = RecordingPublisher::for_robot(robot_id, &format!("entity/{serial}"));
        self.links.lock().unwrap().insert(
            robot_id.to_string(),
            (Arc::clone(&publisher), connected, serial.to_string()),
        );
        publisher
    }
}

impl LinkDirectory for FakeLinks {
    fn publisher(&self, robot_id: &str) -> Option<Arc<dyn CommandPublisher>> {
        self.links
            .lock()
            .unwrap()
            .get(robot_id)
            .map(|(p, _, _)| Arc::clone(p) as Arc<dyn CommandPublisher>)
    }

    fn is_connected(&self, robot_id: &str) -> bool {
        self.links.lock().unwrap().get(robot_id).is_some_and(|(_, c, _)| *c)
    }

    fn robot_for_serial(&self, serial: &str) -> Option<String> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|(_, (_, _, s))| s == serial)
            .map(|(id, _)| id.clone())
    }
}

/// Journal that keeps everything it is given.
#[derive(Default)]
pub(crate) struct RecordingJournal {
    pub(crate) activity: Mutex<Vec<(String, ActivityLevel, String)>>,
    pub(crate) violations: Mutex<Vec<ViolationRecord>>,
    pub(crate) summaries: Mutex<Vec<WaypointSummary>>,
}

impl PatrolJournal for RecordingJournal {
    fn append_activity(&self, robot_id: &str, level: ActivityLevel, message: &str) {
        self.activity
            .lock()
            .unwrap()
            .push((robot_id.to_string(), level, message.to_string()));
    }

    fn append_violation(&self, record: &ViolationRecord) {
        self.violations.lock().unwrap().push(record.clone());
    }

    fn append_waypoint_summary(&self, summary: &WaypointSummary) {
        self.summaries.lock().unwrap().push(summary.clone());
    }
}

/// Settings with every action wait set to zero.
pub(crate) fn quick_settings() -> PatrolSettings {
    PatrolSettings {
        arrival_delay_secs: 0.0,
        tts_wait_secs: 0.0,
        display_wait_secs: 0.0,
        ..Default::default()
    }
}

/// A route over `names` with no dwell.
pub(crate) fn route(names: &[&str], loop_count: i32) -> Route {
    Route {
        id: "lobby".into(),
        name: "Lobby loop".into(),
        robot_id: "temi-1".into(),
        waypoints: names
            .iter()
            .enumerate()
            .map(|(i, name)| Waypoint {
                sequence: i,
                dwell_secs: 0.0,
                ..Waypoint::named(*name)
            })
            .collect(),
        loop_count,
        return_location: None,
    }
}
