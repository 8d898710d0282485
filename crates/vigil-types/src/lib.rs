//! `vigil-types` – shared domain model for the Vigil patrol control plane.
//!
//! # Modules
//!
//! - [`route`] – [`Route`], [`Waypoint`] and their per-stop action and
//!   detection configuration.
//! - [`settings`] – [`PatrolSettings`], the fleet-wide tunables with serde
//!   defaults.
//!
//! The crate root holds the run states, the detection snapshot, the event
//! envelope routed over the bus, and the [`VigilError`] taxonomy.

pub mod route;
pub mod settings;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use route::{
    ArrivalOverride, DetectionConfig, DisplayAction, DisplayKind, InspectionStep, Route,
    ViolationAction, Waypoint, secs,
};
pub use settings::{LowBatteryPolicy, PatrolSettings};

// ────────────────────────────────────────────────────────────────────────────
// States
// ────────────────────────────────────────────────────────────────────────────

/// Connection state of one robot link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// State of a patrol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatrolState {
    Idle,
    Running,
    Paused,
    /// Goto issued, waiting for the arrival event.
    Waiting,
    /// Battery below threshold; the run is heading home.
    LowBattery,
    Stopped,
    Error,
}

impl PatrolState {
    /// `Stopped` and `Error` end a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, PatrolState::Stopped | PatrolState::Error)
    }

    /// States a worker is actively traversing waypoints in.
    pub fn is_traversing(self) -> bool {
        matches!(self, PatrolState::Running | PatrolState::Waiting)
    }

    pub fn can_pause(self) -> bool {
        self.is_traversing()
    }

    pub fn can_stop(self) -> bool {
        !matches!(self, PatrolState::Idle) && !self.is_terminal()
    }
}

/// State of an inspection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionState {
    Idle,
    CheckingPipeline,
    StartingPipeline,
    Running,
    MovingToWaypoint,
    Inspecting,
    WaypointComplete,
    Completed,
    Stopped,
    Error,
}

impl InspectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InspectionState::Completed | InspectionState::Stopped | InspectionState::Error
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Detection snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Live aggregate published by the detection pipeline, already clamped so
/// that `total_violations <= total_people`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationSnapshot {
    pub enabled: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    /// `None` until the pipeline has reported at least once.
    pub total_violations: Option<u32>,
    pub total_people: u32,
    /// Per-viewport breakdown keyed by viewport name (front, right, back, left).
    pub viewports: BTreeMap<String, serde_json::Value>,
}

impl ViolationSnapshot {
    pub fn violations(&self) -> u32 {
        self.total_violations.unwrap_or(0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of a patrol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolStatus {
    pub robot_id: String,
    pub route_id: String,
    pub state: PatrolState,
    pub current_waypoint_index: usize,
    pub total_waypoints: usize,
    pub current_waypoint: Option<String>,
    pub current_loop: u32,
    /// `-1` when the route loops forever.
    pub total_loops: i32,
    pub is_infinite_loop: bool,
    pub battery_level: Option<u8>,
    pub is_low_battery: bool,
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one detection gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointSummary {
    pub robot_id: String,
    pub route_id: String,
    pub waypoint: String,
    pub waypoint_index: usize,
    pub timestamp: DateTime<Utc>,
    pub total_people: u32,
    pub total_violations: u32,
    pub total_compliant: u32,
    pub viewports: BTreeMap<String, serde_json::Value>,
    /// e.g. `tts_ok`, `webview_failed`, `video_skipped`.
    pub action_taken: Option<String>,
    /// `violations_detected`, `timeout`, both comma-joined, or empty.
    pub notes: String,
}

/// A debounced violation that cleared the report threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub robot_id: String,
    pub patrol_id: Uuid,
    pub waypoint_index: usize,
    pub waypoint: Option<String>,
    pub violation_type: String,
    pub confidence: f64,
    pub viewport: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Signal-processing totals of a finished patrol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolSummary {
    pub robot_id: String,
    pub patrol_id: Uuid,
    pub route_id: String,
    pub completed_loops: u32,
    pub observations: u64,
    pub triggers: u64,
    pub effectiveness: f64,
    pub finished_at: DateTime<Utc>,
}

/// Result of inspecting one waypoint, taken from the last sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionResult {
    pub robot_id: String,
    pub waypoint: String,
    pub violations: u32,
    pub people: u32,
    pub viewports: BTreeMap<String, serde_json::Value>,
    pub violation_found: bool,
    pub duration_secs: f64,
}

/// Activity log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "vigil-runtime::orchestrator"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    PatrolStatus(PatrolStatus),
    WaypointReached {
        robot_id: String,
        route_id: String,
        waypoint: String,
        index: usize,
    },
    WaypointSummary(WaypointSummary),
    PatrolComplete {
        robot_id: String,
        route_id: String,
        current_loop: u32,
        total_loops: i32,
    },
    PatrolError {
        robot_id: String,
        kind: ErrorKind,
        message: String,
    },
    InspectionStatus {
        robot_id: String,
        state: InspectionState,
        current_waypoint_index: usize,
        total_waypoints: usize,
    },
    InspectionResult(InspectionResult),
    InspectionComplete {
        robot_id: String,
        waypoints_inspected: usize,
        total_violations: u32,
        total_people: u32,
    },
    ViolationReported(ViolationRecord),
    Battery {
        robot_id: String,
        level: u8,
        is_charging: bool,
    },
    ConnectionChanged {
        robot_id: String,
        state: ConnectionState,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Coarse error class carried by [`EventPayload::PatrolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Reachability,
    Pipeline,
    Transport,
    Internal,
    Registry,
}

/// Global error type spanning route configuration, robot connectivity,
/// navigation and the detection pipeline.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VigilError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Configuration Error: route '{0}' has no waypoints")]
    NoWaypoints(String),

    #[error("Connectivity Error: {0}")]
    Connectivity(String),

    #[error("Reachability Error: waypoint '{waypoint}' not reached after {attempts} attempt(s)")]
    Reachability { waypoint: String, attempts: u32 },

    #[error("Pipeline Error: {0}")]
    Pipeline(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Internal Error: {0}")]
    Internal(String),

    #[error("robot '{0}' already has an active patrol")]
    AlreadyActive(String),

    #[error("robot '{0}' is not connected")]
    NotConnected(String),

    #[error("unknown robot '{0}'")]
    UnknownRobot(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl VigilError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::Configuration(_) | VigilError::NoWaypoints(_) => ErrorKind::Configuration,
            VigilError::Connectivity(_) => ErrorKind::Connectivity,
            VigilError::Reachability { .. } => ErrorKind::Reachability,
            VigilError::Pipeline(_) => ErrorKind::Pipeline,
            VigilError::Transport(_) | VigilError::Serialization(_) => ErrorKind::Transport,
            VigilError::Internal(_) => ErrorKind::Internal,
            VigilError::AlreadyActive(_)
            | VigilError::NotConnected(_)
            | VigilError::UnknownRobot(_) => ErrorKind::Registry,
        }
    }
}
