//! Patrol routes and their waypoints.
//!
//! A [`Route`] is an ordered list of [`Waypoint`]s that one robot traverses
//! for `loop_count` loops (`<= 0` means forever).  Each waypoint carries the
//! actions performed on arrival and an optional [`DetectionConfig`] that
//! turns on the detection gate for that stop.
//!
//! All durations are expressed in seconds (`f64`) so routes can be written
//! by hand in TOML; use [`secs`] to turn them into a [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Convert a configured number of seconds into a [`Duration`].
///
/// Negative, NaN and infinite values collapse to zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Route
// ────────────────────────────────────────────────────────────────────────────

/// A named patrol route owned by one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    /// Robot this route belongs to.
    pub robot_id: String,
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    /// Number of loops to run; `0` or negative loops forever.
    #[serde(default = "default_loop_count")]
    pub loop_count: i32,
    /// Where the robot goes after the last loop.  Falls back to the home
    /// base location from the patrol settings.
    #[serde(default)]
    pub return_location: Option<String>,
}

fn default_loop_count() -> i32 {
    1
}

impl Route {
    /// `true` when the route never terminates on its own.
    pub fn is_infinite(&self) -> bool {
        self.loop_count <= 0
    }

    /// Loop count as reported in status payloads (`-1` when infinite).
    pub fn total_loops(&self) -> i32 {
        if self.is_infinite() { -1 } else { self.loop_count }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Waypoint
// ────────────────────────────────────────────────────────────────────────────

/// A single stop on a [`Route`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Location name as known by the robot's map.
    pub name: String,
    #[serde(default)]
    pub sequence: usize,
    /// What to put on the robot's screen after arrival.
    #[serde(default)]
    pub display: Option<DisplayAction>,
    /// Utterance spoken after arrival.
    #[serde(default)]
    pub speech: Option<String>,
    /// Close a webview display after this many seconds.
    #[serde(default)]
    pub auto_close_secs: Option<f64>,
    /// Time spent at the waypoint once its actions are done.
    #[serde(default = "default_dwell_secs")]
    pub dwell_secs: f64,
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Per-waypoint arrival timeout and retry override.
    #[serde(default)]
    pub arrival: Option<ArrivalOverride>,
    /// Settings used when the route runs as an inspection.
    #[serde(default)]
    pub inspection: InspectionStep,
}

fn default_dwell_secs() -> f64 {
    5.0
}

impl Waypoint {
    /// A waypoint with no actions and the default dwell.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence: 0,
            display: None,
            speech: None,
            auto_close_secs: None,
            dwell_secs: default_dwell_secs(),
            detection: DetectionConfig::default(),
            arrival: None,
            inspection: InspectionStep::default(),
        }
    }
}

/// Kind of content shown on the robot's display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    /// Plain text rendered as an HTML page.
    Text,
    Image,
    Webview,
    Video,
}

/// A display action: kind plus content (text body or URL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayAction {
    pub kind: DisplayKind,
    pub content: String,
}

/// Arrival wait override for a single waypoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrivalOverride {
    pub timeout_secs: Option<f64>,
    pub max_retries: Option<u32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Detection gate configuration
// ────────────────────────────────────────────────────────────────────────────

/// Response executed once when the detection gate sees a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Tts,
    Webview,
    Video,
}

impl ViolationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationAction::Tts => "tts",
            ViolationAction::Webview => "webview",
            ViolationAction::Video => "video",
        }
    }
}

/// Per-waypoint detection gate settings.  Unset fields fall back to the
/// patrol settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Overall gate timeout.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// How long the feed must stay clean before the gate passes.
    #[serde(default)]
    pub no_violation_secs: Option<f64>,
    #[serde(default)]
    pub action: Option<ViolationAction>,
    /// Speech used by the `tts` action.
    #[serde(default)]
    pub message: Option<String>,
    /// URL used by the `webview` and `video` actions.
    #[serde(default)]
    pub content: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Inspection step
// ────────────────────────────────────────────────────────────────────────────

/// Inspection parameters of a waypoint.  `{waypoint}` and `{count}` are
/// substituted in the speech templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionStep {
    #[serde(default = "default_checking_secs")]
    pub checking_secs: f64,
    #[serde(default = "default_tts_start")]
    pub tts_start: String,
    #[serde(default = "default_tts_no_violation")]
    pub tts_no_violation: String,
    #[serde(default = "default_tts_violation")]
    pub tts_violation: String,
}

fn default_checking_secs() -> f64 {
    30.0
}
fn default_tts_start() -> String {
    "Starting inspection".to_string()
}
fn default_tts_no_violation() -> String {
    "No violations detected".to_string()
}
fn default_tts_violation() -> String {
    "Violations detected: {count}".to_string()
}

impl Default for InspectionStep {
    fn default() -> Self {
        Self {
            checking_secs: default_checking_secs(),
            tts_start: default_tts_start(),
            tts_no_violation: default_tts_no_violation(),
            tts_violation: default_tts_violation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_clamps_invalid_values() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn total_loops_is_negative_for_infinite_routes() {
        let route = Route {
            id: "r1".to_string(),
            name: "Lobby".to_string(),
            robot_id: "temi-1".to_string(),
            waypoints: vec![Waypoint::named("a")],
            loop_count: 0,
            return_location: None,
        };
        assert!(route.is_infinite());
        assert_eq!(route.total_loops(), -1);
    }

    #[test]
    fn waypoint_defaults_from_toml() {
        let wp: Waypoint = toml::from_str(
            r#"
            name = "entrance"
            speech = "Welcome"
            [display]
            kind = "webview"
            content = "screens/welcome.htm"
            [detection]
            enabled = true
            action = "video"
            "#,
        )
        .expect("waypoint parses");
        assert_eq!(wp.dwell_secs, 5.0);
        assert_eq!(wp.display.as_ref().map(|d| d.kind), Some(DisplayKind::Webview));
        assert!(wp.detection.enabled);
        assert_eq!(wp.detection.action, Some(ViolationAction::Video));
        assert_eq!(wp.inspection.checking_secs, 30.0);
    }
}
