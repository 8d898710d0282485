//! Topic scheme and inbound message parsing.
//!
//! # Robot topics
//!
//! Every robot lives under a base topic `{prefix}/{serial}`:
//!
//! | Direction | Topic |
//! |---|---|
//! | command → robot | `{base}/command/{category}/{command}` |
//! | robot → control plane | `{base}/status/#`, `{base}/event/#` |
//! | last will | `{base}/lwt` |
//!
//! # Detection topics
//!
//! The detection pipeline publishes under its own prefix:
//! `{prefix}/violations/{summary|counts|new}`, and listens for control
//! commands on `{prefix}/control/command`.

use std::collections::BTreeMap;

use serde_json::Value;

/// Default robot topic prefix.
pub const DEFAULT_ROBOT_PREFIX: &str = "entity";

/// Default detection pipeline topic prefix.
pub const DEFAULT_DETECTION_PREFIX: &str = "safety";

/// Maximum accepted inbound payload size.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Base topic for a robot serial.
pub fn base_topic(prefix: &str, serial: &str) -> String {
    format!("{prefix}/{serial}")
}

/// Topic a command is published on.
pub fn command_topic(base: &str, category: &str, command: &str) -> String {
    format!("{base}/command/{category}/{command}")
}

/// Extract the robot serial from a `{prefix}/{serial}/...` topic.
pub fn serial_of(topic: &str) -> Option<&str> {
    topic.split('/').nth(1).filter(|s| !s.is_empty())
}

/// Normalise a webview URL for the robot's on-board browser.
///
/// URLs with a scheme pass through, absolute paths become `file://` URLs
/// and anything else is resolved against the robot's shared storage.
pub fn normalize_webview_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    const PASSTHROUGH: [&str; 5] = ["http://", "https://", "file://", "data:", "content://"];
    if PASSTHROUGH.iter().any(|p| trimmed.starts_with(p)) {
        trimmed.to_string()
    } else if trimmed.starts_with('/') {
        format!("file://{trimmed}")
    } else {
        format!("file:///storage/emulated/0/{trimmed}")
    }
}

/// Decode an MQTT payload: JSON when possible, otherwise a JSON string.
pub fn decode_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ────────────────────────────────────────────────────────────────────────────
// Robot messages
// ────────────────────────────────────────────────────────────────────────────

/// Waypoint event kinds published by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaypointEventKind {
    /// Navigation status update (`start`, `complete`, `abort`, …).
    Goto,
    Arrived,
}

/// A waypoint navigation event from the robot.
#[derive(Debug, Clone, PartialEq)]
pub struct WaypointEvent {
    pub kind: WaypointEventKind,
    pub location: String,
    pub status: Option<String>,
}

/// Inbound robot traffic, classified by topic.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotMessage {
    Battery { level: u8, is_charging: bool },
    Info { waypoints: Vec<String>, battery: Option<u8> },
    /// Position with the timestamp normalised to seconds.
    Position { x: f64, y: f64, theta: f64, timestamp: f64 },
    Waypoint(WaypointEvent),
    /// Last-will announcement: the robot dropped off the broker.
    Offline,
    Other { topic: String, payload: Value },
}

impl RobotMessage {
    /// Classify a message received on `topic`.
    ///
    /// `now_secs` supplies the fallback timestamp for position samples that
    /// carry none.
    pub fn parse(topic: &str, payload: &Value, now_secs: f64) -> RobotMessage {
        let other = || RobotMessage::Other {
            topic: topic.to_string(),
            payload: payload.clone(),
        };

        if topic.ends_with("/lwt") {
            return RobotMessage::Offline;
        }
        let Some(obj) = payload.as_object() else {
            return other();
        };

        if topic.contains("/status/utils/battery") {
            return match extract_battery(payload) {
                Some(level) => RobotMessage::Battery {
                    level,
                    is_charging: obj.get("is_charging").and_then(Value::as_bool).unwrap_or(false),
                },
                None => other(),
            };
        }
        if topic.contains("/status/info") {
            let waypoints = obj
                .get("waypoint_list")
                .or_else(|| obj.get("locations"))
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            return RobotMessage::Info {
                waypoints,
                battery: extract_battery(payload),
            };
        }
        if topic.contains("/status/position") {
            let num = |key: &str| obj.get(key).and_then(as_f64).unwrap_or(0.0);
            let mut timestamp = obj.get("timestamp").and_then(as_f64).unwrap_or(now_secs);
            if timestamp > 1e11 {
                timestamp /= 1000.0;
            }
            return RobotMessage::Position {
                x: num("x"),
                y: num("y"),
                theta: num("theta"),
                timestamp,
            };
        }
        if let Some(kind) = waypoint_event_kind(topic) {
            let location = obj
                .get("location")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let status = obj.get("status").and_then(Value::as_str).map(str::to_lowercase);
            return RobotMessage::Waypoint(WaypointEvent { kind, location, status });
        }
        other()
    }
}

fn waypoint_event_kind(topic: &str) -> Option<WaypointEventKind> {
    if topic.ends_with("/event/waypoint/goto") {
        Some(WaypointEventKind::Goto)
    } else if topic.ends_with("/event/waypoint/arrived") {
        Some(WaypointEventKind::Arrived)
    } else {
        None
    }
}

/// Accept numbers and numeric strings.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a battery percentage from any of the keys robots are known to use.
pub fn extract_battery(payload: &Value) -> Option<u8> {
    const KEYS: [&str; 5] = ["percentage", "battery_percentage", "battery", "level", "percent"];
    KEYS.iter()
        .filter_map(|k| payload.get(k).and_then(as_f64))
        .next()
        .map(|v| v.clamp(0.0, 100.0) as u8)
}

// ────────────────────────────────────────────────────────────────────────────
// Detection messages
// ────────────────────────────────────────────────────────────────────────────

/// One individual violation reported by the detection pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NewViolation {
    pub event_id: Option<String>,
    pub violation_type: String,
    pub viewport: Option<String>,
    pub confidence: f64,
    /// Robot serial, when the pipeline tags its events.
    pub serial: Option<String>,
}

/// Inbound detection pipeline traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionMessage {
    /// Periodic totals; `total_people` is omitted by some pipeline builds.
    Summary {
        total_violations: i64,
        total_people: Option<i64>,
        robot_id: Option<String>,
        viewports: BTreeMap<String, Value>,
    },
    Counts {
        total_people: i64,
        total_violations: i64,
        robot_id: Option<String>,
        viewports: BTreeMap<String, Value>,
    },
    New(NewViolation),
}

impl DetectionMessage {
    /// Topic the pipeline listens on for start/stop commands.
    pub fn control_topic(prefix: &str) -> String {
        format!("{prefix}/control/command")
    }

    /// Topics the control plane subscribes to.
    pub fn subscriptions(prefix: &str) -> Vec<String> {
        ["summary", "counts", "new"]
            .iter()
            .map(|kind| format!("{prefix}/violations/{kind}"))
            .collect()
    }

    /// Parse a detection message; `None` for unrelated topics or payloads.
    pub fn parse(prefix: &str, topic: &str, payload: &Value) -> Option<DetectionMessage> {
        let kind = topic.strip_prefix(prefix)?.strip_prefix("/violations/")?;
        let obj = payload.as_object()?;
        let opt_int = |key: &str| obj.get(key).and_then(as_f64).map(|v| v as i64);
        let int = |key: &str| opt_int(key).unwrap_or(0);
        let robot_id = || match obj.get("robot_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let viewports = || {
            obj.get("viewports")
                .and_then(Value::as_object)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        match kind {
            "summary" => Some(DetectionMessage::Summary {
                total_violations: int("total_violations"),
                total_people: opt_int("total_people"),
                robot_id: robot_id(),
                viewports: viewports(),
            }),
            "counts" => Some(DetectionMessage::Counts {
                total_people: int("total_people"),
                total_violations: int("total_violations"),
                robot_id: robot_id(),
                viewports: viewports(),
            }),
            "new" => Some(DetectionMessage::New(NewViolation {
                event_id: obj.get("event_id").map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
                violation_type: obj
                    .get("violation_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                viewport: obj.get("viewport").and_then(Value::as_str).map(str::to_string),
                confidence: obj.get("confidence").and_then(as_f64).unwrap_or(0.0),
                serial: obj.get("serial").and_then(Value::as_str).map(str::to_string),
            })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn webview_urls_are_normalised() {
        assert_eq!(normalize_webview_url("https://x.io/a"), "https://x.io/a");
        assert_eq!(normalize_webview_url("data:text/html;base64,AA"), "data:text/html;base64,AA");
        assert_eq!(normalize_webview_url("/sdcard/a.htm"), "file:///sdcard/a.htm");
        assert_eq!(
            normalize_webview_url(" screens/a.htm "),
            "file:///storage/emulated/0/screens/a.htm"
        );
        assert_eq!(normalize_webview_url(""), "");
    }

    #[test]
    fn command_topic_layout() {
        let base = base_topic("entity", "00120");
        assert_eq!(command_topic(&base, "waypoint", "goto"), "entity/00120/command/waypoint/goto");
        assert_eq!(serial_of("entity/00120/status/position"), Some("00120"));
    }

    #[test]
    fn battery_accepts_alternate_keys() {
        let msg = RobotMessage::parse(
            "entity/1/status/utils/battery",
            &json!({"battery_percentage": "42", "is_charging": true}),
            0.0,
        );
        assert_eq!(msg, RobotMessage::Battery { level: 42, is_charging: true });
    }

    #[test]
    fn battery_without_level_is_other() {
        let msg = RobotMessage::parse("entity/1/status/utils/battery", &json!({"x": 1}), 0.0);
        assert!(matches!(msg, RobotMessage::Other { .. }));
    }

    #[test]
    fn position_millisecond_timestamps_become_seconds() {
        let msg = RobotMessage::parse(
            "entity/1/status/position",
            &json!({"x": 1.5, "y": "2", "theta": 0.1, "timestamp": 1_700_000_000_000.0_f64}),
            5.0,
        );
        match msg {
            RobotMessage::Position { x, y, timestamp, .. } => {
                assert_eq!(x, 1.5);
                assert_eq!(y, 2.0);
                assert!((timestamp - 1_700_000_000.0).abs() < 1e-3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn waypoint_events_are_classified() {
        let msg = RobotMessage::parse(
            "entity/1/event/waypoint/goto",
            &json!({"location": "lobby", "status": "COMPLETE"}),
            0.0,
        );
        assert_eq!(
            msg,
            RobotMessage::Waypoint(WaypointEvent {
                kind: WaypointEventKind::Goto,
                location: "lobby".to_string(),
                status: Some("complete".to_string()),
            })
        );
        assert_eq!(RobotMessage::parse("entity/1/lwt", &json!({}), 0.0), RobotMessage::Offline);
    }

    #[test]
    fn info_lists_waypoints() {
        let msg = RobotMessage::parse(
            "entity/1/status/info",
            &json!({"locations": ["a", "b"], "level": 77}),
            0.0,
        );
        assert_eq!(
            msg,
            RobotMessage::Info { waypoints: vec!["a".into(), "b".into()], battery: Some(77) }
        );
    }

    #[test]
    fn detection_summary_keeps_missing_people_unset() {
        let summary = DetectionMessage::parse(
            "safety",
            "safety/violations/summary",
            &json!({"total_violations": 2, "robot_id": 4}),
        );
        assert_eq!(
            summary,
            Some(DetectionMessage::Summary {
                total_violations: 2,
                total_people: None,
                robot_id: Some("4".into()),
                viewports: BTreeMap::new(),
            })
        );
        assert!(DetectionMessage::parse("safety", "other/violations/summary", &json!({})).is_none());
    }

    #[test]
    fn detection_counts_and_new_violation() {
        let counts = DetectionMessage::parse(
            "safety",
            "safety/violations/counts",
            &json!({"total_people": 3, "total_violations": 7, "viewports": {"front": {"violations": 7}}}),
        );
        assert!(matches!(
            counts,
            Some(DetectionMessage::Counts { total_people: 3, total_violations: 7, ref viewports, .. }) if viewports.contains_key("front")
        ));

        let new = DetectionMessage::parse(
            "safety",
            "safety/violations/new",
            &json!({"violation_type": "no_helmet", "confidence": 0.91, "event_id": 12}),
        );
        match new {
            Some(DetectionMessage::New(v)) => {
                assert_eq!(v.violation_type, "no_helmet");
                assert_eq!(v.event_id.as_deref(), Some("12"));
                assert!((v.confidence - 0.91).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(DetectionMessage::parse("safety", "other/violations/new", &json!({})).is_none());
    }
}
