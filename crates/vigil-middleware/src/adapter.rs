//! The command publishing seam.
//!
//! Orchestrators never speak MQTT directly.  They drive a robot through a
//! [`CommandPublisher`], which [`RobotLink`][crate::link::RobotLink]
//! implements on top of the broker connection and tests implement with a
//! recording double.
//!
//! Only [`publish_command`][CommandPublisher::publish_command] and
//! [`publish_raw`][CommandPublisher::publish_raw] are required; every robot
//! command is a provided method that shapes the payload.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::topics::normalize_webview_url;

/// Best-effort command channel to one robot.
///
/// Every method returns `false` instead of failing when the command could not
/// be delivered; callers decide whether that matters.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Registry id of the robot behind this publisher.
    fn robot_id(&self) -> &str;

    /// Base topic (`{prefix}/{serial}`) of the robot.
    fn base_topic(&self) -> &str;

    /// Publish `payload` to `{base}/command/{category}/{command}`.
    async fn publish_command(&self, category: &str, command: &str, payload: Value) -> bool;

    /// Publish `payload` to an arbitrary topic.
    async fn publish_raw(&self, topic: &str, payload: Value) -> bool;

    // ── Navigation ────────────────────────────────────────────────────────

    async fn goto(&self, location: &str) -> bool {
        self.publish_command("waypoint", "goto", json!({ "location": location }))
            .await
    }

    async fn stop_movement(&self) -> bool {
        self.publish_command("move", "stop", json!({})).await
    }

    async fn request_reposition(&self) -> bool {
        self.publish_command("location", "reposition", json!({})).await
    }

    async fn request_waypoints(&self) -> bool {
        self.publish_command("waypoint", "fetch", json!({})).await
    }

    async fn request_position(&self) -> bool {
        self.publish_command("position", "get", json!({})).await
    }

    async fn joystick(&self, x: f64, y: f64, theta: f64) -> bool {
        self.publish_command("move", "joystick", json!({ "x": x, "y": y, "theta": theta }))
            .await
    }

    // ── Media ─────────────────────────────────────────────────────────────

    async fn speak(&self, utterance: &str) -> bool {
        self.publish_command("tts", "speak", json!({ "utterance": utterance }))
            .await
    }

    async fn show_webview(&self, url: &str) -> bool {
        let url = normalize_webview_url(url);
        self.publish_command("media", "webview", json!({ "url": url })).await
    }

    async fn close_webview(&self) -> bool {
        self.publish_command("media", "webviewclose", json!({})).await
    }

    /// Images are rendered through the webview.
    async fn show_image(&self, url: &str) -> bool {
        self.show_webview(url).await
    }

    async fn play_video(&self, url: &str) -> bool {
        self.publish_command("media", "video", json!({ "url": url })).await
    }

    /// Push a state update to a webview page that listens on
    /// `{base}/command/webview/update`.
    async fn update_webview(&self, payload: Value) -> bool {
        let topic = format!("{}/command/webview/update", self.base_topic());
        self.publish_raw(&topic, payload).await
    }

    // ── Utilities ─────────────────────────────────────────────────────────

    async fn set_volume(&self, level: u8) -> bool {
        let level = level.min(100);
        self.publish_command("audio", "setVolume", json!({ "level": level, "level_percent": level }))
            .await
    }

    /// Tilt the head camera; the robot accepts −25° to +60°.
    async fn tilt_camera(&self, degrees: i32) -> bool {
        let degrees = degrees.clamp(-25, 60);
        self.publish_command("utils", "tilt", json!({ "degrees": degrees }))
            .await
    }
}

/// Lookup of command publishers by robot id.
///
/// Implemented by [`LinkRegistry`][crate::link_registry::LinkRegistry]; the
/// patrol registry depends only on this trait.
pub trait LinkDirectory: Send + Sync {
    fn publisher(&self, robot_id: &str) -> Option<Arc<dyn CommandPublisher>>;

    fn is_connected(&self, robot_id: &str) -> bool;

    /// Robot id registered under `serial`.
    fn robot_for_serial(&self, _serial: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl CommandPublisher for Recorder {
        fn robot_id(&self) -> &str {
            "temi-1"
        }
        fn base_topic(&self) -> &str {
            "entity/001"
        }
        async fn publish_command(&self, category: &str, command: &str, payload: Value) -> bool {
            let topic = crate::topics::command_topic(self.base_topic(), category, command);
            self.publish_raw(&topic, payload).await
        }
        async fn publish_raw(&self, topic: &str, payload: Value) -> bool {
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            true
        }
    }

    #[tokio::test]
    async fn helpers_shape_payloads() {
        let r = Recorder::default();
        assert!(r.goto("lobby").await);
        assert!(r.speak("hello").await);
        assert!(r.show_image("img/a.png").await);
        assert!(r.tilt_camera(90).await);
        assert!(r.update_webview(json!({"state": "inspecting"})).await);

        let sent = r.sent.lock().unwrap();
        assert_eq!(sent[0], ("entity/001/command/waypoint/goto".into(), json!({"location": "lobby"})));
        assert_eq!(sent[1].1, json!({"utterance": "hello"}));
        assert_eq!(sent[2].0, "entity/001/command/media/webview");
        assert_eq!(sent[2].1, json!({"url": "file:///storage/emulated/0/img/a.png"}));
        assert_eq!(sent[3].1, json!({"degrees": 60}));
        assert_eq!(sent[4].0, "entity/001/command/webview/update");
    }
}
