//! Fleet-wide patrol settings.
//!
//! Every field has a serde default so a partial `[settings]` table (or none
//! at all) yields a usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::route::{ViolationAction, secs};

/// What to do when the battery drops below the threshold mid-patrol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowBatteryPolicy {
    /// Finish the current waypoint, then head to the return location.
    #[default]
    CompleteCurrent,
    /// Stop movement now and head to the return location.
    StopImmediately,
}

/// Tunables shared by every patrol and inspection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolSettings {
    // ── Arrival ───────────────────────────────────────────────────────────
    pub waypoint_timeout_secs: f64,
    pub waypoint_max_retries: u32,
    pub arrival_delay_secs: f64,

    // ── Actions ───────────────────────────────────────────────────────────
    pub tts_wait_secs: f64,
    pub display_wait_secs: f64,
    /// Global webview auto-close delay; `0` keeps the webview open.
    pub webview_close_delay_secs: f64,
    pub patrolling_webview_url: Option<String>,

    // ── Battery ───────────────────────────────────────────────────────────
    pub low_battery_threshold: u8,
    pub low_battery_action: LowBatteryPolicy,
    pub low_battery_webview_url: Option<String>,
    pub low_battery_settle_secs: f64,
    pub home_base_location: String,

    // ── Detection gate ────────────────────────────────────────────────────
    pub detection_timeout_secs: f64,
    pub no_violation_secs: f64,
    pub detection_poll_ms: u64,
    pub violation_action: ViolationAction,
    pub violation_tts: String,
    pub violation_webview_url: Option<String>,
    pub violation_display_content: Option<String>,
    pub no_violation_webview_url: Option<String>,
    pub no_violation_tts: Option<String>,

    // ── Inspection ────────────────────────────────────────────────────────
    pub pipeline_start_timeout_secs: f64,
    pub pipeline_liveness_secs: f64,
    pub inspection_arrival_wait_secs: f64,
    pub inspection_sample_secs: f64,
    pub inspection_webview_url: String,
}

impl Default for PatrolSettings {
    fn default() -> Self {
        Self {
            waypoint_timeout_secs: 60.0,
            waypoint_max_retries: 2,
            arrival_delay_secs: 2.0,
            tts_wait_secs: 3.0,
            display_wait_secs: 2.0,
            webview_close_delay_secs: 0.0,
            patrolling_webview_url: None,
            low_battery_threshold: 10,
            low_battery_action: LowBatteryPolicy::default(),
            low_battery_webview_url: None,
            low_battery_settle_secs: 1.0,
            home_base_location: "home base".to_string(),
            detection_timeout_secs: 30.0,
            no_violation_secs: 5.0,
            detection_poll_ms: 500,
            violation_action: ViolationAction::Tts,
            violation_tts: "Please follow safety protocols and wear proper PPE.".to_string(),
            violation_webview_url: None,
            violation_display_content: None,
            no_violation_webview_url: None,
            no_violation_tts: None,
            pipeline_start_timeout_secs: 30.0,
            pipeline_liveness_secs: 10.0,
            inspection_arrival_wait_secs: 10.0,
            inspection_sample_secs: 2.0,
            inspection_webview_url: "file:///storage/emulated/0/screens/InspectionStatus.htm"
                .to_string(),
        }
    }
}

impl PatrolSettings {
    pub fn waypoint_timeout(&self) -> Duration {
        secs(self.waypoint_timeout_secs)
    }

    pub fn arrival_delay(&self) -> Duration {
        secs(self.arrival_delay_secs)
    }

    pub fn detection_poll(&self) -> Duration {
        Duration::from_millis(self.detection_poll_ms.max(1))
    }

    pub fn pipeline_start_timeout(&self) -> Duration {
        secs(self.pipeline_start_timeout_secs)
    }

    pub fn pipeline_liveness(&self) -> Duration {
        secs(self.pipeline_liveness_secs)
    }
}
