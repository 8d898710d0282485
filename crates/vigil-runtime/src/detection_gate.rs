//! Per-waypoint detection gate.
//!
//! After arriving at a waypoint with detection enabled, the orchestrator
//! polls the live detection snapshot until either
//!
//! - no violation has been seen for the grace period, or
//! - the overall detection timeout elapses.
//!
//! The first violation seen triggers the configured response exactly once.
//! A clean gate shows the no-violation webview and speech.  Either way a
//! [`WaypointSummary`] is produced from the last snapshot.

use chrono::Utc;
use tokio::time::Instant;
use tracing::info;
use vigil_middleware::CommandPublisher;
use vigil_perception::SnapshotSource;
use vigil_types::{PatrolSettings, ViolationSnapshot, Waypoint, WaypointSummary, secs};

use crate::actions::{self, check_delivery};
use crate::pacing::Pacer;

/// Where the gate is running.
pub(crate) struct GateSite<'a> {
    pub robot_id: &'a str,
    pub route_id: &'a str,
    pub waypoint: &'a Waypoint,
    pub index: usize,
}

pub(crate) async fn run(
    site: GateSite<'_>,
    publisher: &dyn CommandPublisher,
    snapshots: &dyn SnapshotSource,
    settings: &PatrolSettings,
    pacer: &mut Pacer,
) -> WaypointSummary {
    let detection = &site.waypoint.detection;
    let timeout = detection
        .timeout_secs
        .map(secs)
        .unwrap_or_else(|| secs(settings.detection_timeout_secs));
    let grace = detection
        .no_violation_secs
        .map(secs)
        .unwrap_or_else(|| secs(settings.no_violation_secs));
    info!(
        robot_id = %site.robot_id,
        waypoint = %site.waypoint.name,
        ?timeout,
        "detection gate open"
    );

    let started = Instant::now();
    let mut clear_since: Option<Instant> = None;
    let mut last = ViolationSnapshot::default();
    let mut violations_seen = false;
    let mut action_taken: Option<String> = None;

    while !pacer.is_stopped() {
        last = snapshots.snapshot();
        let now = Instant::now();
        if last.violations() > 0 {
            violations_seen = true;
            clear_since = None;
            if action_taken.is_none() {
                action_taken = Some(
                    actions::respond_to_violation(publisher, site.waypoint, settings, pacer).await,
                );
            }
        } else {
            let since = *clear_since.get_or_insert(now);
            if grace.is_zero() || now.duration_since(since) >= grace {
                break;
            }
        }
        if started.elapsed() >= timeout {
            break;
        }
        if !pacer.sleep(settings.detection_poll()).await {
            break;
        }
    }

    let mut notes = Vec::new();
    if violations_seen {
        notes.push("violations_detected");
    }
    if started.elapsed() >= timeout {
        notes.push("timeout");
    }

    if !violations_seen && !pacer.is_stopped() {
        if let Some(url) = settings.no_violation_webview_url.as_deref().filter(|u| !u.is_empty()) {
            let delay = secs(settings.webview_close_delay_secs);
            actions::show_webview(publisher, url, delay, pacer).await;
            pacer.sleep(secs(settings.display_wait_secs)).await;
        }
        if let Some(utterance) = settings.no_violation_tts.as_deref().filter(|u| !u.is_empty()) {
            check_delivery(site.robot_id, "tts", publisher.speak(utterance).await);
        }
    }

    let total_violations = last.violations();
    WaypointSummary {
        robot_id: site.robot_id.to_string(),
        route_id: site.route_id.to_string(),
        waypoint: site.waypoint.name.clone(),
        waypoint_index: site.index,
        timestamp: Utc::now(),
        total_people: last.total_people,
        total_violations,
        total_compliant: last.total_people.saturating_sub(total_violations),
        viewports: last.viewports,
        action_taken,
        notes: notes.join(","),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::pacing::StopSignal;
    use crate::testing::RecordingPublisher;

    fn feed(violations: Arc<AtomicU32>) -> impl SnapshotSource {
        move || ViolationSnapshot {
            enabled: true,
            total_violations: Some(violations.load(Ordering::SeqCst)),
            total_people: 4,
            ..Default::default()
        }
    }

    fn gated(timeout: f64, grace: f64) -> Waypoint {
        let mut waypoint = Waypoint::named("dock");
        waypoint.detection.enabled = true;
        waypoint.detection.timeout_secs = Some(timeout);
        waypoint.detection.no_violation_secs = Some(grace);
        waypoint
    }

    fn site(waypoint: &Waypoint) -> GateSite<'_> {
        GateSite {
            robot_id: "temi-1",
            route_id: "lobby",
            waypoint,
            index: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_violation_acts_once_and_times_out() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let waypoint = gated(3.0, 1.0);
        let source = feed(Arc::new(AtomicU32::new(2)));

        let summary = run(
            site(&waypoint),
            publisher.as_ref(),
            &source,
            &PatrolSettings::default(),
            &mut pacer,
        )
        .await;

        assert_eq!(publisher.count("tts/speak"), 1);
        assert_eq!(summary.action_taken.as_deref(), Some("tts_ok"));
        assert_eq!(summary.notes, "violations_detected,timeout");
        assert_eq!(summary.total_violations, 2);
        assert_eq!(summary.total_compliant, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_gate_ends_after_grace_and_announces() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let waypoint = gated(30.0, 2.0);
        let source = feed(Arc::new(AtomicU32::new(0)));
        let settings = PatrolSettings {
            no_violation_tts: Some("All clear".into()),
            display_wait_secs: 0.0,
            ..Default::default()
        };

        let started = Instant::now();
        let summary = run(site(&waypoint), publisher.as_ref(), &source, &settings, &mut pacer).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.notes, "");
        assert!(summary.action_taken.is_none());
        assert_eq!(publisher.payloads("tts/speak")[0]["utterance"], "All clear");
    }

    #[tokio::test(start_paused = true)]
    async fn violation_then_clear_reports_detection_without_timeout() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let waypoint = gated(30.0, 1.0);
        let violations = Arc::new(AtomicU32::new(1));
        let source = feed(Arc::clone(&violations));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            violations.store(0, Ordering::SeqCst);
        });

        let summary = run(
            site(&waypoint),
            publisher.as_ref(),
            &source,
            &PatrolSettings::default(),
            &mut pacer,
        )
        .await;

        assert_eq!(summary.notes, "violations_detected");
        assert_eq!(publisher.count("tts/speak"), 1);
    }
}
