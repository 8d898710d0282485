//! Waypoint actions: speech, display, auto-close and dwell.
//!
//! Every command here is best-effort.  A command that cannot be delivered is
//! logged as a transport error and the waypoint carries on; only a stop
//! request cuts the sequence short.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{info, warn};
use vigil_middleware::CommandPublisher;
use vigil_types::{DisplayKind, PatrolSettings, VigilError, ViolationAction, Waypoint, secs};

use crate::pacing::Pacer;

/// Log a failed peripheral command; returns `delivered` unchanged.
pub(crate) fn check_delivery(robot_id: &str, what: &str, delivered: bool) -> bool {
    if !delivered {
        let err = VigilError::Transport(format!("{what} command not delivered"));
        warn!(%robot_id, %err, "peripheral command failed");
    }
    delivered
}

/// Render plain text as a full-screen HTML page encoded in a data URI.
pub(crate) fn text_document(content: &str) -> String {
    let html = format!(
        "<html><head><meta charset=\"UTF-8\"></head>\
         <body style='display:flex;justify-content:center;align-items:center;\
         height:100vh;font-size:48px;text-align:center;\
         background-color:#000;color:#fff;padding:20px;'>{content}</body></html>"
    );
    format!("data:text/html;base64,{}", STANDARD.encode(html))
}

/// Waypoint auto-close delay when positive, otherwise the fleet default.
pub(crate) fn close_delay(waypoint_secs: Option<f64>, settings: &PatrolSettings) -> Duration {
    match waypoint_secs.map(secs) {
        Some(delay) if !delay.is_zero() => delay,
        _ => secs(settings.webview_close_delay_secs),
    }
}

/// Show a webview and, when `close_after` is non-zero, close it again after
/// that delay.
pub(crate) async fn show_webview(
    publisher: &dyn CommandPublisher,
    url: &str,
    close_after: Duration,
    pacer: &mut Pacer,
) -> bool {
    let shown = check_delivery(publisher.robot_id(), "webview", publisher.show_webview(url).await);
    if shown && !close_after.is_zero() {
        info!(robot_id = %publisher.robot_id(), delay = ?close_after, "closing webview after delay");
        pacer.sleep(close_after).await;
        check_delivery(publisher.robot_id(), "webview close", publisher.close_webview().await);
    }
    shown
}

/// Speak, display, then dwell at an arrived waypoint.
///
/// Returns `false` if a stop request interrupted the sequence.
pub(crate) async fn perform(
    publisher: &dyn CommandPublisher,
    waypoint: &Waypoint,
    settings: &PatrolSettings,
    pacer: &mut Pacer,
) -> bool {
    let robot_id = publisher.robot_id();

    if let Some(utterance) = waypoint.speech.as_deref().filter(|s| !s.is_empty()) {
        info!(%robot_id, waypoint = %waypoint.name, %utterance, "speaking");
        check_delivery(robot_id, "tts", publisher.speak(utterance).await);
        if !pacer.sleep(secs(settings.tts_wait_secs)).await {
            return false;
        }
    }

    if let Some(shown_display) = waypoint.display.as_ref().filter(|d| !d.content.is_empty()) {
        info!(%robot_id, waypoint = %waypoint.name, kind = ?shown_display.kind, "displaying");
        let shown = match shown_display.kind {
            DisplayKind::Text => {
                publisher.show_webview(&text_document(&shown_display.content)).await
            }
            DisplayKind::Image => publisher.show_image(&shown_display.content).await,
            DisplayKind::Webview => publisher.show_webview(&shown_display.content).await,
            DisplayKind::Video => publisher.play_video(&shown_display.content).await,
        };
        check_delivery(robot_id, "display", shown);
        if !pacer.sleep(secs(settings.display_wait_secs)).await {
            return false;
        }
        if shown && shown_display.kind == DisplayKind::Webview {
            let delay = close_delay(waypoint.auto_close_secs, settings);
            if !delay.is_zero() {
                pacer.sleep(delay).await;
                check_delivery(robot_id, "webview close", publisher.close_webview().await);
            }
        }
    }

    let dwell = secs(waypoint.dwell_secs);
    if !dwell.is_zero() {
        info!(%robot_id, waypoint = %waypoint.name, ?dwell, "dwelling");
        if !pacer.sleep(dwell).await {
            info!(%robot_id, "dwell interrupted by stop request");
            return false;
        }
    }
    !pacer.is_stopped()
}

/// Run the configured response to a detected violation.
///
/// Returns the outcome tag recorded in the waypoint summary, e.g. `tts_ok`
/// or `webview_skipped`.
pub(crate) async fn respond_to_violation(
    publisher: &dyn CommandPublisher,
    waypoint: &Waypoint,
    settings: &PatrolSettings,
    pacer: &mut Pacer,
) -> String {
    let detection = &waypoint.detection;
    let action = detection.action.unwrap_or(settings.violation_action);
    let media_url = || {
        detection
            .content
            .clone()
            .or_else(|| settings.violation_webview_url.clone())
            .or_else(|| settings.violation_display_content.clone())
            .filter(|url| !url.is_empty())
    };

    let delivered = match action {
        ViolationAction::Tts => {
            let message = detection.message.as_deref().unwrap_or(&settings.violation_tts);
            info!(robot_id = %publisher.robot_id(), %message, "violation response: speech");
            publisher.speak(message).await
        }
        ViolationAction::Webview => {
            let Some(url) = media_url() else {
                return "webview_skipped".to_string();
            };
            info!(robot_id = %publisher.robot_id(), %url, "violation response: webview");
            let delay = close_delay(waypoint.auto_close_secs, settings);
            show_webview(publisher, &url, delay, pacer).await
        }
        ViolationAction::Video => {
            let Some(url) = media_url() else {
                return "video_skipped".to_string();
            };
            info!(robot_id = %publisher.robot_id(), %url, "violation response: video");
            publisher.play_video(&url).await
        }
    };
    check_delivery(publisher.robot_id(), action.as_str(), delivered);
    format!("{}_{}", action.as_str(), if delivered { "ok" } else { "failed" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::StopSignal;
    use crate::testing::RecordingPublisher;
    use vigil_types::DisplayAction;

    fn quick() -> PatrolSettings {
        PatrolSettings {
            tts_wait_secs: 0.0,
            display_wait_secs: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn text_is_wrapped_in_a_data_uri() {
        let uri = text_document("Hello");
        let encoded = uri.strip_prefix("data:text/html;base64,").expect("prefix");
        let html = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(html.contains(">Hello</body>"));
    }

    #[test]
    fn waypoint_close_delay_overrides_fleet_default() {
        let settings = PatrolSettings {
            webview_close_delay_secs: 4.0,
            ..Default::default()
        };
        assert_eq!(close_delay(Some(2.0), &settings), Duration::from_secs(2));
        assert_eq!(close_delay(Some(0.0), &settings), Duration::from_secs(4));
        assert_eq!(close_delay(None, &PatrolSettings::default()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn speech_precedes_display_and_webview_auto_closes() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let mut waypoint = Waypoint::named("lobby");
        waypoint.speech = Some("Welcome".into());
        waypoint.display = Some(DisplayAction {
            kind: DisplayKind::Webview,
            content: "screens/lobby.htm".into(),
        });
        waypoint.auto_close_secs = Some(3.0);
        waypoint.dwell_secs = 0.0;

        assert!(perform(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await);
        assert_eq!(
            publisher.topics(),
            vec![
                "entity/001/command/tts/speak",
                "entity/001/command/media/webview",
                "entity/001/command/media/webviewclose",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn text_and_video_displays_are_routed_by_kind() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let mut waypoint = Waypoint::named("gate");
        waypoint.dwell_secs = 0.0;

        waypoint.display = Some(DisplayAction {
            kind: DisplayKind::Text,
            content: "Hard hats beyond this point".into(),
        });
        assert!(perform(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await);

        waypoint.display = Some(DisplayAction {
            kind: DisplayKind::Video,
            content: "https://cdn/briefing.mp4".into(),
        });
        assert!(perform(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await);

        let webviews = publisher.payloads("media/webview");
        assert_eq!(webviews.len(), 1);
        assert!(
            webviews[0]["url"]
                .as_str()
                .is_some_and(|url| url.starts_with("data:text/html;base64,"))
        );
        assert_eq!(publisher.payloads("media/video")[0]["url"], "https://cdn/briefing.mp4");
        assert_eq!(publisher.count("media/webviewclose"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_dwell_short() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let mut waypoint = Waypoint::named("lobby");
        waypoint.dwell_secs = 30.0;
        let stopper = std::sync::Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.request_stop();
        });
        assert!(!perform(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await);
    }

    #[tokio::test]
    async fn violation_response_tags() {
        let publisher = RecordingPublisher::new();
        let signal = StopSignal::new();
        let mut pacer = signal.pacer();
        let mut waypoint = Waypoint::named("dock");

        let tag = respond_to_violation(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await;
        assert_eq!(tag, "tts_ok");
        assert_eq!(
            publisher.payloads("tts/speak")[0]["utterance"],
            "Please follow safety protocols and wear proper PPE."
        );

        waypoint.detection.action = Some(ViolationAction::Video);
        let tag = respond_to_violation(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await;
        assert_eq!(tag, "video_skipped");

        publisher.set_failing(true);
        waypoint.detection.content = Some("https://cdn/ppe.mp4".into());
        let tag = respond_to_violation(publisher.as_ref(), &waypoint, &quick(), &mut pacer).await;
        assert_eq!(tag, "video_failed");
    }
}
