//! [`CloudMonitor`] – connection to the detection pipeline's broker.
//!
//! The detection pipeline publishes its aggregate counts and individual
//! violations on `{prefix}/violations/*` and accepts start/stop commands on
//! `{prefix}/control/command`.  Robots that relay telemetry through the same
//! broker can be observed too by listing their topic trees in
//! `extra_subscriptions`.
//!
//! The monitor reuses the [`RobotLink`] machinery (throttled connects,
//! reconnect backoff, inbound forwarding) with its own subscriptions and no
//! last will.

use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::adapter::CommandPublisher;
use crate::bus::EventBus;
use crate::link::{InboundMessage, LinkOptions, RobotEndpoint, RobotLink};
use crate::topics::DetectionMessage;

/// Pseudo robot id carried by messages from the detection broker.
pub const CLOUD_ID: &str = "cloud";

const INBOUND_CAPACITY: usize = 1024;

pub struct CloudMonitor {
    prefix: String,
    link: RobotLink,
}

impl CloudMonitor {
    /// Create a monitor for the broker at `endpoint` (its `robot_id` and
    /// `serial` are ignored).
    pub fn new(
        mut endpoint: RobotEndpoint,
        detection_prefix: impl Into<String>,
        options: LinkOptions,
        bus: EventBus,
    ) -> Self {
        let prefix = detection_prefix.into();
        endpoint.robot_id = CLOUD_ID.to_string();
        endpoint.serial = String::new();
        let mut subscriptions = DetectionMessage::subscriptions(&prefix);
        subscriptions.extend(options.extra_subscriptions.iter().cloned());
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let link = RobotLink::observer(endpoint, options, bus, inbound, prefix.clone(), subscriptions);
        Self { prefix, link }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn connect(&self) -> bool {
        self.link.connect()
    }

    pub async fn ensure_connected(&self) -> bool {
        self.link.ensure_connected().await
    }

    pub fn disconnect(&self) {
        self.link.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn subscriptions(&self) -> &[String] {
        self.link.subscriptions()
    }

    /// Receive every message from the detection broker.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.link.subscribe()
    }

    /// Publish `{"command": command}` on the pipeline control topic.
    pub async fn send_pipeline_command(&self, command: &str) -> bool {
        let topic = DetectionMessage::control_topic(&self.prefix);
        info!(%topic, %command, "sending detection pipeline command");
        self.link.publish_raw(&topic, json!({ "command": command })).await
    }
}
