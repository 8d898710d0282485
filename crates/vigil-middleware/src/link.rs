//! [`RobotLink`] – one durable MQTT connection per robot.
//!
//! The link owns a [`rumqttc::AsyncClient`] and a background task that drives
//! its event loop.  The task:
//!
//! 1. subscribes to `{base}/status/#`, `{base}/event/#` (plus any extra
//!    topics from [`LinkOptions`]) every time the broker acknowledges a
//!    connection,
//! 2. decodes every inbound publish and forwards it as an [`InboundMessage`]
//!    on a broadcast channel shared with the [`LinkRegistry`][crate::link_registry::LinkRegistry],
//! 3. reconnects with exponential backoff after network errors.
//!
//! Connection state lives in a [`watch`] channel so callers can block on
//! [`RobotLink::ensure_connected`] without polling.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ConnAck──▶ Connected
//!      ▲                          │                      │
//!      └──────── error / disconnect() ◀──────────────────┘
//! ```
//!
//! Connection attempts are spaced by at least
//! [`LinkOptions::min_connect_spacing`] so a flapping broker never causes a
//! reconnect storm.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, LastWill, MqttOptions, Packet,
    QoS, Transport,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_types::{ConnectionState, Event, EventPayload};

use crate::adapter::CommandPublisher;
use crate::bus::{EventBus, Topic};
use crate::topics::{self, MAX_PAYLOAD_BYTES};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Where and how to reach one robot's broker.
#[derive(Clone)]
pub struct RobotEndpoint {
    pub robot_id: String,
    pub serial: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl std::fmt::Debug for RobotEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotEndpoint")
            .field("robot_id", &self.robot_id)
            .field("serial", &self.serial)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", if self.password.is_some() { &"<redacted>" } else { &"<not set>" })
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Tunables shared by every link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub topic_prefix: String,
    /// Minimum spacing between two connection attempts.
    pub min_connect_spacing: Duration,
    /// How long [`RobotLink::ensure_connected`] waits for the broker.
    pub connect_wait: Duration,
    pub keep_alive: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    /// Topics subscribed in addition to the robot's status and event trees.
    pub extra_subscriptions: Vec<String>,
    /// Capacity of the MQTT request queue.
    pub request_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            topic_prefix: topics::DEFAULT_ROBOT_PREFIX.to_string(),
            min_connect_spacing: Duration::from_secs(2),
            connect_wait: Duration::from_secs(5),
            keep_alive: Duration::from_secs(120),
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            extra_subscriptions: Vec::new(),
            request_capacity: 64,
        }
    }
}

/// A decoded message received from a robot's broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub robot_id: String,
    pub serial: String,
    pub topic: String,
    pub payload: Value,
}

// ────────────────────────────────────────────────────────────────────────────
// Attempt throttle
// ────────────────────────────────────────────────────────────────────────────

/// Guards connection attempts: one at a time, at least `spacing` apart.
#[derive(Debug)]
pub(crate) struct AttemptThrottle {
    spacing: Duration,
    last_attempt: Option<Instant>,
    in_flight: bool,
}

impl AttemptThrottle {
    pub(crate) fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_attempt: None,
            in_flight: false,
        }
    }

    /// Claim an attempt slot at `now`; `false` when throttled.
    pub(crate) fn try_begin(&mut self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        if let Some(last) = self.last_attempt
            && now.saturating_duration_since(last) < self.spacing
        {
            return false;
        }
        self.in_flight = true;
        self.last_attempt = Some(now);
        true
    }

    pub(crate) fn finish(&mut self) {
        self.in_flight = false;
    }

    pub(crate) fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotLink
// ────────────────────────────────────────────────────────────────────────────

struct LinkInner {
    client: Option<AsyncClient>,
    worker: Option<JoinHandle<()>>,
    throttle: AttemptThrottle,
}

/// Persistent broker connection dedicated to one robot.
pub struct RobotLink {
    endpoint: RobotEndpoint,
    options: LinkOptions,
    base: String,
    subscriptions: Vec<String>,
    last_will: bool,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<InboundMessage>,
    bus: EventBus,
    inner: Mutex<LinkInner>,
}

impl RobotLink {
    /// Create a disconnected link.  Inbound messages are forwarded to
    /// `inbound`; connection changes are published on `bus`.
    pub fn new(
        endpoint: RobotEndpoint,
        options: LinkOptions,
        bus: EventBus,
        inbound: broadcast::Sender<InboundMessage>,
    ) -> Self {
        let base = topics::base_topic(&options.topic_prefix, &endpoint.serial);
        let mut subscriptions = vec![format!("{base}/status/#"), format!("{base}/event/#")];
        subscriptions.extend(options.extra_subscriptions.iter().cloned());
        Self::build(endpoint, options, bus, inbound, base, subscriptions, true)
    }

    /// A connection that only listens on `subscriptions` and publishes under
    /// `base`, without a last will.
    pub(crate) fn observer(
        endpoint: RobotEndpoint,
        options: LinkOptions,
        bus: EventBus,
        inbound: broadcast::Sender<InboundMessage>,
        base: String,
        subscriptions: Vec<String>,
    ) -> Self {
        Self::build(endpoint, options, bus, inbound, base, subscriptions, false)
    }

    fn build(
        endpoint: RobotEndpoint,
        options: LinkOptions,
        bus: EventBus,
        inbound: broadcast::Sender<InboundMessage>,
        base: String,
        subscriptions: Vec<String>,
        last_will: bool,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let throttle = AttemptThrottle::new(options.min_connect_spacing);
        Self {
            endpoint,
            options,
            base,
            subscriptions,
            last_will,
            state,
            inbound,
            bus,
            inner: Mutex::new(LinkInner {
                client: None,
                worker: None,
                throttle,
            }),
        }
    }

    pub fn endpoint(&self) -> &RobotEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Lock-free connectivity check.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.lock_inner().throttle.last_attempt()
    }

    /// Receive every message this link forwards.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// Start a connection attempt.
    ///
    /// Returns `true` when already connected or when a new attempt was
    /// started, `false` when throttled.  Must be called inside a Tokio
    /// runtime.
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let mut inner = self.lock_inner();
        if !inner.throttle.try_begin(Instant::now()) {
            debug!(robot_id = %self.endpoint.robot_id, "connect attempt throttled");
            return false;
        }

        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        self.set_state(ConnectionState::Connecting);

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), self.options.request_capacity);
        info!(
            robot_id = %self.endpoint.robot_id,
            host = %self.endpoint.host,
            port = self.endpoint.port,
            "connecting to robot broker"
        );
        let worker = tokio::spawn(run_event_loop(EventLoopContext {
            robot_id: self.endpoint.robot_id.clone(),
            serial: self.endpoint.serial.clone(),
            subscriptions: self.subscriptions.clone(),
            client: client.clone(),
            state: self.state.clone(),
            inbound: self.inbound.clone(),
            bus: self.bus.clone(),
            backoff_min: self.options.reconnect_backoff_min,
            backoff_max: self.options.reconnect_backoff_max,
        }, eventloop));

        inner.client = Some(client);
        inner.worker = Some(worker);
        inner.throttle.finish();
        true
    }

    /// Make sure the link is up, starting a connection when none is in
    /// progress, and wait up to [`LinkOptions::connect_wait`] for it.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let has_worker = self.lock_inner().worker.is_some();
        if !has_worker && !self.connect() {
            return false;
        }
        self.wait_connected(self.options.connect_wait).await
    }

    /// Wait up to `timeout` for the broker to acknowledge the connection.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        )
    }

    /// Close the connection and stop the background task.
    pub fn disconnect(&self) {
        let (client, worker) = {
            let mut inner = self.lock_inner();
            (inner.client.take(), inner.worker.take())
        };
        if let Some(client) = client
            && let Err(e) = client.try_disconnect()
        {
            debug!(robot_id = %self.endpoint.robot_id, error = %e, "disconnect request not queued");
        }
        if let Some(worker) = worker {
            worker.abort();
        }
        if self.state() != ConnectionState::Disconnected {
            info!(robot_id = %self.endpoint.robot_id, "disconnected from robot broker");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        publish_state(&self.state, &self.bus, &self.endpoint.robot_id, state);
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!(
            "vigil_{}_{}_{}",
            self.endpoint.serial,
            std::process::id(),
            Utc::now().timestamp()
        );
        let mut opts = MqttOptions::new(client_id, self.endpoint.host.clone(), self.endpoint.port);
        opts.set_keep_alive(self.options.keep_alive);
        if let (Some(user), Some(pass)) = (&self.endpoint.username, &self.endpoint.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        if self.last_will {
            let will = json!({ "status": "offline", "timestamp": Utc::now().to_rfc3339() });
            opts.set_last_will(LastWill::new(
                format!("{}/lwt", self.base),
                will.to_string(),
                QoS::AtLeastOnce,
                false,
            ));
        }
        if self.endpoint.use_tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }
}

impl Drop for RobotLink {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_inner().worker.take() {
            worker.abort();
        }
    }
}

#[async_trait]
impl CommandPublisher for RobotLink {
    fn robot_id(&self) -> &str {
        &self.endpoint.robot_id
    }

    fn base_topic(&self) -> &str {
        &self.base
    }

    async fn publish_command(&self, category: &str, command: &str, payload: Value) -> bool {
        let topic = topics::command_topic(&self.base, category, command);
        self.publish_raw(&topic, payload).await
    }

    async fn publish_raw(&self, topic: &str, payload: Value) -> bool {
        if !self.ensure_connected().await {
            warn!(robot_id = %self.endpoint.robot_id, %topic, "cannot publish: not connected to broker");
            return false;
        }
        let Some(client) = self.lock_inner().client.clone() else {
            return false;
        };
        match client.publish(topic, QoS::AtMostOnce, false, payload.to_string()).await {
            Ok(()) => {
                info!(robot_id = %self.endpoint.robot_id, %topic, %payload, "published command");
                true
            }
            Err(e) => {
                error!(robot_id = %self.endpoint.robot_id, %topic, error = %e, "publish failed");
                false
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event loop task
// ────────────────────────────────────────────────────────────────────────────

struct EventLoopContext {
    robot_id: String,
    serial: String,
    subscriptions: Vec<String>,
    client: AsyncClient,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<InboundMessage>,
    bus: EventBus,
    backoff_min: Duration,
    backoff_max: Duration,
}

fn publish_state(
    tx: &watch::Sender<ConnectionState>,
    bus: &EventBus,
    robot_id: &str,
    state: ConnectionState,
) {
    let changed = tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        bus.publish_to(
            Topic::Links,
            Event::new(
                "vigil-middleware::link",
                EventPayload::ConnectionChanged {
                    robot_id: robot_id.to_string(),
                    state,
                },
            ),
        );
    }
}

async fn run_event_loop(ctx: EventLoopContext, mut eventloop: EventLoop) {
    let mut backoff = ctx.backoff_min;
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    error!(robot_id = %ctx.robot_id, code = ?ack.code, "broker refused connection");
                    continue;
                }
                backoff = ctx.backoff_min;
                for topic in &ctx.subscriptions {
                    if let Err(e) = ctx.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        warn!(robot_id = %ctx.robot_id, %topic, error = %e, "subscribe request failed");
                    }
                }
                info!(robot_id = %ctx.robot_id, serial = %ctx.serial, "connected to robot broker");
                publish_state(&ctx.state, &ctx.bus, &ctx.robot_id, ConnectionState::Connected);
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                if publish.payload.len() > MAX_PAYLOAD_BYTES {
                    warn!(
                        robot_id = %ctx.robot_id,
                        topic = %publish.topic,
                        bytes = publish.payload.len(),
                        "dropping oversized payload"
                    );
                    continue;
                }
                let payload = topics::decode_payload(&publish.payload);
                debug!(robot_id = %ctx.robot_id, topic = %publish.topic, "inbound message");
                // No listeners is fine; telemetry is simply dropped.
                let _ = ctx.inbound.send(InboundMessage {
                    robot_id: ctx.robot_id.clone(),
                    serial: ctx.serial.clone(),
                    topic: publish.topic,
                    payload,
                });
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                publish_state(&ctx.state, &ctx.bus, &ctx.robot_id, ConnectionState::Disconnected);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    robot_id = %ctx.robot_id,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "robot broker connection error"
                );
                publish_state(&ctx.state, &ctx.bus, &ctx.robot_id, ConnectionState::Disconnected);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ctx.backoff_max);
                publish_state(&ctx.state, &ctx.bus, &ctx.robot_id, ConnectionState::Connecting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> RobotEndpoint {
        RobotEndpoint {
            robot_id: "temi-1".to_string(),
            serial: "00120".to_string(),
            host: "127.0.0.1".to_string(),
            // Nothing listens here; every attempt is refused.
            port: 1,
            username: Some("ops".to_string()),
            password: Some("hunter2".to_string()),
            use_tls: false,
        }
    }

    fn link(options: LinkOptions) -> RobotLink {
        let (inbound, _) = broadcast::channel(16);
        RobotLink::new(endpoint(), options, EventBus::default(), inbound)
    }

    #[test]
    fn throttle_spaces_attempts() {
        let mut throttle = AttemptThrottle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(throttle.try_begin(t0));
        // In flight: a second attempt is refused regardless of time.
        assert!(!throttle.try_begin(t0 + Duration::from_secs(10)));
        throttle.finish();
        assert!(!throttle.try_begin(t0 + Duration::from_millis(1500)));
        assert!(throttle.try_begin(t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn endpoint_debug_redacts_password() {
        let dbg = format!("{:?}", endpoint());
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn new_link_starts_disconnected() {
        let link = link(LinkOptions::default());
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_connected());
        assert_eq!(link.base_topic(), "entity/00120");
        assert!(link.last_attempt().is_none());
    }

    #[test]
    fn subscriptions_include_status_event_and_extras() {
        let options = LinkOptions {
            extra_subscriptions: vec!["safety/violations/new".to_string()],
            ..Default::default()
        };
        let link = link(options);
        let subs = link.subscriptions();
        assert_eq!(
            subs,
            vec!["entity/00120/status/#", "entity/00120/event/#", "safety/violations/new"]
        );
    }

    #[tokio::test]
    async fn second_connect_within_spacing_is_throttled() {
        let link = link(LinkOptions::default());
        assert!(link.connect());
        assert!(link.last_attempt().is_some());
        assert!(!link.connect());
        link.disconnect();
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publish_fails_without_broker() {
        let options = LinkOptions {
            connect_wait: Duration::from_millis(200),
            ..Default::default()
        };
        let link = link(options);
        assert!(!link.goto("lobby").await);
        assert!(!link.is_connected());
        link.disconnect();
    }
}
