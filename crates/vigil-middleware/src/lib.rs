//! `vigil-middleware` – transport between the control plane and the fleet.
//!
//! Moves commands out to robots and telemetry back in without caring what
//! the patrol logic does with them.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe [`EventBus`] built on Tokio
//!   broadcast channels; every system-wide listener subscribes here.
//! - [`adapter`] – the [`CommandPublisher`] seam orchestrators drive robots
//!   through, and the [`LinkDirectory`] lookup.
//! - [`link`] – [`RobotLink`]: one MQTT connection per robot with throttled
//!   connects, reconnect backoff and a last-will "offline" announcement.
//! - [`link_registry`] – [`LinkRegistry`]: robot id → link map.
//! - [`cloud`] – [`CloudMonitor`]: the detection pipeline's broker.
//! - [`topics`] – topic scheme plus parsing of robot and detection messages.

pub mod adapter;
pub mod bus;
pub mod cloud;
pub mod link;
pub mod link_registry;
pub mod topics;

pub use adapter::{CommandPublisher, LinkDirectory};
pub use bus::{EventBus, SourceSubscriber, Topic, TopicReceiver};
pub use cloud::CloudMonitor;
pub use link::{InboundMessage, LinkOptions, RobotEndpoint, RobotLink};
pub use link_registry::LinkRegistry;
pub use topics::{DetectionMessage, NewViolation, RobotMessage, WaypointEvent, WaypointEventKind};
