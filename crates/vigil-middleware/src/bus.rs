//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! listener (dashboard, alerting, audit log) receives every event without
//! any single listener blocking the patrol workers.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Patrol`] | Status, waypoint-reached, completion and error events |
//! | [`Topic::Detections`] | Waypoint summaries, reported violations, inspection results |
//! | [`Topic::Telemetry`] | Battery readings from robots |
//! | [`Topic::Links`] | Robot connection state changes |
//!
//! Every event published to a topic is mirrored onto the global channel, so
//! a single [`EventBus::subscribe`] call observes the whole system.

use tokio::sync::broadcast;
use tracing::warn;
use vigil_types::Event;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// First-class routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Patrol,
    Detections,
    Telemetry,
    Links,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    patrol: broadcast::Sender<Event>,
    detections: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
    links: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (patrol, _) = broadcast::channel(capacity);
        let (detections, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        let (links, _) = broadcast::channel(capacity);
        Self {
            sender,
            patrol,
            detections,
            telemetry,
            links,
        }
    }

    // -----------------------------------------------------------------------
    // Topic-based API
    // -----------------------------------------------------------------------

    /// Publish `event` to the given [`Topic`] channel and the global channel.
    ///
    /// Returns the number of receivers that were handed the event.  Zero
    /// listeners is a normal condition, not an error.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let topic_receivers = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        topic_receivers + self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    // -----------------------------------------------------------------------
    // Global API
    // -----------------------------------------------------------------------

    /// Subscribe to every event regardless of topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe to the global channel, keeping only events whose `source`
    /// starts with `prefix`.
    pub fn subscribe_source(&self, prefix: impl Into<String>) -> SourceSubscriber {
        SourceSubscriber {
            prefix: prefix.into(),
            receiver: self.sender.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Patrol => &self.patrol,
            Topic::Detections => &self.detections,
            Topic::Telemetry => &self.telemetry,
            Topic::Links => &self.links,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// A subscriber that falls behind is told how many events it missed via
    /// `Err(RecvError::Lagged(n))`; the caller decides whether to continue.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Source-prefix subscriber
// ---------------------------------------------------------------------------

/// A subscriber that only delivers events whose `source` field starts with
/// the given prefix.
pub struct SourceSubscriber {
    prefix: String,
    receiver: broadcast::Receiver<Event>,
}

impl SourceSubscriber {
    /// Wait for the next matching event.
    ///
    /// Returns `None` when the bus is closed and no further events will arrive.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source.starts_with(&self.prefix) => {
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, lagged_by = n, "SourceSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
