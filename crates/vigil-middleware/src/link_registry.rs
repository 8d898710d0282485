//! [`LinkRegistry`] – owns one [`RobotLink`] per robot id.
//!
//! Mutations (`add`, `remove`, `disconnect_all`) are serialised by a single
//! async mutex that stays held while a new link waits for its broker.  Reads
//! go through a separate snapshot map and never wait on that mutex, so
//! [`LinkRegistry::is_connected`] is safe to call from anywhere.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};
use vigil_types::VigilError;

use crate::adapter::{CommandPublisher, LinkDirectory};
use crate::bus::EventBus;
use crate::link::{InboundMessage, LinkOptions, RobotEndpoint, RobotLink};

/// Capacity of the shared inbound message channel.
const INBOUND_CAPACITY: usize = 1024;

pub struct LinkRegistry {
    options: LinkOptions,
    bus: EventBus,
    inbound: broadcast::Sender<InboundMessage>,
    mutation: Mutex<()>,
    links: RwLock<HashMap<String, Arc<RobotLink>>>,
}

impl LinkRegistry {
    pub fn new(options: LinkOptions, bus: EventBus) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            options,
            bus,
            inbound,
            mutation: Mutex::new(()),
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Receive inbound messages from every robot.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// Register and connect a robot.
    ///
    /// Idempotent when the robot is already connected.  An existing but
    /// disconnected link is reconnected in place.  A new link is only kept
    /// once the broker confirms the connection within the configured wait.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Connectivity`] when the broker does not confirm
    /// the connection in time.
    pub async fn add(&self, endpoint: RobotEndpoint) -> Result<Arc<RobotLink>, VigilError> {
        let _guard = self.mutation.lock().await;
        let robot_id = endpoint.robot_id.clone();

        if let Some(existing) = self.get(&robot_id) {
            if existing.is_connected() {
                info!(%robot_id, "robot already connected");
                return Ok(existing);
            }
            info!(%robot_id, "robot registered but disconnected; reconnecting");
            return if existing.ensure_connected().await {
                Ok(existing)
            } else {
                Err(VigilError::Connectivity(format!("robot '{robot_id}' did not reconnect")))
            };
        }

        let link = Arc::new(RobotLink::new(
            endpoint,
            self.options.clone(),
            self.bus.clone(),
            self.inbound.clone(),
        ));
        if !link.connect() {
            error!(%robot_id, "failed to start connection");
            return Err(VigilError::Connectivity(format!(
                "robot '{robot_id}' connection attempt refused"
            )));
        }
        if !link.wait_connected(self.options.connect_wait).await {
            error!(%robot_id, "timed out waiting for broker");
            link.disconnect();
            return Err(VigilError::Connectivity(format!(
                "timed out connecting robot '{robot_id}'"
            )));
        }

        self.write_links().insert(robot_id.clone(), Arc::clone(&link));
        info!(%robot_id, serial = %link.endpoint().serial, "robot added");
        Ok(link)
    }

    /// Disconnect and evict a robot.  Returns `false` for unknown ids.
    pub async fn remove(&self, robot_id: &str) -> bool {
        let _guard = self.mutation.lock().await;
        match self.write_links().remove(robot_id) {
            Some(link) => {
                link.disconnect();
                info!(%robot_id, "robot removed");
                true
            }
            None => {
                warn!(%robot_id, "remove requested for unknown robot");
                false
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let _guard = self.mutation.lock().await;
        let drained: Vec<_> = self.write_links().drain().collect();
        for (_, link) in drained {
            link.disconnect();
        }
        info!("disconnected all robots");
    }

    pub fn get(&self, robot_id: &str) -> Option<Arc<RobotLink>> {
        self.read_links().get(robot_id).cloned()
    }

    /// Robot id owning `serial`, if registered.
    pub fn robot_for_serial(&self, serial: &str) -> Option<String> {
        self.read_links()
            .values()
            .find(|link| link.endpoint().serial == serial)
            .map(|link| link.endpoint().robot_id.clone())
    }

    pub fn robot_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read_links().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_links().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_links(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RobotLink>>> {
        self.links.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_links(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RobotLink>>> {
        self.links.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LinkDirectory for LinkRegistry {
    fn publisher(&self, robot_id: &str) -> Option<Arc<dyn CommandPublisher>> {
        self.get(robot_id).map(|link| link as Arc<dyn CommandPublisher>)
    }

    fn is_connected(&self, robot_id: &str) -> bool {
        self.get(robot_id).is_some_and(|link| link.is_connected())
    }

    fn robot_for_serial(&self, serial: &str) -> Option<String> {
        LinkRegistry::robot_for_serial(self, serial)
    }
}
