//! Fleet wiring – one process, one bus, one registry.
//!
//! ```text
//! robots ──► LinkRegistry ──┐
//!                           ├──► TelemetryRouter ──► PatrolRegistry ──► orchestrators
//! pipeline ──► CloudMonitor ┘          │
//!                                      └──► DetectionAggregator (snapshot source)
//! ```

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use vigil_middleware::{CloudMonitor, EventBus, LinkOptions, LinkRegistry};
use vigil_perception::{CountSmoother, DetectionAggregator, shared_source};
use vigil_runtime::{PatrolContext, PatrolRegistry, PipelineControl, StaticRoutes, TelemetryRouter};

use crate::config::{Config, RobotConfig};

pub struct Fleet {
    pub links: Arc<LinkRegistry>,
    pub cloud: Option<Arc<CloudMonitor>>,
    pub registry: Arc<PatrolRegistry>,
    pub router: Arc<TelemetryRouter>,
    pub routes: StaticRoutes,
    pub robots: Vec<RobotConfig>,
    tasks: Vec<JoinHandle<()>>,
}

impl Fleet {
    /// Wire everything up and connect to every configured broker.
    ///
    /// Robots that cannot be reached are logged and left out; the operator
    /// can still drive the rest of the fleet.
    pub async fn start(cfg: &Config) -> Self {
        let bus = EventBus::default();
        let links = Arc::new(LinkRegistry::new(LinkOptions::default(), bus.clone()));

        let cloud = cfg.cloud.as_ref().map(|c| {
            let options = LinkOptions {
                extra_subscriptions: c.extra_subscriptions.clone(),
                ..Default::default()
            };
            Arc::new(CloudMonitor::new(
                c.endpoint(),
                c.detection_prefix.clone(),
                options,
                bus.clone(),
            ))
        });

        let mut aggregator = DetectionAggregator::new();
        if cfg.cloud.as_ref().is_some_and(|c| c.smooth_counts) {
            aggregator = aggregator.with_smoothing(CountSmoother::from_config(&cfg.debounce));
        }
        let aggregator = Arc::new(Mutex::new(aggregator));

        let ctx = PatrolContext::new(bus, cfg.settings.clone())
            .with_snapshots(shared_source(Arc::clone(&aggregator)));
        let pipeline = cloud.clone().map(|c| c as Arc<dyn PipelineControl>);
        let registry = PatrolRegistry::new(links.clone(), ctx, cfg.debounce.clone(), pipeline);
        let router = Arc::new(
            TelemetryRouter::new(Arc::clone(&registry), links.clone(), cfg.detection_prefix())
                .with_aggregator(aggregator),
        );

        let mut tasks = vec![Arc::clone(&router).spawn(links.subscribe())];
        if let Some(cloud) = &cloud {
            tasks.push(Arc::clone(&router).spawn(cloud.subscribe()));
            if cloud.ensure_connected().await {
                info!(prefix = %cloud.prefix(), "detection broker connected");
            } else {
                warn!(prefix = %cloud.prefix(), "detection broker unreachable; counts unavailable");
            }
        }

        for robot in &cfg.robots {
            match links.add(robot.endpoint()).await {
                Ok(_) => info!(robot_id = %robot.id, serial = %robot.serial, "robot connected"),
                Err(e) => warn!(robot_id = %robot.id, error = %e, "robot not connected"),
            }
        }

        Self {
            links,
            cloud,
            registry,
            router,
            routes: StaticRoutes::new(cfg.routes.iter().cloned(), cfg.settings.clone()),
            robots: cfg.robots.clone(),
            tasks,
        }
    }

    pub fn is_connected(&self, robot_id: &str) -> bool {
        self.links.get(robot_id).is_some_and(|link| link.is_connected())
    }

    /// Stop every run, then drop every broker connection.
    pub async fn shutdown(&self) {
        self.registry.stop_all().await;
        self.links.disconnect_all().await;
        if let Some(cloud) = &self.cloud {
            cloud.disconnect();
        }
        for task in &self.tasks {
            task.abort();
        }
        info!("fleet shut down");
    }
}
