//! Robot position tracking.
//!
//! Keeps the latest pose of each robot plus a bounded trail of recent poses
//! (oldest evicted first).  Shared between the telemetry router, which
//! writes, and operator surfaces, which read; all access goes through an
//! internal mutex.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

/// Default number of poses remembered per robot.
pub const DEFAULT_HISTORY: usize = 500;

/// One pose report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSample {
    pub x: f64,
    pub y: f64,
    /// Heading in degrees.
    pub theta: f64,
    /// Unix time in seconds.
    pub timestamp: f64,
}

#[derive(Debug)]
pub struct PositionTracker {
    max_history: usize,
    inner: Mutex<HashMap<String, VecDeque<PositionSample>>>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl PositionTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a pose; the newest sample becomes the current position.
    pub fn update(&self, robot_id: &str, sample: PositionSample) {
        let mut inner = self.lock();
        let trail = inner.entry(robot_id.to_string()).or_default();
        if trail.len() == self.max_history {
            trail.pop_front();
        }
        trail.push_back(sample);
    }

    pub fn current(&self, robot_id: &str) -> Option<PositionSample> {
        self.lock().get(robot_id).and_then(|t| t.back().copied())
    }

    /// Current position of every robot, keyed by id.
    pub fn all_current(&self) -> BTreeMap<String, PositionSample> {
        self.lock()
            .iter()
            .filter_map(|(id, t)| t.back().map(|s| (id.clone(), *s)))
            .collect()
    }

    /// The most recent `limit` samples (all when `None`), oldest first.
    pub fn history(&self, robot_id: &str, limit: Option<usize>) -> Vec<PositionSample> {
        let inner = self.lock();
        let Some(trail) = inner.get(robot_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |n| trail.len().saturating_sub(n));
        trail.iter().skip(skip).copied().collect()
    }

    /// Samples with `timestamp >= since`.
    pub fn since(&self, robot_id: &str, since: f64) -> Vec<PositionSample> {
        self.lock()
            .get(robot_id)
            .map(|t| t.iter().filter(|s| s.timestamp >= since).copied().collect())
            .unwrap_or_default()
    }

    /// Path length over the remembered trail, in map units.
    pub fn distance_travelled(&self, robot_id: &str) -> f64 {
        let trail = self.history(robot_id, None);
        trail
            .windows(2)
            .map(|w| (w[1].x - w[0].x).hypot(w[1].y - w[0].y))
            .sum()
    }

    pub fn clear(&self, robot_id: &str) {
        self.lock().remove(robot_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<PositionSample>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
