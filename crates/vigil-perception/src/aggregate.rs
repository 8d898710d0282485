//! Aggregate counter stage for the live detection feed.
//!
//! The detection pipeline periodically publishes whole-frame totals
//! (`total_people`, `total_violations`, per-viewport breakdown).  Those totals
//! are noisy and occasionally inconsistent, so every update passes through:
//!
//! 1. [`clamp_counts`]: floors both totals at zero and caps
//!    `violations <= people`.
//! 2. An optional [`CountSmoother`] per robot: z-score outlier replacement
//!    followed by an EMA, re-clamped to the people count.
//!
//! The result is kept in a [`DetectionAggregator`], which orchestrators read
//! through the [`SnapshotSource`] pull trait.  This stage is independent of
//! the windowed [`ViolationDebouncer`][crate::debounce::ViolationDebouncer].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use vigil_types::ViolationSnapshot;

use crate::debounce::DebounceConfig;

/// Floor both totals at zero and cap violations at the people count.
pub fn clamp_counts(violations: i64, people: i64) -> (u32, u32) {
    let people = people.clamp(0, i64::from(u32::MAX)) as u32;
    let violations = violations.clamp(0, i64::from(people)) as u32;
    (violations, people)
}

// ────────────────────────────────────────────────────────────────────────────
// CountSmoother
// ────────────────────────────────────────────────────────────────────────────

/// Per-key smoothing of integer violation counts.
///
/// Once at least three values are remembered, a value whose population
/// z-score exceeds the outlier threshold is replaced by the rounded history
/// mean.  The (possibly replaced) value then feeds an EMA seeded with the
/// first value, and the rounded EMA is returned.
#[derive(Debug)]
pub struct CountSmoother {
    window: usize,
    alpha: f64,
    outlier_threshold: f64,
    history: HashMap<String, VecDeque<u32>>,
    ema: HashMap<String, f64>,
}

impl CountSmoother {
    /// `window` is raised to at least 3.
    pub fn new(window: usize, alpha: f64, outlier_threshold: f64) -> Self {
        Self {
            window: window.max(3),
            alpha: alpha.clamp(0.0, 1.0),
            outlier_threshold,
            history: HashMap::new(),
            ema: HashMap::new(),
        }
    }

    /// Reuse the debounce tuning: one remembered value per window second.
    pub fn from_config(config: &DebounceConfig) -> Self {
        Self::new(
            config.window_secs.max(0.0) as usize,
            config.smoothing_factor,
            config.outlier_threshold,
        )
    }

    pub fn smooth(&mut self, key: &str, value: u32) -> u32 {
        let hist = self.history.entry(key.to_string()).or_default();
        let mut value = f64::from(value);

        if hist.len() >= 3 {
            let n = hist.len() as f64;
            let mean = hist.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
            let var = hist.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            if std > 0.0 && (value - mean).abs() / std > self.outlier_threshold {
                debug!(key, raw = value, mean, "count outlier replaced by mean");
                value = mean.round();
            }
        }

        let prev = *self.ema.get(key).unwrap_or(&value);
        let ema = self.alpha * value + (1.0 - self.alpha) * prev;
        self.ema.insert(key.to_string(), ema);

        if hist.len() == self.window {
            hist.pop_front();
        }
        hist.push_back(value as u32);
        ema.round().max(0.0) as u32
    }

    pub fn reset(&mut self, key: &str) {
        self.history.remove(key);
        self.ema.remove(key);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DetectionAggregator
// ────────────────────────────────────────────────────────────────────────────

/// One totals message from the pipeline, before clamping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountsUpdate {
    pub total_violations: i64,
    /// `None` keeps the previously known people count.
    pub total_people: Option<i64>,
    /// Robot the totals belong to; enables per-robot smoothing.
    pub robot_id: Option<String>,
    pub viewports: BTreeMap<String, Value>,
}

/// Latest clamped view of the detection feed.
#[derive(Debug)]
pub struct DetectionAggregator {
    snapshot: ViolationSnapshot,
    smoother: Option<CountSmoother>,
}

impl Default for DetectionAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionAggregator {
    pub fn new() -> Self {
        Self {
            snapshot: ViolationSnapshot {
                enabled: true,
                ..Default::default()
            },
            smoother: None,
        }
    }

    pub fn with_smoothing(mut self, smoother: CountSmoother) -> Self {
        self.smoother = Some(smoother);
        self
    }

    /// Fold one totals message into the snapshot.  Ignored while disabled.
    pub fn apply(&mut self, update: CountsUpdate, now: DateTime<Utc>) -> ViolationSnapshot {
        if !self.snapshot.enabled {
            return self.snapshot.clone();
        }
        let people = update
            .total_people
            .unwrap_or_else(|| i64::from(self.snapshot.total_people));
        let (mut violations, people) = clamp_counts(update.total_violations, people);
        if let (Some(smoother), Some(robot_id)) = (self.smoother.as_mut(), update.robot_id.as_deref())
        {
            violations = smoother.smooth(robot_id, violations).min(people);
        }

        self.snapshot.last_message_time = Some(now);
        self.snapshot.total_violations = Some(violations);
        self.snapshot.total_people = people;
        for (name, data) in update.viewports {
            let value = match &data {
                Value::Object(map) => map
                    .get("violations")
                    .or_else(|| map.get("violation_count"))
                    .cloned()
                    .unwrap_or(Value::from(0)),
                other => other.clone(),
            };
            self.snapshot.viewports.insert(name, value);
        }
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ViolationSnapshot {
        self.snapshot.clone()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.snapshot.enabled = enabled;
    }

    /// Whether the pipeline reported within `liveness` of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, liveness: Duration) -> bool {
        self.snapshot
            .last_message_time
            .is_some_and(|last| (now - last).to_std().map_or(true, |age| age <= liveness))
    }

    /// Forget every count but keep the enabled flag.
    pub fn reset(&mut self) {
        self.snapshot = ViolationSnapshot {
            enabled: self.snapshot.enabled,
            ..Default::default()
        };
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SnapshotSource
// ────────────────────────────────────────────────────────────────────────────

/// Pull function handing orchestrators the current detection snapshot.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> ViolationSnapshot;
}

impl<F> SnapshotSource for F
where
    F: Fn() -> ViolationSnapshot + Send + Sync,
{
    fn snapshot(&self) -> ViolationSnapshot {
        self()
    }
}

/// Wrap a shared aggregator as a [`SnapshotSource`].
pub fn shared_source(aggregator: Arc<Mutex<DetectionAggregator>>) -> Arc<dyn SnapshotSource> {
    Arc::new(move || {
        aggregator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamp_caps_violations_at_people() {
        assert_eq!(clamp_counts(7, 3), (3, 3));
        assert_eq!(clamp_counts(-2, -5), (0, 0));
        assert_eq!(clamp_counts(-1, 4), (0, 4));
        assert_eq!(clamp_counts(2, 4), (2, 4));
    }

    #[test]
    fn aggregator_exposes_clamped_totals() {
        let mut agg = DetectionAggregator::new();
        let snap = agg.apply(
            CountsUpdate {
                total_violations: 7,
                total_people: Some(3),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(snap.total_violations, Some(3));
        assert_eq!(snap.total_people, 3);
    }

    #[test]
    fn summary_without_people_reuses_previous_count() {
        let mut agg = DetectionAggregator::new();
        let now = Utc::now();
        agg.apply(
            CountsUpdate {
                total_violations: 1,
                total_people: Some(4),
                ..Default::default()
            },
            now,
        );
        let snap = agg.apply(
            CountsUpdate {
                total_violations: 9,
                total_people: None,
                ..Default::default()
            },
            now,
        );
        assert_eq!((snap.violations(), snap.total_people), (4, 4));
    }

    #[test]
    fn viewport_objects_collapse_to_violation_counts() {
        let mut agg = DetectionAggregator::new();
        let mut viewports = BTreeMap::new();
        viewports.insert("front".to_string(), json!({"violations": 2, "people": 5}));
        viewports.insert("left".to_string(), json!({"violation_count": 1}));
        viewports.insert("back".to_string(), json!(0));
        let snap = agg.apply(
            CountsUpdate {
                total_violations: 3,
                total_people: Some(5),
                viewports,
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(snap.viewports["front"], json!(2));
        assert_eq!(snap.viewports["left"], json!(1));
        assert_eq!(snap.viewports["back"], json!(0));
    }

    #[test]
    fn disabled_aggregator_ignores_updates() {
        let mut agg = DetectionAggregator::new();
        agg.set_enabled(false);
        let snap = agg.apply(
            CountsUpdate {
                total_violations: 1,
                total_people: Some(1),
                ..Default::default()
            },
            Utc::now(),
        );
        assert!(!snap.enabled);
        assert_eq!(snap.total_violations, None);
        assert!(snap.last_message_time.is_none());
    }

    #[test]
    fn liveness_follows_last_message_time() {
        let mut agg = DetectionAggregator::new();
        let t0 = Utc::now();
        assert!(!agg.is_live(t0, Duration::from_secs(10)));
        agg.apply(CountsUpdate::default(), t0);
        assert!(agg.is_live(t0 + chrono::Duration::seconds(5), Duration::from_secs(10)));
        assert!(!agg.is_live(t0 + chrono::Duration::seconds(11), Duration::from_secs(10)));
    }

    #[test]
    fn smoother_replaces_spikes_and_averages() {
        let mut s = CountSmoother::new(10, 0.5, 1.5);
        assert_eq!(s.smooth("r", 2), 2);
        assert_eq!(s.smooth("r", 2), 2);
        assert_eq!(s.smooth("r", 4), 3);
        // History [2, 2, 4]: mean 2.67, std 0.94; 40 has z ≈ 39.6.
        let smoothed = s.smooth("r", 40);
        assert!(smoothed <= 3, "spike leaked through: {smoothed}");
    }

    #[test]
    fn smoothed_totals_stay_within_people() {
        let mut agg = DetectionAggregator::new().with_smoothing(CountSmoother::new(3, 0.1, 3.0));
        let now = Utc::now();
        for _ in 0..3 {
            agg.apply(
                CountsUpdate {
                    total_violations: 5,
                    total_people: Some(5),
                    robot_id: Some("temi-1".into()),
                    ..Default::default()
                },
                now,
            );
        }
        let snap = agg.apply(
            CountsUpdate {
                total_violations: 1,
                total_people: Some(1),
                robot_id: Some("temi-1".into()),
                ..Default::default()
            },
            now,
        );
        assert_eq!(snap.total_violations, Some(1));
        assert_eq!(snap.total_people, 1);
    }

    #[test]
    fn closures_and_shared_aggregators_are_sources() {
        let fixed = || ViolationSnapshot {
            total_violations: Some(2),
            ..Default::default()
        };
        assert_eq!(SnapshotSource::snapshot(&fixed).violations(), 2);

        let agg = Arc::new(Mutex::new(DetectionAggregator::new()));
        let source = shared_source(Arc::clone(&agg));
        agg.lock().unwrap().apply(
            CountsUpdate {
                total_violations: 1,
                total_people: Some(2),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(source.snapshot().violations(), 1);
    }
}
