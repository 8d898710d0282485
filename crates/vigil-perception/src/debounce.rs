//! Violation Signal Processor.
//!
//! Turns the noisy, high-frequency stream of individual violation detections
//! into a stable "report / don't report" decision per waypoint.
//!
//! Each `(patrol, waypoint)` pair owns a time-ordered window of accepted
//! observations.  A new observation goes through these stages:
//!
//! | Stage | Rejects when |
//! |---|---|
//! | Confidence floor | `confidence < min_confidence` |
//! | Window pruning | (drops entries older than `window` before the newest) |
//! | Outlier test | the prior window has ≥ 2 entries, a non-zero sample stdev, and `|z| > outlier_threshold` |
//! | Count threshold | the window holds fewer than `violation_threshold` entries |
//!
//! Outliers are never inserted, so a single spike cannot push a waypoint over
//! the threshold.  Independently of the decision, an exponential moving
//! average of accepted confidences is kept per patrol:
//!
//! ```text
//! ema = α * confidence + (1 − α) * ema      (ema starts at 0)
//! ```
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use uuid::Uuid;
//! use vigil_perception::debounce::{DebounceConfig, ViolationDebouncer, ViolationObservation};
//!
//! let mut debouncer = ViolationDebouncer::new(DebounceConfig::default());
//! let patrol = Uuid::new_v4();
//! let t0 = Utc::now();
//!
//! let mut last = None;
//! for i in 0..3 {
//!     let obs = ViolationObservation::new(t0 + Duration::seconds(i), 0.9, "no_helmet", 0);
//!     last = Some(debouncer.observe(patrol, obs));
//! }
//! assert!(last.unwrap().should_report);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tuning for [`ViolationDebouncer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Rolling window length in seconds.
    pub window_secs: f64,
    /// Observations required in the window before reporting.
    pub violation_threshold: usize,
    /// EMA smoothing factor α in `[0, 1]`.
    pub smoothing_factor: f64,
    /// Absolute z-score above which an observation is an outlier.
    pub outlier_threshold: f64,
    /// Observations below this confidence are ignored.
    pub min_confidence: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_secs: 10.0,
            violation_threshold: 3,
            smoothing_factor: 0.3,
            outlier_threshold: 3.0,
            min_confidence: 0.5,
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        vigil_types::secs(self.window_secs)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ────────────────────────────────────────────────────────────────────────────

/// One raw detection fed to the debouncer.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationObservation {
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    /// Classification label, e.g. `"no_helmet"`.
    pub label: String,
    pub waypoint_index: usize,
}

impl ViolationObservation {
    pub fn new(
        timestamp: DateTime<Utc>,
        confidence: f64,
        label: impl Into<String>,
        waypoint_index: usize,
    ) -> Self {
        Self {
            timestamp,
            confidence,
            label: label.into(),
            waypoint_index,
        }
    }
}

/// Outcome of [`ViolationDebouncer::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub should_report: bool,
    /// Human-readable explanation, suitable for the activity log.
    pub reason: String,
}

impl Decision {
    fn report(reason: String) -> Self {
        Self {
            should_report: true,
            reason,
        }
    }

    fn suppress(reason: String) -> Self {
        Self {
            should_report: false,
            reason,
        }
    }
}

/// Statistics over one waypoint window.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub mean_confidence: f64,
    pub std_deviation: f64,
    /// Distinct labels, sorted.
    pub labels: Vec<String>,
}

/// Per-patrol tally.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DebounceSummary {
    /// Every observation submitted, including rejected ones.
    pub observations: u64,
    /// Observations that produced a report.
    pub triggers: u64,
    /// `triggers / observations`, `0.0` when nothing was observed.
    pub effectiveness: f64,
}

#[derive(Debug, Default)]
struct PatrolTally {
    observations: u64,
    triggers: u64,
    ema: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// ViolationDebouncer
// ────────────────────────────────────────────────────────────────────────────

/// Windowed debounce over violation observations, keyed by
/// `(patrol run id, waypoint index)`.
#[derive(Debug)]
pub struct ViolationDebouncer {
    config: DebounceConfig,
    window: TimeDelta,
    windows: HashMap<(Uuid, usize), Vec<ViolationObservation>>,
    tallies: HashMap<Uuid, PatrolTally>,
}

impl ViolationDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        let window = TimeDelta::from_std(config.window()).unwrap_or(TimeDelta::MAX);
        Self {
            config,
            window,
            windows: HashMap::new(),
            tallies: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Feed one observation and decide whether it should be reported.
    pub fn observe(&mut self, patrol_id: Uuid, obs: ViolationObservation) -> Decision {
        let tally = self.tallies.entry(patrol_id).or_default();
        tally.observations += 1;

        if obs.confidence < self.config.min_confidence {
            debug!(%patrol_id, confidence = obs.confidence, "observation below confidence floor");
            return Decision::suppress(format!(
                "confidence {:.2} below minimum {:.2}",
                obs.confidence, self.config.min_confidence
            ));
        }

        let key = (patrol_id, obs.waypoint_index);
        let entries = self.windows.entry(key).or_default();
        let newest = entries
            .last()
            .map_or(obs.timestamp, |last| last.timestamp.max(obs.timestamp));
        prune(entries, newest - self.window);

        if entries.len() >= 2 {
            let confidences: Vec<f64> = entries.iter().map(|o| o.confidence).collect();
            let mean = mean(&confidences);
            let stdev = sample_stdev(&confidences, mean);
            if stdev > 0.0 {
                let z = (obs.confidence - mean) / stdev;
                if z.abs() > self.config.outlier_threshold {
                    debug!(%patrol_id, waypoint = obs.waypoint_index, z, "outlier rejected");
                    return Decision::suppress(format!("outlier rejected (z={z:.2})"));
                }
            }
        }

        let alpha = self.config.smoothing_factor;
        tally.ema = alpha * obs.confidence + (1.0 - alpha) * tally.ema;

        let label = obs.label.clone();
        let at = entries.partition_point(|o| o.timestamp <= obs.timestamp);
        entries.insert(at, obs);

        let count = entries.len();
        let threshold = self.config.violation_threshold;
        if count < threshold {
            return Decision::suppress(format!(
                "insufficient observations in window ({count}/{threshold})"
            ));
        }

        tally.triggers += 1;
        let same_label = entries.iter().filter(|o| o.label == label).count();
        let avg = mean(&entries.iter().map(|o| o.confidence).collect::<Vec<_>>());
        info!(
            %patrol_id,
            waypoint = key.1,
            %label,
            count,
            mean_confidence = avg,
            "violation confirmed"
        );
        Decision::report(format!(
            "{same_label}/{count} {label} observations in window (mean confidence {avg:.2})"
        ))
    }

    /// Accepted observations for one waypoint, oldest first.
    pub fn window(&self, patrol_id: Uuid, waypoint_index: usize) -> &[ViolationObservation] {
        self.windows
            .get(&(patrol_id, waypoint_index))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn stats(&self, patrol_id: Uuid, waypoint_index: usize) -> WindowStats {
        let entries = self.window(patrol_id, waypoint_index);
        if entries.is_empty() {
            return WindowStats::default();
        }
        let confidences: Vec<f64> = entries.iter().map(|o| o.confidence).collect();
        let mean = mean(&confidences);
        let labels: BTreeSet<&str> = entries.iter().map(|o| o.label.as_str()).collect();
        WindowStats {
            count: entries.len(),
            mean_confidence: mean,
            std_deviation: sample_stdev(&confidences, mean),
            labels: labels.into_iter().map(str::to_string).collect(),
        }
    }

    /// Smoothed confidence trend of the patrol; `0.0` before any accepted
    /// observation.
    pub fn confidence_trend(&self, patrol_id: Uuid) -> f64 {
        self.tallies.get(&patrol_id).map_or(0.0, |t| t.ema)
    }

    pub fn summary(&self, patrol_id: Uuid) -> DebounceSummary {
        self.tallies
            .get(&patrol_id)
            .map(|t| DebounceSummary {
                observations: t.observations,
                triggers: t.triggers,
                effectiveness: if t.observations == 0 {
                    0.0
                } else {
                    t.triggers as f64 / t.observations as f64
                },
            })
            .unwrap_or_default()
    }

    /// Drop every window of the patrol and return its final tally.
    pub fn finish_patrol(&mut self, patrol_id: Uuid) -> DebounceSummary {
        let summary = self.summary(patrol_id);
        self.windows.retain(|(id, _), _| *id != patrol_id);
        self.tallies.remove(&patrol_id);
        debug!(%patrol_id, observations = summary.observations, "debounce state discarded");
        summary
    }

    pub fn reset(&mut self) {
        self.windows.clear();
        self.tallies.clear();
    }
}

fn prune(entries: &mut Vec<ViolationObservation>, cutoff: DateTime<Utc>) {
    let stale = entries.partition_point(|o| o.timestamp < cutoff);
    entries.drain(..stale);
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t0 + ChronoDuration::seconds(secs)
    }

    fn obs(t: DateTime<Utc>, confidence: f64, waypoint: usize) -> ViolationObservation {
        ViolationObservation::new(t, confidence, "no_helmet", waypoint)
    }

    #[test]
    fn third_similar_observation_is_reported() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(!d.observe(patrol, obs(t0, 0.9, 0)).should_report);
        let second = d.observe(patrol, obs(at(t0, 1), 0.9, 0));
        assert!(!second.should_report);
        assert_eq!(second.reason, "insufficient observations in window (2/3)");
        assert!(d.observe(patrol, obs(at(t0, 2), 0.9, 0)).should_report);

        let summary = d.summary(patrol);
        assert_eq!(summary.observations, 3);
        assert_eq!(summary.triggers, 1);
        assert!((summary.effectiveness - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn outlier_is_rejected_and_not_inserted() {
        let config = DebounceConfig {
            min_confidence: 0.0,
            ..Default::default()
        };
        let mut d = ViolationDebouncer::new(config);
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();

        d.observe(patrol, obs(t0, 0.88, 1));
        d.observe(patrol, obs(at(t0, 1), 0.90, 1));
        assert!(d.observe(patrol, obs(at(t0, 2), 0.92, 1)).should_report);

        let spike = d.observe(patrol, obs(at(t0, 3), 0.1, 1));
        assert!(!spike.should_report);
        assert!(spike.reason.starts_with("outlier rejected"), "{}", spike.reason);
        assert_eq!(d.stats(patrol, 1).count, 3);

        assert!(d.observe(patrol, obs(at(t0, 4), 0.9, 1)).should_report);
    }

    #[test]
    fn low_confidence_is_ignored_but_counted() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let decision = d.observe(patrol, obs(Utc::now(), 0.3, 0));
        assert!(!decision.should_report);
        assert_eq!(decision.reason, "confidence 0.30 below minimum 0.50");
        assert!(d.window(patrol, 0).is_empty());
        assert_eq!(d.summary(patrol).observations, 1);
    }

    #[test]
    fn stale_observations_are_pruned() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();
        d.observe(patrol, obs(t0, 0.9, 0));
        d.observe(patrol, obs(at(t0, 1), 0.9, 0));
        let late = d.observe(patrol, obs(at(t0, 20), 0.9, 0));
        assert!(!late.should_report);
        assert_eq!(d.window(patrol, 0).len(), 1);
    }

    #[test]
    fn late_arrivals_keep_window_ordered() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();
        d.observe(patrol, obs(at(t0, 5), 0.8, 0));
        d.observe(patrol, obs(at(t0, 2), 0.9, 0));
        d.observe(patrol, obs(at(t0, 3), 0.85, 0));
        let times: Vec<_> = d.window(patrol, 0).iter().map(|o| o.timestamp).collect();
        assert_eq!(times, vec![at(t0, 2), at(t0, 3), at(t0, 5)]);
    }

    #[test]
    fn waypoints_have_independent_windows() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();
        d.observe(patrol, obs(t0, 0.9, 0));
        d.observe(patrol, obs(at(t0, 1), 0.9, 0));
        assert!(!d.observe(patrol, obs(at(t0, 2), 0.9, 1)).should_report);
        assert_eq!(d.stats(patrol, 0).count, 2);
        assert_eq!(d.stats(patrol, 1).count, 1);
    }

    #[test]
    fn stats_list_distinct_labels() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();
        d.observe(patrol, ViolationObservation::new(t0, 0.8, "no_vest", 0));
        d.observe(patrol, ViolationObservation::new(at(t0, 1), 1.0, "no_helmet", 0));
        d.observe(patrol, ViolationObservation::new(at(t0, 2), 0.9, "no_vest", 0));
        let stats = d.stats(patrol, 0);
        assert_eq!(stats.count, 3);
        assert!((stats.mean_confidence - 0.9).abs() < 1e-9);
        assert!((stats.std_deviation - 0.1).abs() < 1e-9);
        assert_eq!(stats.labels, vec!["no_helmet", "no_vest"]);
    }

    #[test]
    fn trend_is_an_ema_from_zero() {
        let config = DebounceConfig {
            smoothing_factor: 0.5,
            ..Default::default()
        };
        let mut d = ViolationDebouncer::new(config);
        let patrol = Uuid::new_v4();
        let t0 = Utc::now();
        assert_eq!(d.confidence_trend(patrol), 0.0);
        d.observe(patrol, obs(t0, 1.0, 0));
        assert!((d.confidence_trend(patrol) - 0.5).abs() < 1e-9);
        d.observe(patrol, obs(at(t0, 1), 1.0, 0));
        assert!((d.confidence_trend(patrol) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn finishing_a_patrol_discards_its_state() {
        let mut d = ViolationDebouncer::new(DebounceConfig::default());
        let patrol = Uuid::new_v4();
        let other = Uuid::new_v4();
        let t0 = Utc::now();
        d.observe(patrol, obs(t0, 0.9, 0));
        d.observe(other, obs(t0, 0.9, 0));

        let summary = d.finish_patrol(patrol);
        assert_eq!(summary.observations, 1);
        assert!(d.window(patrol, 0).is_empty());
        assert_eq!(d.summary(patrol), DebounceSummary::default());
        assert_eq!(d.window(other, 0).len(), 1);
    }
}
