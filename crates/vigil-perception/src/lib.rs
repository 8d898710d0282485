//! `vigil-perception` – signal processing over the detection feed.
//!
//! Turns the raw, noisy output of the safety-violation detection pipeline
//! into values an orchestrator can act on.
//!
//! # Modules
//!
//! - [`debounce`] – [`ViolationDebouncer`][debounce::ViolationDebouncer]:
//!   per-waypoint rolling window with confidence floor, outlier rejection,
//!   count threshold and a confidence EMA.
//! - [`aggregate`] – [`DetectionAggregator`][aggregate::DetectionAggregator]:
//!   clamps whole-frame totals, optionally smooths them per robot, and serves
//!   them through [`SnapshotSource`][aggregate::SnapshotSource].
//! - [`position`] – [`PositionTracker`][position::PositionTracker]: current
//!   pose and bounded pose history per robot.

pub mod aggregate;
pub mod debounce;
pub mod position;

pub use aggregate::{
    CountSmoother, CountsUpdate, DetectionAggregator, SnapshotSource, clamp_counts, shared_source,
};
pub use debounce::{
    DebounceConfig, DebounceSummary, Decision, ViolationDebouncer, ViolationObservation,
    WindowStats,
};
pub use position::{PositionSample, PositionTracker};
