//! `vigil-runtime` – The Patrol Control Plane
//!
//! Drives robots along routes, gates each waypoint on the live detection
//! feed, and keeps the fleet to one active run per robot.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`PatrolOrchestrator`][orchestrator::PatrolOrchestrator]:
//!   the per-robot patrol state machine (goto with retries, arrival timeout,
//!   pause/resume, looping, low-battery return).
//! - [`inspection`] – [`InspectionOrchestrator`][inspection::InspectionOrchestrator]:
//!   a single pass over a route that first makes sure the detection pipeline
//!   is running and reports a count per waypoint.
//! - `detection_gate` – the per-waypoint wait for a clean detection
//!   snapshot, with grace period and timeout.
//! - `actions` – speech, webview display, auto-close and dwell at a
//!   waypoint.
//! - [`registry`] – [`PatrolRegistry`][registry::PatrolRegistry]: robot id →
//!   active run, shared violation debouncing and alert fan-out.
//! - [`router`] – [`TelemetryRouter`][router::TelemetryRouter]: dispatches
//!   inbound robot and detection messages to the registry.
//! - [`collaborators`] – journal, route, alert and pipeline seams, with
//!   in-process defaults.
//! - [`context`] – [`PatrolContext`][context::PatrolContext]: the bus,
//!   settings and collaborators every orchestrator shares.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.
//!
//! # Cancellation
//!
//! Workers never block on an unbounded wait.  Every sleep goes through the
//! internal `Pacer`, which wakes on stop, pause, resume and arrival so that
//! a stop request takes effect within one poll interval.

pub(crate) mod actions;
pub mod collaborators;
pub mod context;
pub(crate) mod detection_gate;
pub mod inspection;
pub mod orchestrator;
pub(crate) mod pacing;
pub mod registry;
pub mod router;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use collaborators::{
    AlertDispatcher, NoopAlerts, PatrolJournal, PipelineControl, RouteSource, StaticRoutes,
    TracingJournal,
};
pub use context::{FinishHook, FinishedRun, PatrolContext};
pub use inspection::InspectionOrchestrator;
pub use orchestrator::PatrolOrchestrator;
pub use registry::PatrolRegistry;
pub use router::TelemetryRouter;
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing, init_tracing_with};
