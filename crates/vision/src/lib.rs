//! Frame-to-detection pipeline with single-in-flight backpressure.
//!
//! The crate is split into focused modules:
//! - `pipeline`: preprocessing, the coordinator worker, result dispatch,
//!   configuration, and telemetry setup.
//! - `perf`: milestone-driven memory and storage sampling.

/// Re-export the pipeline surface so callers can run it without reaching into
/// submodules.
pub use pipeline::{
    Admission, DetectionListener, FrameGate, Notification, PerfOptions, Pipeline, PipelineConfig,
    PipelineError, PresentationQueue, RunArgs, SourceKind, StatsSnapshot, TelemetryOptions,
};

pub mod perf;
pub mod pipeline;
