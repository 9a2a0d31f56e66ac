//! Configuration parsing for the detection pipeline.
//!
//! This module turns CLI arguments into a `PipelineConfig`, so downstream
//! stages never have to re-parse flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use ml_core::DetectorEnv;
use video_ingest::Rotation;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum SourceKind {
    /// Built-in moving test pattern.
    Synthetic,
    /// Camera URI or device index, opened through OpenCV.
    Camera(String),
}

impl SourceKind {
    pub(crate) fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "synthetic" => SourceKind::Synthetic,
            other => SourceKind::Camera(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    pub source: SourceKind,
    /// Capture width requested from the source.
    pub width: u32,
    /// Capture height requested from the source.
    pub height: u32,
    pub fps: f64,
    /// Rotation that brings source frames upright.
    pub rotation: Rotation,
    /// Front-facing source; frames are mirrored after rotation.
    pub mirrored: bool,
    /// Passed through to the detector's `setup`.
    pub detector: DetectorEnv,
    pub perf: PerfOptions,
    pub telemetry: TelemetryOptions,
    /// Stop after this long; run until interrupted when absent.
    pub duration: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            width: 640,
            height: 480,
            fps: 30.0,
            rotation: Rotation::Deg90,
            mirrored: false,
            detector: DetectorEnv::default(),
            perf: PerfOptions::default(),
            telemetry: TelemetryOptions::default(),
            duration: None,
        }
    }
}

#[derive(Clone, Debug)]
/// Milestone resource sampling.
pub struct PerfOptions {
    pub enabled: bool,
    /// Directory whose partition is reported as app storage.
    pub data_dir: PathBuf,
}

impl Default for PerfOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("."),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and metrics output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Render the Prometheus exposition when the run ends.
    pub print_metrics: bool,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Frame source: `synthetic` or a camera URI / device index.
    #[arg(long = "source", value_name = "URI", default_value = "synthetic")]
    pub source: String,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Capture rate in frames per second.
    #[arg(long = "fps", value_name = "FPS", default_value_t = 30.0)]
    pub fps: f64,
    /// Clockwise rotation applied to every frame (0, 90, 180 or 270).
    #[arg(long = "rotation", value_name = "DEG", default_value_t = 90, allow_negative_numbers = true)]
    pub rotation: i32,
    /// Treat the source as front-facing and mirror frames.
    #[arg(long = "front-facing", action = clap::ArgAction::SetTrue)]
    pub front_facing: bool,
    /// Model file handed to the detector.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Label file, one class name per line.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Minimum confidence for a box to be reported.
    #[arg(long = "confidence", value_name = "SCORE", default_value_t = 0.25)]
    pub confidence: f32,
    /// Overlap above which same-class boxes are suppressed.
    #[arg(long = "iou", value_name = "RATIO", default_value_t = 0.5)]
    pub iou: f32,
    /// Disable milestone resource logging.
    #[arg(long = "no-perf", action = clap::ArgAction::SetTrue)]
    pub no_perf: bool,
    /// Directory sampled for app storage figures.
    #[arg(long = "data-dir", value_name = "PATH", default_value = ".")]
    pub data_dir: PathBuf,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Print Prometheus metrics on exit.
    #[arg(long = "print-metrics", action = clap::ArgAction::SetTrue)]
    pub print_metrics: bool,
    /// Stop after this many seconds.
    #[arg(long = "duration-secs", value_name = "SECS")]
    pub duration_secs: Option<u64>,
}

impl TryFrom<RunArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive integers");
        }
        if !args.fps.is_finite() || args.fps <= 0.0 {
            bail!("--fps must be a positive number");
        }
        let Some(rotation) = Rotation::from_degrees(args.rotation) else {
            bail!("--rotation must be a multiple of 90, got {}", args.rotation);
        };
        if !(args.confidence > 0.0 && args.confidence <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if !(args.iou > 0.0 && args.iou <= 1.0) {
            bail!("--iou must be in (0, 1]");
        }
        if args.duration_secs == Some(0) {
            bail!("--duration-secs must be at least 1");
        }

        let detector = DetectorEnv {
            model_path: args.model,
            labels_path: args.labels,
            confidence_threshold: args.confidence,
            iou_threshold: args.iou,
        };

        Ok(Self {
            source: SourceKind::parse(&args.source),
            width: args.width,
            height: args.height,
            fps: args.fps,
            rotation,
            mirrored: args.front_facing,
            detector,
            perf: PerfOptions {
                enabled: !args.no_perf,
                data_dir: args.data_dir,
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                print_metrics: args.print_metrics,
            },
            duration: args.duration_secs.map(Duration::from_secs),
        })
    }
}
