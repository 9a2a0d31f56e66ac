//! Host lifecycle glue around the pipeline.
//!
//! `AppController` maps create / resume / pause / destroy moments onto
//! pipeline calls and triggers the matching resource milestones. `run` drives
//! one controller from the command line until Ctrl+C or the run limit.

use std::{
    fs::File,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use ml_core::{Detector, HeuristicDetector};
use tracing::{info, warn};
use video_ingest::{FrameSource, SyntheticConfig, SyntheticSource};
use vision::{
    Pipeline, PipelineConfig, PresentationQueue, SourceKind,
    perf::{self, Milestone, ProbeContext},
    pipeline::telemetry,
};

use crate::overlay::ConsoleOverlay;

const PRESENT_POLL: Duration = Duration::from_millis(100);

/// Decides whether frame capture may start.
pub trait PermissionGate {
    /// `Err` carries a human readable reason for the denial.
    fn check(&self) -> Result<(), String>;
}

/// Sources that need no permission, such as the synthetic pattern.
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Grants access when the capture device node can be opened for reading.
pub struct DeviceAccessGate {
    device: PathBuf,
}

impl DeviceAccessGate {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl PermissionGate for DeviceAccessGate {
    fn check(&self) -> Result<(), String> {
        File::open(&self.device)
            .map(|_| ())
            .map_err(|err| format!("cannot read {}: {err}", self.device.display()))
    }
}

/// Gate matching a configured source: device nodes and bare indices are
/// checked, anything else (files, network URIs) is let through.
pub fn permission_gate(source: &SourceKind) -> Box<dyn PermissionGate> {
    match source {
        SourceKind::Synthetic => Box::new(AlwaysGranted),
        SourceKind::Camera(uri) if uri.starts_with("/dev/") => {
            Box::new(DeviceAccessGate::new(uri.as_str()))
        }
        SourceKind::Camera(uri) => match uri.parse::<u32>() {
            Ok(index) => Box::new(DeviceAccessGate::new(format!("/dev/video{index}"))),
            Err(_) => Box::new(AlwaysGranted),
        },
    }
}

pub fn build_source(config: &PipelineConfig) -> Result<Box<dyn FrameSource>> {
    match &config.source {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            width: config.width,
            height: config.height,
            fps: config.fps,
            rotation: config.rotation,
            mirrored: config.mirrored,
        }))),
        #[cfg(feature = "opencv")]
        SourceKind::Camera(uri) => Ok(Box::new(
            video_ingest::CameraSource::new(uri.as_str(), (config.width, config.height), config.fps)
                .with_orientation(config.rotation, config.mirrored),
        )),
        #[cfg(not(feature = "opencv"))]
        SourceKind::Camera(uri) => {
            bail!("camera source {uri} requires building with the `opencv` feature")
        }
    }
}

/// Owns the pipeline and its source across lifecycle transitions.
pub struct AppController {
    pipeline: Pipeline,
    source: Box<dyn FrameSource>,
    gate: Box<dyn PermissionGate>,
    probe: Option<ProbeContext>,
    resumes: u64,
}

impl AppController {
    /// Build the pipeline once the presentation surface exists.
    pub fn on_create(
        config: &PipelineConfig,
        detector: Box<dyn Detector>,
        source: Box<dyn FrameSource>,
        gate: Box<dyn PermissionGate>,
    ) -> (Self, PresentationQueue) {
        let mut probe = config
            .perf
            .enabled
            .then(|| ProbeContext::new(&config.perf.data_dir));
        if let Some(ctx) = probe.as_mut() {
            perf::log_all(ctx, Milestone::SurfaceReady);
        }

        let (pipeline, queue) = Pipeline::from_config(config, detector);
        let controller = Self {
            pipeline,
            source,
            gate,
            probe,
            resumes: 0,
        };
        (controller, queue)
    }

    /// Check capture permission and (re)bind the source.
    ///
    /// Returns `Ok(false)` when permission is denied; the pipeline stays idle
    /// until the next resume.
    pub fn on_resume(&mut self) -> Result<bool> {
        if let Err(reason) = self.gate.check() {
            warn!("capture permission denied: {reason}");
            return Ok(false);
        }

        self.pipeline
            .start(self.source.as_mut())
            .context("failed to start pipeline")?;
        self.resumes += 1;
        if self.resumes > 1 {
            info!(resumes = self.resumes, "camera restarted");
        }
        if let Some(ctx) = self.probe.as_mut() {
            perf::log_all(ctx, Milestone::CameraRestarted);
        }
        Ok(true)
    }

    pub fn on_pause(&mut self) {
        self.pipeline.unbind_source();
    }

    pub fn on_destroy(&mut self) {
        self.pipeline.stop();
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// Run the demo until Ctrl+C, the configured duration, or the source ends.
pub fn run(config: PipelineConfig) -> Result<()> {
    let _telemetry = telemetry::enter_runtime(&config.telemetry);
    if config.telemetry.print_metrics {
        telemetry::init_metrics_recorder()?;
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    if config.detector.model_path.is_some() {
        warn!("model files are not used by the heuristic detector; ignoring --model");
    }
    let source = build_source(&config)?;
    let gate = permission_gate(&config.source);
    let detector = Box::new(HeuristicDetector::new());
    let (mut controller, mut queue) = AppController::on_create(&config, detector, source, gate);

    if !controller.on_resume()? {
        controller.on_destroy();
        bail!("capture permission denied for {:?}", config.source);
    }

    let (width, height) = if config.rotation.swaps_axes() {
        (config.height, config.width)
    } else {
        (config.width, config.height)
    };
    let mut overlay = ConsoleOverlay::new(width, height);
    let deadline = config.duration.map(|limit| Instant::now() + limit);
    info!("Running detection pipeline, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) && controller.pipeline().is_bound() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        queue.pump_timeout(&mut overlay, PRESENT_POLL);
    }

    controller.on_pause();
    controller.on_destroy();
    queue.pump(&mut overlay);

    let stats = controller.pipeline().stats();
    info!(
        accepted = stats.accepted,
        dropped_busy = stats.dropped_busy,
        detected = stats.detected,
        empty = stats.empty,
        "run finished"
    );
    if config.telemetry.print_metrics {
        if let Some(text) = telemetry::render_metrics() {
            println!("{text}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fmt, sync::Mutex, thread, time::Duration};

    use tracing::{
        Event, Subscriber,
        field::{Field, Visit},
    };
    use tracing_subscriber::{
        layer::{Context as LayerContext, Layer, SubscriberExt},
        registry,
    };
    use video_ingest::{Frame, FrameFormat, ReplaySource};
    use vision::Admission;

    use super::*;

    /// Records the `milestone` field of every resource sampling event.
    #[derive(Clone, Default)]
    struct MilestoneLog(Arc<Mutex<Vec<String>>>);

    impl MilestoneLog {
        fn events(&self) -> Vec<String> {
            self.0.lock().expect("milestone log").clone()
        }
    }

    impl<S: Subscriber> Layer<S> for MilestoneLog {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            if event.metadata().target() != "app_performance" {
                return;
            }
            let mut field = MilestoneField(None);
            event.record(&mut field);
            if let Some(milestone) = field.0 {
                self.0.lock().expect("milestone log").push(milestone);
            }
        }
    }

    struct MilestoneField(Option<String>);

    impl Visit for MilestoneField {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "milestone" {
                self.0 = Some(value.to_string());
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "milestone" && self.0.is_none() {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    struct Denied;

    impl PermissionGate for Denied {
        fn check(&self) -> Result<(), String> {
            Err("user declined".into())
        }
    }

    fn quiet_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.perf.enabled = false;
        config
    }

    fn lit_frame(id: u64) -> Frame {
        Frame::new(id, 8, 8, FrameFormat::Rgba8, vec![255; 8 * 8 * 4])
    }

    fn dark_frame(id: u64) -> Frame {
        let data = [0, 0, 0, 255].repeat(8 * 8);
        Frame::new(id, 8, 8, FrameFormat::Rgba8, data)
    }

    fn replay() -> Box<dyn FrameSource> {
        Box::new(ReplaySource::new("test", vec![lit_frame(1)], Duration::ZERO))
    }

    #[test]
    fn device_gate_requires_readable_node() {
        let dir = tempfile::tempdir().expect("temp dir");
        let node = dir.path().join("video0");
        assert!(DeviceAccessGate::new(&node).check().is_err());
        std::fs::write(&node, b"").expect("create node");
        assert!(DeviceAccessGate::new(&node).check().is_ok());
    }

    #[test]
    fn gate_selection_follows_source() {
        assert!(permission_gate(&SourceKind::Synthetic).check().is_ok());
        assert!(
            permission_gate(&SourceKind::Camera("rtsp://cam.local/stream".into()))
                .check()
                .is_ok()
        );
    }

    #[test]
    fn denied_permission_keeps_pipeline_idle() {
        let config = quiet_config();
        let (mut controller, _queue) = AppController::on_create(
            &config,
            Box::new(HeuristicDetector::new()),
            replay(),
            Box::new(Denied),
        );
        assert!(!controller.on_resume().expect("denial is not an error"));
        assert!(!controller.pipeline().is_running());
        controller.on_destroy();
    }

    #[test]
    fn resume_pause_resume_rebinds_and_detects() {
        let config = quiet_config();
        let (mut controller, mut queue) = AppController::on_create(
            &config,
            Box::new(HeuristicDetector::new()),
            replay(),
            Box::new(AlwaysGranted),
        );
        assert!(controller.on_resume().expect("first resume"));
        let mut overlay = ConsoleOverlay::new(8, 8);
        assert_eq!(queue.pump_timeout(&mut overlay, Duration::from_secs(5)), 1);
        assert_eq!(overlay.detections(), 1);

        controller.on_pause();
        assert!(!controller.pipeline().is_bound());
        // The replay source hands its frames out once, so rebinding fails.
        assert!(controller.on_resume().is_err());
        assert!(controller.pipeline().is_running());

        controller.on_destroy();
        assert!(!controller.pipeline().is_running());
    }

    #[test]
    fn milestones_follow_lifecycle_and_detections() {
        let log = MilestoneLog::default();
        let _guard = tracing::subscriber::set_default(registry().with(log.clone()));

        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = PipelineConfig::default();
        config.perf.data_dir = dir.path().to_path_buf();

        let (mut controller, mut queue) = AppController::on_create(
            &config,
            Box::new(HeuristicDetector::new()),
            replay(),
            Box::new(AlwaysGranted),
        );
        assert!(controller.on_resume().expect("resume"));

        let mut overlay = ConsoleOverlay::new(8, 8);
        assert_eq!(queue.pump_timeout(&mut overlay, Duration::from_secs(5)), 1);
        assert_eq!(overlay.detections(), 1);

        // The slot frees once the first result has been handed off.
        let gate = controller.pipeline().frame_gate().expect("worker running");
        let mut attempts = 0;
        while gate.offer(dark_frame(2)) != Admission::Accepted {
            attempts += 1;
            assert!(attempts < 500, "processing slot never freed");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(queue.pump_timeout(&mut overlay, Duration::from_secs(5)), 1);
        assert!(overlay.boxes().is_empty());
        controller.on_destroy();

        let events = log.events();
        let mut sequence = events.clone();
        sequence.dedup();
        assert_eq!(
            sequence,
            vec![
                "surface_ready",
                "detector_ready",
                "camera_bound",
                "camera_restarted",
                "detection_dispatched",
            ]
        );
        // Header, four heap figures and two device memory figures at least.
        for milestone in &sequence {
            let count = events.iter().filter(|event| *event == milestone).count();
            assert!(count >= 7, "{milestone} emitted only {count} events");
        }
    }
}
