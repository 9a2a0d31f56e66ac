//! Camera-to-detector pipeline.
//!
//! Frames flow from a bound [`FrameSource`] through an intake thread into the
//! [`FrameGate`], which admits at most one frame at a time. The single worker
//! thread normalizes the frame, runs the detector, and hands the outcome to the
//! [`PresentationQueue`] returned from [`Pipeline::new`].

pub mod config;
mod coordinator;
mod dispatch;
pub mod preprocess;
mod stats;
pub mod telemetry;

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ml_core::{Detector, DetectorEnv, DetectorError};
use thiserror::Error;
use tracing::{error, info, warn};
use video_ingest::{CaptureError, FrameSource, FrameStream};

pub use config::{PerfOptions, PipelineConfig, RunArgs, SourceKind, TelemetryOptions};
pub use coordinator::{Admission, FrameGate};
pub use dispatch::{DetectionListener, Notification, PresentationQueue};
pub use preprocess::{NormalizedImage, PreprocessError, normalize, preprocess};
pub use stats::StatsSnapshot;

use crate::perf::{self, Milestone, ProbeContext};
use coordinator::{Coordinator, SpawnError};
use dispatch::ResultDispatcher;
use stats::PipelineStats;

const INTAKE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to bind frame source {source_name}")]
    SourceBinding {
        source_name: String,
        #[source]
        cause: CaptureError,
    },
    #[error(transparent)]
    DetectorSetup(DetectorError),
    #[error("pipeline has been stopped")]
    Stopped,
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str, #[source] io::Error),
}

/// Thread forwarding frames from an open stream into the gate.
struct Intake {
    running: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Intake {
    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        if self.handle.join().is_err() {
            error!("frame intake thread panicked");
        }
    }
}

/// Owns the worker, the current source binding, and the detector lifecycle.
///
/// `start` may be called again after `unbind_source` to rebind (for example on
/// resume); `stop` is final, idempotent, and safe without a prior `start`.
pub struct Pipeline {
    detector: Option<Box<dyn Detector>>,
    env: DetectorEnv,
    dispatcher: Option<ResultDispatcher>,
    coordinator: Option<Coordinator>,
    intake: Option<Intake>,
    running: Arc<AtomicBool>,
    stopped: bool,
    stats: Arc<PipelineStats>,
    probe: Option<ProbeContext>,
}

impl Pipeline {
    pub fn new(detector: Box<dyn Detector>, env: DetectorEnv) -> (Self, PresentationQueue) {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PipelineStats::default());
        let (dispatcher, rx) = dispatch::channel(running.clone(), stats.clone());
        let pipeline = Self {
            detector: Some(detector),
            env,
            dispatcher: Some(dispatcher),
            coordinator: None,
            intake: None,
            running,
            stopped: false,
            stats,
            probe: None,
        };
        (pipeline, PresentationQueue::new(rx))
    }

    /// Build a pipeline from CLI configuration, wiring milestone sampling on
    /// both the control side and the presentation side when enabled.
    pub fn from_config(
        config: &PipelineConfig,
        detector: Box<dyn Detector>,
    ) -> (Self, PresentationQueue) {
        let (pipeline, queue) = Self::new(detector, config.detector.clone());
        if !config.perf.enabled {
            return (pipeline, queue);
        }
        let data_dir = &config.perf.data_dir;
        (
            pipeline.with_probe(ProbeContext::new(data_dir)),
            queue.with_probe(ProbeContext::new(data_dir)),
        )
    }

    /// Sample resources when the detector becomes ready and whenever a
    /// source is bound.
    pub fn with_probe(mut self, probe: ProbeContext) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Bind `source` and begin processing.
    ///
    /// The first call sets up the detector on the worker thread. A source that
    /// is already bound is released before `source` is opened. Binding
    /// failures leave the worker idle and are returned to the caller.
    pub fn start(&mut self, source: &mut dyn FrameSource) -> Result<(), PipelineError> {
        self.setup_detector()?;
        self.unbind_source();

        let source_name = source.describe();
        let stream = source.open().map_err(|cause| {
            error!(source = %source_name, "failed to bind frame source: {cause}");
            PipelineError::SourceBinding {
                source_name: source_name.clone(),
                cause,
            }
        })?;

        let Some(gate) = self.coordinator.as_ref().map(|c| c.gate().clone()) else {
            return Err(PipelineError::Stopped);
        };
        self.intake = Some(spawn_intake(stream, gate, &source_name)?);
        info!(source = %source_name, "frame source bound");
        self.milestone(Milestone::CameraBound);
        Ok(())
    }

    /// Bring the worker up and run detector setup without binding a source.
    ///
    /// Does nothing once the worker is running; [`start`](Self::start) calls
    /// this on first use.
    pub fn setup_detector(&mut self) -> Result<(), PipelineError> {
        if self.stopped {
            return Err(PipelineError::Stopped);
        }
        if self.coordinator.is_none() {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Detach the current source, if any. The worker and detector stay up.
    pub fn unbind_source(&mut self) {
        if let Some(intake) = self.intake.take() {
            intake.stop();
            info!("frame source unbound");
        }
    }

    /// Stop accepting frames, let the in-flight frame finish, release the
    /// detector, and shut the worker down.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(coordinator) = self.coordinator.as_ref() {
            coordinator.gate().close();
        }
        self.unbind_source();
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.shutdown();
        }
        self.detector = None;
        self.dispatcher = None;

        let snapshot = self.stats.snapshot();
        info!(
            accepted = snapshot.accepted,
            dropped_busy = snapshot.dropped_busy,
            invalid = snapshot.invalid,
            detector_failures = snapshot.detector_failures,
            "pipeline stopped"
        );
    }

    /// Handle for pushing frames directly, bypassing any bound source.
    pub fn frame_gate(&self) -> Option<FrameGate> {
        self.coordinator.as_ref().map(|c| c.gate().clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the worker is up and accepting frames.
    pub fn is_running(&self) -> bool {
        self.coordinator.is_some() && !self.stopped
    }

    /// Whether a source is attached and still delivering frames.
    pub fn is_bound(&self) -> bool {
        self.intake
            .as_ref()
            .is_some_and(|intake| !intake.handle.is_finished())
    }

    fn spawn_worker(&mut self) -> Result<(), PipelineError> {
        let (Some(detector), Some(dispatcher)) = (self.detector.take(), self.dispatcher.take())
        else {
            return Err(PipelineError::Stopped);
        };
        let coordinator = Coordinator::spawn(
            detector,
            self.env.clone(),
            dispatcher,
            self.running.clone(),
            self.stats.clone(),
        )
        .map_err(|err| match err {
            SpawnError::Thread(err) => PipelineError::Spawn("detector worker", err),
            SpawnError::Setup(err) => {
                error!("detector setup failed: {err}");
                PipelineError::DetectorSetup(err)
            }
        });
        // A failed setup consumes the detector; the pipeline cannot recover.
        let coordinator = match coordinator {
            Ok(coordinator) => coordinator,
            Err(err) => {
                self.stopped = true;
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.coordinator = Some(coordinator);
        info!("detector ready");
        self.milestone(Milestone::DetectorReady);
        Ok(())
    }

    fn milestone(&mut self, milestone: Milestone) {
        if let Some(probe) = self.probe.as_mut() {
            perf::log_all(probe, milestone);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_intake(
    stream: FrameStream,
    gate: FrameGate,
    source_name: &str,
) -> Result<Intake, PipelineError> {
    let running = Arc::new(AtomicBool::new(true));
    let intake_running = running.clone();
    let source_name = source_name.to_string();

    let handle = telemetry::spawn_thread("vision-intake", move || {
        while intake_running.load(Ordering::Relaxed) {
            match stream.recv_timeout(INTAKE_POLL) {
                Ok(Some(frame)) => {
                    if gate.offer(frame) == Admission::Closed {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(CaptureError::Closed { .. }) => {
                    info!(source = %source_name, "frame source finished");
                    break;
                }
                Err(err) => {
                    warn!(source = %source_name, "frame source failed: {err}");
                    break;
                }
            }
        }
        stream.close();
    })
    .map_err(|err| PipelineError::Spawn("frame intake", err))?;

    Ok(Intake { running, handle })
}
