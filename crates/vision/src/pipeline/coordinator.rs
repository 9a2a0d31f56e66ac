//! Drop-while-busy admission and the single detection worker.
//!
//! A frame is admitted only if it can claim the processing slot. The claim
//! travels with the frame to the worker and is released after the outcome has
//! been handed to the presentation queue, so a second frame can never be
//! admitted while one is being converted, detected, or dispatched.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use ml_core::{Detector, DetectorEnv, DetectorError, DetectorOutput, ManagedDetector};
use tracing::{Span, debug, error, info, warn};
use video_ingest::Frame;

use crate::pipeline::{
    dispatch::ResultDispatcher,
    preprocess::preprocess,
    stats::{FrameOutcome, PipelineStats},
    telemetry,
};

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Single-occupancy processing slot: `Idle` when free, `Processing` when held.
#[derive(Default)]
pub(crate) struct ProcessingSlot {
    busy: AtomicBool,
}

impl ProcessingSlot {
    /// Claim the slot without blocking. `None` means a frame is in flight.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<SlotClaim> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotClaim { slot: self.clone() })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for as long as a frame is in flight; dropping it frees the slot.
pub(crate) struct SlotClaim {
    slot: Arc<ProcessingSlot>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Unit of work consumed by the worker thread.
pub(crate) struct FrameTask {
    frame: Frame,
    claim: SlotClaim,
    span: Span,
}

/// Result of offering a frame to the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Another frame is in flight; this one was discarded.
    DroppedBusy,
    /// The pipeline is not accepting frames; this one was discarded.
    Closed,
}

/// Entry point for frames. Cheap to clone; every clone shares one slot.
#[derive(Clone)]
pub struct FrameGate {
    slot: Arc<ProcessingSlot>,
    work_tx: Sender<FrameTask>,
    accepting: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl FrameGate {
    /// Offer a frame without blocking. Frames that are not accepted are
    /// dropped on the spot, returning their buffer to the source.
    pub fn offer(&self, frame: Frame) -> Admission {
        if !self.accepting.load(Ordering::Acquire) {
            metrics::counter!("pipeline_frames_total", "outcome" => "closed").increment(1);
            return Admission::Closed;
        }

        let Some(claim) = self.slot.try_acquire() else {
            self.stats.record(FrameOutcome::DroppedBusy);
            metrics::counter!("pipeline_frames_total", "outcome" => "dropped_busy").increment(1);
            debug!(frame = frame.id, "dropping frame, detector busy");
            return Admission::DroppedBusy;
        };

        let span = tracing::info_span!(
            "frame",
            frame = frame.id,
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms
        );
        match self.work_tx.try_send(FrameTask { frame, claim, span }) {
            Ok(()) => {
                self.stats.record(FrameOutcome::Accepted);
                metrics::counter!("pipeline_frames_total", "outcome" => "accepted").increment(1);
                Admission::Accepted
            }
            Err(TrySendError::Full(_)) => {
                // Unreachable while the claim is held, but never block here.
                self.stats.record(FrameOutcome::DroppedBusy);
                Admission::DroppedBusy
            }
            Err(TrySendError::Disconnected(_)) => Admission::Closed,
        }
    }

    /// Whether a frame is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    pub(crate) fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

/// Running worker thread plus the gate feeding it.
pub(crate) struct Coordinator {
    gate: FrameGate,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Coordinator {
    /// Spawn the worker, run detector setup on it, and wait for the outcome.
    pub(crate) fn spawn(
        detector: Box<dyn Detector>,
        env: DetectorEnv,
        dispatcher: ResultDispatcher,
        running: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, SpawnError> {
        let (work_tx, work_rx) = bounded::<FrameTask>(1);
        let (init_tx, init_rx) = bounded::<Result<(), DetectorError>>(1);
        let worker_running = running.clone();
        let worker_stats = stats.clone();

        let handle = telemetry::spawn_thread("vision-detector", move || {
            let mut detector = ManagedDetector::new(detector);
            let setup = detector.setup(&env);
            let ready = setup.is_ok();
            if init_tx.send(setup).is_err() || !ready {
                detector.clear();
                return;
            }
            drop(init_tx);

            run_worker(&mut detector, &work_rx, &dispatcher, &worker_running, &worker_stats);

            // Anything still queued was accepted but never started.
            while let Ok(task) = work_rx.try_recv() {
                debug!(frame = task.frame.id, "discarding unstarted frame on shutdown");
            }
            detector.clear();
            info!("detector worker stopped");
        })
        .map_err(SpawnError::Thread)?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(SpawnError::Setup(err));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(SpawnError::Setup(DetectorError::Setup(
                    "worker exited before reporting setup".into(),
                )));
            }
        }

        Ok(Self {
            gate: FrameGate {
                slot: Arc::new(ProcessingSlot::default()),
                work_tx,
                accepting: Arc::new(AtomicBool::new(true)),
                stats,
            },
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn gate(&self) -> &FrameGate {
        &self.gate
    }

    /// Stop admitting frames, let the in-flight frame finish, then join.
    pub(crate) fn shutdown(&mut self) {
        self.gate.close();
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("detector worker panicked during shutdown");
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum SpawnError {
    Thread(io::Error),
    Setup(DetectorError),
}

fn run_worker(
    detector: &mut ManagedDetector<Box<dyn Detector>>,
    work_rx: &Receiver<FrameTask>,
    dispatcher: &ResultDispatcher,
    running: &AtomicBool,
    stats: &PipelineStats,
) {
    let worker_span = tracing::info_span!("pipeline.worker");
    let _worker_guard = worker_span.enter();

    while running.load(Ordering::Relaxed) {
        let task = match work_rx.recv_timeout(WORKER_POLL) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        process_task(detector, task, dispatcher, stats);
    }
}

fn process_task(
    detector: &mut ManagedDetector<Box<dyn Detector>>,
    task: FrameTask,
    dispatcher: &ResultDispatcher,
    stats: &PipelineStats,
) {
    let FrameTask { frame, claim, span } = task;
    let _frame_guard = span.enter();
    let frame_id = frame.id;

    let preprocess_start = Instant::now();
    let normalized = match tracing::info_span!("preprocess").in_scope(|| preprocess(frame)) {
        Ok(image) => image,
        Err(err) => {
            warn!(frame = frame_id, "dropping invalid frame: {err}");
            stats.record(FrameOutcome::Invalid);
            metrics::counter!("pipeline_invalid_frames_total").increment(1);
            drop(claim);
            return;
        }
    };
    metrics::histogram!("pipeline_stage_latency_seconds", "stage" => "preprocess")
        .record(preprocess_start.elapsed().as_secs_f64());

    stats.detector_called();
    let detect_start = Instant::now();
    let outcome = tracing::info_span!("detect").in_scope(|| {
        panic::catch_unwind(AssertUnwindSafe(|| detector.detect(&normalized.image)))
    });
    metrics::histogram!("pipeline_stage_latency_seconds", "stage" => "detect")
        .record(detect_start.elapsed().as_secs_f64());

    let output = absorb_failure(frame_id, outcome, stats);
    if let Some(output) = output.as_ref() {
        debug!(
            frame = frame_id,
            boxes = output.boxes.len(),
            elapsed_ms = output.elapsed_ms(),
            "detection complete"
        );
    }

    let _dispatch_guard = tracing::info_span!("dispatch").entered();
    if let Err(err) = dispatcher.dispatch(frame_id, output) {
        debug!(frame = frame_id, "notification not delivered: {err:?}");
    }
    drop(claim);
}

/// Detector errors and panics end up as `None`, reported downstream as empty.
fn absorb_failure(
    frame_id: u64,
    outcome: thread::Result<Result<DetectorOutput, DetectorError>>,
    stats: &PipelineStats,
) -> Option<DetectorOutput> {
    let failure = match outcome {
        Ok(Ok(output)) => return Some(output),
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    error!(frame = frame_id, "detector failure: {failure}");
    stats.record(FrameOutcome::DetectorFailure);
    metrics::counter!("pipeline_detector_failures_total").increment(1);
    None
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
