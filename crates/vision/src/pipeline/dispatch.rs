//! Delivery of detection outcomes to the presentation context.
//!
//! The worker hands each outcome to a one-slot channel; the presentation side
//! drains it through [`PresentationQueue`] on its own thread. Because only one
//! frame is ever in flight, notifications arrive in processing order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use ml_core::{BoundingBox, DetectorOutput};
use tracing::{debug, warn};

use crate::{
    perf::{self, Milestone, ProbeContext},
    pipeline::stats::{FrameOutcome, PipelineStats},
};

/// How long a blocked hand-off waits before re-checking for shutdown.
const HANDOFF_POLL: Duration = Duration::from_millis(50);

/// Outcome of one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Detected {
        frame_id: u64,
        boxes: Vec<BoundingBox>,
        elapsed_ms: u64,
    },
    /// Nothing found, or the detector failed. Clears any overlay.
    Empty { frame_id: u64 },
}

impl Notification {
    pub fn frame_id(&self) -> u64 {
        match self {
            Notification::Detected { frame_id, .. } | Notification::Empty { frame_id } => *frame_id,
        }
    }
}

/// Presentation-side receiver of detection outcomes.
pub trait DetectionListener {
    fn on_detect(&mut self, boxes: &[BoundingBox], elapsed_ms: u64);

    fn on_empty_detect(&mut self);
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HandoffError {
    /// The pipeline is stopping and the notification was abandoned.
    Abandoned,
    /// Nobody is listening any more.
    Disconnected,
}

/// Worker-side half of the dispatcher.
pub(crate) struct ResultDispatcher {
    tx: Sender<Notification>,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

pub(crate) fn channel(
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) -> (ResultDispatcher, Receiver<Notification>) {
    let (tx, rx) = bounded(1);
    (ResultDispatcher { tx, running, stats }, rx)
}

impl ResultDispatcher {
    /// Turn a detector outcome into exactly one notification and hand it off.
    ///
    /// `None` means the detector failed; it is reported as empty.
    pub(crate) fn dispatch(
        &self,
        frame_id: u64,
        output: Option<DetectorOutput>,
    ) -> Result<(), HandoffError> {
        let notification = match output {
            Some(output) if !output.boxes.is_empty() => Notification::Detected {
                frame_id,
                elapsed_ms: output.elapsed_ms(),
                boxes: output.boxes,
            },
            _ => Notification::Empty { frame_id },
        };
        let outcome = match notification {
            Notification::Detected { .. } => FrameOutcome::Detected,
            Notification::Empty { .. } => FrameOutcome::Empty,
        };

        let start = Instant::now();
        self.handoff(notification)?;
        self.stats.record(outcome);
        metrics::counter!("pipeline_notifications_total", "kind" => outcome.label()).increment(1);
        metrics::histogram!("pipeline_stage_latency_seconds", "stage" => "dispatch")
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn handoff(&self, notification: Notification) -> Result<(), HandoffError> {
        let mut pending = notification;
        loop {
            match self.tx.send_timeout(pending, HANDOFF_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.running.load(Ordering::Relaxed) {
                        debug!(frame = back.frame_id(), "abandoning notification on shutdown");
                        return Err(HandoffError::Abandoned);
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(back)) => {
                    warn!(frame = back.frame_id(), "presentation queue dropped; discarding result");
                    return Err(HandoffError::Disconnected);
                }
            }
        }
    }
}

/// Presentation-side half of the dispatcher.
pub struct PresentationQueue {
    rx: Receiver<Notification>,
    probe: Option<ProbeContext>,
}

impl PresentationQueue {
    pub(crate) fn new(rx: Receiver<Notification>) -> Self {
        Self { rx, probe: None }
    }

    /// Sample resources after every delivered detection.
    pub fn with_probe(mut self, probe: ProbeContext) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn try_next(&self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next notification.
    ///
    /// Returns `None` on timeout or once the pipeline has shut down.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Notification> {
        match self.rx.recv_timeout(timeout) {
            Ok(notification) => Some(notification),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Deliver everything already pending to `listener` on the calling thread.
    pub fn pump<L: DetectionListener + ?Sized>(&mut self, listener: &mut L) -> usize {
        let mut delivered = 0;
        while let Ok(notification) = self.rx.try_recv() {
            self.deliver(notification, listener);
            delivered += 1;
        }
        delivered
    }

    /// Like [`pump`](Self::pump), but waits up to `timeout` for the first
    /// notification when none is pending.
    pub fn pump_timeout<L: DetectionListener + ?Sized>(
        &mut self,
        listener: &mut L,
        timeout: Duration,
    ) -> usize {
        match self.next_timeout(timeout) {
            Some(first) => {
                self.deliver(first, listener);
                1 + self.pump(listener)
            }
            None => 0,
        }
    }

    fn deliver<L: DetectionListener + ?Sized>(&mut self, notification: Notification, listener: &mut L) {
        match notification {
            Notification::Detected {
                boxes, elapsed_ms, ..
            } => {
                listener.on_detect(&boxes, elapsed_ms);
                if let Some(probe) = self.probe.as_mut() {
                    perf::log_all(probe, Milestone::DetectionDispatched);
                }
            }
            Notification::Empty { .. } => listener.on_empty_detect(),
        }
    }
}
