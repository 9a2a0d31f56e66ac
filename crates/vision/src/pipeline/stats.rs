use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-frame outcomes tracked by the coordinator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Accepted,
    DroppedBusy,
    Invalid,
    DetectorFailure,
    Detected,
    Empty,
}

impl FrameOutcome {
    /// Label used in log messages and metrics.
    pub(crate) fn label(self) -> &'static str {
        match self {
            FrameOutcome::Accepted => "accepted",
            FrameOutcome::DroppedBusy => "dropped_busy",
            FrameOutcome::Invalid => "invalid",
            FrameOutcome::DetectorFailure => "detector_failure",
            FrameOutcome::Detected => "detect",
            FrameOutcome::Empty => "empty",
        }
    }
}

/// Lock-free counters shared between the intake and worker threads.
#[derive(Default)]
pub(crate) struct PipelineStats {
    accepted: AtomicU64,
    dropped_busy: AtomicU64,
    invalid: AtomicU64,
    detector_failures: AtomicU64,
    detected: AtomicU64,
    empty: AtomicU64,
    detector_calls: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Accepted => &self.accepted,
            FrameOutcome::DroppedBusy => &self.dropped_busy,
            FrameOutcome::Invalid => &self.invalid,
            FrameOutcome::DetectorFailure => &self.detector_failures,
            FrameOutcome::Detected => &self.detected,
            FrameOutcome::Empty => &self.empty,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detector_called(&self) {
        self.detector_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            detected: self.detected.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            detector_calls: self.detector_calls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub dropped_busy: u64,
    pub invalid: u64,
    pub detector_failures: u64,
    /// Notifications carrying at least one box.
    pub detected: u64,
    /// Empty notifications, including ones caused by detector failures.
    pub empty: u64,
    pub detector_calls: u64,
}

impl StatsSnapshot {
    pub fn notifications(&self) -> u64 {
        self.detected + self.empty
    }
}
