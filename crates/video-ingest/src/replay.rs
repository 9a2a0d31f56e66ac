//! Source that replays a fixed set of frames, mostly for tests and demos.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    source::{FrameSource, FrameStream, Publish, latest_channel, spawn_producer},
    types::{CaptureError, Frame},
};

pub struct ReplaySource {
    label: String,
    frames: Vec<Frame>,
    interval: Duration,
}

impl ReplaySource {
    /// Replay `frames` in order, pausing `interval` between publishes.
    ///
    /// The frames are handed out once; opening the source a second time fails.
    pub fn new(label: impl Into<String>, frames: Vec<Frame>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            frames,
            interval,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        if self.frames.is_empty() {
            return Err(CaptureError::Open {
                uri: self.label.clone(),
            });
        }

        let frames = std::mem::take(&mut self.frames);
        let interval = self.interval;
        let (tx, rx) = latest_channel();
        let running = Arc::new(AtomicBool::new(true));
        let producer_running = running.clone();

        let handle = spawn_producer("replay-source", move || {
            for frame in frames {
                if !producer_running.load(Ordering::Relaxed) {
                    break;
                }
                if tx.publish(Ok(frame)) == Publish::Disconnected {
                    break;
                }
                if !interval.is_zero() {
                    thread::sleep(interval);
                }
            }
        })?;

        Ok(FrameStream::new(rx, running, handle))
    }

    fn describe(&self) -> String {
        format!("replay {} ({} frames)", self.label, self.frames.len())
    }
}
