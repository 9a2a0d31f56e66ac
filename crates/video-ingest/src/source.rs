//! Source-side plumbing shared by every frame producer.
//!
//! Producers publish into a one-slot channel with keep-latest semantics: a
//! frame the consumer has not picked up yet is evicted in favour of the newer
//! one, so the producer never blocks on a slow consumer. Pixel buffers come
//! from a [`BufferPool`] and flow back to it when frames are released.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::debug;

use crate::types::{CaptureError, Frame};

/// Anything that can be attached to the pipeline as a frame producer.
pub trait FrameSource: Send {
    /// Start producing frames. Each call yields a fresh stream.
    fn open(&mut self) -> Result<FrameStream, CaptureError>;

    /// Short human readable description used in logs.
    fn describe(&self) -> String;
}

/// Consumer half of a running source.
///
/// Dropping the stream (or calling [`FrameStream::close`]) asks the producer
/// thread to stop and waits for it.
pub struct FrameStream {
    rx: Receiver<Result<Frame, CaptureError>>,
    running: Arc<AtomicBool>,
    producer: Option<thread::JoinHandle<()>>,
}

impl FrameStream {
    pub(crate) fn new(
        rx: Receiver<Result<Frame, CaptureError>>,
        running: Arc<AtomicBool>,
        producer: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            running,
            producer: Some(producer),
        }
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` on timeout and `Err(CaptureError::Closed)` once the
    /// producer has gone away.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Frame>, CaptureError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed {
                uri: "stream".into(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Producer half of the keep-latest channel.
pub(crate) struct LatestSender {
    tx: Sender<Result<Frame, CaptureError>>,
    evict: Receiver<Result<Frame, CaptureError>>,
}

/// Outcome of publishing a frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Publish {
    Stored,
    /// The frame replaced an older one the consumer never picked up.
    Replaced,
    Disconnected,
}

pub(crate) fn latest_channel() -> (LatestSender, Receiver<Result<Frame, CaptureError>>) {
    let (tx, rx) = bounded(1);
    (
        LatestSender {
            tx,
            evict: rx.clone(),
        },
        rx,
    )
}

impl LatestSender {
    pub(crate) fn publish(&self, item: Result<Frame, CaptureError>) -> Publish {
        let mut item = item;
        let mut replaced = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    return if replaced {
                        Publish::Replaced
                    } else {
                        Publish::Stored
                    };
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(stale) = self.evict.try_recv() {
                        replaced = true;
                        if let Ok(frame) = stale {
                            debug!(frame = frame.id, "evicting stale frame at source");
                        }
                        metrics::counter!("source_frames_evicted_total").increment(1);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Publish::Disconnected,
            }
        }
    }
}

/// Spawn a producer thread that logs through the opener's tracing dispatcher.
pub(crate) fn spawn_producer<F>(
    name: &str,
    body: F,
) -> Result<thread::JoinHandle<()>, CaptureError>
where
    F: FnOnce() + Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, body))
        .map_err(|err| CaptureError::Other(err.into()))
}

/// Recycles pixel buffers between a producer and the frames it hands out.
pub struct BufferPool {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Take a zeroed buffer of `len` bytes, reusing a returned one when possible.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        match self.rx.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                buffer.resize(len, 0);
                buffer
            }
            Err(_) => vec![0; len],
        }
    }

    /// Attach the pool's return path to `frame`.
    pub fn lease(&self, frame: Frame) -> Frame {
        frame.with_recycler(self.tx.clone())
    }

    /// Buffers currently waiting for reuse.
    pub fn available(&self) -> usize {
        self.rx.len()
    }
}
