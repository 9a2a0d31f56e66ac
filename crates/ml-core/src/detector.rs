use std::{path::PathBuf, time::Duration};

use image::RgbaImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::boxes::BoundingBox;

/// Settings handed to a detector during [`Detector::setup`].
#[derive(Debug, Clone)]
pub struct DetectorEnv {
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorEnv {
    fn default() -> Self {
        Self {
            model_path: None,
            labels_path: None,
            confidence_threshold: 0.25,
            iou_threshold: 0.5,
        }
    }
}

/// Boxes for one image plus the time the detector spent producing them.
#[derive(Debug, Clone, Default)]
pub struct DetectorOutput {
    pub boxes: Vec<BoundingBox>,
    pub elapsed: Duration,
}

impl DetectorOutput {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector setup failed: {0}")]
    Setup(String),
    #[error("detector rejected image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detector lifecycle violation: {0}")]
    Lifecycle(&'static str),
}

/// Synchronous object detector.
///
/// Implementations are driven from a single worker thread: `setup` once,
/// any number of `detect` calls, then `clear`. [`ManagedDetector`] enforces
/// that ordering for callers that cannot guarantee it themselves.
pub trait Detector: Send {
    fn setup(&mut self, env: &DetectorEnv) -> Result<(), DetectorError>;

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectorOutput, DetectorError>;

    /// Release model resources. Must tolerate repeated calls.
    fn clear(&mut self);
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn setup(&mut self, env: &DetectorEnv) -> Result<(), DetectorError> {
        (**self).setup(env)
    }

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectorOutput, DetectorError> {
        (**self).detect(image)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorState {
    Created,
    Ready,
    Cleared,
}

/// Wraps a detector and enforces setup-once / no-detect-after-clear.
pub struct ManagedDetector<D> {
    inner: D,
    state: DetectorState,
}

impl<D: Detector> ManagedDetector<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            state: DetectorState::Created,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn setup(&mut self, env: &DetectorEnv) -> Result<(), DetectorError> {
        match self.state {
            DetectorState::Created => {
                self.inner.setup(env)?;
                self.state = DetectorState::Ready;
                debug!("detector ready");
                Ok(())
            }
            DetectorState::Ready => Err(DetectorError::Lifecycle("setup called twice")),
            DetectorState::Cleared => Err(DetectorError::Lifecycle("setup after clear")),
        }
    }

    pub fn detect(&mut self, image: &RgbaImage) -> Result<DetectorOutput, DetectorError> {
        match self.state {
            DetectorState::Ready => self.inner.detect(image),
            DetectorState::Created => Err(DetectorError::Lifecycle("detect before setup")),
            DetectorState::Cleared => Err(DetectorError::Lifecycle("detect after clear")),
        }
    }

    /// Releases the inner detector the first time; later calls are no-ops.
    pub fn clear(&mut self) {
        match self.state {
            DetectorState::Ready => {
                self.inner.clear();
                self.state = DetectorState::Cleared;
                debug!("detector cleared");
            }
            DetectorState::Created => {
                self.state = DetectorState::Cleared;
            }
            DetectorState::Cleared => warn!("detector already cleared"),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}
