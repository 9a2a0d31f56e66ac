//! Frame sources feeding the detection pipeline.
//!
//! Every source publishes through a keep-latest channel, so a slow consumer
//! causes stale frames to be evicted at the source rather than blocking the
//! producer.

#[cfg(feature = "opencv")]
mod camera;
mod replay;
mod source;
mod synthetic;
mod types;

#[cfg(feature = "opencv")]
pub use camera::CameraSource;
pub use replay::ReplaySource;
pub use source::{BufferPool, FrameSource, FrameStream};
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use types::{CaptureError, Frame, FrameFormat, Rotation};
