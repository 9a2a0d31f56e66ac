use anyhow::Error;
use crossbeam_channel::Sender;
use thiserror::Error;

/// Raw frame captured from a video source.
///
/// The pixel buffer is owned exclusively by the frame. When the frame came
/// from a pooled source the buffer goes back to that pool as soon as the frame
/// is released or dropped, so downstream stages should copy what they need and
/// let go of the frame quickly.
pub struct Frame {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
    /// Clockwise rotation that makes the frame upright in viewing orientation.
    pub rotation: Rotation,
    /// Set for front-facing sources; the consumer flips the upright image.
    pub mirrored: bool,
    data: Vec<u8>,
    recycle: Option<Sender<Vec<u8>>>,
}

impl Frame {
    pub fn new(id: u64, width: u32, height: u32, format: FrameFormat, data: Vec<u8>) -> Self {
        Self {
            id,
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format,
            rotation: Rotation::Deg0,
            mirrored: false,
            data,
            recycle: None,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_mirror(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Route the buffer back to `recycle` when the frame is released.
    pub(crate) fn with_recycler(mut self, recycle: Sender<Vec<u8>>) -> Self {
        self.recycle = Some(recycle);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes a well-formed buffer must hold for this frame.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Hand the buffer back to its source. Equivalent to dropping the frame.
    pub fn release(self) {}
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(recycle) = self.recycle.take() {
            let _ = recycle.try_send(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("rotation", &self.rotation)
            .field("mirrored", &self.mirrored)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// 4-channel, 8-bit, red first. The native format of pooled sources.
    Rgba8,
    Bgra8,
    /// OpenCV capture order.
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgba8 | FrameFormat::Bgra8 => 4,
            FrameFormat::Bgr8 => 3,
        }
    }
}

/// Quarter-turn rotation applied clockwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    /// Accepts any multiple of 90, including negative values and 360.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one (`360 - degrees`).
    pub fn inverse(self) -> Self {
        match self {
            Rotation::Deg0 => Rotation::Deg0,
            Rotation::Deg90 => Rotation::Deg270,
            Rotation::Deg180 => Rotation::Deg180,
            Rotation::Deg270 => Rotation::Deg90,
        }
    }

    /// Whether width and height trade places.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} is closed")]
    Closed { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}
