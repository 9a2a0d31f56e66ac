//! Frame normalization: pixel format conversion, rotation, and mirroring.
//!
//! The detector always receives an upright RGBA8 image. The source buffer is
//! copied out and released before any geometric work happens so the source
//! can reuse it immediately.

use image::{RgbaImage, imageops};
use thiserror::Error;
use video_ingest::{Frame, FrameFormat, Rotation};

/// Upright RGBA image ready for the detector.
pub struct NormalizedImage {
    pub frame_id: u64,
    pub timestamp_ms: i64,
    /// Dimensions of the raw frame before rotation.
    pub source_size: (u32, u32),
    pub image: RgbaImage,
}

impl NormalizedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("frame has zero dimension ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
}

/// Convert `frame` into a normalized image, consuming it.
///
/// The frame (and with it the source's buffer) is released as soon as the
/// pixels have been copied, whether or not conversion succeeds.
pub fn preprocess(frame: Frame) -> Result<NormalizedImage, PreprocessError> {
    let frame_id = frame.id;
    let timestamp_ms = frame.timestamp_ms;
    let (width, height) = (frame.width, frame.height);
    let rotation = frame.rotation;
    let mirror = frame.mirrored;

    let copied = copy_to_rgba(frame.data(), width, height, frame.format);
    frame.release();
    let image = copied?;

    Ok(NormalizedImage {
        frame_id,
        timestamp_ms,
        source_size: (width, height),
        image: orient(image, rotation, mirror),
    })
}

/// Raw-buffer form of [`preprocess`] for callers without a [`Frame`].
pub fn normalize(
    buffer: &[u8],
    width: u32,
    height: u32,
    format: FrameFormat,
    rotation: Rotation,
    mirror: bool,
) -> Result<RgbaImage, PreprocessError> {
    let image = copy_to_rgba(buffer, width, height, format)?;
    Ok(orient(image, rotation, mirror))
}

fn copy_to_rgba(
    buffer: &[u8],
    width: u32,
    height: u32,
    format: FrameFormat,
) -> Result<RgbaImage, PreprocessError> {
    if width == 0 || height == 0 {
        return Err(PreprocessError::ZeroDimension { width, height });
    }
    let pixels = width as usize * height as usize;
    let expected = pixels * format.bytes_per_pixel();
    if buffer.len() != expected {
        return Err(PreprocessError::BufferLength {
            expected,
            actual: buffer.len(),
        });
    }

    let rgba = match format {
        FrameFormat::Rgba8 => buffer.to_vec(),
        FrameFormat::Bgra8 => {
            let mut out = Vec::with_capacity(pixels * 4);
            for px in buffer.chunks_exact(4) {
                out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            }
            out
        }
        FrameFormat::Bgr8 => {
            let mut out = Vec::with_capacity(pixels * 4);
            for px in buffer.chunks_exact(3) {
                out.extend_from_slice(&[px[2], px[1], px[0], u8::MAX]);
            }
            out
        }
    };

    RgbaImage::from_raw(width, height, rgba).ok_or(PreprocessError::BufferLength {
        expected,
        actual: buffer.len(),
    })
}

/// Rotate clockwise by `rotation`, then flip horizontally across the rotated
/// image's own width when `mirror` is set.
pub(crate) fn orient(image: RgbaImage, rotation: Rotation, mirror: bool) -> RgbaImage {
    let mut rotated = match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => imageops::rotate90(&image),
        Rotation::Deg180 => imageops::rotate180(&image),
        Rotation::Deg270 => imageops::rotate270(&image),
    };
    if mirror {
        imageops::flip_horizontal_in_place(&mut rotated);
    }
    rotated
}
