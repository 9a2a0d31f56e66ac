//! OpenCV-backed camera capture.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    source::{
        BufferPool, FrameSource, FrameStream, LatestSender, Publish, latest_channel,
        spawn_producer,
    },
    types::{CaptureError, Frame, FrameFormat, Rotation},
};

/// Camera device or URI opened through OpenCV's video I/O backends.
pub struct CameraSource {
    uri: String,
    target_size: (i32, i32),
    fps: f64,
    rotation: Rotation,
    mirrored: bool,
}

impl CameraSource {
    pub fn new(uri: impl Into<String>, target_size: (u32, u32), fps: f64) -> Self {
        Self {
            uri: uri.into(),
            target_size: (target_size.0 as i32, target_size.1 as i32),
            fps,
            rotation: Rotation::Deg0,
            mirrored: false,
        }
    }

    /// Sensor mounting relative to the viewing orientation.
    pub fn with_orientation(mut self, rotation: Rotation, mirrored: bool) -> Self {
        self.rotation = rotation;
        self.mirrored = mirrored;
        self
    }
}

impl FrameSource for CameraSource {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        // Open on the caller's thread so binding failures surface immediately.
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.target_size, self.fps);

        let (tx, rx) = latest_channel();
        let running = Arc::new(AtomicBool::new(true));
        let producer_running = running.clone();
        let target_size = self.target_size;
        let rotation = self.rotation;
        let mirrored = self.mirrored;

        let handle = spawn_producer("camera-source", move || {
            if let Err(err) = capture_loop(
                cap,
                target_size,
                rotation,
                mirrored,
                &tx,
                &producer_running,
            ) {
                let _ = tx.publish(Err(err));
            }
        })?;

        Ok(FrameStream::new(rx, running, handle))
    }

    fn describe(&self) -> String {
        format!(
            "camera {} {}x{} @ {:.0} fps",
            self.uri, self.target_size.0, self.target_size.1, self.fps
        )
    }
}

fn capture_loop(
    mut cap: VideoCapture,
    target_size: (i32, i32),
    rotation: Rotation,
    mirrored: bool,
    tx: &LatestSender,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    let pool = BufferPool::new(3);
    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = target_size;
    let mut next_id: u64 = 0;

    while running.load(Ordering::Relaxed) {
        cap.read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let bytes = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?;
        let mut data = pool.acquire(bytes.len());
        data.copy_from_slice(bytes);

        next_id = next_id.wrapping_add(1);
        let captured = pool.lease(
            Frame::new(
                next_id,
                target_w as u32,
                target_h as u32,
                FrameFormat::Bgr8,
                data,
            )
            .with_rotation(rotation)
            .with_mirror(mirrored),
        );

        if tx.publish(Ok(captured)) == Publish::Disconnected {
            break;
        }
    }

    Ok(())
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
