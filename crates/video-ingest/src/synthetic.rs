//! Test-pattern source that renders frames on a background thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use tracing::{debug, info};

use crate::{
    source::{BufferPool, FrameSource, FrameStream, Publish, latest_channel, spawn_producer},
    types::{CaptureError, Frame, FrameFormat, Rotation},
};

const POOL_CAPACITY: usize = 3;
const SQUARE_FRACTION: u32 = 5;

/// Configuration for [`SyntheticSource`].
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Rotation metadata attached to each frame, mimicking sensor mounting.
    pub rotation: Rotation,
    pub mirrored: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            rotation: Rotation::Deg90,
            mirrored: false,
        }
    }
}

/// Produces RGBA frames with a bright square sweeping across a dark field.
pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<FrameStream, CaptureError> {
        let config = self.config.clone();
        if config.width == 0 || config.height == 0 || !(config.fps > 0.0) {
            return Err(CaptureError::Other(anyhow!(
                "synthetic source needs positive size and fps (got {}x{} @ {})",
                config.width,
                config.height,
                config.fps
            )));
        }

        let (tx, rx) = latest_channel();
        let running = Arc::new(AtomicBool::new(true));
        let producer_running = running.clone();

        let handle = spawn_producer("synthetic-source", move || {
            let pool = BufferPool::new(POOL_CAPACITY);
            let interval = Duration::from_secs_f64(1.0 / config.fps);
            let mut next_id: u64 = 0;
            let mut deadline = Instant::now();

            while producer_running.load(Ordering::Relaxed) {
                next_id = next_id.wrapping_add(1);
                let frame = render(&pool, &config, next_id);
                if tx.publish(Ok(frame)) == Publish::Disconnected {
                    break;
                }

                deadline += interval;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else {
                    deadline = now;
                }
            }
            debug!(frames = next_id, "synthetic source stopped");
        })?;

        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "synthetic source started"
        );
        Ok(FrameStream::new(rx, running, handle))
    }

    fn describe(&self) -> String {
        format!(
            "synthetic {}x{} @ {:.1} fps",
            self.config.width, self.config.height, self.config.fps
        )
    }
}

fn render(pool: &BufferPool, config: &SyntheticConfig, id: u64) -> Frame {
    let (width, height) = (config.width, config.height);
    let mut data = pool.acquire(width as usize * height as usize * 4);

    let side = (width.min(height) / SQUARE_FRACTION).max(1);
    let travel = width.saturating_sub(side).max(1) as u64;
    let left = (id.wrapping_mul(4) % travel) as u32;
    let top = (height - side) / 2;

    for (index, pixel) in data.chunks_exact_mut(4).enumerate() {
        let x = index as u32 % width;
        let y = index as u32 / width;
        let inside = x >= left && x < left + side && y >= top && y < top + side;
        let value = if inside { 240 } else { 16 };
        pixel.copy_from_slice(&[value, value, value, 255]);
    }

    pool.lease(
        Frame::new(id, width, height, FrameFormat::Rgba8, data)
            .with_rotation(config.rotation)
            .with_mirror(config.mirrored),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_with_metadata() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 32,
            height: 24,
            fps: 200.0,
            rotation: Rotation::Deg270,
            mirrored: true,
        });
        let stream = source.open().expect("open synthetic source");
        let frame = stream
            .recv_timeout(Duration::from_secs(2))
            .expect("stream alive")
            .expect("frame within timeout");

        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(frame.format, FrameFormat::Rgba8);
        assert_eq!(frame.rotation, Rotation::Deg270);
        assert!(frame.mirrored);
        assert_eq!(frame.data().len(), frame.expected_len());
        stream.close();
    }

    #[test]
    fn rejects_zero_fps() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            fps: 0.0,
            ..SyntheticConfig::default()
        });
        assert!(source.open().is_err());
    }
}
