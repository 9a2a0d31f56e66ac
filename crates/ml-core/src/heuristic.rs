use std::time::Instant;

use image::RgbaImage;
use tracing::info;

use crate::{
    boxes::{BoundingBox, filter_boxes},
    detector::{Detector, DetectorEnv, DetectorError, DetectorOutput},
    labels::Labels,
};

/// Luma above which a pixel counts as lit.
const DEFAULT_LUMA_THRESHOLD: u8 = 200;

/// Model-free detector reporting the region of bright pixels as one box.
///
/// Confidence is the lit fraction of that region, so a solid bright object
/// scores close to 1.0 and scattered highlights score low.
pub struct HeuristicDetector {
    luma_threshold: u8,
    env: DetectorEnv,
    labels: Labels,
}

impl HeuristicDetector {
    pub fn new() -> Self {
        Self {
            luma_threshold: DEFAULT_LUMA_THRESHOLD,
            env: DetectorEnv::default(),
            labels: Labels::default(),
        }
    }

    pub fn with_luma_threshold(mut self, threshold: u8) -> Self {
        self.luma_threshold = threshold;
        self
    }
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for HeuristicDetector {
    fn setup(&mut self, env: &DetectorEnv) -> Result<(), DetectorError> {
        if let Some(path) = env.labels_path.as_ref() {
            self.labels = Labels::load(path).map_err(|err| {
                DetectorError::Setup(format!("labels {}: {err}", path.display()))
            })?;
        }
        self.env = env.clone();
        info!(
            luma_threshold = self.luma_threshold,
            labels = self.labels.len(),
            "heuristic detector ready"
        );
        Ok(())
    }

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectorOutput, DetectorError> {
        let start = Instant::now();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::InvalidImage("empty image".into()));
        }

        let mut lit: u64 = 0;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
        for (x, y, pixel) in image.enumerate_pixels() {
            let [r, g, b, _] = pixel.0;
            let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
            if luma >= self.luma_threshold as u32 {
                lit += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let mut boxes = Vec::new();
        if lit > 0 {
            let region = (max_x - min_x + 1) as u64 * (max_y - min_y + 1) as u64;
            let confidence = lit as f32 / region as f32;
            boxes.push(BoundingBox::new(
                0,
                self.labels.name(0),
                confidence,
                [
                    min_x as f32 / width as f32,
                    min_y as f32 / height as f32,
                    (max_x + 1) as f32 / width as f32,
                    (max_y + 1) as f32 / height as f32,
                ],
            ));
        }

        Ok(DetectorOutput {
            boxes: filter_boxes(boxes, &self.env),
            elapsed: start.elapsed(),
        })
    }

    fn clear(&mut self) {
        self.labels = Labels::default();
    }
}
