use serde::Serialize;

use crate::detector::DetectorEnv;

/// Axis-aligned box in normalized image coordinates (0..1).
///
/// Coordinates only make sense relative to the image that was passed to the
/// detector call that produced the box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(class_id: usize, label: impl Into<String>, confidence: f32, xyxy: [f32; 4]) -> Self {
        Self {
            class_id,
            label: label.into(),
            confidence,
            x1: xyxy[0],
            y1: xyxy[1],
            x2: xyxy[2],
            y2: xyxy[3],
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Pixel rectangle `[left, top, right, bottom]` for an image of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> [u32; 4] {
        let w = width as f32;
        let h = height as f32;
        let px = |v: f32, max: f32| (v.clamp(0.0, 1.0) * max).round() as u32;
        [px(self.x1, w), px(self.y1, h), px(self.x2, w), px(self.y2, h)]
    }
}

/// Drop low-confidence boxes and suppress overlapping boxes of the same class.
///
/// Survivors are ordered by descending confidence.
pub fn filter_boxes(mut boxes: Vec<BoundingBox>, env: &DetectorEnv) -> Vec<BoundingBox> {
    boxes.retain(|b| b.confidence >= env.confidence_threshold);
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.iou(&candidate) >= env.iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(class_id: usize, confidence: f32, xyxy: [f32; 4]) -> BoundingBox {
        BoundingBox::new(class_id, format!("c{class_id}"), confidence, xyxy)
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = bx(0, 0.9, [0.0, 0.0, 0.5, 0.5]);
        let b = bx(0, 0.9, [0.5, 0.5, 1.0, 1.0]);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn filter_applies_threshold_and_per_class_nms() {
        let env = DetectorEnv {
            confidence_threshold: 0.3,
            iou_threshold: 0.5,
            ..DetectorEnv::default()
        };
        let boxes = vec![
            bx(0, 0.6, [0.1, 0.1, 0.5, 0.5]),
            bx(0, 0.9, [0.1, 0.1, 0.52, 0.5]),
            bx(1, 0.7, [0.1, 0.1, 0.5, 0.5]),
            bx(2, 0.2, [0.6, 0.6, 0.9, 0.9]),
        ];

        let kept = filter_boxes(boxes, &env);
        let summary: Vec<(usize, f32)> = kept.iter().map(|b| (b.class_id, b.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.7)]);
    }

    #[test]
    fn pixel_conversion_clamps() {
        let b = bx(0, 1.0, [-0.1, 0.25, 0.5, 1.2]);
        assert_eq!(b.to_pixels(480, 640), [0, 160, 240, 640]);
    }
}
