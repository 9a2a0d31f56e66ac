use ml_core::BoundingBox;
use tracing::{debug, info};
use vision::DetectionListener;

/// Console stand-in for the on-screen overlay.
///
/// Keeps the boxes from the latest detection until an empty notification
/// clears them. Frames that produced no notification leave it untouched.
pub struct ConsoleOverlay {
    width: u32,
    height: u32,
    boxes: Vec<BoundingBox>,
    inference_ms: Option<u64>,
    detections: u64,
}

impl ConsoleOverlay {
    /// `width` and `height` are the upright image size the boxes refer to.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            boxes: Vec::new(),
            inference_ms: None,
            detections: 0,
        }
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// One line describing what is currently drawn.
    pub fn summary(&self) -> String {
        if self.boxes.is_empty() {
            return "no objects".to_string();
        }
        let items: Vec<String> = self
            .boxes
            .iter()
            .map(|b| {
                let [x1, y1, x2, y2] = b.to_pixels(self.width, self.height);
                format!("{} {:.2} [{x1},{y1},{x2},{y2}]", b.label, b.confidence)
            })
            .collect();
        match self.inference_ms {
            Some(ms) => format!("{} ({ms} ms)", items.join(", ")),
            None => items.join(", "),
        }
    }
}

impl DetectionListener for ConsoleOverlay {
    fn on_detect(&mut self, boxes: &[BoundingBox], elapsed_ms: u64) {
        self.boxes = boxes.to_vec();
        self.inference_ms = Some(elapsed_ms);
        self.detections += 1;
        info!(objects = boxes.len(), "{}", self.summary());
    }

    fn on_empty_detect(&mut self) {
        if !self.boxes.is_empty() {
            debug!("overlay cleared");
        }
        self.boxes.clear();
        self.inference_ms = None;
    }
}
