//! Detector contract shared by the vision pipeline and detector adapters.
//!
//! The model itself lives behind the [`Detector`] trait; this crate only fixes
//! the lifecycle, the box representation, and the post-processing every
//! adapter applies to raw model output.

pub mod boxes;
pub mod detector;
mod heuristic;
mod labels;

pub use boxes::{BoundingBox, filter_boxes};
pub use detector::{
    Detector, DetectorEnv, DetectorError, DetectorOutput, DetectorState, ManagedDetector,
};
pub use heuristic::HeuristicDetector;
pub use labels::Labels;
