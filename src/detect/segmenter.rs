use crate::detect::background::{BackgroundModel, BackgroundModelConfig};
use crate::detect::blobs::{dilate, find_blobs, threshold};
use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// Mask values above this survive binarization (drops shadow pixels).
const MASK_THRESHOLD: u8 = 200;
const DILATE_ITERATIONS: u32 = 2;

/// Turns frames into bounding boxes of moving foreground regions.
///
/// Stateful: every call updates the background model.
pub struct MotionSegmenter {
    model: BackgroundModel,
    min_area: u64,
}

impl MotionSegmenter {
    pub fn new(config: BackgroundModelConfig, min_area: u64) -> Self {
        Self {
            model: BackgroundModel::new(config),
            min_area,
        }
    }

    pub fn min_area(&self) -> u64 {
        self.min_area
    }

    pub fn set_min_area(&mut self, min_area: u64) {
        self.min_area = min_area;
    }

    /// Foreground boxes for `frame` whose pixel area is at least `min_area`.
    pub fn segment(&mut self, frame: &Frame) -> Vec<BoundingBox> {
        if frame.is_empty() {
            return Vec::new();
        }
        let gray = frame.to_gray();
        let mut mask = self.model.apply(&gray, frame.width, frame.height);
        threshold(&mut mask, MASK_THRESHOLD);
        let mask = dilate(&mask, frame.width, frame.height, DILATE_ITERATIONS);

        find_blobs(&mask, frame.width, frame.height)
            .into_iter()
            .filter(|blob| blob.area >= self.min_area)
            .map(|blob| blob.bbox)
            .collect()
    }
}
