//! Motion segmentation.
//!
//! Frames are converted to grayscale, compared against an adaptive per-pixel
//! background model, binarized, dilated to merge fragments, and split into
//! connected regions. Regions below the minimum area are dropped as noise.

pub mod background;
pub mod blobs;
mod segmenter;

pub use background::{BackgroundModel, BackgroundModelConfig};
pub use blobs::Blob;
pub use segmenter::MotionSegmenter;
