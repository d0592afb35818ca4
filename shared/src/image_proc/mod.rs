//! Image processing used by motion detection.

pub mod motion;
pub mod region;

use image::{GrayImage, RgbImage};

pub use motion::MotionGate;
pub use region::Region;

/// Reduces a frame to a single-channel feature map.
///
/// Non-zero pixels are features. Motion detection differences successive
/// feature maps, so the extractor decides what kind of change counts.
pub trait FeatureExtractor: Send {
    fn extract(&self, image: &RgbImage) -> GrayImage;
}

/// Canny edge map of the luminance channel.
#[derive(Debug, Clone, Copy)]
pub struct CannyEdges {
    pub low_threshold: f32,
    pub high_threshold: f32,
}

impl Default for CannyEdges {
    fn default() -> Self {
        Self {
            low_threshold: 50.0,
            high_threshold: 100.0,
        }
    }
}

impl FeatureExtractor for CannyEdges {
    fn extract(&self, image: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(image);
        imageproc::edges::canny(&gray, self.low_threshold, self.high_threshold)
    }
}
