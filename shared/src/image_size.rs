//! Frame dimensions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height of a frame in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl ImageSize {
    pub fn from_width_height(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Same size with each dimension raised to at least one pixel.
    pub fn at_least_one(&self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn to_tuple(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl From<(u32, u32)> for ImageSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl From<ImageSize> for (u32, u32) {
    fn from(size: ImageSize) -> Self {
        size.to_tuple()
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_count() {
        let size = ImageSize::from_width_height(640, 480);
        assert_eq!(size.to_string(), "640x480");
        assert_eq!(size.pixel_count(), 307_200);
    }

    #[test]
    fn test_at_least_one() {
        let size = ImageSize::from_width_height(0, 12);
        assert!(size.is_empty());
        assert_eq!(size.at_least_one(), ImageSize::from_width_height(1, 12));
    }
}
