//! Capability listing returned by `Driver::list_formats_and_frame_sizes`.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::image_size::ImageSize;

/// One supported frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    Discrete(ImageSize),
    /// Any size between `min` and `max` in the device's step increments
    Stepwise { min: ImageSize, max: ImageSize },
}

impl FrameSize {
    fn sort_key(&self) -> (u64, u32) {
        match self {
            FrameSize::Discrete(size) => (size.pixel_count(), size.width),
            FrameSize::Stepwise { min, .. } => (min.pixel_count(), min.width),
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameSize::Discrete(size) => write!(f, "{size}"),
            FrameSize::Stepwise { min, max } => write!(f, "{min}-{max}"),
        }
    }
}

impl Serialize for FrameSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Frame sizes keyed by pixel format name (e.g. `MJPG`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Formats(BTreeMap<String, Vec<FrameSize>>);

impl Formats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add sizes for `format`, keeping each list ordered by pixel area.
    pub fn insert(&mut self, format: impl Into<String>, sizes: impl IntoIterator<Item = FrameSize>) {
        let entry = self.0.entry(format.into()).or_default();
        entry.extend(sizes);
        entry.sort_by_key(FrameSize::sort_key);
        entry.dedup();
    }

    pub fn get(&self, format: &str) -> Option<&[FrameSize]> {
        self.0.get(format).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<FrameSize>)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete(w: u32, h: u32) -> FrameSize {
        FrameSize::Discrete(ImageSize::from_width_height(w, h))
    }

    #[test]
    fn test_sizes_sorted_by_area() {
        let mut formats = Formats::new();
        formats.insert("MJPG", [discrete(1920, 1080), discrete(320, 240), discrete(640, 480)]);
        formats.insert("MJPG", [discrete(800, 600), discrete(320, 240)]);

        let sizes = formats.get("MJPG").unwrap();
        let rendered: Vec<String> = sizes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["320x240", "640x480", "800x600", "1920x1080"]);
    }

    #[test]
    fn test_json_shape() {
        let mut formats = Formats::new();
        formats.insert("YUYV", [discrete(640, 480)]);
        formats.insert(
            "MJPG",
            [FrameSize::Stepwise {
                min: ImageSize::from_width_height(16, 16),
                max: ImageSize::from_width_height(4096, 2160),
            }],
        );

        let json = serde_json::to_value(&formats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"MJPG": ["16x16-4096x2160"], "YUYV": ["640x480"]})
        );
    }

    #[test]
    fn test_empty() {
        let formats = Formats::new();
        assert!(formats.is_empty());
        assert_eq!(serde_json::to_string(&formats).unwrap(), "{}");
    }
}
