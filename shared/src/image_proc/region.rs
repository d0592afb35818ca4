//! Axis-aligned pixel regions for motion candidates and mask rectangles.
//!
//! # Examples
//!
//! ```rust
//! use shared::image_proc::region::{count_overlaps, Region};
//!
//! let a = Region::from_corners(10, 10, 100, 100);
//! let b = Region::from_corners(20, 20, 200, 200);
//! let c = Region::from_corners(400, 400, 410, 410);
//!
//! assert!(a.overlaps(&b));
//! assert!(!a.overlaps(&c));
//! assert_eq!(count_overlaps(&[a, b, c]), 1);
//! ```

use imageproc::point::Point;
use imageproc::rect::Rect;

use crate::camera_config::MaskRect;

/// Rectangle in image coordinates.
///
/// `min` bounds are inclusive, `max` bounds exclusive, so a region covering
/// a single pixel at `(x, y)` is `(x, y)-(x+1, y+1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Region {
    /// Create a region from two corners, normalising their order.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Smallest region containing every point, or `None` for no points.
    pub fn bounding(points: &[Point<i32>]) -> Option<Self> {
        let first = points.first()?;
        let mut region = Self {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x + 1,
            max_y: first.y + 1,
        };
        for p in &points[1..] {
            region.min_x = region.min_x.min(p.x);
            region.min_y = region.min_y.min(p.y);
            region.max_x = region.max_x.max(p.x + 1);
            region.max_y = region.max_y.max(p.y + 1);
        }
        Some(region)
    }

    pub fn width(&self) -> u32 {
        (self.max_x - self.min_x).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.max_y - self.min_y).max(0) as u32
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Overlapping part of two regions, if they share any pixel.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let region = Region {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        (!region.is_empty()).then_some(region)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.intersection(other).is_some()
    }

    /// Clip to an image of `width` x `height`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        self.intersection(&Region::from_corners(0, 0, width as i32, height as i32))
    }

    /// Drawing rectangle for imageproc; `None` when empty.
    pub fn to_rect(&self) -> Option<Rect> {
        (!self.is_empty()).then(|| Rect::at(self.min_x, self.min_y).of_size(self.width(), self.height()))
    }
}

impl From<&MaskRect> for Region {
    fn from(mask: &MaskRect) -> Self {
        Region::from_corners(mask.px1, mask.py1, mask.px2, mask.py2)
    }
}

/// Index pairs `(i, j)`, `i < j`, of regions that intersect.
pub fn overlapping_pairs(regions: &[Region]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in regions.iter().enumerate() {
        for (j, b) in regions.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Number of unordered region pairs that intersect.
pub fn count_overlaps(regions: &[Region]) -> usize {
    overlapping_pairs(regions).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_nested_overlaps() {
        let regions = [
            Region::from_corners(10, 10, 100, 100),
            Region::from_corners(20, 20, 200, 200),
            Region::from_corners(30, 30, 300, 300),
        ];
        assert_eq!(count_overlaps(&regions), 3);
        assert_eq!(overlapping_pairs(&regions), vec![(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn test_touching_edges_do_not_overlap() {
        let left = Region::from_corners(0, 0, 10, 10);
        let right = Region::from_corners(10, 0, 20, 10);
        assert!(!left.overlaps(&right));
        assert_eq!(count_overlaps(&[left, right]), 0);
    }

    #[test]
    fn test_corner_order_normalised() {
        let region = Region::from_corners(50, 40, 10, 20);
        assert_eq!(region, Region::from_corners(10, 20, 50, 40));
        assert_eq!(region.width(), 40);
        assert_eq!(region.height(), 20);
        assert_eq!(region.area(), 800);
    }

    #[test]
    fn test_bounding_points() {
        let points = [Point::new(5, 7), Point::new(2, 9), Point::new(8, 3)];
        let region = Region::bounding(&points).unwrap();
        assert_eq!(region, Region::from_corners(2, 3, 9, 10));
        assert!(Region::bounding(&[]).is_none());
    }

    #[test]
    fn test_clamp_to_image() {
        let region = Region::from_corners(-5, -5, 20, 20);
        assert_eq!(region.clamp_to(10, 10), Some(Region::from_corners(0, 0, 10, 10)));
        assert_eq!(Region::from_corners(50, 50, 60, 60).clamp_to(10, 10), None);
    }

    #[test]
    fn test_mask_conversion() {
        let mask = MaskRect {
            px1: 1,
            py1: 2,
            px2: 30,
            py2: 40,
        };
        let region = Region::from(&mask);
        assert_eq!(region.to_rect().unwrap().width(), 29);
        assert!(Region::from_corners(3, 3, 3, 9).to_rect().is_none());
    }
}
