//! Frame-to-frame motion classifier.
//!
//! [`MotionGate`] keeps the feature map of the last frame it saw. Each call to
//! [`MotionGate::detect`] differences the new feature map against that memory,
//! bounds the changed contours, and reports motion when enough of those
//! bounds overlap one another. Every call replaces the memory, so results
//! depend on call order.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::find_contours;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::point::Point;
use tracing::{debug, warn};

use super::region::{overlapping_pairs, Region};
use super::{CannyEdges, FeatureExtractor};
use crate::camera_config::MotionConfig;
use crate::frame::Frame;

/// Outline for every candidate region.
pub const CANDIDATE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Fill outline for the intersection of each overlapping pair.
pub const OVERLAP_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotionReport {
    pub motion: bool,
    pub candidates: Vec<Region>,
    pub overlaps: usize,
}

pub struct MotionGate<E: FeatureExtractor = CannyEdges> {
    extractor: E,
    previous: Option<GrayImage>,
}

impl MotionGate<CannyEdges> {
    pub fn new() -> Self {
        Self::with_extractor(CannyEdges::default())
    }
}

impl Default for MotionGate<CannyEdges> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: FeatureExtractor> MotionGate<E> {
    pub fn with_extractor(extractor: E) -> Self {
        Self {
            extractor,
            previous: None,
        }
    }

    /// Forget the stored feature map; the next call is a cold start.
    pub fn clear(&mut self) {
        self.previous = None;
    }

    pub fn has_memory(&self) -> bool {
        self.previous.is_some()
    }

    /// Classify `frame` against the previous call's frame.
    pub fn detect(&mut self, frame: &mut Frame, config: &MotionConfig) -> bool {
        self.analyze(frame, config).motion
    }

    /// Like [`detect`](Self::detect) but returns the candidate regions too.
    ///
    /// The first call after construction or [`clear`](Self::clear) stores
    /// the frame and never reports motion. A frame whose size differs from
    /// the stored one is treated the same way.
    pub fn analyze(&mut self, frame: &mut Frame, config: &MotionConfig) -> MotionReport {
        let image = match frame.image() {
            Ok(image) => image,
            Err(e) => {
                warn!("motion detection skipped, frame not decodable: {e}");
                return MotionReport::default();
            }
        };

        let mut features = self.extractor.extract(&image);
        paint_masks(&mut features, config);

        let previous = match self.previous.replace(features) {
            Some(previous) => previous,
            None => return MotionReport::default(),
        };
        let Some(current) = self.previous.as_ref() else {
            return MotionReport::default();
        };
        if previous.dimensions() != current.dimensions() {
            debug!(
                "motion memory reset on size change {:?} -> {:?}",
                previous.dimensions(),
                current.dimensions()
            );
            return MotionReport::default();
        }

        let diff = abs_diff(&previous, current);
        let candidates = candidate_regions(&diff, config.area);
        let pairs = overlapping_pairs(&candidates);
        let overlaps = pairs.len();

        if config.decorate && !candidates.is_empty() {
            match frame.image_mut() {
                Ok(canvas) => decorate(canvas, &candidates, &pairs),
                Err(e) => warn!("cannot decorate frame: {e}"),
            }
        }

        MotionReport {
            motion: overlaps > config.overlap,
            candidates,
            overlaps,
        }
    }
}

fn paint_masks(features: &mut GrayImage, config: &MotionConfig) {
    let (width, height) = features.dimensions();
    for mask in &config.motion_masks() {
        if let Some(rect) = mask.clamp_to(width, height).and_then(|r| r.to_rect()) {
            draw_filled_rect_mut(features, rect, Luma([255u8]));
        }
    }
}

fn abs_diff(previous: &GrayImage, current: &GrayImage) -> GrayImage {
    let mut diff = GrayImage::new(current.width(), current.height());
    for ((d, a), b) in diff.iter_mut().zip(previous.iter()).zip(current.iter()) {
        *d = a.abs_diff(*b);
    }
    diff
}

/// Bounding regions of changed contours whose enclosed area reaches `min_area`.
fn candidate_regions(diff: &GrayImage, min_area: f64) -> Vec<Region> {
    find_contours::<i32>(diff)
        .iter()
        .filter(|contour| polygon_area(&contour.points) >= min_area)
        .filter_map(|contour| Region::bounding(&contour.points))
        .collect()
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    twice_area.abs() as f64 / 2.0
}

fn decorate(canvas: &mut RgbImage, candidates: &[Region], pairs: &[(usize, usize)]) {
    let (width, height) = canvas.dimensions();
    for region in candidates {
        if let Some(rect) = region.clamp_to(width, height).and_then(|r| r.to_rect()) {
            draw_hollow_rect_mut(canvas, rect, CANDIDATE_COLOR);
        }
    }
    for &(i, j) in pairs {
        let overlap = candidates[i]
            .intersection(&candidates[j])
            .and_then(|r| r.clamp_to(width, height))
            .and_then(|r| r.to_rect());
        if let Some(rect) = overlap {
            draw_hollow_rect_mut(canvas, rect, OVERLAP_COLOR);
        }
    }
}

impl MotionConfig {
    /// Configured mask rectangles as regions.
    pub fn motion_masks(&self) -> Vec<Region> {
        self.mask.iter().map(Region::from).collect()
    }
}
