//! Synthetic video source.
//!
//! Produces a moving white square on a dark background at the configured
//! geometry. Faults can be injected to exercise recovery paths without
//! hardware: failing or panicking after a number of frames, refusing large
//! geometries, and capping the number of successful connects.

use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use shared::camera_interface::{DriverError, DriverResult, Formats, FrameSize};
use shared::{Backend, CameraConfig, Frame, ImageSize};

use crate::driver::{CaptureBackend, FrameSource};

const SQUARE: u32 = 16;

#[derive(Debug, Default)]
struct Counters {
    /// Successful connects
    opens: AtomicUsize,
    /// Sources currently alive
    live: AtomicUsize,
    /// One-shot fault armed
    fail_once_armed: AtomicBool,
    panic_once_armed: AtomicBool,
}

/// Mock backend. Clones share counters, so a test can keep a handle after
/// moving one into a driver.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    fail_after: Option<u64>,
    fail_once_after: Option<u64>,
    panic_once_after: Option<u64>,
    max_width: Option<u32>,
    open_limit: Option<usize>,
    counters: Arc<Counters>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every source fails after producing `frames` frames.
    pub fn fail_after_frames(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// The first source to reach `frames` frames fails; later ones run clean.
    pub fn fail_once_after_frames(mut self, frames: u64) -> Self {
        self.fail_once_after = Some(frames);
        self.counters.fail_once_armed.store(true, Ordering::SeqCst);
        self
    }

    /// The first source to reach `frames` frames panics.
    pub fn panic_once_after_frames(mut self, frames: u64) -> Self {
        self.panic_once_after = Some(frames);
        self.counters.panic_once_armed.store(true, Ordering::SeqCst);
        self
    }

    /// Refuse to connect with a width above `width`.
    pub fn max_width(mut self, width: u32) -> Self {
        self.max_width = Some(width);
        self
    }

    /// Refuse connects after `limit` successful ones.
    pub fn open_limit(mut self, limit: usize) -> Self {
        self.open_limit = Some(limit);
        self
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn live_sources(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for MockBackend {
    fn kind(&self) -> Backend {
        Backend::Mock
    }

    fn connect(&self, config: &CameraConfig) -> DriverResult<Box<dyn FrameSource>> {
        if let Some(max) = self.max_width {
            if config.width > max {
                return Err(DriverError::Connection(format!(
                    "mock camera supports at most {max} pixels wide, requested {}",
                    config.width
                )));
            }
        }
        if let Some(limit) = self.open_limit {
            if self.open_count() >= limit {
                return Err(DriverError::Connection(format!(
                    "mock camera open limit of {limit} reached"
                )));
            }
        }

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSource {
            size: config.size().at_least_one(),
            produced: 0,
            backend: self.clone(),
        }))
    }

    fn formats(&self, _config: &CameraConfig) -> DriverResult<Formats> {
        let mut formats = Formats::new();
        let sizes = [(1280, 720), (320, 240), (640, 480)]
            .into_iter()
            .filter(|(w, _)| self.max_width.map_or(true, |max| *w <= max))
            .map(|(w, h)| FrameSize::Discrete(ImageSize::from_width_height(w, h)));
        formats.insert("RGB3", sizes);
        Ok(formats)
    }
}

struct MockSource {
    size: ImageSize,
    produced: u64,
    backend: MockBackend,
}

impl MockSource {
    fn render(&self) -> RgbImage {
        let ImageSize { width, height } = self.size;
        let span_x = width.saturating_sub(SQUARE).max(1);
        let span_y = height.saturating_sub(SQUARE).max(1);
        let left = (self.produced as u32 * 3) % span_x;
        let top = (self.produced as u32 * 2) % span_y;

        RgbImage::from_fn(width, height, |x, y| {
            let inside = (left..left + SQUARE).contains(&x) && (top..top + SQUARE).contains(&y);
            if inside {
                Rgb([255, 255, 255])
            } else {
                Rgb([24, 24, 32])
            }
        })
    }
}

impl FrameSource for MockSource {
    fn next_frame(&mut self) -> DriverResult<Option<Frame>> {
        let counters = &self.backend.counters;

        if self.backend.fail_after.is_some_and(|n| self.produced >= n) {
            return Err(DriverError::Capture("injected read failure".into()));
        }
        if self.backend.fail_once_after.is_some_and(|n| self.produced >= n)
            && counters.fail_once_armed.swap(false, Ordering::SeqCst)
        {
            return Err(DriverError::Capture("injected one-shot read failure".into()));
        }
        if self.backend.panic_once_after.is_some_and(|n| self.produced >= n)
            && counters.panic_once_armed.swap(false, Ordering::SeqCst)
        {
            panic!("injected capture panic");
        }

        let frame = Frame::from_image(self.render());
        self.produced += 1;
        Ok(Some(frame))
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.backend.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: u32, height: u32) -> CameraConfig {
        CameraConfig {
            backend: Backend::Mock,
            width,
            height,
            ..Default::default()
        }
    }

    #[test]
    fn test_frames_move() {
        let backend = MockBackend::new();
        let mut source = backend.connect(&config(64, 48)).unwrap();

        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (64, 48));
        assert_ne!(*first.image().unwrap(), *second.image().unwrap());
    }

    #[test]
    fn test_live_source_tracking() {
        let backend = MockBackend::new();
        let a = backend.connect(&config(32, 32)).unwrap();
        let b = backend.connect(&config(32, 32)).unwrap();
        assert_eq!(backend.live_sources(), 2);
        drop(a);
        assert_eq!(backend.live_sources(), 1);
        drop(b);
        assert_eq!(backend.live_sources(), 0);
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_fail_once_only_hits_first_source() {
        let backend = MockBackend::new().fail_once_after_frames(1);
        let mut first = backend.connect(&config(32, 32)).unwrap();
        assert!(first.next_frame().is_ok());
        assert!(first.next_frame().is_err());

        let mut second = backend.connect(&config(32, 32)).unwrap();
        for _ in 0..5 {
            assert!(second.next_frame().is_ok());
        }
    }

    #[test]
    fn test_geometry_and_open_limits() {
        let backend = MockBackend::new().max_width(100).open_limit(1);
        assert!(backend.connect(&config(200, 100)).is_err());
        let _ok = backend.connect(&config(100, 100)).unwrap();
        assert!(backend.connect(&config(50, 50)).is_err());
    }

    #[test]
    fn test_formats_sorted_and_filtered() {
        let backend = MockBackend::new().max_width(700);
        let formats = backend.formats(&config(64, 48)).unwrap();
        let sizes: Vec<String> = formats
            .get("RGB3")
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(sizes, ["320x240", "640x480"]);
    }

    #[test]
    fn test_tiny_geometry_renders() {
        let backend = MockBackend::new();
        let mut source = backend.connect(&config(4, 4)).unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.width(), 4);
    }
}
