//! Camera configuration model.
//!
//! The JSON layout uses PascalCase keys so existing `camera.json` files keep
//! loading. Every field has a default, which lets partial documents (and
//! partial reload payloads) deserialize cleanly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::image_size::ImageSize;

/// JPEG cannot encode a side longer than this.
pub const MAX_FRAME_SIDE: u32 = 65_535;
/// Upper bound on pixels per frame.
pub const MAX_FRAME_PIXELS: u64 = 64 * 1024 * 1024;
/// Slowest accepted rate, one frame every 1000 seconds.
pub const MIN_RATE: f32 = 0.001;
pub const MAX_RATE: f32 = 1000.0;

/// A configuration value outside its allowed range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("frame size must be non-zero, got {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    #[error("frame size {width}x{height} exceeds the {max_side} pixel side or {max_pixels} pixel limit", max_side = MAX_FRAME_SIDE, max_pixels = MAX_FRAME_PIXELS)]
    FrameTooLarge { width: u32, height: u32 },
    #[error("frame rate must be a number from {min} to {max}, got {0}", min = MIN_RATE, max = MAX_RATE)]
    BadRate(String),
    #[error("remote camera address is required for backend {0}")]
    MissingAddress(Backend),
}

/// Video source backend, selected once at startup from the `Plugin` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Backend {
    /// OS-level vision capture device
    #[serde(rename = "opencv")]
    VisionCapture,
    /// Locally attached V4L2 capture device
    #[serde(rename = "blackjack")]
    #[default]
    LocalCapture,
    /// Remote network camera serving multipart JPEG over HTTP
    #[serde(rename = "axis241q")]
    RemoteMultipart,
    /// Synthetic frames, no hardware required
    #[serde(rename = "mock")]
    Mock,
}

impl Backend {
    /// Configuration value naming this backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::VisionCapture => "opencv",
            Backend::LocalCapture => "blackjack",
            Backend::RemoteMultipart => "axis241q",
            Backend::Mock => "mock",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rectangle excluded from motion detection, in pixel coordinates.
///
/// `(px1, py1)` is the top-left corner and `(px2, py2)` the exclusive
/// bottom-right corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MaskRect {
    pub px1: i32,
    pub py1: i32,
    pub px2: i32,
    pub py2: i32,
}

/// Motion detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Minimum contour area for a candidate region
    pub area: f64,
    /// Reserved, not consulted by detection
    pub detections: i32,
    /// Overlap count that must be strictly exceeded to report motion
    pub overlap: usize,
    /// Regions painted out before differencing
    pub mask: Vec<MaskRect>,
    /// Reserved capture window before a detection
    pub before_seconds: u32,
    /// Reserved capture window after a detection
    pub after_seconds: u32,
    /// Outline candidate regions on the outgoing frame
    pub decorate: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            area: 100.0,
            detections: 0,
            overlap: 2,
            mask: Vec::new(),
            before_seconds: 0,
            after_seconds: 0,
            decorate: false,
        }
    }
}

/// Complete configuration for one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CameraConfig {
    pub enabled: bool,
    pub uuid: String,
    /// Local device index (`/dev/video<N>`)
    pub device: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Target frames per second
    pub rate: f32,
    pub motion: MotionConfig,
    #[serde(rename = "Plugin")]
    pub backend: Backend,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub addr: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pass: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uuid: String::new(),
            device: 0,
            name: "camera".to_string(),
            width: 640,
            height: 480,
            rate: 15.0,
            motion: MotionConfig::default(),
            backend: Backend::default(),
            addr: String::new(),
            port: 0,
            uri: String::new(),
            user: String::new(),
            pass: String::new(),
            api_key: String::new(),
        }
    }
}

impl CameraConfig {
    /// Configured frame geometry.
    pub fn size(&self) -> ImageSize {
        ImageSize::from_width_height(self.width, self.height)
    }

    /// Check geometry, rate and backend-specific fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        if self.width > MAX_FRAME_SIDE
            || self.height > MAX_FRAME_SIDE
            || u64::from(self.width) * u64::from(self.height) > MAX_FRAME_PIXELS
        {
            return Err(ValidationError::FrameTooLarge {
                width: self.width,
                height: self.height,
            });
        }
        if !(MIN_RATE..=MAX_RATE).contains(&self.rate) {
            return Err(ValidationError::BadRate(self.rate.to_string()));
        }
        if self.backend == Backend::RemoteMultipart && self.addr.is_empty() {
            return Err(ValidationError::MissingAddress(self.backend));
        }
        Ok(())
    }

    /// Produce a new configuration with `patch` merged over this one.
    ///
    /// Objects merge key by key (recursively); arrays and scalars in the
    /// patch replace the existing value. `self` is left untouched.
    pub fn merged_with(&self, patch: &Value) -> Result<CameraConfig, serde_json::Error> {
        let mut base = serde_json::to_value(self)?;
        merge_json(&mut base, patch);
        serde_json::from_value(base)
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
