//! Shared components for the camhub camera aggregation server.
//!
//! Everything here is backend-agnostic: the configuration model, the frame
//! type and its lock-guarded latest-frame slot, the [`camera_interface::Driver`]
//! capability trait implemented by the `hardware` crate, the multipart wire
//! codec, motion detection, and configuration persistence.

pub mod camera_config;
pub mod camera_interface;
pub mod config_storage;
pub mod frame;
pub mod image_proc;
pub mod image_size;
pub mod mjpeg;
pub mod pacing;
pub mod position;

pub use camera_config::{Backend, CameraConfig, MaskRect, MotionConfig, ValidationError};
pub use frame::{validate_jpeg, Frame, FrameError};
pub use image_size::ImageSize;
