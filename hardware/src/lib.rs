//! Video source drivers for camhub.
//!
//! Every backend plugs into [`driver::CaptureDriver`], which owns the frame
//! buffer, the acquisition thread and the open/stream/stop lifecycle. The
//! backend only knows how to connect to its source and pull one frame.
//!
//! # Features
//!
//! - `v4l2` - Local V4L2 MJPEG capture (Linux only), plugin `blackjack`
//! - `vision` - Decoded capture by device index (Linux only), plugin `opencv`
//! - `full-linux` - Both local capture backends
//!
//! The remote multipart backend (`axis241q`) and the synthetic `mock`
//! backend are always available.

pub mod axis;
pub mod driver;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub mod v4l2;

#[cfg(all(target_os = "linux", feature = "vision"))]
pub mod vision;

#[cfg(all(target_os = "linux", any(feature = "v4l2", feature = "vision")))]
mod v4l_common;

use std::sync::Arc;

use shared::camera_interface::{Driver, DriverError, DriverResult};
use shared::{Backend, CameraConfig};

pub use axis::RemoteMultipartBackend;
pub use driver::{CaptureBackend, CaptureDriver, FrameSource};
pub use mock::MockBackend;

/// Build the driver selected by `config.backend`.
///
/// The driver is returned closed; call `open` and `stream` (or `reset`) to
/// start acquisition.
pub fn create_driver(config: &CameraConfig) -> DriverResult<Arc<dyn Driver>> {
    match config.backend {
        Backend::RemoteMultipart => Ok(Arc::new(CaptureDriver::new(
            RemoteMultipartBackend::new(),
            config.clone(),
        ))),
        Backend::Mock => Ok(Arc::new(CaptureDriver::new(
            MockBackend::new(),
            config.clone(),
        ))),
        Backend::LocalCapture => local_capture(config),
        Backend::VisionCapture => vision_capture(config),
    }
}

#[cfg(all(target_os = "linux", feature = "v4l2"))]
fn local_capture(config: &CameraConfig) -> DriverResult<Arc<dyn Driver>> {
    Ok(Arc::new(CaptureDriver::new(
        v4l2::LocalCaptureBackend::new(),
        config.clone(),
    )))
}

#[cfg(not(all(target_os = "linux", feature = "v4l2")))]
fn local_capture(_config: &CameraConfig) -> DriverResult<Arc<dyn Driver>> {
    Err(DriverError::Unsupported(Backend::LocalCapture))
}

#[cfg(all(target_os = "linux", feature = "vision"))]
fn vision_capture(config: &CameraConfig) -> DriverResult<Arc<dyn Driver>> {
    Ok(Arc::new(CaptureDriver::new(
        vision::VisionCaptureBackend::new(),
        config.clone(),
    )))
}

#[cfg(not(all(target_os = "linux", feature = "vision")))]
fn vision_capture(_config: &CameraConfig) -> DriverResult<Arc<dyn Driver>> {
    Err(DriverError::Unsupported(Backend::VisionCapture))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::camera_interface::DriverState;

    #[test]
    fn test_create_mock_driver() {
        let config = CameraConfig {
            backend: Backend::Mock,
            ..Default::default()
        };
        let driver = create_driver(&config).unwrap();
        assert_eq!(driver.backend(), Backend::Mock);
        assert_eq!(driver.state(), DriverState::Closed);
        assert!(driver.grab().is_placeholder());
    }

    #[test]
    fn test_create_remote_driver() {
        let config = CameraConfig {
            backend: Backend::RemoteMultipart,
            addr: "127.0.0.1".into(),
            ..Default::default()
        };
        let driver = create_driver(&config).unwrap();
        assert_eq!(driver.backend(), Backend::RemoteMultipart);
    }

    #[cfg(not(all(target_os = "linux", feature = "vision")))]
    #[test]
    fn test_vision_unsupported_without_feature() {
        let config = CameraConfig {
            backend: Backend::VisionCapture,
            ..Default::default()
        };
        assert!(matches!(
            create_driver(&config),
            Err(DriverError::Unsupported(Backend::VisionCapture))
        ));
    }
}
