//! Locally attached V4L2 capture device delivering MJPEG.
//!
//! Frames are passed through as the device encoded them; nothing is decoded
//! unless a viewer needs to draw on the frame.

use bytes::Bytes;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::Device;

use shared::camera_interface::{DriverError, DriverResult, Formats};
use shared::{validate_jpeg, Backend, CameraConfig, Frame};

use crate::driver::{CaptureBackend, FrameSource};
use crate::v4l_common::{self, BUFFER_COUNT, MJPG};

/// Consecutive corrupt buffers tolerated before the read counts as failed.
const MAX_CORRUPT_FRAMES: u32 = 30;

#[derive(Debug, Default)]
pub struct LocalCaptureBackend;

impl LocalCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for LocalCaptureBackend {
    fn kind(&self) -> Backend {
        Backend::LocalCapture
    }

    fn connect(&self, config: &CameraConfig) -> DriverResult<Box<dyn FrameSource>> {
        let mut device = v4l_common::open_device(config.device)?;
        let format = v4l_common::configure(&mut device, config.size(), MJPG)?;
        if format.fourcc != MJPG {
            return Err(DriverError::Connection(format!(
                "{} does not deliver MJPG (got {})",
                v4l_common::device_path(config.device),
                format.fourcc
            )));
        }
        v4l_common::set_rate(&mut device, config.rate);

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| DriverError::Connection(format!("failed to map buffers: {e}")))?;

        info!(
            camera = %config.name,
            "{} streaming MJPG {}x{}",
            v4l_common::device_path(config.device),
            format.width,
            format.height
        );
        Ok(Box::new(LocalSource {
            stream,
            _device: device,
            width: format.width,
            height: format.height,
        }))
    }

    fn formats(&self, config: &CameraConfig) -> DriverResult<Formats> {
        let device = v4l_common::open_device(config.device)?;
        v4l_common::list_formats(&device)
    }
}

struct LocalSource {
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
}

impl FrameSource for LocalSource {
    fn next_frame(&mut self) -> DriverResult<Option<Frame>> {
        let mut corrupt = 0;
        loop {
            let (buf, meta) = self
                .stream
                .next()
                .map_err(|e| DriverError::Capture(format!("dequeue failed: {e}")))?;

            let used = (meta.bytesused as usize).min(buf.len());
            let data = if used > 0 { &buf[..used] } else { buf };

            if validate_jpeg(data) {
                let jpeg = Bytes::copy_from_slice(data);
                return Ok(Some(Frame::from_jpeg_with_size(jpeg, self.width, self.height)));
            }

            corrupt += 1;
            debug!("dropping corrupt MJPG buffer ({} bytes)", data.len());
            if corrupt >= MAX_CORRUPT_FRAMES {
                return Err(DriverError::Capture(format!(
                    "{corrupt} consecutive corrupt buffers"
                )));
            }
        }
    }
}
