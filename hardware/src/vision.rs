//! Vision capture by device index.
//!
//! Unlike [`crate::v4l2`], this backend hands out decoded RGB frames: it
//! accepts whichever of YUYV or MJPG the device settles on and converts each
//! buffer before publishing, the way a general-purpose vision capture API
//! would.

use image::RgbImage;
use tracing::info;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::{Device, FourCC};

use shared::camera_interface::{DriverError, DriverResult, Formats};
use shared::frame::decode_jpeg;
use shared::{Backend, CameraConfig, Frame};

use crate::driver::{CaptureBackend, FrameSource};
use crate::v4l_common::{self, BUFFER_COUNT, MJPG, YUYV};

#[derive(Debug, Default)]
pub struct VisionCaptureBackend;

impl VisionCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for VisionCaptureBackend {
    fn kind(&self) -> Backend {
        Backend::VisionCapture
    }

    fn connect(&self, config: &CameraConfig) -> DriverResult<Box<dyn FrameSource>> {
        let mut device = v4l_common::open_device(config.device)?;
        let mut format = v4l_common::configure(&mut device, config.size(), YUYV)?;
        if format.fourcc != YUYV {
            format = v4l_common::configure(&mut device, config.size(), MJPG)?;
        }
        if format.fourcc != YUYV && format.fourcc != MJPG {
            return Err(DriverError::Connection(format!(
                "unsupported pixel format {}",
                format.fourcc
            )));
        }
        v4l_common::set_rate(&mut device, config.rate);

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| DriverError::Connection(format!("failed to map buffers: {e}")))?;

        info!(
            camera = %config.name,
            "device {} capturing {} {}x{}",
            config.device,
            format.fourcc,
            format.width,
            format.height
        );
        Ok(Box::new(VisionSource {
            stream,
            _device: device,
            fourcc: format.fourcc,
            width: format.width,
            height: format.height,
            stride: format.stride,
        }))
    }

    fn formats(&self, config: &CameraConfig) -> DriverResult<Formats> {
        let device = v4l_common::open_device(config.device)?;
        v4l_common::list_formats(&device)
    }
}

struct VisionSource {
    stream: MmapStream<'static>,
    _device: Device,
    fourcc: FourCC,
    width: u32,
    height: u32,
    stride: u32,
}

impl FrameSource for VisionSource {
    fn next_frame(&mut self) -> DriverResult<Option<Frame>> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| DriverError::Capture(format!("dequeue failed: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let image = if self.fourcc == MJPG {
            decode_jpeg(data).map_err(|e| DriverError::Capture(e.to_string()))?
        } else {
            yuyv_to_rgb(data, self.width, self.height, self.stride).ok_or_else(|| {
                DriverError::Capture(format!("short YUYV buffer ({} bytes)", data.len()))
            })?
        };
        Ok(Some(Frame::from_image(image)))
    }
}

/// Convert packed YUYV 4:2:2 (BT.601) to RGB. `stride` is bytes per row;
/// zero means tightly packed.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Option<RgbImage> {
    if width == 0 || height == 0 {
        return None;
    }
    let row_bytes = width as usize * 2;
    let stride = if stride == 0 { row_bytes } else { stride as usize };
    if stride < row_bytes || data.len() < stride * (height as usize - 1) + row_bytes {
        return None;
    }

    let mut image = RgbImage::new(width, height);
    for y in 0..height as usize {
        let row = &data[y * stride..y * stride + row_bytes];
        for (pair, chunk) in row.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            let x = pair as u32 * 2;
            image.put_pixel(x, y as u32, ycbcr_to_rgb(y0, u, v));
            if x + 1 < width {
                image.put_pixel(x + 1, y as u32, ycbcr_to_rgb(y1, u, v));
            }
        }
    }
    Some(image)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> image::Rgb<u8> {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    image::Rgb([
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ])
}
