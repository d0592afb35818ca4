//! Device helpers shared by the V4L2 capture backends.

use v4l::framesize::FrameSizeEnum;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use shared::camera_interface::{DriverError, DriverResult, Formats, FrameSize};
use shared::ImageSize;

pub const MJPG: FourCC = FourCC { repr: *b"MJPG" };
pub const YUYV: FourCC = FourCC { repr: *b"YUYV" };

/// Mmap buffers queued per stream.
pub const BUFFER_COUNT: u32 = 4;

pub fn device_path(index: u32) -> String {
    format!("/dev/video{index}")
}

pub fn open_device(index: u32) -> DriverResult<Device> {
    let path = device_path(index);
    Device::with_path(&path).map_err(|e| DriverError::Connection(format!("{path}: {e}")))
}

/// Request `fourcc` at `size`; returns the format the driver settled on.
pub fn configure(device: &mut Device, size: ImageSize, fourcc: FourCC) -> DriverResult<v4l::Format> {
    let mut format = device.format()?;
    format.width = size.width;
    format.height = size.height;
    format.fourcc = fourcc;
    Ok(device.set_format(&format)?)
}

/// Request a frame interval for `rate` fps. Devices that ignore interval
/// requests are left at their default.
pub fn set_rate(device: &mut Device, rate: f32) {
    let fps = rate.round().max(1.0) as u32;
    if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
        tracing::debug!("device ignored {fps} fps request: {e}");
    }
}

fn fourcc_name(fourcc: &FourCC) -> String {
    fourcc
        .str()
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| format!("{:?}", fourcc.repr))
}

/// Every pixel format with its frame sizes.
pub fn list_formats(device: &Device) -> DriverResult<Formats> {
    let mut formats = Formats::new();
    for description in device.enum_formats()? {
        let sizes = device
            .enum_framesizes(description.fourcc)?
            .into_iter()
            .map(|frame_size| match frame_size.size {
                FrameSizeEnum::Discrete(d) => {
                    FrameSize::Discrete(ImageSize::from_width_height(d.width, d.height))
                }
                FrameSizeEnum::Stepwise(s) => FrameSize::Stepwise {
                    min: ImageSize::from_width_height(s.min_width, s.min_height),
                    max: ImageSize::from_width_height(s.max_width, s.max_height),
                },
            });
        formats.insert(fourcc_name(&description.fourcc), sizes);
    }
    Ok(formats)
}
