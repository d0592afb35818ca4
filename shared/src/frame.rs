//! The frame type handed from drivers to viewers.
//!
//! A [`Frame`] carries either an encoded JPEG, a decoded RGB image, or both.
//! Both representations sit behind reference counts so cloning a frame out of
//! a [`crate::camera_interface::frame_buffer::FrameBuffer`] is a pointer copy.
//! Mutation goes through [`Frame::image_mut`], which copies on write, so a
//! grabbed frame never aliases the producer's slot.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbImage};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

use crate::image_size::ImageSize;

/// JPEG quality used for placeholder frames. They are flat black, so the
/// setting only affects the size of the quantisation tables.
const PLACEHOLDER_QUALITY: u8 = 10;

static PLACEHOLDERS: Lazy<Mutex<HashMap<ImageSize, Bytes>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to decode JPEG: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
    #[error("frame has no image data")]
    Empty,
}

/// One captured image plus its capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    jpeg: Option<Bytes>,
    image: Option<Arc<RgbImage>>,
    captured_at: SystemTime,
    placeholder: bool,
}

impl Frame {
    /// Wrap an encoded JPEG, reading its dimensions from the header.
    pub fn from_jpeg(jpeg: Bytes) -> Result<Self, FrameError> {
        let (width, height) = ImageReader::with_format(Cursor::new(&jpeg[..]), ImageFormat::Jpeg)
            .into_dimensions()
            .map_err(FrameError::Decode)?;
        Ok(Self::from_jpeg_with_size(jpeg, width, height))
    }

    /// Wrap an encoded JPEG whose dimensions are already known.
    pub fn from_jpeg_with_size(jpeg: Bytes, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            jpeg: Some(jpeg),
            image: None,
            captured_at: SystemTime::now(),
            placeholder: false,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            jpeg: None,
            image: Some(Arc::new(image)),
            captured_at: SystemTime::now(),
            placeholder: false,
        }
    }

    /// A black frame of the given size.
    ///
    /// Zero dimensions are raised to one pixel so the result always encodes.
    /// Encoded placeholders are cached per size.
    pub fn placeholder(size: ImageSize) -> Self {
        let size = size.at_least_one();
        let mut cache = PLACEHOLDERS.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(jpeg) = cache.get(&size) {
            return Self::placeholder_from(size, Some(jpeg.clone()), None);
        }

        let image = RgbImage::new(size.width, size.height);
        match encode_jpeg(&image, PLACEHOLDER_QUALITY) {
            Ok(jpeg) => {
                cache.insert(size, jpeg.clone());
                Self::placeholder_from(size, Some(jpeg), None)
            }
            Err(e) => {
                tracing::warn!("placeholder encode failed for {size}: {e}");
                Self::placeholder_from(size, None, Some(Arc::new(image)))
            }
        }
    }

    fn placeholder_from(size: ImageSize, jpeg: Option<Bytes>, image: Option<Arc<RgbImage>>) -> Self {
        Self {
            width: size.width,
            height: size.height,
            jpeg,
            image,
            captured_at: SystemTime::now(),
            placeholder: true,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::from_width_height(self.width, self.height)
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// True for frames generated in place of real capture data.
    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Cached encoded form, if one is held.
    pub fn jpeg(&self) -> Option<&Bytes> {
        self.jpeg.as_ref()
    }

    /// Replace the encoded form, e.g. after embedding metadata.
    pub fn set_jpeg(&mut self, jpeg: Bytes) {
        self.jpeg = Some(jpeg);
    }

    /// Decoded form, decoding the cached JPEG if needed.
    pub fn image(&self) -> Result<Arc<RgbImage>, FrameError> {
        if let Some(image) = &self.image {
            return Ok(image.clone());
        }
        let jpeg = self.jpeg.as_ref().ok_or(FrameError::Empty)?;
        Ok(Arc::new(decode_jpeg(jpeg)?))
    }

    /// Mutable decoded form. Drops the cached JPEG since it no longer
    /// matches the pixels.
    pub fn image_mut(&mut self) -> Result<&mut RgbImage, FrameError> {
        if self.image.is_none() {
            let jpeg = self.jpeg.as_ref().ok_or(FrameError::Empty)?;
            self.image = Some(Arc::new(decode_jpeg(jpeg)?));
        }
        self.jpeg = None;
        match self.image.as_mut() {
            Some(image) => Ok(Arc::make_mut(image)),
            None => Err(FrameError::Empty),
        }
    }

    /// Encoded form, reusing the cached JPEG when present.
    pub fn to_jpeg(&self, quality: u8) -> Result<Bytes, FrameError> {
        if let Some(jpeg) = &self.jpeg {
            return Ok(jpeg.clone());
        }
        let image = self.image.as_ref().ok_or(FrameError::Empty)?;
        encode_jpeg(image, quality)
    }
}

/// Decode JPEG bytes into an RGB image.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(FrameError::Decode)
}

/// Encode an RGB image as JPEG at the given quality (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, FrameError> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, quality.clamp(1, 100));
    encoder.encode_image(image).map_err(FrameError::Encode)?;
    Ok(Bytes::from(jpeg_bytes))
}

/// Check the SOI and EOI markers of an encoded JPEG.
pub fn validate_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}
