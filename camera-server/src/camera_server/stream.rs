//! Per-viewer multipart streaming loop.
//!
//! Every viewer gets its own loop and its own [`MotionGate`], so motion
//! memory reflects exactly the frames that viewer was sent. The loop ends
//! when hyper drops the body (viewer disconnected) or the server shuts down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Deserialize;
use tracing::{debug, info, warn};

use shared::image_proc::MotionGate;
use shared::mjpeg::{encode_part, RESPONSE_CONTENT_TYPE};
use shared::pacing::pacing_delay;
use shared::position::{embed_fix, MetadataTags, PositionSource};
use shared::{validate_jpeg, CameraConfig, Frame, ImageSize};

use super::error::ApiError;
use super::AppState;

const MOTION_BORDER: Rgb<u8> = Rgb([255, 140, 0]);
const MOTION_BORDER_WIDTH: u32 = 4;

static NEXT_VIEWER: AtomicU64 = AtomicU64::new(1);

/// Everything a render step needs besides the frame and the gate.
pub struct RenderContext {
    pub position: Arc<dyn PositionSource>,
    pub tags: MetadataTags,
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    format: Option<String>,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    if let Some(format) = query.format.as_deref() {
        if matches!(format, "h264" | "wav") {
            return Err(ApiError::NotImplemented(format!(
                "{format} streaming is not implemented"
            )));
        }
    }

    let body = Body::from_stream(viewer_stream(state));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
        .header(header::CONNECTION, "close")
        .header(header::SERVER, "camhub")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(body)
        .map_err(|e| ApiError::Internal(format!("failed to build stream response: {e}")))
}

/// Logs the viewer's departure however the stream ends.
struct ViewerGuard {
    id: u64,
    parts: u64,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        info!(viewer = self.id, parts = self.parts, "viewer disconnected");
    }
}

fn viewer_stream(state: Arc<AppState>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut guard = ViewerGuard { id: NEXT_VIEWER.fetch_add(1, Ordering::Relaxed), parts: 0 };
        info!(viewer = guard.id, "viewer connected");

        let mut gate = MotionGate::new();
        let mut shutdown = state.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            let frame = state.driver.grab();
            let config = state.live.snapshot();
            let render = state.render.clone();
            let mut viewer_gate = std::mem::take(&mut gate);

            let rendered = tokio::task::spawn_blocking(move || {
                let part = render_part(&render, frame, &config, &mut viewer_gate);
                (part, viewer_gate, config.rate)
            })
            .await;
            let (part, returned_gate, rate) = match rendered {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(viewer = guard.id, "render task failed: {e}");
                    break;
                }
            };
            gate = returned_gate;

            yield Ok(part);
            guard.parts += 1;

            let delay = pacing_delay(rate, started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(viewer = guard.id, "viewer loop finished");
    }
}

/// Turn one grabbed frame into one multipart unit.
pub fn render_part(
    ctx: &RenderContext,
    mut frame: Frame,
    config: &CameraConfig,
    gate: &mut MotionGate,
) -> Bytes {
    let mut motion = false;
    if config.motion.enabled && !frame.is_placeholder() {
        motion = gate.detect(&mut frame, &config.motion);
        if motion && config.motion.decorate {
            draw_motion_border(&mut frame);
        }
    }

    let jpeg = match frame.to_jpeg(ctx.jpeg_quality) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            warn!("failed to encode frame: {e}");
            placeholder_jpeg(config.size(), ctx.jpeg_quality)
        }
    };

    let jpeg = match ctx.position.current_fix().filter(|_| motion) {
        Some(fix) => match embed_fix(&jpeg, &fix, frame.captured_at(), &ctx.tags) {
            Ok(tagged) => tagged,
            Err(e) => {
                warn!("failed to embed position fix: {e}");
                jpeg
            }
        },
        None => jpeg,
    };

    let jpeg = if validate_jpeg(&jpeg) {
        jpeg
    } else {
        warn!(len = jpeg.len(), "frame failed JPEG marker check, sending placeholder");
        placeholder_jpeg(config.size(), ctx.jpeg_quality)
    };
    encode_part(&jpeg)
}

fn placeholder_jpeg(size: ImageSize, quality: u8) -> Bytes {
    Frame::placeholder(size).to_jpeg(quality).unwrap_or_default()
}

fn draw_motion_border(frame: &mut Frame) {
    let Ok(image) = frame.image_mut() else {
        return;
    };
    let (width, height) = image.dimensions();
    for inset in 0..MOTION_BORDER_WIDTH {
        if width <= inset * 2 || height <= inset * 2 {
            break;
        }
        let rect = Rect::at(inset as i32, inset as i32).of_size(width - inset * 2, height - inset * 2);
        draw_hollow_rect_mut(image, rect, MOTION_BORDER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use shared::mjpeg::MjpegReader;
    use shared::position::{FixedPosition, NoPosition, PositionFix};
    use shared::MotionConfig;

    fn context(position: Arc<dyn PositionSource>) -> RenderContext {
        RenderContext {
            position,
            tags: MetadataTags {
                make: "camhub".into(),
                model: "mock".into(),
                host: "test".into(),
            },
            jpeg_quality: 80,
        }
    }

    fn payload(part: &Bytes) -> Vec<u8> {
        MjpegReader::new(&part[..]).read_part().unwrap().to_vec()
    }

    fn frame_with_square(x: u32) -> Frame {
        let mut image = RgbImage::from_pixel(96, 64, Rgb([10, 10, 10]));
        for dy in 0..20 {
            for dx in 0..20 {
                image.put_pixel(x + dx, 20 + dy, Rgb([250, 250, 250]));
            }
        }
        Frame::from_image(image)
    }

    #[test]
    fn test_plain_frame_renders_valid_part() {
        let ctx = context(Arc::new(NoPosition));
        let config = CameraConfig::default();
        let part = render_part(&ctx, frame_with_square(10), &config, &mut MotionGate::new());

        let jpeg = payload(&part);
        assert!(validate_jpeg(&jpeg));
        assert_eq!(shared::frame::decode_jpeg(&jpeg).unwrap().dimensions(), (96, 64));
    }

    #[test]
    fn test_placeholder_skips_motion() {
        let ctx = context(Arc::new(FixedPosition(PositionFix::new(1.0, 2.0))));
        let config = CameraConfig {
            motion: MotionConfig {
                enabled: true,
                overlap: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut gate = MotionGate::new();
        let part = render_part(&ctx, Frame::placeholder(config.size()), &config, &mut gate);

        assert!(!gate.has_memory());
        assert!(validate_jpeg(&payload(&part)));
    }

    #[test]
    fn test_first_frame_never_embeds_fix() {
        let ctx = context(Arc::new(FixedPosition(PositionFix::new(51.5, -0.12))));
        let config = CameraConfig {
            motion: MotionConfig {
                enabled: true,
                area: 1.0,
                overlap: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut gate = MotionGate::new();
        let part = render_part(&ctx, frame_with_square(10), &config, &mut gate);

        let jpeg = payload(&part);
        assert!(gate.has_memory());
        // No COM segment right after SOI
        assert_ne!(&jpeg[2..4], &[0xFF, 0xFE]);
    }

    #[test]
    fn test_border_outlines_frame() {
        let mut frame = Frame::from_image(RgbImage::from_pixel(32, 32, Rgb([0, 0, 0])));
        draw_motion_border(&mut frame);
        let image = frame.image().unwrap();
        assert_eq!(image.get_pixel(0, 0), &MOTION_BORDER);
        assert_eq!(image.get_pixel(3, 16), &MOTION_BORDER);
        assert_eq!(image.get_pixel(16, 16), &Rgb([0, 0, 0]));
    }
}
