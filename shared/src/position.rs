//! Position fixes and their embedding into outgoing JPEG frames.
//!
//! The position source is a collaborator: anything that can report the
//! latest fix implements [`PositionSource`]. When motion is detected, the
//! streaming loop embeds the fix as a JPEG comment (COM) segment directly
//! after the start-of-image marker.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

use crate::frame::validate_jpeg;

const COM_MARKER: [u8; 2] = [0xFF, 0xFE];

/// Largest payload a single COM segment can carry (length field is u16 and
/// counts itself).
const MAX_COMMENT_LEN: usize = u16::MAX as usize - 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PositionError {
    #[error("not a JPEG image")]
    NotJpeg,
    #[error("metadata comment too long ({0} bytes)")]
    CommentTooLong(usize),
}

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn latitude_dms(&self) -> String {
        to_dms(self.latitude, 'N', 'S')
    }

    pub fn longitude_dms(&self) -> String {
        to_dms(self.longitude, 'E', 'W')
    }
}

/// Format decimal degrees as `D°M'S.ss"H`.
pub fn to_dms(value: f64, positive: char, negative: char) -> String {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let total_seconds = (value.abs() * 3600.0 * 100.0).round() / 100.0;
    let degrees = (total_seconds / 3600.0).floor();
    let minutes = ((total_seconds - degrees * 3600.0) / 60.0).floor();
    let seconds = total_seconds - degrees * 3600.0 - minutes * 60.0;
    format!("{degrees:.0}°{minutes:.0}'{seconds:.2}\"{hemisphere}")
}

/// Reports the latest known position.
pub trait PositionSource: Send + Sync {
    fn current_fix(&self) -> Option<PositionFix>;
}

/// Source that never has a fix.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPosition;

impl PositionSource for NoPosition {
    fn current_fix(&self) -> Option<PositionFix> {
        None
    }
}

/// Source reporting one configured position.
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition(pub PositionFix);

impl PositionSource for FixedPosition {
    fn current_fix(&self) -> Option<PositionFix> {
        Some(self.0)
    }
}

/// Descriptive tags written alongside a fix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTags {
    pub make: String,
    pub model: String,
    pub host: String,
}

/// Render the comment text for a fix.
pub fn fix_comment(fix: &PositionFix, captured_at: SystemTime, tags: &MetadataTags) -> String {
    let timestamp = DateTime::<Utc>::from(captured_at).to_rfc3339_opts(SecondsFormat::Millis, true);
    format!(
        "lat={:.6}\nlon={:.6}\nlat_dms={}\nlon_dms={}\ntime={}\nmake={}\nmodel={}\nhost={}",
        fix.latitude,
        fix.longitude,
        fix.latitude_dms(),
        fix.longitude_dms(),
        timestamp,
        tags.make,
        tags.model,
        tags.host
    )
}

/// Copy of `jpeg` with a comment segment describing `fix` inserted after SOI.
pub fn embed_fix(
    jpeg: &[u8],
    fix: &PositionFix,
    captured_at: SystemTime,
    tags: &MetadataTags,
) -> Result<Bytes, PositionError> {
    if !validate_jpeg(jpeg) {
        return Err(PositionError::NotJpeg);
    }
    let comment = fix_comment(fix, captured_at, tags);
    if comment.len() > MAX_COMMENT_LEN {
        return Err(PositionError::CommentTooLong(comment.len()));
    }

    let mut out = BytesMut::with_capacity(jpeg.len() + comment.len() + 4);
    out.put_slice(&jpeg[..2]);
    out.put_slice(&COM_MARKER);
    out.put_u16(comment.len() as u16 + 2);
    out.put_slice(comment.as_bytes());
    out.put_slice(&jpeg[2..]);
    Ok(out.freeze())
}
