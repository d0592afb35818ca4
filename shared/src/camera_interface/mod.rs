//! Capability interface shared by every video source backend.
//!
//! A [`Driver`] owns one physical or network source, runs a background
//! acquisition task that publishes into a [`frame_buffer::FrameBuffer`], and
//! exposes the open/stream/stop/reset lifecycle. Backends live in the
//! `hardware` crate; everything above it (lifecycle supervision, the HTTP
//! server) only sees `Arc<dyn Driver>`.

pub mod formats;
pub mod frame_buffer;

use crossbeam_channel::Receiver;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::camera_config::{Backend, CameraConfig};
use crate::frame::Frame;
use crate::mjpeg::ProtocolError;

pub use formats::{Formats, FrameSize};
pub use frame_buffer::FrameBuffer;

#[derive(Error, Debug)]
pub enum DriverError {
    /// Failed to open the device or reach the remote host
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Hard read failure from an open source
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("source is not open")]
    NotOpen,
    #[error("source is already open")]
    AlreadyOpen,
    #[error("acquisition is already running")]
    AlreadyStreaming,
    #[error("backend {0} is not available in this build")]
    Unsupported(Backend),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Lifecycle state of a driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Closed,
    Opening,
    /// Source handle held, acquisition not started
    Ready,
    Streaming,
    Stopping,
    /// Acquisition ended on its own; awaiting reset
    Faulted,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DriverState::Closed => "closed",
            DriverState::Opening => "opening",
            DriverState::Ready => "ready",
            DriverState::Streaming => "streaming",
            DriverState::Stopping => "stopping",
            DriverState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Why an acquisition task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop flag was observed
    Stopped,
    /// The source reported end of stream
    SourceEnded,
    /// A hard read failure
    Failed(String),
    /// The task panicked
    Panicked(String),
}

impl ExitReason {
    /// Exits that should trigger automatic recovery.
    pub fn is_fault(&self) -> bool {
        !matches!(self, ExitReason::Stopped)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::SourceEnded => write!(f, "source ended"),
            ExitReason::Failed(msg) => write!(f, "failed: {msg}"),
            ExitReason::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Notification sent when an acquisition task terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    /// Stream generation the task belonged to
    pub generation: u64,
    pub reason: ExitReason,
}

/// One video source.
///
/// All methods take `&self`; implementations serialise their own state.
/// Callers that need several calls to happen atomically (a reset racing a
/// start, say) serialise above this trait.
pub trait Driver: Send + Sync {
    /// Backend this driver was built for.
    fn backend(&self) -> Backend;

    /// Acquire the source handle and configure geometry and rate.
    ///
    /// On failure no handle is held.
    fn open(&self, config: &CameraConfig) -> DriverResult<()>;

    /// Start the background acquisition task. Non-blocking.
    fn stream(&self) -> DriverResult<()>;

    /// Snapshot of the latest frame. Never empty: a placeholder is returned
    /// before the first capture and after a stop.
    fn grab(&self) -> Frame;

    /// Signal the acquisition task to end, show the placeholder, and release
    /// the source handle. Blocks for at most a bounded grace period.
    fn stop(&self);

    /// Stop, then open with `config`, then stream.
    fn reset(&self, config: &CameraConfig) -> DriverResult<()> {
        self.stop();
        self.open(config)?;
        self.stream()
    }

    /// Supported pixel formats and frame sizes. Sources with a fixed
    /// endpoint report an empty set.
    fn list_formats_and_frame_sizes(&self) -> DriverResult<Formats>;

    fn state(&self) -> DriverState;

    /// Generation of the most recently started acquisition task.
    fn generation(&self) -> u64;

    /// Channel receiving one [`TaskExit`] per finished acquisition task.
    fn exit_events(&self) -> Receiver<TaskExit>;
}
