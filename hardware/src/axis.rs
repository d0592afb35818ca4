//! Remote network camera serving multipart JPEG over HTTP.
//!
//! `connect` issues one GET to the camera's MJPEG endpoint and keeps the
//! response body open; every `next_frame` pulls one part off that body. The
//! camera's own frame rate sets the cadence, so the source is unpaced.
//!
//! Redirects are followed by hand so basic-auth credentials are re-applied
//! on every hop.
//!
//! The body is read on its own thread so `next_frame` can notice a stop
//! request or a camera that has gone quiet. A stalled socket keeps that
//! thread parked until the peer sends or closes; it exits on its next send.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use ureq::{Agent, BodyReader};
use url::Url;

use shared::camera_interface::{DriverError, DriverResult, Formats};
use shared::mjpeg::MjpegReader;
use shared::{Backend, CameraConfig, Frame};

use crate::driver::{CaptureBackend, FrameSource};

const MAX_REDIRECTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest `next_frame` waits between stop checks
const STOP_POLL: Duration = Duration::from_millis(50);
/// Parts buffered ahead of the acquisition loop
const PART_QUEUE: usize = 2;
const MAX_UNDECODABLE_PARTS: u32 = 30;

/// Silence after which a connected camera is treated as failed.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoint path used when the config leaves `Uri` empty.
pub const DEFAULT_URI: &str = "axis-cgi/mjpg/video.cgi";

pub struct RemoteMultipartBackend {
    agent: Agent,
    stall_timeout: Duration,
}

impl RemoteMultipartBackend {
    pub fn new() -> Self {
        let agent: Agent = Agent::config_builder()
            .max_redirects(0)
            .max_redirects_will_error(false)
            .http_status_as_error(false)
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .timeout_recv_response(Some(RESPONSE_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

impl Default for RemoteMultipartBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream URL for `config`: `http://addr:port/uri?resolution=WxH`.
pub fn stream_url(config: &CameraConfig) -> DriverResult<Url> {
    if config.addr.is_empty() {
        return Err(DriverError::Connection("camera address is not set".into()));
    }
    let port = if config.port == 0 { 80 } else { config.port };
    let uri = if config.uri.is_empty() {
        DEFAULT_URI
    } else {
        config.uri.trim_start_matches('/')
    };

    let mut url = Url::parse(&format!("http://{}:{}/{}", config.addr, port, uri))
        .map_err(|e| DriverError::Connection(format!("invalid camera URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("resolution", &format!("{}x{}", config.width, config.height));
    Ok(url)
}

fn basic_auth(config: &CameraConfig) -> Option<String> {
    if config.user.is_empty() && config.pass.is_empty() {
        return None;
    }
    let token = BASE64.encode(format!("{}:{}", config.user, config.pass));
    Some(format!("Basic {token}"))
}

impl CaptureBackend for RemoteMultipartBackend {
    fn kind(&self) -> Backend {
        Backend::RemoteMultipart
    }

    fn connect(&self, config: &CameraConfig) -> DriverResult<Box<dyn FrameSource>> {
        let auth = basic_auth(config);
        let mut url = stream_url(config)?;

        for hop in 0..=MAX_REDIRECTS {
            let mut request = self.agent.get(url.as_str());
            if let Some(auth) = &auth {
                request = request.header("Authorization", auth);
            }
            let response = request
                .call()
                .map_err(|e| DriverError::Connection(format!("GET {url}: {e}")))?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        DriverError::Connection(format!("{status} from {url} without Location"))
                    })?;
                let next = url
                    .join(location)
                    .map_err(|e| DriverError::Connection(format!("bad redirect {location:?}: {e}")))?;
                debug!(hop, "redirected {url} -> {next}");
                url = next;
                continue;
            }
            if !status.is_success() {
                return Err(DriverError::Connection(format!("GET {url}: HTTP {status}")));
            }

            info!(camera = %config.name, "connected to {url}");
            let reader = MjpegReader::new(BufReader::new(response.into_body().into_reader()));
            let (parts_tx, parts_rx) = bounded(PART_QUEUE);
            thread::Builder::new()
                .name(format!("multipart-{}", config.name))
                .spawn(move || pump_parts(reader, parts_tx))?;
            return Ok(Box::new(MultipartSource {
                parts: parts_rx,
                stop: None,
                stall_timeout: self.stall_timeout,
                undecodable: 0,
            }));
        }

        Err(DriverError::Connection(format!(
            "more than {MAX_REDIRECTS} redirects from {}",
            config.addr
        )))
    }

    /// A fixed pull endpoint has no capability discovery.
    fn formats(&self, _config: &CameraConfig) -> DriverResult<Formats> {
        Ok(Formats::new())
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(1)
    }
}

type BodyParts = MjpegReader<BufReader<BodyReader<'static>>>;

/// Read parts until the body fails or the source is dropped.
fn pump_parts(mut reader: BodyParts, parts: Sender<DriverResult<Bytes>>) {
    loop {
        let part = reader.read_part().map_err(DriverError::from);
        let failed = part.is_err();
        if parts.send(part).is_err() || failed {
            return;
        }
    }
}

struct MultipartSource {
    parts: Receiver<DriverResult<Bytes>>,
    stop: Option<Arc<AtomicBool>>,
    stall_timeout: Duration,
    /// Consecutive parts that failed to decode
    undecodable: u32,
}

impl MultipartSource {
    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::Acquire))
    }

    fn decode(&mut self, payload: Bytes) -> DriverResult<Option<Frame>> {
        match Frame::from_jpeg(payload) {
            Ok(frame) => {
                self.undecodable = 0;
                Ok(Some(frame))
            }
            Err(e) => {
                self.undecodable += 1;
                if self.undecodable >= MAX_UNDECODABLE_PARTS {
                    return Err(DriverError::Capture(format!(
                        "{} consecutive undecodable parts: {e}",
                        self.undecodable
                    )));
                }
                warn!("skipping undecodable part: {e}");
                Ok(None)
            }
        }
    }
}

impl FrameSource for MultipartSource {
    fn next_frame(&mut self) -> DriverResult<Option<Frame>> {
        let mut waiting = Instant::now();
        loop {
            if self.stop_requested() {
                return Err(DriverError::Capture("interrupted by stop".into()));
            }
            match self.parts.recv_timeout(STOP_POLL) {
                Ok(part) => {
                    if let Some(frame) = self.decode(part?)? {
                        return Ok(Some(frame));
                    }
                    waiting = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if waiting.elapsed() >= self.stall_timeout {
                        return Err(DriverError::Capture(format!(
                            "no multipart part within {:?}",
                            self.stall_timeout
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DriverError::Capture("multipart body reader exited".into()));
                }
            }
        }
    }

    fn paced(&self) -> bool {
        false
    }

    fn watch_stop(&mut self, stop: Arc<AtomicBool>) {
        self.stop = Some(stop);
    }
}
