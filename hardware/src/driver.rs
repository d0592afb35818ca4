//! Backend-independent driver machinery.
//!
//! [`CaptureDriver`] implements [`Driver`] for any [`CaptureBackend`]. It
//! holds at most one [`FrameSource`] at a time, runs the acquisition loop on
//! a dedicated thread per stream generation, and reports every thread exit on
//! a channel so a supervisor can react to faults.
//!
//! Stopping is cooperative: the stop flag is checked at the top of each loop
//! iteration and the pacing sleep wakes early on stop. An in-flight read is
//! only cut short by sources that watch the flag themselves. `stop` waits up
//! to the backend's grace period for the thread to release its source; a
//! thread still busy after that is parked and `open` waits for it before
//! acquiring a new handle.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use shared::camera_interface::{
    Driver, DriverError, DriverResult, DriverState, ExitReason, Formats, FrameBuffer, TaskExit,
};
use shared::pacing::pacing_delay;
use shared::{Backend, CameraConfig, Frame};

/// How long `open` waits for a parked acquisition thread to release its
/// source before giving up.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// A kind of video source.
pub trait CaptureBackend: Send + Sync + 'static {
    fn kind(&self) -> Backend;

    /// Acquire a source handle configured for `config`.
    fn connect(&self, config: &CameraConfig) -> DriverResult<Box<dyn FrameSource>>;

    /// Enumerate supported formats for the device `config` points at.
    fn formats(&self, config: &CameraConfig) -> DriverResult<Formats>;

    /// Bounded wait in `stop` for the acquisition thread to finish.
    fn stop_grace(&self) -> Duration {
        Duration::from_millis(250)
    }
}

/// An open source handle. Dropping it releases the device or connection.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    ///
    /// `Ok(None)` means the source ended cleanly.
    fn next_frame(&mut self) -> DriverResult<Option<Frame>>;

    /// Whether the acquisition loop should sleep to the configured rate.
    /// Sources that block until the remote side delivers return false.
    fn paced(&self) -> bool {
        true
    }

    /// Called once before acquisition starts with the flag `stop` sets.
    /// Sources whose reads can block indefinitely poll it to return early.
    fn watch_stop(&mut self, _stop: Arc<AtomicBool>) {}
}

struct Worker {
    generation: u64,
    stop: Arc<AtomicBool>,
    /// Dropped on stop to cut the pacing sleep short
    wake: Option<Sender<()>>,
    /// Disconnects once the thread has dropped its source
    released: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn signal_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake.take();
    }

    fn wait_released(&self, timeout: Duration) -> bool {
        !matches!(
            self.released.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

struct Inner {
    config: CameraConfig,
    /// Opened but not yet streaming
    source: Option<Box<dyn FrameSource>>,
    worker: Option<Worker>,
    /// Stopped worker that overran the grace period
    lingering: Option<Worker>,
}

/// State visible to acquisition threads.
struct Shared {
    state: Mutex<DriverState>,
    generation: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DriverState) {
        *self.state() = state;
    }
}

/// [`Driver`] implementation shared by all backends.
pub struct CaptureDriver<B: CaptureBackend> {
    backend: B,
    buffer: Arc<FrameBuffer>,
    inner: Mutex<Inner>,
    shared: Arc<Shared>,
    exit_tx: Sender<TaskExit>,
    exit_rx: Receiver<TaskExit>,
}

impl<B: CaptureBackend> CaptureDriver<B> {
    /// Create a closed driver. `config` sizes the initial placeholder and is
    /// used for format queries until the first `open`.
    pub fn new(backend: B, config: CameraConfig) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Self {
            buffer: Arc::new(FrameBuffer::new(config.size())),
            backend,
            inner: Mutex::new(Inner {
                config,
                source: None,
                worker: None,
                lingering: None,
            }),
            shared: Arc::new(Shared {
                state: Mutex::new(DriverState::Closed),
                generation: AtomicU64::new(0),
            }),
            exit_tx,
            exit_rx,
        }
    }

    pub fn backend_impl(&self) -> &B {
        &self.backend
    }

    /// Latest-frame slot this driver publishes into.
    pub fn frame_buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap_lingering(&self, inner: &mut Inner) -> DriverResult<()> {
        if let Some(worker) = inner.lingering.take() {
            if !worker.wait_released(RELEASE_TIMEOUT) {
                let generation = worker.generation;
                inner.lingering = Some(worker);
                return Err(DriverError::Connection(format!(
                    "previous source (generation {generation}) has not been released"
                )));
            }
            let _ = worker.handle.join();
        }
        Ok(())
    }
}

impl<B: CaptureBackend> Driver for CaptureDriver<B> {
    fn backend(&self) -> Backend {
        self.backend.kind()
    }

    fn open(&self, config: &CameraConfig) -> DriverResult<()> {
        let mut inner = self.inner();
        if inner.source.is_some() || inner.worker.is_some() {
            return Err(DriverError::AlreadyOpen);
        }
        self.reap_lingering(&mut inner)?;

        self.shared.set_state(DriverState::Opening);
        inner.config = config.clone();
        self.buffer.show_placeholder(config.size());

        match self.backend.connect(config) {
            Ok(source) => {
                inner.source = Some(source);
                self.shared.set_state(DriverState::Ready);
                info!(
                    camera = %config.name,
                    backend = %self.backend.kind(),
                    "opened {} source at {}",
                    self.backend.kind(),
                    config.size()
                );
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(DriverState::Closed);
                warn!(camera = %config.name, "open failed: {e}");
                Err(e)
            }
        }
    }

    fn stream(&self) -> DriverResult<()> {
        let mut inner = self.inner();
        if inner.worker.is_some() {
            return Err(DriverError::AlreadyStreaming);
        }
        let mut source = inner.source.take().ok_or(DriverError::NotOpen)?;

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        source.watch_stop(stop.clone());
        let (wake_tx, wake_rx) = bounded::<()>(0);
        let (released_tx, released_rx) = bounded::<()>(1);

        let task = AcquisitionTask {
            generation,
            rate: inner.config.rate,
            buffer: self.buffer.clone(),
            stop: stop.clone(),
            wake: wake_rx,
            shared: self.shared.clone(),
            exits: self.exit_tx.clone(),
        };
        let camera = inner.config.name.clone();

        // Mark streaming before the thread can fault and flip it to Faulted
        self.shared.set_state(DriverState::Streaming);
        let spawned = thread::Builder::new()
            .name(format!("capture-{generation}"))
            .spawn(move || task.run(source, released_tx, camera));

        match spawned {
            Ok(handle) => {
                inner.worker = Some(Worker {
                    generation,
                    stop,
                    wake: Some(wake_tx),
                    released: released_rx,
                    handle,
                });
                debug!("acquisition generation {generation} started");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(DriverState::Closed);
                Err(DriverError::Io(e))
            }
        }
    }

    fn grab(&self) -> Frame {
        self.buffer.grab()
    }

    fn stop(&self) {
        let mut inner = self.inner();
        let size = inner.config.size();

        if inner.source.is_none() && inner.worker.is_none() {
            self.buffer.show_placeholder(size);
            self.shared.set_state(DriverState::Closed);
            return;
        }

        self.shared.set_state(DriverState::Stopping);
        inner.source.take();

        if let Some(mut worker) = inner.worker.take() {
            worker.signal_stop();
            // Flag is set first so a late publish cannot replace this
            self.buffer.show_placeholder(size);

            if worker.wait_released(self.backend.stop_grace()) {
                let _ = worker.handle.join();
            } else {
                warn!(
                    camera = %inner.config.name,
                    generation = worker.generation,
                    "acquisition still busy after {:?}, releasing in background",
                    self.backend.stop_grace()
                );
                inner.lingering = Some(worker);
            }
        } else {
            self.buffer.show_placeholder(size);
        }

        self.shared.set_state(DriverState::Closed);
        debug!(camera = %inner.config.name, "stopped");
    }

    fn list_formats_and_frame_sizes(&self) -> DriverResult<Formats> {
        let config = self.inner().config.clone();
        self.backend.formats(&config)
    }

    fn state(&self) -> DriverState {
        *self.shared.state()
    }

    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    fn exit_events(&self) -> Receiver<TaskExit> {
        self.exit_rx.clone()
    }
}

impl<B: CaptureBackend> Drop for CaptureDriver<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = inner.worker.as_mut() {
            worker.signal_stop();
        }
    }
}

/// Everything an acquisition thread owns besides its source.
struct AcquisitionTask {
    generation: u64,
    rate: f32,
    buffer: Arc<FrameBuffer>,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
    shared: Arc<Shared>,
    exits: Sender<TaskExit>,
}

impl AcquisitionTask {
    fn run(self, source: Box<dyn FrameSource>, released: Sender<()>, camera: String) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut source = source;
            self.acquire(source.as_mut())
        }));
        // Source is dropped by now, on both the normal and the unwind path
        drop(released);

        let reason = outcome.unwrap_or_else(|payload| ExitReason::Panicked(panic_message(&payload)));

        if reason.is_fault() {
            let mut state = self.shared.state();
            if self.shared.generation.load(Ordering::Acquire) == self.generation
                && *state == DriverState::Streaming
            {
                *state = DriverState::Faulted;
            }
            drop(state);
            warn!(%camera, generation = self.generation, "acquisition ended: {reason}");
        } else {
            debug!(%camera, generation = self.generation, "acquisition ended: {reason}");
        }

        let _ = self.exits.send(TaskExit {
            generation: self.generation,
            reason,
        });
    }

    fn acquire(&self, source: &mut dyn FrameSource) -> ExitReason {
        loop {
            let started = Instant::now();
            if self.stop.load(Ordering::Acquire) {
                return ExitReason::Stopped;
            }

            match source.next_frame() {
                Ok(Some(frame)) => {
                    self.buffer.publish_unless_stopped(frame, &self.stop);
                }
                Ok(None) => return ExitReason::SourceEnded,
                Err(e) => {
                    if self.stop.load(Ordering::Acquire) {
                        return ExitReason::Stopped;
                    }
                    return ExitReason::Failed(e.to_string());
                }
            }

            if source.paced() {
                let delay = pacing_delay(self.rate, started.elapsed());
                if !delay.is_zero() {
                    // Returns early with Disconnected once stop drops the sender
                    let _ = self.wake.recv_timeout(delay);
                }
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
