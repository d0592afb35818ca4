//! Driver supervision and fault recovery.
//!
//! [`LifecycleController`] owns the control path into a [`Driver`]: explicit
//! start/stop/reset commands, format listing, and the automatic Reset that
//! follows an acquisition fault. A supervisor thread listens on the driver's
//! exit channel. Faults from the current generation trigger Reset with
//! exponential backoff until [`RecoveryPolicy::max_attempts`] consecutive
//! attempts have failed, after which recovery stays `exhausted` until an
//! explicit command succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use shared::camera_interface::{Driver, DriverError, DriverState, Formats, TaskExit};
use shared::CameraConfig;

use crate::live_config::LiveConfig;

/// Exit channel poll interval; bounds how long shutdown waits on the supervisor.
const SUPERVISOR_POLL: Duration = Duration::from_millis(100);

/// Granularity of backoff sleeps so stop and shutdown cut them short.
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("camera is already streaming")]
    AlreadyStreaming,

    #[error("controller is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("driver task failed: {0}")]
    Task(String),
}

/// Bounds on automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Consecutive failed Reset attempts before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A fault this long after the last recovery starts a fresh count
    pub stable_after: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RecoveryPolicy {
    /// Delay before attempt `attempt` (zero based): `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Where automatic recovery stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    /// Armed; a fault triggers Reset
    Armed,
    /// Backing off or resetting after a fault
    Recovering,
    /// Gave up after the attempt limit
    Exhausted,
    /// Explicitly stopped; faults are ignored
    Disarmed,
}

/// Snapshot returned by the command endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub state: DriverState,
    pub recovery: RecoveryState,
    pub generation: u64,
    /// Consecutive failed recovery attempts
    pub attempts: u32,
    /// Successful automatic recoveries since startup
    pub recoveries: u64,
}

#[derive(Debug)]
struct Tracker {
    recovery: RecoveryState,
    consecutive: u32,
    last_recovery: Option<Instant>,
    recoveries: u64,
}

impl Tracker {
    fn armed(&mut self) {
        self.recovery = RecoveryState::Armed;
        self.consecutive = 0;
    }
}

pub struct LifecycleController {
    driver: Arc<dyn Driver>,
    live: Arc<LiveConfig>,
    policy: RecoveryPolicy,
    /// Serialises every operation that changes driver state
    control: Mutex<()>,
    tracker: Mutex<Tracker>,
    shutdown: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    /// Wrap `driver` and start the supervisor thread. The driver is not
    /// started; call [`start`](Self::start) or [`reset`](Self::reset).
    pub fn spawn(
        driver: Arc<dyn Driver>,
        live: Arc<LiveConfig>,
        policy: RecoveryPolicy,
    ) -> std::io::Result<Arc<Self>> {
        let exits = driver.exit_events();
        let controller = Arc::new(Self {
            driver,
            live,
            policy,
            control: Mutex::new(()),
            tracker: Mutex::new(Tracker {
                recovery: RecoveryState::Armed,
                consecutive: 0,
                last_recovery: None,
                recoveries: 0,
            }),
            shutdown: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&controller);
        let handle = thread::Builder::new()
            .name("camhub-supervisor".into())
            .spawn(move || supervise(weak, exits))?;
        *controller
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(controller)
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> Result<(), LifecycleError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(LifecycleError::ShuttingDown);
        }
        Ok(())
    }

    /// Start streaming with the live configuration.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.check_running()?;
        let _control = self.control();
        if self.driver.state() == DriverState::Streaming {
            return Err(LifecycleError::AlreadyStreaming);
        }
        let config = self.live.snapshot();
        self.driver.reset(&config)?;
        self.tracker().armed();
        info!(camera = %config.name, generation = self.driver.generation(), "camera started");
        Ok(())
    }

    /// Stop streaming and disarm recovery until the next start or reset.
    pub fn stop(&self) {
        self.tracker().recovery = RecoveryState::Disarmed;
        let _control = self.control();
        self.driver.stop();
        info!("camera stopped");
    }

    /// Stop, reopen with `config`, and stream. Re-arms recovery on success.
    pub fn reset(&self, config: &CameraConfig) -> Result<(), LifecycleError> {
        self.check_running()?;
        let _control = self.control();
        self.driver.reset(config)?;
        self.tracker().armed();
        info!(camera = %config.name, generation = self.driver.generation(), "camera reset");
        Ok(())
    }

    /// Stop the driver, query its capabilities, and restart it if it was
    /// running or faulted.
    pub fn list_formats(&self) -> Result<Formats, LifecycleError> {
        self.check_running()?;
        let _control = self.control();
        let restart = matches!(
            self.driver.state(),
            DriverState::Streaming | DriverState::Faulted
        );

        self.driver.stop();
        let formats = self.driver.list_formats_and_frame_sizes();

        if restart {
            let config = self.live.snapshot();
            match self.driver.reset(&config) {
                Ok(()) => self.tracker().armed(),
                Err(e) => warn!("failed to restart camera after listing formats: {e}"),
            }
        }
        Ok(formats?)
    }

    pub fn status(&self) -> LifecycleStatus {
        let tracker = self.tracker();
        LifecycleStatus {
            state: self.driver.state(),
            recovery: tracker.recovery,
            generation: self.driver.generation(),
            attempts: tracker.consecutive,
            recoveries: tracker.recoveries,
        }
    }

    /// Stop the driver and join the supervisor. Later commands fail with
    /// [`LifecycleError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker().recovery = RecoveryState::Disarmed;
        {
            let _control = self.control();
            self.driver.stop();
        }

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("supervisor thread panicked");
            }
        }
        info!("lifecycle controller shut down");
    }

    fn recovery_allowed(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && self.tracker().recovery != RecoveryState::Disarmed
    }

    /// Sleep for `delay` unless recovery is cancelled first.
    fn backoff_sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if !self.recovery_allowed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(BACKOFF_SLICE.min(deadline - now));
        }
    }

    fn handle_exit(&self, exit: TaskExit) {
        if !exit.reason.is_fault() {
            debug!(generation = exit.generation, "acquisition task stopped");
            return;
        }
        if exit.generation != self.driver.generation() {
            debug!(generation = exit.generation, "ignoring exit from stale generation");
            return;
        }

        {
            let mut tracker = self.tracker();
            match tracker.recovery {
                RecoveryState::Disarmed | RecoveryState::Exhausted => {
                    warn!(
                        generation = exit.generation,
                        "acquisition fault ({}) with recovery {:?}",
                        exit.reason,
                        tracker.recovery
                    );
                    return;
                }
                RecoveryState::Armed | RecoveryState::Recovering => {}
            }
            let stable = tracker
                .last_recovery
                .map_or(true, |at| at.elapsed() >= self.policy.stable_after);
            if stable {
                tracker.consecutive = 0;
            }
            tracker.recovery = RecoveryState::Recovering;
        }
        warn!(generation = exit.generation, "acquisition fault: {}", exit.reason);

        let faulted_generation = exit.generation;
        loop {
            let attempt = {
                let tracker = self.tracker();
                if tracker.consecutive >= self.policy.max_attempts {
                    break;
                }
                tracker.consecutive
            };

            let delay = self.policy.backoff(attempt);
            debug!(attempt = attempt + 1, ?delay, "backing off before reset");
            if !self.backoff_sleep(delay) {
                debug!("recovery cancelled");
                return;
            }

            let _control = self.control();
            if !self.recovery_allowed() {
                return;
            }
            // Someone else reset or started the driver while we slept
            if self.driver.generation() != faulted_generation
                && self.driver.state() == DriverState::Streaming
            {
                debug!("driver restarted elsewhere, abandoning recovery");
                return;
            }

            self.tracker().consecutive = attempt + 1;
            let config = self.live.snapshot();
            match self.driver.reset(&config) {
                Ok(()) => {
                    let mut tracker = self.tracker();
                    if tracker.recovery == RecoveryState::Recovering {
                        tracker.recovery = RecoveryState::Armed;
                    }
                    tracker.last_recovery = Some(Instant::now());
                    tracker.recoveries += 1;
                    info!(
                        camera = %config.name,
                        attempt = attempt + 1,
                        generation = self.driver.generation(),
                        "camera recovered"
                    );
                    return;
                }
                Err(e) => {
                    warn!(camera = %config.name, attempt = attempt + 1, "recovery reset failed: {e}");
                }
            }
        }

        let mut tracker = self.tracker();
        tracker.recovery = RecoveryState::Exhausted;
        error!(
            attempts = tracker.consecutive,
            "recovery exhausted, camera left stopped until an explicit start or reset"
        );
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn supervise(controller: Weak<LifecycleController>, exits: Receiver<TaskExit>) {
    loop {
        match exits.recv_timeout(SUPERVISOR_POLL) {
            Ok(exit) => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if controller.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                controller.handle_exit(exit);
            }
            Err(RecvTimeoutError::Timeout) => match controller.upgrade() {
                Some(controller) if !controller.shutdown.load(Ordering::SeqCst) => {}
                _ => break,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("supervisor exiting");
}
