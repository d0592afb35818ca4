//! Latest-frame slot shared between an acquisition task and its readers.
//!
//! A single [`Frame`] behind one mutex. The producer replaces it, readers
//! clone it out. Frames are reference counted internally so both operations
//! hold the lock only for a pointer swap or copy, never for encoding or I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::Frame;
use crate::image_size::ImageSize;

#[derive(Debug)]
pub struct FrameBuffer {
    slot: Mutex<Frame>,
    /// Real frames published since construction
    published: AtomicU64,
}

impl FrameBuffer {
    /// Create a buffer holding a placeholder of `size`.
    pub fn new(size: ImageSize) -> Self {
        Self {
            slot: Mutex::new(Frame::placeholder(size)),
            published: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Frame> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the held frame.
    pub fn publish(&self, frame: Frame) {
        *self.lock() = frame;
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the held frame unless `stop` is set.
    ///
    /// The flag is read under the slot lock. A stop that sets the flag before
    /// installing its placeholder therefore can never be overwritten by a
    /// late frame from the task it is stopping.
    pub fn publish_unless_stopped(&self, frame: Frame, stop: &AtomicBool) -> bool {
        let mut slot = self.lock();
        if stop.load(Ordering::Acquire) {
            return false;
        }
        *slot = frame;
        drop(slot);
        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy of the held frame.
    pub fn grab(&self) -> Frame {
        self.lock().clone()
    }

    /// Show a placeholder of `size` until the next publish.
    pub fn show_placeholder(&self, size: ImageSize) {
        let placeholder = Frame::placeholder(size);
        *self.lock() = placeholder;
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
