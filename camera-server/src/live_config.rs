//! The live camera configuration.
//!
//! Readers take a snapshot under the same lock the reload transaction
//! writes through, so a reader sees either the old or the new configuration
//! and never a mix.

use std::sync::{PoisonError, RwLock};

use shared::CameraConfig;

#[derive(Debug)]
pub struct LiveConfig {
    inner: RwLock<CameraConfig>,
}

impl LiveConfig {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> CameraConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read one or more fields without cloning the whole configuration.
    pub fn read<R>(&self, f: impl FnOnce(&CameraConfig) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `config`, returning the one it replaced.
    pub fn replace(&self, config: CameraConfig) -> CameraConfig {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, config)
    }
}
