//! Transactional configuration reload.
//!
//! A reload merges a partial payload over the live configuration, validates
//! it, installs it, and resets the driver. If the reset fails, the previous
//! configuration is reinstalled and the driver reset again with it before
//! the error is returned. The file on disk is rewritten only after a
//! successful reset, and a failed write rolls back the same way. A caller
//! that goes away mid-reload does not cut the transaction short.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use shared::config_storage::{ConfigStorage, ConfigStorageError};
use shared::CameraConfig;

use crate::lifecycle::{LifecycleController, LifecycleError};
use crate::live_config::LiveConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Nothing was applied
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("camera reset failed, previous configuration restored: {0}")]
    ResetFailed(#[source] LifecycleError),

    #[error("failed to save configuration, previous configuration restored: {0}")]
    Persist(#[source] ConfigStorageError),
}

pub struct ConfigManager {
    inner: Arc<Transaction>,
}

struct Transaction {
    live: Arc<LiveConfig>,
    lifecycle: Arc<LifecycleController>,
    storage: ConfigStorage,
    /// Reloads never interleave
    reload: Mutex<()>,
}

impl ConfigManager {
    pub fn new(
        live: Arc<LiveConfig>,
        lifecycle: Arc<LifecycleController>,
        storage: ConfigStorage,
    ) -> Self {
        Self {
            inner: Arc::new(Transaction {
                live,
                lifecycle,
                storage,
                reload: Mutex::new(()),
            }),
        }
    }

    /// Apply `patch` and return the configuration now in effect.
    ///
    /// The transaction runs on its own task: dropping the returned future
    /// abandons the result but never the rollback.
    pub async fn reload(&self, patch: Value) -> Result<CameraConfig, ConfigError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.apply(patch).await })
            .await
            .unwrap_or_else(|e| Err(ConfigError::ResetFailed(LifecycleError::Task(e.to_string()))))
    }
}

impl Transaction {
    async fn apply(&self, patch: Value) -> Result<CameraConfig, ConfigError> {
        let _reload = self.reload.lock().await;

        let backup = self.live.snapshot();
        let candidate = prepare(&backup, &patch)?;

        self.live.replace(candidate.clone());
        if let Err(e) = self.reset_with(candidate.clone()).await {
            warn!(camera = %candidate.name, "reload failed, rolling back: {e}");
            self.roll_back(backup).await;
            return Err(ConfigError::ResetFailed(e));
        }

        let storage = self.storage.clone();
        let to_save = candidate.clone();
        let saved = tokio::task::spawn_blocking(move || storage.save(&to_save))
            .await
            .unwrap_or_else(|e| {
                Err(ConfigStorageError::Io {
                    path: self.storage.path().to_path_buf(),
                    source: std::io::Error::other(e.to_string()),
                })
            });
        if let Err(e) = saved {
            error!(path = %self.storage.path().display(), "failed to save configuration: {e}");
            self.roll_back(backup).await;
            return Err(ConfigError::Persist(e));
        }

        info!(camera = %candidate.name, "configuration reloaded");
        Ok(candidate)
    }

    async fn reset_with(&self, config: CameraConfig) -> Result<(), LifecycleError> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.reset(&config))
            .await
            .unwrap_or_else(|e| Err(LifecycleError::Task(e.to_string())))
    }

    async fn roll_back(&self, backup: CameraConfig) {
        self.live.replace(backup.clone());
        if let Err(e) = self.reset_with(backup).await {
            error!("camera did not come back with the previous configuration: {e}");
        }
    }
}

/// Merge and validate without touching anything live.
fn prepare(current: &CameraConfig, patch: &Value) -> Result<CameraConfig, ConfigError> {
    if !patch.is_object() {
        return Err(ConfigError::Invalid(
            "configuration payload must be a JSON object".into(),
        ));
    }
    let candidate = current
        .merged_with(patch)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    candidate
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    if candidate.backend != current.backend {
        return Err(ConfigError::Invalid(format!(
            "backend cannot change at runtime ({} -> {})",
            current.backend, candidate.backend
        )));
    }
    Ok(candidate)
}
