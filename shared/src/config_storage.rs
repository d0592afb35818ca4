//! Durable storage for the camera configuration.
//!
//! One [`CameraConfig`] per file, written as pretty JSON. Saves go to a
//! sibling temp file that is renamed into place, so a crash mid-write leaves
//! the previous file intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::camera_config::CameraConfig;

#[derive(Error, Debug)]
pub enum ConfigStorageError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration file manager.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the stored configuration.
    pub fn load(&self) -> Result<CameraConfig, ConfigStorageError> {
        if !self.path.exists() {
            return Err(ConfigStorageError::NotFound(self.path.clone()));
        }
        let text = fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
        serde_json::from_str(&text).map_err(|source| ConfigStorageError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the stored configuration, or defaults when no file exists yet.
    pub fn load_or_default(&self) -> Result<CameraConfig, ConfigStorageError> {
        match self.load() {
            Err(ConfigStorageError::NotFound(_)) => Ok(CameraConfig::default()),
            other => other,
        }
    }

    /// Atomically replace the stored configuration.
    pub fn save(&self, config: &CameraConfig) -> Result<(), ConfigStorageError> {
        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigStorageError::Json {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| self.io_error(source))?;
        }

        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        if let Err(source) = write() {
            fs::remove_file(&tmp).ok();
            return Err(self.io_error(source));
        }

        debug!("saved camera config to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "camera.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> ConfigStorageError {
        ConfigStorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
