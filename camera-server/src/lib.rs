//! camhub camera aggregation server.
//!
//! - [`lifecycle`] supervises one driver and recovers it after faults
//! - [`live_config`] holds the configuration every component reads
//! - [`reload`] applies configuration changes transactionally
//! - [`camera_server`] is the HTTP surface and per-viewer streaming loop

pub mod camera_server;
pub mod lifecycle;
pub mod live_config;
pub mod reload;

pub use lifecycle::{LifecycleController, LifecycleError, RecoveryPolicy};
pub use live_config::LiveConfig;
pub use reload::{ConfigError, ConfigManager};
