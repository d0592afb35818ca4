//! HTTP surface for camhub.
//!
//! All routes sit behind [`auth::require_api_key`]. Driver control and
//! format queries block, so they run on the blocking pool; streaming runs
//! one async loop per viewer (see [`stream`]).

pub mod auth;
pub mod error;
pub mod stream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use shared::camera_interface::{Driver, Formats};
use shared::config_storage::ConfigStorage;
use shared::position::{FixedPosition, MetadataTags, NoPosition, PositionFix, PositionSource};
use shared::CameraConfig;

use crate::lifecycle::{LifecycleController, LifecycleError, LifecycleStatus, RecoveryPolicy};
use crate::live_config::LiveConfig;
use crate::reload::ConfigManager;

pub use error::ApiError;
pub use stream::RenderContext;

/// Listener and encoding options shared by every camhub server binary.
#[derive(Args, Debug, Clone)]
pub struct CommonServerArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Mount all routes under this prefix
    #[arg(long, env = "PATH_PREFIX", default_value = "/")]
    pub path_prefix: String,

    /// JPEG quality for streamed frames (1-100)
    #[arg(long, default_value = "50", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,
}

#[derive(Args, Debug, Clone)]
pub struct RecoveryArgs {
    /// Consecutive failed resets before automatic recovery gives up
    #[arg(long, default_value = "5")]
    pub max_recovery_attempts: u32,

    /// Backoff before the first recovery attempt, in milliseconds
    #[arg(long, default_value = "500")]
    pub recovery_backoff_ms: u64,

    /// Upper bound on recovery backoff, in milliseconds
    #[arg(long, default_value = "30000")]
    pub recovery_backoff_max_ms: u64,
}

impl RecoveryArgs {
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: self.max_recovery_attempts,
            initial_backoff: Duration::from_millis(self.recovery_backoff_ms),
            max_backoff: Duration::from_millis(self.recovery_backoff_max_ms),
            ..RecoveryPolicy::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub common: CommonServerArgs,

    #[command(flatten)]
    pub recovery: RecoveryArgs,

    /// Camera configuration file, rewritten on every successful reload
    #[arg(long, env = "CAMERA_CONFIG", default_value = "./camera.json")]
    pub config: PathBuf,

    /// Fixed latitude embedded into frames with motion
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    pub latitude: Option<f64>,

    /// Fixed longitude embedded into frames with motion
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    pub longitude: Option<f64>,
}

impl ServerArgs {
    pub fn position_source(&self) -> Arc<dyn PositionSource> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Arc::new(FixedPosition(PositionFix::new(lat, lon))),
            _ => Arc::new(NoPosition),
        }
    }
}

/// State shared by every handler.
pub struct AppState {
    pub live: Arc<LiveConfig>,
    pub driver: Arc<dyn Driver>,
    pub lifecycle: Arc<LifecycleController>,
    pub config: ConfigManager,
    pub render: Arc<RenderContext>,
    /// Flips to `true` when the server starts shutting down
    pub shutdown: watch::Receiver<bool>,
}

/// Build the router, mounted under `path_prefix` unless it is `/`.
pub fn create_router(state: Arc<AppState>, path_prefix: &str) -> Router {
    let api = Router::new()
        .route("/v1/stream", get(stream::stream_handler))
        .route("/v1/config", get(get_config).post(post_config))
        .route("/v1/formats", get(get_formats))
        .route("/v1/command", get(run_command))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state);

    let prefix = normalize_prefix(path_prefix);
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&prefix, api)
    }
}

/// `"/"`, `""` and `"//"` become `""`; others gain a leading and lose a trailing slash.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<CameraConfig> {
    Json(state.live.snapshot())
}

async fn post_config(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CameraConfig>, ApiError> {
    let patch: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    let applied = state.config.reload(patch).await?;
    Ok(Json(applied))
}

async fn get_formats(State(state): State<Arc<AppState>>) -> Result<Json<Formats>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let formats = tokio::task::spawn_blocking(move || lifecycle.list_formats())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(formats))
}

#[derive(Debug, Deserialize)]
struct CommandQuery {
    command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Reset,
}

impl std::str::FromStr for Command {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "reset" => Ok(Command::Reset),
            other => Err(ApiError::BadRequest(format!(
                "unknown command {other:?}, expected start, stop or reset"
            ))),
        }
    }
}

async fn run_command(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommandQuery>,
) -> Result<Json<LifecycleStatus>, ApiError> {
    let command: Command = query
        .command
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing command parameter".into()))?
        .parse()?;
    info!(?command, "driver command");

    let lifecycle = state.lifecycle.clone();
    let live = state.live.clone();
    let status = tokio::task::spawn_blocking(move || -> Result<_, LifecycleError> {
        match command {
            Command::Start => lifecycle.start()?,
            Command::Stop => lifecycle.stop(),
            Command::Reset => lifecycle.reset(&live.snapshot())?,
        }
        Ok(lifecycle.status())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(status))
}

fn metadata_tags(config: &CameraConfig) -> MetadataTags {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::fs::read_to_string("/etc/hostname").map(|h| h.trim().to_string()))
        .unwrap_or_default();
    MetadataTags {
        make: "camhub".into(),
        model: config.backend.to_string(),
        host,
    }
}

/// Load the camera configuration, start the driver, and serve until Ctrl-C.
pub async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let storage = ConfigStorage::with_path(&args.config);
    if !storage.exists() {
        warn!(
            path = %storage.path().display(),
            "no camera configuration found, starting with defaults"
        );
    }
    let config = storage
        .load_or_default()
        .context("failed to load camera configuration")?;
    config
        .validate()
        .context("camera configuration is invalid")?;
    if config.api_key.is_empty() {
        warn!("ApiKey is empty, every request will be rejected");
    }

    let driver = hardware::create_driver(&config).context("failed to create camera driver")?;
    let live = Arc::new(LiveConfig::new(config.clone()));
    let lifecycle = LifecycleController::spawn(driver.clone(), live.clone(), args.recovery.policy())
        .context("failed to start lifecycle supervisor")?;

    if config.enabled {
        let starter = lifecycle.clone();
        match tokio::task::spawn_blocking(move || starter.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(camera = %config.name, "camera failed to start: {e}"),
            Err(e) => error!("camera start task failed: {e}"),
        }
    } else {
        info!(camera = %config.name, "camera disabled, waiting for a start command");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        live: live.clone(),
        driver,
        lifecycle: lifecycle.clone(),
        config: ConfigManager::new(live, lifecycle.clone(), storage),
        render: Arc::new(RenderContext {
            position: args.position_source(),
            tags: metadata_tags(&config),
            jpeg_quality: args.common.jpeg_quality,
        }),
        shutdown: shutdown_rx,
    });

    let app = create_router(state, &args.common.path_prefix);
    let listener = tokio::net::TcpListener::bind(args.common.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.common.listen))?;
    info!(
        "camhub listening on http://{}{}",
        args.common.listen,
        normalize_prefix(&args.common.path_prefix)
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || lifecycle.shutdown())
        .await
        .context("lifecycle shutdown task failed")?;
    Ok(())
}
