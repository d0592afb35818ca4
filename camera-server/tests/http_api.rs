//! End-to-end HTTP tests against a mock camera.

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use camera_server::camera_server::{create_router, AppState, RenderContext};
use camera_server::{ConfigManager, LifecycleController, LiveConfig, RecoveryPolicy};
use hardware::{CaptureDriver, MockBackend};
use serde_json::{json, Value};
use shared::camera_interface::Driver;
use shared::config_storage::ConfigStorage;
use shared::mjpeg::{MjpegReader, RESPONSE_CONTENT_TYPE};
use shared::position::{MetadataTags, NoPosition};
use shared::{validate_jpeg, Backend, CameraConfig};
use tempfile::TempDir;
use tokio::sync::watch;
use ureq::Agent;

const KEY: &str = "s3cret";

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    storage: ConfigStorage,
    _shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn camera() -> CameraConfig {
    CameraConfig {
        name: "front".into(),
        backend: Backend::Mock,
        width: 320,
        height: 240,
        rate: 30.0,
        api_key: KEY.into(),
        ..Default::default()
    }
}

async fn start_server(backend: MockBackend, config: CameraConfig, prefix: &str) -> TestServer {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().join("camera.json"));
    storage.save(&config).unwrap();

    let driver: Arc<dyn Driver> = Arc::new(CaptureDriver::new(backend, config.clone()));
    let live = Arc::new(LiveConfig::new(config));
    let lifecycle =
        LifecycleController::spawn(driver.clone(), live.clone(), RecoveryPolicy::default())
            .unwrap();
    let starter = lifecycle.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .unwrap()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        live: live.clone(),
        driver,
        lifecycle: lifecycle.clone(),
        config: ConfigManager::new(live, lifecycle, storage.clone()),
        render: Arc::new(RenderContext {
            position: Arc::new(NoPosition),
            tags: MetadataTags::default(),
            jpeg_quality: 60,
        }),
        shutdown: shutdown_rx,
    });

    let app = create_router(state.clone(), prefix);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        storage,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

fn agent() -> Agent {
    Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into()
}

async fn get(url: String, key: Option<&'static str>) -> (u16, String) {
    tokio::task::spawn_blocking(move || {
        let mut request = agent().get(&url);
        if let Some(key) = key {
            request = request.header("X-Api-Key", key);
        }
        let mut response = request.call().unwrap();
        let status = response.status().as_u16();
        (status, response.body_mut().read_to_string().unwrap())
    })
    .await
    .unwrap()
}

async fn post(url: String, body: String) -> (u16, String) {
    tokio::task::spawn_blocking(move || {
        let mut response = agent()
            .post(&url)
            .header("X-Api-Key", KEY)
            .header("Content-Type", "application/json")
            .send(body.as_str())
            .unwrap();
        let status = response.status().as_u16();
        (status, response.body_mut().read_to_string().unwrap())
    })
    .await
    .unwrap()
}

fn error_code(body: &str) -> String {
    let value: Value = serde_json::from_str(body).unwrap();
    value["error_code"].as_str().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requests_need_matching_key() {
    let server = start_server(MockBackend::new(), camera(), "/").await;

    let (status, body) = get(server.url("/v1/config"), None).await;
    assert_eq!(status, 403);
    assert_eq!(error_code(&body), "FORBIDDEN");

    let (status, _) = get(server.url("/v1/config"), Some("wrong")).await;
    assert_eq!(status, 403);

    let (status, _) = get(server.url(&format!("/v1/config?key={KEY}")), None).await;
    assert_eq!(status, 200);

    let (status, _) = get(server.url("/v1/config"), Some(KEY)).await;
    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_configured_key_rejects_everything() {
    let config = CameraConfig {
        api_key: String::new(),
        ..camera()
    };
    let server = start_server(MockBackend::new(), config, "/").await;

    let (status, _) = get(server.url("/v1/config?key="), None).await;
    assert_eq!(status, 403);
    let (status, _) = get(server.url("/v1/command?command=stop"), Some("")).await;
    assert_eq!(status, 403);
    assert_eq!(
        server.state.driver.state(),
        shared::camera_interface::DriverState::Streaming
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_delivers_multipart_jpegs() {
    let server = start_server(MockBackend::new(), camera(), "/").await;
    let url = server.url(&format!("/v1/stream?key={KEY}"));

    let (content_type, connection, payloads) = tokio::task::spawn_blocking(move || {
        let response = agent().get(&url).call().unwrap();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let content_type = header("content-type");
        let connection = header("connection");

        let mut reader = MjpegReader::new(BufReader::new(response.into_body().into_reader()));
        let payloads: Vec<_> = (0..3).map(|_| reader.read_part().unwrap()).collect();
        (content_type, connection, payloads)
    })
    .await
    .unwrap();

    assert_eq!(content_type, RESPONSE_CONTENT_TYPE);
    assert_eq!(connection.to_ascii_lowercase(), "close");
    for jpeg in payloads {
        assert!(validate_jpeg(&jpeg));
        let image = shared::frame::decode_jpeg(&jpeg).unwrap();
        assert_eq!(image.dimensions(), (320, 240));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_other_transports_not_implemented() {
    let server = start_server(MockBackend::new(), camera(), "/").await;

    for format in ["h264", "wav"] {
        let (status, body) = get(
            server.url(&format!("/v1/stream?format={format}")),
            Some(KEY),
        )
        .await;
        assert_eq!(status, 501);
        assert_eq!(error_code(&body), "NOT_IMPLEMENTED");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_applies_and_persists() {
    let server = start_server(MockBackend::new(), camera(), "/").await;
    let generation = server.state.driver.generation();

    let (status, body) = post(
        server.url("/v1/config"),
        json!({"Name": "porch", "Width": 160, "Height": 120, "Motion": {"Enabled": true}})
            .to_string(),
    )
    .await;
    assert_eq!(status, 200, "{body}");

    let applied: CameraConfig = serde_json::from_str(&body).unwrap();
    assert_eq!(applied.name, "porch");
    assert_eq!((applied.width, applied.height), (160, 120));
    assert!(applied.motion.enabled);
    assert_eq!(applied.api_key, KEY);

    assert_eq!(server.state.live.snapshot(), applied);
    assert_eq!(server.storage.load().unwrap(), applied);
    assert!(server.state.driver.generation() > generation);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_reload_restores_previous_config() {
    let server = start_server(MockBackend::new().max_width(640), camera(), "/").await;
    let before = server.state.live.snapshot();
    let file_before = std::fs::read(server.storage.path()).unwrap();

    let (status, body) = post(
        server.url("/v1/config"),
        json!({"Width": 1920, "Height": 1080, "Name": "too-big"}).to_string(),
    )
    .await;
    assert_eq!(status, 500);
    assert_eq!(error_code(&body), "RESET_FAILED");

    let (status, body) = get(server.url("/v1/config"), Some(KEY)).await;
    assert_eq!(status, 200);
    let after: CameraConfig = serde_json::from_str(&body).unwrap();
    assert_eq!(after, before);
    assert_eq!(std::fs::read(server.storage.path()).unwrap(), file_before);
    assert_eq!(
        server.state.driver.state(),
        shared::camera_interface::DriverState::Streaming
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_reload_changes_nothing() {
    let server = start_server(MockBackend::new(), camera(), "/").await;
    let generation = server.state.driver.generation();

    let (status, body) = post(server.url("/v1/config"), json!({"Rate": 0}).to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(error_code(&body), "INVALID_CONFIG");

    let (status, _) = post(
        server.url("/v1/config"),
        json!({"Plugin": "axis241q", "Addr": "10.0.0.9"}).to_string(),
    )
    .await;
    assert_eq!(status, 400);

    let (status, body) = post(server.url("/v1/config"), "{not json".to_string()).await;
    assert_eq!(status, 400);
    assert_eq!(error_code(&body), "BAD_REQUEST");

    assert_eq!(server.state.live.snapshot(), camera());
    assert_eq!(server.state.driver.generation(), generation);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commands_drive_the_camera() {
    let server = start_server(MockBackend::new(), camera(), "/").await;

    let (status, body) = get(server.url("/v1/command?command=stop"), Some(KEY)).await;
    assert_eq!(status, 200);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["state"], "closed");
    assert_eq!(value["recovery"], "disarmed");

    let (status, body) = get(server.url("/v1/command?command=start"), Some(KEY)).await;
    assert_eq!(status, 200);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["state"], "streaming");
    assert_eq!(value["recovery"], "armed");

    let (status, body) = get(server.url("/v1/command?command=start"), Some(KEY)).await;
    assert_eq!(status, 409);
    assert_eq!(error_code(&body), "ALREADY_STREAMING");

    let (status, _) = get(server.url("/v1/command?command=reset"), Some(KEY)).await;
    assert_eq!(status, 200);

    let (status, _) = get(server.url("/v1/command?command=reboot"), Some(KEY)).await;
    assert_eq!(status, 400);
    let (status, _) = get(server.url("/v1/command"), Some(KEY)).await;
    assert_eq!(status, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_formats_lists_sizes_and_restarts() {
    let server = start_server(MockBackend::new().max_width(640), camera(), "/").await;
    let generation = server.state.driver.generation();

    let (status, body) = get(server.url("/v1/formats"), Some(KEY)).await;
    assert_eq!(status, 200);
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value, json!({"RGB3": ["320x240", "640x480"]}));

    assert_eq!(
        server.state.driver.state(),
        shared::camera_interface::DriverState::Streaming
    );
    assert!(server.state.driver.generation() > generation);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_routes_mount_under_prefix() {
    let server = start_server(MockBackend::new(), camera(), "/cams/front/").await;

    let (status, _) = get(server.url("/cams/front/v1/config"), Some(KEY)).await;
    assert_eq!(status, 200);
    let (status, _) = get(server.url("/v1/config"), Some(KEY)).await;
    assert_eq!(status, 404);
}
