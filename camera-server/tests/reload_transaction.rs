//! Reload transaction rollback paths.

use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_server::{ConfigError, ConfigManager, LifecycleController, LiveConfig, RecoveryPolicy};
use hardware::{CaptureDriver, MockBackend};
use serde_json::json;
use shared::camera_interface::{Driver, DriverState};
use shared::config_storage::ConfigStorage;
use shared::{Backend, CameraConfig};
use tempfile::TempDir;

fn camera() -> CameraConfig {
    CameraConfig {
        name: "yard".into(),
        backend: Backend::Mock,
        width: 160,
        height: 120,
        rate: 50.0,
        ..Default::default()
    }
}

async fn manager(
    backend: MockBackend,
    storage: ConfigStorage,
) -> (ConfigManager, Arc<LiveConfig>, Arc<dyn Driver>) {
    let driver: Arc<dyn Driver> = Arc::new(CaptureDriver::new(backend, camera()));
    let live = Arc::new(LiveConfig::new(camera()));
    let lifecycle =
        LifecycleController::spawn(driver.clone(), live.clone(), RecoveryPolicy::default())
            .unwrap();
    let starter = lifecycle.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .unwrap()
        .unwrap();
    (ConfigManager::new(live.clone(), lifecycle, storage), live, driver)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persist_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    // Parent "directory" is a regular file, so the save cannot succeed
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let storage = ConfigStorage::with_path(blocker.join("camera.json"));

    let (manager, live, driver) = manager(MockBackend::new(), storage).await;
    let err = manager
        .reload(json!({"Name": "renamed", "Width": 320, "Height": 240}))
        .await
        .unwrap_err();

    assert!(matches!(err, ConfigError::Persist(_)));
    assert_eq!(live.snapshot(), camera());
    assert_eq!(driver.state(), DriverState::Streaming);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_failure_rolls_back_and_keeps_file() {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().join("camera.json"));
    storage.save(&camera()).unwrap();
    let on_disk = std::fs::read_to_string(storage.path()).unwrap();

    let backend = MockBackend::new().max_width(320);
    let (manager, live, driver) = manager(backend.clone(), storage.clone()).await;
    let err = manager
        .reload(json!({"Width": 640, "Height": 480}))
        .await
        .unwrap_err();

    assert!(matches!(err, ConfigError::ResetFailed(_)));
    assert_eq!(live.snapshot(), camera());
    assert_eq!(std::fs::read_to_string(storage.path()).unwrap(), on_disk);
    assert_eq!(driver.state(), DriverState::Streaming);
    // Initial start plus the rollback reopen
    assert_eq!(backend.open_count(), 2);
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abandoned_failing_reload_still_rolls_back() {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().join("camera.json"));
    let backend = MockBackend::new().max_width(320);
    let (manager, live, driver) = manager(backend.clone(), storage).await;

    // Caller gives up while the reset is still in flight
    let _ = tokio::time::timeout(Duration::ZERO, manager.reload(json!({"Width": 640}))).await;

    wait_until("rollback reopen", || backend.open_count() == 2).await;
    wait_until("previous config live", || live.snapshot() == camera()).await;
    wait_until("streaming again", || driver.state() == DriverState::Streaming).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abandoned_reload_still_commits() {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().join("camera.json"));
    let (manager, live, _driver) = manager(MockBackend::new(), storage.clone()).await;

    let _ = tokio::time::timeout(
        Duration::ZERO,
        manager.reload(json!({"Width": 320, "Height": 240})),
    )
    .await;

    wait_until("config saved", || {
        storage.load().map(|c| c.width == 320).unwrap_or(false)
    })
    .await;
    assert_eq!(live.snapshot().width, 320);
    assert_eq!(live.snapshot().height, 240);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_reloads_do_not_interleave() {
    let dir = TempDir::new().unwrap();
    let storage = ConfigStorage::with_path(dir.path().join("camera.json"));
    let (manager, live, _driver) = manager(MockBackend::new(), storage.clone()).await;
    let manager = Arc::new(manager);

    let tasks: Vec<_> = (0..4u32)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .reload(json!({"Name": format!("cam-{i}"), "Width": 100 + i}))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Whichever reload ran last owns both the live copy and the file
    let final_config = live.snapshot();
    assert_eq!(storage.load().unwrap(), final_config);
    let index = final_config.name.trim_start_matches("cam-").parse::<u32>().unwrap();
    assert_eq!(final_config.width, 100 + index);
}
