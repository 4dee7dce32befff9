//! Layered configuration loading.

use std::env;
use std::fs;
use std::time::Duration;

use camera_session::mock::MockCamera;
use camera_session::{FrameSize, Session, SessionConfig, SessionError};
use serial_test::serial;
use tempfile::TempDir;

const BUFFER_COUNT_VAR: &str = "CAMERA_SESSION_BUFFER_COUNT";

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("camera-session.toml");
    fs::write(&path, contents).expect("config should be written");
    path
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let config =
        SessionConfig::load_from(dir.path().join("absent.toml")).expect("defaults should load");

    assert_eq!(config, SessionConfig::default());
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(
        &dir,
        r#"
buffer_count = 3
callback_queue_depth = 2
max_frame_wait_ms = 40
thread_name_prefix = "cam0"
"#,
    );

    let config = SessionConfig::load_from(&path).expect("config should load");
    assert_eq!(config.buffer_count, 3);
    assert_eq!(config.queue_depth(), 2);
    assert_eq!(config.max_frame_wait(), Duration::from_millis(40));
    assert_eq!(config.thread_name_prefix, "cam0");
    assert_eq!(config.frame_len, None);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "buffer_count = 3\n");

    env::set_var(BUFFER_COUNT_VAR, "6");
    let config = SessionConfig::load_from(&path);
    env::remove_var(BUFFER_COUNT_VAR);

    assert_eq!(config.expect("config should load").buffer_count, 6);
}

#[test]
#[serial]
fn test_malformed_value_is_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "buffer_count = \"many\"\n");

    assert!(SessionConfig::load_from(&path).is_err());
}

#[test]
#[serial]
fn test_loaded_config_sizes_the_session() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "buffer_count = 5\nframe_len = 64\n");
    let config = SessionConfig::load_from(&path).expect("config should load");

    let camera = MockCamera::new().with_max_size(FrameSize::new(8, 8));
    let session = Session::with_device(camera, &config).expect("session should open");
    assert_eq!(session.pool().buffer_count(), 5);
    assert_eq!(session.pool().buffer_len(), 64);
}

#[test]
#[serial]
fn test_zero_buffers_rejected_at_open() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "buffer_count = 0\n");
    let config = SessionConfig::load_from(&path).expect("config should load");

    let result = Session::with_device(MockCamera::new(), &config);
    assert!(matches!(result, Err(SessionError::MemAlloc(_))));
}
