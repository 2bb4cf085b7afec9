use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use roadscan::{FramePolicy, ServiceConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: &[&str] = &[
    "ROADSCAN_CONFIG",
    "ROADSCAN_HOST",
    "ROADSCAN_PORT",
    "ROADSCAN_MODEL_PATH",
    "ROADSCAN_CONFIDENCE_THRESHOLD",
    "ROADSCAN_IOU_THRESHOLD",
    "ROADSCAN_MAX_UPLOAD_SIZE",
    "ROADSCAN_MAX_CONCURRENT_REQUESTS",
    "ROADSCAN_UPLOAD_DIR",
    "ROADSCAN_OUTPUT_DIR",
    "ROADSCAN_ALLOWED_ORIGINS",
    "ROADSCAN_CLASS_NAMES",
    "ROADSCAN_RETENTION_SECS",
    "ROADSCAN_FRAME_FAILURE_POLICY",
];

fn clear_env() {
    for key in KEYS {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load defaults");
    assert_eq!(cfg.host, "0.0.0.0");
    assert_eq!(cfg.port, 8000);
    assert_eq!(cfg.model_path, PathBuf::from("models/best.onnx"));
    assert!((cfg.confidence_threshold - 0.25).abs() < f32::EPSILON);
    assert!((cfg.iou_threshold - 0.45).abs() < f32::EPSILON);
    assert_eq!(cfg.upload_dir, PathBuf::from("uploads"));
    assert_eq!(cfg.output_dir, PathBuf::from("outputs"));
    assert_eq!(cfg.retention.as_secs(), 3600);
    assert_eq!(cfg.progress_every, 10);
    assert_eq!(cfg.model_input_size, 640);
    assert_eq!(cfg.max_concurrent_requests, 4);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "server": {
            "host": "127.0.0.1",
            "port": 9100,
            "max_concurrent_requests": 2,
            "allowed_origins": ["https://dash.example"]
        },
        "model": {
            "path": "weights/road.onnx",
            "confidence_threshold": 0.4,
            "class_names": ["pothole", "speed_bump", "crack"],
            "input_size": 320
        },
        "storage": {
            "upload_dir": "/tmp/roadscan/in",
            "retention_secs": 600
        },
        "video": {
            "frame_failure_policy": "skip",
            "progress_every": 5
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("ROADSCAN_CONFIG", file.path());
    std::env::set_var("ROADSCAN_PORT", "9200");
    std::env::set_var("ROADSCAN_IOU_THRESHOLD", "0.6");
    std::env::set_var("ROADSCAN_ALLOWED_ORIGINS", "http://a.test, http://b.test,");
    std::env::set_var("ROADSCAN_FRAME_FAILURE_POLICY", "abort");

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.max_concurrent_requests, 2);

    assert_eq!(cfg.bind_addr(), "127.0.0.1:9200");
    assert_eq!(cfg.model_path, PathBuf::from("weights/road.onnx"));
    assert!((cfg.confidence_threshold - 0.4).abs() < f32::EPSILON);
    assert!((cfg.iou_threshold - 0.6).abs() < f32::EPSILON);
    assert_eq!(cfg.class_names, vec!["pothole", "speed_bump", "crack"]);
    assert_eq!(cfg.classes().name_for(2), "crack");
    assert_eq!(cfg.model_input_size, 320);
    assert_eq!(cfg.upload_dir, PathBuf::from("/tmp/roadscan/in"));
    assert_eq!(cfg.output_dir, PathBuf::from("outputs"));
    assert_eq!(cfg.retention.as_secs(), 600);
    assert_eq!(cfg.allowed_origins, vec!["http://a.test", "http://b.test"]);
    assert_eq!(cfg.frame_failure_policy, FramePolicy::Abort);
    assert_eq!(cfg.video_options().progress_every, 5);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("ROADSCAN_PORT", "eighty"),
        ("ROADSCAN_CONFIDENCE_THRESHOLD", "1.5"),
        ("ROADSCAN_IOU_THRESHOLD", "-0.1"),
        ("ROADSCAN_RETENTION_SECS", "0"),
        ("ROADSCAN_MAX_CONCURRENT_REQUESTS", "0"),
        ("ROADSCAN_FRAME_FAILURE_POLICY", "retry"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(ServiceConfig::load().is_err(), "{key}={value} should be rejected");
    }

    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("ROADSCAN_CONFIG", file.path());
    let err = ServiceConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    std::env::set_var("ROADSCAN_CONFIG", "/definitely/not/here.json");
    assert!(ServiceConfig::load().is_err());

    clear_env();
}

#[test]
fn ensure_dirs_creates_scratch_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig {
        upload_dir: dir.path().join("a/uploads"),
        output_dir: dir.path().join("b/outputs"),
        ..ServiceConfig::default()
    };
    cfg.ensure_dirs().unwrap();
    assert!(cfg.upload_dir.is_dir());
    assert!(cfg.output_dir.is_dir());
    cfg.ensure_dirs().unwrap();
}
