use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{ClassTable, Thresholds};
use crate::video::{FramePolicy, VideoOptions, DEFAULT_PROGRESS_EVERY};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MODEL_PATH: &str = "models/best.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MAX_UPLOAD: usize = 100_000_000;
const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:8080",
    "http://localhost:5173",
    "http://localhost:3000",
];
const DEFAULT_CLASS_NAMES: &[&str] = &["pothole", "speed_bump"];
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    server: Option<ServerConfigFile>,
    model: Option<ModelConfigFile>,
    storage: Option<StorageConfigFile>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    host: Option<String>,
    port: Option<u16>,
    max_upload_size: Option<usize>,
    max_concurrent_requests: Option<usize>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    class_names: Option<Vec<String>>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    upload_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    frame_failure_policy: Option<FramePolicy>,
    progress_every: Option<u64>,
}

/// Settings for the detection service and the CLI tools.
///
/// Loaded from an optional JSON file named by `ROADSCAN_CONFIG`, then
/// overridden by `ROADSCAN_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_size: usize,
    /// Requests handled at once; further connections are answered 503.
    pub max_concurrent_requests: usize,
    pub allowed_origins: Vec<String>,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub class_names: Vec<String>,
    pub model_input_size: u32,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub retention: Duration,
    pub frame_failure_policy: FramePolicy,
    pub progress_every: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_file(ServiceConfigFile::default())
    }
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADSCAN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let video = file.video.unwrap_or_default();
        Self {
            host: server.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: server.port.unwrap_or(DEFAULT_PORT),
            max_upload_size: server.max_upload_size.unwrap_or(DEFAULT_MAX_UPLOAD),
            max_concurrent_requests: server
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            allowed_origins: server
                .allowed_origins
                .unwrap_or_else(|| to_strings(DEFAULT_ALLOWED_ORIGINS)),
            model_path: model
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            confidence_threshold: model.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            iou_threshold: model.iou_threshold.unwrap_or(DEFAULT_IOU),
            class_names: model
                .class_names
                .unwrap_or_else(|| to_strings(DEFAULT_CLASS_NAMES)),
            model_input_size: model.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            upload_dir: storage
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            output_dir: storage
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            retention: Duration::from_secs(
                storage.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS),
            ),
            frame_failure_policy: video.frame_failure_policy.unwrap_or_default(),
            progress_every: video.progress_every.unwrap_or(DEFAULT_PROGRESS_EVERY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(host) = env_nonempty("ROADSCAN_HOST") {
            self.host = host;
        }
        if let Some(port) = env_nonempty("ROADSCAN_PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("ROADSCAN_PORT must be a port number, got '{port}'"))?;
        }
        if let Some(path) = env_nonempty("ROADSCAN_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(value) = env_nonempty("ROADSCAN_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("ROADSCAN_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_nonempty("ROADSCAN_IOU_THRESHOLD") {
            self.iou_threshold = value
                .parse()
                .map_err(|_| anyhow!("ROADSCAN_IOU_THRESHOLD must be a number"))?;
        }
        if let Some(value) = env_nonempty("ROADSCAN_MAX_UPLOAD_SIZE") {
            self.max_upload_size = value
                .parse()
                .map_err(|_| anyhow!("ROADSCAN_MAX_UPLOAD_SIZE must be a byte count"))?;
        }
        if let Some(value) = env_nonempty("ROADSCAN_MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = value.parse().map_err(|_| {
                anyhow!("ROADSCAN_MAX_CONCURRENT_REQUESTS must be a positive integer")
            })?;
        }
        if let Some(dir) = env_nonempty("ROADSCAN_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("ROADSCAN_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Ok(origins) = std::env::var("ROADSCAN_ALLOWED_ORIGINS") {
            let parsed = split_csv(&origins);
            if !parsed.is_empty() {
                self.allowed_origins = parsed;
            }
        }
        if let Ok(classes) = std::env::var("ROADSCAN_CLASS_NAMES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.class_names = parsed;
            }
        }
        if let Some(retention) = env_nonempty("ROADSCAN_RETENTION_SECS") {
            let seconds: u64 = retention.parse().map_err(|_| {
                anyhow!("ROADSCAN_RETENTION_SECS must be an integer number of seconds")
            })?;
            self.retention = Duration::from_secs(seconds);
        }
        if let Some(policy) = env_nonempty("ROADSCAN_FRAME_FAILURE_POLICY") {
            self.frame_failure_policy = policy.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.thresholds()?;
        if self.class_names.is_empty() {
            return Err(anyhow!("class_names must list at least one class"));
        }
        if self.model_input_size == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        if self.max_upload_size == 0 {
            return Err(anyhow!("max_upload_size must be greater than zero"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(anyhow!("max_concurrent_requests must be greater than zero"));
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.progress_every == 0 {
            return Err(anyhow!("progress_every must be greater than zero"));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(self.confidence_threshold, self.iou_threshold)
    }

    pub fn classes(&self) -> ClassTable {
        ClassTable::new(self.class_names.iter().cloned())
    }

    pub fn video_options(&self) -> VideoOptions {
        VideoOptions {
            policy: self.frame_failure_policy,
            progress_every: self.progress_every,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directories swept by cleanup.
    pub fn scratch_dirs(&self) -> [&Path; 2] {
        [self.upload_dir.as_path(), self.output_dir.as_path()]
    }

    /// Create the upload and output directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in self.scratch_dirs() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
