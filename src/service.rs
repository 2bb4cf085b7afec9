//! Detector lifecycle and the operations the transport calls.
//!
//! `HazardDetector` owns the loaded model for the process lifetime and exposes
//! image, video and frame detection. `DetectorSlot` holds either a ready
//! detector or the reason construction failed; every entry point asks the
//! slot first, so a service started without weights answers each request with
//! `ModelUnavailable` instead of failing partway through.
//!
//! `HazardService` adds request scoping on top: extension checks, scratch
//! uploads removed on every exit path, annotated output persistence and
//! cleanup of aged files.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;

use crate::annotate::Annotator;
use crate::config::ServiceConfig;
use crate::detect::{Detection, HazardModel, Thresholds};
use crate::error::{DetectError, Result};
use crate::frame::Frame;
use crate::pipeline::FrameDetector;
use crate::storage::{self, MediaKind, ScratchFile};
use crate::video::{
    default_media_backend, MediaBackend, ProgressObserver, VideoOptions, VideoReport, VideoSession,
};

pub struct HazardDetector {
    frames: FrameDetector,
    media: Arc<dyn MediaBackend>,
    video_options: VideoOptions,
}

impl HazardDetector {
    pub fn new(model: Arc<dyn HazardModel>, thresholds: Thresholds) -> Self {
        Self {
            frames: FrameDetector::new(model, thresholds),
            media: default_media_backend(),
            video_options: VideoOptions::default(),
        }
    }

    pub fn with_media(mut self, media: Arc<dyn MediaBackend>) -> Self {
        self.media = media;
        self
    }

    pub fn with_video_options(mut self, options: VideoOptions) -> Self {
        self.video_options = options;
        self
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.frames = self.frames.with_annotator(annotator);
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        self.frames.thresholds()
    }

    pub fn model_name(&self) -> &'static str {
        self.frames.model_name()
    }

    pub fn media_name(&self) -> &'static str {
        self.media.name()
    }

    /// Detect and annotate a decoded frame.
    pub fn detect_frame(&self, frame: &Frame) -> Result<(Frame, Vec<Detection>)> {
        self.frames.detect_one(frame)
    }

    /// Decode one encoded frame and return its detections. No rendering.
    pub fn detect_encoded_frame(&self, bytes: &[u8]) -> Result<Vec<Detection>> {
        let frame = Frame::decode(bytes)?;
        self.frames.detections(&frame)
    }

    /// Read an image file, detect, and return the annotated copy.
    pub fn detect_image(&self, path: &Path) -> Result<(Frame, Vec<Detection>)> {
        let frame = Frame::open(path)?;
        self.frames.detect_one(&frame)
    }

    /// Annotate every frame of `input` into `output` and collect detections.
    pub fn detect_video(
        &self,
        input: &Path,
        output: &Path,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<VideoReport> {
        VideoSession::new(&self.frames, self.video_options)
            .with_observer(observer)
            .run(self.media.as_ref(), input, output)
    }
}

/// Load the configured model weights with the compiled-in backend.
pub fn load_model(cfg: &ServiceConfig) -> anyhow::Result<Arc<dyn HazardModel>> {
    if !cfg.model_path.is_file() {
        return Err(anyhow!(
            "model weights not found at {}",
            cfg.model_path.display()
        ));
    }
    #[cfg(feature = "backend-tract")]
    {
        let model = crate::detect::TractYolo::load(&cfg.model_path, cfg.model_input_size, cfg.classes())?;
        model.warm_up()?;
        Ok(Arc::new(model))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow!(
            "no inference backend compiled in (rebuild with --features backend-tract)"
        ))
    }
}

pub fn build_detector(cfg: &ServiceConfig) -> anyhow::Result<HazardDetector> {
    let model = load_model(cfg)?;
    Ok(HazardDetector::new(model, cfg.thresholds()?).with_video_options(cfg.video_options()))
}

/// Process-wide holder for the one detector instance.
pub enum DetectorSlot {
    Ready(Arc<HazardDetector>),
    Unavailable { reason: String },
}

impl DetectorSlot {
    /// Build the detector from `cfg`. Failure is logged and kept as the
    /// unavailable reason; it never aborts startup.
    pub fn load(cfg: &ServiceConfig) -> Self {
        match build_detector(cfg) {
            Ok(detector) => {
                log::info!(
                    "model loaded from {} ({} backend, video via {})",
                    cfg.model_path.display(),
                    detector.model_name(),
                    detector.media_name()
                );
                Self::ready(detector)
            }
            Err(err) => {
                log::error!("failed to load model: {err:#}");
                log::warn!("service will run without a model; detection requests return 503");
                Self::Unavailable {
                    reason: format!("{err:#}"),
                }
            }
        }
    }

    pub fn ready(detector: HazardDetector) -> Self {
        Self::Ready(Arc::new(detector))
    }

    pub fn get(&self) -> Result<&Arc<HazardDetector>> {
        match self {
            Self::Ready(detector) => Ok(detector),
            Self::Unavailable { reason } => Err(DetectError::ModelUnavailable(reason.clone())),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub success: bool,
    pub detections: Vec<Detection>,
    pub total_detections: usize,
    pub image_id: String,
}

#[derive(Debug, Serialize)]
pub struct FrameResponse {
    pub success: bool,
    pub detections: Vec<Detection>,
    pub total_detections: usize,
}

/// Annotated MP4 plus the aggregate detection count.
#[derive(Debug)]
pub struct VideoResponse {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub report: VideoReport,
}

impl VideoResponse {
    pub fn total_detections(&self) -> usize {
        self.report.total_detections()
    }
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub deleted_count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub model_path: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub model_status: &'static str,
    pub version: &'static str,
}

pub struct HazardService {
    cfg: ServiceConfig,
    slot: DetectorSlot,
}

impl HazardService {
    pub fn new(cfg: ServiceConfig, slot: DetectorSlot) -> Self {
        Self { cfg, slot }
    }

    pub fn from_config(cfg: ServiceConfig) -> Self {
        let slot = DetectorSlot::load(&cfg);
        Self::new(cfg, slot)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.is_loaded()
    }

    /// Fails with `ModelUnavailable` when no detector was built.
    pub fn ensure_ready(&self) -> Result<()> {
        self.slot.get().map(|_| ())
    }

    pub fn detect_image_upload(&self, filename: &str, bytes: &[u8]) -> Result<ImageResponse> {
        let detector = self.slot.get()?;
        let ext = storage::check_extension(filename, MediaKind::Image)?;

        let image_id = storage::new_id();
        let upload = ScratchFile::create(
            self.cfg.upload_dir.join(format!("{image_id}{ext}")),
            bytes,
        )?;
        let (annotated, detections) = detector.detect_image(upload.path())?;
        annotated.save(self.cfg.output_dir.join(format!("{image_id}_detected{ext}")))?;

        log::info!("image {filename}: {} detection(s)", detections.len());
        Ok(ImageResponse {
            success: true,
            total_detections: detections.len(),
            detections,
            image_id,
        })
    }

    pub fn detect_video_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<VideoResponse> {
        let detector = self.slot.get()?;
        let ext = storage::check_extension(filename, MediaKind::Video)?;

        let id = storage::new_id();
        let upload = ScratchFile::create(self.cfg.upload_dir.join(format!("{id}{ext}")), bytes)?;
        let output = ScratchFile::reserve(self.cfg.output_dir.join(format!("{id}_detected.mp4")));

        let report = detector.detect_video(upload.path(), output.path(), observer)?;
        let bytes = fs::read(output.path())?;
        output.persist();

        log::info!(
            "video {filename}: {} frame(s), {} detection(s)",
            report.frames_processed,
            report.total_detections()
        );
        Ok(VideoResponse {
            bytes,
            filename: output_filename(filename),
            report,
        })
    }

    pub fn detect_frame_upload(&self, bytes: &[u8]) -> Result<FrameResponse> {
        let detector = self.slot.get()?;
        let detections = detector.detect_encoded_frame(bytes)?;
        Ok(FrameResponse {
            success: true,
            total_detections: detections.len(),
            detections,
        })
    }

    pub fn cleanup(&self) -> Result<CleanupResponse> {
        let deleted_count = storage::cleanup(&self.cfg.scratch_dirs(), self.cfg.retention)?;
        Ok(CleanupResponse {
            success: true,
            message: format!("Cleaned up {deleted_count} old files"),
            deleted_count,
        })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy",
            model_loaded: self.slot.is_loaded(),
            model_path: self.cfg.model_path.display().to_string(),
            confidence_threshold: self.cfg.confidence_threshold,
            iou_threshold: self.cfg.iou_threshold,
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            status: "online",
            message: "Road hazard detection API",
            model_status: if self.slot.is_loaded() {
                "loaded"
            } else {
                "not loaded"
            },
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Download name for an annotated video: `detected_<stem>.mp4`.
fn output_filename(upload_name: &str) -> String {
    let stem = Path::new(upload_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("video");
    format!("detected_{stem}.mp4")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{ClassTable, RawBox, ScriptedModel};
    use crate::video::memory::{MemoryMedia, MemorySource};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([50, 50, 50]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn detector() -> HazardDetector {
        let model = ScriptedModel::with_boxes(
            ClassTable::road_hazards(),
            vec![RawBox {
                x1: 4.0,
                y1: 4.0,
                x2: 20.0,
                y2: 20.0,
                class_id: 0,
                confidence: 0.8,
            }],
        );
        HazardDetector::new(Arc::new(model), Thresholds::default())
    }

    fn service(dir: &Path, slot: DetectorSlot) -> HazardService {
        let cfg = ServiceConfig {
            upload_dir: dir.join("uploads"),
            output_dir: dir.join("outputs"),
            ..ServiceConfig::default()
        };
        cfg.ensure_dirs().unwrap();
        HazardService::new(cfg, slot)
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn unavailable_model_wins_over_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(
            dir.path(),
            DetectorSlot::Unavailable {
                reason: "weights missing".into(),
            },
        );
        let err = svc.detect_image_upload("notes.txt", b"x").unwrap_err();
        assert!(matches!(err, DetectError::ModelUnavailable(_)));
        assert!(matches!(
            svc.detect_frame_upload(b"x").unwrap_err(),
            DetectError::ModelUnavailable(_)
        ));
        assert_eq!(svc.status().model_status, "not loaded");
    }

    #[test]
    fn bad_extension_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), DetectorSlot::ready(detector()));
        let err = svc.detect_image_upload("notes.txt", &png_bytes(8, 8)).unwrap_err();
        assert!(matches!(err, DetectError::UnsupportedFormat { .. }));
        assert_eq!(file_count(&dir.path().join("uploads")), 0);
    }

    #[test]
    fn image_upload_saves_annotated_and_drops_upload() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), DetectorSlot::ready(detector()));
        let resp = svc.detect_image_upload("road.PNG", &png_bytes(32, 32)).unwrap();
        assert!(resp.success);
        assert_eq!(resp.total_detections, 1);
        assert_eq!(resp.detections[0].class_name, "pothole");
        assert_eq!(file_count(&dir.path().join("uploads")), 0);
        let saved = dir
            .path()
            .join("outputs")
            .join(format!("{}_detected.png", resp.image_id));
        assert!(saved.is_file());
    }

    #[test]
    fn corrupt_image_is_bad_input_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), DetectorSlot::ready(detector()));
        let err = svc.detect_image_upload("road.jpg", b"not a jpeg").unwrap_err();
        assert!(matches!(err, DetectError::BadInput(_)));
        assert_eq!(file_count(&dir.path().join("uploads")), 0);
        assert_eq!(file_count(&dir.path().join("outputs")), 0);
    }

    #[test]
    fn frame_upload_rejects_undecodable_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), DetectorSlot::ready(detector()));
        assert!(matches!(
            svc.detect_frame_upload(b"").unwrap_err(),
            DetectError::BadInput(_)
        ));
        let ok = svc.detect_frame_upload(&png_bytes(24, 24)).unwrap();
        assert_eq!(ok.total_detections, 1);
        assert_eq!(ok.detections[0].frame_index, None);
    }

    #[test]
    fn video_upload_returns_output_and_frame_tags() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![Frame::filled(24, 24, [0, 0, 0]).unwrap(); 3];
        let media = MemoryMedia::new(MemorySource::new(25.0, frames)).with_disk_output();
        let det = detector().with_media(Arc::new(media));
        let svc = service(dir.path(), DetectorSlot::ready(det));

        let resp = svc.detect_video_upload("clip.avi", b"container", None).unwrap();
        assert_eq!(resp.filename, "detected_clip.mp4");
        assert_eq!(resp.total_detections(), 3);
        assert_eq!(resp.bytes.len(), 3 * 24 * 24 * 3);
        assert_eq!(file_count(&dir.path().join("uploads")), 0);
        let frames: Vec<_> = resp.report.detections.iter().map(|d| d.frame_index).collect();
        assert_eq!(frames, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn failed_video_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![Frame::filled(24, 24, [0, 0, 0]).unwrap(); 3];
        let media = MemoryMedia::new(MemorySource::new(25.0, frames).failing_at(1)).with_disk_output();
        let det = detector().with_media(Arc::new(media));
        let svc = service(dir.path(), DetectorSlot::ready(det));

        let err = svc.detect_video_upload("clip.mp4", b"container", None).unwrap_err();
        assert!(matches!(err, DetectError::SourceUnreadable(_)));
        assert_eq!(file_count(&dir.path().join("uploads")), 0);
        assert_eq!(file_count(&dir.path().join("outputs")), 0);
    }

    #[test]
    fn download_name_uses_stem() {
        assert_eq!(output_filename("road trip.MOV"), "detected_road trip.mp4");
        assert_eq!(output_filename("clip"), "detected_clip.mp4");
    }
}
