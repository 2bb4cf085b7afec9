//! Road hazard detection service.
//!
//! Accepts still images, single live frames and whole videos, runs an
//! object-detection model over them and returns hazard detections (class,
//! confidence, box) together with annotated media.
//!
//! # Architecture
//!
//! Leaf first:
//!
//! 1. `detect`: the `HazardModel` capability, the class table and the
//!    `Detection` record every other layer speaks.
//! 2. `annotate`: boxes and labels drawn onto a copy of the frame.
//! 3. `pipeline`: `FrameDetector::detect_one`, the unit of work shared by all
//!    entry points.
//! 4. `video`: the frame-by-frame session over a `MediaBackend`.
//! 5. `service`: the detector lifecycle (`DetectorSlot`) and the request-scoped
//!    operations the HTTP layer in `api` calls.
//!
//! `config` loads settings from a JSON file and `ROADSCAN_*` variables;
//! `storage` owns upload validation, scratch files and cleanup.
//!
//! # Features
//!
//! - `backend-tract`: ONNX inference through tract.
//! - `video-ffmpeg`: video decode and MP4 encode through FFmpeg.

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod service;
pub mod storage;
pub mod video;

pub use annotate::{Annotator, Palette};
pub use config::ServiceConfig;
pub use detect::{BBox, ClassTable, Detection, HazardModel, RawBox, ScriptedModel, Thresholds};
pub use error::{DetectError, Result};
pub use frame::Frame;
pub use pipeline::FrameDetector;
pub use service::{DetectorSlot, HazardDetector, HazardService};
pub use video::{FramePolicy, MediaBackend, ProgressObserver, VideoOptions, VideoReport};
