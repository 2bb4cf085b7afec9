//! Video detection.
//!
//! A `VideoSession` walks one input clip frame by frame, in source order:
//!
//! ```text
//! Open -> PrepareSink -> Stream -> Finalize
//!   \__________\____________\______/ (any failure)
//! ```
//!
//! Source and sink handles live inside the state value, so leaving
//! `Finalize` drops both on every path. Only a clean run finishes the sink;
//! a failed run leaves a partial output for the caller to discard.
//!
//! Containers are reached through `MediaBackend`. The FFmpeg backend is built
//! with the `video-ffmpeg` feature; `memory` holds an in-process backend used
//! by tests and dry runs.

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg;
pub mod memory;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::error::{DetectError, Result};
use crate::frame::Frame;
use crate::pipeline::FrameDetector;

#[cfg(feature = "video-ffmpeg")]
pub use ffmpeg::FfmpegMedia;

/// Default number of frames between progress notifications.
pub const DEFAULT_PROGRESS_EVERY: u64 = 10;

/// Stream properties read when a source is opened.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Container-reported frame count; 0 when unknown.
    pub total_frames: u64,
}

/// Decoded frames in presentation order.
pub trait VideoSource {
    fn info(&self) -> VideoInfo;

    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Encoded output stream with the source's dimensions and rate.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// Flush and close the container. Called once, only after a clean run.
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Opens sources and creates sinks for a container implementation.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_source(&self, path: &Path) -> anyhow::Result<Box<dyn VideoSource>>;

    fn create_sink(&self, path: &Path, info: &VideoInfo) -> anyhow::Result<Box<dyn VideoSink>>;
}

/// Receives percent-complete notifications. Must not block.
pub trait ProgressObserver {
    fn on_progress(&self, percent: f64);
}

impl<F> ProgressObserver for F
where
    F: Fn(f64),
{
    fn on_progress(&self, percent: f64) {
        self(percent)
    }
}

/// What to do when detection fails on one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramePolicy {
    /// Stop the session and surface the error.
    #[default]
    Abort,
    /// Record the failure, write the frame un-annotated, keep going.
    Skip,
}

impl FromStr for FramePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FramePolicy::Abort),
            "skip" => Ok(FramePolicy::Skip),
            other => Err(anyhow!(
                "unknown frame failure policy '{other}' (expected abort or skip)"
            )),
        }
    }
}

impl fmt::Display for FramePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramePolicy::Abort => f.write_str("abort"),
            FramePolicy::Skip => f.write_str("skip"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoOptions {
    pub policy: FramePolicy,
    pub progress_every: u64,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            policy: FramePolicy::Abort,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// A frame whose detection failed under `FramePolicy::Skip`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameFailure {
    pub frame_index: u64,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VideoReport {
    /// Every detection, tagged with its frame, in frame order.
    pub detections: Vec<Detection>,
    pub frames_processed: u64,
    pub failed_frames: Vec<FrameFailure>,
}

impl VideoReport {
    pub fn total_detections(&self) -> usize {
        self.detections.len()
    }
}

enum State {
    Open,
    PrepareSink {
        source: Box<dyn VideoSource>,
        info: VideoInfo,
    },
    Stream {
        source: Box<dyn VideoSource>,
        sink: Box<dyn VideoSink>,
        info: VideoInfo,
    },
    Finalize {
        source: Option<Box<dyn VideoSource>>,
        sink: Option<Box<dyn VideoSink>>,
        failure: Option<DetectError>,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Open => "open",
            State::PrepareSink { .. } => "prepare_sink",
            State::Stream { .. } => "stream",
            State::Finalize { .. } => "finalize",
        }
    }
}

/// One video-processing call. Consumed by `run`.
pub struct VideoSession<'a> {
    detector: &'a FrameDetector,
    options: VideoOptions,
    observer: Option<&'a dyn ProgressObserver>,
    frame_counter: u64,
    report: VideoReport,
}

impl<'a> VideoSession<'a> {
    pub fn new(detector: &'a FrameDetector, options: VideoOptions) -> Self {
        Self {
            detector,
            options,
            observer: None,
            frame_counter: 0,
            report: VideoReport::default(),
        }
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn run(
        mut self,
        media: &dyn MediaBackend,
        input: &Path,
        output: &Path,
    ) -> Result<VideoReport> {
        let mut state = State::Open;
        loop {
            log::trace!("video session: {}", state.name());
            state = match state {
                State::Open => match media.open_source(input) {
                    Ok(source) => {
                        let info = source.info();
                        log::info!(
                            "video {}: {}x{} @ {:.2} fps, {} frames",
                            input.display(),
                            info.width,
                            info.height,
                            info.fps,
                            info.total_frames
                        );
                        State::PrepareSink { source, info }
                    }
                    Err(err) => State::Finalize {
                        source: None,
                        sink: None,
                        failure: Some(DetectError::SourceUnreadable(format!(
                            "{}: {err:#}",
                            input.display()
                        ))),
                    },
                },
                State::PrepareSink { source, info } => match media.create_sink(output, &info) {
                    Ok(sink) => State::Stream { source, sink, info },
                    Err(err) => State::Finalize {
                        source: Some(source),
                        sink: None,
                        failure: Some(DetectError::SinkUnwritable(format!(
                            "{}: {err:#}",
                            output.display()
                        ))),
                    },
                },
                State::Stream {
                    mut source,
                    mut sink,
                    info,
                } => {
                    let failure = self.stream(source.as_mut(), sink.as_mut(), &info).err();
                    State::Finalize {
                        source: Some(source),
                        sink: Some(sink),
                        failure,
                    }
                }
                State::Finalize {
                    source,
                    sink,
                    failure,
                } => return self.finalize(source, sink, failure),
            };
        }
    }

    fn stream(
        &mut self,
        source: &mut dyn VideoSource,
        sink: &mut dyn VideoSink,
        info: &VideoInfo,
    ) -> Result<()> {
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(err) => {
                    return Err(DetectError::SourceUnreadable(format!(
                        "frame {}: {err:#}",
                        self.frame_counter
                    )))
                }
            };
            self.process_frame(&frame, sink)?;
            self.frame_counter += 1;
            self.report.frames_processed = self.frame_counter;
            self.report_progress(info);
        }
    }

    fn process_frame(&mut self, frame: &Frame, sink: &mut dyn VideoSink) -> Result<()> {
        let index = self.frame_counter;
        let written = match self.detector.detect_one(frame) {
            Ok((annotated, detections)) => {
                self.report
                    .detections
                    .extend(detections.into_iter().map(|d| d.in_frame(index)));
                sink.write_frame(&annotated)
            }
            Err(err) if self.options.policy == FramePolicy::Skip && skippable(&err) => {
                log::warn!("frame {index}: skipped ({err})");
                self.report.failed_frames.push(FrameFailure {
                    frame_index: index,
                    reason: err.to_string(),
                });
                sink.write_frame(frame)
            }
            Err(err) => return Err(err),
        };
        written.map_err(|err| DetectError::SinkUnwritable(format!("frame {index}: {err:#}")))
    }

    fn report_progress(&self, info: &VideoInfo) {
        let Some(observer) = self.observer else {
            return;
        };
        let every = self.options.progress_every.max(1);
        if info.total_frames == 0 || self.frame_counter % every != 0 {
            return;
        }
        let percent = self.frame_counter as f64 * 100.0 / info.total_frames as f64;
        observer.on_progress(percent.min(100.0));
    }

    fn finalize(
        self,
        source: Option<Box<dyn VideoSource>>,
        sink: Option<Box<dyn VideoSink>>,
        failure: Option<DetectError>,
    ) -> Result<VideoReport> {
        drop(source);
        let outcome = match (failure, sink) {
            (Some(err), sink) => {
                drop(sink);
                Err(err)
            }
            (None, Some(mut sink)) => sink
                .finish()
                .map_err(|err| DetectError::SinkUnwritable(format!("finalize output: {err:#}"))),
            (None, None) => Err(DetectError::SinkUnwritable("output stream was never created".into())),
        };
        match outcome {
            Ok(()) => {
                log::info!(
                    "video done: {} frames, {} detections, {} skipped",
                    self.report.frames_processed,
                    self.report.total_detections(),
                    self.report.failed_frames.len()
                );
                Ok(self.report)
            }
            Err(err) => {
                log::warn!(
                    "video aborted after {} frames: {err}",
                    self.frame_counter
                );
                Err(err)
            }
        }
    }
}

fn skippable(err: &DetectError) -> bool {
    matches!(
        err,
        DetectError::InferenceFailure(_) | DetectError::BadInput(_)
    )
}

/// Fallback when no container support is compiled in.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoVideoBackend;

const NO_VIDEO: &str = "video support not compiled in (rebuild with --features video-ffmpeg)";

impl MediaBackend for NoVideoBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn open_source(&self, _path: &Path) -> anyhow::Result<Box<dyn VideoSource>> {
        Err(anyhow!(NO_VIDEO))
    }

    fn create_sink(&self, _path: &Path, _info: &VideoInfo) -> anyhow::Result<Box<dyn VideoSink>> {
        Err(anyhow!(NO_VIDEO))
    }
}

/// Best container backend available in this build.
pub fn default_media_backend() -> Arc<dyn MediaBackend> {
    #[cfg(feature = "video-ffmpeg")]
    {
        Arc::new(FfmpegMedia)
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        Arc::new(NoVideoBackend)
    }
}
