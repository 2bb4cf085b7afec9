//! detect_media - run hazard detection over one image or video file.
//!
//! Prints the detections as JSON on stdout and writes the annotated result
//! next to the input (or to `--output`).

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use roadscan::service::build_detector;
use roadscan::storage::{self, MediaKind};
use roadscan::{FramePolicy, ProgressObserver, ServiceConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "detect_media",
    about = "Detect road hazards in an image or video file"
)]
struct Args {
    /// Image (.jpg .jpeg .png .bmp .webp) or video (.mp4 .avi .mov .mkv .wmv)
    #[arg(value_name = "PATH")]
    input: PathBuf,

    /// Where to write the annotated output
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// ONNX weights (overrides ROADSCAN_MODEL_PATH)
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,

    /// Minimum detection confidence
    #[arg(long)]
    confidence: Option<f32>,

    /// Overlap threshold for duplicate suppression
    #[arg(long)]
    iou: Option<f32>,

    /// Per-frame failure handling for videos (abort|skip)
    #[arg(long, value_name = "POLICY")]
    on_frame_error: Option<FramePolicy>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut config = ServiceConfig::load()?;
    if let Some(model) = &args.model {
        config.model_path = model.clone();
    }
    if let Some(confidence) = args.confidence {
        config.confidence_threshold = confidence;
    }
    if let Some(iou) = args.iou {
        config.iou_threshold = iou;
    }
    if let Some(policy) = args.on_frame_error {
        config.frame_failure_policy = policy;
    }

    let name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("input path has no file name"))?;
    let kind = if storage::check_extension(name, MediaKind::Image).is_ok() {
        MediaKind::Image
    } else {
        storage::check_extension(name, MediaKind::Video)?;
        MediaKind::Video
    };

    let detector = {
        let _stage = ui.stage("Load model");
        build_detector(&config).context("model unavailable")?
    };

    let report = match kind {
        MediaKind::Image => {
            let output = args
                .output
                .clone()
                .unwrap_or_else(|| sibling(&args.input, "detected", None));
            let (annotated, detections) = {
                let _stage = ui.stage("Detect");
                detector.detect_image(&args.input)?
            };
            annotated.save(&output)?;
            json!({
                "input": args.input,
                "output": output,
                "total_detections": detections.len(),
                "detections": detections,
            })
        }
        MediaKind::Video => {
            let output = args
                .output
                .clone()
                .unwrap_or_else(|| sibling(&args.input, "detected", Some("mp4")));
            let report = {
                let progress = ui.progress(name);
                detector.detect_video(&args.input, &output, Some(&progress as &dyn ProgressObserver))?
            };
            json!({
                "input": args.input,
                "output": output,
                "frames_processed": report.frames_processed,
                "total_detections": report.total_detections(),
                "failed_frames": report.failed_frames,
                "detections": report.detections,
            })
        }
    };

    let text = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{text}");
    Ok(())
}

/// `dir/<stem>_<suffix>.<ext>`, keeping the input extension unless overridden.
fn sibling(input: &Path, suffix: &str, ext: Option<&str>) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = ext
        .or_else(|| input.extension().and_then(|e| e.to_str()))
        .unwrap_or("png");
    input.with_file_name(format!("{stem}_{suffix}.{ext}"))
}
