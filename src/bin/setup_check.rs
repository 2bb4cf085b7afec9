//! setup_check - verify a roadscan installation before starting the service.
//!
//! Checks, in order: compiled backends, configuration, model weights on disk,
//! scratch directory writability, and that the model actually loads.
//! Exits non-zero if any check fails.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;

use roadscan::service::build_detector;
use roadscan::{storage, Frame, ServiceConfig};

#[path = "../ui.rs"]
#[allow(dead_code)]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "setup_check", about = "Verify model, directories and backends")]
struct Args {
    /// Skip loading the model (file checks only)
    #[arg(long)]
    skip_load: bool,

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

    println!("roadscan {} setup check", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "  inference backend: {}",
        if cfg!(feature = "backend-tract") {
            "tract (ONNX)"
        } else {
            "none (build with --features backend-tract)"
        }
    );
    println!(
        "  video backend:     {}",
        if cfg!(feature = "video-ffmpeg") {
            "ffmpeg"
        } else {
            "none (build with --features video-ffmpeg)"
        }
    );
    println!();

    let config = {
        let _stage = ui.stage("Load configuration");
        ServiceConfig::load()?
    };

    let mut failures = 0;
    let mut report = |label: &str, outcome: Result<String>| match outcome {
        Ok(detail) => println!("  ok    {label}: {detail}"),
        Err(err) => {
            failures += 1;
            println!("  FAIL  {label}: {err:#}");
        }
    };

    report("model file", check_model_file(&config.model_path));
    {
        let _stage = ui.stage("Check scratch directories");
        report("upload dir", check_writable(&config.upload_dir));
        report("output dir", check_writable(&config.output_dir));
    }
    if args.skip_load {
        println!("  skip  model load");
    } else {
        let _stage = ui.stage("Load model");
        report("model load", check_model_load(&config));
    }

    println!();
    if failures > 0 {
        return Err(anyhow!("{failures} check(s) failed"));
    }
    println!("All checks passed. Start the service with: roadscand");
    Ok(())
}

fn check_model_file(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("{} not found", path.display()))?;
    if !meta.is_file() {
        return Err(anyhow!("{} is not a file", path.display()));
    }
    Ok(format!(
        "{} ({:.2} MB)",
        path.display(),
        meta.len() as f64 / (1024.0 * 1024.0)
    ))
}

fn check_writable(dir: &Path) -> Result<String> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    let marker = storage::ScratchFile::create(dir.join(format!(".write-check-{}", storage::new_id())), b"ok")
        .with_context(|| format!("cannot write to {}", dir.display()))?;
    drop(marker);
    Ok(dir.display().to_string())
}

fn check_model_load(config: &ServiceConfig) -> Result<String> {
    let detector = build_detector(config)?;
    let blank = Frame::filled(config.model_input_size, config.model_input_size, [114, 114, 114])?;
    let (_, detections) = detector.detect_frame(&blank)?;
    Ok(format!(
        "{} backend, {} detection(s) on a blank frame",
        detector.model_name(),
        detections.len()
    ))
}
