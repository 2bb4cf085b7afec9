//! roadscand - road hazard detection HTTP service
//!
//! This daemon:
//! 1. Loads `ServiceConfig` (JSON file + `ROADSCAN_*` env)
//! 2. Creates the upload and output directories
//! 3. Loads the model once; on failure keeps serving and answers detection
//!    requests with 503
//! 4. Serves the detection API until Ctrl-C

use anyhow::Result;
use std::sync::{mpsc, Arc};

use roadscan::{
    api::{ApiConfig, ApiServer},
    HazardService, ServiceConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;
    config.ensure_dirs()?;
    log::info!(
        "roadscand {} starting (confidence {:.2}, iou {:.2}, frame failures: {})",
        env!("CARGO_PKG_VERSION"),
        config.confidence_threshold,
        config.iou_threshold,
        config.frame_failure_policy
    );

    let api_config = ApiConfig::from_service(&config);
    let service = Arc::new(HazardService::from_config(config));
    let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
    log::info!("detection api listening on {}", api_handle.addr);
    if !service.is_loaded() {
        log::warn!("no model loaded; detection endpoints return 503 until restart");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("roadscand waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
