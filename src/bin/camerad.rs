//! camerad - timelapse capture daemon
//!
//! This daemon:
//! 1. Mounts the card and adopts the photos already on it
//! 2. Runs the capture worker against the configured sensor
//! 3. Serves the management API and fires the capture timer

use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use timelapse_kernel::{
    api::{ApiConfig, ApiServer},
    open_sensor, CameraConfig, DirStorage, Pipeline, SystemMemoryProbe,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CameraConfig::load()?;
    log::info!(
        "camerad {} starting: storage={} sensor={} interval={}ms queue={}",
        env!("CARGO_PKG_VERSION"),
        config.storage.root.display(),
        config.sensor.source,
        config.limits.capture_interval.as_millis(),
        config.limits.queue_capacity
    );

    let device = Box::new(DirStorage::new(&config.storage));
    let pipeline = Arc::new(Pipeline::open(
        config.limits.clone(),
        device,
        Arc::new(SystemMemoryProbe),
    )?);

    let sensor = open_sensor(&config.sensor, pipeline.buffer_pool())?;
    let worker_shutdown = Arc::new(AtomicBool::new(false));
    let worker = pipeline.spawn_worker(sensor, worker_shutdown)?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, pipeline.clone()).spawn()?;
    log::info!("camera api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("camerad running. waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    worker.stop()?;
    log::info!("final status: {}", pipeline.status_report().summary_line());

    Ok(())
}
