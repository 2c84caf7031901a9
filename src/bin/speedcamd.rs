//! speedcamd - line-crossing speed camera daemon
//!
//! This daemon:
//! 1. Loads configuration (TOML file + environment overrides)
//! 2. Acquires a live video source through the fallback chain
//! 3. Runs segmentation, tracking and speed measurement on a worker thread
//! 4. Stores events with snapshots and sends violation notifications
//! 5. Serves the latest frame, history and detection settings over local HTTP

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use speedcam::api::{ApiServer, ApiState};
use speedcam::storage::SharedEventStore;
use speedcam::{
    acquire, EventHandler, NotificationManager, Pipeline, Service, SpeedcamConfig,
    SqliteEventStore, SystemBackends,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SPEEDCAM_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SpeedcamConfig::load_from(args.config.as_deref())?;
    match &config.path {
        Some(path) => log::info!("configuration loaded from {}", path.display()),
        None => log::info!("no configuration file; using defaults"),
    }

    let store = SqliteEventStore::open(
        &config.storage.data_dir,
        config.limits.max_disk_usage_percent,
    )?;
    let images_dir = store.images_dir().to_path_buf();
    let store: SharedEventStore = Arc::new(Mutex::new(store));
    log::info!("storing events under {}", config.storage.data_dir.display());

    let acquired = acquire(&config.camera, &SystemBackends)?;
    log::info!(
        "video source {} via {}",
        acquired.source_id,
        acquired.strategy
    );

    let handler = EventHandler::new(
        Some(store.clone()),
        Some(Box::new(NotificationManager::new(
            config.notifications.clone(),
        ))),
        config.limits.speed_limit_kmh,
    );
    let pipeline = Pipeline::new(&config.detection);
    let service = Service::new(acquired, pipeline, handler).spawn()?;

    let api_addr = config.api.addr.clone();
    let shared_config = Arc::new(Mutex::new(config));
    let api_handle = ApiServer::new(
        &api_addr,
        ApiState {
            config: shared_config,
            service: service.control(),
            store: Some(store),
            images_dir: Some(images_dir),
        },
    )
    .spawn()?;
    log::info!("api listening on {}", api_handle.addr);

    let running = Arc::new(AtomicBool::new(true));
    let running_signal = running.clone();
    ctrlc::set_handler(move || running_signal.store(false, Ordering::SeqCst))
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    log::info!("speedcamd running; press Ctrl-C to stop");
    while running.load(Ordering::SeqCst) && service.control().is_running() {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    api_handle.stop()?;
    service.stop()?;
    Ok(())
}
