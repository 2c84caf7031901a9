//! speedcam_events - list stored speed events

use anyhow::Result;
use chrono::{Local, TimeZone};
use clap::Parser;
use std::path::PathBuf;

use speedcam::{EventStore, SpeedcamConfig, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the TOML configuration file (for the data directory).
    #[arg(long, env = "SPEEDCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Data directory; overrides the configuration.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Maximum events to list.
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Events to skip, newest first.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let config = SpeedcamConfig::load_from(args.config.as_deref())?;
    let data_dir = args.data_dir.unwrap_or(config.storage.data_dir);
    // Retention never runs from here.
    let store = SqliteEventStore::open(&data_dir, 100.0)?;
    let events = store.events(args.limit, args.offset)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        eprintln!("no events in {}", data_dir.display());
        return Ok(());
    }
    println!("{:>6}  {:<19}  {:>9}  {:>6}  image", "id", "time", "km/h", "object");
    for event in &events {
        let time = Local
            .timestamp_opt(event.timestamp as i64, 0)
            .earliest()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| format!("{:.0}", event.timestamp));
        println!(
            "{:>6}  {:<19}  {:>9.2}  {:>6}  {}",
            event.id,
            time,
            event.speed_kmh,
            event.object_id,
            store.images_dir().join(&event.image_path).display()
        );
    }
    Ok(())
}
