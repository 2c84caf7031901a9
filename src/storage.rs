use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::measure::SpeedEvent;

pub const DB_FILE_NAME: &str = "speed_cam.db";
pub const IMAGES_DIR_NAME: &str = "images";
/// Events removed per retention pass.
pub const CLEANUP_BATCH: usize = 50;
const SNAPSHOT_JPEG_QUALITY: u8 = 90;

/// One persisted measurement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: f64,
    #[serde(rename = "speed")]
    pub speed_kmh: f64,
    /// Snapshot file name, relative to the images directory.
    pub image_path: String,
    pub object_id: i64,
}

pub trait EventStore {
    /// Persist `event` and its snapshot. Returns the snapshot path.
    fn save(&mut self, event: &SpeedEvent) -> Result<PathBuf>;

    /// History, newest first.
    fn events(&self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>>;
}

pub type SharedEventStore = Arc<Mutex<dyn EventStore + Send>>;

pub struct SqliteEventStore {
    conn: Connection,
    data_dir: PathBuf,
    images_dir: PathBuf,
    max_disk_usage_percent: f64,
}

impl SqliteEventStore {
    pub fn open(data_dir: &Path, max_disk_usage_percent: f64) -> Result<Self> {
        let images_dir = data_dir.join(IMAGES_DIR_NAME);
        std::fs::create_dir_all(&images_dir)
            .with_context(|| format!("create {}", images_dir.display()))?;
        let conn = Connection::open(data_dir.join(DB_FILE_NAME))?;
        let mut store = Self {
            conn,
            data_dir: data_dir.to_path_buf(),
            images_dir,
            max_disk_usage_percent,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp REAL,
              speed REAL,
              image_path TEXT,
              object_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            "#,
        )?;
        Ok(())
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn set_max_disk_usage_percent(&mut self, percent: f64) {
        self.max_disk_usage_percent = percent;
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Run retention when the data volume is fuller than allowed.
    pub fn check_disk_usage(&mut self) -> Result<()> {
        let percent_used = disk_usage_percent(&self.data_dir)?;
        if percent_used > self.max_disk_usage_percent {
            log::warn!(
                "disk usage {:.1}% > {}%; cleaning up",
                percent_used,
                self.max_disk_usage_percent
            );
            self.cleanup_old_events()?;
        }
        Ok(())
    }

    /// Delete the oldest `CLEANUP_BATCH` events and their snapshots.
    pub fn cleanup_old_events(&mut self) -> Result<usize> {
        let oldest = {
            let mut stmt = self.conn.prepare(
                "SELECT id, image_path FROM events ORDER BY timestamp ASC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![CLEANUP_BATCH as i64])?;
            let mut oldest = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let image_path: Option<String> = row.get(1)?;
                oldest.push((id, image_path));
            }
            oldest
        };

        let tx = self.conn.transaction()?;
        for (id, image_path) in &oldest {
            if let Some(image_path) = image_path {
                let full_path = self.images_dir.join(image_path);
                if full_path.exists() {
                    if let Err(err) = std::fs::remove_file(&full_path) {
                        log::error!("failed to delete {}: {}", full_path.display(), err);
                    }
                }
            }
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        log::info!("deleted {} old events", oldest.len());
        Ok(oldest.len())
    }
}

impl EventStore for SqliteEventStore {
    fn save(&mut self, event: &SpeedEvent) -> Result<PathBuf> {
        let file_name = snapshot_file_name(event.timestamp, event.speed_kmh)?;
        let file_path = self.images_dir.join(&file_name);
        let jpeg = event.frame.to_jpeg(SNAPSHOT_JPEG_QUALITY)?;
        std::fs::write(&file_path, jpeg)
            .with_context(|| format!("write snapshot {}", file_path.display()))?;

        self.conn.execute(
            r#"
            INSERT INTO events(timestamp, speed, image_path, object_id)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.timestamp,
                event.speed_kmh,
                file_name,
                event.object_id as i64
            ],
        )?;

        if let Err(err) = self.check_disk_usage() {
            log::error!("error checking disk usage: {:#}", err);
        }
        Ok(file_path)
    }

    fn events(&self, limit: usize, offset: usize) -> Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, timestamp, speed, image_path, object_id FROM events
            ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let mut rows = stmt.query(params![limit as i64, offset as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StoredEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                speed_kmh: row.get(2)?,
                image_path: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                object_id: row.get(4)?,
            });
        }
        Ok(out)
    }
}

/// `YYYY-MM-DD_HH-MM-SS_<speed>kmh.jpg` in local time, speed truncated to whole km/h.
pub fn snapshot_file_name(timestamp: f64, speed_kmh: f64) -> Result<String> {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    let local = Local
        .timestamp_opt(secs, nanos)
        .earliest()
        .ok_or_else(|| anyhow!("timestamp {} out of range", timestamp))?;
    Ok(format!(
        "{}_{}kmh.jpg",
        local.format("%Y-%m-%d_%H-%M-%S"),
        speed_kmh as i64
    ))
}

#[cfg(unix)]
pub fn disk_usage_percent(path: &Path) -> Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("path {} contains NUL", path.display()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(anyhow!(
            "statvfs {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        ));
    }
    let block = stat.f_frsize as f64;
    let total = stat.f_blocks as f64 * block;
    let used = (stat.f_blocks as f64 - stat.f_bfree as f64) * block;
    if total <= 0.0 {
        return Ok(0.0);
    }
    Ok(used / total * 100.0)
}

#[cfg(not(unix))]
pub fn disk_usage_percent(_path: &Path) -> Result<f64> {
    Ok(0.0)
}
