use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::geometry::ReferenceLine;

const DEFAULT_SOURCE: &str = "0";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_REAL_DISTANCE_M: f64 = 5.0;
const DEFAULT_MIN_AREA: u64 = 5000;
const DEFAULT_MAX_DISAPPEARED: u32 = 40;
const DEFAULT_HISTORY: u32 = 500;
const DEFAULT_VAR_THRESHOLD: f32 = 50.0;
const DEFAULT_SPEED_LIMIT_KMH: f64 = 0.0;
const DEFAULT_MAX_DISK_USAGE_PERCENT: f64 = 90.0;
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
/// Reference line endpoints must lie within this many pixels of the origin.
pub const MAX_LINE_COORDINATE: i32 = 100_000;

#[derive(Debug, Deserialize, Default)]
struct SpeedcamConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionUpdate>,
    limits: Option<LimitsConfigFile>,
    storage: Option<StorageConfigFile>,
    notifications: Option<NotificationSettings>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<SourceId>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsConfigFile {
    speed_limit_kmh: Option<f64>,
    max_disk_usage_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

/// Camera source identifier as written in a config file: a device index or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceId {
    Index(u32),
    Name(String),
}

impl SourceId {
    fn into_string(self) -> String {
        match self {
            SourceId::Index(index) => index.to_string(),
            SourceId::Name(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeedcamConfig {
    /// File the configuration was read from, if any. Reloads are written back here.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub limits: LimitsSettings,
    pub storage: StorageSettings,
    pub notifications: NotificationSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSettings {
    /// Literal source: device index, `/dev/videoN`, video file path, or `stub://name`.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        }
    }
}

/// Settings the pipeline accepts while running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub line1: ReferenceLine,
    pub line2: ReferenceLine,
    pub real_distance_meters: f64,
    pub min_area: u64,
    pub max_disappeared: u32,
    pub history: u32,
    pub var_threshold: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            line1: ReferenceLine::default(),
            line2: ReferenceLine::default(),
            real_distance_meters: DEFAULT_REAL_DISTANCE_M,
            min_area: DEFAULT_MIN_AREA,
            max_disappeared: DEFAULT_MAX_DISAPPEARED,
            history: DEFAULT_HISTORY,
            var_threshold: DEFAULT_VAR_THRESHOLD,
        }
    }
}

/// Partial detection settings. Missing keys keep the currently active values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionUpdate {
    pub line1: Option<ReferenceLine>,
    pub line2: Option<ReferenceLine>,
    pub real_distance_meters: Option<f64>,
    pub min_area: Option<u64>,
    pub max_disappeared: Option<u32>,
    pub history: Option<u32>,
    pub var_threshold: Option<f32>,
}

impl DetectionSettings {
    /// Merge `update` over these settings.
    pub fn merged(&self, update: &DetectionUpdate) -> Self {
        Self {
            line1: update.line1.unwrap_or(self.line1),
            line2: update.line2.unwrap_or(self.line2),
            real_distance_meters: update
                .real_distance_meters
                .unwrap_or(self.real_distance_meters),
            min_area: update.min_area.unwrap_or(self.min_area),
            max_disappeared: update.max_disappeared.unwrap_or(self.max_disappeared),
            history: update.history.unwrap_or(self.history),
            var_threshold: update.var_threshold.unwrap_or(self.var_threshold),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.real_distance_meters.is_finite() && self.real_distance_meters > 0.0) {
            return Err(anyhow!("real_distance_meters must be a positive number"));
        }
        if self.history == 0 {
            return Err(anyhow!("history must be greater than zero"));
        }
        if !(self.var_threshold.is_finite() && self.var_threshold > 0.0) {
            return Err(anyhow!("var_threshold must be a positive number"));
        }
        for (name, line) in [("line1", &self.line1), ("line2", &self.line2)] {
            let coords = <[i32; 4]>::from(*line);
            if coords
                .iter()
                .any(|c| !(-MAX_LINE_COORDINATE..=MAX_LINE_COORDINATE).contains(c))
            {
                return Err(anyhow!(
                    "{} coordinates must be within +/-{}",
                    name,
                    MAX_LINE_COORDINATE
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitsSettings {
    /// Notify when a measured speed exceeds this. Zero disables notifications.
    pub speed_limit_kmh: f64,
    /// Storage evicts the oldest events when volume usage exceeds this percentage.
    pub max_disk_usage_percent: f64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            speed_limit_kmh: DEFAULT_SPEED_LIMIT_KMH,
            max_disk_usage_percent: DEFAULT_MAX_DISK_USAGE_PERCENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub telegram: TelegramSettings,
    pub pushover: PushoverSettings,
    pub webhook: WebhookSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushoverSettings {
    pub enabled: bool,
    pub user_key: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
    /// `POST` sends a JSON body; anything else sends a GET with query parameters.
    pub method: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            method: "POST".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSettings {
    pub addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
        }
    }
}

impl SpeedcamConfig {
    /// Load from `SPEEDCAM_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SPEEDCAM_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (or defaults when `None`), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SpeedcamConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.path = path.map(Path::to_path_buf);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SpeedcamConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            source: camera
                .source
                .map(SourceId::into_string)
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            width: camera.width.unwrap_or(DEFAULT_WIDTH),
            height: camera.height.unwrap_or(DEFAULT_HEIGHT),
            fps: camera.fps.unwrap_or(DEFAULT_FPS),
        };
        let detection = DetectionSettings::default().merged(&file.detection.unwrap_or_default());
        let limits = file.limits.unwrap_or_default();
        let limits = LimitsSettings {
            speed_limit_kmh: limits.speed_limit_kmh.unwrap_or(DEFAULT_SPEED_LIMIT_KMH),
            max_disk_usage_percent: limits
                .max_disk_usage_percent
                .unwrap_or(DEFAULT_MAX_DISK_USAGE_PERCENT),
        };
        let storage = StorageSettings {
            data_dir: file
                .storage
                .and_then(|storage| storage.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        };
        let api = ApiSettings {
            addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        };
        Self {
            path: None,
            camera,
            detection,
            limits,
            storage,
            notifications: file.notifications.unwrap_or_default(),
            api,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("SPEEDCAM_SOURCE") {
            if !source.trim().is_empty() {
                self.camera.source = source.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("SPEEDCAM_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("SPEEDCAM_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.storage.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(limit) = std::env::var("SPEEDCAM_SPEED_LIMIT_KMH") {
            self.limits.speed_limit_kmh = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("SPEEDCAM_SPEED_LIMIT_KMH must be a number"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.source.trim().is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(anyhow!("camera width, height and fps must be greater than zero"));
        }
        self.detection.validate()?;
        if !(0.0..=100.0).contains(&self.limits.max_disk_usage_percent) {
            return Err(anyhow!("max_disk_usage_percent must be between 0 and 100"));
        }
        if self.limits.speed_limit_kmh < 0.0 {
            return Err(anyhow!("speed_limit_kmh must not be negative"));
        }
        Ok(())
    }

    /// Persist the active detection settings to the file the configuration was loaded from.
    ///
    /// Only the `[detection]` table is rewritten; every other section keeps what
    /// the file says, so environment overrides never end up on disk.
    /// Returns `Ok(false)` when there is no backing file.
    pub fn save(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let mut table = match std::fs::read_to_string(path) {
            Ok(raw) => raw
                .parse::<toml::Table>()
                .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => {
                return Err(anyhow!(
                    "failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            }
        };
        let detection = toml::Value::try_from(&self.detection)
            .map_err(|e| anyhow!("failed to serialize detection settings: {}", e))?;
        table.insert("detection".to_string(), detection);
        let raw = toml::to_string_pretty(&table)
            .map_err(|e| anyhow!("failed to serialize config: {}", e))?;
        std::fs::write(path, raw)
            .map_err(|e| anyhow!("failed to write config file {}: {}", path.display(), e))?;
        Ok(true)
    }
}

fn read_config_file(path: &Path) -> Result<SpeedcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
