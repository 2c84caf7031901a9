//! Source acquisition.
//!
//! Walks an ordered list of strategies and keeps the first source that opens
//! AND delivers a non-empty frame:
//! 1. libcamera pipeline at the configured resolution and rate
//! 2. reduced libcamera pipeline (camera defaults)
//! 3. the configured source identifier
//! 4. every other `/dev/video*` device, in index order
//!
//! The libcamera strategies only run when the `libcamerasrc` element is
//! installed. Every failed attempt is released before the next one starts.

use anyhow::{bail, Result};
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use super::{device_path, is_video_file, FrameSource, SyntheticSource};
use crate::config::CameraSettings;
use crate::frame::Frame;

const LIBCAMERA_ELEMENT: &str = "libcamerasrc";
/// Reads allowed for a freshly opened source to produce its first frame.
const VERIFY_READS: u32 = 5;
const VERIFY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    LibcameraPipeline,
    LibcameraReduced,
    Configured,
    Discovered,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::LibcameraPipeline => "libcamera pipeline",
            Strategy::LibcameraReduced => "reduced libcamera pipeline",
            Strategy::Configured => "configured source",
            Strategy::Discovered => "discovered device",
        };
        f.write_str(name)
    }
}

/// Construction of concrete sources. Implementations return unopened sources.
pub trait SourceBackends {
    /// True when the named GStreamer element is installed.
    fn plugin_available(&self, element: &str) -> bool;

    fn pipeline_source(
        &self,
        description: &str,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameSource>>;

    /// Source for a literal identifier: `stub://`, video file, index or device path.
    fn generic_source(&self, source: &str, settings: &CameraSettings)
        -> Result<Box<dyn FrameSource>>;

    /// Video device nodes present on the system, in index order.
    fn list_devices(&self) -> Vec<String>;
}

/// The source chosen by `acquire`.
pub struct AcquiredSource {
    pub source: Box<dyn FrameSource>,
    /// Identifier actually in use. Device indices are reported as their `/dev/video*`
    /// path; differs from the configured one after discovery.
    pub source_id: String,
    pub strategy: Strategy,
    /// The frame that proved the source live.
    pub first_frame: Frame,
}

impl fmt::Debug for AcquiredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredSource")
            .field("source_id", &self.source_id)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: Strategy,
    pub target: String,
    pub error: String,
}

/// Every strategy failed.
#[derive(Clone, Debug)]
pub struct AcquisitionError {
    pub attempts: Vec<Attempt>,
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no usable video source after {} attempt(s)", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(
                f,
                "; {} '{}': {}",
                attempt.strategy, attempt.target, attempt.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for AcquisitionError {}

pub fn libcamera_pipeline(settings: &CameraSettings) -> String {
    format!(
        "libcamerasrc ! video/x-raw, width={}, height={}, framerate={}/1 ! videoconvert ! \
         video/x-raw, format=RGB ! appsink drop=1 sync=0",
        settings.width, settings.height, settings.fps
    )
}

pub fn reduced_libcamera_pipeline() -> String {
    "libcamerasrc ! videoconvert ! video/x-raw, format=RGB ! appsink drop=1 sync=0".to_string()
}

/// Acquire a live source for `settings`.
pub fn acquire<B: SourceBackends + ?Sized>(
    settings: &CameraSettings,
    backends: &B,
) -> Result<AcquiredSource, AcquisitionError> {
    let mut attempts = Vec::new();

    if backends.plugin_available(LIBCAMERA_ELEMENT) {
        for (strategy, description) in [
            (Strategy::LibcameraPipeline, libcamera_pipeline(settings)),
            (Strategy::LibcameraReduced, reduced_libcamera_pipeline()),
        ] {
            let built = backends.pipeline_source(&description, settings);
            match try_source(strategy, &description, built, &mut attempts) {
                Some(acquired) => return Ok(acquired),
                None => continue,
            }
        }
    } else {
        log::info!("{} not available; skipping libcamera pipelines", LIBCAMERA_ELEMENT);
    }

    let configured = settings.source.trim();
    let built = backends.generic_source(configured, settings);
    if let Some(acquired) = try_source(Strategy::Configured, configured, built, &mut attempts) {
        return Ok(acquired);
    }

    let tried_device = device_path(configured);
    for device in backends.list_devices() {
        if tried_device.as_deref() == Some(device.as_str()) {
            continue;
        }
        let built = backends.generic_source(&device, settings);
        if let Some(acquired) = try_source(Strategy::Discovered, &device, built, &mut attempts) {
            log::warn!(
                "configured source '{}' unavailable; using discovered device {}",
                configured,
                device
            );
            return Ok(acquired);
        }
    }

    Err(AcquisitionError { attempts })
}

fn try_source(
    strategy: Strategy,
    target: &str,
    built: Result<Box<dyn FrameSource>>,
    attempts: &mut Vec<Attempt>,
) -> Option<AcquiredSource> {
    log::info!("trying {} '{}'", strategy, target);
    let outcome = built.and_then(|mut source| match verify(&mut source) {
        Ok(frame) => Ok((source, frame)),
        Err(err) => {
            source.release();
            Err(err)
        }
    });
    match outcome {
        Ok((source, first_frame)) => {
            log::info!(
                "acquired {} '{}' ({}x{})",
                strategy,
                target,
                first_frame.width,
                first_frame.height
            );
            Some(AcquiredSource {
                source,
                source_id: device_path(target).unwrap_or_else(|| target.to_string()),
                strategy,
                first_frame,
            })
        }
        Err(err) => {
            log::warn!("{} '{}' failed: {:#}", strategy, target, err);
            attempts.push(Attempt {
                strategy,
                target: target.to_string(),
                error: format!("{:#}", err),
            });
            None
        }
    }
}

/// Open `source` and wait briefly for a non-empty frame.
fn verify(source: &mut Box<dyn FrameSource>) -> Result<Frame> {
    source.open()?;
    for attempt in 0..VERIFY_READS {
        if attempt > 0 {
            std::thread::sleep(VERIFY_BACKOFF);
        }
        match source.read()? {
            Some(frame) if !frame.is_empty() => return Ok(frame),
            _ => continue,
        }
    }
    bail!("opened but produced no frame")
}

/// Backends for the host system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBackends;

impl SourceBackends for SystemBackends {
    fn plugin_available(&self, element: &str) -> bool {
        Command::new("gst-inspect-1.0")
            .arg(element)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[allow(unused_variables)]
    fn pipeline_source(
        &self,
        description: &str,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameSource>> {
        #[cfg(feature = "camera-gstreamer")]
        {
            Ok(Box::new(super::GstreamerSource::new(
                description,
                settings.fps,
            )))
        }
        #[cfg(not(feature = "camera-gstreamer"))]
        {
            bail!("GStreamer pipelines require the camera-gstreamer feature")
        }
    }

    fn generic_source(
        &self,
        source: &str,
        settings: &CameraSettings,
    ) -> Result<Box<dyn FrameSource>> {
        if source.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::new(
                source,
                settings.width,
                settings.height,
                settings.fps,
            )));
        }
        if is_video_file(source) {
            return file_source(source, settings);
        }
        if let Some(device) = device_path(source) {
            return device_source(&device, settings);
        }
        bail!("unrecognized video source '{}'", source)
    }

    fn list_devices(&self) -> Vec<String> {
        list_video_devices(Path::new("/dev"))
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn file_source(path: &str, settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    if !Path::new(path).is_file() {
        bail!("video file {} does not exist", path);
    }
    Ok(Box::new(super::LoopingFileSource::ffmpeg(path, settings.fps)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn file_source(path: &str, _settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    bail!("video file {} requires the ingest-file-ffmpeg feature", path)
}

#[cfg(feature = "ingest-v4l2")]
fn device_source(device: &str, settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(super::V4l2Source::new(super::v4l2::V4l2Config {
        device: device.to_string(),
        target_fps: settings.fps,
        width: settings.width,
        height: settings.height,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn device_source(device: &str, _settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    bail!("video device {} requires the ingest-v4l2 feature", device)
}

/// `videoN` nodes under `dir`, sorted by N.
pub fn list_video_devices(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut devices: Vec<(u32, String)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let index = name.strip_prefix("video")?.parse::<u32>().ok()?;
            Some((index, entry.path().to_string_lossy().into_owned()))
        })
        .collect();
    devices.sort();
    devices.into_iter().map(|(_, path)| path).collect()
}
