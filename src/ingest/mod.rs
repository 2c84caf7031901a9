//! Frame ingestion sources.
//!
//! This module provides different origins for raw frames:
//! - libcamera/GStreamer pipelines (feature: camera-gstreamer)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//! - Local video files, looped forever (feature: ingest-file-ffmpeg)
//! - Synthetic scenes (`stub://`) for tests and demos
//!
//! Every origin implements `FrameSource`. Which one is used is decided once,
//! by `acquire::acquire`, which walks an ordered list of strategies until a
//! source yields a verified live frame. The rest of the pipeline never
//! inspects the concrete source type.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub mod acquire;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "camera-gstreamer")]
pub mod gstreamer;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use acquire::{acquire, AcquiredSource, AcquisitionError, SourceBackends, SystemBackends};
pub use file::{ClipDecoder, LoopingFileSource, MemoryClip};
#[cfg(feature = "camera-gstreamer")]
pub use gstreamer::GstreamerSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A video origin with one active backend connection.
///
/// Sources are driven from a single worker thread; `Send` lets the worker own them.
pub trait FrameSource: Send {
    /// Connect to the backend. Success alone does not prove frames will flow.
    fn open(&mut self) -> Result<()>;

    /// Pull the next frame.
    ///
    /// `Ok(None)` means no frame is available right now; callers back off and retry.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Disconnect and free backend resources. Safe to call more than once.
    fn release(&mut self);

    /// Identifier of the origin actually in use (device path, file, pipeline).
    fn source_id(&self) -> &str;

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

impl FrameSource for Box<dyn FrameSource> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source_id: String,
}

/// Releases frames no faster than a target rate.
///
/// Used by sources that could otherwise produce frames as fast as they are
/// pulled (synthetic scenes, file playback).
#[derive(Clone, Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: f64) -> Self {
        let interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last: None,
        }
    }

    /// True (and the clock advances) when the next frame is due.
    pub(crate) fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

/// File extensions handled as looping video files.
pub const VIDEO_FILE_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mkv"];

pub fn is_video_file(source: &str) -> bool {
    std::path::Path::new(source)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            VIDEO_FILE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Canonical device path for a numeric index or `/dev/video*` path; `None` otherwise.
pub fn device_path(source: &str) -> Option<String> {
    let source = source.trim();
    if let Ok(index) = source.parse::<u32>() {
        return Some(format!("/dev/video{index}"));
    }
    if source.starts_with("/dev/video") {
        return Some(source.to_string());
    }
    None
}
