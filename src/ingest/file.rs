//! Local file frame source.
//!
//! `LoopingFileSource` plays a local video file as if it were a live camera:
//! - Frames are paced to the clip's frame rate and stamped with wall-clock time
//! - End-of-stream rewinds to the first frame and retries the read once, so
//!   downstream stages never observe the end of the file
//!
//! Decoding is delegated to a `ClipDecoder` (FFmpeg behind `ingest-file-ffmpeg`,
//! `MemoryClip` for in-memory clips).

use anyhow::{anyhow, Result};

use super::{FrameSource, Pacer, SourceStats};
use crate::frame::{now_epoch_s, Frame};

/// Sequential decoder over a finite clip.
pub trait ClipDecoder: Send {
    fn open(&mut self) -> Result<()>;

    /// Next decoded frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Native frame rate of the clip, if known.
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    fn close(&mut self) {}
}

pub struct LoopingFileSource {
    path: String,
    decoder: Box<dyn ClipDecoder>,
    looping: bool,
    pacer: Pacer,
    fallback_fps: u32,
    frame_count: u64,
    rewinds: u64,
    last_error: Option<String>,
}

impl LoopingFileSource {
    pub fn new(path: &str, decoder: Box<dyn ClipDecoder>, fallback_fps: u32) -> Self {
        Self {
            path: path.to_string(),
            decoder,
            looping: true,
            pacer: Pacer::new(fallback_fps as f64),
            fallback_fps,
            frame_count: 0,
            rewinds: 0,
            last_error: None,
        }
    }

    /// Open `path` with the FFmpeg decoder.
    #[cfg(feature = "ingest-file-ffmpeg")]
    pub fn ffmpeg(path: &str, fallback_fps: u32) -> Result<Self> {
        let decoder = super::file_ffmpeg::FfmpegClip::new(path)?;
        Ok(Self::new(path, Box::new(decoder), fallback_fps))
    }

    /// Stop at end of stream instead of rewinding.
    pub fn without_looping(mut self) -> Self {
        self.looping = false;
        self
    }

    /// Number of times the clip has been rewound.
    pub fn rewinds(&self) -> u64 {
        self.rewinds
    }

    fn decode(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.decoder.next_frame()? {
            return Ok(Some(frame));
        }
        if !self.looping {
            return Ok(None);
        }
        self.decoder.rewind()?;
        self.rewinds += 1;
        log::debug!("FileSource: {} rewound (loop {})", self.path, self.rewinds);
        self.decoder.next_frame()
    }
}

impl FrameSource for LoopingFileSource {
    fn open(&mut self) -> Result<()> {
        self.decoder.open()?;
        let fps = self
            .decoder
            .frame_rate()
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.fallback_fps as f64);
        self.pacer = Pacer::new(fps);
        self.last_error = None;
        log::info!("FileSource: connected to {} ({:.1} fps)", self.path, fps);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.pacer.ready() {
            return Ok(None);
        }
        match self.decode() {
            Ok(Some(mut frame)) => {
                frame.timestamp = now_epoch_s();
                self.frame_count += 1;
                self.last_error = None;
                Ok(Some(frame))
            }
            Ok(None) => {
                self.pacer.reset();
                Ok(None)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(anyhow!("read {}: {}", self.path, err))
            }
        }
    }

    fn release(&mut self) {
        self.decoder.close();
        log::info!("FileSource: released {}", self.path);
    }

    fn source_id(&self) -> &str {
        &self.path
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source_id: self.path.clone(),
        }
    }
}

/// In-memory clip, mainly for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct MemoryClip {
    frames: Vec<Frame>,
    position: usize,
    fps: Option<f64>,
}

impl MemoryClip {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            position: 0,
            fps: None,
        }
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }
}

impl ClipDecoder for MemoryClip {
    fn open(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.frames.get(self.position).cloned();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn frame_rate(&self) -> Option<f64> {
        self.fps
    }
}
