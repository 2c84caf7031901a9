//! V4L2 frame source.
//!
//! Captures from a local device node (e.g. /dev/video0) through libv4l memory
//! mapped buffers. RGB3 is requested; devices that only offer YUYV are
//! converted in software.

use anyhow::{anyhow, bail, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::frame::{now_epoch_s, Frame};

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 1280,
            height: 720,
        }
    }
}

/// Capture buffers queued with the driver.
const STREAM_BUFFERS: u32 = 4;
/// Consecutive failed captures before the source reports unhealthy.
const MAX_CAPTURE_ERRORS: u32 = 3;

#[self_referencing]
struct Capture {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// Format the driver actually accepted.
#[derive(Clone, Copy, Debug)]
struct Negotiated {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

pub struct V4l2Source {
    config: V4l2Config,
    capture: Option<Capture>,
    negotiated: Option<Negotiated>,
    frames_captured: u64,
    capture_errors: u32,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            capture: None,
            negotiated: None,
            frames_captured: 0,
            capture_errors: 0,
        }
    }
}

/// Ask for packed RGB at the configured size and rate; keep whatever the driver settles on.
fn negotiate(device: &mut v4l::Device, config: &V4l2Config) -> Result<Negotiated> {
    use v4l::video::Capture as _;

    let mut requested = device
        .format()
        .with_context(|| format!("query format of {}", config.device))?;
    requested.width = config.width;
    requested.height = config.height;
    requested.fourcc = v4l::FourCC::new(b"RGB3");

    let accepted = device.set_format(&requested).or_else(|err| {
        log::debug!("{} rejected RGB3 {}x{}: {}", config.device, config.width, config.height, err);
        device.format()
    })?;

    if config.target_fps > 0 {
        let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
        if let Err(err) = device.set_params(&params) {
            log::debug!("{} ignored {} fps request: {}", config.device, config.target_fps, err);
        }
    }

    let pixel_format = PixelFormat::from_fourcc(&accepted.fourcc.repr).ok_or_else(|| {
        anyhow!(
            "{} only offers unsupported pixel format {}",
            config.device,
            accepted.fourcc
        )
    })?;

    Ok(Negotiated {
        width: accepted.width,
        height: accepted.height,
        pixel_format,
    })
}

impl FrameSource for V4l2Source {
    fn open(&mut self) -> Result<()> {
        self.release();

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open video device {}", self.config.device))?;
        let negotiated = negotiate(&mut device, &self.config)?;

        let capture = CaptureTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    STREAM_BUFFERS,
                )
            },
        }
        .try_build()
        .with_context(|| format!("start streaming from {}", self.config.device))?;

        log::info!(
            "V4l2Source: streaming {} at {}x{} ({:?})",
            self.config.device,
            negotiated.width,
            negotiated.height,
            negotiated.pixel_format
        );
        self.capture = Some(capture);
        self.negotiated = Some(negotiated);
        self.capture_errors = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (Some(capture), Some(negotiated)) = (self.capture.as_mut(), self.negotiated) else {
            bail!("video device {} is not open", self.config.device);
        };
        let captured = capture.with_stream_mut(|stream| {
            let (buf, _meta) = stream
                .next()
                .with_context(|| format!("dequeue buffer from {}", self.config.device))?;
            normalize_to_rgb(buf, negotiated.width, negotiated.height, negotiated.pixel_format)
        });

        let pixels = match captured {
            Ok(pixels) => pixels,
            Err(err) => {
                self.capture_errors += 1;
                return Err(err);
            }
        };
        self.capture_errors = 0;
        self.frames_captured += 1;
        Frame::new(pixels, negotiated.width, negotiated.height, now_epoch_s()).map(Some)
    }

    fn release(&mut self) {
        if self.capture.take().is_some() {
            log::info!("V4l2Source: closed {}", self.config.device);
        }
        self.negotiated = None;
    }

    fn source_id(&self) -> &str {
        &self.config.device
    }

    fn is_healthy(&self) -> bool {
        self.capture.is_some() && self.capture_errors < MAX_CAPTURE_ERRORS
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            source_id: self.config.device.clone(),
        }
    }
}
