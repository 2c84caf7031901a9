//! GStreamer pipeline source.
//!
//! Runs an arbitrary launch description ending in an `appsink` that emits
//! packed RGB, e.g. the libcamera pipelines built by `acquire`:
//!
//! ```text
//! libcamerasrc ! videoconvert ! video/x-raw, format=RGB ! appsink drop=1 sync=0
//! ```

use anyhow::{anyhow, bail, Context, Result};
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::{now_epoch_s, Frame};

pub struct GstreamerSource {
    description: String,
    target_fps: u32,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(description: &str, target_fps: u32) -> Self {
        Self {
            description: description.to_string(),
            target_fps,
            pipeline: None,
            appsink: None,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            2_000
        } else {
            (1000 / self.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for GstreamerSource {
    fn open(&mut self) -> Result<()> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(&self.description)
            .with_context(|| format!("build pipeline '{}'", self.description))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("launch description is not a Pipeline"))?;

        let appsink = pipeline
            .iterate_sinks()
            .into_iter()
            .filter_map(Result::ok)
            .find_map(|element| element.downcast::<gstreamer_app::AppSink>().ok())
            .context("pipeline has no appsink")?;
        appsink.set_max_buffers(1);

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow::Error::new(err).context("set pipeline to Playing"));
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("GstreamerSource: connected to {}", self.description);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            bail!("{}", err);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let appsink = self.appsink.as_ref().context("pipeline not connected")?;
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            return Ok(None);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(pixels, width, height, now_epoch_s()).map(Some)
    }

    fn release(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerSource: failed to stop pipeline: {}", err);
            }
            log::info!("GstreamerSource: released {}", self.description);
        }
    }

    fn source_id(&self) -> &str {
        &self.description
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source_id: self.description.clone(),
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }

    Ok((pixels, width, height))
}
