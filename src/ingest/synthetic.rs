//! Synthetic frame source (`stub://`).
//!
//! Renders a black road with a white block travelling from the top edge to the
//! bottom edge, followed by an empty gap, forever. Frames are paced to the
//! configured rate and stamped with wall-clock capture time, so the full
//! pipeline can run without camera hardware.

use anyhow::{bail, Result};

use super::{FrameSource, Pacer, SourceStats};
use crate::frame::{now_epoch_s, Frame, WHITE};

/// Frames in one top-to-bottom pass.
const PASS_FRAMES: u64 = 40;
/// Empty frames between passes.
const GAP_FRAMES: u64 = 20;

pub struct SyntheticSource {
    source_id: String,
    width: u32,
    height: u32,
    pacer: Pacer,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(source_id: &str, width: u32, height: u32, fps: u32) -> Self {
        Self {
            source_id: source_id.to_string(),
            width,
            height,
            pacer: Pacer::new(fps as f64),
            frame_count: 0,
            connected: false,
        }
    }

    /// Render scene frame `index` (0-based) at `timestamp`.
    pub fn render(&self, index: u64, timestamp: f64) -> Frame {
        let mut frame = Frame::blank(self.width, self.height, timestamp);
        let phase = index % (PASS_FRAMES + GAP_FRAMES);
        if phase >= PASS_FRAMES {
            return frame;
        }
        let side = (self.height.min(self.width) as i32 / 8).max(4);
        let travel = self.height as i32 + side;
        let top = -side + (travel as i64 * phase as i64 / PASS_FRAMES as i64) as i32;
        let left = self.width as i32 / 2 - side / 2;
        frame.fill_rect((left, top), (left + side - 1, top + side - 1), WHITE);
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("synthetic source {} has zero-sized frames", self.source_id);
        }
        self.connected = true;
        self.pacer.reset();
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.source_id,
            self.width,
            self.height
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            bail!("synthetic source {} is not open", self.source_id);
        }
        if !self.pacer.ready() {
            return Ok(None);
        }
        let frame = self.render(self.frame_count, now_epoch_s());
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: released {}", self.source_id);
        }
        self.connected = false;
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source_id: self.source_id.clone(),
        }
    }
}
