//! Frame container and in-place drawing primitives.
//!
//! - `Frame`: one captured RGB24 image plus its capture timestamp.
//! - Drawing helpers used by the annotation overlay (lines, rectangles, dots).
//!
//! Frames are owned by the worker while they move through the pipeline. The
//! reader side only ever receives clones of completed frames.

use anyhow::{anyhow, Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// RGB color triple.
pub type Rgb = [u8; 3];

pub const GREEN: Rgb = [0, 255, 0];
pub const RED: Rgb = [255, 0, 0];
pub const BLUE: Rgb = [0, 0, 255];
pub const YELLOW: Rgb = [255, 255, 0];
pub const WHITE: Rgb = [255, 255, 255];

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB24 pixel data, `width * height * 3` bytes.
    data: Vec<u8>,
    /// Capture wall-clock time in seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Frame {
    /// Wrap raw RGB24 bytes. Fails when the buffer length does not match the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp: f64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
            timestamp,
        })
    }

    /// Black frame of the given size.
    pub fn blank(width: u32, height: u32, timestamp: f64) -> Self {
        let len = (width as usize) * (height as usize) * 3;
        Self {
            width,
            height,
            data: vec![0u8; len],
            timestamp,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// True when the frame carries no pixels (a failed or degenerate read).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = self.offset(x, y);
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Set one pixel. Coordinates outside the frame are ignored.
    pub fn put_pixel(&mut self, x: i32, y: i32, color: Rgb) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let offset = self.offset(x as u32, y as u32);
        self.data[offset..offset + 3].copy_from_slice(&color);
    }

    /// BT.601 luma plane, one byte per pixel.
    pub fn to_gray(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                luma.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Encode as baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode frame as jpeg")?;
        Ok(out)
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + x as usize) * 3
    }

    // ------------------------------------------------------------------------
    // Drawing
    // ------------------------------------------------------------------------

    /// Bresenham line with a square pen of `thickness` pixels.
    ///
    /// The segment is clipped to the frame (plus the pen margin) first, so
    /// endpoints far outside the image cost nothing.
    pub fn draw_line(&mut self, from: (i32, i32), to: (i32, i32), color: Rgb, thickness: u32) {
        let margin = thickness.max(1) as i64;
        let bounds = (
            (-margin, -margin),
            (self.width as i64 - 1 + margin, self.height as i64 - 1 + margin),
        );
        let Some(((mut x0, mut y0), (x1, y1))) = clip_segment(from, to, bounds) else {
            return;
        };
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.stamp(x0 as i32, y0 as i32, color, thickness);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    /// Rectangle outline from `(x_min, y_min)` to `(x_max, y_max)` inclusive.
    pub fn draw_rect(&mut self, min: (i32, i32), max: (i32, i32), color: Rgb, thickness: u32) {
        let (x0, y0) = min;
        let (x1, y1) = max;
        self.draw_line((x0, y0), (x1, y0), color, thickness);
        self.draw_line((x1, y0), (x1, y1), color, thickness);
        self.draw_line((x1, y1), (x0, y1), color, thickness);
        self.draw_line((x0, y1), (x0, y0), color, thickness);
    }

    /// Filled disc.
    pub fn fill_circle(&mut self, center: (i32, i32), radius: i32, color: Rgb) {
        let (cx, cy) = center;
        let r2 = radius * radius;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= r2 {
                    self.put_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    /// Filled axis-aligned rectangle, inclusive bounds.
    pub fn fill_rect(&mut self, min: (i32, i32), max: (i32, i32), color: Rgb) {
        let x_hi = max.0.min(self.width.saturating_sub(1).min(i32::MAX as u32) as i32);
        let y_hi = max.1.min(self.height.saturating_sub(1).min(i32::MAX as u32) as i32);
        for y in min.1.max(0)..=y_hi {
            for x in min.0.max(0)..=x_hi {
                self.put_pixel(x, y, color);
            }
        }
    }

    fn stamp(&mut self, x: i32, y: i32, color: Rgb, thickness: u32) {
        let thickness = thickness.max(1) as i32;
        let lo = -(thickness - 1) / 2;
        let hi = thickness / 2;
        for oy in lo..=hi {
            for ox in lo..=hi {
                self.put_pixel(x + ox, y + oy, color);
            }
        }
    }
}

/// Liang-Barsky clip of `from -> to` against the inclusive box `bounds`.
fn clip_segment(
    from: (i32, i32),
    to: (i32, i32),
    bounds: ((i64, i64), (i64, i64)),
) -> Option<((i64, i64), (i64, i64))> {
    let ((min_x, min_y), (max_x, max_y)) = bounds;
    let (x0, y0) = (from.0 as f64, from.1 as f64);
    let dx = to.0 as f64 - x0;
    let dy = to.1 as f64 - y0;
    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in [
        (-dx, x0 - min_x as f64),
        (dx, max_x as f64 - x0),
        (-dy, y0 - min_y as f64),
        (dy, max_y as f64 - y0),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    let at = |t: f64| ((x0 + t * dx).round() as i64, (y0 + t * dy).round() as i64);
    Some((at(t0), at(t1)))
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_epoch_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 11], 2, 2, 0.0).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2, 0.0).is_ok());
    }

    #[test]
    fn put_pixel_ignores_out_of_bounds() {
        let mut frame = Frame::blank(4, 4, 0.0);
        frame.put_pixel(-1, 0, WHITE);
        frame.put_pixel(4, 0, WHITE);
        frame.put_pixel(1, 2, WHITE);
        assert_eq!(frame.pixel(1, 2), Some(WHITE));
        assert_eq!(frame.data().iter().filter(|&&b| b == 255).count(), 3);
    }

    #[test]
    fn gray_conversion_uses_luma_weights() {
        let frame = Frame::new(vec![255, 255, 255, 255, 0, 0], 2, 1, 0.0).unwrap();
        assert_eq!(frame.to_gray(), vec![255, 76]);
    }

    #[test]
    fn horizontal_line_covers_every_column() {
        let mut frame = Frame::blank(10, 3, 0.0);
        frame.draw_line((0, 1), (9, 1), RED, 1);
        for x in 0..10 {
            assert_eq!(frame.pixel(x, 1), Some(RED));
        }
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
    }

    #[test]
    fn line_far_outside_frame_is_clipped() {
        let mut frame = Frame::blank(64, 48, 0.0);
        frame.draw_line((-2_000_000_000, 10), (2_000_000_000, 10), RED, 2);
        for x in 0..64 {
            assert_eq!(frame.pixel(x, 10), Some(RED));
        }
        frame.draw_line((i32::MIN, i32::MIN), (i32::MAX, i32::MIN), RED, 1);
        assert_eq!(frame.pixel(5, 0), Some([0, 0, 0]));
        frame.draw_line((i32::MAX, i32::MAX), (i32::MIN, i32::MIN), RED, 1);
        assert_eq!(frame.pixel(20, 20), Some(RED));
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() -> Result<()> {
        let frame = Frame::blank(16, 16, 0.0);
        let jpeg = frame.to_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
