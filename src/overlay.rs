//! Annotation overlay: boxes, centroid markers, labels and reference lines.
//!
//! Labels use a built-in 5x7 bitmap font covering the characters the overlay
//! prints (digits, `ID`, `km/h`, `.`, `-`, space). Unknown characters render
//! as blanks.

use crate::frame::{Frame, Rgb};
use crate::geometry::{BoundingBox, Point, ReferenceLine};

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_SPACING: i32 = 1;

/// Rows top to bottom, bit 4 is the leftmost column.
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'k' => [0x10, 0x10, 0x12, 0x14, 0x18, 0x14, 0x12],
        'm' => [0x00, 0x00, 0x1A, 0x15, 0x15, 0x11, 0x11],
        'h' => [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0x00; 7],
    }
}

/// Draw `text` with its top-left corner at `origin`, each font pixel scaled to `scale` pixels.
pub fn draw_text(frame: &mut Frame, text: &str, origin: (i32, i32), color: Rgb, scale: i32) {
    let scale = scale.max(1);
    let mut pen_x = origin.0;
    for c in text.chars() {
        let rows = glyph(c);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let x = pen_x + col * scale;
                let y = origin.1 + row as i32 * scale;
                frame.fill_rect((x, y), (x + scale - 1, y + scale - 1), color);
            }
        }
        pen_x += (GLYPH_WIDTH + GLYPH_SPACING) * scale;
    }
}

/// Rendered height of one text line at `scale`.
pub fn text_height(scale: i32) -> i32 {
    GLYPH_HEIGHT * scale.max(1)
}

pub fn draw_box(frame: &mut Frame, bbox: &BoundingBox, color: Rgb) {
    frame.draw_rect(
        (bbox.x_min, bbox.y_min),
        (bbox.x_max - 1, bbox.y_max - 1),
        color,
        2,
    );
}

pub fn draw_reference_line(frame: &mut Frame, line: &ReferenceLine, color: Rgb) {
    frame.draw_line((line.x1, line.y1), (line.x2, line.y2), color, 2);
}

pub fn draw_centroid(frame: &mut Frame, id: u64, centroid: Point, color: Rgb) {
    frame.fill_circle((centroid.x, centroid.y), 4, color);
    draw_text(
        frame,
        &format!("ID {id}"),
        (centroid.x - 10, centroid.y - 10 - text_height(1)),
        color,
        1,
    );
}

pub fn draw_speed(frame: &mut Frame, centroid: Point, speed_kmh: f64, color: Rgb) {
    draw_text(
        frame,
        &format!("{speed_kmh:.1} km/h"),
        (centroid.x, centroid.y - 30 - text_height(2)),
        color,
        2,
    );
}
