//! Pixel-space geometry shared by the segmenter, tracker and measurer.

use serde::{Deserialize, Serialize};

/// Integer point in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned box. `x_max`/`y_max` are exclusive (`x_min + width`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BoundingBox {
    pub const fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Midpoint of the extents, truncated toward zero.
    pub fn centroid(&self) -> Point {
        Point::new(
            ((self.x_min + self.x_max) as f64 / 2.0) as i32,
            ((self.y_min + self.y_max) as f64 / 2.0) as i32,
        )
    }

    pub fn area(&self) -> i64 {
        (self.x_max - self.x_min) as i64 * (self.y_max - self.y_min) as i64
    }
}

/// Virtual reference segment `(x1, y1) -> (x2, y2)`.
///
/// Serialized as a four-element array to match the configuration format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct ReferenceLine {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl ReferenceLine {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn start(&self) -> Point {
        Point::new(self.x1, self.y1)
    }

    pub fn end(&self) -> Point {
        Point::new(self.x2, self.y2)
    }

    /// Whether the movement `from -> to` strictly crosses this line.
    pub fn crossed_by(&self, from: Point, to: Point) -> bool {
        segments_intersect(from, to, self.start(), self.end())
    }
}

impl From<[i32; 4]> for ReferenceLine {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<ReferenceLine> for [i32; 4] {
    fn from(line: ReferenceLine) -> Self {
        [line.x1, line.y1, line.x2, line.y2]
    }
}

/// True when `a, b, c` are in strictly counter-clockwise order.
fn ccw(a: Point, b: Point, c: Point) -> bool {
    let lhs = (c.y - a.y) as i64 * (b.x - a.x) as i64;
    let rhs = (b.y - a.y) as i64 * (c.x - a.x) as i64;
    lhs > rhs
}

/// Strict segment intersection from four orientation tests.
///
/// Collinear and touching configurations are not special-cased, so a
/// zero-length segment never intersects anything.
pub fn segments_intersect(a: Point, b: Point, c: Point, d: Point) -> bool {
    ccw(a, c, d) != ccw(b, c, d) && ccw(a, b, c) != ccw(a, b, d)
}
