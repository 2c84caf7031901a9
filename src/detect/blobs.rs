//! Binary mask post-processing: threshold, dilation and blob extraction.
//!
//! Blobs are outer regions only. Foreground is 8-connected and background
//! 4-connected; a region sitting in a hole of another region (background not
//! reachable from the frame edge) is part of that region's object and is not
//! reported on its own.

use crate::geometry::BoundingBox;

/// Connected foreground region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub bbox: BoundingBox,
    /// Number of foreground pixels in the region.
    pub area: u64,
}

/// Binarize: values strictly greater than `threshold` become 255, the rest 0.
pub fn threshold(mask: &mut [u8], threshold: u8) {
    for value in mask.iter_mut() {
        *value = if *value > threshold { 255 } else { 0 };
    }
}

/// Dilate with a 3x3 rectangular structuring element, `iterations` times.
pub fn dilate(mask: &[u8], width: u32, height: u32, iterations: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut current = mask.to_vec();
    if w == 0 || h == 0 {
        return current;
    }
    for _ in 0..iterations {
        let mut next = vec![0u8; current.len()];
        for y in 0..h {
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(h - 1);
            for x in 0..w {
                let x0 = x.saturating_sub(1);
                let x1 = (x + 1).min(w - 1);
                let mut hit = 0u8;
                'window: for ny in y0..=y1 {
                    for nx in x0..=x1 {
                        if current[ny * w + nx] != 0 {
                            hit = 255;
                            break 'window;
                        }
                    }
                }
                next[y * w + x] = hit;
            }
        }
        current = next;
    }
    current
}

/// Extract outer 8-connected foreground regions in raster order of their first pixel.
pub fn find_blobs(mask: &[u8], width: u32, height: u32) -> Vec<Blob> {
    let w = width as usize;
    let h = height as usize;
    let outside = outside_background(mask, w, h);
    let mut visited = vec![false; mask.len()];
    let mut blobs = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..mask.len() {
        if mask[start] == 0 || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0;
        let mut max_y = 0;
        let mut area = 0u64;
        let mut outer = false;

        while let Some(index) = stack.pop() {
            let x = index % w;
            let y = index / w;
            area += 1;
            outer = outer
                || x == 0
                || y == 0
                || x + 1 == w
                || y + 1 == h
                || [index - 1, index + 1, index - w, index + w]
                    .into_iter()
                    .any(|n| outside[n]);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let neighbor = ny * w + nx;
                    if mask[neighbor] != 0 && !visited[neighbor] {
                        visited[neighbor] = true;
                        stack.push(neighbor);
                    }
                }
            }
        }

        if !outer {
            continue;
        }
        blobs.push(Blob {
            bbox: BoundingBox::new(
                min_x as i32,
                min_y as i32,
                max_x as i32 + 1,
                max_y as i32 + 1,
            ),
            area,
        });
    }

    blobs
}

/// Background pixels 4-connected to the frame edge.
fn outside_background(mask: &[u8], w: usize, h: usize) -> Vec<bool> {
    let mut outside = vec![false; mask.len()];
    if w == 0 || h == 0 {
        return outside;
    }
    let mut stack: Vec<usize> = (0..w)
        .flat_map(|x| [x, (h - 1) * w + x])
        .chain((0..h).flat_map(|y| [y * w, y * w + w - 1]))
        .filter(|&index| mask[index] == 0)
        .collect();
    for &index in &stack {
        outside[index] = true;
    }
    while let Some(index) = stack.pop() {
        let x = index % w;
        let y = index / w;
        let mut neighbors = Vec::with_capacity(4);
        if x > 0 {
            neighbors.push(index - 1);
        }
        if x + 1 < w {
            neighbors.push(index + 1);
        }
        if y > 0 {
            neighbors.push(index - w);
        }
        if y + 1 < h {
            neighbors.push(index + w);
        }
        for neighbor in neighbors {
            if mask[neighbor] == 0 && !outside[neighbor] {
                outside[neighbor] = true;
                stack.push(neighbor);
            }
        }
    }
    outside
}
