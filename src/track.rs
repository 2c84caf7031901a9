//! Centroid tracker.
//!
//! Keeps identities stable across frames by greedily pairing each known
//! object with its nearest detection. Matching is intentionally approximate:
//! objects are visited in ascending order of their closest detection, each
//! claims its precomputed nearest detection, and a claim is skipped when
//! either side was already taken this round. There is no backtracking, so an
//! object whose nearest detection was claimed first goes unmatched for the
//! frame even if another free detection is nearby. Brief mismatches are
//! absorbed by the disappearance grace period.
//!
//! Leftovers are resolved by comparing counts. When objects are at least as
//! many as detections, unmatched objects age and unclaimed detections are
//! ignored; otherwise unclaimed detections become new identities and unmatched
//! objects keep their counters untouched for this frame.

use std::collections::BTreeMap;

use crate::geometry::{BoundingBox, Point};

/// Identity -> current centroid, iterated in ascending id order.
pub type TrackedObjects = BTreeMap<u64, Point>;

pub const DEFAULT_MAX_DISAPPEARED: u32 = 40;

pub struct CentroidTracker {
    next_object_id: u64,
    objects: TrackedObjects,
    disappeared: BTreeMap<u64, u32>,
    max_disappeared: u32,
}

impl CentroidTracker {
    pub fn new(max_disappeared: u32) -> Self {
        Self {
            next_object_id: 0,
            objects: TrackedObjects::new(),
            disappeared: BTreeMap::new(),
            max_disappeared,
        }
    }

    pub fn objects(&self) -> &TrackedObjects {
        &self.objects
    }

    /// Consecutive frames `id` has gone unmatched, if it is still tracked.
    pub fn disappeared(&self, id: u64) -> Option<u32> {
        self.disappeared.get(&id).copied()
    }

    pub fn max_disappeared(&self) -> u32 {
        self.max_disappeared
    }

    /// Takes effect on the next `update`.
    pub fn set_max_disappeared(&mut self, max_disappeared: u32) {
        self.max_disappeared = max_disappeared;
    }

    fn register(&mut self, centroid: Point) {
        let id = self.next_object_id;
        self.objects.insert(id, centroid);
        self.disappeared.insert(id, 0);
        self.next_object_id += 1;
        log::debug!("tracker: registered object {} at {:?}", id, centroid);
    }

    fn deregister(&mut self, id: u64) {
        self.objects.remove(&id);
        self.disappeared.remove(&id);
        log::debug!("tracker: deregistered object {}", id);
    }

    fn mark_missing(&mut self, id: u64) {
        let Some(count) = self.disappeared.get_mut(&id) else {
            return;
        };
        *count += 1;
        if *count > self.max_disappeared {
            self.deregister(id);
        }
    }

    /// Advance one frame with this frame's detections.
    pub fn update(&mut self, boxes: &[BoundingBox]) -> &TrackedObjects {
        if boxes.is_empty() {
            let ids: Vec<u64> = self.disappeared.keys().copied().collect();
            for id in ids {
                self.mark_missing(id);
            }
            return &self.objects;
        }

        let inputs: Vec<Point> = boxes.iter().map(BoundingBox::centroid).collect();

        if self.objects.is_empty() {
            for centroid in inputs {
                self.register(centroid);
            }
            return &self.objects;
        }

        let object_ids: Vec<u64> = self.objects.keys().copied().collect();
        let object_centroids: Vec<Point> = self.objects.values().copied().collect();

        let distances: Vec<Vec<f64>> = object_centroids
            .iter()
            .map(|&existing| inputs.iter().map(|&c| existing.distance(c)).collect())
            .collect();

        // Row visiting order: ascending by each row's minimum distance.
        let row_min: Vec<(f64, usize)> = distances
            .iter()
            .map(|row| argmin(row).map(|col| (row[col], col)).unwrap_or((f64::MAX, 0)))
            .collect();
        let mut rows: Vec<usize> = (0..distances.len()).collect();
        rows.sort_by(|&a, &b| row_min[a].0.total_cmp(&row_min[b].0));

        let mut used_rows = vec![false; object_ids.len()];
        let mut used_cols = vec![false; inputs.len()];

        for row in rows {
            let col = row_min[row].1;
            if used_rows[row] || used_cols[col] {
                continue;
            }
            let id = object_ids[row];
            self.objects.insert(id, inputs[col]);
            self.disappeared.insert(id, 0);
            used_rows[row] = true;
            used_cols[col] = true;
        }

        // Only one side's leftovers are handled per frame: with at least as many
        // objects as detections, unmatched objects age and leftover detections are
        // dropped; otherwise leftover detections register and nobody ages.
        if object_ids.len() >= inputs.len() {
            for (row, used) in used_rows.iter().enumerate() {
                if !used {
                    self.mark_missing(object_ids[row]);
                }
            }
        } else {
            for (col, used) in used_cols.iter().enumerate() {
                if !used {
                    self.register(inputs[col]);
                }
            }
        }

        &self.objects
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DISAPPEARED)
    }
}

/// Index of the first minimum.
fn argmin(row: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &value) in row.iter().enumerate() {
        match best {
            Some(b) if row[b] <= value => {}
            _ => best = Some(i),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_at(x: i32, y: i32) -> BoundingBox {
        BoundingBox::new(x - 5, y - 5, x + 5, y + 5)
    }

    #[test]
    fn registers_new_detections_with_ascending_ids() {
        let mut tracker = CentroidTracker::new(5);
        let objects = tracker.update(&[box_at(10, 10), box_at(100, 10), box_at(200, 10)]);
        let ids: Vec<u64> = objects.keys().copied().collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(objects[&1], Point::new(100, 10));
    }

    #[test]
    fn follows_nearest_detection() {
        let mut tracker = CentroidTracker::new(5);
        tracker.update(&[box_at(10, 10), box_at(100, 10)]);
        let objects = tracker.update(&[box_at(104, 12), box_at(13, 11)]);
        assert_eq!(objects[&0], Point::new(13, 11));
        assert_eq!(objects[&1], Point::new(104, 12));
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn empty_update_ages_then_deregisters() {
        let mut tracker = CentroidTracker::new(2);
        tracker.update(&[box_at(10, 10)]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.disappeared(0), Some(2));
        assert!(tracker.objects().contains_key(&0));
        tracker.update(&[]);
        assert!(tracker.objects().is_empty());
        assert_eq!(tracker.disappeared(0), None);
    }

    #[test]
    fn deregistered_ids_are_never_reused() {
        let mut tracker = CentroidTracker::new(0);
        tracker.update(&[box_at(10, 10)]);
        tracker.update(&[]);
        assert!(tracker.objects().is_empty());
        let objects = tracker.update(&[box_at(10, 10)]);
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn match_resets_disappearance_counter() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[box_at(10, 10)]);
        tracker.update(&[]);
        tracker.update(&[]);
        tracker.update(&[box_at(12, 10)]);
        assert_eq!(tracker.disappeared(0), Some(0));
    }

    #[test]
    fn extra_detection_registers_new_identity() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[box_at(10, 10)]);
        let objects = tracker.update(&[box_at(11, 10), box_at(300, 300)]);
        assert_eq!(objects[&0], Point::new(11, 10));
        assert_eq!(objects[&1], Point::new(300, 300));
    }

    #[test]
    fn missing_detection_ages_only_the_unmatched_object() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[box_at(10, 10), box_at(200, 10)]);
        tracker.update(&[box_at(12, 10)]);
        assert_eq!(tracker.disappeared(0), Some(0));
        assert_eq!(tracker.disappeared(1), Some(1));
        assert_eq!(tracker.objects()[&1], Point::new(200, 10));
    }

    #[test]
    fn greedy_matching_can_swap_identities_on_crossover() {
        // Two objects approach each other head-on and pass between frames.
        // Object 0 at x=100 moves right to x=130; object 1 at x=140 moves left
        // to x=110. Each new centroid is closer to the other object's previous
        // position, so greedy nearest-distance assignment swaps the labels.
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[box_at(100, 50), box_at(140, 50)]);
        let objects = tracker.update(&[box_at(130, 50), box_at(110, 50)]);
        assert_eq!(objects[&0], Point::new(110, 50));
        assert_eq!(objects[&1], Point::new(130, 50));
    }

    #[test]
    fn claimed_nearest_detection_leaves_object_unmatched() {
        // Both objects are nearest to the detection at x=50. Object 1 is closer
        // and claims it first; object 0 does not fall back to the free detection
        // at x=0. With as many objects as detections, that detection is dropped.
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[box_at(30, 10), box_at(48, 10)]);
        let objects = tracker.update(&[box_at(50, 10), box_at(0, 10)]);
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(objects[&1], Point::new(50, 10));
        assert_eq!(objects[&0], Point::new(30, 10));
        assert_eq!(tracker.disappeared(0), Some(1));
    }

    #[test]
    fn surplus_detections_register_without_aging_unmatched_objects() {
        let mut tracker = CentroidTracker::new(0);
        tracker.update(&[box_at(30, 10), box_at(48, 10)]);
        let objects = tracker.update(&[box_at(50, 10), box_at(0, 10), box_at(300, 300)]);
        // Object 0 lost its nearest detection to object 1 but is not aged,
        // even with no grace period; the two unclaimed detections register.
        assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(objects[&0], Point::new(30, 10));
        assert_eq!(objects[&2], Point::new(0, 10));
        assert_eq!(objects[&3], Point::new(300, 300));
        assert_eq!(tracker.disappeared(0), Some(0));
    }
}
