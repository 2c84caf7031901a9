//! Line-crossing speed measurement.
//!
//! For every tracked identity the movement since the previous frame is tested
//! against the entry line and the exit line. An entry crossing opens a
//! `CrossingRecord`; a later exit crossing closes it, computes the speed from
//! the configured physical distance and emits exactly one `SpeedEvent`.
//!
//! "Now" is the capture timestamp carried by the frame.

use std::collections::HashMap;

use crate::frame::{Frame, BLUE, RED, YELLOW};
use crate::geometry::ReferenceLine;
use crate::overlay;
use crate::track::TrackedObjects;

/// Entry-to-exit intervals at or below this many seconds are treated as noise.
pub const MIN_CROSSING_SECS: f64 = 0.1;
const MPS_TO_KMH: f64 = 3.6;

/// Per-identity crossing state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CrossingRecord {
    pub entry_time: Option<f64>,
    pub exit_time: Option<f64>,
    pub speed_kmh: Option<f64>,
}

/// A completed measurement.
#[derive(Clone, Debug)]
pub struct SpeedEvent {
    pub speed_kmh: f64,
    /// Exit crossing time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub object_id: u64,
    /// Snapshot of the frame at the exit crossing.
    pub frame: Frame,
}

pub struct SpeedMeasurer {
    line1: ReferenceLine,
    line2: ReferenceLine,
    real_distance_meters: f64,
    records: HashMap<u64, CrossingRecord>,
    previous: TrackedObjects,
}

impl SpeedMeasurer {
    pub fn new(line1: ReferenceLine, line2: ReferenceLine, real_distance_meters: f64) -> Self {
        Self {
            line1,
            line2,
            real_distance_meters,
            records: HashMap::new(),
            previous: TrackedObjects::new(),
        }
    }

    pub fn lines(&self) -> (ReferenceLine, ReferenceLine) {
        (self.line1, self.line2)
    }

    pub fn real_distance_meters(&self) -> f64 {
        self.real_distance_meters
    }

    /// Replace the geometry used from the next frame on.
    ///
    /// Open records keep their entry timestamps; the next exit is computed with
    /// the new distance.
    pub fn reconfigure(
        &mut self,
        line1: ReferenceLine,
        line2: ReferenceLine,
        real_distance_meters: f64,
    ) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            log::info!(
                "measurer reconfigured with {} crossing(s) in flight; pending exits use {:.2} m",
                in_flight,
                real_distance_meters
            );
        }
        self.line1 = line1;
        self.line2 = line2;
        self.real_distance_meters = real_distance_meters;
    }

    pub fn record(&self, object_id: u64) -> Option<&CrossingRecord> {
        self.records.get(&object_id)
    }

    /// Records with an entry but no exit yet.
    pub fn in_flight(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.entry_time.is_some() && r.exit_time.is_none())
            .count()
    }

    /// Evaluate crossings for this frame, annotate it in place, and return new events.
    pub fn process(&mut self, frame: &mut Frame, objects: &TrackedObjects) -> Vec<SpeedEvent> {
        let now = frame.timestamp;
        let mut events = Vec::new();

        for (&object_id, &centroid) in objects {
            if let Some(&previous) = self.previous.get(&object_id) {
                if self.line1.crossed_by(previous, centroid)
                    && !self.records.contains_key(&object_id)
                {
                    self.records.insert(
                        object_id,
                        CrossingRecord {
                            entry_time: Some(now),
                            ..CrossingRecord::default()
                        },
                    );
                    log::debug!("object {} crossed entry line at {:.3}", object_id, now);
                }

                if self.line2.crossed_by(previous, centroid) {
                    if let Some(speed_kmh) = self.close_record(object_id, now) {
                        log::debug!(
                            "object {} crossed exit line at {:.3}: {:.2} km/h",
                            object_id,
                            now,
                            speed_kmh
                        );
                        events.push(SpeedEvent {
                            speed_kmh,
                            timestamp: now,
                            object_id,
                            frame: frame.clone(),
                        });
                    }
                }
            }

            overlay::draw_centroid(frame, object_id, centroid, RED);
            if let Some(speed) = self.records.get(&object_id).and_then(|r| r.speed_kmh) {
                overlay::draw_speed(frame, centroid, speed, YELLOW);
            }
        }

        self.previous = objects.clone();

        overlay::draw_reference_line(frame, &self.line1, BLUE);
        overlay::draw_reference_line(frame, &self.line2, RED);

        events
    }

    /// Close an open record at `now`. Returns the speed when the exit counts.
    fn close_record(&mut self, object_id: u64, now: f64) -> Option<f64> {
        let record = self.records.get_mut(&object_id)?;
        let entry_time = record.entry_time?;
        if record.exit_time.is_some() {
            return None;
        }
        let time_diff = now - entry_time;
        if time_diff <= MIN_CROSSING_SECS {
            log::debug!(
                "object {} exit {:.3}s after entry ignored as noise",
                object_id,
                time_diff
            );
            return None;
        }
        let speed_kmh = (self.real_distance_meters / time_diff) * MPS_TO_KMH;
        record.exit_time = Some(now);
        record.speed_kmh = Some(speed_kmh);
        Some(speed_kmh)
    }
}
