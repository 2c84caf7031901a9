use anyhow::Result;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use speedcam::frame::WHITE;
use speedcam::storage::SharedEventStore;
use speedcam::{
    BoundingBox, CentroidTracker, DetectionSettings, EventHandler, EventStore, Frame, Pipeline,
    ReferenceLine, SpeedEvent, SpeedMeasurer, SqliteEventStore,
};

const FRAME_SECS: f64 = 1.0 / 15.0;

fn road_lines() -> (ReferenceLine, ReferenceLine) {
    (
        ReferenceLine::new(0, 100, 400, 100),
        ReferenceLine::new(0, 300, 400, 300),
    )
}

fn box_around(x: i32, y: i32) -> BoundingBox {
    BoundingBox::new(x - 10, y - 10, x + 10, y + 10)
}

/// Feed one box per frame through tracker and measurer; returns all events.
fn run_track(
    tracker: &mut CentroidTracker,
    measurer: &mut SpeedMeasurer,
    ys: &[i32],
) -> Vec<SpeedEvent> {
    let mut events = Vec::new();
    for (i, &y) in ys.iter().enumerate() {
        let objects = tracker.update(&[box_around(200, y)]).clone();
        let mut frame = Frame::blank(400, 400, i as f64 * FRAME_SECS);
        events.extend(measurer.process(&mut frame, &objects));
    }
    events
}

fn linear_path() -> Vec<i32> {
    (0..20).map(|i| 50 + 270 * i / 19).collect()
}

#[test]
fn linear_pass_produces_exactly_one_event() {
    let (line1, line2) = road_lines();
    let mut tracker = CentroidTracker::new(40);
    let mut measurer = SpeedMeasurer::new(line1, line2, 10.0);

    let events = run_track(&mut tracker, &mut measurer, &linear_path());

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.object_id, 0);

    // Centroid passes y=100 between frames 3 and 4, y=300 between 17 and 18.
    let record = *measurer.record(0).expect("crossing record");
    let entry = record.entry_time.expect("entry time");
    let exit = record.exit_time.expect("exit time");
    assert!((entry - 4.0 * FRAME_SECS).abs() < 1e-9);
    assert!((exit - 18.0 * FRAME_SECS).abs() < 1e-9);
    assert!(exit - entry > 0.1);

    let expected = 10.0 / (exit - entry) * 3.6;
    assert!((event.speed_kmh - expected).abs() < 1e-9);
    assert_eq!(event.timestamp, exit);
}

#[test]
fn reverse_travel_never_measures() {
    let (line1, line2) = road_lines();
    let mut tracker = CentroidTracker::new(40);
    let mut measurer = SpeedMeasurer::new(line1, line2, 10.0);

    let mut path = linear_path();
    path.reverse();
    let events = run_track(&mut tracker, &mut measurer, &path);

    assert!(events.is_empty());
    let record = measurer.record(0).expect("entry recorded after exit line");
    assert!(record.entry_time.is_some());
    assert_eq!(record.exit_time, None);
}

#[test]
fn reload_before_exit_uses_new_distance() {
    let (line1, line2) = road_lines();
    let mut tracker = CentroidTracker::new(40);
    let mut measurer = SpeedMeasurer::new(line1, line2, 10.0);
    let path = linear_path();

    assert!(run_track(&mut tracker, &mut measurer, &path[..10]).is_empty());
    assert_eq!(measurer.in_flight(), 1);

    measurer.reconfigure(line1, line2, 25.0);

    let mut events = Vec::new();
    for (i, &y) in path.iter().enumerate().skip(10) {
        let objects = tracker.update(&[box_around(200, y)]).clone();
        let mut frame = Frame::blank(400, 400, i as f64 * FRAME_SECS);
        events.extend(measurer.process(&mut frame, &objects));
    }

    assert_eq!(events.len(), 1);
    let elapsed = 14.0 * FRAME_SECS;
    assert!((events[0].speed_kmh - 25.0 / elapsed * 3.6).abs() < 1e-9);
}

#[test]
fn lost_object_is_replaced_by_fresh_identity() {
    let mut tracker = CentroidTracker::new(2);
    tracker.update(&[box_around(200, 50)]);
    for _ in 0..3 {
        tracker.update(&[]);
    }
    assert!(tracker.objects().is_empty());

    let objects = tracker.update(&[box_around(200, 60)]);
    assert_eq!(objects.keys().copied().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn pipeline_events_are_stored_with_snapshots() -> Result<()> {
    let dir = tempdir()?;
    let store = SqliteEventStore::open(dir.path(), 100.0)?;
    let images_dir = store.images_dir().to_path_buf();
    let store: SharedEventStore = Arc::new(Mutex::new(store));

    let (line1, line2) = road_lines();
    let settings = DetectionSettings {
        line1,
        line2,
        real_distance_meters: 10.0,
        min_area: 50,
        ..DetectionSettings::default()
    };
    let mut pipeline = Pipeline::new(&settings);
    let mut handler = EventHandler::new(Some(store.clone()), None, 0.0);

    for i in 0..5 {
        pipeline.process(Frame::blank(400, 400, i as f64 * 0.1));
    }
    let mut emitted = 0;
    for step in 0..=20 {
        let y = 50 + step * 15;
        let mut frame = Frame::blank(400, 400, 1.0 + step as f64 * 0.1);
        frame.fill_rect((190, y - 10), (209, y + 9), WHITE);
        let (_, events) = pipeline.process(frame);
        for event in &events {
            handler.handle(event);
        }
        emitted += events.len();
    }
    assert_eq!(emitted, 1);

    let stored = store.lock().unwrap().events(10, 0)?;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].speed_kmh > 0.0);
    assert!(stored[0].image_path.ends_with("kmh.jpg"));
    let bytes = std::fs::read(images_dir.join(&stored[0].image_path))?;
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    Ok(())
}
