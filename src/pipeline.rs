//! Per-frame composition and the background worker.
//!
//! `Pipeline` runs segment -> track -> measure on one frame. `Service` owns a
//! source, a pipeline and an `EventHandler` on a dedicated thread; the
//! `ServiceHandle` it returns is the only way other threads interact with it:
//! - `latest_frame()` clones the most recent annotated frame
//! - `reload()` queues detection settings, applied between frames
//! - `stop()` ends the loop and waits for the worker to release the source

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::DetectionSettings;
use crate::detect::{BackgroundModelConfig, MotionSegmenter};
use crate::frame::{Frame, GREEN};
use crate::ingest::{AcquiredSource, FrameSource};
use crate::measure::{SpeedEvent, SpeedMeasurer};
use crate::notify::{violation_message, Notifier};
use crate::overlay;
use crate::storage::SharedEventStore;
use crate::track::CentroidTracker;

const IDLE_BACKOFF: Duration = Duration::from_millis(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct Pipeline {
    settings: DetectionSettings,
    segmenter: MotionSegmenter,
    tracker: CentroidTracker,
    measurer: SpeedMeasurer,
}

impl Pipeline {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            settings: settings.clone(),
            segmenter: MotionSegmenter::new(model_config(settings), settings.min_area),
            tracker: CentroidTracker::new(settings.max_disappeared),
            measurer: SpeedMeasurer::new(
                settings.line1,
                settings.line2,
                settings.real_distance_meters,
            ),
        }
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &CentroidTracker {
        &self.tracker
    }

    pub fn measurer(&self) -> &SpeedMeasurer {
        &self.measurer
    }

    /// Run one frame through the stages. Returns the annotated frame and new events.
    pub fn process(&mut self, mut frame: Frame) -> (Frame, Vec<SpeedEvent>) {
        let boxes = self.segmenter.segment(&frame);
        for bbox in &boxes {
            overlay::draw_box(&mut frame, bbox, GREEN);
        }
        let objects = self.tracker.update(&boxes);
        let events = self.measurer.process(&mut frame, objects);
        (frame, events)
    }

    /// Apply new settings between frames.
    ///
    /// Tracked identities and open crossings survive. A changed background
    /// history or threshold restarts the background model.
    pub fn apply_settings(&mut self, settings: &DetectionSettings) {
        self.measurer.reconfigure(
            settings.line1,
            settings.line2,
            settings.real_distance_meters,
        );
        self.tracker.set_max_disappeared(settings.max_disappeared);
        if settings.history != self.settings.history
            || settings.var_threshold != self.settings.var_threshold
        {
            log::info!(
                "background model restarted (history={}, var_threshold={})",
                settings.history,
                settings.var_threshold
            );
            self.segmenter = MotionSegmenter::new(model_config(settings), settings.min_area);
        } else {
            self.segmenter.set_min_area(settings.min_area);
        }
        self.settings = settings.clone();
    }
}

fn model_config(settings: &DetectionSettings) -> BackgroundModelConfig {
    BackgroundModelConfig {
        history: settings.history,
        var_threshold: settings.var_threshold,
        ..BackgroundModelConfig::default()
    }
}

/// Persists events and raises violation notifications.
pub struct EventHandler {
    store: Option<SharedEventStore>,
    notifier: Option<Box<dyn Notifier>>,
    speed_limit_kmh: f64,
}

impl EventHandler {
    pub fn new(
        store: Option<SharedEventStore>,
        notifier: Option<Box<dyn Notifier>>,
        speed_limit_kmh: f64,
    ) -> Self {
        Self {
            store,
            notifier,
            speed_limit_kmh,
        }
    }

    /// Events are only logged.
    pub fn log_only() -> Self {
        Self::new(None, None, 0.0)
    }

    pub fn handle(&mut self, event: &SpeedEvent) {
        log::info!(
            "speed event: object {} at {:.2} km/h",
            event.object_id,
            event.speed_kmh
        );

        let image_path = match &self.store {
            Some(store) => match store.lock() {
                Ok(mut store) => match store.save(event) {
                    Ok(path) => Some(path),
                    Err(err) => {
                        log::error!("failed to store event: {:#}", err);
                        None
                    }
                },
                Err(_) => {
                    log::error!("event store lock poisoned; event not stored");
                    None
                }
            },
            None => None,
        };

        if let (Some(notifier), Some(message)) = (
            &self.notifier,
            violation_message(event.speed_kmh, self.speed_limit_kmh),
        ) {
            notifier.notify(&message, image_path.as_deref());
        }
    }
}

pub struct Service {
    source: Box<dyn FrameSource>,
    source_id: String,
    first_frame: Option<Frame>,
    pipeline: Pipeline,
    handler: EventHandler,
}

impl Service {
    pub fn new(acquired: AcquiredSource, pipeline: Pipeline, handler: EventHandler) -> Self {
        Self {
            source: acquired.source,
            source_id: acquired.source_id,
            first_frame: Some(acquired.first_frame),
            pipeline,
            handler,
        }
    }

    /// Start the worker thread.
    pub fn spawn(self) -> Result<ServiceHandle> {
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            pending: Mutex::new(None),
            running: AtomicBool::new(true),
            frames_processed: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
        });
        let source_id = self.source_id.clone();
        let (done_tx, done_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("speedcam-worker".to_string())
            .spawn(move || {
                let _exit = ClearRunningOnExit(&worker_shared);
                self.run(&worker_shared);
                let _ = done_tx.send(());
            })?;
        log::info!("worker started on {}", source_id);

        Ok(ServiceHandle {
            control: ServiceControl { shared },
            source_id,
            done: done_rx,
            join: Some(join),
        })
    }

    fn run(mut self, shared: &Shared) {
        let mut last_health_log = Instant::now();
        let mut next = self.first_frame.take();

        while shared.running.load(Ordering::SeqCst) {
            if let Some(settings) = shared.take_pending() {
                self.pipeline.apply_settings(&settings);
            }

            let frame = match next.take() {
                Some(frame) => Some(frame),
                None => match self.source.read() {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("read from {} failed: {:#}", self.source_id, err);
                        None
                    }
                },
            };
            let Some(frame) = frame.filter(|frame| !frame.is_empty()) else {
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            };

            let (annotated, events) = self.pipeline.process(frame);
            for event in &events {
                self.handler.handle(event);
            }
            shared.publish(annotated);
            shared.frames_processed.fetch_add(1, Ordering::Relaxed);
            shared
                .events_emitted
                .fetch_add(events.len() as u64, Ordering::Relaxed);

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = self.source.stats();
                log::info!(
                    "source health={} frames={} source={} tracked={}",
                    self.source.is_healthy(),
                    stats.frames_captured,
                    stats.source_id,
                    self.pipeline.tracker().objects().len()
                );
                last_health_log = Instant::now();
            }
        }

        self.source.release();
        log::info!("worker stopped");
    }
}

/// Marks the worker stopped when its thread leaves `run`, including by panic.
struct ClearRunningOnExit<'a>(&'a Shared);

impl Drop for ClearRunningOnExit<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    latest: Mutex<Option<Frame>>,
    pending: Mutex<Option<DetectionSettings>>,
    running: AtomicBool,
    frames_processed: AtomicU64,
    events_emitted: AtomicU64,
}

impl Shared {
    fn publish(&self, frame: Frame) {
        match self.latest.lock() {
            Ok(mut latest) => {
                latest.replace(frame);
            }
            Err(_) => log::error!("latest frame lock poisoned"),
        }
    }

    fn take_pending(&self) -> Option<DetectionSettings> {
        self.pending.lock().ok().and_then(|mut pending| pending.take())
    }
}

/// Cloneable access to a running worker's shared state.
#[derive(Clone)]
pub struct ServiceControl {
    shared: Arc<Shared>,
}

impl ServiceControl {
    /// Copy of the most recent annotated frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared
            .latest
            .lock()
            .ok()
            .and_then(|latest| latest.clone())
    }

    /// Queue `settings` for the worker. A newer reload replaces an unapplied one.
    pub fn reload(&self, settings: DetectionSettings) -> Result<()> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|_| anyhow!("reload queue lock poisoned"))?;
        *pending = Some(settings);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::Relaxed)
    }

    pub fn events_emitted(&self) -> u64 {
        self.shared.events_emitted.load(Ordering::Relaxed)
    }
}

/// Owner of a running `Service`.
pub struct ServiceHandle {
    control: ServiceControl,
    source_id: String,
    done: mpsc::Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Identifier of the source the worker reads from.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn control(&self) -> ServiceControl {
        self.control.clone()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.control.latest_frame()
    }

    pub fn reload(&self, settings: DetectionSettings) -> Result<()> {
        self.control.reload(settings)
    }

    /// Signal the worker and wait up to two seconds for it to finish.
    pub fn stop(mut self) -> Result<()> {
        self.control.shared.running.store(false, Ordering::SeqCst);
        match self.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                self.join.take();
                return Err(anyhow!(
                    "worker did not stop within {}s",
                    STOP_TIMEOUT.as_secs()
                ));
            }
        }
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("worker thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WHITE;
    use crate::geometry::ReferenceLine;
    use crate::config::CameraSettings;
    use crate::ingest::acquire::Strategy;
    use crate::ingest::{acquire, SourceStats, SystemBackends};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    enum Step {
        Fail,
        Empty,
        Block(Duration),
        Panic,
    }

    /// Plays `script` one read at a time, then yields blank frames forever.
    struct ScriptedSource {
        script: VecDeque<Step>,
        opens: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        clock: f64,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                opens: Arc::new(AtomicUsize::new(0)),
                reads: Arc::new(AtomicUsize::new(0)),
                released: Arc::new(AtomicBool::new(false)),
                clock: 0.0,
            }
        }

        fn into_acquired(self) -> AcquiredSource {
            AcquiredSource {
                source: Box::new(self),
                source_id: "scripted".to_string(),
                strategy: Strategy::Configured,
                first_frame: Frame::blank(64, 48, 0.0),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(Step::Fail) => Err(anyhow!("device busy")),
                Some(Step::Empty) => Ok(None),
                Some(Step::Block(duration)) => {
                    std::thread::sleep(duration);
                    Ok(None)
                }
                Some(Step::Panic) => panic!("backend crashed"),
                None => {
                    self.clock += 0.05;
                    Ok(Some(Frame::blank(64, 48, self.clock)))
                }
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn source_id(&self) -> &str {
            "scripted"
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                source_id: "scripted".to_string(),
            }
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn settings() -> DetectionSettings {
        DetectionSettings {
            line1: ReferenceLine::new(0, 100, 400, 100),
            line2: ReferenceLine::new(0, 300, 400, 300),
            real_distance_meters: 10.0,
            min_area: 50,
            ..DetectionSettings::default()
        }
    }

    fn frame_with_block(y: i32, t: f64) -> Frame {
        let mut frame = Frame::blank(400, 400, t);
        frame.fill_rect((190, y - 10), (209, y + 9), WHITE);
        frame
    }

    #[test]
    fn pipeline_draws_boxes_and_measures() {
        let mut pipeline = Pipeline::new(&settings());
        for i in 0..5 {
            pipeline.process(Frame::blank(400, 400, i as f64 * 0.1));
        }
        let mut events = Vec::new();
        let mut last = None;
        for step in 0..=20 {
            let y = 50 + step * 15;
            let (annotated, mut new) =
                pipeline.process(frame_with_block(y, 1.0 + step as f64 * 0.1));
            events.append(&mut new);
            last = Some(annotated);
        }
        assert_eq!(events.len(), 1);
        assert!(events[0].speed_kmh > 0.0);
        let annotated = last.unwrap();
        assert_eq!(annotated.pixel(5, 100), Some(crate::frame::BLUE));
    }

    #[test]
    fn apply_settings_updates_stages() {
        let mut pipeline = Pipeline::new(&settings());
        let mut next = settings();
        next.min_area = 10;
        next.max_disappeared = 3;
        next.real_distance_meters = 12.5;
        pipeline.apply_settings(&next);
        assert_eq!(pipeline.settings().min_area, 10);
        assert_eq!(pipeline.tracker().max_disappeared(), 3);
        assert_eq!(pipeline.measurer().real_distance_meters(), 12.5);
    }

    struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str, _image_path: Option<&std::path::Path>) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn handler_notifies_only_violations() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut handler =
            EventHandler::new(None, Some(Box::new(RecordingNotifier(sent.clone()))), 50.0);
        let event = |speed_kmh| SpeedEvent {
            speed_kmh,
            timestamp: 1.0,
            object_id: 1,
            frame: Frame::blank(4, 4, 1.0),
        };
        handler.handle(&event(40.0));
        handler.handle(&event(60.0));
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["Speed Violation! 60.00 km/h (Limit: 50 km/h)".to_string()]
        );
    }

    #[test]
    fn service_publishes_frames_and_stops() -> Result<()> {
        let camera = CameraSettings {
            source: "stub://road".to_string(),
            width: 160,
            height: 120,
            fps: 100,
        };
        let acquired = acquire(&camera, &SystemBackends)?;
        let handle = Service::new(acquired, Pipeline::new(&settings()), EventHandler::log_only())
            .spawn()?;
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.latest_frame().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let frame = handle.latest_frame().expect("worker publishes frames");
        assert_eq!((frame.width, frame.height), (160, 120));
        handle.reload(settings())?;
        assert_eq!(handle.source_id(), "stub://road");
        handle.stop()
    }

    #[test]
    fn transient_read_failures_keep_worker_running() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Fail, Step::Fail, Step::Empty, Step::Empty]);
        let (opens, reads, released) = (
            Arc::clone(&source.opens),
            Arc::clone(&source.reads),
            Arc::clone(&source.released),
        );
        let handle = Service::new(
            source.into_acquired(),
            Pipeline::new(&settings()),
            EventHandler::log_only(),
        )
        .spawn()?;
        let control = handle.control();

        // The first frame comes from acquisition; later ones must survive the failures.
        assert!(wait_until(|| control.frames_processed() >= 5));
        assert!(reads.load(Ordering::SeqCst) >= 8);
        assert!(control.is_running());
        let frame = control.latest_frame().expect("frames after failures");
        assert!(frame.timestamp > 0.0);
        assert_eq!(opens.load(Ordering::SeqCst), 0);

        handle.stop()?;
        assert!(released.load(Ordering::SeqCst));
        assert!(!control.is_running());
        Ok(())
    }

    #[test]
    fn stop_gives_up_on_a_blocked_read() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Block(Duration::from_secs(6))]);
        let reads = Arc::clone(&source.reads);
        let handle = Service::new(
            source.into_acquired(),
            Pipeline::new(&settings()),
            EventHandler::log_only(),
        )
        .spawn()?;
        assert!(wait_until(|| reads.load(Ordering::SeqCst) >= 1));

        let started = Instant::now();
        let result = handle.stop();
        let elapsed = started.elapsed();
        assert!(result.is_err());
        assert!(elapsed >= STOP_TIMEOUT);
        assert!(elapsed < STOP_TIMEOUT + Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn worker_panic_clears_running() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Empty, Step::Panic]);
        let handle = Service::new(
            source.into_acquired(),
            Pipeline::new(&settings()),
            EventHandler::log_only(),
        )
        .spawn()?;
        let control = handle.control();
        assert!(wait_until(|| !control.is_running()));
        assert!(handle.stop().is_err());
        Ok(())
    }
}
