//! Line-crossing speed camera.
//!
//! Estimates the speed of moving objects from a fixed camera using two
//! reference lines a known physical distance apart.
//!
//! # Architecture
//!
//! Per frame, on one worker thread:
//!
//! 1. **Acquisition** (`ingest`): a `FrameSource` chosen once by a fallback chain
//!    (libcamera pipeline, reduced pipeline, configured source, discovered devices).
//! 2. **Segmentation** (`detect`): adaptive background subtraction into bounding boxes.
//! 3. **Tracking** (`track`): greedy nearest-centroid identity assignment.
//! 4. **Measurement** (`measure`): entry/exit line crossings turned into speed events.
//!
//! Events go to `storage` (SQLite + JPEG snapshots) and `notify` (violations only).
//! The latest annotated frame and the event history are served by `api`.
//!
//! # Module Structure
//!
//! - `frame`, `geometry`, `overlay`: pixel buffers, planar geometry, annotation
//! - `pipeline`: per-frame composition and the worker service
//! - `config`: TOML file + environment configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod measure;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod storage;
pub mod track;

pub use config::{CameraSettings, DetectionSettings, DetectionUpdate, SpeedcamConfig};
pub use detect::{BackgroundModelConfig, MotionSegmenter};
pub use frame::Frame;
pub use geometry::{BoundingBox, Point, ReferenceLine};
pub use ingest::{
    acquire, AcquiredSource, AcquisitionError, FrameSource, SourceBackends, SyntheticSource,
    SystemBackends,
};
pub use measure::{CrossingRecord, SpeedEvent, SpeedMeasurer};
pub use notify::{NotificationManager, Notifier};
pub use pipeline::{EventHandler, Pipeline, Service, ServiceControl, ServiceHandle};
pub use storage::{EventStore, SqliteEventStore, StoredEvent};
pub use track::{CentroidTracker, TrackedObjects};
