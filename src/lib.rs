//! Concurrent multi-stream detection and tracking runtime.
//!
//! A [`ResourceScheduler`] owns one [`pipeline`] worker per video stream. Each
//! worker pulls frames from a [`FrameSource`], runs an [`InferenceBackend`]
//! (NPU, GPU or CPU with automatic fallback), associates detections into
//! persistent tracks with the ByteTrack-style [`ObjectTracker`], optionally
//! attaches per-track attributes, and publishes events to an [`EventSink`].
//! Track observations from every pipeline feed the
//! [`CrossStreamCorrelator`], which merges them into global identities.

pub mod attributes;
pub mod backend;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod scheduler;
pub mod telemetry;
pub mod tracker;

pub use attributes::{AnalyzedTrack, AttributeAnalyzer, AttributeModel, AttributeStatus, TrackAttributes};
pub use backend::{
    BackendKind, BackendPreference, Detection, DetectionBuilder, DeviceConfig, InferenceBackend,
    ModelHandle, ModelLoader, ModelRuntime, RawDetection,
};
pub use config::{PipelineConfig, RuntimeConfig};
pub use correlator::{
    CorrelatorConfig, CorrelatorHandle, CorrelatorService, CrossStreamCorrelator, GlobalId, GlobalIdentity, TrackKey,
};
pub use error::{ConfigError, Error, Result};
pub use events::{ChannelSink, Event, EventKind, EventSink, EventSource, LogSink};
pub use frame::{Frame, FrameSource, SourcePoll, Timestamp};
pub use pipeline::{PipelineHandle, PipelineSnapshot, PipelineState};
pub use scheduler::{
    HardwareProbe, ResourceKind, ResourceScheduler, ResourceSnapshot, SysinfoProbe, SystemStats,
};
pub use tracker::{ObjectTracker, Rect, TrackId, TrackState, TrackerConfig};
