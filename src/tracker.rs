//! Per-pipeline multi-object tracking.
//!
//! The tracker follows ByteTrack: a constant-velocity Kalman filter predicts
//! every track, detections are associated in confidence tiers by solving an
//! IoU assignment, and tracks move through Tentative → Confirmed → Lost before
//! being purged.

mod kalman_filter;
mod matching;
mod object_tracker;
mod rect;
mod track;
mod track_state;

pub use kalman_filter::KalmanFilter;
pub use matching::{AssignmentResult, fuse_score, iou_distance, linear_assignment};
pub use object_tracker::{ObjectTracker, TrackEvent, TrackerConfig, TrackerOutput};
pub use rect::{Rect, iou_batch};
pub use track::{Track, TrackId, TrackSnapshot};
pub use track_state::TrackState;
