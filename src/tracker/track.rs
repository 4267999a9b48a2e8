//! A single tracked object.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::Detection;
use crate::error::TrackingError;
use crate::frame::Timestamp;
use crate::tracker::kalman_filter::{KalmanFilter, StateCovariance, StateMean};
use crate::tracker::rect::Rect;
use crate::tracker::track_state::TrackState;

/// Track identifier, unique for the lifetime of one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub state: TrackState,
    pub class_id: u32,
    /// Confidence of the last matched detection
    pub confidence: f32,
    /// Consecutive frames with a matched detection
    pub hits: u32,
    /// Consecutive frames without a matched detection
    pub misses: u32,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub lost_since: Option<Timestamp>,
    history: VecDeque<Detection>,
    history_len: usize,
    mean: StateMean,
    covariance: StateCovariance,
}

impl Track {
    /// Start a tentative track from an unmatched detection.
    pub fn spawn(
        id: TrackId,
        detection: &Detection,
        kalman_filter: &KalmanFilter,
        timestamp: Timestamp,
        history_len: usize,
    ) -> Self {
        let (mean, covariance) = kalman_filter.initiate(measurement(&detection.bbox));
        let mut history = VecDeque::with_capacity(history_len.min(64));
        if history_len > 0 {
            history.push_back(detection.clone());
        }
        Self {
            id,
            state: TrackState::Tentative,
            class_id: detection.class_id,
            confidence: detection.confidence,
            hits: 1,
            misses: 0,
            first_seen: timestamp,
            last_seen: timestamp,
            lost_since: None,
            history,
            history_len,
            mean,
            covariance,
        }
    }

    /// Current filtered box.
    pub fn rect(&self) -> Rect {
        Rect::from_xyah(
            self.mean[0] as f32,
            self.mean[1] as f32,
            self.mean[2] as f32,
            self.mean[3] as f32,
        )
    }

    /// Matched detections, oldest first, bounded by the configured length.
    pub fn history(&self) -> impl Iterator<Item = &Detection> {
        self.history.iter()
    }

    pub fn predict(&mut self, kalman_filter: &KalmanFilter) -> Result<(), TrackingError> {
        let mut mean = self.mean;
        if self.state == TrackState::Lost {
            // height velocity of a lost track is not trusted
            mean[7] = 0.0;
        }
        let (mean, covariance) = kalman_filter.predict(&mean, &self.covariance);
        if !mean.iter().all(|v| v.is_finite()) {
            return Err(TrackingError::NonFinite(self.id));
        }
        self.mean = mean;
        self.covariance = covariance;
        Ok(())
    }

    /// Fold a matched detection into the track.
    pub fn update(
        &mut self,
        detection: &Detection,
        kalman_filter: &KalmanFilter,
        timestamp: Timestamp,
    ) -> Result<(), TrackingError> {
        let (mean, covariance) = kalman_filter
            .update(&self.mean, &self.covariance, measurement(&detection.bbox))
            .ok_or(TrackingError::SingularCovariance(self.id))?;
        self.mean = mean;
        self.covariance = covariance;

        self.confidence = detection.confidence;
        self.class_id = detection.class_id;
        self.hits += 1;
        self.misses = 0;
        self.last_seen = timestamp;
        self.lost_since = None;

        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(detection.clone());
        }
        Ok(())
    }

    pub fn mark_missed(&mut self) {
        self.misses += 1;
        self.hits = 0;
    }

    pub fn mark_lost(&mut self, timestamp: Timestamp) {
        self.state = TrackState::Lost;
        self.lost_since = Some(timestamp);
    }

    pub fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            state: self.state,
            bbox: self.rect(),
            class_id: self.class_id,
            confidence: self.confidence,
            hits: self.hits,
            misses: self.misses,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

fn measurement(bbox: &Rect) -> [f64; 4] {
    let xyah = bbox.to_xyah();
    [xyah[0] as f64, xyah[1] as f64, xyah[2] as f64, xyah[3] as f64]
}

/// Read-only view of a track handed out of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub state: TrackState,
    pub bbox: Rect,
    pub class_id: u32,
    pub confidence: f32,
    pub hits: u32,
    pub misses: u32,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}
