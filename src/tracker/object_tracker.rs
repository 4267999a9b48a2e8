//! ByteTrack association and the per-pipeline track lifecycle.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Detection;
use crate::error::{ConfigError, TrackingError};
use crate::frame::Timestamp;
use crate::tracker::kalman_filter::KalmanFilter;
use crate::tracker::matching::{self, AssignmentResult};
use crate::tracker::rect::{Rect, iou_batch};
use crate::tracker::track::{Track, TrackId, TrackSnapshot};
use crate::tracker::track_state::TrackState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detections at or above this confidence take part in the first tier
    pub high_score_threshold: f32,
    /// Detections at or below this confidence are ignored entirely
    pub low_score_floor: f32,
    /// Minimum confidence for an unmatched detection to start a track
    pub new_track_threshold: f32,
    /// Maximum fused cost for a high-score match
    pub match_threshold: f32,
    /// Maximum IoU distance for a low-score match
    pub low_match_threshold: f32,
    /// Maximum fused cost for matching a tentative track
    pub tentative_match_threshold: f32,
    /// Consecutive matches before a tentative track is confirmed
    pub confirm_hits: u32,
    /// Consecutive misses before a confirmed track is marked lost
    pub miss_threshold: u32,
    /// How long a lost track stays eligible for re-association
    pub lost_ttl_ms: u64,
    /// Matched detections kept per track
    pub history_len: usize,
    /// IoU above which a lost track duplicating an active one is dropped
    pub duplicate_iou: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_score_threshold: 0.5,
            low_score_floor: 0.1,
            new_track_threshold: 0.6,
            match_threshold: 0.8,
            low_match_threshold: 0.5,
            tentative_match_threshold: 0.7,
            confirm_hits: 3,
            miss_threshold: 30,
            lost_ttl_ms: 2000,
            history_len: 30,
            duplicate_iou: 0.85,
        }
    }
}

impl TrackerConfig {
    pub fn lost_ttl(&self) -> Duration {
        Duration::from_millis(self.lost_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("tracker.high_score_threshold", self.high_score_threshold),
            ("tracker.low_score_floor", self.low_score_floor),
            ("tracker.new_track_threshold", self.new_track_threshold),
            ("tracker.match_threshold", self.match_threshold),
            ("tracker.low_match_threshold", self.low_match_threshold),
            ("tracker.tentative_match_threshold", self.tentative_match_threshold),
            ("tracker.duplicate_iou", self.duplicate_iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.low_score_floor > self.high_score_threshold {
            return Err(ConfigError::Invalid(format!(
                "tracker.low_score_floor ({}) exceeds tracker.high_score_threshold ({})",
                self.low_score_floor, self.high_score_threshold
            )));
        }
        if self.confirm_hits == 0 {
            return Err(ConfigError::Zero("tracker.confirm_hits"));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Zero("tracker.miss_threshold"));
        }
        Ok(())
    }
}

/// Lifecycle transition observed during one `update`.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Created(TrackSnapshot),
    /// `recovered` is set when a lost track was re-associated.
    Confirmed { track: TrackSnapshot, recovered: bool },
    Lost(TrackSnapshot),
    /// The track left the tracker for good. Never surfaced as a public
    /// pipeline event; drives cache invalidation downstream.
    Purged(TrackId),
}

#[derive(Debug, Clone, Default)]
pub struct TrackerOutput {
    pub events: Vec<TrackEvent>,
    /// Every live track (tentative, confirmed and lost), ordered by id
    pub tracks: Vec<TrackSnapshot>,
}

/// Multi-object tracker owned by a single pipeline.
pub struct ObjectTracker {
    /// Tentative and confirmed tracks
    active: Vec<Track>,
    lost: Vec<Track>,
    next_id: u64,
    config: TrackerConfig,
    kalman_filter: KalmanFilter,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            active: Vec::new(),
            lost: Vec::new(),
            next_id: 1,
            config,
            kalman_filter: KalmanFilter::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Replace thresholds without touching existing tracks or the id counter.
    pub fn set_config(&mut self, config: TrackerConfig) {
        self.config = config;
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.active.iter().chain(&self.lost).find(|t| t.id == id)
    }

    /// Snapshots of every live track, ordered by id.
    pub fn tracks(&self) -> Vec<TrackSnapshot> {
        let mut tracks: Vec<TrackSnapshot> =
            self.active.iter().chain(&self.lost).map(Track::snapshot).collect();
        tracks.sort_by_key(|t| t.id);
        tracks
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn update(&mut self, detections: &[Detection], timestamp: Timestamp) -> TrackerOutput {
        let mut events = Vec::new();

        let mut detections: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.bbox.is_finite() && d.confidence.is_finite())
            .collect();
        detections.sort_by(|a, b| a.rank_cmp(b));

        let (high, low): (Vec<&Detection>, Vec<&Detection>) = detections
            .into_iter()
            .filter(|d| d.confidence > self.config.low_score_floor)
            .partition(|d| d.confidence >= self.config.high_score_threshold);

        let (mut confirmed, mut tentative): (Vec<Track>, Vec<Track>) = self
            .active
            .drain(..)
            .partition(|t| t.state == TrackState::Confirmed);
        confirmed.append(&mut self.lost);
        let mut pool = confirmed;

        self.predict_all(&mut pool, &mut events);
        self.predict_all(&mut tentative, &mut events);

        // First tier: confirmed and lost tracks against high-score detections.
        let mut cost = matching::iou_distance(&rects(&pool), &det_rects(&high));
        matching::fuse_score(&mut cost, &scores(&high));
        let AssignmentResult {
            matches,
            unmatched_tracks,
            unmatched_detections,
        } = matching::linear_assignment(&cost, self.config.match_threshold);

        let mut matched = Vec::new();
        let mut slots: Vec<Option<Track>> = pool.into_iter().map(Some).collect();
        for (itrack, idet) in matches {
            if let Some(track) = slots[itrack].take() {
                if let Some(track) = self.apply_match(track, high[idet], timestamp, &mut events) {
                    matched.push(track);
                }
            }
        }

        // Second tier: still-unmatched confirmed tracks against low-score
        // detections. Lost tracks only come back on a confident detection.
        let mut remaining: Vec<Track> = Vec::new();
        let mut still_lost: Vec<Track> = Vec::new();
        for idx in unmatched_tracks {
            if let Some(track) = slots[idx].take() {
                if track.state == TrackState::Confirmed {
                    remaining.push(track);
                } else {
                    still_lost.push(track);
                }
            }
        }

        let cost = matching::iou_distance(&rects(&remaining), &det_rects(&low));
        let AssignmentResult {
            matches,
            unmatched_tracks,
            ..
        } = matching::linear_assignment(&cost, self.config.low_match_threshold);

        let mut slots: Vec<Option<Track>> = remaining.into_iter().map(Some).collect();
        for (itrack, idet) in matches {
            if let Some(track) = slots[itrack].take() {
                if let Some(track) = self.apply_match(track, low[idet], timestamp, &mut events) {
                    matched.push(track);
                }
            }
        }
        for idx in unmatched_tracks {
            if let Some(mut track) = slots[idx].take() {
                track.mark_missed();
                if track.misses >= self.config.miss_threshold {
                    track.mark_lost(timestamp);
                    tracing::debug!(track = %track.id, misses = track.misses, "track lost");
                    events.push(TrackEvent::Lost(track.snapshot()));
                    still_lost.push(track);
                } else {
                    matched.push(track);
                }
            }
        }
        for track in &mut still_lost {
            if track.lost_since != Some(timestamp) {
                track.mark_missed();
            }
        }

        // Third tier: tentative tracks against the high-score leftovers.
        let leftovers: Vec<&Detection> = unmatched_detections.iter().map(|&i| high[i]).collect();
        let mut cost = matching::iou_distance(&rects(&tentative), &det_rects(&leftovers));
        matching::fuse_score(&mut cost, &scores(&leftovers));
        let AssignmentResult {
            matches,
            unmatched_tracks,
            unmatched_detections,
        } = matching::linear_assignment(&cost, self.config.tentative_match_threshold);

        let mut slots: Vec<Option<Track>> = tentative.into_iter().map(Some).collect();
        for (itrack, idet) in matches {
            if let Some(track) = slots[itrack].take() {
                if let Some(track) = self.apply_match(track, leftovers[idet], timestamp, &mut events) {
                    matched.push(track);
                }
            }
        }
        for idx in unmatched_tracks {
            if let Some(mut track) = slots[idx].take() {
                // a tentative track gets no grace period
                track.mark_removed();
                events.push(TrackEvent::Purged(track.id));
            }
        }

        // Spawn tracks for confident detections nobody claimed.
        for idx in unmatched_detections {
            let det = leftovers[idx];
            if det.confidence < self.config.new_track_threshold {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            let mut track = Track::spawn(id, det, &self.kalman_filter, timestamp, self.config.history_len);
            events.push(TrackEvent::Created(track.snapshot()));
            if track.hits >= self.config.confirm_hits {
                track.state = TrackState::Confirmed;
                events.push(TrackEvent::Confirmed {
                    track: track.snapshot(),
                    recovered: false,
                });
            }
            matched.push(track);
        }

        // Purge lost tracks past their TTL.
        let ttl = self.config.lost_ttl();
        let mut lost = Vec::with_capacity(still_lost.len());
        for mut track in still_lost {
            let expired = track
                .lost_since
                .is_some_and(|since| timestamp.since(since) > ttl);
            if expired {
                tracing::debug!(track = %track.id, "lost track expired");
                track.mark_removed();
                events.push(TrackEvent::Purged(track.id));
            } else {
                lost.push(track);
            }
        }

        matched.sort_by_key(|t| t.id);
        lost.sort_by_key(|t| t.id);
        self.active = matched;
        self.lost = self.suppress_duplicates(lost, &mut events);

        TrackerOutput {
            events,
            tracks: self.tracks(),
        }
    }

    fn predict_all(&self, tracks: &mut Vec<Track>, events: &mut Vec<TrackEvent>) {
        tracks.retain_mut(|track| match track.predict(&self.kalman_filter) {
            Ok(()) => true,
            Err(err) => {
                drop_inconsistent(err, events);
                false
            }
        });
    }

    /// Fold `det` into `track`, promoting it when it has earned it. Returns
    /// `None` if the update broke the filter and the track was dropped.
    fn apply_match(
        &self,
        mut track: Track,
        det: &Detection,
        timestamp: Timestamp,
        events: &mut Vec<TrackEvent>,
    ) -> Option<Track> {
        let previous = track.state;
        if let Err(err) = track.update(det, &self.kalman_filter, timestamp) {
            drop_inconsistent(err, events);
            return None;
        }

        match previous {
            TrackState::Lost => {
                track.state = TrackState::Confirmed;
                tracing::debug!(track = %track.id, "lost track recovered");
                events.push(TrackEvent::Confirmed {
                    track: track.snapshot(),
                    recovered: true,
                });
            }
            TrackState::Tentative if track.hits >= self.config.confirm_hits => {
                track.state = TrackState::Confirmed;
                events.push(TrackEvent::Confirmed {
                    track: track.snapshot(),
                    recovered: false,
                });
            }
            _ => {}
        }
        Some(track)
    }

    /// Drop lost tracks that overlap an active track above `duplicate_iou`.
    /// The active track always survives since it is the one being observed.
    fn suppress_duplicates(&self, lost: Vec<Track>, events: &mut Vec<TrackEvent>) -> Vec<Track> {
        if lost.is_empty() || self.active.is_empty() {
            return lost;
        }

        let ious = iou_batch(&rects(&self.active), &rects(&lost));
        let duplicates: HashSet<usize> = ious
            .indexed_iter()
            .filter(|&(_, &iou)| iou > self.config.duplicate_iou)
            .map(|((_, j), _)| j)
            .collect();

        lost.into_iter()
            .enumerate()
            .filter_map(|(j, mut track)| {
                if duplicates.contains(&j) {
                    track.mark_removed();
                    events.push(TrackEvent::Purged(track.id));
                    None
                } else {
                    Some(track)
                }
            })
            .collect()
    }
}

fn drop_inconsistent(err: TrackingError, events: &mut Vec<TrackEvent>) {
    let id = match &err {
        TrackingError::SingularCovariance(id) | TrackingError::NonFinite(id) => *id,
    };
    tracing::warn!(track = %id, error = %err, "dropping inconsistent track");
    events.push(TrackEvent::Purged(id));
}

fn rects(tracks: &[Track]) -> Vec<Rect> {
    tracks.iter().map(Track::rect).collect()
}

fn det_rects(detections: &[&Detection]) -> Vec<Rect> {
    detections.iter().map(|d| d.bbox).collect()
}

fn scores(detections: &[&Detection]) -> Vec<f32> {
    detections.iter().map(|d| d.confidence).collect()
}
