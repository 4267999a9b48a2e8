//! Secondary per-track analysis at reduced cadence.
//!
//! Results are cached per track and dropped when the track is purged. A
//! missing or failing model only marks tracks `attributes_unavailable`; it
//! never fails the pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Frame, Timestamp};
use crate::tracker::{TrackId, TrackSnapshot, TrackState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeLabel {
    pub value: String,
    pub confidence: f32,
}

/// Attributes of one track, e.g. `gender`, `age_group`, plus an optional
/// re-identification embedding for cross-stream correlation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackAttributes {
    pub labels: BTreeMap<String, AttributeLabel>,
    pub embedding: Option<Vec<f32>>,
    pub analyzed_at: Timestamp,
}

impl TrackAttributes {
    pub fn label(&self, name: &str) -> Option<&AttributeLabel> {
        self.labels.get(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("attribute analysis failed: {message}")]
pub struct AttributeError {
    pub message: String,
}

impl AttributeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Attribute model run on a cropped track region.
pub trait AttributeModel: Send {
    fn analyze(&mut self, crop: &Frame) -> Result<TrackAttributes, AttributeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeStatus {
    /// Not analyzed yet
    Pending,
    Available(Arc<TrackAttributes>),
    Unavailable,
}

impl AttributeStatus {
    pub const UNAVAILABLE_FLAG: &'static str = "attributes_unavailable";

    /// Flag attached to tracks whose attributes cannot be produced.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            AttributeStatus::Unavailable => Some(Self::UNAVAILABLE_FLAG),
            _ => None,
        }
    }
}

/// A live track with whatever the analyzer knows about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedTrack {
    #[serde(flatten)]
    pub track: TrackSnapshot,
    /// Latest cached attributes, if any analysis succeeded
    pub attributes: Option<Arc<TrackAttributes>>,
    pub attributes_unavailable: bool,
}

struct CacheEntry {
    status: AttributeStatus,
    last_attempt: Option<u64>,
}

pub struct AttributeAnalyzer {
    model: Option<Box<dyn AttributeModel>>,
    /// Frames between two analyses of the same track
    cadence: u64,
    frame_index: u64,
    cache: HashMap<TrackId, CacheEntry>,
}

impl AttributeAnalyzer {
    pub fn new(model: Option<Box<dyn AttributeModel>>, cadence: u32) -> Self {
        Self {
            model,
            cadence: u64::from(cadence.max(1)),
            frame_index: 0,
            cache: HashMap::new(),
        }
    }

    pub fn set_cadence(&mut self, cadence: u32) {
        self.cadence = u64::from(cadence.max(1));
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    /// Analyze confirmed tracks observed on `frame` whose last attempt is at
    /// least `cadence` frames old. Returns the attributes produced on this
    /// frame, ordered by track id.
    pub fn process(&mut self, frame: &Frame, tracks: &[TrackSnapshot]) -> Vec<(TrackId, Arc<TrackAttributes>)> {
        self.frame_index += 1;
        let mut produced = Vec::new();

        for track in tracks {
            if track.state != TrackState::Confirmed || track.last_seen != frame.timestamp {
                continue;
            }
            let entry = self.cache.entry(track.id).or_insert(CacheEntry {
                status: AttributeStatus::Pending,
                last_attempt: None,
            });

            let Some(model) = self.model.as_mut() else {
                entry.status = AttributeStatus::Unavailable;
                continue;
            };
            let due = entry
                .last_attempt
                .is_none_or(|last| self.frame_index - last >= self.cadence);
            if !due {
                continue;
            }
            let Some(crop) = frame.crop(track.bbox) else {
                continue;
            };

            entry.last_attempt = Some(self.frame_index);
            match model.analyze(&crop) {
                Ok(mut attributes) => {
                    attributes.analyzed_at = frame.timestamp;
                    let attributes = Arc::new(attributes);
                    entry.status = AttributeStatus::Available(Arc::clone(&attributes));
                    produced.push((track.id, attributes));
                }
                Err(err) => {
                    tracing::warn!(track = %track.id, error = %err, "{}", AttributeStatus::UNAVAILABLE_FLAG);
                    entry.status = AttributeStatus::Unavailable;
                }
            }
        }
        produced
    }

    pub fn status(&self, track: TrackId) -> AttributeStatus {
        match self.cache.get(&track) {
            Some(entry) => entry.status.clone(),
            None if self.model.is_none() => AttributeStatus::Unavailable,
            None => AttributeStatus::Pending,
        }
    }

    /// Attach cached attributes and the unavailable flag to `tracks`.
    pub fn annotate(&self, tracks: &[TrackSnapshot]) -> Vec<AnalyzedTrack> {
        tracks
            .iter()
            .map(|track| {
                let status = self.status(track.id);
                AnalyzedTrack {
                    track: track.clone(),
                    attributes_unavailable: status.flag().is_some(),
                    attributes: match status {
                        AttributeStatus::Available(attributes) => Some(attributes),
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// Forget a purged track.
    pub fn invalidate(&mut self, track: TrackId) {
        self.cache.remove(&track);
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
