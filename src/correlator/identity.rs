use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frame::Timestamp;
use crate::tracker::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub u64);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Non-owning reference to a track in some pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackKey {
    pub pipeline: Arc<str>,
    pub track: TrackId,
}

impl TrackKey {
    pub fn new(pipeline: impl Into<Arc<str>>, track: TrackId) -> Self {
        Self {
            pipeline: pipeline.into(),
            track,
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pipeline, self.track)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalIdentity {
    pub id: GlobalId,
    pub class_id: u32,
    /// Exponential moving average of member embeddings
    pub embedding: Vec<f32>,
    pub members: BTreeSet<TrackKey>,
    /// Mean of every similarity that supported this identity
    pub confidence: f32,
    pub observations: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GlobalIdentity {
    /// Fold one more supporting similarity into the running mean.
    pub(crate) fn observe(&mut self, similarity: f32, timestamp: Timestamp) {
        let n = self.observations as f32;
        self.confidence = (self.confidence * n + similarity) / (n + 1.0);
        self.observations += 1;
        self.updated_at = self.updated_at.max(timestamp);
    }

    pub fn pipelines(&self) -> BTreeSet<&str> {
        self.members.iter().map(|k| &*k.pipeline).collect()
    }
}
