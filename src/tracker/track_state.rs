use serde::{Deserialize, Serialize};

/// Lifecycle of a track within one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TrackState {
    /// Spawned from an unmatched detection, not yet confirmed
    #[default]
    Tentative,
    /// Matched on enough consecutive frames
    Confirmed,
    /// Missed on `miss_threshold` consecutive frames, kept for re-association
    Lost,
    /// Purged; never observed outside the tracker
    Removed,
}

impl TrackState {
    /// Whether the track is still associated on every frame.
    pub fn is_active(&self) -> bool {
        matches!(self, TrackState::Tentative | TrackState::Confirmed)
    }
}
