//! Cross-stream identity correlation.
//!
//! Tracks from different pipelines whose embeddings are similar enough
//! within a time window are merged into a [`GlobalIdentity`]. Identities and
//! tracks live in separate maps keyed by stable ids; an identity only holds
//! [`TrackKey`]s and never owns a track.

mod engine;
mod identity;
mod service;

pub use engine::{CorrelationEvent, CorrelatorConfig, CrossStreamCorrelator, TrackUpdate, cosine_similarity};
pub use identity::{GlobalId, GlobalIdentity, TrackKey};
pub use service::{CorrelatorHandle, CorrelatorService};
