use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlator::identity::{GlobalId, GlobalIdentity, TrackKey};
use crate::error::ConfigError;
use crate::frame::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Similarity at which a pair is reported as ambiguous
    pub candidate_threshold: f32,
    /// Similarity at which a pair is merged
    pub strong_threshold: f32,
    /// Maximum time between two observations for them to be compared
    pub time_window_ms: u64,
    /// How long an identity survives after all its members are lost
    pub gc_horizon_ms: u64,
    /// Weight of a new observation in the embedding moving average
    pub embedding_alpha: f32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            candidate_threshold: 0.6,
            strong_threshold: 0.8,
            time_window_ms: 10_000,
            gc_horizon_ms: 30_000,
            embedding_alpha: 0.3,
        }
    }
}

impl CorrelatorConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }

    pub fn gc_horizon(&self) -> Duration {
        Duration::from_millis(self.gc_horizon_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("correlator.candidate_threshold", self.candidate_threshold),
            ("correlator.strong_threshold", self.strong_threshold),
            ("correlator.embedding_alpha", self.embedding_alpha),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.candidate_threshold > self.strong_threshold {
            return Err(ConfigError::Invalid(format!(
                "correlator.candidate_threshold ({}) exceeds correlator.strong_threshold ({})",
                self.candidate_threshold, self.strong_threshold
            )));
        }
        if self.embedding_alpha == 0.0 {
            return Err(ConfigError::Zero("correlator.embedding_alpha"));
        }
        if self.time_window_ms == 0 {
            return Err(ConfigError::Zero("correlator.time_window_ms"));
        }
        Ok(())
    }
}

/// Track observation forwarded by a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackUpdate {
    Observed {
        key: TrackKey,
        class_id: u32,
        timestamp: Timestamp,
        embedding: Option<Vec<f32>>,
    },
    Lost {
        key: TrackKey,
        timestamp: Timestamp,
    },
    Purged {
        key: TrackKey,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationEvent {
    Merged {
        identity: GlobalId,
        members: Vec<TrackKey>,
        confidence: f32,
    },
    Ambiguous {
        a: TrackKey,
        b: TrackKey,
        similarity: f32,
    },
}

struct TrackEntry {
    class_id: u32,
    embedding: Option<Vec<f32>>,
    last_seen: Timestamp,
    lost_at: Option<Timestamp>,
    identity: Option<GlobalId>,
}

impl TrackEntry {
    fn is_active(&self) -> bool {
        self.lost_at.is_none()
    }

    /// When the track stopped being observed, for garbage collection.
    fn inactive_since(&self) -> Timestamp {
        self.lost_at.unwrap_or(self.last_seen)
    }
}

/// Match target for an unassigned track. Identities sort before tracks so
/// that on equal similarity joining an existing identity wins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Candidate {
    Identity(GlobalId),
    Track(TrackKey),
}

pub struct CrossStreamCorrelator {
    config: CorrelatorConfig,
    tracks: HashMap<TrackKey, TrackEntry>,
    identities: BTreeMap<GlobalId, GlobalIdentity>,
    next_id: u64,
    /// Ambiguous pairs already reported, smaller key first
    reported: BTreeSet<(TrackKey, TrackKey)>,
    /// Latest timestamp seen from any pipeline
    clock: Timestamp,
}

impl CrossStreamCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            identities: BTreeMap::new(),
            next_id: 1,
            reported: BTreeSet::new(),
            clock: Timestamp::default(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock
    }

    pub fn identities(&self) -> impl Iterator<Item = &GlobalIdentity> {
        self.identities.values()
    }

    pub fn identity(&self, id: GlobalId) -> Option<&GlobalIdentity> {
        self.identities.get(&id)
    }

    pub fn identity_of(&self, key: &TrackKey) -> Option<GlobalId> {
        self.tracks.get(key).and_then(|t| t.identity)
    }

    pub fn tracked(&self) -> usize {
        self.tracks.len()
    }

    pub fn ingest(&mut self, update: TrackUpdate) -> Vec<CorrelationEvent> {
        match update {
            TrackUpdate::Observed {
                key,
                class_id,
                timestamp,
                embedding,
            } => self.observe(key, class_id, timestamp, embedding),
            TrackUpdate::Lost { key, timestamp } => {
                self.clock = self.clock.max(timestamp);
                if let Some(entry) = self.tracks.get_mut(&key) {
                    entry.lost_at.get_or_insert(timestamp);
                }
                Vec::new()
            }
            TrackUpdate::Purged { key } => {
                let clock = self.clock;
                match self.tracks.get_mut(&key) {
                    // still referenced; left for garbage collection
                    Some(entry) if entry.identity.is_some() => {
                        entry.lost_at.get_or_insert(clock);
                    }
                    Some(_) => {
                        self.tracks.remove(&key);
                    }
                    None => {}
                }
                Vec::new()
            }
        }
    }

    fn observe(
        &mut self,
        key: TrackKey,
        class_id: u32,
        timestamp: Timestamp,
        embedding: Option<Vec<f32>>,
    ) -> Vec<CorrelationEvent> {
        self.clock = self.clock.max(timestamp);
        let alpha = self.config.embedding_alpha;

        let entry = self.tracks.entry(key.clone()).or_insert(TrackEntry {
            class_id,
            embedding: None,
            last_seen: timestamp,
            lost_at: None,
            identity: None,
        });
        entry.class_id = class_id;
        entry.last_seen = entry.last_seen.max(timestamp);
        entry.lost_at = None;

        let Some(observation) = embedding else {
            return Vec::new();
        };
        let blended = match entry.embedding.take() {
            Some(previous) => blend(&previous, &observation, alpha),
            None => observation,
        };
        entry.embedding = Some(blended.clone());

        if let Some(identity_id) = entry.identity {
            // refresh an existing identity; merges are never undone
            if let Some(identity) = self.identities.get_mut(&identity_id) {
                let similarity = cosine_similarity(&identity.embedding, &blended);
                identity.embedding = blend(&identity.embedding, &blended, alpha);
                identity.observe(similarity, timestamp);
            }
            return Vec::new();
        }

        let Some((candidate, similarity)) = self.best_candidate(&key, class_id, timestamp, &blended) else {
            return Vec::new();
        };

        if similarity >= self.config.strong_threshold {
            vec![self.merge(key, candidate, similarity, timestamp, &blended)]
        } else if similarity >= self.config.candidate_threshold {
            let partner = match &candidate {
                Candidate::Track(other) => Some(other.clone()),
                Candidate::Identity(id) => self.representative(*id),
            };
            let Some(partner) = partner else {
                return Vec::new();
            };
            let pair = if key <= partner {
                (key, partner)
            } else {
                (partner, key)
            };
            if self.reported.insert(pair.clone()) {
                tracing::debug!(a = %pair.0, b = %pair.1, similarity, "ambiguous correlation");
                vec![CorrelationEvent::Ambiguous {
                    a: pair.0,
                    b: pair.1,
                    similarity,
                }]
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        }
    }

    /// Highest-similarity match for an unassigned track, restricted to the
    /// same class, other pipelines, and the time window.
    fn best_candidate(
        &self,
        key: &TrackKey,
        class_id: u32,
        timestamp: Timestamp,
        embedding: &[f32],
    ) -> Option<(Candidate, f32)> {
        let window = self.config.time_window();
        let within = |other: Timestamp| timestamp.since(other).max(other.since(timestamp)) <= window;
        let mut best: Option<(Candidate, f32)> = None;
        let mut consider = |candidate: Candidate, similarity: f32| {
            let better = match &best {
                None => true,
                Some((current, score)) => {
                    similarity > *score || (similarity == *score && candidate < *current)
                }
            };
            if better {
                best = Some((candidate, similarity));
            }
        };

        for identity in self.identities.values() {
            if identity.class_id != class_id || !within(identity.updated_at) {
                continue;
            }
            // one pipeline cannot see the same entity as two live tracks
            let same_pipeline_active = identity.members.iter().any(|m| {
                m.pipeline == key.pipeline && self.tracks.get(m).is_some_and(TrackEntry::is_active)
            });
            if same_pipeline_active {
                continue;
            }
            consider(
                Candidate::Identity(identity.id),
                cosine_similarity(&identity.embedding, embedding),
            );
        }

        for (other_key, other) in &self.tracks {
            if other_key.pipeline == key.pipeline
                || other.identity.is_some()
                || other.class_id != class_id
                || !within(other.last_seen)
            {
                continue;
            }
            if let Some(other_embedding) = &other.embedding {
                consider(
                    Candidate::Track(other_key.clone()),
                    cosine_similarity(other_embedding, embedding),
                );
            }
        }
        best
    }

    fn merge(
        &mut self,
        key: TrackKey,
        candidate: Candidate,
        similarity: f32,
        timestamp: Timestamp,
        embedding: &[f32],
    ) -> CorrelationEvent {
        let alpha = self.config.embedding_alpha;
        let identity_id = match candidate {
            Candidate::Identity(id) => id,
            Candidate::Track(other) => {
                let id = GlobalId(self.next_id);
                self.next_id += 1;
                let (class_id, other_embedding) = match self.tracks.get_mut(&other) {
                    Some(entry) => {
                        entry.identity = Some(id);
                        (entry.class_id, entry.embedding.clone().unwrap_or_default())
                    }
                    None => (0, embedding.to_vec()),
                };
                self.identities.insert(
                    id,
                    GlobalIdentity {
                        id,
                        class_id,
                        embedding: other_embedding,
                        members: BTreeSet::from([other]),
                        confidence: 0.0,
                        observations: 0,
                        created_at: timestamp,
                        updated_at: timestamp,
                    },
                );
                id
            }
        };

        if let Some(entry) = self.tracks.get_mut(&key) {
            entry.identity = Some(identity_id);
        }
        match self.identities.get_mut(&identity_id) {
            Some(identity) => {
                identity.members.insert(key);
                identity.embedding = blend(&identity.embedding, embedding, alpha);
                identity.observe(similarity, timestamp);
                tracing::info!(
                    identity = %identity.id,
                    members = identity.members.len(),
                    confidence = identity.confidence,
                    "global identity merged"
                );
                CorrelationEvent::Merged {
                    identity: identity.id,
                    members: identity.members.iter().cloned().collect(),
                    confidence: identity.confidence,
                }
            }
            None => CorrelationEvent::Merged {
                identity: identity_id,
                members: Vec::new(),
                confidence: similarity,
            },
        }
    }

    /// Most recently seen member of an identity, lowest key on ties.
    fn representative(&self, id: GlobalId) -> Option<TrackKey> {
        let identity = self.identities.get(&id)?;
        identity
            .members
            .iter()
            .filter_map(|m| self.tracks.get(m).map(|t| (t.last_seen, m)))
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(a.1)))
            .map(|(_, m)| m.clone())
    }

    /// Drop identities whose members have all been inactive for longer than
    /// the horizon, together with unassigned tracks past the same horizon.
    /// Returns the removed identities.
    pub fn collect_garbage(&mut self, now: Timestamp) -> Vec<GlobalId> {
        let horizon = self.config.gc_horizon();
        let expired = |entry: &TrackEntry| now.since(entry.inactive_since()) > horizon;

        let mut removed = Vec::new();
        for identity in self.identities.values() {
            let all_expired = identity
                .members
                .iter()
                .all(|m| self.tracks.get(m).is_none_or(|t| expired(t)));
            if all_expired {
                removed.push(identity.id);
            }
        }
        for id in &removed {
            if let Some(identity) = self.identities.remove(id) {
                tracing::debug!(identity = %id, "global identity collected");
                for member in identity.members {
                    self.tracks.remove(&member);
                }
            }
        }

        self.tracks.retain(|_, t| t.identity.is_some() || !expired(t));
        let tracks = &self.tracks;
        self.reported
            .retain(|(a, b)| tracks.contains_key(a) && tracks.contains_key(b));
        removed
    }
}

/// `previous * (1 - alpha) + observation * alpha`. Mismatched lengths keep
/// the observation.
fn blend(previous: &[f32], observation: &[f32], alpha: f32) -> Vec<f32> {
    if previous.len() != observation.len() {
        return observation.to_vec();
    }
    previous
        .iter()
        .zip(observation)
        .map(|(p, o)| p * (1.0 - alpha) + o * alpha)
        .collect()
}

/// Cosine similarity clamped to [0, 1]; zero for empty, mismatched or
/// zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot / (norm_a * norm_b);
    if similarity.is_finite() {
        similarity.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackId;

    fn key(pipeline: &str, track: u64) -> TrackKey {
        TrackKey::new(pipeline, TrackId(track))
    }

    fn observed(pipeline: &str, track: u64, ts: u64, embedding: &[f32]) -> TrackUpdate {
        TrackUpdate::Observed {
            key: key(pipeline, track),
            class_id: 0,
            timestamp: Timestamp(ts),
            embedding: Some(embedding.to_vec()),
        }
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_same_pipeline_never_merges() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig::default());
        c.ingest(observed("a", 1, 0, &[1.0, 0.0]));
        assert!(c.ingest(observed("a", 2, 10, &[1.0, 0.0])).is_empty());
        assert_eq!(c.identities().count(), 0);
    }

    #[test]
    fn test_strong_match_creates_identity_then_joins() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig::default());
        assert!(c.ingest(observed("a", 1, 0, &[1.0, 0.0])).is_empty());

        let events = c.ingest(observed("b", 7, 100, &[0.99, 0.05]));
        let CorrelationEvent::Merged { identity, members, .. } = &events[0] else {
            panic!("expected merge, got {events:?}");
        };
        assert_eq!(*identity, GlobalId(1));
        assert_eq!(members, &vec![key("a", 1), key("b", 7)]);

        let events = c.ingest(observed("c", 3, 200, &[1.0, 0.02]));
        assert!(matches!(&events[0], CorrelationEvent::Merged { identity: GlobalId(1), members, .. } if members.len() == 3));
        assert_eq!(c.identity_of(&key("c", 3)), Some(GlobalId(1)));
    }

    #[test]
    fn test_ambiguous_reported_once() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig::default());
        c.ingest(observed("a", 1, 0, &[1.0, 0.0]));
        // cos ~ 0.707
        let events = c.ingest(observed("b", 1, 10, &[1.0, 1.0]));
        assert!(matches!(&events[..], [CorrelationEvent::Ambiguous { .. }]));
        assert!(c.ingest(observed("b", 1, 20, &[1.0, 1.0])).is_empty());
        assert_eq!(c.identities().count(), 0);
    }

    #[test]
    fn test_time_window_and_class() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig::default());
        c.ingest(observed("a", 1, 0, &[1.0, 0.0]));
        assert!(c.ingest(observed("b", 1, 20_000, &[1.0, 0.0])).is_empty());

        c.ingest(TrackUpdate::Observed {
            key: key("c", 1),
            class_id: 5,
            timestamp: Timestamp(20_000),
            embedding: Some(vec![1.0, 0.0]),
        });
        assert_eq!(c.identity_of(&key("c", 1)), None);
    }

    #[test]
    fn test_merges_are_monotone() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig::default());
        c.ingest(observed("a", 1, 0, &[1.0, 0.0]));
        c.ingest(observed("b", 1, 10, &[1.0, 0.0]));
        // b drifts away; it stays in the identity, confidence drops
        for ts in 20..30 {
            c.ingest(observed("b", 1, ts, &[0.0, 1.0]));
        }
        let identity = c.identity(GlobalId(1)).unwrap();
        assert_eq!(identity.members.len(), 2);
        assert_eq!(c.identity_of(&key("b", 1)), Some(GlobalId(1)));
        assert!(identity.confidence < 1.0);
    }

    #[test]
    fn test_garbage_collection() {
        let mut c = CrossStreamCorrelator::new(CorrelatorConfig {
            gc_horizon_ms: 1000,
            ..CorrelatorConfig::default()
        });
        c.ingest(observed("a", 1, 0, &[1.0, 0.0]));
        c.ingest(observed("b", 1, 10, &[1.0, 0.0]));
        c.ingest(TrackUpdate::Lost {
            key: key("a", 1),
            timestamp: Timestamp(100),
        });
        assert!(c.collect_garbage(Timestamp(900)).is_empty());

        c.ingest(TrackUpdate::Lost {
            key: key("b", 1),
            timestamp: Timestamp(200),
        });
        c.ingest(TrackUpdate::Purged { key: key("b", 1) });
        // a expired at 1100, b has not
        assert!(c.collect_garbage(Timestamp(1150)).is_empty());
        assert_eq!(c.collect_garbage(Timestamp(1201)), vec![GlobalId(1)]);
        assert_eq!(c.tracked(), 0);
    }
}
