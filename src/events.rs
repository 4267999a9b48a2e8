//! Events published to the external sink.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::correlator::{GlobalId, TrackKey};
use crate::frame::Timestamp;
use crate::pipeline::PipelineState;
use crate::scheduler::ResourceKind;
use crate::tracker::{Rect, TrackId};

/// Who emitted an event. Sequence numbers are counted per source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    Pipeline(Arc<str>),
    Correlator,
    Scheduler,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Pipeline(id) => write!(f, "pipeline/{id}"),
            EventSource::Correlator => f.write_str("correlator"),
            EventSource::Scheduler => f.write_str("scheduler"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source: EventSource,
    /// Monotonic per source, starting at 1
    pub sequence: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    TrackCreated {
        track: TrackId,
        class_id: u32,
        bbox: Rect,
        timestamp: Timestamp,
    },
    TrackConfirmed {
        track: TrackId,
        class_id: u32,
        bbox: Rect,
        timestamp: Timestamp,
        /// A lost track was re-associated
        recovered: bool,
    },
    TrackLost {
        track: TrackId,
        timestamp: Timestamp,
    },
    GlobalIdentityMerged {
        identity: GlobalId,
        members: Vec<TrackKey>,
        confidence: f32,
    },
    /// Similarity between the candidate and strong thresholds. Left for an
    /// external consumer to resolve.
    AmbiguousCorrelation {
        a: TrackKey,
        b: TrackKey,
        similarity: f32,
    },
    PipelineStateChanged {
        from: PipelineState,
        to: PipelineState,
        reason: Option<String>,
    },
    ResourceAlert {
        resource: ResourceKind,
        value: f32,
        threshold: f32,
    },
}

/// Consumer of emitted events.
///
/// `publish` is called while the emitting source holds its sequence lock,
/// so a sink sees each source's events in sequence order. It should not
/// block for long.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Assigns sequence numbers for one source and delivers to the sink.
pub struct EventPublisher {
    source: EventSource,
    sink: Arc<dyn EventSink>,
    sequence: Mutex<u64>,
}

impl EventPublisher {
    pub fn new(source: EventSource, sink: Arc<dyn EventSink>) -> Self {
        Self {
            source,
            sink,
            sequence: Mutex::new(0),
        }
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn emit(&self, kind: EventKind) {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        self.sink.publish(Event {
            source: self.source.clone(),
            sequence: *sequence,
            kind,
        });
    }

    /// Last sequence number handed out.
    pub fn last_sequence(&self) -> u64 {
        *self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards events into an unbounded crossbeam channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: Event) {
        // receiver gone: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Writes every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: Event) {
        match &event.kind {
            EventKind::ResourceAlert { .. } | EventKind::AmbiguousCorrelation { .. } => {
                tracing::warn!(source = %event.source, seq = event.sequence, kind = ?event.kind, "event");
            }
            EventKind::PipelineStateChanged {
                to: PipelineState::Failed,
                ..
            } => {
                tracing::error!(source = %event.source, seq = event.sequence, kind = ?event.kind, "event");
            }
            _ => {
                tracing::info!(source = %event.source, seq = event.sequence, kind = ?event.kind, "event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_sequence_is_ordered_per_source() {
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);
        let publisher = Arc::new(EventPublisher::new(EventSource::Pipeline("cam-1".into()), Arc::clone(&sink)));
        let other = EventPublisher::new(EventSource::Scheduler, sink);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let publisher = Arc::clone(&publisher);
                thread::spawn(move || {
                    for i in 0..25 {
                        publisher.emit(EventKind::TrackLost {
                            track: TrackId(i),
                            timestamp: Timestamp(0),
                        });
                    }
                })
            })
            .collect();
        other.emit(EventKind::TrackLost {
            track: TrackId(0),
            timestamp: Timestamp(0),
        });
        for h in handles {
            h.join().unwrap();
        }

        let pipeline_seqs: Vec<u64> = rx
            .try_iter()
            .filter(|e| e.source != EventSource::Scheduler)
            .map(|e| e.sequence)
            .collect();
        assert_eq!(pipeline_seqs, (1..=100).collect::<Vec<_>>());
        assert_eq!(other.last_sequence(), 1);
    }
}
