//! Background thread that feeds the correlator from every pipeline.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, select};

use crate::correlator::engine::{CorrelationEvent, CorrelatorConfig, CrossStreamCorrelator, TrackUpdate};
use crate::correlator::identity::{GlobalId, GlobalIdentity, TrackKey};
use crate::events::{EventKind, EventPublisher, EventSink, EventSource};
use crate::pipeline::queue::{QueueConsumer, QueueProducer, drop_oldest};

const GC_INTERVAL: Duration = Duration::from_secs(1);

pub struct CorrelatorService;

impl CorrelatorService {
    /// Start the correlator thread behind a drop-oldest queue of
    /// `capacity` updates.
    ///
    /// Track updates from different pipelines may arrive in any order. The
    /// thread stops when every handle is dropped or `shutdown` is called.
    pub fn spawn(
        config: CorrelatorConfig,
        capacity: usize,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<CorrelatorHandle> {
        let (producer, consumer) = drop_oldest(capacity);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let correlator = Arc::new(Mutex::new(CrossStreamCorrelator::new(config)));
        let publisher = EventPublisher::new(EventSource::Correlator, sink);

        let thread = {
            let correlator = Arc::clone(&correlator);
            thread::Builder::new()
                .name("correlator".into())
                .spawn(move || run(consumer, shutdown_rx, correlator, publisher))?
        };

        Ok(CorrelatorHandle {
            queue: producer,
            shared: Arc::new(Shared {
                correlator,
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }
}

fn run(
    consumer: QueueConsumer<TrackUpdate>,
    shutdown: crossbeam_channel::Receiver<()>,
    correlator: Arc<Mutex<CrossStreamCorrelator>>,
    publisher: EventPublisher,
) {
    let _span = tracing::info_span!("correlator").entered();
    tracing::debug!("correlator started");
    let mut last_gc = Instant::now();

    loop {
        select! {
            recv(consumer.receiver()) -> update => match update {
                Ok(update) => {
                    let events = correlator
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .ingest(update);
                    for event in events {
                        publisher.emit(into_event_kind(event));
                    }
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            default(GC_INTERVAL) => {}
        }

        if last_gc.elapsed() >= GC_INTERVAL {
            let mut correlator = correlator.lock().unwrap_or_else(PoisonError::into_inner);
            let now = correlator.now();
            let removed = correlator.collect_garbage(now);
            if !removed.is_empty() {
                tracing::debug!(count = removed.len(), "collected global identities");
            }
            last_gc = Instant::now();
        }
    }
    tracing::debug!(dropped = consumer.dropped(), "correlator stopped");
}

fn into_event_kind(event: CorrelationEvent) -> EventKind {
    match event {
        CorrelationEvent::Merged {
            identity,
            members,
            confidence,
        } => EventKind::GlobalIdentityMerged {
            identity,
            members,
            confidence,
        },
        CorrelationEvent::Ambiguous { a, b, similarity } => EventKind::AmbiguousCorrelation { a, b, similarity },
    }
}

struct Shared {
    correlator: Arc<Mutex<CrossStreamCorrelator>>,
    shutdown: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn stop(&self) {
        // dropping the sender wakes the select
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("correlator thread panicked");
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable handle held by the scheduler and every pipeline.
#[derive(Clone)]
pub struct CorrelatorHandle {
    queue: QueueProducer<TrackUpdate>,
    shared: Arc<Shared>,
}

impl CorrelatorHandle {
    /// Queue an update. Never blocks; the oldest update is dropped when the
    /// queue is full.
    pub fn submit(&self, update: TrackUpdate) {
        self.queue.push(update);
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn identities(&self) -> Vec<GlobalIdentity> {
        self.lock().identities().cloned().collect()
    }

    pub fn identity_of(&self, key: &TrackKey) -> Option<GlobalId> {
        self.lock().identity_of(key)
    }

    /// Stop the thread after the update in progress. Later submissions
    /// are discarded.
    pub fn shutdown(&self) {
        self.shared.stop();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CrossStreamCorrelator> {
        self.shared.correlator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::frame::Timestamp;
    use crate::tracker::TrackId;

    #[test]
    fn test_merge_event_is_published() {
        let (sink, rx) = ChannelSink::new();
        let handle = CorrelatorService::spawn(CorrelatorConfig::default(), 16, Arc::new(sink)).unwrap();
        for (pipeline, ts) in [("a", 0), ("b", 40)] {
            handle.submit(TrackUpdate::Observed {
                key: TrackKey::new(pipeline, TrackId(1)),
                class_id: 0,
                timestamp: Timestamp(ts),
                embedding: Some(vec![0.6, 0.8]),
            });
        }

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.source, EventSource::Correlator);
        assert_eq!(event.sequence, 1);
        assert!(matches!(event.kind, EventKind::GlobalIdentityMerged { .. }));
        assert_eq!(handle.identities().len(), 1);

        handle.shutdown();
        handle.shutdown();
    }
}
