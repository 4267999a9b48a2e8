//! Bounded queue that drops the oldest item instead of blocking producers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::frame::Frame;

pub type FrameProducer = QueueProducer<Frame>;
pub type FrameConsumer = QueueConsumer<Frame>;

/// Create a drop-oldest queue holding at most `capacity` items.
///
/// The producer keeps a receiver clone so it can evict from the front when
/// the channel is full. Producers never block and never see backpressure.
pub fn drop_oldest<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueProducer {
            tx,
            evict: rx.clone(),
            dropped: Arc::clone(&dropped),
        },
        QueueConsumer { rx, dropped },
    )
}

pub struct QueueProducer<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Enqueue `item`, evicting the oldest entries while the queue is full.
    /// Returns the number of items evicted.
    pub fn push(&self, mut item: T) -> u64 {
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.evict.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // consumer gone; nothing to deliver to
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct QueueConsumer<T> {
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> QueueConsumer<T> {
    /// Underlying receiver, for `select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
