//! Per-stream pipeline: ingest thread, supervised worker and the state
//! both share with the scheduler.

pub(crate) mod queue;
mod state;
mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::attributes::AnalyzedTrack;
use crate::backend::{BackendKind, DeviceContext, InferenceBackend};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventPublisher, EventSink, EventSource};
use crate::frame::FrameSource;
use crate::scheduler::registry::DeviceLease;

pub use state::PipelineState;
pub(crate) use worker::WorkerDeps;

/// Point-in-time view of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub id: String,
    pub state: PipelineState,
    pub backend: Option<BackendKind>,
    /// Runtime name and device, e.g. `RKNN NPU (NPU:0)`
    pub device: Option<String>,
    pub processed_frames: u64,
    /// Evicted from the frame queue before processing
    pub dropped_frames: u64,
    pub out_of_order_frames: u64,
    pub backend_failures: u64,
    pub restarts: u32,
    pub active_tracks: usize,
    pub frame_rate: f32,
    pub last_error: Option<String>,
    pub uptime: Duration,
    /// Live tracks as of the last processed frame, ordered by id
    pub tracks: Vec<AnalyzedTrack>,
}

#[derive(Default)]
struct PipelineStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    out_of_order: AtomicU64,
    backend_failures: AtomicU64,
    restarts: AtomicU32,
    active_tracks: AtomicUsize,
    /// f32 bits
    frame_rate: AtomicU32,
}

struct Status {
    state: PipelineState,
    /// State to return to when resumed
    resume_to: PipelineState,
    backend: Option<(BackendKind, String)>,
    last_error: Option<String>,
}

/// State shared between a pipeline's threads and its handles.
pub(crate) struct PipelineShared {
    id: Arc<str>,
    config: ArcSwap<PipelineConfig>,
    status: Mutex<Status>,
    changed: Condvar,
    stats: PipelineStats,
    cancelled: AtomicBool,
    paused: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    publisher: EventPublisher,
    tracks: ArcSwap<Vec<AnalyzedTrack>>,
    started: Instant,
}

impl PipelineShared {
    fn new(config: PipelineConfig, sink: Arc<dyn EventSink>) -> Self {
        let id: Arc<str> = Arc::from(config.id.as_str());
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            publisher: EventPublisher::new(EventSource::Pipeline(Arc::clone(&id)), sink),
            id,
            config: ArcSwap::from_pointee(config),
            status: Mutex::new(Status {
                state: PipelineState::Initializing,
                resume_to: PipelineState::Initializing,
                backend: None,
                last_error: None,
            }),
            changed: Condvar::new(),
            stats: PipelineStats::default(),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            tracks: ArcSwap::from_pointee(Vec::new()),
            started: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub(crate) fn config(&self) -> Arc<PipelineConfig> {
        self.config.load_full()
    }

    /// Picked up by the worker at the next frame boundary.
    pub(crate) fn store_config(&self, config: PipelineConfig) {
        self.config.store(Arc::new(config));
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.status().state
    }

    fn apply(&self, status: &mut Status, to: PipelineState, reason: Option<String>) {
        let from = status.state;
        status.state = to;
        if to == PipelineState::Failed {
            tracing::error!(pipeline = %self.id, %from, %to, reason = reason.as_deref(), "pipeline state changed");
        } else {
            tracing::info!(pipeline = %self.id, %from, %to, reason = reason.as_deref(), "pipeline state changed");
        }
        self.publisher.emit(EventKind::PipelineStateChanged { from, to, reason });
        self.changed.notify_all();
    }

    /// Worker-initiated transition. While paused only the state to resume
    /// into is updated. Returns whether the state changed.
    pub(crate) fn transition(&self, to: PipelineState, reason: Option<String>) -> bool {
        let mut status = self.status();
        if status.state == PipelineState::Paused && !to.is_terminal() {
            status.resume_to = to;
            return false;
        }
        if !status.state.can_transition_to(to) {
            tracing::debug!(pipeline = %self.id, from = %status.state, %to, "ignoring state transition");
            return false;
        }
        self.apply(&mut status, to, reason);
        true
    }

    pub(crate) fn pause(&self) -> Result<()> {
        let mut status = self.status();
        match status.state {
            state if state.is_terminal() => Err(self.invalid_state(state)),
            PipelineState::Paused => Ok(()),
            from => {
                status.resume_to = from;
                self.paused.store(true, Ordering::SeqCst);
                self.apply(&mut status, PipelineState::Paused, Some("pause requested".into()));
                self.wake();
                Ok(())
            }
        }
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let mut status = self.status();
        match status.state {
            state if state.is_terminal() => Err(self.invalid_state(state)),
            PipelineState::Paused => {
                let to = status.resume_to;
                self.paused.store(false, Ordering::SeqCst);
                self.apply(&mut status, to, Some("resume requested".into()));
                self.wake();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn invalid_state(&self, state: PipelineState) -> Error {
        Error::InvalidState {
            pipeline: self.id.to_string(),
            state,
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        // one pending wake-up is enough
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }

    /// Block until `timeout` elapses or the pipeline is woken. Returns
    /// `true` if cancelled.
    pub(crate) fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = self.wake_rx.recv_timeout(remaining);
        }
        self.is_cancelled()
    }

    /// Block while paused. Returns `true` if cancelled.
    pub(crate) fn wait_while_paused(&self, poll: Duration) -> bool {
        while self.is_paused() && !self.is_cancelled() {
            let _ = self.wake_rx.recv_timeout(poll);
        }
        self.is_cancelled()
    }

    pub(crate) fn set_backend(&self, backend: Option<&InferenceBackend>) {
        self.status().backend = backend.map(|b| (b.kind(), format!("{} ({})", b.name(), b.device().label())));
    }

    pub(crate) fn record_error(&self, error: impl Into<String>) {
        self.status().last_error = Some(error.into());
    }

    pub(crate) fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub(crate) fn count_processed(&self, active_tracks: usize) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active_tracks.store(active_tracks, Ordering::Relaxed);
    }

    pub(crate) fn set_tracks(&self, tracks: Vec<AnalyzedTrack>) {
        self.tracks.store(Arc::new(tracks));
    }

    pub(crate) fn count_dropped(&self, frames: u64) {
        self.stats.dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn count_out_of_order(&self) {
        self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_backend_failure(&self) {
        self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_restarts(&self, restarts: u32) {
        self.stats.restarts.store(restarts, Ordering::Relaxed);
    }

    pub(crate) fn set_frame_rate(&self, fps: f32) {
        self.stats.frame_rate.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineSnapshot {
        let status = self.status();
        PipelineSnapshot {
            id: self.id.to_string(),
            state: status.state,
            backend: status.backend.as_ref().map(|(kind, _)| *kind),
            device: status.backend.as_ref().map(|(_, name)| name.clone()),
            processed_frames: self.stats.processed.load(Ordering::Relaxed),
            dropped_frames: self.stats.dropped.load(Ordering::Relaxed),
            out_of_order_frames: self.stats.out_of_order.load(Ordering::Relaxed),
            backend_failures: self.stats.backend_failures.load(Ordering::Relaxed),
            restarts: self.stats.restarts.load(Ordering::Relaxed),
            active_tracks: self.stats.active_tracks.load(Ordering::Relaxed),
            frame_rate: f32::from_bits(self.stats.frame_rate.load(Ordering::Relaxed)),
            last_error: status.last_error.clone(),
            uptime: self.started.elapsed(),
            tracks: self.tracks.load().as_ref().clone(),
        }
    }
}

struct Threads {
    worker: Mutex<Option<JoinHandle<()>>>,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
    threads: Arc<Threads>,
}

impl PipelineHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.shared.snapshot()
    }

    /// Configuration currently in effect.
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.shared.config()
    }

    /// Wait until the state satisfies `predicate`. Returns the matching
    /// state, or `None` on timeout.
    pub fn wait_for_state(
        &self,
        predicate: impl Fn(PipelineState) -> bool,
        timeout: Duration,
    ) -> Option<PipelineState> {
        let status = self.shared.status();
        let (status, _) = self
            .shared
            .changed
            .wait_timeout_while(status, timeout, |status| !predicate(status.state))
            .unwrap_or_else(PoisonError::into_inner);
        predicate(status.state).then_some(status.state)
    }

    pub(crate) fn shared(&self) -> &PipelineShared {
        &self.shared
    }

    /// Cancel both threads and wait for them. The pipeline ends in
    /// `Stopped` unless it had already failed.
    pub(crate) fn stop(&self) {
        self.shared.cancel();
        for slot in [&self.threads.worker, &self.threads.ingest] {
            let thread = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::error!(pipeline = %self.shared.id, "pipeline thread panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Start the ingest and worker threads of a pipeline admitted with
/// `lease`.
pub(crate) fn spawn(
    config: PipelineConfig,
    source: Box<dyn FrameSource>,
    deps: WorkerDeps,
    lease: (DeviceLease, DeviceContext),
    sink: Arc<dyn EventSink>,
) -> io::Result<PipelineHandle> {
    let (producer, consumer) = queue::drop_oldest(config.queue_capacity);
    let frame_timeout = deps.runtime.scheduler.frame_timeout();
    let shared = Arc::new(PipelineShared::new(config, sink));

    let worker = worker::Worker::new(Arc::clone(&shared), deps, consumer, lease);
    let worker = thread::Builder::new()
        .name(format!("pipeline-{}", shared.id))
        .spawn(move || worker.supervise())?;

    let ingest = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("ingest-{}", shared.id))
            .spawn(move || worker::ingest(source, producer, &shared, frame_timeout))
    };
    let ingest = match ingest {
        Ok(ingest) => ingest,
        Err(err) => {
            // without a source the worker would idle until cancelled
            shared.cancel();
            let _ = worker.join();
            return Err(err);
        }
    };

    Ok(PipelineHandle {
        shared,
        threads: Arc::new(Threads {
            worker: Mutex::new(Some(worker)),
            ingest: Mutex::new(Some(ingest)),
        }),
    })
}
