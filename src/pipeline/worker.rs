//! Supervised per-pipeline worker and its ingest thread.
//!
//! The supervisor runs sessions. A session binds a backend and processes
//! frames until it is cancelled, the stream ends, or it crashes. Crashes
//! are restarted with exponential backoff until the restart budget is
//! spent. Tracker and attribute state outlive sessions, so track ids are
//! never reused across restarts. The device reservation outlives them too:
//! a pipeline backing off after a crash keeps its slot.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::select;

use crate::attributes::{AttributeAnalyzer, AttributeModel};
use crate::backend::{
    BackendPreference, BackendSelector, BoundBackend, DeviceConfig, DeviceContext, InferenceBackend, ModelLoader,
};
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::correlator::{CorrelatorHandle, TrackKey, TrackUpdate};
use crate::error::{BackendInitError, Error};
use crate::events::EventKind;
use crate::frame::{Frame, FrameSource, SourcePoll, Timestamp};
use crate::pipeline::PipelineShared;
use crate::pipeline::queue::{FrameConsumer, FrameProducer};
use crate::pipeline::state::PipelineState;
use crate::scheduler::registry::{DeviceLease, DeviceRegistry};
use crate::tracker::{ObjectTracker, TrackEvent, TrackState, TrackerOutput};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Collaborators a worker borrows from the scheduler.
pub(crate) struct WorkerDeps {
    pub runtime: Arc<RuntimeConfig>,
    pub loader: Arc<dyn ModelLoader>,
    pub registry: Arc<DeviceRegistry>,
    pub correlator: Option<CorrelatorHandle>,
    pub attribute_model: Option<Box<dyn AttributeModel>>,
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    EndOfStream,
    Crashed(String),
}

/// A device slot and the context handed out with it.
type Reservation = (DeviceLease, DeviceContext);

struct Session {
    backend: InferenceBackend,
    /// Position of the bound device among the candidates
    index: usize,
    consecutive_failures: u32,
}

/// Frames processed per wall-clock second.
struct RateWindow {
    started: Instant,
    frames: u32,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        let elapsed = self.started.elapsed();
        if elapsed < RATE_WINDOW {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        *self = Self::new();
        Some(fps)
    }
}

pub(crate) struct Worker {
    shared: Arc<PipelineShared>,
    runtime: Arc<RuntimeConfig>,
    loader: Arc<dyn ModelLoader>,
    registry: Arc<DeviceRegistry>,
    correlator: Option<CorrelatorHandle>,
    frames: FrameConsumer,
    tracker: ObjectTracker,
    analyzer: AttributeAnalyzer,
    /// Configuration last applied to the backend and tracker
    applied: Arc<PipelineConfig>,
    /// Slot held from admission until the pipeline stops or fails; moved
    /// only when a bind lands on another device
    reservation: Option<Reservation>,
    preference: BackendPreference,
    /// First candidate to probe; advanced by demotion
    next_candidate: usize,
    demoted: bool,
    last_timestamp: Option<Timestamp>,
    rate: RateWindow,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<PipelineShared>,
        deps: WorkerDeps,
        frames: FrameConsumer,
        admitted: Reservation,
    ) -> Self {
        let applied = shared.config();
        let tracker = ObjectTracker::new(deps.runtime.tracker_for(&applied));
        let analyzer = AttributeAnalyzer::new(deps.attribute_model, applied.attribute_cadence);
        Self {
            runtime: deps.runtime,
            loader: deps.loader,
            registry: deps.registry,
            correlator: deps.correlator,
            frames,
            tracker,
            analyzer,
            preference: applied.backend,
            applied,
            reservation: Some(admitted),
            next_candidate: 0,
            demoted: false,
            last_timestamp: None,
            rate: RateWindow::new(),
            shared,
        }
    }

    pub(crate) fn supervise(mut self) {
        let _span = tracing::info_span!("pipeline", id = %self.shared.id()).entered();
        let scheduler = self.runtime.scheduler.clone();
        let mut restarts = 0u32;

        loop {
            let end = if self.shared.wait_while_paused(scheduler.frame_timeout()) {
                SessionEnd::Cancelled
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| self.run_session()))
                    .unwrap_or_else(|payload| SessionEnd::Crashed(panic_message(payload.as_ref())))
            };

            let reason = match end {
                SessionEnd::Cancelled => {
                    self.stop("cancelled");
                    break;
                }
                SessionEnd::EndOfStream => {
                    self.stop("end of stream");
                    break;
                }
                SessionEnd::Crashed(reason) => reason,
            };

            self.shared.set_backend(None);
            self.shared.record_error(reason.clone());
            restarts += 1;
            if restarts > scheduler.restart_budget {
                let err = Error::PipelineCrashLoop {
                    pipeline: self.shared.id().to_string(),
                    restarts: restarts - 1,
                };
                self.reservation = None;
                self.shared.transition(PipelineState::Failed, Some(err.to_string()));
                break;
            }
            self.shared.set_restarts(restarts);

            let delay = scheduler.backoff(restarts);
            tracing::warn!(restart = restarts, backoff = ?delay, error = %reason, "pipeline crashed, restarting");
            self.shared.transition(PipelineState::Initializing, Some(reason));
            if self.shared.sleep(delay) {
                self.stop("cancelled");
                break;
            }
        }

        // the ingest thread has nobody left to feed
        self.shared.cancel();
        tracing::debug!(state = %self.shared.state(), "worker exited");
    }

    /// Give the device slot back, then report `Stopped`.
    fn stop(&mut self, reason: &str) {
        self.reservation = None;
        self.shared.transition(PipelineState::Stopped, Some(reason.into()));
    }

    fn run_session(&mut self) -> SessionEnd {
        self.refresh_config();
        let mut session = match self.bind() {
            Ok(session) => session,
            Err(err) => return SessionEnd::Crashed(err.to_string()),
        };
        self.shared.set_backend(Some(&session.backend));
        let state = if self.demoted {
            PipelineState::Degraded
        } else {
            PipelineState::Running
        };
        self.shared.transition(state, Some(format!("bound {}", session.backend.device().label())));

        let poll = self.runtime.scheduler.frame_timeout();
        loop {
            if self.shared.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            if self.shared.is_paused() {
                if self.shared.wait_while_paused(poll) {
                    return SessionEnd::Cancelled;
                }
                continue;
            }

            let frame = select! {
                recv(self.frames.receiver()) -> frame => match frame {
                    Ok(frame) => frame,
                    Err(_) => return SessionEnd::EndOfStream,
                },
                recv(self.shared.wake_receiver()) -> _ => continue,
                default(poll) => continue,
            };

            if let Some(end) = self.process(&mut session, frame) {
                return end;
            }
        }
    }

    /// Enabled candidate devices for the current preference, in probe order.
    fn candidates(&self) -> Vec<DeviceConfig> {
        self.preference
            .candidate_devices(&self.runtime.devices)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Probe candidates from `next_candidate` on and bind the first backend
    /// that comes up.
    fn bind(&mut self) -> Result<Session, BackendInitError> {
        let candidates = self.candidates();
        let selector = BackendSelector::new(
            self.loader.as_ref(),
            &self.runtime.model.path,
            self.runtime.model.class_count,
            self.applied.thresholds(),
        );
        let registry = &self.registry;
        let held = self.reservation.as_ref();
        let id = self.shared.id();
        let fps = self.applied.target_fps;

        let BoundBackend { backend, lease } = selector.probe(candidates.iter().skip(self.next_candidate), |device| {
            reserve_slot(registry, held, device, id, fps)
        })?;
        if let Some(moved) = lease {
            // the old slot is released only once the new device is bound
            self.reservation = Some(moved);
        }
        let index = position(&candidates, backend.device());
        self.next_candidate = index;
        Ok(Session {
            backend,
            index,
            consecutive_failures: 0,
        })
    }

    /// Move the session to the next candidate that comes up.
    fn demote(&mut self, session: &mut Session) -> Result<(), String> {
        let candidates = self.candidates();
        let selector = BackendSelector::new(
            self.loader.as_ref(),
            &self.runtime.model.path,
            self.runtime.model.class_count,
            self.applied.thresholds(),
        );
        let registry = &self.registry;
        let held = self.reservation.as_ref();
        let id = self.shared.id();
        let fps = self.applied.target_fps;
        let from = session.backend.device().label();

        let BoundBackend { backend, lease } = selector
            .probe(candidates.iter().skip(session.index + 1), |device| {
                reserve_slot(registry, held, device, id, fps)
            })
            .map_err(|err| format!("{from} failed {} times and {err}", session.consecutive_failures))?;
        if let Some(moved) = lease {
            self.reservation = Some(moved);
        }

        let to = backend.device().label();
        tracing::warn!(%from, %to, failures = session.consecutive_failures, "demoting pipeline backend");
        session.index = position(&candidates, backend.device());
        session.backend = backend;
        session.consecutive_failures = 0;
        self.next_candidate = session.index;
        self.demoted = true;

        self.shared.set_backend(Some(&session.backend));
        self.shared
            .transition(PipelineState::Degraded, Some(format!("fell back from {from} to {to}")));
        Ok(())
    }

    /// Apply a configuration swapped in since the last frame.
    fn refresh_config(&mut self) {
        let config = self.shared.config();
        if Arc::ptr_eq(&config, &self.applied) {
            return;
        }
        self.tracker.set_config(self.runtime.tracker_for(&config));
        self.analyzer.set_cadence(config.attribute_cadence);
        if config.backend != self.preference {
            // takes effect on the next bind
            self.preference = config.backend;
            self.next_candidate = 0;
            self.demoted = false;
        }
        tracing::info!("pipeline configuration updated");
        self.applied = config;
    }

    fn process(&mut self, session: &mut Session, frame: Frame) -> Option<SessionEnd> {
        if self.last_timestamp.is_some_and(|last| frame.timestamp < last) {
            tracing::debug!(timestamp = %frame.timestamp, "discarding out-of-order frame");
            self.shared.count_out_of_order();
            return None;
        }
        self.last_timestamp = Some(frame.timestamp);

        self.refresh_config();
        session.backend.set_thresholds(self.applied.thresholds());

        let detections = match session.backend.infer(&frame) {
            Ok(detections) => {
                session.consecutive_failures = 0;
                detections
            }
            Err(err) => {
                self.shared.count_backend_failure();
                session.consecutive_failures += 1;
                tracing::warn!(
                    backend = %session.backend.kind(),
                    failures = session.consecutive_failures,
                    error = %err,
                    "inference failed, skipping frame"
                );
                if session.consecutive_failures >= self.runtime.scheduler.failure_threshold {
                    if let Err(reason) = self.demote(session) {
                        return Some(SessionEnd::Crashed(reason));
                    }
                }
                return None;
            }
        };

        let detections: Vec<_> = detections
            .into_iter()
            .filter(|d| self.applied.is_class_enabled(d.class_id))
            .collect();
        let output = self.tracker.update(&detections, frame.timestamp);
        self.publish(&frame, &output);

        self.shared.count_processed(self.tracker.active_count());
        if let Some(fps) = self.rate.tick() {
            self.shared.set_frame_rate(fps);
        }
        None
    }

    fn publish(&mut self, frame: &Frame, output: &TrackerOutput) {
        let publisher = self.shared.publisher();
        let id = self.shared.id();
        let key = |track| TrackKey {
            pipeline: Arc::clone(id),
            track,
        };

        for event in &output.events {
            match event {
                TrackEvent::Created(track) => publisher.emit(EventKind::TrackCreated {
                    track: track.id,
                    class_id: track.class_id,
                    bbox: track.bbox,
                    timestamp: frame.timestamp,
                }),
                TrackEvent::Confirmed { track, recovered } => publisher.emit(EventKind::TrackConfirmed {
                    track: track.id,
                    class_id: track.class_id,
                    bbox: track.bbox,
                    timestamp: frame.timestamp,
                    recovered: *recovered,
                }),
                TrackEvent::Lost(track) => {
                    publisher.emit(EventKind::TrackLost {
                        track: track.id,
                        timestamp: frame.timestamp,
                    });
                    if let Some(correlator) = &self.correlator {
                        correlator.submit(TrackUpdate::Lost {
                            key: key(track.id),
                            timestamp: frame.timestamp,
                        });
                    }
                }
                TrackEvent::Purged(track) => {
                    self.analyzer.invalidate(*track);
                    if let Some(correlator) = &self.correlator {
                        correlator.submit(TrackUpdate::Purged { key: key(*track) });
                    }
                }
            }
        }

        let produced: HashMap<_, _> = self.analyzer.process(frame, &output.tracks).into_iter().collect();
        self.shared.set_tracks(self.analyzer.annotate(&output.tracks));
        let Some(correlator) = &self.correlator else {
            return;
        };
        for track in &output.tracks {
            if track.state != TrackState::Confirmed || track.last_seen != frame.timestamp {
                continue;
            }
            correlator.submit(TrackUpdate::Observed {
                key: key(track.id),
                class_id: track.class_id,
                timestamp: frame.timestamp,
                embedding: produced.get(&track.id).and_then(|attributes| attributes.embedding.clone()),
            });
        }
    }
}

/// Reuse the pipeline's own reservation when it is on `device`, otherwise
/// take a new slot. A new slot is returned so the caller can keep it.
fn reserve_slot(
    registry: &Arc<DeviceRegistry>,
    held: Option<&Reservation>,
    device: &DeviceConfig,
    pipeline: &Arc<str>,
    fps: f32,
) -> Result<(Option<Reservation>, DeviceContext), String> {
    match held {
        Some((lease, context)) if same_device(lease.device(), device) => Ok((None, context.clone())),
        _ => {
            let (lease, context) = registry.reserve(device, pipeline, fps).map_err(|reason| reason.to_string())?;
            Ok((Some((lease, context.clone())), context))
        }
    }
}

fn same_device(a: &DeviceConfig, b: &DeviceConfig) -> bool {
    a.kind == b.kind && a.device_id == b.device_id
}

fn position(candidates: &[DeviceConfig], device: &DeviceConfig) -> usize {
    candidates
        .iter()
        .position(|candidate| same_device(candidate, device))
        .unwrap_or(0)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("worker panicked: {message}")
}

/// Pull frames from `source` into the queue until the stream ends or the
/// pipeline is cancelled. Dropping the producer at end of stream lets the
/// worker drain what is queued and stop.
pub(crate) fn ingest(
    mut source: Box<dyn FrameSource>,
    producer: FrameProducer,
    shared: &PipelineShared,
    timeout: Duration,
) {
    let _span = tracing::debug_span!("ingest", pipeline = %shared.id()).entered();
    while !shared.is_cancelled() {
        match source.next_frame(timeout) {
            SourcePoll::Frame(frame) => {
                let evicted = producer.push(frame);
                if evicted > 0 {
                    tracing::trace!(evicted, "frame queue full, dropped oldest");
                    shared.count_dropped(evicted);
                }
            }
            SourcePoll::Timeout => {}
            SourcePoll::EndOfStream => {
                tracing::info!("end of stream");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "worker panicked: boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "worker panicked: static");
    }

    #[test]
    fn test_rate_window_waits_a_second() {
        let mut rate = RateWindow::new();
        assert_eq!(rate.tick(), None);
        rate.started -= RATE_WINDOW;
        let fps = rate.tick().unwrap();
        assert!(fps > 0.0 && fps <= 2.0);
        assert_eq!(rate.frames, 0);
    }
}
