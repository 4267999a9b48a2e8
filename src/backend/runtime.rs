//! Device executors and the closed set of backend implementations.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::backend::detection::{Detection, RawDetection};
use crate::backend::model::{ModelHandle, ModelRuntime, RuntimeError};
use crate::backend::postprocess::{Thresholds, postprocess};
use crate::backend::selection::{BackendKind, DeviceConfig};
use crate::error::{BackendInitError, InferenceError};
use crate::frame::Frame;

/// Access mode for a device context.
///
/// A shared context carries the per-device lock; every executor on that
/// device holds it for the duration of a forward pass.
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    lock: Option<Arc<Mutex<()>>>,
}

impl DeviceContext {
    pub fn exclusive() -> Self {
        Self { lock: None }
    }

    pub fn shared(lock: Arc<Mutex<()>>) -> Self {
        Self { lock: Some(lock) }
    }

    pub fn is_shared(&self) -> bool {
        self.lock.is_some()
    }
}

struct Request {
    seq: u64,
    frame: Frame,
}

struct Response {
    seq: u64,
    result: Result<Vec<RawDetection>, RuntimeError>,
}

/// Runs forward passes on a dedicated thread so that `infer` can give up
/// after the device timeout.
///
/// A timed-out pass keeps running on the executor; its response carries an
/// old sequence number and is discarded by the next `infer`. Dropping the
/// executor closes the request channel and the thread exits after the
/// in-flight pass, if any, completes.
struct DeviceExecutor {
    kind: BackendKind,
    requests: Sender<Request>,
    responses: Receiver<Response>,
    next_seq: u64,
    timeout: Duration,
}

impl DeviceExecutor {
    fn spawn(
        device: &DeviceConfig,
        runtime: Arc<dyn ModelRuntime>,
        context: DeviceContext,
    ) -> Result<Self, BackendInitError> {
        let (request_tx, request_rx) = crossbeam_channel::bounded::<Request>(0);
        let (response_tx, response_rx) = crossbeam_channel::unbounded::<Response>();

        thread::Builder::new()
            .name(format!("{}-executor-{}", device.kind, device.device_id).to_lowercase())
            .spawn(move || {
                for request in request_rx.iter() {
                    let result = {
                        let _guard = context
                            .lock
                            .as_ref()
                            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
                        panic::catch_unwind(AssertUnwindSafe(|| runtime.forward(&request.frame)))
                            .unwrap_or_else(|_| Err(RuntimeError::new("model runtime panicked")))
                    };
                    let response = Response {
                        seq: request.seq,
                        result,
                    };
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| BackendInitError::Executor {
                kind: device.kind,
                source,
            })?;

        Ok(Self {
            kind: device.kind,
            requests: request_tx,
            responses: response_rx,
            next_seq: 0,
            timeout: device.inference_timeout(),
        })
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let deadline = Instant::now() + self.timeout;

        // rendezvous: blocks while the executor is still busy with a
        // previous, abandoned request
        match self.requests.send_timeout(
            Request {
                seq,
                frame: frame.clone(),
            },
            self.timeout,
        ) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(self.timed_out()),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(InferenceError::Disconnected { backend: self.kind });
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.seq == seq => {
                    return response.result.map_err(|err| InferenceError::Runtime {
                        backend: self.kind,
                        message: err.message,
                    });
                }
                Ok(stale) => {
                    tracing::trace!(backend = %self.kind, seq = stale.seq, "discarding stale response");
                }
                Err(RecvTimeoutError::Timeout) => return Err(self.timed_out()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(InferenceError::Disconnected { backend: self.kind });
                }
            }
        }
    }

    fn timed_out(&self) -> InferenceError {
        InferenceError::Timeout {
            backend: self.kind,
            timeout: self.timeout,
        }
    }
}

/// State common to every backend variant.
struct BackendCore {
    device: DeviceConfig,
    model: ModelHandle,
    executor: DeviceExecutor,
    thresholds: Thresholds,
    shared: bool,
}

impl BackendCore {
    fn start(model: ModelHandle, device: &DeviceConfig, context: DeviceContext) -> Result<Self, BackendInitError> {
        if !device.enabled {
            return Err(BackendInitError::DeviceUnavailable {
                kind: device.kind,
                device_id: device.device_id,
            });
        }
        let shared = context.is_shared();
        let executor = DeviceExecutor::spawn(device, Arc::clone(model.runtime()), context)?;
        Ok(Self {
            device: device.clone(),
            model,
            executor,
            thresholds: Thresholds::default(),
            shared,
        })
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let raw = self.executor.infer(frame)?;
        Ok(postprocess(
            &raw,
            &self.thresholds,
            frame.width,
            frame.height,
            self.device.kind,
        ))
    }
}

/// Rockchip-style NPU. Usually one context per core, shared by all streams.
pub struct NpuBackend {
    core: BackendCore,
}

/// CUDA/TensorRT GPU.
pub struct GpuBackend {
    core: BackendCore,
}

/// CPU fallback. Always present unless disabled in configuration.
pub struct CpuBackend {
    core: BackendCore,
}

/// The closed set of backend implementations.
pub enum InferenceBackend {
    Npu(NpuBackend),
    Gpu(GpuBackend),
    Cpu(CpuBackend),
}

impl InferenceBackend {
    /// Bind `model` to `device`, starting its executor thread.
    pub fn initialize(
        model: ModelHandle,
        device: &DeviceConfig,
        context: DeviceContext,
    ) -> Result<Self, BackendInitError> {
        let core = BackendCore::start(model, device, context)?;
        Ok(match device.kind {
            BackendKind::Npu => InferenceBackend::Npu(NpuBackend { core }),
            BackendKind::Gpu => InferenceBackend::Gpu(GpuBackend { core }),
            BackendKind::Cpu => InferenceBackend::Cpu(CpuBackend { core }),
        })
    }

    /// Detect objects in `frame`, ordered by [`Detection::rank_cmp`].
    ///
    /// Fails with [`InferenceError::Timeout`] if the device does not answer
    /// within its configured timeout.
    pub fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        self.core_mut().infer(frame)
    }

    pub fn kind(&self) -> BackendKind {
        self.core().device.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.core().device
    }

    pub fn model(&self) -> &ModelHandle {
        &self.core().model
    }

    pub fn class_names(&self) -> &[String] {
        self.core().model.class_names()
    }

    pub fn is_shared(&self) -> bool {
        self.core().shared
    }

    pub fn thresholds(&self) -> Thresholds {
        self.core().thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.core_mut().thresholds = thresholds;
    }

    fn core(&self) -> &BackendCore {
        match self {
            InferenceBackend::Npu(b) => &b.core,
            InferenceBackend::Gpu(b) => &b.core,
            InferenceBackend::Cpu(b) => &b.core,
        }
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        match self {
            InferenceBackend::Npu(b) => &mut b.core,
            InferenceBackend::Gpu(b) => &mut b.core,
            InferenceBackend::Cpu(b) => &mut b.core,
        }
    }
}

impl std::fmt::Debug for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceBackend")
            .field("kind", &self.kind())
            .field("device", &self.device().label())
            .field("shared", &self.is_shared())
            .finish()
    }
}
