//! Backend kinds, device configuration and AUTO selection.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::model::ModelLoader;
use crate::backend::postprocess::Thresholds;
use crate::backend::runtime::{DeviceContext, InferenceBackend};
use crate::error::BackendInitError;

/// Device family, in selection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Npu,
    Gpu,
    Cpu,
}

impl BackendKind {
    pub const PRIORITY: [BackendKind; 3] = [BackendKind::Npu, BackendKind::Gpu, BackendKind::Cpu];

    /// Human-readable runtime name, as reported in pipeline snapshots.
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Npu => "RKNN NPU",
            BackendKind::Gpu => "TensorRT GPU",
            BackendKind::Cpu => "OpenCV DNN CPU",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Npu => "NPU",
            BackendKind::Gpu => "GPU",
            BackendKind::Cpu => "CPU",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Probe every kind in priority order
    #[default]
    Auto,
    Npu,
    Gpu,
    Cpu,
}

impl BackendPreference {
    /// Kinds to try, in order.
    pub fn candidates(&self) -> Vec<BackendKind> {
        match self {
            BackendPreference::Auto => BackendKind::PRIORITY.to_vec(),
            BackendPreference::Npu => vec![BackendKind::Npu],
            BackendPreference::Gpu => vec![BackendKind::Gpu],
            BackendPreference::Cpu => vec![BackendKind::Cpu],
        }
    }

    /// Enabled devices this preference may use, in probe order.
    pub fn candidate_devices<'a>(&self, devices: &'a [DeviceConfig]) -> Vec<&'a DeviceConfig> {
        let mut out = Vec::new();
        for kind in self.candidates() {
            let mut of_kind: Vec<&DeviceConfig> =
                devices.iter().filter(|d| d.kind == kind && d.enabled).collect();
            of_kind.sort_by_key(|d| d.device_id);
            out.extend(of_kind);
        }
        out
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Auto => f.write_str("auto"),
            BackendPreference::Npu => write!(f, "{}", BackendKind::Npu),
            BackendPreference::Gpu => write!(f, "{}", BackendKind::Gpu),
            BackendPreference::Cpu => write!(f, "{}", BackendKind::Cpu),
        }
    }
}

/// One inference device and its admission budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: BackendKind,
    pub device_id: u32,
    pub enabled: bool,
    /// The device exposes a single context that all pipelines share.
    /// Access is serialized and admission is bounded by `throughput_fps`.
    pub shared_context: bool,
    /// Maximum concurrent pipelines on this device
    pub max_streams: u32,
    /// Aggregate frames per second the device sustains
    pub throughput_fps: f32,
    pub inference_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(BackendKind::Cpu)
    }
}

impl DeviceConfig {
    pub fn new(kind: BackendKind) -> Self {
        let (shared_context, max_streams, throughput_fps) = match kind {
            BackendKind::Npu => (true, 8, 240.0),
            BackendKind::Gpu => (false, 8, 480.0),
            BackendKind::Cpu => (false, 4, 60.0),
        };
        Self {
            kind,
            device_id: 0,
            enabled: true,
            shared_context,
            max_streams,
            throughput_fps,
            inference_timeout_ms: 1000,
        }
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    /// `NPU:0` style label used in logs and lease accounting.
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.device_id)
    }
}

/// Kinds with at least one enabled device, in priority order.
pub fn available_backends(devices: &[DeviceConfig]) -> Vec<BackendKind> {
    BackendKind::PRIORITY
        .into_iter()
        .filter(|kind| devices.iter().any(|d| d.kind == *kind && d.enabled))
        .collect()
}

/// A backend bound to a device together with whatever reservation the
/// caller took for it.
#[derive(Debug)]
pub struct BoundBackend<L> {
    pub backend: InferenceBackend,
    pub lease: L,
}

/// Probes devices in order and binds the first backend that comes up.
pub struct BackendSelector<'a> {
    loader: &'a dyn ModelLoader,
    model_path: &'a Path,
    expected_classes: usize,
    thresholds: Thresholds,
}

impl<'a> BackendSelector<'a> {
    pub fn new(
        loader: &'a dyn ModelLoader,
        model_path: &'a Path,
        expected_classes: usize,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            loader,
            model_path,
            expected_classes,
            thresholds,
        }
    }

    /// Try each device in turn. `reserve` is asked for a device slot before
    /// the model is loaded; a refusal counts as a failed attempt. The
    /// reservation of a failed attempt is dropped before the next one.
    pub fn probe<'d, L>(
        &self,
        devices: impl IntoIterator<Item = &'d DeviceConfig>,
        mut reserve: impl FnMut(&DeviceConfig) -> Result<(L, DeviceContext), String>,
    ) -> Result<BoundBackend<L>, BackendInitError> {
        let mut attempts = Vec::new();
        for device in devices {
            let (lease, context) = match reserve(device) {
                Ok(reserved) => reserved,
                Err(reason) => {
                    tracing::debug!(device = %device.label(), %reason, "device not reserved");
                    attempts.push((device.kind, reason));
                    continue;
                }
            };

            match self.bring_up(device, context) {
                Ok(backend) => {
                    tracing::info!(
                        device = %device.label(),
                        backend = backend.name(),
                        "inference backend bound"
                    );
                    return Ok(BoundBackend { backend, lease });
                }
                Err(err) => {
                    tracing::warn!(device = %device.label(), error = %err, "backend initialization failed");
                    attempts.push((device.kind, err.to_string()));
                }
            }
        }
        Err(BackendInitError::NoBackendAvailable { attempts })
    }

    fn bring_up(&self, device: &DeviceConfig, context: DeviceContext) -> Result<InferenceBackend, BackendInitError> {
        let model = self
            .loader
            .load_model(self.model_path, device)
            .map_err(|source| BackendInitError::ModelLoad {
                kind: device.kind,
                source,
            })?;
        let model_classes = model.class_names().len();
        if model_classes != self.expected_classes {
            return Err(BackendInitError::ClassMismatch {
                kind: device.kind,
                model_classes,
                expected: self.expected_classes,
            });
        }
        let mut backend = InferenceBackend::initialize(model, device, context)?;
        backend.set_thresholds(self.thresholds);
        Ok(backend)
    }
}
