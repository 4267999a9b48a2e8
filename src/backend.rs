//! Inference backends.
//!
//! A closed set of device implementations ([`InferenceBackend`]) shares one
//! contract: initialize on a device with a loaded model, then turn frames
//! into ordered [`Detection`]s. Thresholding and NMS live in
//! [`postprocess`] so that every backend filters identically.

mod builder;
mod detection;
mod model;
mod postprocess;
mod runtime;
mod selection;

pub use builder::DetectionBuilder;
pub use detection::{Detection, RawDetection};
pub use model::{ModelHandle, ModelLoader, ModelRuntime, RuntimeError};
pub use postprocess::{Thresholds, non_max_suppression, postprocess};
pub use runtime::{CpuBackend, DeviceContext, GpuBackend, InferenceBackend, NpuBackend};
pub use selection::{
    BackendKind, BackendPreference, BackendSelector, BoundBackend, DeviceConfig, available_backends,
};
