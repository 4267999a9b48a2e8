//! Error taxonomy shared by every component.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendKind, BackendPreference};
use crate::pipeline::PipelineState;
use crate::tracker::TrackId;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error surfaced by the scheduler and pipeline APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    BackendInit(#[from] BackendInitError),

    #[error("{backend} inference exceeded {timeout:?}")]
    BackendTimeout {
        backend: BackendKind,
        timeout: Duration,
    },

    #[error(transparent)]
    Inference(InferenceError),

    #[error(transparent)]
    TrackingInconsistency(#[from] TrackingError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("pipeline {pipeline} exceeded its restart budget after {restarts} restarts")]
    PipelineCrashLoop { pipeline: String, restarts: u32 },

    #[error("pipeline {0} not found")]
    NotFound(String),

    #[error("pipeline {pipeline} is {state}")]
    InvalidState { pipeline: String, state: PipelineState },
}

/// Invalid or conflicting configuration. Always rejected before any state
/// is mutated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pipeline id {0:?}")]
    InvalidId(String),

    #[error("pipeline {0} is already registered")]
    Duplicate(String),

    #[error("pipeline id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: String, got: String },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f32 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("class {class_id} is not in the model class list ({known} classes)")]
    UnknownClass { class_id: u32, known: usize },

    #[error("no enabled device can serve backend preference {0}")]
    NoDevice(BackendPreference),

    #[error("{0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to bring up an inference backend.
#[derive(Debug, Error)]
pub enum BackendInitError {
    #[error("{kind} device {device_id} is unavailable")]
    DeviceUnavailable { kind: BackendKind, device_id: u32 },

    #[error("failed to load model on {kind}: {source}")]
    ModelLoad {
        kind: BackendKind,
        #[source]
        source: LoadError,
    },

    #[error("model on {kind} knows {model_classes} classes, configuration expects {expected}")]
    ClassMismatch {
        kind: BackendKind,
        model_classes: usize,
        expected: usize,
    },

    #[error("failed to start {kind} executor: {source}")]
    Executor {
        kind: BackendKind,
        #[source]
        source: std::io::Error,
    },

    #[error("no backend could be initialized: {}", format_attempts(.attempts))]
    NoBackendAvailable { attempts: Vec<(BackendKind, String)> },
}

fn format_attempts(attempts: &[(BackendKind, String)]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(|(kind, reason)| format!("{kind}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error returned by the model-loading collaborator.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-frame inference failure. Transient: the worker retries on the next
/// frame and only escalates after repeated failures.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("{backend} inference exceeded {timeout:?}")]
    Timeout {
        backend: BackendKind,
        timeout: Duration,
    },

    #[error("{backend} runtime error: {message}")]
    Runtime {
        backend: BackendKind,
        message: String,
    },

    #[error("{backend} executor is gone")]
    Disconnected { backend: BackendKind },
}

impl From<InferenceError> for Error {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Timeout { backend, timeout } => Error::BackendTimeout { backend, timeout },
            other => Error::Inference(other),
        }
    }
}

/// Internal tracker invariant violation. The offending track is dropped and
/// the pipeline continues.
#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    #[error("innovation covariance of track {0} is singular")]
    SingularCovariance(TrackId),

    #[error("state of track {0} is not finite")]
    NonFinite(TrackId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_backend_message_lists_attempts() {
        let err = BackendInitError::NoBackendAvailable {
            attempts: vec![
                (BackendKind::Npu, "device missing".to_string()),
                (BackendKind::Cpu, "model missing".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("NPU: device missing"));
        assert!(msg.contains("CPU: model missing"));
    }

    #[test]
    fn test_timeout_maps_to_taxonomy() {
        let err: Error = InferenceError::Timeout {
            backend: BackendKind::Gpu,
            timeout: Duration::from_millis(50),
        }
        .into();
        assert!(matches!(err, Error::BackendTimeout { backend: BackendKind::Gpu, .. }));
    }
}
