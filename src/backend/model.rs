//! Contracts for the model-loading collaborator.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::backend::detection::RawDetection;
use crate::backend::selection::DeviceConfig;
use crate::error::LoadError;
use crate::frame::Frame;

/// A failure inside a model's forward pass.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A pre-trained model bound to one device.
///
/// Implementations are opaque to this crate. `forward` runs on the
/// backend's executor thread and may block; the backend enforces the
/// timeout.
pub trait ModelRuntime: Send + Sync {
    /// Class labels in class-id order.
    fn class_names(&self) -> &[String];

    fn forward(&self, frame: &Frame) -> Result<Vec<RawDetection>, RuntimeError>;
}

/// Loads models for a device.
pub trait ModelLoader: Send + Sync {
    fn load_model(&self, path: &Path, device: &DeviceConfig) -> Result<ModelHandle, LoadError>;
}

/// Shared handle to a loaded model.
#[derive(Clone)]
pub struct ModelHandle {
    path: PathBuf,
    runtime: Arc<dyn ModelRuntime>,
}

impl ModelHandle {
    pub fn new(path: impl Into<PathBuf>, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            path: path.into(),
            runtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    pub fn class_names(&self) -> &[String] {
        self.runtime.class_names()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("classes", &self.runtime.class_names().len())
            .finish()
    }
}
