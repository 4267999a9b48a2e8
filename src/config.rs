//! Runtime and per-pipeline configuration.
//!
//! Everything deserializes from TOML with defaults for omitted fields.
//! Durations are `*_ms` integers in files and `Duration` in code.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, BackendPreference, DeviceConfig, Thresholds};
use crate::correlator::CorrelatorConfig;
use crate::error::ConfigError;
use crate::tracker::TrackerConfig;

pub const MAX_PIPELINE_ID_LEN: usize = 64;

/// Configuration of one stream. Swapped atomically at frame boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub id: String,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub max_detections: usize,
    /// Classes forwarded to the tracker; `None` enables every class
    pub enabled_classes: Option<BTreeSet<u32>>,
    pub backend: BackendPreference,
    /// Expected input rate, charged against shared device throughput
    pub target_fps: f32,
    pub queue_capacity: usize,
    /// Frames between attribute analyses of the same track
    pub attribute_cadence: u32,
    /// Overrides the runtime-wide tracker settings
    pub tracker: Option<TrackerConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.4,
            max_detections: 100,
            enabled_classes: None,
            backend: BackendPreference::Auto,
            target_fps: 25.0,
            queue_capacity: 8,
            attribute_cadence: 10,
            tracker: None,
        }
    }
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            confidence: self.confidence_threshold,
            nms_iou: self.nms_iou_threshold,
            max_detections: self.max_detections,
        }
    }

    pub fn is_class_enabled(&self, class_id: u32) -> bool {
        self.enabled_classes
            .as_ref()
            .is_none_or(|classes| classes.contains(&class_id))
    }

    /// Check the configuration against a model with `known_classes` classes.
    pub fn validate(&self, known_classes: usize) -> Result<(), ConfigError> {
        validate_id(&self.id)?;
        for (field, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_iou_threshold", self.nms_iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.max_detections == 0 {
            return Err(ConfigError::Zero("max_detections"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if !(self.target_fps.is_finite() && self.target_fps > 0.0) {
            return Err(ConfigError::Zero("target_fps"));
        }
        if let Some(classes) = &self.enabled_classes {
            if let Some(&class_id) = classes.iter().find(|&&c| c as usize >= known_classes) {
                return Err(ConfigError::UnknownClass {
                    class_id,
                    known: known_classes,
                });
            }
        }
        if let Some(tracker) = &self.tracker {
            tracker.validate()?;
        }
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_PIPELINE_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_pipelines: usize,
    pub monitor_interval_ms: u64,
    /// Consecutive backend failures before a pipeline is demoted
    pub failure_threshold: u32,
    /// Restarts allowed before a pipeline is marked Failed
    pub restart_budget: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long a worker waits for a frame before re-checking for cancel
    pub frame_timeout_ms: u64,
    pub correlator_queue: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pipelines: 16,
            monitor_interval_ms: 1000,
            failure_threshold: 3,
            restart_budget: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            frame_timeout_ms: 500,
            correlator_queue: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Delay before restart number `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Number of classes the model must expose
    pub class_count: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/yolov8n"),
            class_count: 80,
        }
    }
}

/// Saturation thresholds for `ResourceAlert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub gpu_percent: f32,
    pub npu_percent: f32,
    pub temperature_celsius: f32,
    /// Consecutive saturated polls before alerting
    pub after_cycles: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 90.0,
            gpu_percent: 95.0,
            npu_percent: 95.0,
            temperature_celsius: 85.0,
            after_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub model: ModelConfig,
    pub devices: Vec<DeviceConfig>,
    pub tracker: TrackerConfig,
    pub correlator: CorrelatorConfig,
    pub alerts: AlertConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            model: ModelConfig::default(),
            devices: BackendKind::PRIORITY.into_iter().map(DeviceConfig::new).collect(),
            tracker: TrackerConfig::default(),
            correlator: CorrelatorConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.max_pipelines == 0 {
            return Err(ConfigError::Zero("scheduler.max_pipelines"));
        }
        if s.monitor_interval_ms == 0 {
            return Err(ConfigError::Zero("scheduler.monitor_interval_ms"));
        }
        if s.failure_threshold == 0 {
            return Err(ConfigError::Zero("scheduler.failure_threshold"));
        }
        if s.frame_timeout_ms == 0 {
            return Err(ConfigError::Zero("scheduler.frame_timeout_ms"));
        }
        if s.correlator_queue == 0 {
            return Err(ConfigError::Zero("scheduler.correlator_queue"));
        }
        if s.base_backoff_ms > s.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "scheduler.base_backoff_ms ({}) exceeds scheduler.max_backoff_ms ({})",
                s.base_backoff_ms, s.max_backoff_ms
            )));
        }
        if self.model.class_count == 0 {
            return Err(ConfigError::Zero("model.class_count"));
        }
        if !self.devices.iter().any(|d| d.enabled) {
            return Err(ConfigError::NoDevice(BackendPreference::Auto));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert((device.kind, device.device_id)) {
                return Err(ConfigError::Invalid(format!("device {} is configured twice", device.label())));
            }
            if device.max_streams == 0 {
                return Err(ConfigError::Zero("devices.max_streams"));
            }
            if !(device.throughput_fps.is_finite() && device.throughput_fps > 0.0) {
                return Err(ConfigError::Zero("devices.throughput_fps"));
            }
            if device.inference_timeout_ms == 0 {
                return Err(ConfigError::Zero("devices.inference_timeout_ms"));
            }
        }

        self.tracker.validate()?;
        self.correlator.validate()?;
        if self.alerts.after_cycles == 0 {
            return Err(ConfigError::Zero("alerts.after_cycles"));
        }
        Ok(())
    }

    /// Check a pipeline configuration against this runtime: field ranges,
    /// class list, and that its backend preference has an enabled device.
    pub fn validate_pipeline(&self, config: &PipelineConfig) -> Result<(), ConfigError> {
        config.validate(self.model.class_count)?;
        if config.backend.candidate_devices(&self.devices).is_empty() {
            return Err(ConfigError::NoDevice(config.backend));
        }
        Ok(())
    }

    /// Tracker settings for a pipeline, honouring its override.
    pub fn tracker_for(&self, config: &PipelineConfig) -> TrackerConfig {
        config.tracker.clone().unwrap_or_else(|| self.tracker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_system() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduler.max_pipelines, 16);
        assert_eq!(config.scheduler.monitor_interval(), Duration::from_secs(1));
        assert_eq!(config.model.class_count, 80);
        let pipeline = PipelineConfig::new("cam");
        assert_eq!(pipeline.confidence_threshold, 0.5);
        assert_eq!(pipeline.nms_iou_threshold, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [scheduler]
            max_pipelines = 4
            restart_budget = 3

            [model]
            path = "models/person.rknn"
            class_count = 2

            [[devices]]
            kind = "npu"
            shared_context = true
            throughput_fps = 90.0

            [[devices]]
            kind = "cpu"
            max_streams = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_pipelines, 4);
        assert_eq!(config.scheduler.monitor_interval_ms, 1000);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].kind, BackendKind::Npu);
        assert_eq!(config.devices[1].max_streams, 2);
        assert_eq!(config.devices[1].inference_timeout_ms, 1000);
    }

    #[test]
    fn test_rejects_bad_runtime_config() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("[scheduler]\nmax_pipelines = 0"),
            Err(ConfigError::Zero("scheduler.max_pipelines"))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[[devices]]\nkind = \"gpu\"\n[[devices]]\nkind = \"gpu\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[scheduler\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_pipeline_validation() {
        assert!(matches!(PipelineConfig::new("").validate(80), Err(ConfigError::InvalidId(_))));
        assert!(matches!(PipelineConfig::new("cam 1").validate(80), Err(ConfigError::InvalidId(_))));
        assert!(PipelineConfig::new("lobby.cam-1_a").validate(80).is_ok());

        let mut config = PipelineConfig::new("cam");
        config.confidence_threshold = 1.2;
        assert!(matches!(config.validate(80), Err(ConfigError::OutOfRange { .. })));

        let mut config = PipelineConfig::new("cam");
        config.enabled_classes = Some([0, 2, 80].into_iter().collect());
        assert!(matches!(
            config.validate(80),
            Err(ConfigError::UnknownClass { class_id: 80, known: 80 })
        ));
    }

    #[test]
    fn test_pipeline_needs_device() {
        let mut runtime = RuntimeConfig::default();
        runtime.devices.retain(|d| d.kind != BackendKind::Gpu);
        let mut config = PipelineConfig::new("cam");
        config.backend = BackendPreference::Gpu;
        assert!(matches!(runtime.validate_pipeline(&config), Err(ConfigError::NoDevice(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let s = SchedulerConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..SchedulerConfig::default()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(3), Duration::from_millis(400));
        assert_eq!(s.backoff(10), Duration::from_millis(1000));
        assert_eq!(s.backoff(200), Duration::from_millis(1000));
    }
}
