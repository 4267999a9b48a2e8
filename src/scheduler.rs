//! Admission, lifecycle control and resource monitoring for all pipelines.

pub(crate) mod admission;
mod monitor;
pub(crate) mod registry;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::attributes::AttributeModel;
use crate::backend::ModelLoader;
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::correlator::CorrelatorHandle;
use crate::error::{ConfigError, Error, Result};
use crate::events::{EventPublisher, EventSink, EventSource};
use crate::frame::FrameSource;
use crate::pipeline::{self, PipelineHandle, PipelineSnapshot, PipelineState, WorkerDeps};

pub use admission::RejectReason;
pub use monitor::{HardwareProbe, MonitorStats, ProbeError, ResourceKind, ResourceSnapshot, SysinfoProbe};
pub use registry::DeviceUsage;

use admission::check_pipeline_budget;
use monitor::{Monitor, MonitorState};
use registry::DeviceRegistry;

/// Builds the attribute model for a newly registered pipeline. `None`
/// leaves its tracks flagged `attributes_unavailable`.
pub type AttributeFactory = Arc<dyn Fn(&PipelineConfig) -> Option<Box<dyn AttributeModel>> + Send + Sync>;

/// Aggregate view across every pipeline and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_pipelines: usize,
    pub active_pipelines: usize,
    pub failed_pipelines: usize,
    pub processed_frames: u64,
    pub dropped_frames: u64,
    pub backend_failures: u64,
    pub monitor: MonitorStats,
    pub devices: Vec<DeviceUsage>,
}

/// Owns every pipeline, the device registry and the monitor thread.
///
/// All methods take `&self`; the scheduler can be shared behind an `Arc`.
pub struct ResourceScheduler {
    runtime: Arc<RuntimeConfig>,
    loader: Arc<dyn ModelLoader>,
    sink: Arc<dyn EventSink>,
    registry: Arc<DeviceRegistry>,
    pipelines: Mutex<BTreeMap<Arc<str>, PipelineHandle>>,
    probe: Mutex<Option<Box<dyn HardwareProbe>>>,
    attribute_factory: Option<AttributeFactory>,
    correlator: Option<CorrelatorHandle>,
    monitor_state: Arc<MonitorState>,
    monitor: Mutex<Option<Monitor>>,
    publisher: Arc<EventPublisher>,
}

impl ResourceScheduler {
    pub fn new(runtime: RuntimeConfig, loader: Arc<dyn ModelLoader>, sink: Arc<dyn EventSink>) -> Result<Self> {
        runtime.validate()?;
        let registry = DeviceRegistry::new(&runtime.devices);
        tracing::info!(
            devices = runtime.devices.len(),
            max_pipelines = runtime.scheduler.max_pipelines,
            "resource scheduler created"
        );
        Ok(Self {
            runtime: Arc::new(runtime),
            loader,
            publisher: Arc::new(EventPublisher::new(EventSource::Scheduler, Arc::clone(&sink))),
            sink,
            registry,
            pipelines: Mutex::new(BTreeMap::new()),
            probe: Mutex::new(None),
            attribute_factory: None,
            correlator: None,
            monitor_state: MonitorState::new(),
            monitor: Mutex::new(None),
        })
    }

    /// Replace the default `sysinfo` probe.
    pub fn with_probe(self, probe: impl HardwareProbe + 'static) -> Self {
        *self.probe.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(probe));
        self
    }

    pub fn with_attribute_factory(
        mut self,
        factory: impl Fn(&PipelineConfig) -> Option<Box<dyn AttributeModel>> + Send + Sync + 'static,
    ) -> Self {
        self.attribute_factory = Some(Arc::new(factory));
        self
    }

    /// Forward confirmed tracks of every pipeline to `correlator`.
    pub fn with_correlator(mut self, correlator: CorrelatorHandle) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Start the resource monitor. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return Ok(());
        }
        let probe = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()));
        let spawned = Monitor::spawn(
            probe,
            self.runtime.scheduler.monitor_interval(),
            self.runtime.alerts.clone(),
            Arc::clone(&self.monitor_state),
            Arc::clone(&self.publisher),
        )
        .map_err(|err| Error::ResourceExhausted(format!("cannot start resource monitor: {err}")))?;
        *monitor = Some(spawned);
        tracing::info!(interval = ?self.runtime.scheduler.monitor_interval(), "resource monitor running");
        Ok(())
    }

    fn pipelines(&self) -> MutexGuard<'_, BTreeMap<Arc<str>, PipelineHandle>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, id: &str) -> Result<PipelineHandle> {
        self.pipelines()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Validate `config`, admit it against the pipeline and device budgets
    /// and start its worker. On error nothing is registered.
    pub fn register_pipeline(
        &self,
        config: PipelineConfig,
        source: impl FrameSource + 'static,
    ) -> Result<PipelineHandle> {
        self.runtime.validate_pipeline(&config)?;

        // held until the pipeline is inserted so that concurrent
        // registrations see each other
        let mut pipelines = self.pipelines();
        if pipelines.contains_key(config.id.as_str()) {
            return Err(ConfigError::Duplicate(config.id).into());
        }
        let active = pipelines.values().filter(|p| !p.state().is_terminal()).count();
        check_pipeline_budget(active, self.runtime.scheduler.max_pipelines)
            .map_err(|reason| Error::ResourceExhausted(reason.to_string()))?;

        let id: Arc<str> = Arc::from(config.id.as_str());
        let mut refusals = Vec::new();
        let mut lease = None;
        for device in config.backend.candidate_devices(&self.runtime.devices) {
            match self.registry.reserve(device, &id, config.target_fps) {
                Ok(reserved) => {
                    lease = Some(reserved);
                    break;
                }
                Err(reason) => refusals.push(reason.to_string()),
            }
        }
        let Some(lease) = lease else {
            tracing::warn!(pipeline = %id, reasons = ?refusals, "pipeline rejected");
            return Err(Error::ResourceExhausted(format!(
                "no device can admit pipeline {id}: {}",
                refusals.join("; ")
            )));
        };

        let deps = WorkerDeps {
            runtime: Arc::clone(&self.runtime),
            loader: Arc::clone(&self.loader),
            registry: Arc::clone(&self.registry),
            correlator: self.correlator.clone(),
            attribute_model: self.attribute_factory.as_ref().and_then(|factory| factory(&config)),
        };
        let handle = pipeline::spawn(config, Box::new(source), deps, lease, Arc::clone(&self.sink))
            .map_err(|err| Error::ResourceExhausted(format!("cannot start pipeline {id}: {err}")))?;

        tracing::info!(pipeline = %id, "pipeline registered");
        pipelines.insert(id, handle.clone());
        Ok(handle)
    }

    /// Stop a pipeline, wait for its threads and release its device.
    pub fn remove_pipeline(&self, id: &str) -> Result<PipelineSnapshot> {
        let handle = self.pipelines().remove(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        handle.stop();
        tracing::info!(pipeline = %id, "pipeline removed");
        Ok(handle.snapshot())
    }

    pub fn pause_pipeline(&self, id: &str) -> Result<()> {
        self.handle(id)?.shared().pause()
    }

    pub fn resume_pipeline(&self, id: &str) -> Result<()> {
        self.handle(id)?.shared().resume()
    }

    /// Swap the configuration of a running pipeline. Thresholds, class
    /// filter, tracker settings and attribute cadence apply from the next
    /// frame; a new backend preference applies from the next restart.
    /// A rejected configuration leaves the current one in place.
    pub fn update_pipeline_config(&self, id: &str, config: PipelineConfig) -> Result<()> {
        if config.id != id {
            return Err(ConfigError::IdMismatch {
                expected: id.to_string(),
                got: config.id,
            }
            .into());
        }
        self.runtime.validate_pipeline(&config)?;
        let handle = self.handle(id)?;
        let state = handle.state();
        if state.is_terminal() {
            return Err(Error::InvalidState {
                pipeline: id.to_string(),
                state,
            });
        }
        handle.shared().store_config(config);
        tracing::info!(pipeline = %id, "pipeline configuration swapped");
        Ok(())
    }

    pub fn query_pipeline_state(&self, id: &str) -> Result<PipelineSnapshot> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Latest monitor reading. Never blocks on the monitor thread.
    pub fn query_resource_snapshot(&self) -> ResourceSnapshot {
        self.monitor_state.snapshot.load_full().as_ref().clone()
    }

    /// Ids of pipelines that are not stopped or failed.
    pub fn active_pipelines(&self) -> Vec<String> {
        self.pipelines()
            .values()
            .filter(|p| !p.state().is_terminal())
            .map(|p| p.id().to_string())
            .collect()
    }

    pub fn system_stats(&self) -> SystemStats {
        let snapshots: Vec<PipelineSnapshot> = self.pipelines().values().map(PipelineHandle::snapshot).collect();
        SystemStats {
            total_pipelines: snapshots.len(),
            active_pipelines: snapshots.iter().filter(|s| !s.state.is_terminal()).count(),
            failed_pipelines: snapshots.iter().filter(|s| s.state == PipelineState::Failed).count(),
            processed_frames: snapshots.iter().map(|s| s.processed_frames).sum(),
            dropped_frames: snapshots.iter().map(|s| s.dropped_frames).sum(),
            backend_failures: snapshots.iter().map(|s| s.backend_failures).sum(),
            monitor: self.monitor_state.stats(),
            devices: self.registry.usage(),
        }
    }

    /// Stop every pipeline and the monitor. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        let handles: Vec<PipelineHandle> = std::mem::take(&mut *self.pipelines()).into_values().collect();
        if !handles.is_empty() {
            tracing::info!(pipelines = handles.len(), "shutting down pipelines");
        }
        // cancel everything first so the joins overlap
        for handle in &handles {
            handle.shared().cancel();
        }
        for handle in &handles {
            handle.stop();
        }
        if let Some(mut monitor) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            monitor.stop();
        }
    }
}

impl Drop for ResourceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
