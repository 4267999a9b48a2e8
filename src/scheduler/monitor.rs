//! Periodic hardware polling and saturation alerts.

#[cfg(feature = "nvml")]
mod nvml;

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, select};
use serde::{Deserialize, Serialize};
use sysinfo::{Components, System};
use thiserror::Error;

use crate::config::AlertConfig;
use crate::events::{EventKind, EventPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
    Npu,
    Temperature,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Gpu,
        ResourceKind::Npu,
        ResourceKind::Temperature,
    ];

    fn threshold(&self, alerts: &AlertConfig) -> f32 {
        match self {
            ResourceKind::Cpu => alerts.cpu_percent,
            ResourceKind::Memory => alerts.memory_percent,
            ResourceKind::Gpu => alerts.gpu_percent,
            ResourceKind::Npu => alerts.npu_percent,
            ResourceKind::Temperature => alerts.temperature_celsius,
        }
    }
}

/// Latest hardware readings. A counter the probe cannot read is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// `false` when the last poll failed; every reading is then `None`
    pub available: bool,
    pub cpu_percent: Option<f32>,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub gpu_percent: Option<f32>,
    pub gpu_memory_used_bytes: Option<u64>,
    pub gpu_memory_total_bytes: Option<u64>,
    pub gpu_temperature_celsius: Option<f32>,
    pub npu_percent: Option<f32>,
    /// Hottest system sensor
    pub temperature_celsius: Option<f32>,
    pub sampled_at: Option<SystemTime>,
}

impl ResourceSnapshot {
    /// Sentinel published when polling fails or before the first poll.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn memory_percent(&self) -> Option<f32> {
        match (self.memory_used_bytes, self.memory_total_bytes) {
            (Some(used), Some(total)) if total > 0 => Some(used as f32 / total as f32 * 100.0),
            _ => None,
        }
    }

    pub fn reading(&self, kind: ResourceKind) -> Option<f32> {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_percent(),
            ResourceKind::Gpu => self.gpu_percent,
            ResourceKind::Npu => self.npu_percent,
            ResourceKind::Temperature => match (self.temperature_celsius, self.gpu_temperature_celsius) {
                (Some(system), Some(gpu)) => Some(system.max(gpu)),
                (system, gpu) => system.or(gpu),
            },
        }
    }

    fn with_gpu(self, gpu: Option<GpuReading>) -> Self {
        let Some(gpu) = gpu else {
            return self;
        };
        Self {
            gpu_percent: Some(gpu.percent),
            gpu_memory_used_bytes: Some(gpu.memory_used_bytes),
            gpu_memory_total_bytes: Some(gpu.memory_total_bytes),
            gpu_temperature_celsius: gpu.temperature_celsius,
            ..self
        }
    }
}

/// One poll of the GPU counters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(not(feature = "nvml"), allow(dead_code))]
struct GpuReading {
    percent: f32,
    memory_used_bytes: u64,
    memory_total_bytes: u64,
    temperature_celsius: Option<f32>,
}

#[derive(Debug, Clone, Error)]
#[error("hardware probe failed: {message}")]
pub struct ProbeError {
    pub message: String,
}

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Source of hardware counters, polled from the monitor thread.
pub trait HardwareProbe: Send {
    fn poll(&mut self) -> Result<ResourceSnapshot, ProbeError>;
}

/// CPU, memory and temperature through `sysinfo`. With the `nvml` feature
/// the first NVIDIA GPU adds utilisation, memory and temperature. NPU
/// utilisation is vendor specific and left unavailable.
pub struct SysinfoProbe {
    system: System,
    components: Components,
    #[cfg(feature = "nvml")]
    gpu: Option<nvml::NvmlGpu>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            components: Components::new_with_refreshed_list(),
            #[cfg(feature = "nvml")]
            gpu: nvml::NvmlGpu::open(),
        }
    }

    #[cfg(feature = "nvml")]
    fn read_gpu(&self) -> Option<GpuReading> {
        let gpu = self.gpu.as_ref()?;
        match gpu.read() {
            Ok(reading) => Some(reading),
            Err(err) => {
                tracing::debug!(error = %err, "GPU counters unavailable this cycle");
                None
            }
        }
    }

    #[cfg(not(feature = "nvml"))]
    fn read_gpu(&self) -> Option<GpuReading> {
        None
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for SysinfoProbe {
    fn poll(&mut self) -> Result<ResourceSnapshot, ProbeError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.components.refresh();

        let cpus = self.system.cpus();
        let memory_total = self.system.total_memory();
        if cpus.is_empty() && memory_total == 0 {
            return Err(ProbeError::new("no cpu or memory counters"));
        }

        // average across all cores
        let cpu_percent =
            (!cpus.is_empty()).then(|| cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32);
        let temperature_celsius = self
            .components
            .iter()
            .map(|component| component.temperature())
            .filter(|t| t.is_finite())
            .reduce(f32::max);

        let snapshot = ResourceSnapshot {
            available: true,
            cpu_percent,
            memory_used_bytes: (memory_total > 0).then(|| self.system.used_memory()),
            memory_total_bytes: (memory_total > 0).then_some(memory_total),
            temperature_celsius,
            sampled_at: Some(SystemTime::now()),
            ..ResourceSnapshot::unavailable()
        };
        Ok(snapshot.with_gpu(self.read_gpu()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AlertState {
    consecutive: u32,
    /// Alert sent; re-armed once the reading drops below the threshold
    fired: bool,
}

/// Saturation hysteresis: one alert per excursion that lasts
/// `after_cycles` consecutive polls.
pub(crate) struct AlertTracker {
    config: AlertConfig,
    states: HashMap<ResourceKind, AlertState>,
}

impl AlertTracker {
    pub(crate) fn new(config: AlertConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Alerts to raise for `snapshot`, as `(resource, value, threshold)`.
    /// Unavailable readings leave the counters untouched.
    pub(crate) fn observe(&mut self, snapshot: &ResourceSnapshot) -> Vec<(ResourceKind, f32, f32)> {
        let mut alerts = Vec::new();
        for kind in ResourceKind::ALL {
            let Some(value) = snapshot.reading(kind) else {
                continue;
            };
            let threshold = kind.threshold(&self.config);
            let state = self.states.entry(kind).or_default();
            if value < threshold {
                *state = AlertState::default();
                continue;
            }
            state.consecutive += 1;
            if !state.fired && state.consecutive >= self.config.after_cycles {
                state.fired = true;
                alerts.push((kind, value, threshold));
            }
        }
        alerts
    }
}

/// Monitor loop statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub cycles: u64,
    pub failed_polls: u64,
    pub average_cycle: Duration,
    pub max_cycle: Duration,
    pub last_cycle: Duration,
    /// Last poll succeeded and no cycle overran the interval
    pub healthy: bool,
}

impl MonitorStats {
    fn record(&mut self, elapsed: Duration, polled: bool, interval: Duration) {
        let total = self.average_cycle * self.cycles as u32 + elapsed;
        self.cycles += 1;
        self.average_cycle = total / self.cycles as u32;
        self.max_cycle = self.max_cycle.max(elapsed);
        self.last_cycle = elapsed;
        if !polled {
            self.failed_polls += 1;
        }
        self.healthy = polled && self.max_cycle <= interval;
    }
}

/// Shared state the monitor thread writes and the scheduler reads.
pub(crate) struct MonitorState {
    pub snapshot: ArcSwap<ResourceSnapshot>,
    pub stats: Mutex<MonitorStats>,
}

impl MonitorState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(ResourceSnapshot::unavailable()),
            stats: Mutex::new(MonitorStats::default()),
        })
    }

    pub(crate) fn stats(&self) -> MonitorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The running monitor thread.
pub(crate) struct Monitor {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    pub(crate) fn spawn(
        probe: Box<dyn HardwareProbe>,
        interval: Duration,
        alerts: AlertConfig,
        state: Arc<MonitorState>,
        publisher: Arc<EventPublisher>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("resource-monitor".into())
            .spawn(move || run(probe, interval, AlertTracker::new(alerts), &state, &publisher, stop_rx))?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        // dropping the sender wakes the select
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("resource monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut probe: Box<dyn HardwareProbe>,
    interval: Duration,
    mut alerts: AlertTracker,
    state: &MonitorState,
    publisher: &EventPublisher,
    stop: Receiver<()>,
) {
    let _span = tracing::info_span!("resource_monitor").entered();
    tracing::debug!(?interval, "resource monitor started");

    loop {
        let started = Instant::now();
        let polled = panic::catch_unwind(AssertUnwindSafe(|| probe.poll()))
            .unwrap_or_else(|_| Err(ProbeError::new("probe panicked")));
        let snapshot = match polled {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "resource poll failed");
                ResourceSnapshot::unavailable()
            }
        };
        let available = snapshot.available;

        for (resource, value, threshold) in alerts.observe(&snapshot) {
            tracing::warn!(?resource, value, threshold, "resource saturated");
            publisher.emit(EventKind::ResourceAlert {
                resource,
                value,
                threshold,
            });
        }
        state.snapshot.store(Arc::new(snapshot));

        let elapsed = started.elapsed();
        state
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(elapsed, available, interval);

        select! {
            recv(stop) -> _ => break,
            default(interval.saturating_sub(elapsed)) => {}
        }
    }
    tracing::debug!("resource monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_at(percent: f32) -> ResourceSnapshot {
        ResourceSnapshot {
            available: true,
            cpu_percent: Some(percent),
            ..ResourceSnapshot::default()
        }
    }

    #[test]
    fn test_alert_after_consecutive_cycles_then_rearm() {
        let mut tracker = AlertTracker::new(AlertConfig {
            after_cycles: 3,
            ..AlertConfig::default()
        });
        let fired: Vec<usize> = [95.0, 96.0, 97.0, 98.0, 50.0, 95.0, 95.0, 95.0]
            .into_iter()
            .map(|cpu| tracker.observe(&cpu_at(cpu)).len())
            .collect();
        assert_eq!(fired, [0, 0, 1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_unavailable_poll_does_not_reset_excursion() {
        let mut tracker = AlertTracker::new(AlertConfig {
            after_cycles: 2,
            ..AlertConfig::default()
        });
        assert!(tracker.observe(&cpu_at(99.0)).is_empty());
        assert!(tracker.observe(&ResourceSnapshot::unavailable()).is_empty());
        let alerts = tracker.observe(&cpu_at(99.0));
        assert_eq!(alerts, vec![(ResourceKind::Cpu, 99.0, 90.0)]);
    }

    #[test]
    fn test_memory_percent() {
        let snapshot = ResourceSnapshot {
            memory_used_bytes: Some(512),
            memory_total_bytes: Some(2048),
            ..ResourceSnapshot::default()
        };
        assert_eq!(snapshot.memory_percent(), Some(25.0));
        assert_eq!(ResourceSnapshot::unavailable().memory_percent(), None);
    }

    #[test]
    fn test_gpu_reading_fills_snapshot() {
        let reading = GpuReading {
            percent: 97.0,
            memory_used_bytes: 3 << 30,
            memory_total_bytes: 8 << 30,
            temperature_celsius: Some(84.0),
        };
        let snapshot = ResourceSnapshot {
            temperature_celsius: Some(55.0),
            ..cpu_at(10.0)
        }
        .with_gpu(Some(reading));
        assert_eq!(snapshot.gpu_percent, Some(97.0));
        assert_eq!(snapshot.gpu_memory_total_bytes, Some(8 << 30));
        // the hotter of the two sensors drives the temperature alert
        assert_eq!(snapshot.reading(ResourceKind::Temperature), Some(84.0));

        let mut tracker = AlertTracker::new(AlertConfig {
            after_cycles: 1,
            ..AlertConfig::default()
        });
        let kinds: Vec<ResourceKind> = tracker.observe(&snapshot).into_iter().map(|(kind, ..)| kind).collect();
        assert!(kinds.contains(&ResourceKind::Gpu), "{kinds:?}");

        // no GPU leaves the snapshot as it was
        assert_eq!(cpu_at(10.0).with_gpu(None), cpu_at(10.0));
    }

    #[test]
    fn test_stats_average_and_health() {
        let mut stats = MonitorStats::default();
        let interval = Duration::from_millis(100);
        stats.record(Duration::from_millis(10), true, interval);
        stats.record(Duration::from_millis(30), true, interval);
        assert_eq!(stats.average_cycle, Duration::from_millis(20));
        assert_eq!(stats.max_cycle, Duration::from_millis(30));
        assert!(stats.healthy);
        stats.record(Duration::from_millis(5), false, interval);
        assert!(!stats.healthy);
        assert_eq!(stats.failed_polls, 1);
    }
}
