//! NVIDIA GPU counters through NVML.
//!
//! The driver library is loaded at runtime, so a build with this module still
//! runs on hosts without an NVIDIA GPU; the probe then reports no GPU.

use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;

use super::GpuReading;

/// The first GPU NVML reports.
pub(crate) struct NvmlGpu {
    nvml: Nvml,
    index: u32,
}

impl NvmlGpu {
    /// `None` if NVML cannot be loaded or no GPU is present.
    pub(crate) fn open() -> Option<Self> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(err) => {
                tracing::info!(error = %err, "NVML not available, GPU monitoring disabled");
                return None;
            }
        };
        match nvml.device_count() {
            Ok(0) => {
                tracing::info!("no NVIDIA GPU found, GPU monitoring disabled");
                None
            }
            Ok(count) => {
                let name = nvml.device_by_index(0).and_then(|device| device.name());
                tracing::info!(gpus = count, name = name.as_deref().unwrap_or("unknown"), "GPU monitoring initialized");
                Some(Self { nvml, index: 0 })
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot count GPUs, GPU monitoring disabled");
                None
            }
        }
    }

    pub(crate) fn read(&self) -> Result<GpuReading, NvmlError> {
        let device = self.nvml.device_by_index(self.index)?;
        let utilization = device.utilization_rates()?;
        let memory = device.memory_info()?;
        // some boards expose no sensor; utilization and memory still count
        let temperature = device.temperature(TemperatureSensor::Gpu).ok();
        Ok(GpuReading {
            percent: utilization.gpu as f32,
            memory_used_bytes: memory.used,
            memory_total_bytes: memory.total,
            temperature_celsius: temperature.map(|t| t as f32),
        })
    }
}
