//! Admission budget for pipelines and device slots.
//!
//! Exclusive devices are bounded by stream count. Shared-context devices are
//! additionally bounded by aggregate frame rate, since every stream on them
//! competes for one serialized context.

use thiserror::Error;

use crate::backend::DeviceConfig;

/// Why a pipeline or a device reservation was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("{active} of {max} pipelines already active")]
    PipelineLimit { active: usize, max: usize },

    #[error("{device} already serves {streams} of {max} streams")]
    StreamLimit { device: String, streams: u32, max: u32 },

    #[error("{device} has {available:.1} fps left, {requested:.1} requested")]
    Throughput {
        device: String,
        requested: f32,
        available: f32,
    },

    #[error("{0} is not configured")]
    UnknownDevice(String),
}

/// Current load on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceLoad {
    pub streams: u32,
    pub fps: f32,
}

pub fn check_pipeline_budget(active: usize, max: usize) -> Result<(), RejectReason> {
    if active >= max {
        return Err(RejectReason::PipelineLimit { active, max });
    }
    Ok(())
}

/// Whether one more stream at `requested_fps` fits on `device`.
pub fn check_device(device: &DeviceConfig, load: DeviceLoad, requested_fps: f32) -> Result<(), RejectReason> {
    if load.streams >= device.max_streams {
        return Err(RejectReason::StreamLimit {
            device: device.label(),
            streams: load.streams,
            max: device.max_streams,
        });
    }
    if device.shared_context {
        let available = (device.throughput_fps - load.fps).max(0.0);
        if requested_fps > available {
            return Err(RejectReason::Throughput {
                device: device.label(),
                requested: requested_fps,
                available,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[test]
    fn test_pipeline_budget() {
        assert!(check_pipeline_budget(3, 4).is_ok());
        assert_eq!(
            check_pipeline_budget(4, 4),
            Err(RejectReason::PipelineLimit { active: 4, max: 4 })
        );
    }

    #[test]
    fn test_exclusive_device_counts_streams_only() {
        let mut cpu = DeviceConfig::new(BackendKind::Cpu);
        cpu.max_streams = 2;
        let load = DeviceLoad { streams: 1, fps: 1000.0 };
        assert!(check_device(&cpu, load, 25.0).is_ok());
        let load = DeviceLoad { streams: 2, fps: 0.0 };
        assert!(matches!(check_device(&cpu, load, 25.0), Err(RejectReason::StreamLimit { .. })));
    }

    #[test]
    fn test_shared_device_bounded_by_throughput() {
        let mut npu = DeviceConfig::new(BackendKind::Npu);
        npu.throughput_fps = 60.0;
        let load = DeviceLoad { streams: 2, fps: 50.0 };
        let err = check_device(&npu, load, 25.0).unwrap_err();
        assert_eq!(err.to_string(), "NPU:0 has 10.0 fps left, 25.0 requested");
        assert!(check_device(&npu, load, 10.0).is_ok());
    }
}
