//! Device slots and the leases that hold them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::backend::{BackendKind, DeviceConfig, DeviceContext};
use crate::scheduler::admission::{DeviceLoad, RejectReason, check_device};

struct DeviceSlot {
    config: DeviceConfig,
    /// Serializes forward passes when the device context is shared
    context: Arc<Mutex<()>>,
}

struct LeaseRecord {
    device: usize,
    pipeline: Arc<str>,
    fps: f32,
}

/// Load on one device as reported by [`DeviceRegistry::usage`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUsage {
    pub device: String,
    pub kind: BackendKind,
    pub streams: u32,
    pub max_streams: u32,
    pub fps: f32,
    pub throughput_fps: f32,
    pub shared_context: bool,
}

/// Tracks which pipeline holds which device slot.
pub struct DeviceRegistry {
    devices: Vec<DeviceSlot>,
    leases: Mutex<HashMap<u64, LeaseRecord>>,
    next_lease: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(devices: &[DeviceConfig]) -> Arc<Self> {
        Arc::new(Self {
            devices: devices
                .iter()
                .map(|config| DeviceSlot {
                    config: config.clone(),
                    context: Arc::new(Mutex::new(())),
                })
                .collect(),
            leases: Mutex::new(HashMap::new()),
            next_lease: AtomicU64::new(1),
        })
    }

    fn slot_index(&self, device: &DeviceConfig) -> Option<usize> {
        self.devices
            .iter()
            .position(|slot| slot.config.kind == device.kind && slot.config.device_id == device.device_id)
    }

    fn load_of(leases: &HashMap<u64, LeaseRecord>, index: usize) -> DeviceLoad {
        leases
            .values()
            .filter(|lease| lease.device == index)
            .fold(DeviceLoad::default(), |load, lease| DeviceLoad {
                streams: load.streams + 1,
                fps: load.fps + lease.fps,
            })
    }

    /// Reserve a slot on `device` for `pipeline` running at `fps`.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// reservations cannot overcommit a device.
    pub fn reserve(
        self: &Arc<Self>,
        device: &DeviceConfig,
        pipeline: &Arc<str>,
        fps: f32,
    ) -> Result<(DeviceLease, DeviceContext), RejectReason> {
        let index = self
            .slot_index(device)
            .ok_or_else(|| RejectReason::UnknownDevice(device.label()))?;
        let slot = &self.devices[index];

        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        check_device(&slot.config, Self::load_of(&leases, index), fps)?;

        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            id,
            LeaseRecord {
                device: index,
                pipeline: Arc::clone(pipeline),
                fps,
            },
        );
        drop(leases);

        tracing::info!(
            lease_id = id,
            device = %slot.config.label(),
            pipeline = %pipeline,
            "Lease created"
        );

        let context = if slot.config.shared_context {
            DeviceContext::shared(Arc::clone(&slot.context))
        } else {
            DeviceContext::exclusive()
        };
        let lease = DeviceLease {
            registry: Arc::clone(self),
            id,
            device: slot.config.clone(),
        };
        Ok((lease, context))
    }

    fn release(&self, id: u64) {
        let removed = self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(lease) = removed {
            tracing::info!(
                lease_id = id,
                device = %self.devices[lease.device].config.label(),
                pipeline = %lease.pipeline,
                "Lease released"
            );
        }
    }

    pub fn usage(&self) -> Vec<DeviceUsage> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        self.devices
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let load = Self::load_of(&leases, index);
                DeviceUsage {
                    device: slot.config.label(),
                    kind: slot.config.kind,
                    streams: load.streams,
                    max_streams: slot.config.max_streams,
                    fps: load.fps,
                    throughput_fps: slot.config.throughput_fps,
                    shared_context: slot.config.shared_context,
                }
            })
            .collect()
    }
}

/// A reserved device slot. Released when dropped.
pub struct DeviceLease {
    registry: Arc<DeviceRegistry>,
    id: u64,
    device: DeviceConfig,
}

impl DeviceLease {
    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("id", &self.id)
            .field("device", &self.device.label())
            .finish()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    #[test]
    fn test_lease_released_on_drop() {
        let mut cpu = DeviceConfig::new(BackendKind::Cpu);
        cpu.max_streams = 1;
        let registry = DeviceRegistry::new(&[cpu.clone()]);

        let (lease, context) = registry.reserve(&cpu, &pipeline("a"), 25.0).unwrap();
        assert!(!context.is_shared());
        assert!(matches!(
            registry.reserve(&cpu, &pipeline("b"), 25.0),
            Err(RejectReason::StreamLimit { .. })
        ));

        drop(lease);
        assert_eq!(registry.usage()[0].streams, 0);
        assert!(registry.reserve(&cpu, &pipeline("b"), 25.0).is_ok());
    }

    #[test]
    fn test_shared_device_hands_out_one_context() {
        let mut npu = DeviceConfig::new(BackendKind::Npu);
        npu.throughput_fps = 50.0;
        let registry = DeviceRegistry::new(&[npu.clone()]);

        let (_a, ctx_a) = registry.reserve(&npu, &pipeline("a"), 25.0).unwrap();
        let (_b, ctx_b) = registry.reserve(&npu, &pipeline("b"), 25.0).unwrap();
        assert!(ctx_a.is_shared() && ctx_b.is_shared());
        assert!(matches!(
            registry.reserve(&npu, &pipeline("c"), 1.0),
            Err(RejectReason::Throughput { .. })
        ));

        let usage = registry.usage();
        assert_eq!(usage[0].streams, 2);
        assert_eq!(usage[0].fps, 50.0);
    }

    #[test]
    fn test_unknown_device() {
        let registry = DeviceRegistry::new(&[DeviceConfig::new(BackendKind::Cpu)]);
        let gpu = DeviceConfig::new(BackendKind::Gpu);
        assert_eq!(
            registry.reserve(&gpu, &pipeline("a"), 1.0).unwrap_err(),
            RejectReason::UnknownDevice("GPU:0".into())
        );
    }
}
