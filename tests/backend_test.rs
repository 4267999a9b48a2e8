mod common;

use std::path::Path;
use std::time::Duration;

use common::{Broken, MockLoader, Stalled, WalkingPerson, frame};
use streamtrack::backend::{BackendSelector, DeviceContext, Thresholds};
use streamtrack::error::{BackendInitError, InferenceError};
use streamtrack::{BackendKind, BackendPreference, DeviceConfig};

fn all_devices() -> Vec<DeviceConfig> {
    BackendKind::PRIORITY.into_iter().map(DeviceConfig::new).collect()
}

fn exclusive(_device: &DeviceConfig) -> Result<((), DeviceContext), String> {
    Ok(((), DeviceContext::exclusive()))
}

#[test]
fn test_auto_prefers_npu() {
    let loader = MockLoader::new(WalkingPerson::new(80));
    let selector = BackendSelector::new(&loader, Path::new("models/yolov8n"), 80, Thresholds::default());
    let devices = all_devices();

    let bound = selector
        .probe(BackendPreference::Auto.candidate_devices(&devices), exclusive)
        .unwrap();
    assert_eq!(bound.backend.kind(), BackendKind::Npu);
    assert_eq!(bound.backend.name(), "RKNN NPU");
    assert_eq!(loader.loads(), ["NPU:0"]);
}

#[test]
fn test_auto_falls_back_in_priority_order() {
    let loader = MockLoader::new(WalkingPerson::new(80))
        .failing(BackendKind::Npu)
        .failing(BackendKind::Gpu);
    let selector = BackendSelector::new(&loader, Path::new("models/yolov8n"), 80, Thresholds::default());
    let devices = all_devices();

    let mut bound = selector
        .probe(BackendPreference::Auto.candidate_devices(&devices), exclusive)
        .unwrap();
    assert_eq!(bound.backend.kind(), BackendKind::Cpu);
    assert_eq!(loader.loads(), ["NPU:0", "GPU:0", "CPU:0"]);

    let detections = bound.backend.infer(&frame("cam", 0)).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].backend, BackendKind::Cpu);
}

#[test]
fn test_refused_reservation_is_skipped() {
    let loader = MockLoader::new(WalkingPerson::new(80));
    let selector = BackendSelector::new(&loader, Path::new("models/yolov8n"), 80, Thresholds::default());
    let devices = all_devices();

    let bound = selector
        .probe(BackendPreference::Auto.candidate_devices(&devices), |device| {
            if device.kind == BackendKind::Npu {
                Err("NPU:0 is full".to_string())
            } else {
                Ok((device.label(), DeviceContext::exclusive()))
            }
        })
        .unwrap();
    assert_eq!(bound.lease, "GPU:0");
    // the refused device was never loaded
    assert_eq!(loader.loads(), ["GPU:0"]);
}

#[test]
fn test_no_backend_available_lists_attempts() {
    let loader = MockLoader::new(WalkingPerson::new(80))
        .failing(BackendKind::Npu)
        .failing(BackendKind::Gpu)
        .failing(BackendKind::Cpu);
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());
    let devices = all_devices();

    let err = selector
        .probe(BackendPreference::Auto.candidate_devices(&devices), exclusive)
        .unwrap_err();
    let BackendInitError::NoBackendAvailable { attempts } = err else {
        panic!("unexpected error: {err}");
    };
    let kinds: Vec<BackendKind> = attempts.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, BackendKind::PRIORITY);
    assert!(attempts[0].1.contains("driver missing"));
}

#[test]
fn test_class_count_mismatch_rejected() {
    let loader = MockLoader::new(WalkingPerson::new(2));
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());
    let devices = vec![DeviceConfig::new(BackendKind::Gpu)];

    let err = selector.probe(&devices, exclusive).unwrap_err();
    let BackendInitError::NoBackendAvailable { attempts } = err else {
        panic!("unexpected error: {err}");
    };
    assert!(attempts[0].1.contains("80"), "{}", attempts[0].1);
}

#[test]
fn test_pinned_preference_only_tries_its_kind() {
    let loader = MockLoader::new(WalkingPerson::new(80)).failing(BackendKind::Gpu);
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());
    let devices = all_devices();

    let err = selector
        .probe(BackendPreference::Gpu.candidate_devices(&devices), exclusive)
        .unwrap_err();
    assert!(matches!(err, BackendInitError::NoBackendAvailable { ref attempts } if attempts.len() == 1));
    assert_eq!(loader.loads(), ["GPU:0"]);
}

#[test]
fn test_inference_errors_are_typed() {
    let devices = vec![DeviceConfig {
        inference_timeout_ms: 20,
        ..DeviceConfig::new(BackendKind::Npu)
    }];

    let loader = MockLoader::new(Stalled::new(80, Duration::from_millis(200)));
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());
    let mut bound = selector.probe(&devices, exclusive).unwrap();
    let err = bound.backend.infer(&frame("cam", 0)).unwrap_err();
    assert!(matches!(err, InferenceError::Timeout { backend: BackendKind::Npu, .. }));
    let err: streamtrack::Error = err.into();
    assert!(matches!(err, streamtrack::Error::BackendTimeout { .. }));

    let loader = MockLoader::new(Broken::new(80));
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());
    let mut bound = selector.probe(&devices, exclusive).unwrap();
    let err = bound.backend.infer(&frame("cam", 0)).unwrap_err();
    assert!(matches!(err, InferenceError::Runtime { ref message, .. } if message == "device lost"));
}

#[test]
fn test_thresholds_applied_after_bind() {
    let loader = MockLoader::new(WalkingPerson::new(80));
    let strict = Thresholds {
        confidence: 0.95,
        ..Thresholds::default()
    };
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, strict);
    let devices = vec![DeviceConfig::new(BackendKind::Cpu)];

    let mut bound = selector.probe(&devices, exclusive).unwrap();
    assert_eq!(bound.backend.thresholds(), strict);
    // the model only reports 0.9
    assert!(bound.backend.infer(&frame("cam", 0)).unwrap().is_empty());
}

#[test]
fn test_switching_backend_keeps_detections() {
    let loader = MockLoader::new(WalkingPerson::new(80));
    let selector = BackendSelector::new(&loader, Path::new("m"), 80, Thresholds::default());

    let mut results = Vec::new();
    for kind in BackendKind::PRIORITY {
        let devices = vec![DeviceConfig::new(kind)];
        let mut bound = selector.probe(&devices, exclusive).unwrap();
        let detections = bound.backend.infer(&frame("cam", 120)).unwrap();
        results.push(
            detections
                .iter()
                .map(|d| (d.bbox, d.class_id, d.confidence))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
}
