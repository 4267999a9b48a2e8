//! Thresholding shared by every backend.
//!
//! Runs after the model's forward pass on raw outputs. Keeping it in one
//! place is what makes a backend switch change latency and accuracy only,
//! never which detections survive filtering.

use serde::{Deserialize, Serialize};

use crate::backend::builder::DetectionBuilder;
use crate::backend::detection::{Detection, RawDetection};
use crate::backend::selection::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub confidence: f32,
    pub nms_iou: f32,
    pub max_detections: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            nms_iou: 0.4,
            max_detections: 100,
        }
    }
}

/// Turn raw model outputs into the ordered detection list for a frame.
///
/// Drops non-finite outputs and scores below the confidence threshold,
/// clamps boxes to the frame (discarding boxes that end up empty), applies
/// per-class NMS, orders by [`Detection::rank_cmp`] and keeps at most
/// `max_detections`.
pub fn postprocess(
    raw: &[RawDetection],
    thresholds: &Thresholds,
    frame_width: u32,
    frame_height: u32,
    backend: BackendKind,
) -> Vec<Detection> {
    let mut detections: Vec<Detection> = raw
        .iter()
        .filter(|r| r.is_finite())
        .map(|r| DetectionBuilder::from_raw(r).backend(backend).build())
        .filter(|d| d.confidence >= thresholds.confidence)
        .filter_map(|mut d| {
            d.bbox = d.bbox.clamp_to(frame_width as f32, frame_height as f32);
            (d.bbox.area() > 0.0).then_some(d)
        })
        .collect();

    non_max_suppression(&mut detections, thresholds.nms_iou);
    detections.truncate(thresholds.max_detections);
    detections
}

/// Per-class greedy NMS. Leaves `detections` in rank order.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(Detection::rank_cmp);

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept).any(|prev| {
            detections[prev].class_id == detections[index].class_id
                && detections[prev].bbox.iou(&detections[index].bbox) > iou_threshold
        });
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32, class_id: u32, score: f32) -> RawDetection {
        RawDetection::new([x1, y1, x2, y2], class_id, score)
    }

    #[test]
    fn test_nms_is_per_class() {
        let input = vec![
            raw(0.0, 0.0, 10.0, 10.0, 0, 0.9),
            raw(1.0, 1.0, 11.0, 11.0, 0, 0.8),
            raw(1.0, 1.0, 11.0, 11.0, 1, 0.7),
        ];
        let out = postprocess(&input, &Thresholds::default(), 100, 100, BackendKind::Cpu);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].class_id, out[0].confidence), (0, 0.9));
        assert_eq!(out[1].class_id, 1);
    }

    #[test]
    fn test_threshold_clamp_and_truncate() {
        let input = vec![
            raw(-10.0, -10.0, 20.0, 20.0, 0, 0.6),
            raw(50.0, 50.0, 60.0, 60.0, 0, 0.4),
            raw(30.0, 30.0, 40.0, 40.0, 2, 1.3),
            raw(70.0, 70.0, 80.0, 80.0, 1, 0.6),
            raw(f32::NAN, 0.0, 1.0, 1.0, 0, 0.99),
            raw(200.0, 200.0, 210.0, 210.0, 0, 0.99),
        ];
        let thresholds = Thresholds {
            max_detections: 2,
            ..Thresholds::default()
        };
        let out = postprocess(&input, &thresholds, 100, 100, BackendKind::Gpu);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 1.0);
        // equal confidence: lower class id first
        assert_eq!(out[1].class_id, 0);
        assert_eq!(out[1].bbox.to_tlbr(), [0.0, 0.0, 20.0, 20.0]);
        assert!(out.iter().all(|d| d.backend == BackendKind::Gpu));
    }

    #[test]
    fn test_same_raw_same_output_on_every_backend() {
        let input = vec![
            raw(5.0, 5.0, 25.0, 45.0, 0, 0.72),
            raw(6.0, 5.0, 26.0, 45.0, 0, 0.70),
            raw(60.0, 10.0, 90.0, 50.0, 3, 0.88),
        ];
        let thresholds = Thresholds::default();
        let reference = postprocess(&input, &thresholds, 100, 100, BackendKind::Npu);
        for kind in [BackendKind::Gpu, BackendKind::Cpu] {
            let out = postprocess(&input, &thresholds, 100, 100, kind);
            assert_eq!(out.len(), reference.len());
            for (a, b) in out.iter().zip(&reference) {
                assert_eq!(a.class_id, b.class_id);
                assert!(a.bbox.iou(&b.bbox) >= 0.95);
            }
        }
    }
}
