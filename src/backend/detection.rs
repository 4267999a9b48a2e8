use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::backend::selection::BackendKind;
use crate::tracker::Rect;

/// A single filtered detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Rect,
    pub class_id: u32,
    /// Always within [0, 1]
    pub confidence: f32,
    /// Backend that produced the detection
    pub backend: BackendKind,
}

impl Detection {
    pub fn new(bbox: Rect, class_id: u32, confidence: f32, backend: BackendKind) -> Self {
        Self {
            bbox,
            class_id,
            confidence: confidence.clamp(0.0, 1.0),
            backend,
        }
    }

    /// Output order: confidence descending, then class id ascending, then
    /// box coordinates so equal-score detections never depend on input order.
    pub fn rank_cmp(&self, other: &Detection) -> Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then(self.class_id.cmp(&other.class_id))
            .then(self.bbox.x.total_cmp(&other.bbox.x))
            .then(self.bbox.y.total_cmp(&other.bbox.y))
            .then(self.bbox.width.total_cmp(&other.bbox.width))
            .then(self.bbox.height.total_cmp(&other.bbox.height))
    }
}

/// Model output before thresholding and NMS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Box as [x1, y1, x2, y2] in frame pixels
    pub bbox: [f32; 4],
    pub class_id: u32,
    /// Unclamped model score
    pub score: f32,
}

impl RawDetection {
    pub fn new(bbox: [f32; 4], class_id: u32, score: f32) -> Self {
        Self { bbox, class_id, score }
    }

    pub fn is_finite(&self) -> bool {
        self.score.is_finite() && self.bbox.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order() {
        let a = Detection::new(Rect::new(0.0, 0.0, 1.0, 1.0), 2, 0.9, BackendKind::Cpu);
        let b = Detection::new(Rect::new(0.0, 0.0, 1.0, 1.0), 1, 0.9, BackendKind::Cpu);
        let c = Detection::new(Rect::new(0.0, 0.0, 1.0, 1.0), 0, 0.5, BackendKind::Cpu);
        let mut dets = vec![c.clone(), a.clone(), b.clone()];
        dets.sort_by(Detection::rank_cmp);
        assert_eq!(dets, vec![b, a, c]);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let det = Detection::new(Rect::default(), 0, 1.7, BackendKind::Gpu);
        assert_eq!(det.confidence, 1.0);
    }
}
