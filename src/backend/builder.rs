//! Builder for detections from the box layouts model runtimes emit.

use crate::backend::detection::{Detection, RawDetection};
use crate::backend::selection::BackendKind;
use crate::tracker::Rect;

#[derive(Debug, Clone)]
pub struct DetectionBuilder {
    bbox: Rect,
    class_id: u32,
    confidence: f32,
    backend: BackendKind,
}

impl Default for DetectionBuilder {
    fn default() -> Self {
        Self {
            bbox: Rect::default(),
            class_id: 0,
            confidence: 0.0,
            backend: BackendKind::Cpu,
        }
    }
}

impl DetectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a raw model output, keeping its class and score.
    pub fn from_raw(raw: &RawDetection) -> Self {
        let [x1, y1, x2, y2] = raw.bbox;
        Self::new().tlbr(x1, y1, x2, y2).class(raw.class_id).confidence(raw.score)
    }

    /// Corners: (x1, y1, x2, y2).
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Rect::from_tlbr(x1, y1, x2, y2);
        self
    }

    /// Center plus size: (cx, cy, w, h).
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(cx - w / 2.0, cy - h / 2.0, w, h);
        self
    }

    /// Top-left corner plus size: (x, y, w, h).
    pub fn tlwh(mut self, x: f32, y: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(x, y, w, h);
        self
    }

    pub fn class(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn build(self) -> Detection {
        Detection::new(self.bbox, self.class_id, self.confidence, self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_agree() {
        let a = DetectionBuilder::new().tlbr(10.0, 20.0, 50.0, 80.0).build();
        let b = DetectionBuilder::new().xywh(30.0, 50.0, 40.0, 60.0).build();
        let c = DetectionBuilder::new().tlwh(10.0, 20.0, 40.0, 60.0).build();
        assert_eq!(a.bbox, b.bbox);
        assert_eq!(a.bbox, c.bbox);
    }

    #[test]
    fn test_from_raw() {
        let raw = RawDetection::new([0.0, 0.0, 10.0, 10.0], 7, 0.95);
        let det = DetectionBuilder::from_raw(&raw).backend(BackendKind::Npu).build();
        assert_eq!(det.class_id, 7);
        assert_eq!(det.confidence, 0.95);
        assert_eq!(det.backend, BackendKind::Npu);
    }
}
