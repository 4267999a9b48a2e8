use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, stored as top-left corner plus
/// size (TLWH).
///
/// Conversions cover the three layouts used across the crate:
/// - TLWH: what detections and snapshots carry
/// - TLBR: what model runtimes usually emit
/// - XYAH: center, aspect ratio, height; the Kalman measurement space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    #[inline]
    pub fn from_xyah(cx: f32, cy: f32, aspect_ratio: f32, height: f32) -> Self {
        let width = aspect_ratio * height;
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    #[inline]
    pub fn to_tlwh(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }

    /// Center x, center y, width / height, height. A degenerate box reports
    /// an aspect ratio of zero.
    #[inline]
    pub fn to_xyah(&self) -> [f32; 4] {
        let (cx, cy) = self.center();
        let aspect_ratio = if self.height > 0.0 {
            self.width / self.height
        } else {
            0.0
        };
        [cx, cy, aspect_ratio, self.height]
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    /// Clip the box to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: f32, height: f32) -> Rect {
        let [x1, y1, x2, y2] = self.to_tlbr();
        let x1 = x1.clamp(0.0, width);
        let y1 = y1.clamp(0.0, height);
        let x2 = x2.clamp(x1, width);
        let y2 = y2.clamp(y1, height);
        Rect::from_tlbr(x1, y1, x2, y2)
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Intersection over union; zero when either box is empty.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Pairwise IoU, shape `(boxes_a.len(), boxes_b.len())`.
pub fn iou_batch(boxes_a: &[Rect], boxes_b: &[Rect]) -> Array2<f32> {
    let mut ious = Array2::zeros((boxes_a.len(), boxes_b.len()));
    for (i, a) in boxes_a.iter().enumerate() {
        for (j, b) in boxes_b.iter().enumerate() {
            ious[[i, j]] = a.iou(b);
        }
    }
    ious
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_conversions() {
        let rect = Rect::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(rect.to_tlbr(), [10.0, 20.0, 40.0, 60.0]);

        let xyah = rect.to_xyah();
        assert_eq!(xyah[0], 25.0);
        assert_eq!(xyah[1], 40.0);
        assert!((xyah[2] - 0.75).abs() < 1e-6);
        assert_eq!(xyah[3], 40.0);

        let back = Rect::from_xyah(xyah[0], xyah[1], xyah[2], xyah[3]);
        assert!((back.x - 10.0).abs() < 1e-5 && (back.width - 30.0).abs() < 1e-5);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 10.0, 10.0);
        // 25 / (100 + 100 - 25)
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&Rect::new(20.0, 20.0, 10.0, 10.0)), 0.0);
        assert_eq!(Rect::default().iou(&Rect::default()), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_to_frame() {
        let r = Rect::from_tlbr(-5.0, 10.0, 120.0, 50.0).clamp_to(100.0, 40.0);
        assert_eq!(r.to_tlbr(), [0.0, 10.0, 100.0, 40.0]);

        let outside = Rect::new(200.0, 200.0, 10.0, 10.0).clamp_to(100.0, 100.0);
        assert_eq!(outside.area(), 0.0);
    }
}
