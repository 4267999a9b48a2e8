//! Decoded frames and the frame-source contract.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tracker::Rect;

/// Frame timestamp in milliseconds on the source's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, saturating at zero.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A decoded, immutable video frame.
///
/// Pixel data is interleaved (`channels` bytes per pixel, row-major) and
/// shared, so cloning a frame never copies pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source_id: Arc<str>,
    pub timestamp: Timestamp,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        source_id: impl Into<Arc<str>>,
        timestamp: Timestamp,
        width: u32,
        height: u32,
        channels: u32,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            width,
            height,
            channels,
            data: data.into(),
        }
    }

    /// A frame with dimensions but no pixel payload, for sources and tests
    /// that only exercise the control path.
    pub fn empty(source_id: impl Into<Arc<str>>, timestamp: Timestamp, width: u32, height: u32) -> Self {
        Self::new(source_id, timestamp, width, height, 0, Vec::new())
    }

    /// Copy the region under `rect`, clamped to the frame bounds.
    ///
    /// Returns `None` when the clamped region is empty or the frame carries
    /// no pixel data of the advertised size.
    pub fn crop(&self, rect: Rect) -> Option<Frame> {
        let [x1, y1, x2, y2] = rect.to_tlbr();
        let x1 = x1.max(0.0).floor() as u32;
        let y1 = y1.max(0.0).floor() as u32;
        let x2 = (x2.max(0.0).ceil() as u32).min(self.width);
        let y2 = (y2.max(0.0).ceil() as u32).min(self.height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let channels = self.channels as usize;
        let stride = self.width as usize * channels;
        if channels == 0 || self.data.len() < stride * self.height as usize {
            return None;
        }

        let crop_w = (x2 - x1) as usize;
        let crop_h = (y2 - y1) as usize;
        let mut pixels = Vec::with_capacity(crop_w * crop_h * channels);
        for row in y1 as usize..y2 as usize {
            let start = row * stride + x1 as usize * channels;
            pixels.extend_from_slice(&self.data[start..start + crop_w * channels]);
        }

        Some(Frame::new(
            Arc::clone(&self.source_id),
            self.timestamp,
            crop_w as u32,
            crop_h as u32,
            self.channels,
            pixels,
        ))
    }
}

/// Result of polling a [`FrameSource`].
#[derive(Debug, Clone)]
pub enum SourcePoll {
    Frame(Frame),
    /// No frame arrived within the timeout; the source is still alive.
    Timeout,
    /// The stream has ended. Terminal for the pipeline.
    EndOfStream,
}

/// Supplies decoded frames for one stream.
///
/// Implemented by the ingestion layer (RTSP, files, capture devices). The
/// pipeline calls `next_frame` from a dedicated ingest thread, so an
/// implementation may block for up to `timeout`.
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> SourcePoll;
}

impl<F> FrameSource for F
where
    F: FnMut(Duration) -> SourcePoll + Send,
{
    fn next_frame(&mut self, timeout: Duration) -> SourcePoll {
        self(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let data: Vec<u8> = (0..width * height).map(|i| i as u8).collect();
        Frame::new("cam", Timestamp(0), width, height, 1, data)
    }

    #[test]
    fn test_crop_copies_region() {
        let frame = gradient(4, 4);
        let crop = frame.crop(Rect::new(1.0, 1.0, 2.0, 2.0)).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(&crop.data[..], &[5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let frame = gradient(4, 4);
        let crop = frame.crop(Rect::new(-2.0, 2.0, 10.0, 10.0)).unwrap();
        assert_eq!((crop.width, crop.height), (4, 2));
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = gradient(4, 4);
        assert!(frame.crop(Rect::new(10.0, 10.0, 2.0, 2.0)).is_none());
        assert!(Frame::empty("cam", Timestamp(0), 4, 4).crop(Rect::new(0.0, 0.0, 2.0, 2.0)).is_none());
    }

    #[test]
    fn test_timestamp_since_saturates() {
        assert_eq!(Timestamp(5).since(Timestamp(10)), Duration::ZERO);
        assert_eq!(Timestamp(10).since(Timestamp(4)), Duration::from_millis(6));
    }
}
