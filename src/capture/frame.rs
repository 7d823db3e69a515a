use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::format::FourCC;

/// Frame copied out of a dequeued buffer
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the snapshot was taken, for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub buffer_index: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: FourCC,
    pub device_timestamp: Duration, // Completion time on the device clock
}

impl Frame {
    /// Bytes of row `y`, if it lies inside the frame.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.meta.stride as usize;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }
}
