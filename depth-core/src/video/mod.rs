pub mod decode;
pub mod meta;
pub mod pool;

pub use decode::Decoder;
pub use meta::{FrameInfo, VideoMetadata};
pub use pool::DecoderPool;

use ndarray::Array3;

use crate::error::Result;

/// Anything that can hand back a decoded RGB frame for a timestamp. The
/// pipeline talks to this trait rather than `DecoderPool` directly so
/// integration tests can substitute a canned frame source instead of a
/// real ffmpeg-backed video, mirroring the `DepthEstimator` seam.
pub trait FrameSource: Send + Sync {
    fn decode_at(&self, time_ms: f64) -> Result<(Array3<u8>, FrameInfo)>;
    fn metadata(&self) -> VideoMetadata;
}

impl FrameSource for DecoderPool {
    fn decode_at(&self, time_ms: f64) -> Result<(Array3<u8>, FrameInfo)> {
        DecoderPool::decode_at(self, time_ms)
    }

    fn metadata(&self) -> VideoMetadata {
        DecoderPool::metadata(self)
    }
}
