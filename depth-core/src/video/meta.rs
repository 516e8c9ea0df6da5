//! Value types shared by the decoder pool: stream-level metadata and
//! per-frame provenance (spec §3/§4.2).

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub frames: Option<u64>,
    pub fps: f64,
    pub duration_ms: Option<f64>,
}

impl VideoMetadata {
    pub fn aspect(&self) -> f64 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub time_ms: f64,
    pub index: i64,
    pub pts: Option<i64>,
    pub key_frame: bool,
}
