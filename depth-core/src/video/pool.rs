//! Free-list pool of [`Decoder`]s with locality-aware dispatch (spec §4.2),
//! grounded on the original's `DecoderPool`: prefer a decoder that can
//! stream forward to the requested time without seeking; otherwise fall
//! back to the most recently returned one (LIFO) to keep a "hot" decoder
//! active rather than round-robining cold ones.

use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use ndarray::Array3;

use crate::error::Result;
use crate::video::decode::Decoder;
use crate::video::meta::{FrameInfo, VideoMetadata};

pub struct DecoderPool {
    source: PathBuf,
    count: usize,
    free: Mutex<Vec<Decoder>>,
    available: Condvar,
}

impl DecoderPool {
    pub fn open(source: &Path, count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut decoders = Vec::with_capacity(count);
        for _ in 0..count {
            decoders.push(Decoder::open(source)?);
        }
        Ok(DecoderPool {
            source: source.to_owned(),
            count,
            free: Mutex::new(decoders),
            available: Condvar::new(),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn metadata(&self) -> VideoMetadata {
        let decoder = self.checkout();
        let meta = decoder.metadata();
        self.checkin(decoder);
        meta
    }

    pub fn decode_at(&self, time_ms: f64) -> Result<(Array3<u8>, FrameInfo)> {
        let mut decoder = self.checkout_near(time_ms);
        let result = decoder.decode_at(time_ms);
        self.checkin(decoder);
        result
    }

    fn checkout(&self) -> Decoder {
        let mut free = self.free.lock().unwrap();
        while free.is_empty() {
            free = self.available.wait(free).unwrap();
        }
        free.pop().expect("non-empty checked above")
    }

    fn checkout_near(&self, time_ms: f64) -> Decoder {
        let mut free = self.free.lock().unwrap();
        while free.is_empty() {
            free = self.available.wait(free).unwrap();
        }
        let locality_match = free.iter().position(|d| d.should_stream_forward(time_ms));
        match locality_match {
            Some(index) => free.remove(index),
            None => free.pop().expect("non-empty checked above"),
        }
    }

    fn checkin(&self, decoder: Decoder) {
        let mut free = self.free.lock().unwrap();
        free.push(decoder);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_nonexistent_source() {
        let result = DecoderPool::open(Path::new("/nonexistent/video.mp4"), 2);
        assert!(result.is_err());
    }
}
