//! Bounded ring of recently produced depth frames, keyed by proximity to a
//! requested timestamp (spec §4.3). A freshness buffer, not a general cache:
//! a hit discards everything at or older than it.

use std::collections::VecDeque;

use ndarray::Array2;

#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub timestamp_ms: f64,
    pub depth: Array2<f32>,
    pub z_min: f32,
    pub z_max: f32,
}

pub struct DepthCache {
    capacity: usize,
    frames: VecDeque<DepthFrame>,
}

impl DepthCache {
    pub fn new(capacity: usize) -> Self {
        DepthCache {
            capacity,
            frames: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a frame, evicting the oldest one if at capacity.
    pub fn store(&mut self, frame: DepthFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Scans newest-to-oldest for the first frame within `tolerance_ms` of
    /// `time_ms`. If `drop_on_hit`, that frame and everything older than it
    /// are discarded, since the next request is almost always a later
    /// timestamp.
    pub fn get(&mut self, time_ms: f64, tolerance_ms: f64, drop_on_hit: bool) -> Option<DepthFrame> {
        let hit_index = self
            .frames
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| (f.timestamp_ms - time_ms).abs() <= tolerance_ms)
            .map(|(i, _)| i)?;

        let hit = self.frames[hit_index].clone();
        if drop_on_hit {
            for _ in 0..=hit_index {
                self.frames.pop_front();
            }
        }
        Some(hit)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
