//! Per-connection session state: decoder pool, depth cache, telemetry and
//! the adaptive quality controller (spec §4.6), grounded on the original's
//! `VideoSession`.

mod manager;

pub use manager::SessionManager;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::{DepthCache, DepthFrame};
use crate::video::{FrameSource, VideoMetadata};

const DEFAULT_CACHE_TOLERANCE_MS: f64 = 33.0;
const EMA_ALPHA: f64 = 0.1;
const QUALITY_LADDER: [u32; 7] = [960, 720, 640, 512, 480, 384, 320];
const QUALITY_COOLDOWN_FRAMES: u32 = 60;

const INFER_UP_THRESHOLD_S: f64 = 0.20;
const INFER_DOWN_THRESHOLD_S: f64 = 0.08;
const QUEUE_UP_THRESHOLD_S: f64 = 0.30;
const QUEUE_DOWN_THRESHOLD_S: f64 = 0.10;
const LATENCY_UP_THRESHOLD_MS: f64 = 500.0;
const LATENCY_DOWN_THRESHOLD_MS: f64 = 200.0;

/// Last-observed raw value per pipeline stage, plus the ladder-valued
/// current process resolution (float-typed for uniform EMA-style writes).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
    pub stage_timings: HashMap<String, f64>,
    pub quality_process_res: f64,
}

/// Exponentially-smoothed rolling averages reported to clients and used by
/// the adaptive controller to decide on quality changes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingStats {
    pub infer_avg_s: f64,
    pub queue_avg_s: f64,
    pub ws_send_avg_s: f64,
    pub decode_avg_s: f64,
    pub latency_ms: f64,
    pub depth_fps: f64,
    pub drop_count: f64,
    pub drop_count_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferSnapshot {
    pub buffer_length: usize,
    pub last_depth_time_ms: Option<f64>,
    pub telemetry: Telemetry,
    pub rolling_stats: RollingStats,
}

struct SessionState {
    depth_cache: DepthCache,
    last_depth_time_ms: Option<f64>,
    telemetry: Telemetry,
    rolling_stats: RollingStats,
    quality_cooldown: u32,
}

pub struct Session {
    pub session_id: String,
    pub source_path: PathBuf,
    pub metadata: VideoMetadata,
    pub decoder: Arc<dyn FrameSource>,
    pub max_process_res: u32,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        session_id: String,
        source_path: PathBuf,
        metadata: VideoMetadata,
        decoder: Arc<dyn FrameSource>,
        cache_capacity: usize,
        max_process_res: u32,
    ) -> Arc<Self> {
        Arc::new(Session {
            session_id,
            source_path,
            metadata,
            decoder,
            max_process_res,
            state: Mutex::new(SessionState {
                depth_cache: DepthCache::new(cache_capacity),
                last_depth_time_ms: None,
                telemetry: Telemetry {
                    stage_timings: HashMap::new(),
                    quality_process_res: max_process_res as f64,
                },
                rolling_stats: RollingStats::default(),
                quality_cooldown: 0,
            }),
        })
    }

    pub async fn store_depth_frame(&self, frame: DepthFrame) {
        let mut state = self.state.lock().await;
        state.last_depth_time_ms = Some(frame.timestamp_ms);
        state.depth_cache.store(frame);
    }

    pub async fn get_cached_depth(&self, time_ms: f64, drop_on_hit: bool) -> Option<DepthFrame> {
        let mut state = self.state.lock().await;
        state.depth_cache.get(time_ms, DEFAULT_CACHE_TOLERANCE_MS, drop_on_hit)
    }

    /// Current process resolution chosen by the adaptive controller.
    pub async fn current_process_res(&self) -> u32 {
        let state = self.state.lock().await;
        state.telemetry.quality_process_res.round() as u32
    }

    /// Folds a batch of stage timings into telemetry and rolling stats,
    /// then runs the adaptive controller. `metrics` uses the original's
    /// stage-name vocabulary: `decode_s`, `infer_s`, `pack_s`, `ws_send_s`,
    /// `queue_wait_s`, `total_s`, `latency_ms`, `dropped`.
    pub async fn update_telemetry(&self, metrics: &[(&str, f64)]) {
        let mut state = self.state.lock().await;
        for &(key, val) in metrics {
            state.telemetry.stage_timings.insert(key.to_string(), val);

            match key {
                "dropped" => {
                    state.rolling_stats.drop_count += val;
                    state.rolling_stats.drop_count_total += val as u64;
                }
                "infer_s" | "queue_wait_s" | "ws_send_s" | "decode_s" => {
                    let avg = ema_target_mut(&mut state.rolling_stats, key);
                    *avg = ema_update(*avg, val);
                }
                "latency_ms" => {
                    state.rolling_stats.latency_ms = ema_update(state.rolling_stats.latency_ms, val);
                }
                "depth_fps" => {
                    state.rolling_stats.depth_fps = ema_update(state.rolling_stats.depth_fps, val);
                }
                _ => {}
            }
        }

        if let Some(&total_s) = metrics.iter().find(|(k, _)| *k == "total_s").map(|(_, v)| v).as_ref() {
            if total_s > 0.0 {
                let fps_sample = 1.0 / total_s;
                state.rolling_stats.depth_fps = ema_update(state.rolling_stats.depth_fps, fps_sample);
            }
        }

        adjust_quality(&mut state, self.max_process_res);
    }

    pub async fn buffer_snapshot(&self) -> BufferSnapshot {
        let state = self.state.lock().await;
        BufferSnapshot {
            buffer_length: state.depth_cache.len(),
            last_depth_time_ms: state.last_depth_time_ms,
            telemetry: state.telemetry.clone(),
            rolling_stats: state.rolling_stats.clone(),
        }
    }
}

fn ema_target_mut<'a>(stats: &'a mut RollingStats, stage_key: &str) -> &'a mut f64 {
    match stage_key {
        "infer_s" => &mut stats.infer_avg_s,
        "queue_wait_s" => &mut stats.queue_avg_s,
        "ws_send_s" => &mut stats.ws_send_avg_s,
        "decode_s" => &mut stats.decode_avg_s,
        _ => unreachable!("callers only pass known stage keys"),
    }
}

/// `current == 0.0` is treated as "uninitialized" and seeded directly,
/// matching the original's first-sample behavior.
fn ema_update(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * current
    }
}

/// Demotes or promotes `quality_process_res` by one ladder step when the
/// rolling stats cross the relevant thresholds. Demotes if any metric is
/// bad; promotes only if every metric is good. Resets the cooldown to
/// `QUALITY_COOLDOWN_FRAMES` whenever a change is made.
fn adjust_quality(state: &mut SessionState, max_res: u32) {
    if state.quality_cooldown > 0 {
        state.quality_cooldown -= 1;
        return;
    }

    let steps: Vec<u32> = QUALITY_LADDER.iter().copied().filter(|&s| s <= max_res).collect();
    let steps = if steps.is_empty() { vec![max_res] } else { steps };

    let current_res = state.telemetry.quality_process_res.round() as u32;
    let (current_idx, _) = steps
        .iter()
        .enumerate()
        .min_by_key(|(_, &step)| (step as i64 - current_res as i64).abs())
        .expect("steps is never empty");

    let infer_avg = state.rolling_stats.infer_avg_s;
    let queue_avg = state.rolling_stats.queue_avg_s;
    let latency_ms = state.rolling_stats.latency_ms;

    let mut new_idx = current_idx;
    if infer_avg > INFER_UP_THRESHOLD_S
        || queue_avg > QUEUE_UP_THRESHOLD_S
        || latency_ms > LATENCY_UP_THRESHOLD_MS
    {
        if current_idx < steps.len() - 1 {
            new_idx = current_idx + 1;
        }
    } else if infer_avg < INFER_DOWN_THRESHOLD_S
        && queue_avg < QUEUE_DOWN_THRESHOLD_S
        && latency_ms < LATENCY_DOWN_THRESHOLD_MS
        && current_idx > 0
    {
        new_idx = current_idx - 1;
    }

    let new_res = steps[new_idx];
    if new_res != steps[current_idx] {
        state.telemetry.quality_process_res = new_res as f64;
        state.quality_cooldown = QUALITY_COOLDOWN_FRAMES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(infer_avg: f64, queue_avg: f64, latency_ms: f64, res: f64) -> SessionState {
        SessionState {
            depth_cache: DepthCache::new(8),
            last_depth_time_ms: None,
            telemetry: Telemetry {
                stage_timings: HashMap::new(),
                quality_process_res: res,
            },
            rolling_stats: RollingStats {
                infer_avg_s: infer_avg,
                queue_avg_s: queue_avg,
                latency_ms,
                ..Default::default()
            },
            quality_cooldown: 0,
        }
    }

    #[test]
    fn demotes_resolution_when_infer_time_is_high() {
        let mut state = state_with(0.25, 0.0, 0.0, 640.0);
        adjust_quality(&mut state, 960);
        assert_eq!(state.telemetry.quality_process_res, 512.0);
        assert_eq!(state.quality_cooldown, QUALITY_COOLDOWN_FRAMES);
    }

    #[test]
    fn promotes_resolution_only_when_every_metric_is_good() {
        let mut state = state_with(0.01, 0.01, 50.0, 512.0);
        adjust_quality(&mut state, 960);
        assert_eq!(state.telemetry.quality_process_res, 640.0);
    }

    #[test]
    fn stays_put_when_metrics_are_middling() {
        let mut state = state_with(0.12, 0.15, 250.0, 640.0);
        adjust_quality(&mut state, 960);
        assert_eq!(state.telemetry.quality_process_res, 640.0);
        assert_eq!(state.quality_cooldown, 0);
    }

    #[test]
    fn cooldown_blocks_changes_until_it_elapses() {
        let mut state = state_with(0.25, 0.0, 0.0, 640.0);
        state.quality_cooldown = 5;
        adjust_quality(&mut state, 960);
        assert_eq!(state.telemetry.quality_process_res, 640.0);
        assert_eq!(state.quality_cooldown, 4);
    }

    #[test]
    fn never_demotes_past_the_bottom_of_the_ladder() {
        let mut state = state_with(1.0, 1.0, 5000.0, 320.0);
        adjust_quality(&mut state, 960);
        assert_eq!(state.telemetry.quality_process_res, 320.0);
    }

    #[test]
    fn ema_seeds_on_first_sample_then_smooths() {
        assert_eq!(ema_update(0.0, 1.0), 1.0);
        let smoothed = ema_update(1.0, 2.0);
        assert!((smoothed - 1.1).abs() < 1e-9);
    }
}
