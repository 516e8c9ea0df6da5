//! The depth inference seam (spec §1): a trait object standing in for
//! whatever model wrapper is plugged in at deploy time, matching the
//! original's `DepthModel` — lazy-loading, semaphore-gated, with a
//! synchronous fallback for blocking contexts.

use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{Array2, Array3};
use tokio::sync::Semaphore;

use crate::error::{DepthError, Result};

/// A depth map in meters, plus the percentile range used to quantize it.
#[derive(Debug, Clone)]
pub struct DepthPrediction {
    pub depth: Array2<f32>,
    pub z_min: f32,
    pub z_max: f32,
}

/// Async boundary for depth inference. Implementors may block internally
/// (model forward passes are not `async`-native); the concurrency limit
/// lives in [`InferenceEngine`], not here, so a trait impl need not manage
/// its own semaphore.
///
/// `target_size`, when set, is the `(width, height)` the caller wants the
/// resulting depth map downsampled to (spec §4.7's `depth_downsample_factor`,
/// computed by [`target_size_for`]); `None` means "no downsampling".
#[async_trait]
pub trait DepthEstimator: Send + Sync {
    async fn infer(
        &self,
        frame: &Array3<u8>,
        process_res: u32,
        target_size: Option<(u32, u32)>,
    ) -> Result<DepthPrediction>;
}

/// Computes the depth output size for a decoded frame of `(width, height)`
/// given `depth_downsample_factor` (an integer divisor ≥ 1), matching the
/// original's `target_size = (w // factor, h // factor)` calculation ahead
/// of inference in `backend/routers/stream.py`. Never returns a zero
/// dimension.
pub fn target_size_for(width: u32, height: u32, downsample_factor: u32) -> (u32, u32) {
    let factor = downsample_factor.max(1);
    ((width / factor).max(1), (height / factor).max(1))
}

/// Resamples `depth` down to `(target_width, target_height)` via
/// nearest-neighbor decimation, matching the original's `depth[::factor,
/// ::factor]` slicing in `backend/utils/depth_ops.py::downsample_depth`.
/// A no-op when `target` already matches `depth`'s shape.
pub fn downsample_depth(depth: &Array2<f32>, target: (u32, u32)) -> Array2<f32> {
    let (src_h, src_w) = depth.dim();
    let target_w = (target.0 as usize).max(1);
    let target_h = (target.1 as usize).max(1);
    if target_w == src_w && target_h == src_h {
        return depth.clone();
    }
    Array2::from_shape_fn((target_h, target_w), |(y, x)| {
        let src_y = (y * src_h / target_h).min(src_h - 1);
        let src_x = (x * src_w / target_w).min(src_w - 1);
        depth[[src_y, src_x]]
    })
}

/// Wraps a [`DepthEstimator`] with the semaphore that bounds concurrent
/// in-flight inferences to `inference_worker_count` (spec §4.7), mirroring
/// the original's `asyncio.Semaphore` around `infer_depth_async`.
pub struct InferenceEngine {
    estimator: Arc<dyn DepthEstimator>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl InferenceEngine {
    pub fn new(estimator: Arc<dyn DepthEstimator>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        InferenceEngine {
            estimator,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn inflight_count(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub async fn infer(
        &self,
        frame: &Array3<u8>,
        process_res: u32,
        target_size: Option<(u32, u32)>,
    ) -> Result<DepthPrediction> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DepthError::ChannelClosed)?;
        self.estimator.infer(frame, process_res, target_size).await
    }
}

/// Dependency-free stand-in for a real model: derives a plausible depth
/// map from luma (brighter pixels read as nearer), so the pipeline and its
/// tests can run end to end without an ML runtime installed.
pub struct SyntheticDepthEstimator;

#[async_trait]
impl DepthEstimator for SyntheticDepthEstimator {
    async fn infer(
        &self,
        frame: &Array3<u8>,
        _process_res: u32,
        target_size: Option<(u32, u32)>,
    ) -> Result<DepthPrediction> {
        let (height, width, _channels) = frame.dim();
        let mut depth = Array2::<f32>::zeros((height, width));
        for y in 0..height {
            for x in 0..width {
                let r = frame[[y, x, 0]] as f32;
                let g = frame[[y, x, 1]] as f32;
                let b = frame[[y, x, 2]] as f32;
                let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                depth[[y, x]] = 1.0 + (255.0 - luma) / 255.0 * 9.0;
            }
        }

        if let Some(target) = target_size {
            depth = downsample_depth(&depth, target);
        }

        let (z_min, z_max) = percentile_range(&depth, 1.0, 99.0);
        Ok(DepthPrediction { depth, z_min, z_max })
    }
}

fn percentile_range(depth: &Array2<f32>, low_pct: f64, high_pct: f64) -> (f32, f32) {
    let mut values: Vec<f32> = depth.iter().copied().collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let pick = |pct: f64| -> f32 {
        if values.is_empty() {
            return 0.0;
        }
        let rank = (pct / 100.0 * (values.len() - 1) as f64).round() as usize;
        values[rank.min(values.len() - 1)]
    };
    let z_min = pick(low_pct);
    let mut z_max = pick(high_pct);
    if z_max <= z_min {
        z_max = z_min + 1.0;
    }
    (z_min, z_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_estimator_produces_a_nondegenerate_range() {
        let frame = Array3::from_shape_fn((4, 4, 3), |(y, x, c)| ((y + x + c) * 10) as u8);
        let estimator = SyntheticDepthEstimator;
        let prediction = estimator.infer(&frame, 640, None).await.unwrap();
        assert_eq!(prediction.depth.dim(), (4, 4));
        assert!(prediction.z_max > prediction.z_min);
    }

    #[tokio::test]
    async fn synthetic_estimator_honors_a_downsample_target_size() {
        let frame = Array3::from_shape_fn((8, 8, 3), |(y, x, c)| ((y + x + c) * 5) as u8);
        let estimator = SyntheticDepthEstimator;
        let prediction = estimator.infer(&frame, 640, Some((4, 4))).await.unwrap();
        assert_eq!(prediction.depth.dim(), (4, 4));
    }

    #[tokio::test]
    async fn engine_limits_concurrency_to_its_configured_width() {
        let engine = Arc::new(InferenceEngine::new(Arc::new(SyntheticDepthEstimator), 2));
        let frame = Arc::new(Array3::from_shape_fn((2, 2, 3), |_| 128u8));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            let frame = frame.clone();
            handles.push(tokio::spawn(async move { engine.infer(&frame, 320, None).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[test]
    fn target_size_divides_by_the_downsample_factor() {
        assert_eq!(target_size_for(640, 480, 2), (320, 240));
        assert_eq!(target_size_for(640, 480, 1), (640, 480));
    }

    #[test]
    fn target_size_never_reaches_zero() {
        assert_eq!(target_size_for(3, 3, 8), (1, 1));
    }

    #[test]
    fn downsample_depth_decimates_to_the_target_shape() {
        let depth = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
        let small = downsample_depth(&depth, (2, 2));
        assert_eq!(small.dim(), (2, 2));
    }

    #[test]
    fn downsample_depth_is_a_no_op_at_the_same_size() {
        let depth = Array2::from_shape_fn((3, 3), |(y, x)| (y + x) as f32);
        let same = downsample_depth(&depth, (3, 3));
        assert_eq!(same, depth);
    }
}
