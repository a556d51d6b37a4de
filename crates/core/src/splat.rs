//! Forward warping (splatting): push every source value along its flow vector
//! into the destination grid.
//!
//! Each source pixel lands at `(x + dx, y + dy)` and is spread over the four
//! surrounding cells with bilinear weights. The kernel is selected once when
//! the [`ForwardWarp`] is built:
//! - [`SplatBackend::Portable`]: scalar Rust loop, always available
//! - [`SplatBackend::Onnx`]: accelerated kernel exported as ONNX and run through
//!   the configured execution provider
//!
//! A missing accelerated kernel only costs speed; [`ForwardWarp::detect`] falls
//! back to the portable loop, warning once per process when a configured
//! kernel cannot be used.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use tracing::{debug, warn};

use crate::error::InterpolationError;
use crate::onnx::{InferenceBackend, OnnxSplatKernel, SessionConfig};

/// Added to the accumulated weight before normalizing.
pub const SPLAT_EPSILON: f32 = 1e-7;
/// Coverage at or above this value counts as a fully covered destination.
pub const COVERAGE_THRESHOLD: f32 = 0.999;

static FALLBACK_LOGGED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatMode {
    /// Raw weighted sum of contributions.
    Sum,
    /// Weighted mean of contributions; 0 where nothing landed.
    Average,
}

/// Result of a forward warp.
#[derive(Debug, Clone)]
pub struct Splatted {
    pub values: Array3<f32>,
    /// `weight / (weight + eps)`: equal to average-splatting an all-ones field.
    pub coverage: Array2<f32>,
}

impl Splatted {
    pub fn is_covered(&self, y: usize, x: usize) -> bool {
        self.coverage[[y, x]] >= COVERAGE_THRESHOLD
    }
}

#[derive(Clone)]
pub enum SplatBackend {
    Portable,
    Onnx(OnnxSplatKernel),
}

#[derive(Clone)]
pub struct ForwardWarp {
    backend: SplatBackend,
}

impl ForwardWarp {
    pub fn portable() -> Self {
        Self {
            backend: SplatBackend::Portable,
        }
    }

    pub fn with_backend(backend: SplatBackend) -> Self {
        Self { backend }
    }

    /// Try the accelerated kernel at `kernel_path`; any failure selects the
    /// portable kernel. Only a configured kernel that fails to load is worth a
    /// warning.
    pub fn detect(
        kernel_path: Option<&Path>,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Self {
        match Self::accelerated(kernel_path, backend, trt_cache_dir) {
            Ok(Some(warp)) => warp,
            Ok(None) => {
                debug!("No splat kernel configured, using portable forward warp");
                Self::portable()
            }
            Err(error) => {
                log_fallback_once(&format!("{error:#}"));
                Self::portable()
            }
        }
    }

    fn accelerated(
        kernel_path: Option<&Path>,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Option<Self>> {
        let Some(kernel_path) = kernel_path else {
            return Ok(None);
        };
        if !kernel_path.exists() {
            bail!("splat kernel not found: {}", kernel_path.display());
        }

        let config = SessionConfig {
            model_path: kernel_path,
            backend,
            trt_cache_dir,
        };
        let kernel = OnnxSplatKernel::load(&config).context("failed to load splat kernel")?;
        debug!(kernel = %kernel_path.display(), "Using accelerated splat kernel");
        Ok(Some(Self::with_backend(SplatBackend::Onnx(kernel))))
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            SplatBackend::Portable => "portable",
            SplatBackend::Onnx(_) => "onnx",
        }
    }

    /// Splat `values` (C, H, W) along `flow` (2, H, W).
    pub fn warp_forward(
        &self,
        values: ArrayView3<'_, f32>,
        flow: ArrayView3<'_, f32>,
        mode: SplatMode,
    ) -> Result<Splatted> {
        let (_, h, w) = values.dim();
        let (flow_c, flow_h, flow_w) = flow.dim();
        if flow_c != 2 {
            return Err(InterpolationError::ChannelMismatch {
                expected: 2,
                found: flow_c,
            }
            .into());
        }
        if (flow_h, flow_w) != (h, w) {
            return Err(InterpolationError::ShapeMismatch {
                expected: (h, w),
                found: (flow_h, flow_w),
            }
            .into());
        }

        let (sums, weights) = match &self.backend {
            SplatBackend::Portable => accumulate(values, flow),
            SplatBackend::Onnx(kernel) => kernel.accumulate(values, flow)?,
        };
        Ok(normalize(sums, weights, mode))
    }

    /// Average-splat a single-channel map.
    pub fn warp_map(
        &self,
        map: ArrayView2<'_, f32>,
        flow: ArrayView3<'_, f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let splatted = self.warp_forward(map.insert_axis(Axis(0)), flow, SplatMode::Average)?;
        Ok((
            splatted.values.index_axis_move(Axis(0), 0),
            splatted.coverage,
        ))
    }
}

impl Default for ForwardWarp {
    fn default() -> Self {
        Self::portable()
    }
}

fn log_fallback_once(reason: &str) {
    if !FALLBACK_LOGGED.swap(true, Ordering::Relaxed) {
        warn!(
            reason,
            "Accelerated forward warp unavailable; using portable kernel"
        );
    }
}

/// Bilinear splat: returns per-channel weighted sums and the weight map.
fn accumulate(values: ArrayView3<'_, f32>, flow: ArrayView3<'_, f32>) -> (Array3<f32>, Array2<f32>) {
    let (channels, h, w) = values.dim();
    let mut sums = Array3::<f32>::zeros((channels, h, w));
    let mut weights = Array2::<f32>::zeros((h, w));

    for y in 0..h {
        for x in 0..w {
            let fx = x as f32 + flow[[0, y, x]];
            let fy = y as f32 + flow[[1, y, x]];
            if !(fx.is_finite() && fy.is_finite()) {
                continue;
            }

            let x0 = fx.floor();
            let y0 = fy.floor();
            let (ax, ay) = (fx - x0, fy - y0);
            let corners = [
                (x0, y0, (1.0 - ax) * (1.0 - ay)),
                (x0 + 1.0, y0, ax * (1.0 - ay)),
                (x0, y0 + 1.0, (1.0 - ax) * ay),
                (x0 + 1.0, y0 + 1.0, ax * ay),
            ];

            for (tx, ty, weight) in corners {
                if tx < 0.0 || ty < 0.0 || tx >= w as f32 || ty >= h as f32 {
                    continue;
                }
                let (tx, ty) = (tx as usize, ty as usize);
                weights[[ty, tx]] += weight;
                for c in 0..channels {
                    sums[[c, ty, tx]] += values[[c, y, x]] * weight;
                }
            }
        }
    }

    (sums, weights)
}

fn normalize(mut sums: Array3<f32>, weights: Array2<f32>, mode: SplatMode) -> Splatted {
    if mode == SplatMode::Average {
        for mut plane in sums.outer_iter_mut() {
            plane.zip_mut_with(&weights, |v, w| *v /= w + SPLAT_EPSILON);
        }
    }
    let coverage = weights.mapv(|w| w / (w + SPLAT_EPSILON));
    Splatted {
        values: sums,
        coverage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn uniform_flow(h: usize, w: usize, dx: f32, dy: f32) -> Array3<f32> {
        let mut flow = Array3::<f32>::zeros((2, h, w));
        flow.slice_mut(s![0, .., ..]).fill(dx);
        flow.slice_mut(s![1, .., ..]).fill(dy);
        flow
    }

    fn ramp(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((1, h, w), |(_, y, x)| (y * w + x) as f32 + 1.0)
    }

    #[test]
    fn test_zero_flow_average_is_identity_with_full_coverage() {
        let values = ramp(4, 5);
        let warp = ForwardWarp::portable();
        let out = warp
            .warp_forward(values.view(), uniform_flow(4, 5, 0.0, 0.0).view(), SplatMode::Average)
            .unwrap();
        for (a, b) in out.values.iter().zip(values.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        assert!(out.coverage.iter().all(|c| *c >= COVERAGE_THRESHOLD));
    }

    #[test]
    fn test_integer_shift_moves_values_and_opens_holes() {
        let values = ramp(3, 4);
        let warp = ForwardWarp::portable();
        let out = warp
            .warp_forward(values.view(), uniform_flow(3, 4, 1.0, 0.0).view(), SplatMode::Average)
            .unwrap();
        for y in 0..3 {
            assert!(!out.is_covered(y, 0));
            assert_eq!(out.values[[0, y, 0]], 0.0);
            for x in 1..4 {
                assert!(out.is_covered(y, x));
                assert!((out.values[[0, y, x]] - values[[0, y, x - 1]]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_half_pixel_shift_splits_weight() {
        let mut values = Array3::<f32>::zeros((1, 1, 3));
        values[[0, 0, 0]] = 2.0;
        let mut flow = Array3::<f32>::zeros((2, 1, 3));
        flow[[0, 0, 0]] = 0.5;
        flow[[0, 0, 1]] = f32::NAN;
        flow[[0, 0, 2]] = 5.0;

        let out = ForwardWarp::portable()
            .warp_forward(values.view(), flow.view(), SplatMode::Sum)
            .unwrap();
        assert!((out.values[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((out.values[[0, 0, 1]] - 1.0).abs() < 1e-6);
        // NaN flow and out-of-grid targets contribute nothing
        assert_eq!(out.values[[0, 0, 2]], 0.0);
        assert!(!out.is_covered(0, 2));
    }

    #[test]
    fn test_average_of_colliding_contributions() {
        let mut values = Array3::<f32>::zeros((1, 1, 2));
        values[[0, 0, 0]] = 1.0;
        values[[0, 0, 1]] = 3.0;
        let mut flow = Array3::<f32>::zeros((2, 1, 2));
        flow[[0, 0, 0]] = 1.0;

        let out = ForwardWarp::portable()
            .warp_forward(values.view(), flow.view(), SplatMode::Average)
            .unwrap();
        assert!((out.values[[0, 0, 1]] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_coverage_matches_splatting_ones() {
        let flow = Array3::from_shape_fn((2, 5, 5), |(c, y, x)| {
            ((c + 1) as f32 * 0.37 * (x as f32 - y as f32)).sin() * 1.7
        });
        let warp = ForwardWarp::portable();
        let ones = Array2::<f32>::ones((5, 5));
        let (warped_ones, coverage) = warp.warp_map(ones.view(), flow.view()).unwrap();
        for (a, b) in warped_ones.iter().zip(coverage.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_shape_checks() {
        let warp = ForwardWarp::portable();
        let values = Array3::<f32>::zeros((1, 4, 4));
        let err = warp
            .warp_forward(values.view(), Array3::zeros((3, 4, 4)).view(), SplatMode::Sum)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InterpolationError>(),
            Some(InterpolationError::ChannelMismatch { .. })
        ));
        let err = warp
            .warp_forward(values.view(), Array3::zeros((2, 4, 3)).view(), SplatMode::Sum)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InterpolationError>(),
            Some(InterpolationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_detect_without_kernel_falls_back() {
        let warp = ForwardWarp::detect(None, &InferenceBackend::Cuda, None);
        assert_eq!(warp.backend_name(), "portable");

        let missing = std::env::temp_dir().join("drba-missing-softsplat.onnx");
        let warp = ForwardWarp::detect(Some(&missing), &InferenceBackend::Cuda, None);
        assert_eq!(warp.backend_name(), "portable");
    }

    #[test]
    fn test_unconfigured_kernel_is_not_a_failure() {
        let selected = ForwardWarp::accelerated(None, &InferenceBackend::Cuda, None).unwrap();
        assert!(selected.is_none());

        let missing = std::env::temp_dir().join("drba-missing-softsplat.onnx");
        let err = ForwardWarp::accelerated(Some(&missing), &InferenceBackend::Cuda, None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("splat kernel not found"));
    }
}
