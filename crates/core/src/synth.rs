//! Intermediate frame synthesis between two anchors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use ndarray::{Array3, ArrayView3, Axis, Zip};
use tracing::{debug, warn};

use crate::error::{InterpolationError, InterpolationWarning};
use crate::network::FlowEstimator;
use crate::sampling::sigmoid;
use crate::splat::{ForwardWarp, SplatMode};
use crate::types::{Frame, PairFlow, TimestepField};

/// Per-call knobs shared by every synthesis of one interpolator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisOptions {
    /// Flow scale; values below 1 estimate flow at reduced resolution.
    pub scale: f32,
    pub ensemble: bool,
    pub fast_mode: bool,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            ensemble: false,
            fast_mode: true,
        }
    }
}

pub struct FrameSynthesizer<E> {
    estimator: E,
    warp: ForwardWarp,
    options: SynthesisOptions,
    modes_logged: AtomicBool,
}

impl<E: FlowEstimator> FrameSynthesizer<E> {
    pub fn new(estimator: E, warp: ForwardWarp, options: SynthesisOptions) -> Result<Self> {
        if !(options.scale.is_finite() && options.scale > 0.0) {
            return Err(InterpolationError::InvalidConfig(format!(
                "scale {} must be > 0",
                options.scale
            ))
            .into());
        }
        Ok(Self {
            estimator,
            warp,
            options,
            modes_logged: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> SynthesisOptions {
        self.options
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn forward_warp(&self) -> &ForwardWarp {
        &self.warp
    }

    /// Requested modes the network cannot honour; synthesis proceeds without
    /// them. Logged on the first call only.
    pub fn unsupported_modes(&self) -> Vec<InterpolationWarning> {
        let capabilities = self.estimator.capabilities();
        let mut warnings = Vec::new();
        if self.options.ensemble && !capabilities.ensemble {
            warnings.push(InterpolationWarning::EnsembleUnsupported);
        }
        if !self.options.fast_mode && !capabilities.context_refinement {
            warnings.push(InterpolationWarning::ContextRefinementRemoved);
        }
        if !warnings.is_empty() && !self.modes_logged.swap(true, Ordering::Relaxed) {
            for warning in &warnings {
                warn!(%warning, "Unsupported interpolation mode requested");
            }
        }
        warnings
    }

    /// Frame at `timestep` between `a` (0) and `b` (1).
    pub fn synthesize(
        &self,
        a: ArrayView3<'_, f32>,
        b: ArrayView3<'_, f32>,
        timestep: &TimestepField,
    ) -> Result<Frame> {
        let started = Instant::now();
        let (_, h, w) = a.dim();
        let field = timestep.to_field(h, w)?;
        let estimate = self
            .estimator
            .estimate(a, b, field.view(), self.options.scale)?;

        let weight = sigmoid(estimate.mask.view());
        let weight = weight.view().insert_axis(Axis(0));
        let mut blended = Array3::<f32>::zeros(a.dim());
        Zip::from(&mut blended)
            .and(&estimate.warped0)
            .and(&estimate.warped1)
            .and_broadcast(&weight)
            .for_each(|out, &w0, &w1, &m| *out = w0 * m + w1 * (1.0 - m));

        debug!(
            height = h,
            width = w,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Synthesized frame"
        );
        Frame::new(blended)
    }

    /// Primary and secondary flows between `a` and `b`, derived from one
    /// estimate at the temporal midpoint.
    pub fn pair_flow(&self, a: ArrayView3<'_, f32>, b: ArrayView3<'_, f32>) -> Result<PairFlow> {
        let started = Instant::now();
        let (_, h, w) = a.dim();
        let midpoint = TimestepField::Uniform(0.5).to_field(h, w)?;
        let estimate = self
            .estimator
            .estimate(a, b, midpoint.view(), self.options.scale)?;
        let to_a = estimate.flow.toward_first();
        let to_b = estimate.flow.toward_second();

        let pair = PairFlow {
            primary_ab: self.splat_flow(to_b, to_a)? * 2.0,
            primary_ba: self.splat_flow(to_a, to_b)? * 2.0,
            secondary_ab: self.splat_flow(to_a, to_a)? * -2.0,
            secondary_ba: self.splat_flow(to_b, to_b)? * -2.0,
        };

        debug!(
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Computed pair flow"
        );
        Ok(pair)
    }

    fn splat_flow(&self, values: ArrayView3<'_, f32>, along: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        Ok(self.warp.warp_forward(values, along, SplatMode::Average)?.values)
    }
}
