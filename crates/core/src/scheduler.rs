//! The triplet forward pass: frames around I1 from anchors (I0, I1, I2).
//!
//! Each requested timestamp is routed to one of three outcomes:
//! - anchor passthrough (`-1` → I0, `0` → I1, `1` → I2), returned verbatim
//! - synthesis between I1 and its neighbour, driven by a per-pixel timestep
//!   of `|t| * 2 * drm`
//! - demotion to an I1 passthrough when a scene cut separates I1 from the
//!   neighbour
//!
//! Pair flow for I1→I2 is handed back as a [`ReuseBundle`] so the next
//! triplet (I1, I2, I3) does not estimate it again.

use std::time::Instant;

use anyhow::Result;
use tracing::debug;

use crate::drm::{DistanceRatioEngine, DrmInputs, Side};
use crate::error::{InterpolationError, InterpolationWarning};
use crate::network::FlowEstimator;
use crate::synth::FrameSynthesizer;
use crate::types::{Frame, PairFlow, TimestampPlan, TimestepField};

/// Right-side pair flow of one triplet, already reversed into the left-side
/// pair of the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct ReuseBundle(PairFlow);

impl ReuseBundle {
    pub fn pair_flow(&self) -> &PairFlow {
        &self.0
    }

    pub fn dims(&self) -> (usize, usize) {
        self.0.dims()
    }

    pub fn into_inner(self) -> PairFlow {
        self.0
    }
}

/// Scene cuts on either side of I1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SceneChanges {
    /// Between I0 and I1.
    pub left: bool,
    /// Between I1 and I2.
    pub right: bool,
}

#[derive(Debug)]
pub struct TripletOutput {
    /// `minus`, then `zero`, then `plus` frames.
    pub frames: Vec<Frame>,
    pub reuse: ReuseBundle,
    pub warnings: Vec<InterpolationWarning>,
}

/// A plan after scene cuts were applied.
#[derive(Debug, Clone, PartialEq)]
struct Routing {
    minus: Vec<f32>,
    zero: usize,
    plus: Vec<f32>,
    constant_drm: bool,
}

impl Routing {
    fn new(plan: &TimestampPlan, scenes: SceneChanges) -> Self {
        let mut minus = plan.minus().to_vec();
        let mut plus = plan.plus().to_vec();
        let mut zero = plan.zero().len();
        if scenes.left {
            zero += minus.len();
            minus.clear();
        }
        if scenes.right {
            zero += plus.len();
            plus.clear();
        }
        Self {
            minus,
            zero,
            plus,
            constant_drm: scenes.left != scenes.right,
        }
    }

    fn needs_drm(&self) -> bool {
        !self.constant_drm
            && (self.minus.iter().any(|t| *t != -1.0) || self.plus.iter().any(|t| *t != 1.0))
    }
}

pub struct TripletScheduler<E> {
    synth: FrameSynthesizer<E>,
    drm: DistanceRatioEngine,
}

impl<E: FlowEstimator> TripletScheduler<E> {
    pub fn new(synth: FrameSynthesizer<E>) -> Self {
        let drm = DistanceRatioEngine::new(synth.forward_warp().clone());
        Self { synth, drm }
    }

    pub fn synthesizer(&self) -> &FrameSynthesizer<E> {
        &self.synth
    }

    pub fn run(
        &self,
        i0: &Frame,
        i1: &Frame,
        i2: &Frame,
        plan: &TimestampPlan,
        scenes: SceneChanges,
        reuse: Option<ReuseBundle>,
    ) -> Result<TripletOutput> {
        let started = Instant::now();
        let dims = i1.dims();
        let reuse_dims = reuse.as_ref().map(ReuseBundle::dims);
        for found in [Some(i0.dims()), Some(i2.dims()), reuse_dims].into_iter().flatten() {
            if found != dims {
                return Err(InterpolationError::ShapeMismatch {
                    expected: dims,
                    found,
                }
                .into());
            }
        }

        let warnings = self.synth.unsupported_modes();
        let routing = Routing::new(plan, scenes);

        let right = self.synth.pair_flow(i1.view(), i2.view())?;
        let left = if routing.needs_drm() {
            Some(match reuse {
                Some(bundle) => bundle.into_inner(),
                None => self.synth.pair_flow(i1.view(), i0.view())?,
            })
        } else {
            None
        };
        let inputs = match &left {
            Some(left) => Some(DrmInputs::new(left, &right)?),
            None => None,
        };

        let mut frames = Vec::with_capacity(routing.minus.len() + routing.zero + routing.plus.len());
        for &t in &routing.minus {
            let t = -t;
            if t == 1.0 {
                frames.push(i0.clone());
                continue;
            }
            let timestep = self.timestep(inputs.as_ref(), Side::Left, t, dims)?;
            frames.push(self.synth.synthesize(i1.view(), i0.view(), &timestep)?);
        }
        frames.extend((0..routing.zero).map(|_| i1.clone()));
        for &t in &routing.plus {
            if t == 1.0 {
                frames.push(i2.clone());
                continue;
            }
            let timestep = self.timestep(inputs.as_ref(), Side::Right, t, dims)?;
            frames.push(self.synth.synthesize(i1.view(), i2.view(), &timestep)?);
        }

        debug!(
            frames = frames.len(),
            left_scene = scenes.left,
            right_scene = scenes.right,
            constant_drm = routing.constant_drm,
            reused = left.is_some() && reuse_dims.is_some(),
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Triplet interpolated"
        );

        Ok(TripletOutput {
            frames,
            reuse: ReuseBundle(right.reversed()),
            warnings,
        })
    }

    /// `t * 2 * drm`; with no DRM inputs the ratio is a constant 0.5.
    fn timestep(
        &self,
        inputs: Option<&DrmInputs<'_>>,
        side: Side,
        t: f32,
        target: (usize, usize),
    ) -> Result<TimestepField> {
        Ok(match inputs {
            Some(inputs) => {
                let drm = self.drm.reliable_side(inputs, side, t, target)?;
                TimestepField::PerPixel(drm * (2.0 * t))
            }
            None => TimestepField::Uniform(t),
        })
    }
}
