//! Flow network interface and the multi-scale recursive estimator built on it.
//!
//! The learned parts (feature encoder and refinement stages) are opaque
//! collaborators behind [`FeatureEncoder`] and [`RefinementStage`]; the ONNX
//! implementations live in [`crate::onnx`]. [`IfNet`] runs the coarse-to-fine
//! recursion: stage 0 sees the raw frames and no prior flow, every later stage
//! sees frames and features warped by the accumulated flow and returns a
//! delta that is added to it.

use std::time::Instant;

use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use tracing::debug;

use crate::error::InterpolationError;
use crate::sampling::backward_warp;
use crate::types::FlowField;

/// Reference pyramid, coarsest first.
pub const DEFAULT_SCALE_FACTORS: [f32; 5] = [16.0, 8.0, 4.0, 2.0, 1.0];

/// State carried from the previous refinement level.
pub struct StagePrior<'a> {
    pub flow: ArrayView3<'a, f32>,
    pub mask: ArrayView2<'a, f32>,
    pub features: ArrayView3<'a, f32>,
}

pub struct StageInput<'a> {
    pub image0: ArrayView3<'a, f32>,
    pub image1: ArrayView3<'a, f32>,
    pub features0: ArrayView3<'a, f32>,
    pub features1: ArrayView3<'a, f32>,
    pub timestep: ArrayView2<'a, f32>,
    pub prior: Option<StagePrior<'a>>,
}

/// Full-resolution output of one stage. For stage 0 `flow` is the flow
/// itself; for later stages it is a delta.
pub struct StageOutput {
    pub flow: Array3<f32>,
    pub mask: Array2<f32>,
    pub features: Array3<f32>,
}

pub trait FeatureEncoder: Send + Sync {
    fn encode(&self, image: ArrayView3<'_, f32>) -> Result<Array3<f32>>;
}

pub trait RefinementStage: Send + Sync {
    /// Run at `1 / scale` of the input resolution and return results at full
    /// resolution.
    fn refine(&self, input: &StageInput<'_>, scale: f32) -> Result<StageOutput>;
}

/// Optional behaviours an architecture generation may or may not ship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub ensemble: bool,
    pub context_refinement: bool,
}

pub struct FlowEstimate {
    pub flow: FlowField,
    /// Occlusion mask logits; blend weight of image0 after a sigmoid.
    pub mask: Array2<f32>,
    pub features: Array3<f32>,
    pub warped0: Array3<f32>,
    pub warped1: Array3<f32>,
}

pub trait FlowEstimator {
    fn estimate(
        &self,
        image0: ArrayView3<'_, f32>,
        image1: ArrayView3<'_, f32>,
        timestep: ArrayView2<'_, f32>,
        scale: f32,
    ) -> Result<FlowEstimate>;

    fn capabilities(&self) -> Capabilities;
}

pub struct IfNet {
    encoder: Box<dyn FeatureEncoder>,
    stages: Vec<Box<dyn RefinementStage>>,
    scale_factors: Vec<f32>,
    capabilities: Capabilities,
}

impl IfNet {
    pub fn new(
        encoder: Box<dyn FeatureEncoder>,
        stages: Vec<Box<dyn RefinementStage>>,
        scale_factors: Vec<f32>,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(InterpolationError::InvalidConfig(
                "flow network needs at least one refinement stage".to_string(),
            )
            .into());
        }
        if stages.len() != scale_factors.len() {
            return Err(InterpolationError::InvalidConfig(format!(
                "{} refinement stages but {} scale factors",
                stages.len(),
                scale_factors.len()
            ))
            .into());
        }
        if let Some(bad) = scale_factors.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(
                InterpolationError::InvalidConfig(format!("scale factor {bad} must be > 0")).into(),
            );
        }

        Ok(Self {
            encoder,
            stages,
            scale_factors,
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn levels(&self) -> usize {
        self.stages.len()
    }
}

impl FlowEstimator for IfNet {
    fn estimate(
        &self,
        image0: ArrayView3<'_, f32>,
        image1: ArrayView3<'_, f32>,
        timestep: ArrayView2<'_, f32>,
        scale: f32,
    ) -> Result<FlowEstimate> {
        let (_, h, w) = image0.dim();
        let (_, h1, w1) = image1.dim();
        for found in [(h1, w1), timestep.dim()] {
            if found != (h, w) {
                return Err(InterpolationError::ShapeMismatch {
                    expected: (h, w),
                    found,
                }
                .into());
            }
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(
                InterpolationError::InvalidConfig(format!("flow scale {scale} must be > 0")).into(),
            );
        }

        let features0 = self.encoder.encode(image0)?;
        let features1 = self.encoder.encode(image1)?;

        let mut flow: Option<Array3<f32>> = None;
        let mut mask = Array2::<f32>::zeros((h, w));
        let mut features = Array3::<f32>::zeros((0, h, w));
        let mut warped0 = image0.to_owned();
        let mut warped1 = image1.to_owned();

        for (level, (stage, factor)) in self.stages.iter().zip(&self.scale_factors).enumerate() {
            let stage_scale = factor / scale;
            let started = Instant::now();

            let output = match &flow {
                None => stage.refine(
                    &StageInput {
                        image0,
                        image1,
                        features0: features0.view(),
                        features1: features1.view(),
                        timestep,
                        prior: None,
                    },
                    stage_scale,
                )?,
                Some(current) => {
                    let wf0 = backward_warp(features0.view(), current.slice(s![0..2, .., ..]));
                    let wf1 = backward_warp(features1.view(), current.slice(s![2..4, .., ..]));
                    stage.refine(
                        &StageInput {
                            image0: warped0.view(),
                            image1: warped1.view(),
                            features0: wf0.view(),
                            features1: wf1.view(),
                            timestep,
                            prior: Some(StagePrior {
                                flow: current.view(),
                                mask: mask.view(),
                                features: features.view(),
                            }),
                        },
                        stage_scale,
                    )?
                }
            };
            check_stage_output(&output, level, h, w)?;

            let next = match flow.take() {
                None => output.flow,
                Some(current) => current + &output.flow,
            };
            mask = output.mask;
            features = output.features;

            warped0 = backward_warp(image0, next.slice(s![0..2, .., ..]));
            warped1 = backward_warp(image1, next.slice(s![2..4, .., ..]));
            flow = Some(next);

            debug!(
                level,
                stage_scale,
                stage_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
                "Flow refinement level"
            );
        }

        let flow = flow.ok_or_else(|| {
            InterpolationError::InvalidConfig("flow network ran no stages".to_string())
        })?;

        Ok(FlowEstimate {
            flow: FlowField::new(flow)?,
            mask,
            features,
            warped0,
            warped1,
        })
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

fn check_stage_output(output: &StageOutput, level: usize, h: usize, w: usize) -> Result<()> {
    let (flow_c, flow_h, flow_w) = output.flow.dim();
    if flow_c != FlowField::CHANNELS || (flow_h, flow_w) != (h, w) {
        return Err(InterpolationError::Inference(format!(
            "stage {level} returned flow of shape {:?}, expected (4, {h}, {w})",
            output.flow.dim()
        ))
        .into());
    }
    if output.mask.dim() != (h, w) {
        return Err(InterpolationError::Inference(format!(
            "stage {level} returned mask of shape {:?}, expected ({h}, {w})",
            output.mask.dim()
        ))
        .into());
    }
    Ok(())
}
