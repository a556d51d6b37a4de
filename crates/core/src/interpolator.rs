//! Entry points: [`Interpolator`] for one triplet, [`SequenceInterpolator`]
//! for a frame stream at a multiplied frame rate.

use std::time::Instant;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::config::InterpolatorConfig;
use crate::error::{InterpolationError, InterpolationWarning};
use crate::network::{Capabilities, FlowEstimator, IfNet};
use crate::onnx::load_network;
use crate::sampling::{crop, pad_to_multiple};
use crate::scene::SceneDetector;
use crate::scheduler::{ReuseBundle, SceneChanges, TripletOutput, TripletScheduler};
use crate::splat::ForwardWarp;
use crate::synth::{FrameSynthesizer, SynthesisOptions};
use crate::types::{Frame, TimestampPlan};

/// Triplet interpolation on frames of any size. Anchors are mirror-padded to a
/// multiple of `pad_align` for the network and outputs cropped back, so
/// passthrough frames come back bit-identical.
pub struct Interpolator<E = IfNet> {
    scheduler: TripletScheduler<E>,
    pad_align: usize,
}

impl Interpolator<IfNet> {
    /// Load the ONNX flow network and splat kernel named by `config`.
    pub fn from_config(config: &InterpolatorConfig) -> Result<Self> {
        config.validate()?;
        let backend = config.model.backend();
        let trt_cache_dir = Some(config.model.trt_cache_dir.as_path());

        let network = load_network(
            &config.model.dir,
            &backend,
            trt_cache_dir,
            config.inference.scale_factors.clone(),
            Capabilities::default(),
        )?;
        let kernel_path = config.model.splat_kernel_path();
        let warp = ForwardWarp::detect(kernel_path.as_deref(), &backend, trt_cache_dir);
        info!(
            splat_backend = warp.backend_name(),
            scale = config.inference.scale,
            pad_align = config.inference.pad_align,
            "Interpolator ready"
        );

        Self::from_estimator(
            network,
            warp,
            config.inference.synthesis_options(),
            config.inference.pad_align,
        )
    }
}

impl<E: FlowEstimator> Interpolator<E> {
    pub fn from_estimator(
        estimator: E,
        warp: ForwardWarp,
        options: SynthesisOptions,
        pad_align: usize,
    ) -> Result<Self> {
        if pad_align == 0 {
            return Err(
                InterpolationError::InvalidConfig("pad_align must be at least 1".to_string()).into(),
            );
        }
        let synth = FrameSynthesizer::new(estimator, warp, options)?;
        Ok(Self {
            scheduler: TripletScheduler::new(synth),
            pad_align,
        })
    }

    pub fn scheduler(&self) -> &TripletScheduler<E> {
        &self.scheduler
    }

    pub fn pad_align(&self) -> usize {
        self.pad_align
    }

    /// Frames for `plan` around `anchors[1]`. The reuse bundle lives at the
    /// padded size and is only valid for this interpolator.
    pub fn interpolate(
        &self,
        anchors: [&Frame; 3],
        plan: &TimestampPlan,
        scenes: SceneChanges,
        reuse: Option<ReuseBundle>,
    ) -> Result<TripletOutput> {
        let (h, w) = anchors[1].dims();
        for anchor in [anchors[0], anchors[2]] {
            if anchor.dims() != (h, w) {
                return Err(InterpolationError::ShapeMismatch {
                    expected: (h, w),
                    found: anchor.dims(),
                }
                .into());
            }
        }

        let [i0, i1, i2] = anchors.map(|anchor| self.pad(anchor));
        let (i0, i1, i2) = (i0?, i1?, i2?);
        let output = self.scheduler.run(&i0, &i1, &i2, plan, scenes, reuse)?;

        let frames = output
            .frames
            .into_iter()
            .map(|frame| {
                if frame.dims() == (h, w) {
                    Ok(frame)
                } else {
                    Frame::new(crop(frame.view(), h, w))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TripletOutput {
            frames,
            reuse: output.reuse,
            warnings: output.warnings,
        })
    }

    /// `[I0, I0.5, I1, I1.5, I2]` from three frames.
    pub fn interpolate_midpoints(&self, frames: &[Frame]) -> Result<Vec<Frame>> {
        let [i0, i1, i2] = frames else {
            bail!("midpoint interpolation needs exactly 3 frames, got {}", frames.len());
        };
        let output = self.interpolate(
            [i0, i1, i2],
            &TimestampPlan::midpoints(),
            SceneChanges::default(),
            None,
        )?;
        Ok(output.frames)
    }

    fn pad(&self, frame: &Frame) -> Result<Frame> {
        let padded = pad_to_multiple(frame.view(), self.pad_align);
        if padded.dim() == frame.view().dim() {
            return Ok(frame.clone());
        }
        Frame::new(padded)
    }
}

/// Plan for the triplet centred on one source frame when every gap between
/// source frames receives `multiplier - 1` new frames.
///
/// Output time `j / multiplier` (in source-frame units) belongs to the nearest
/// source frame; a tie belongs to the earlier frame. `first` drops the minus
/// side and `last` the plus side.
pub fn plan_for_center(multiplier: usize, first: bool, last: bool) -> Result<TimestampPlan> {
    if multiplier < 2 {
        return Err(InterpolationError::InvalidConfig(format!(
            "multiplier must be >= 2, got {multiplier}"
        ))
        .into());
    }
    let m = multiplier as f32;
    let minus = if first {
        Vec::new()
    } else {
        (1..multiplier)
            .filter(|j| 2 * j > multiplier)
            .map(|j| j as f32 / m - 1.0)
            .collect()
    };
    let plus = if last {
        Vec::new()
    } else {
        (1..multiplier)
            .filter(|j| 2 * j <= multiplier)
            .map(|j| j as f32 / m)
            .collect()
    };
    TimestampPlan::new(minus, vec![0.0], plus)
}

/// Raises the frame rate of a stream by an integer multiplier.
///
/// Frames go in through [`push`](Self::push); output for a source frame is
/// released once its successor is known, and [`finish`](Self::finish) flushes
/// the last one. `n` inputs yield `(n - 1) * multiplier + 1` outputs.
pub struct SequenceInterpolator<E = IfNet> {
    interpolator: Interpolator<E>,
    detector: SceneDetector,
    multiplier: usize,
    previous: Option<Frame>,
    current: Option<Frame>,
    cut_before_current: bool,
    reuse: Option<ReuseBundle>,
    warnings: Vec<InterpolationWarning>,
    emitted: usize,
}

impl SequenceInterpolator<IfNet> {
    /// Network from `[model]`/`[inference]`, cut detection from `[scene]`.
    pub fn from_config(config: &InterpolatorConfig, multiplier: usize) -> Result<Self> {
        let detector = SceneDetector::from_config(&config.scene)?;
        Self::new(Interpolator::from_config(config)?, detector, multiplier)
    }
}

impl<E: FlowEstimator> SequenceInterpolator<E> {
    pub fn new(
        interpolator: Interpolator<E>,
        detector: SceneDetector,
        multiplier: usize,
    ) -> Result<Self> {
        plan_for_center(multiplier, false, false)?;
        Ok(Self {
            interpolator,
            detector,
            multiplier,
            previous: None,
            current: None,
            cut_before_current: false,
            reuse: None,
            warnings: Vec::new(),
            emitted: 0,
        })
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
    }

    /// Distinct warnings reported so far.
    pub fn warnings(&self) -> &[InterpolationWarning] {
        &self.warnings
    }

    pub fn push(&mut self, frame: Frame) -> Result<Vec<Frame>> {
        let Some(current) = self.current.take() else {
            self.current = Some(frame);
            return Ok(Vec::new());
        };

        let cut_after = self.detector.is_scene_change(&current, &frame);
        let result = self.emit(&current, Some(&frame), cut_after);
        self.previous = Some(current);
        self.current = Some(frame);
        self.cut_before_current = cut_after;
        result
    }

    /// Flush the last source frame and reset for a new stream.
    pub fn finish(&mut self) -> Result<Vec<Frame>> {
        let Some(current) = self.current.take() else {
            return Ok(Vec::new());
        };
        let result = self.emit(&current, None, true);

        info!(
            frames = self.emitted,
            multiplier = self.multiplier,
            "Sequence interpolation finished"
        );
        self.previous = None;
        self.cut_before_current = false;
        self.reuse = None;
        self.emitted = 0;
        result
    }

    fn emit(&mut self, current: &Frame, next: Option<&Frame>, cut_after: bool) -> Result<Vec<Frame>> {
        let started = Instant::now();
        let first = self.previous.is_none();
        let last = next.is_none();
        if first && last {
            self.emitted += 1;
            return Ok(vec![current.clone()]);
        }

        let previous = self.previous.as_ref().unwrap_or(current);
        let next = next.unwrap_or(current);
        let scenes = SceneChanges {
            left: first || self.cut_before_current,
            right: cut_after,
        };
        let plan = plan_for_center(self.multiplier, first, last)?;

        let output = self.interpolator.interpolate(
            [previous, current, next],
            &plan,
            scenes,
            self.reuse.take(),
        )?;
        self.reuse = Some(output.reuse);
        for warning in output.warnings {
            if !self.warnings.contains(&warning) {
                self.warnings.push(warning);
            }
        }

        self.emitted += output.frames.len();
        debug!(
            frames = output.frames.len(),
            left_scene = scenes.left,
            right_scene = scenes.right,
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Sequence step"
        );
        Ok(output.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_center_2x() {
        let plan = plan_for_center(2, false, false).unwrap();
        assert!(plan.minus().is_empty());
        assert_eq!(plan.zero(), &[0.0]);
        assert_eq!(plan.plus(), &[0.5]);
    }

    #[test]
    fn test_plan_for_center_3x() {
        let plan = plan_for_center(3, false, false).unwrap();
        assert_eq!(plan.minus().len(), 1);
        assert!((plan.minus()[0] + 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(plan.plus().len(), 1);
        assert!((plan.plus()[0] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_plan_for_center_4x_is_time_ordered() {
        let plan = plan_for_center(4, false, false).unwrap();
        assert_eq!(plan.minus(), &[-0.25]);
        assert_eq!(plan.plus(), &[0.25, 0.5]);
    }

    #[test]
    fn test_plan_for_center_edges() {
        let first = plan_for_center(4, true, false).unwrap();
        assert!(first.minus().is_empty());
        assert_eq!(first.plus(), &[0.25, 0.5]);

        let last = plan_for_center(4, false, true).unwrap();
        assert_eq!(last.minus(), &[-0.25]);
        assert!(last.plus().is_empty());
    }

    #[test]
    fn test_plan_shares_cover_every_output_once() {
        for m in 2..=8 {
            let inner = plan_for_center(m, false, false).unwrap();
            let first = plan_for_center(m, true, false).unwrap();
            let last = plan_for_center(m, false, true).unwrap();
            // Four source frames: first + two inner + last.
            assert_eq!(first.len() + 2 * inner.len() + last.len(), 3 * m + 1);
        }
    }

    #[test]
    fn test_plan_rejects_small_multiplier() {
        assert!(plan_for_center(1, false, false).is_err());
        assert!(plan_for_center(0, false, false).is_err());
    }
}
