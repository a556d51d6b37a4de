#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use drba_core::network::{
    FeatureEncoder, IfNet, RefinementStage, StageInput, StageOutput, DEFAULT_SCALE_FACTORS,
};
use drba_core::splat::ForwardWarp;
use drba_core::synth::SynthesisOptions;
use drba_core::{Frame, Interpolator};
use ndarray::{Array2, Array3, ArrayView3};

pub const SHIFT_SEARCH: i32 = 3;

struct ZeroEncoder;

impl FeatureEncoder for ZeroEncoder {
    fn encode(&self, image: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (_, h, w) = image.dim();
        Ok(Array3::zeros((1, h, w)))
    }
}

/// Coarsest level finds the global horizontal shift between the two images and
/// emits the matching linear-motion flow at every pixel's timestep; finer
/// levels keep the prior unchanged.
struct TranslationStage {
    estimates: Arc<AtomicUsize>,
}

impl RefinementStage for TranslationStage {
    fn refine(&self, input: &StageInput<'_>, _scale: f32) -> Result<StageOutput> {
        let (_, h, w) = input.image0.dim();
        if let Some(prior) = &input.prior {
            return Ok(StageOutput {
                flow: Array3::zeros((4, h, w)),
                mask: prior.mask.to_owned(),
                features: prior.features.to_owned(),
            });
        }

        self.estimates.fetch_add(1, Ordering::SeqCst);
        let d = global_shift(input.image0, input.image1) as f32;
        let mut flow = Array3::<f32>::zeros((4, h, w));
        for ((y, x), &t) in input.timestep.indexed_iter() {
            flow[[0, y, x]] = -t * d;
            flow[[2, y, x]] = (1.0 - t) * d;
        }
        Ok(StageOutput {
            flow,
            mask: input.timestep.mapv(|t| 12.0 * (1.0 - 2.0 * t)),
            features: Array3::zeros((1, h, w)),
        })
    }
}

/// Integer `d` minimising the mean absolute difference between `b(x)` and
/// `a(x - d)`.
fn global_shift(a: ArrayView3<'_, f32>, b: ArrayView3<'_, f32>) -> i32 {
    let (channels, h, w) = a.dim();
    let mut best = (f32::INFINITY, 0);
    for d in [0, 1, -1, 2, -2, 3, -3] {
        let mut total = 0.0f32;
        let mut count = 0usize;
        for c in 0..channels {
            for y in 0..h {
                for x in 0..w {
                    let src = x as i32 - d;
                    if src < 0 || src >= w as i32 {
                        continue;
                    }
                    total += (b[[c, y, x]] - a[[c, y, src as usize]]).abs();
                    count += 1;
                }
            }
        }
        let mean = total / count.max(1) as f32;
        if mean < best.0 {
            best = (mean, d);
        }
    }
    best.1
}

/// Network double plus a counter of full flow estimates.
pub fn translation_net() -> (IfNet, Arc<AtomicUsize>) {
    let estimates = Arc::new(AtomicUsize::new(0));
    let stages: Vec<Box<dyn RefinementStage>> = DEFAULT_SCALE_FACTORS
        .iter()
        .map(|_| {
            Box::new(TranslationStage {
                estimates: estimates.clone(),
            }) as Box<dyn RefinementStage>
        })
        .collect();
    let net = IfNet::new(Box::new(ZeroEncoder), stages, DEFAULT_SCALE_FACTORS.to_vec())
        .expect("valid network");
    (net, estimates)
}

pub fn interpolator(pad_align: usize) -> (Interpolator, Arc<AtomicUsize>) {
    interpolator_with(pad_align, SynthesisOptions::default())
}

pub fn interpolator_with(
    pad_align: usize,
    options: SynthesisOptions,
) -> (Interpolator, Arc<AtomicUsize>) {
    let (net, estimates) = translation_net();
    let interpolator = Interpolator::from_estimator(net, ForwardWarp::portable(), options, pad_align)
        .expect("valid interpolator");
    (interpolator, estimates)
}

pub fn pattern(x: f32, y: f32, c: usize) -> f32 {
    0.5 + 0.25 * (0.45 * x + 0.3 * y + 1.3 * c as f32).sin() + 0.1 * (0.23 * x - 0.17 * y).cos()
}

/// Frame `k` of a clip panning right by `shift` pixels per frame.
pub fn panning_frame(k: usize, h: usize, w: usize, shift: f32) -> Frame {
    let offset = k as f32 * shift;
    Frame::new(Array3::from_shape_fn((3, h, w), |(c, y, x)| {
        pattern(x as f32 - offset, y as f32, c)
    }))
    .expect("valid frame")
}

pub fn solid_frame(h: usize, w: usize, value: f32) -> Frame {
    Frame::new(Array3::from_elem((3, h, w), value)).expect("valid frame")
}

pub fn estimates(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn reset(counter: &Arc<AtomicUsize>) {
    counter.store(0, Ordering::SeqCst);
}

pub fn max_abs_diff(a: ArrayView3<'_, f32>, b: ArrayView3<'_, f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

pub fn uniform_map(h: usize, w: usize, value: f32) -> Array2<f32> {
    Array2::from_elem((h, w), value)
}
