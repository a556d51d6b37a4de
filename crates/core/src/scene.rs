use anyhow::Result;
use ndarray::Axis;

use crate::config::{SceneConfig, DEFAULT_SCENE_THRESHOLD};
use crate::error::InterpolationError;
use crate::types::Frame;

const DOWNSCALE_WIDTH: usize = 160;
const DOWNSCALE_HEIGHT: usize = 90;
const LUMA_WEIGHTS: [f64; 3] = [0.299, 0.587, 0.114];

/// Flags a cut between two frames when their mean luma differs by more than
/// `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneDetector {
    threshold: f32,
}

impl SceneDetector {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(InterpolationError::InvalidConfig(format!(
                "scene threshold must be in [0.0, 1.0], got {threshold}"
            ))
            .into());
        }
        Ok(Self { threshold })
    }

    pub fn from_config(config: &SceneConfig) -> Result<Self> {
        Self::new(config.threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_scene_change(&self, frame0: &Frame, frame1: &Frame) -> bool {
        let diff = (average_luma_downscaled(frame0) - average_luma_downscaled(frame1)).abs();
        diff > f64::from(self.threshold)
    }
}

impl Default for SceneDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SCENE_THRESHOLD,
        }
    }
}

/// Mean BT.601 luma after an area-average downscale to at most 160x90.
pub fn average_luma_downscaled(frame: &Frame) -> f64 {
    let (src_h, src_w) = frame.dims();
    let dst_w = DOWNSCALE_WIDTH.min(src_w);
    let dst_h = DOWNSCALE_HEIGHT.min(src_h);
    let pixels = frame.view();

    let mut total_luma = 0.0f64;
    for dst_y in 0..dst_h {
        let src_y0 = dst_y * src_h / dst_h;
        let src_y1 = ((dst_y + 1) * src_h / dst_h).min(src_h);

        for dst_x in 0..dst_w {
            let src_x0 = dst_x * src_w / dst_w;
            let src_x1 = ((dst_x + 1) * src_w / dst_w).min(src_w);
            let count = ((src_y1 - src_y0) * (src_x1 - src_x0)) as f64;
            if count == 0.0 {
                continue;
            }

            let luma: f64 = pixels
                .axis_iter(Axis(0))
                .zip(LUMA_WEIGHTS)
                .map(|(plane, weight)| {
                    let sum: f64 = plane
                        .slice(ndarray::s![src_y0..src_y1, src_x0..src_x1])
                        .iter()
                        .map(|v| f64::from(*v))
                        .sum();
                    weight * sum / count
                })
                .sum();
            total_luma += luma;
        }
    }

    total_luma / (dst_w * dst_h) as f64
}
