//! Distance ratio maps (DRM).
//!
//! A DRM weighs, per pixel, how far I1's correspondence into one neighbour is
//! relative to the other: `d10 / (d10 + d12)`. The raw maps live on I1's grid;
//! [`DistanceRatioEngine::reliable_side`] re-aligns them to an intermediate
//! time by splatting, using the secondary (self-warped) flow to fill occlusion
//! holes the primary estimate leaves behind.

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};

use crate::error::InterpolationError;
use crate::sampling::resize_bilinear_2d;
use crate::splat::{ForwardWarp, COVERAGE_THRESHOLD};
use crate::types::PairFlow;

/// Floor added to every flow magnitude.
pub const DISTANCE_EPSILON: f32 = 1e-4;

/// Per-pixel Euclidean norm of a (2, H, W) flow, plus [`DISTANCE_EPSILON`].
pub fn distance(flow: ArrayView3<'_, f32>) -> Array2<f32> {
    let u = flow.index_axis(Axis(0), 0);
    let v = flow.index_axis(Axis(0), 1);
    Zip::from(&u)
        .and(&v)
        .map_collect(|u, v| (u * u + v * v).sqrt() + DISTANCE_EPSILON)
}

/// `(da / (da + db), db / (da + db))` for two flows on the same grid.
pub fn compute_drm(
    flow_a: ArrayView3<'_, f32>,
    flow_b: ArrayView3<'_, f32>,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let (_, ha, wa) = flow_a.dim();
    let (_, hb, wb) = flow_b.dim();
    if (ha, wa) != (hb, wb) {
        return Err(InterpolationError::ShapeMismatch {
            expected: (ha, wa),
            found: (hb, wb),
        }
        .into());
    }

    let da = distance(flow_a);
    let db = distance(flow_b);
    let total = &da + &db;
    Ok((da / &total, db / &total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Between I0 and I1.
    Left,
    /// Between I1 and I2.
    Right,
}

struct RatioSource<'a> {
    flow: ArrayView3<'a, f32>,
    drm: Array2<f32>,
}

/// Raw DRMs of both sides for both flow estimates, on I1's grid.
pub struct DrmInputs<'a> {
    left_primary: RatioSource<'a>,
    left_secondary: RatioSource<'a>,
    right_primary: RatioSource<'a>,
    right_secondary: RatioSource<'a>,
}

impl<'a> DrmInputs<'a> {
    /// `left` is the I1→I0 pair flow, `right` the I1→I2 pair flow.
    pub fn new(left: &'a PairFlow, right: &'a PairFlow) -> Result<Self> {
        let (drm10_p, drm12_p) = compute_drm(left.primary_ab.view(), right.primary_ab.view())?;
        let (drm10_s, drm12_s) =
            compute_drm(left.secondary_ab.view(), right.secondary_ab.view())?;

        Ok(Self {
            left_primary: RatioSource {
                flow: left.primary_ab.view(),
                drm: drm10_p,
            },
            left_secondary: RatioSource {
                flow: left.secondary_ab.view(),
                drm: drm10_s,
            },
            right_primary: RatioSource {
                flow: right.primary_ab.view(),
                drm: drm12_p,
            },
            right_secondary: RatioSource {
                flow: right.secondary_ab.view(),
                drm: drm12_s,
            },
        })
    }

    fn side(&self, side: Side) -> (&RatioSource<'a>, &RatioSource<'a>) {
        match side {
            Side::Left => (&self.left_primary, &self.left_secondary),
            Side::Right => (&self.right_primary, &self.right_secondary),
        }
    }

    /// Primary raw ratio of one side (`drm10` or `drm12`).
    pub fn raw(&self, side: Side) -> &Array2<f32> {
        &self.side(side).0.drm
    }
}

pub struct DistanceRatioEngine {
    warp: ForwardWarp,
}

impl DistanceRatioEngine {
    pub fn new(warp: ForwardWarp) -> Self {
        Self { warp }
    }

    pub fn forward_warp(&self) -> &ForwardWarp {
        &self.warp
    }

    /// DRM of one side aligned to time `t` (magnitude in (0, 1)), resampled to
    /// `target` (H, W).
    pub fn reliable_side(
        &self,
        inputs: &DrmInputs<'_>,
        side: Side,
        t: f32,
        target: (usize, usize),
    ) -> Result<Array2<f32>> {
        let (primary, secondary) = inputs.side(side);
        let (mut aligned, primary_coverage) = self.align(primary, t)?;
        let (fallback, secondary_coverage) = self.align(secondary, t)?;

        Zip::from(&mut aligned)
            .and(&primary_coverage)
            .and(&fallback)
            .and(&secondary_coverage)
            .and(&primary.drm)
            .for_each(|value, &covered_p, &fallback, &covered_s, &raw| {
                if covered_p < COVERAGE_THRESHOLD {
                    *value = if covered_s >= COVERAGE_THRESHOLD {
                        fallback
                    } else {
                        1.0 - raw
                    };
                }
            });

        Ok(resize_bilinear_2d(aligned.view(), target.0, target.1))
    }

    /// Both sides at the same `t`: `(drm01_at_t, drm21_at_t)`.
    pub fn compute_reliable_drm(
        &self,
        inputs: &DrmInputs<'_>,
        t: f32,
        target: (usize, usize),
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        Ok((
            self.reliable_side(inputs, Side::Left, t, target)?,
            self.reliable_side(inputs, Side::Right, t, target)?,
        ))
    }

    /// Splat `1 - drm` along `flow * (1 - drm) * 2t`; returns values and coverage.
    fn align(&self, source: &RatioSource<'_>, t: f32) -> Result<(Array2<f32>, Array2<f32>)> {
        let reversed = source.drm.mapv(|d| 1.0 - d);
        let step = reversed.mapv(|r| r * 2.0 * t);
        let scaled: Array3<f32> = &source.flow * &step.view().insert_axis(Axis(0));
        self.warp.warp_map(reversed.view(), scaled.view())
    }
}

impl Default for DistanceRatioEngine {
    fn default() -> Self {
        Self::new(ForwardWarp::portable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn flow_from_fn(h: usize, w: usize, f: impl Fn(usize, usize, usize) -> f32) -> Array3<f32> {
        Array3::from_shape_fn((2, h, w), |(c, y, x)| f(c, y, x))
    }

    fn uniform_flow(h: usize, w: usize, dx: f32, dy: f32) -> Array3<f32> {
        let mut flow = Array3::<f32>::zeros((2, h, w));
        flow.slice_mut(s![0, .., ..]).fill(dx);
        flow.slice_mut(s![1, .., ..]).fill(dy);
        flow
    }

    fn pair(ab: Array3<f32>) -> PairFlow {
        PairFlow {
            primary_ba: -&ab,
            secondary_ba: -&ab,
            secondary_ab: ab.clone(),
            primary_ab: ab,
        }
    }

    #[test]
    fn test_distance_epsilon_floor() {
        let flow = flow_from_fn(4, 4, |c, y, x| {
            if (x + y) % 2 == 0 {
                0.0
            } else {
                (c as f32 - 0.5) * (x as f32)
            }
        });
        let d = distance(flow.view());
        assert!(d.iter().all(|v| *v >= DISTANCE_EPSILON));
        assert_eq!(d[[0, 0]], DISTANCE_EPSILON);
    }

    #[test]
    fn test_distance_is_euclidean() {
        let flow = uniform_flow(1, 1, 3.0, 4.0);
        assert!((distance(flow.view())[[0, 0]] - 5.0001).abs() < 1e-5);
    }

    #[test]
    fn test_drm_pairs_sum_to_one() {
        let a = flow_from_fn(5, 6, |c, y, x| ((c + y * 3 + x) as f32).sin() * 4.0);
        let b = flow_from_fn(5, 6, |c, y, x| ((c * 2 + y + x * 5) as f32).cos() * 2.0);
        let (da, db) = compute_drm(a.view(), b.view()).unwrap();
        for (x, y) in da.iter().zip(db.iter()) {
            assert!((x + y - 1.0).abs() < 1e-6);
            assert!((0.0..=1.0).contains(x));
        }
    }

    #[test]
    fn test_drm_zero_flows_split_evenly() {
        let zero = Array3::<f32>::zeros((2, 2, 2));
        let (da, db) = compute_drm(zero.view(), zero.view()).unwrap();
        assert!(da.iter().chain(db.iter()).all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_drm_rejects_mismatched_grids() {
        let a = Array3::<f32>::zeros((2, 2, 2));
        let b = Array3::<f32>::zeros((2, 3, 2));
        assert!(compute_drm(a.view(), b.view()).is_err());
    }

    #[test]
    fn test_static_scene_reliable_drm_is_half() {
        let left = pair(Array3::zeros((2, 6, 6)));
        let right = pair(Array3::zeros((2, 6, 6)));
        let inputs = DrmInputs::new(&left, &right).unwrap();
        let engine = DistanceRatioEngine::default();
        let (l, r) = engine.compute_reliable_drm(&inputs, 0.5, (6, 6)).unwrap();
        assert!(l.iter().chain(r.iter()).all(|v| (v - 0.5).abs() < 1e-5));
    }

    #[test]
    fn test_holes_fall_back_to_secondary_then_default() {
        let (h, w) = (2, 4);
        // drm10 is 0.25 in column 0 and 0.5 elsewhere, so column 0 travels
        // 1.5 px and the others 1 px: nothing lands in column 0.
        let mut left = pair(uniform_flow(h, w, 2.0, 0.0));
        let mut right = pair(flow_from_fn(h, w, |c, _, x| match (c, x) {
            (0, 0) => 6.0,
            (0, _) => 2.0,
            _ => 0.0,
        }));
        // Secondary is static in row 0 (covers column 0 with 1 - drm10_s ~ 1)
        // and moves like the primary in row 1 (leaves column 0 empty again).
        left.secondary_ab = flow_from_fn(h, w, |c, y, _| if c == 0 && y == 1 { 2.0 } else { 0.0 });
        right.secondary_ab = uniform_flow(h, w, 2.0, 0.0);

        let inputs = DrmInputs::new(&left, &right).unwrap();
        assert!((inputs.raw(Side::Left)[[1, 0]] - 0.25).abs() < 1e-4);

        let aligned = DistanceRatioEngine::default()
            .reliable_side(&inputs, Side::Left, 0.5, (h, w))
            .unwrap();

        // Secondary fill.
        assert!(aligned[[0, 0]] > 0.999);
        // Default fill: 1 - drm10 at the hole.
        assert!((aligned[[1, 0]] - 0.75).abs() < 1e-3);
        for y in 0..h {
            // Primary: column 0's 0.75 split over columns 1 and 2, the rest
            // carrying 0.5 one column right.
            assert!((aligned[[y, 1]] - 0.75).abs() < 1e-3);
            assert!((aligned[[y, 2]] - 0.875 / 1.5).abs() < 1e-3);
            assert!((aligned[[y, 3]] - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn test_reliable_drm_fills_hole_from_secondary_value() {
        let h = 3;
        let w = 4;
        // drm10_p differs from drm10_s so the source of each pixel is visible.
        let mut left = pair(uniform_flow(h, w, 2.0, 0.0));
        left.secondary_ab = uniform_flow(h, w, 0.0, 0.0);
        let mut right = pair(uniform_flow(h, w, 2.0, 0.0));
        right.secondary_ab = uniform_flow(h, w, 6.0, 0.0);

        let inputs = DrmInputs::new(&left, &right).unwrap();
        let engine = DistanceRatioEngine::default();
        let aligned = engine
            .reliable_side(&inputs, Side::Left, 0.5, (h, w))
            .unwrap();

        // Primary: drm10 = 0.5, shift = 2 * 0.5 * 2 * 0.5 = 1 → column 0 is a hole.
        // Secondary: zero flow covers everything with 1 - drm10_s ≈ 1.
        for y in 0..h {
            assert!(aligned[[y, 0]] > 0.99);
            for x in 1..w {
                assert!((aligned[[y, x]] - 0.5).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_reliable_side_resamples_to_target() {
        let left = pair(Array3::zeros((2, 4, 4)));
        let right = pair(Array3::zeros((2, 4, 4)));
        let inputs = DrmInputs::new(&left, &right).unwrap();
        let out = DistanceRatioEngine::default()
            .reliable_side(&inputs, Side::Right, 0.25, (8, 8))
            .unwrap();
        assert_eq!(out.dim(), (8, 8));
    }
}
