use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::{HalfBitsSliceExt, HalfFloatSliceExt};
use ndarray::{s, Array2, Array3, ArrayView3};

use crate::error::{InterpolationError, TimestampList};

/// RGB image tensor, shape (3, H, W), values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array3<f32>,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(pixels: Array3<f32>) -> Result<Self> {
        let (c, h, w) = pixels.dim();
        if c != Self::CHANNELS {
            return Err(InterpolationError::ChannelMismatch {
                expected: Self::CHANNELS,
                found: c,
            }
            .into());
        }
        if h == 0 || w == 0 {
            bail!("frame must have a non-empty spatial size, got {h}x{w}");
        }
        Ok(Self { pixels })
    }

    /// Build from packed 8-bit RGB (row-major, 3 bytes per pixel).
    pub fn from_rgb8(data: &[u8], width: u32, height: u32) -> Result<Self> {
        let h = height as usize;
        let w = width as usize;
        let expected = h * w * 3;
        if data.len() != expected {
            bail!(
                "Data length mismatch: expected {} ({}x{}x3), got {}",
                expected,
                h,
                w,
                data.len()
            );
        }

        let mut pixels = Array3::<f32>::zeros((3, h, w));
        for (i, px) in data.chunks_exact(3).enumerate() {
            let (y, x) = (i / w, i % w);
            pixels[[0, y, x]] = px[0] as f32 / 255.0;
            pixels[[1, y, x]] = px[1] as f32 / 255.0;
            pixels[[2, y, x]] = px[2] as f32 / 255.0;
        }
        Self::new(pixels)
    }

    /// Build from planar FP16 data stored as raw `u16` bits, already in [0, 1].
    pub fn from_nchw_f16(data: &[u16], height: usize, width: usize) -> Result<Self> {
        let expected = 3 * height * width;
        if data.len() != expected {
            bail!(
                "NchwF16 data length mismatch: expected {expected} (3×{height}×{width}), got {}",
                data.len()
            );
        }

        let halves: &[f16] = data.reinterpret_cast();
        let mut f32_data = vec![0.0f32; data.len()];
        halves.convert_to_f32_slice(&mut f32_data);

        let pixels = Array3::from_shape_vec((3, height, width), f32_data)
            .context("failed to reshape NchwF16 data to [3,H,W]")?;
        Self::new(pixels)
    }

    /// Pack into 8-bit RGB with round-to-nearest and clamping.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let (_, h, w) = self.pixels.dim();
        let mut rgb = vec![0u8; h * w * 3];
        for y in 0..h {
            for x in 0..w {
                let dst = (y * w + x) * 3;
                for c in 0..3 {
                    rgb[dst + c] = (self.pixels[[c, y, x]] * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
                }
            }
        }
        rgb
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().2
    }

    /// Spatial size as (height, width).
    pub fn dims(&self) -> (usize, usize) {
        (self.height(), self.width())
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.pixels
    }
}

/// Bidirectional flow, shape (4, H, W): channels 0..2 point toward the first
/// image, channels 2..4 toward the second.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    data: Array3<f32>,
}

impl FlowField {
    pub const CHANNELS: usize = 4;

    pub fn new(data: Array3<f32>) -> Result<Self> {
        let channels = data.dim().0;
        if channels != Self::CHANNELS {
            return Err(InterpolationError::ChannelMismatch {
                expected: Self::CHANNELS,
                found: channels,
            }
            .into());
        }
        Ok(Self { data })
    }

    pub fn toward_first(&self) -> ArrayView3<'_, f32> {
        self.data.slice(s![0..2, .., ..])
    }

    pub fn toward_second(&self) -> ArrayView3<'_, f32> {
        self.data.slice(s![2..4, .., ..])
    }

    pub fn dims(&self) -> (usize, usize) {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.data
    }
}

/// Primary and secondary flow between two anchors `a` and `b`, in both
/// directions. Every field is (2, H, W) in the coordinates of its source
/// anchor (`*_ab` lives on `a`'s grid and points toward `b`).
#[derive(Debug, Clone, PartialEq)]
pub struct PairFlow {
    pub primary_ab: Array3<f32>,
    pub primary_ba: Array3<f32>,
    pub secondary_ab: Array3<f32>,
    pub secondary_ba: Array3<f32>,
}

impl PairFlow {
    /// The same flows seen from `b` toward `a`.
    pub fn reversed(self) -> Self {
        Self {
            primary_ab: self.primary_ba,
            primary_ba: self.primary_ab,
            secondary_ab: self.secondary_ba,
            secondary_ba: self.secondary_ab,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        let (_, h, w) = self.primary_ab.dim();
        (h, w)
    }
}

/// Interpolation fraction handed to the synthesizer: either one value for the
/// whole frame or a per-pixel map (DRM-driven).
#[derive(Debug, Clone, PartialEq)]
pub enum TimestepField {
    Uniform(f32),
    PerPixel(Array2<f32>),
}

impl TimestepField {
    pub fn to_field(&self, height: usize, width: usize) -> Result<Array2<f32>> {
        match self {
            Self::Uniform(t) => Ok(Array2::from_elem((height, width), *t)),
            Self::PerPixel(field) => {
                if field.dim() != (height, width) {
                    return Err(InterpolationError::ShapeMismatch {
                        expected: (height, width),
                        found: field.dim(),
                    }
                    .into());
                }
                Ok(field.clone())
            }
        }
    }
}

/// Requested output positions relative to I1, validated at construction.
///
/// - `minus`: values in [-1, 0); -1 reproduces I0
/// - `zero`: every value is exactly 0 and reproduces I1
/// - `plus`: values in (0, 1]; 1 reproduces I2
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimestampPlan {
    minus: Vec<f32>,
    zero: Vec<f32>,
    plus: Vec<f32>,
}

impl TimestampPlan {
    pub fn new(minus: Vec<f32>, zero: Vec<f32>, plus: Vec<f32>) -> Result<Self> {
        for &value in &minus {
            if !(value.is_finite() && (-1.0..0.0).contains(&value)) {
                return Err(InterpolationError::InvalidTimestamp {
                    list: TimestampList::Minus,
                    value,
                }
                .into());
            }
        }
        for &value in &zero {
            if value != 0.0 {
                return Err(InterpolationError::InvalidTimestamp {
                    list: TimestampList::Zero,
                    value,
                }
                .into());
            }
        }
        for &value in &plus {
            if !(value.is_finite() && value > 0.0 && value <= 1.0) {
                return Err(InterpolationError::InvalidTimestamp {
                    list: TimestampList::Plus,
                    value,
                }
                .into());
            }
        }

        Ok(Self { minus, zero, plus })
    }

    /// `[-1, -0.5]`, `[0]`, `[0.5, 1]`: the five-frame midpoint sequence.
    pub fn midpoints() -> Self {
        Self {
            minus: vec![-1.0, -0.5],
            zero: vec![0.0],
            plus: vec![0.5, 1.0],
        }
    }

    pub fn minus(&self) -> &[f32] {
        &self.minus
    }

    pub fn zero(&self) -> &[f32] {
        &self.zero
    }

    pub fn plus(&self) -> &[f32] {
        &self.plus
    }

    /// Number of frames the plan produces.
    pub fn len(&self) -> usize {
        self.minus.len() + self.zero.len() + self.plus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
