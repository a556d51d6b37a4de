//! Dense resampling primitives shared by the network wrapper, the DRM engine and
//! the synthesizer: bilinear resize, backward warping, alignment padding.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Source taps for one output coordinate: (lower index, upper index, upper weight).
type Tap = (usize, usize, f32);

/// Half-pixel-centre mapping (`align_corners = false`), negative sources clamp to 0.
fn axis_taps(input: usize, output: usize) -> Vec<Tap> {
    let ratio = input as f32 / output as f32;
    (0..output)
        .map(|o| {
            let src = ((o as f32 + 0.5) * ratio - 0.5).max(0.0);
            let lo = (src.floor() as usize).min(input - 1);
            let hi = (lo + 1).min(input - 1);
            (lo, hi, src - lo as f32)
        })
        .collect()
}

/// Bilinear resize of every channel to `(out_h, out_w)`.
pub fn resize_bilinear(input: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return input.to_owned();
    }

    let rows = axis_taps(in_h, out_h);
    let cols = axis_taps(in_w, out_w);
    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));

    for c in 0..channels {
        let plane = input.index_axis(Axis(0), c);
        for (oy, &(y0, y1, ly)) in rows.iter().enumerate() {
            for (ox, &(x0, x1, lx)) in cols.iter().enumerate() {
                let top = plane[[y0, x0]] * (1.0 - lx) + plane[[y0, x1]] * lx;
                let bottom = plane[[y1, x0]] * (1.0 - lx) + plane[[y1, x1]] * lx;
                out[[c, oy, ox]] = top * (1.0 - ly) + bottom * ly;
            }
        }
    }
    out
}

pub fn resize_bilinear_2d(input: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    resize_bilinear(input.insert_axis(Axis(0)), out_h, out_w).index_axis_move(Axis(0), 0)
}

/// Resize by a pyramid factor: `factor > 1` shrinks, output size is floored
/// and never below one pixel.
pub fn rescale_by(input: ArrayView3<'_, f32>, factor: f32) -> Array3<f32> {
    let (_, h, w) = input.dim();
    let out_h = ((h as f32 / factor).floor() as usize).max(1);
    let out_w = ((w as f32 / factor).floor() as usize).max(1);
    resize_bilinear(input, out_h, out_w)
}

/// Sample `image` at `(x + dx, y + dy)` with bilinear filtering and border
/// clamping. `flow` has 2 channels (dx, dy) and the image's spatial size.
pub fn backward_warp(image: ArrayView3<'_, f32>, flow: ArrayView3<'_, f32>) -> Array3<f32> {
    let (channels, h, w) = image.dim();
    debug_assert_eq!(flow.dim(), (2, h, w));

    let mut out = Array3::<f32>::zeros((channels, h, w));
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;

    for y in 0..h {
        for x in 0..w {
            let dx = flow[[0, y, x]];
            let dy = flow[[1, y, x]];
            let (dx, dy) = if dx.is_finite() && dy.is_finite() {
                (dx, dy)
            } else {
                (0.0, 0.0)
            };

            let sx = (x as f32 + dx).clamp(0.0, max_x);
            let sy = (y as f32 + dy).clamp(0.0, max_y);
            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let lx = sx - x0 as f32;
            let ly = sy - y0 as f32;

            for c in 0..channels {
                let top = image[[c, y0, x0]] * (1.0 - lx) + image[[c, y0, x1]] * lx;
                let bottom = image[[c, y1, x0]] * (1.0 - lx) + image[[c, y1, x1]] * lx;
                out[[c, y, x]] = top * (1.0 - ly) + bottom * ly;
            }
        }
    }
    out
}

pub fn sigmoid(logits: ArrayView2<'_, f32>) -> Array2<f32> {
    logits.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

pub fn pad_amount(dim: usize, align: usize) -> usize {
    (align - (dim % align)) % align
}

/// Mirror an out-of-range index back into `0..n` (edge sample repeated).
fn symmetric_index(i: usize, n: usize) -> usize {
    let period = 2 * n;
    let m = i % period;
    if m < n {
        m
    } else {
        period - 1 - m
    }
}

/// Extend the bottom and right edges with mirrored content so both spatial
/// dimensions become multiples of `align`.
pub fn pad_to_multiple(input: ArrayView3<'_, f32>, align: usize) -> Array3<f32> {
    let (channels, h, w) = input.dim();
    let new_h = h + pad_amount(h, align);
    let new_w = w + pad_amount(w, align);
    if (new_h, new_w) == (h, w) {
        return input.to_owned();
    }

    let mut padded = Array3::<f32>::zeros((channels, new_h, new_w));
    padded.slice_mut(s![.., ..h, ..w]).assign(&input);

    for y in 0..new_h {
        let src_y = symmetric_index(y, h);
        for x in 0..new_w {
            if y < h && x < w {
                continue;
            }
            let src_x = symmetric_index(x, w);
            for c in 0..channels {
                padded[[c, y, x]] = input[[c, src_y, src_x]];
            }
        }
    }
    padded
}

pub fn crop(input: ArrayView3<'_, f32>, height: usize, width: usize) -> Array3<f32> {
    input.slice(s![.., ..height, ..width]).to_owned()
}
