//! The handful of kernels the VGG feature stack needs, forwards and backwards.

use crate::FeatureMap;

/// Upper bound on the number of floats in one band's im2col buffer. A band
/// is always at least one row, so very wide inputs may exceed this.
const COLUMN_BUDGET: usize = 1 << 20;

/// 3x3 convolution with stride 1 and zero "same" padding.
///
/// `kernel` is a row-major `out_channels x (3 * 3 * in_channels)` matrix whose
/// columns are ordered `[ky][kx][in]`, matching the im2col layout. The output
/// is split into bands of rows that are computed independently, so the result
/// does not depend on `threads`.
pub(crate) fn conv3x3(
    input: &FeatureMap,
    kernel: &[f32],
    bias: Option<&[f32]>,
    out_channels: usize,
    threads: usize,
) -> FeatureMap {
    let (height, width) = (input.height(), input.width());
    let k = 9 * input.channels();
    debug_assert_eq!(kernel.len(), out_channels * k);

    let mut out = FeatureMap::zeros(height, width, out_channels);
    if out.as_slice().is_empty() {
        return out;
    }

    let band_rows = (COLUMN_BUDGET / (width * k)).max(1).min(height);
    let band_len = band_rows * width * out_channels;

    for_each_band(out.as_mut_slice(), band_len, threads, |band, dst| {
        let rows = dst.len() / (width * out_channels);
        let m = rows * width;

        let mut cols = vec![0.0f32; m * k];
        im2col(input, band * band_rows, rows, &mut cols);

        let beta = match bias {
            Some(bias) => {
                for px in dst.chunks_exact_mut(out_channels) {
                    px.copy_from_slice(bias);
                }
                1.0
            }
            None => 0.0,
        };

        // SAFETY: `cols` is m x k, `kernel` read as its transpose is
        // k x out_channels and `dst` is m x out_channels, all dense row-major
        unsafe {
            matrixmultiply::sgemm(
                m,
                k,
                out_channels,
                1.0,
                cols.as_ptr(),
                k as isize,
                1,
                kernel.as_ptr(),
                1,
                k as isize,
                beta,
                dst.as_mut_ptr(),
                out_channels as isize,
                1,
            );
        }
    });

    out
}

/// Unfolds the 3x3 neighbourhoods of `rows` rows starting at `y0` into
/// `cols`, one row of `9 * channels` values per output position.
fn im2col(input: &FeatureMap, y0: usize, rows: usize, cols: &mut [f32]) {
    let (height, width, channels) = (input.height(), input.width(), input.channels());
    let k = 9 * channels;

    for r in 0..rows {
        let y = y0 + r;
        for x in 0..width {
            let row = &mut cols[(r * width + x) * k..][..k];

            for ky in 0..3 {
                // padding rows stay zero
                let iy = match (y + ky).checked_sub(1) {
                    Some(iy) if iy < height => iy,
                    _ => continue,
                };

                for kx in 0..3 {
                    let ix = match (x + kx).checked_sub(1) {
                        Some(ix) if ix < width => ix,
                        _ => continue,
                    };

                    row[(ky * 3 + kx) * channels..][..channels]
                        .copy_from_slice(input.pixel(iy, ix));
                }
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
fn for_each_band<F>(out: &mut [f32], band_len: usize, _threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    for (band, dst) in out.chunks_mut(band_len).enumerate() {
        f(band, dst);
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn for_each_band<F>(out: &mut [f32], band_len: usize, threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let mut bands: Vec<(usize, &mut [f32])> = out.chunks_mut(band_len).enumerate().collect();
    let workers = threads.max(1).min(bands.len());

    if workers <= 1 {
        for (band, dst) in bands {
            f(band, dst);
        }
        return;
    }

    let per_worker = (bands.len() + workers - 1) / workers;
    let f = &f;

    crossbeam_utils::thread::scope(|scope| {
        for group in bands.chunks_mut(per_worker) {
            scope.spawn(move |_| {
                for (band, dst) in group.iter_mut() {
                    f(*band, dst);
                }
            });
        }
    })
    .unwrap();
}

pub(crate) fn relu(map: &mut FeatureMap) {
    for v in map.as_mut_slice() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Masks `grad` with the positions where the rectified `output` was active
pub(crate) fn relu_backward(grad: &mut FeatureMap, output: &FeatureMap) {
    debug_assert!(grad.same_shape(output));
    for (g, o) in grad.as_mut_slice().iter_mut().zip(output.as_slice()) {
        if *o <= 0.0 {
            *g = 0.0;
        }
    }
}

/// 2x2 max pooling with stride 2. Odd trailing rows/columns are dropped.
pub(crate) fn max_pool(input: &FeatureMap) -> FeatureMap {
    let (oh, ow, c) = (input.height() / 2, input.width() / 2, input.channels());
    let mut out = FeatureMap::zeros(oh, ow, c);
    let dst = out.as_mut_slice();

    for oy in 0..oh {
        for ox in 0..ow {
            let a = input.pixel(2 * oy, 2 * ox);
            let b = input.pixel(2 * oy, 2 * ox + 1);
            let cc = input.pixel(2 * oy + 1, 2 * ox);
            let d = input.pixel(2 * oy + 1, 2 * ox + 1);

            let o = &mut dst[(oy * ow + ox) * c..][..c];
            for ch in 0..c {
                o[ch] = a[ch].max(b[ch]).max(cc[ch]).max(d[ch]);
            }
        }
    }

    out
}

/// Routes each pooled gradient back to the first maximal input of its window
pub(crate) fn max_pool_backward(grad: &FeatureMap, input: &FeatureMap) -> FeatureMap {
    let (oh, ow, c) = (grad.height(), grad.width(), grad.channels());
    let (width, channels) = (input.width(), input.channels());
    debug_assert_eq!(oh, input.height() / 2);
    debug_assert_eq!(ow, width / 2);

    let mut out = FeatureMap::zeros(input.height(), width, channels);
    let dst = out.as_mut_slice();

    for oy in 0..oh {
        for ox in 0..ow {
            let g = grad.pixel(oy, ox);
            let window = [
                (2 * oy, 2 * ox),
                (2 * oy, 2 * ox + 1),
                (2 * oy + 1, 2 * ox),
                (2 * oy + 1, 2 * ox + 1),
            ];

            for ch in 0..c {
                let mut best = window[0];
                let mut best_val = input.pixel(best.0, best.1)[ch];
                for &(y, x) in &window[1..] {
                    let v = input.pixel(y, x)[ch];
                    if v > best_val {
                        best = (y, x);
                        best_val = v;
                    }
                }

                dst[(best.0 * width + best.1) * channels + ch] = g[ch];
            }
        }
    }

    out
}

/// `Fᵀ F` for the `positions x channels` matrix F, a row-major
/// `channels x channels` matrix
pub(crate) fn gram(map: &FeatureMap) -> Vec<f32> {
    let (n, c) = (map.positions(), map.channels());
    let mut out = vec![0.0f32; c * c];
    if n == 0 || c == 0 {
        return out;
    }

    // SAFETY: F is n x c row-major, read transposed as c x n; out is c x c
    unsafe {
        matrixmultiply::sgemm(
            c,
            n,
            c,
            1.0,
            map.as_slice().as_ptr(),
            1,
            c as isize,
            map.as_slice().as_ptr(),
            c as isize,
            1,
            0.0,
            out.as_mut_ptr(),
            c as isize,
            1,
        );
    }

    out
}

/// `alpha * F M` for the `positions x channels` matrix F and a square
/// `channels x channels` matrix M
pub(crate) fn mul_square(map: &FeatureMap, m: &[f32], alpha: f32) -> FeatureMap {
    let (n, c) = (map.positions(), map.channels());
    debug_assert_eq!(m.len(), c * c);

    let mut out = FeatureMap::zeros(map.height(), map.width(), c);
    if n == 0 || c == 0 {
        return out;
    }

    // SAFETY: F is n x c, M is c x c, out is n x c, all dense row-major
    unsafe {
        matrixmultiply::sgemm(
            n,
            c,
            c,
            alpha,
            map.as_slice().as_ptr(),
            c as isize,
            1,
            m.as_ptr(),
            c as isize,
            1,
            0.0,
            out.as_mut_slice().as_mut_ptr(),
            c as isize,
            1,
        );
    }

    out
}
