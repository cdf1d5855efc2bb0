//! The three terms of the style transfer objective and their gradients.

use crate::{ops, vgg::Layer, FeatureMap};

/// Layer whose activations the output must match the content image at
pub const CONTENT_LAYER: Layer = Layer::Block5Conv2;

/// One layer per block, each contributing an equal share of the style weight
pub const STYLE_LAYERS: [Layer; 5] = [
    Layer::Block1Conv1,
    Layer::Block2Conv1,
    Layer::Block3Conv1,
    Layer::Block4Conv1,
    Layer::Block5Conv1,
];

pub const CONTENT_WEIGHT: f64 = 0.025;
pub const STYLE_WEIGHT: f64 = 1.0;
pub const TOTAL_VARIATION_WEIGHT: f64 = 1e-4;

/// Exponent applied to the summed squared neighbour differences
const TV_EXPONENT: f64 = 1.25;

/// The deepest layer any loss term reads
pub(crate) fn deepest_layer() -> Layer {
    STYLE_LAYERS
        .iter()
        .copied()
        .chain(std::iter::once(CONTENT_LAYER))
        .max()
        .unwrap_or(CONTENT_LAYER)
}

/// `Σ (combination - content)²`
pub fn content_loss(content: &FeatureMap, combination: &FeatureMap) -> f64 {
    content
        .as_slice()
        .iter()
        .zip(combination.as_slice())
        .map(|(c, x)| {
            let d = f64::from(*x) - f64::from(*c);
            d * d
        })
        .sum()
}

/// `scale * d(content_loss)/d(combination)`
pub(crate) fn content_grad(content: &FeatureMap, combination: &FeatureMap, scale: f32) -> FeatureMap {
    let mut grad = combination.clone();
    grad.add_scaled(content, -1.0);
    grad.scale(2.0 * scale);
    grad
}

/// The channel co-occurrence statistics of a feature map, see `ops::gram`
#[derive(Clone, Debug)]
pub struct Gram {
    channels: usize,
    values: Vec<f32>,
}

impl Gram {
    pub fn new(map: &FeatureMap) -> Self {
        Self {
            channels: map.channels(),
            values: ops::gram(map),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.values[row * self.channels + col]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Normalization of a style term: `4 × channels² × size²`, where `channels`
/// and `size` describe the image being optimized rather than the layer
pub(crate) fn style_norm(image_channels: usize, image_size: usize) -> f64 {
    let (c, s) = (image_channels as f64, image_size as f64);
    4.0 * c * c * s * s
}

/// `Σ (S - C)² / norm` between the style and combination Gram matrices
pub fn style_loss(style: &Gram, combination: &Gram, norm: f64) -> f64 {
    let sum: f64 = style
        .values
        .iter()
        .zip(combination.values.iter())
        .map(|(s, c)| {
            let d = f64::from(*s) - f64::from(*c);
            d * d
        })
        .sum();
    sum / norm
}

/// `scale * d(style_loss)/d(features)`, given the combination's own Gram
/// matrix `combination` computed from `features`
pub(crate) fn style_grad(
    style: &Gram,
    combination: &Gram,
    features: &FeatureMap,
    norm: f64,
    scale: f64,
) -> FeatureMap {
    // dL/dG = 2 (G - S) / norm, and G = FᵀF contributes F (D + Dᵀ)
    let diff: Vec<f32> = combination
        .values
        .iter()
        .zip(style.values.iter())
        .map(|(c, s)| c - s)
        .collect();

    ops::mul_square(features, &diff, (4.0 * scale / norm) as f32)
}

/// Smoothness prior over the `height x width x channels` pixel vector `x`:
/// `Σ ((x[i,j] - x[i+1,j])² + (x[i,j] - x[i,j+1])²)^1.25` over
/// `i < height - 1`, `j < width - 1`, per channel
pub fn total_variation_loss(x: &[f64], height: usize, width: usize, channels: usize) -> f64 {
    let mut total = 0.0;
    let at = |y: usize, xx: usize, c: usize| x[(y * width + xx) * channels + c];

    for y in 0..height.saturating_sub(1) {
        for xx in 0..width.saturating_sub(1) {
            for c in 0..channels {
                let v = at(y, xx, c);
                let down = v - at(y + 1, xx, c);
                let right = v - at(y, xx + 1, c);
                total += (down * down + right * right).powf(TV_EXPONENT);
            }
        }
    }

    total
}

/// Adds `scale * d(total_variation_loss)/dx` to `grad`
pub(crate) fn add_total_variation_grad(
    x: &[f64],
    height: usize,
    width: usize,
    channels: usize,
    scale: f64,
    grad: &mut [f64],
) {
    let idx = |y: usize, xx: usize, c: usize| (y * width + xx) * channels + c;

    for y in 0..height.saturating_sub(1) {
        for xx in 0..width.saturating_sub(1) {
            for c in 0..channels {
                let here = idx(y, xx, c);
                let below = idx(y + 1, xx, c);
                let beside = idx(y, xx + 1, c);

                let down = x[here] - x[below];
                let right = x[here] - x[beside];
                let s = down * down + right * right;
                if s == 0.0 {
                    continue;
                }

                let outer = scale * TV_EXPONENT * s.powf(TV_EXPONENT - 1.0);
                grad[here] += outer * 2.0 * (down + right);
                grad[below] -= outer * 2.0 * down;
                grad[beside] -= outer * 2.0 * right;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_map(rng: &mut rand_pcg::Pcg32, h: usize, w: usize, c: usize) -> FeatureMap {
        let data = (0..h * w * c).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
        FeatureMap::from_vec(h, w, c, data).unwrap()
    }

    #[test]
    fn losses_are_non_negative() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(7);

        for _ in 0..20 {
            let a = random_map(&mut rng, 4, 6, 3);
            let b = random_map(&mut rng, 4, 6, 3);
            assert!(content_loss(&a, &b) >= 0.0);
            assert!(style_loss(&Gram::new(&a), &Gram::new(&b), style_norm(3, 24)) >= 0.0);

            let x: Vec<f64> = a.as_slice().iter().map(|v| f64::from(*v)).collect();
            assert!(total_variation_loss(&x, 4, 6, 3) >= 0.0);
        }
    }

    #[test]
    fn identical_inputs_have_zero_loss() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(8);
        let a = random_map(&mut rng, 5, 5, 4);

        assert_eq!(content_loss(&a, &a), 0.0);
        assert_eq!(style_loss(&Gram::new(&a), &Gram::new(&a), 1.0), 0.0);
        assert_eq!(total_variation_loss(&[3.0; 5 * 5 * 3], 5, 5, 3), 0.0);
    }

    #[test]
    fn gram_matrix_is_symmetric() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(9);
        let g = Gram::new(&random_map(&mut rng, 9, 11, 6));

        for i in 0..g.channels() {
            for j in 0..g.channels() {
                let (a, b) = (g.get(i, j), g.get(j, i));
                assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0));
            }
        }
    }

    #[test]
    fn tv_only_sees_interior_neighbours() {
        // the bottom-right pixel is never part of a difference
        let mut x = vec![0.0; 3 * 3];
        x[8] = 2.0;
        assert_eq!(total_variation_loss(&x, 3, 3, 1), 0.0);

        x[4] = 1.0;
        // (1,1) differs from both of its neighbours, while (0,1) and (1,0)
        // each differ from it once
        let expected = 2f64.powf(1.25) + 2.0;
        assert!((total_variation_loss(&x, 3, 3, 1) - expected).abs() < 1e-12);
    }

    #[test]
    fn tv_gradient_matches_finite_differences() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(10);
        let (h, w, c) = (5, 4, 3);
        let x: Vec<f64> = (0..h * w * c).map(|_| rng.gen_range(-50.0..50.0)).collect();

        let mut grad = vec![0.0; x.len()];
        add_total_variation_grad(&x, h, w, c, 1.0, &mut grad);

        for i in 0..x.len() {
            let eps = 1e-5;
            let mut plus = x.clone();
            plus[i] += eps;
            let mut minus = x.clone();
            minus[i] -= eps;

            let numeric = (total_variation_loss(&plus, h, w, c)
                - total_variation_loss(&minus, h, w, c))
                / (2.0 * eps);
            assert!(
                (numeric - grad[i]).abs() <= 1e-4 * grad[i].abs().max(1.0),
                "index {}: numeric {} analytic {}",
                i,
                numeric,
                grad[i]
            );
        }
    }

    #[test]
    fn content_gradient_points_away_from_target() {
        let content = FeatureMap::from_vec(1, 2, 1, vec![1.0, 1.0]).unwrap();
        let combination = FeatureMap::from_vec(1, 2, 1, vec![3.0, 0.0]).unwrap();

        assert_eq!(content_loss(&content, &combination), 5.0);
        let grad = content_grad(&content, &combination, 0.5);
        assert_eq!(grad.as_slice(), &[2.0, -1.0]);
    }

    #[test]
    fn style_gradient_matches_finite_differences() {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(11);
        let style = Gram::new(&random_map(&mut rng, 3, 3, 2));
        let features = random_map(&mut rng, 3, 3, 2);
        let norm = 10.0;

        let grad = style_grad(&style, &Gram::new(&features), &features, norm, 1.0);

        for i in 0..features.as_slice().len() {
            let eps = 1e-2;
            let mut plus = features.clone();
            plus.as_mut_slice()[i] += eps;
            let mut minus = features.clone();
            minus.as_mut_slice()[i] -= eps;

            let numeric = (style_loss(&style, &Gram::new(&plus), norm)
                - style_loss(&style, &Gram::new(&minus), norm))
                / (2.0 * f64::from(eps));
            let analytic = f64::from(grad.as_slice()[i]);
            assert!(
                (numeric - analytic).abs() <= 2e-2 * analytic.abs().max(1.0),
                "index {}: numeric {} analytic {}",
                i,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn deepest_layer_is_the_content_layer() {
        assert_eq!(deepest_layer(), Layer::Block5Conv2);
    }
}
