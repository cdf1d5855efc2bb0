//! The VGG19 convolution stack used as a frozen feature extractor.
//!
//! Only the 16 convolution layers (with their ReLUs) and the pooling between
//! blocks are modelled, the classifier head is never needed. Weights come from
//! a `safetensors` file with tensors named `block{b}_conv{c}.weight` in
//! `[out, in, 3, 3]` layout and `block{b}_conv{c}.bias` in `[out]` layout.

use crate::{
    errors::{Error, WeightsError},
    ops, FeatureMap,
};
use std::{fmt, path::Path};

/// A named convolution layer of VGG19. The activation of a layer is the
/// rectified output of its convolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    Block1Conv1,
    Block1Conv2,
    Block2Conv1,
    Block2Conv2,
    Block3Conv1,
    Block3Conv2,
    Block3Conv3,
    Block3Conv4,
    Block4Conv1,
    Block4Conv2,
    Block4Conv3,
    Block4Conv4,
    Block5Conv1,
    Block5Conv2,
    Block5Conv3,
    Block5Conv4,
}

impl Layer {
    /// Every layer, in network order
    pub const ALL: [Layer; 16] = [
        Layer::Block1Conv1,
        Layer::Block1Conv2,
        Layer::Block2Conv1,
        Layer::Block2Conv2,
        Layer::Block3Conv1,
        Layer::Block3Conv2,
        Layer::Block3Conv3,
        Layer::Block3Conv4,
        Layer::Block4Conv1,
        Layer::Block4Conv2,
        Layer::Block4Conv3,
        Layer::Block4Conv4,
        Layer::Block5Conv1,
        Layer::Block5Conv2,
        Layer::Block5Conv3,
        Layer::Block5Conv4,
    ];

    /// Position of the layer in the network
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Block1Conv1 => "block1_conv1",
            Self::Block1Conv2 => "block1_conv2",
            Self::Block2Conv1 => "block2_conv1",
            Self::Block2Conv2 => "block2_conv2",
            Self::Block3Conv1 => "block3_conv1",
            Self::Block3Conv2 => "block3_conv2",
            Self::Block3Conv3 => "block3_conv3",
            Self::Block3Conv4 => "block3_conv4",
            Self::Block4Conv1 => "block4_conv1",
            Self::Block4Conv2 => "block4_conv2",
            Self::Block4Conv3 => "block4_conv3",
            Self::Block4Conv4 => "block4_conv4",
            Self::Block5Conv1 => "block5_conv1",
            Self::Block5Conv2 => "block5_conv2",
            Self::Block5Conv3 => "block5_conv3",
            Self::Block5Conv4 => "block5_conv4",
        }
    }

    /// Whether a 2x2 max pool sits between the previous layer and this one,
    /// ie. this is the first convolution of blocks 2 through 5
    #[inline]
    fn is_pooled(self) -> bool {
        matches!(
            self,
            Self::Block2Conv1 | Self::Block3Conv1 | Self::Block4Conv1 | Self::Block5Conv1
        )
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The weights of a single 3x3 convolution, kept in both the layout used by
/// the forward pass and the flipped, transposed layout that propagates
/// gradients back to the layer's input.
#[derive(Clone)]
pub struct ConvWeights {
    in_channels: usize,
    out_channels: usize,
    forward: Vec<f32>,
    backward: Vec<f32>,
    bias: Vec<f32>,
}

impl ConvWeights {
    /// Creates a convolution from a kernel in `[out, in, 3, 3]` layout
    pub fn from_oihw(
        out_channels: usize,
        in_channels: usize,
        kernel: &[f32],
        bias: Vec<f32>,
    ) -> Result<Self, WeightsError> {
        if kernel.len() != out_channels * in_channels * 9 {
            return Err(WeightsError::ShapeMismatch {
                name: "kernel".to_owned(),
                expected: vec![out_channels, in_channels, 3, 3],
                actual: vec![kernel.len()],
            });
        }

        if bias.len() != out_channels {
            return Err(WeightsError::ShapeMismatch {
                name: "bias".to_owned(),
                expected: vec![out_channels],
                actual: vec![bias.len()],
            });
        }

        let k = 9 * in_channels;
        let mut forward = vec![0.0; out_channels * k];
        for co in 0..out_channels {
            for ci in 0..in_channels {
                for tap in 0..9 {
                    forward[co * k + tap * in_channels + ci] = kernel[(co * in_channels + ci) * 9 + tap];
                }
            }
        }

        let backward = transpose_flip(&forward, in_channels, out_channels);

        Ok(Self {
            in_channels,
            out_channels,
            forward,
            backward,
            bias,
        })
    }

    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    #[inline]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Turns a `[out][ky][kx][in]` kernel into the `[in][ky][kx][out]` kernel of
/// its adjoint, rotating the taps by 180°.
pub(crate) fn transpose_flip(forward: &[f32], in_channels: usize, out_channels: usize) -> Vec<f32> {
    let (kf, kb) = (9 * in_channels, 9 * out_channels);
    let mut backward = vec![0.0; in_channels * kb];

    for ci in 0..in_channels {
        for tap in 0..9 {
            let flipped = 8 - tap;
            for co in 0..out_channels {
                backward[ci * kb + tap * out_channels + co] = forward[co * kf + flipped * in_channels + ci];
            }
        }
    }

    backward
}

/// The frozen VGG19 convolution stack
#[derive(Clone)]
pub struct Vgg19 {
    convs: Vec<ConvWeights>,
}

impl Vgg19 {
    /// Assembles a network from one convolution per `Layer`, in network order.
    /// Channel counts are free, but each layer must consume what the previous
    /// one produces, and the first layer must take 3 channels.
    pub fn from_layers(convs: Vec<ConvWeights>) -> Result<Self, WeightsError> {
        if convs.len() != Layer::ALL.len() {
            let missing = Layer::ALL[convs.len().min(Layer::ALL.len() - 1)];
            return Err(WeightsError::MissingTensor(format!("{}.weight", missing)));
        }

        let mut expected_in = 3;
        for (layer, conv) in Layer::ALL.iter().zip(convs.iter()) {
            if conv.in_channels != expected_in {
                return Err(WeightsError::ShapeMismatch {
                    name: format!("{}.weight", layer),
                    expected: vec![conv.out_channels, expected_in, 3, 3],
                    actual: vec![conv.out_channels, conv.in_channels, 3, 3],
                });
            }
            expected_in = conv.out_channels;
        }

        Ok(Self { convs })
    }

    /// Loads the network from a `safetensors` file on disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        log::debug!("loading VGG19 weights from {}", path.display());

        let buffer = std::fs::read(path)?;
        Self::from_safetensors(&buffer)
    }

    /// Parses the network from an in-memory `safetensors` buffer
    pub fn from_safetensors(buffer: &[u8]) -> Result<Self, Error> {
        let tensors = safetensors::SafeTensors::deserialize(buffer)?;
        log::debug!("weights file contains {} tensors", tensors.names().len());

        let mut convs = Vec::with_capacity(Layer::ALL.len());
        let mut expected_in = 3;

        for layer in Layer::ALL.iter() {
            let weight_name = format!("{}.weight", layer);
            let (shape, kernel) = read_f32(&tensors, &weight_name)?;

            if shape.len() != 4 || shape[1] != expected_in || shape[2] != 3 || shape[3] != 3 {
                return Err(WeightsError::ShapeMismatch {
                    name: weight_name,
                    expected: vec![shape.first().copied().unwrap_or(0), expected_in, 3, 3],
                    actual: shape,
                }
                .into());
            }

            let out_channels = shape[0];
            let bias_name = format!("{}.bias", layer);
            let (bias_shape, bias) = read_f32(&tensors, &bias_name)?;
            if bias_shape != [out_channels] {
                return Err(WeightsError::ShapeMismatch {
                    name: bias_name,
                    expected: vec![out_channels],
                    actual: bias_shape,
                }
                .into());
            }

            log::debug!("{}: {} -> {} channels", layer, expected_in, out_channels);
            convs.push(ConvWeights::from_oihw(out_channels, expected_in, &kernel, bias)?);
            expected_in = out_channels;
        }

        Ok(Self::from_layers(convs)?)
    }

    /// The convolution backing a layer
    #[inline]
    pub fn conv(&self, layer: Layer) -> &ConvWeights {
        &self.convs[layer.index()]
    }

    /// Runs the stack on a single preprocessed image, stopping after `deepest`
    pub fn forward(&self, image: &FeatureMap, deepest: Layer, threads: usize) -> Activations {
        let mut maps: Vec<FeatureMap> = Vec::with_capacity(deepest.index() + 1);

        for layer in Layer::ALL.iter().take(deepest.index() + 1) {
            let conv = self.conv(*layer);

            let pooled;
            let input = match maps.last() {
                None => image,
                Some(prev) if layer.is_pooled() => {
                    pooled = ops::max_pool(prev);
                    &pooled
                }
                Some(prev) => prev,
            };

            let mut out = ops::conv3x3(
                input,
                &conv.forward,
                Some(conv.bias.as_slice()),
                conv.out_channels,
                threads,
            );
            ops::relu(&mut out);
            maps.push(out);
        }

        Activations { maps }
    }

    /// Propagates gradients of a scalar loss with respect to layer
    /// activations back to the input image.
    ///
    /// `injected` pairs layers with `dL/d(activation)`, each of which must be
    /// shaped like the activation it belongs to. Layers deeper than the
    /// deepest injected gradient are skipped entirely.
    pub fn backward(
        &self,
        image: &FeatureMap,
        activations: &Activations,
        mut injected: Vec<(Layer, FeatureMap)>,
        threads: usize,
    ) -> FeatureMap {
        injected.sort_by_key(|(layer, _)| std::cmp::Reverse(*layer));
        let mut pending = injected.into_iter().peekable();

        let start = match pending.peek() {
            Some((layer, _)) => layer.index(),
            None => return FeatureMap::zeros(image.height(), image.width(), image.channels()),
        };

        let mut grad: Option<FeatureMap> = None;

        for layer in Layer::ALL[..=start].iter().rev() {
            while let Some((_, g)) = pending.next_if(|(l, _)| l == layer) {
                grad = Some(match grad {
                    Some(mut acc) => {
                        acc.add_scaled(&g, 1.0);
                        acc
                    }
                    None => g,
                });
            }

            let mut g = match grad.take() {
                Some(g) => g,
                None => continue,
            };

            let conv = self.conv(*layer);
            ops::relu_backward(&mut g, activations.get(*layer));

            let mut g_in = ops::conv3x3(&g, &conv.backward, None, conv.in_channels, threads);
            if layer.is_pooled() {
                let below = Layer::ALL[layer.index() - 1];
                g_in = ops::max_pool_backward(&g_in, activations.get(below));
            }

            grad = Some(g_in);
        }

        grad.unwrap_or_else(|| FeatureMap::zeros(image.height(), image.width(), image.channels()))
    }
}

fn read_f32(
    tensors: &safetensors::SafeTensors<'_>,
    name: &str,
) -> Result<(Vec<usize>, Vec<f32>), WeightsError> {
    let view = tensors
        .tensor(name)
        .map_err(|_missing| WeightsError::MissingTensor(name.to_owned()))?;

    if view.dtype() != safetensors::Dtype::F32 {
        return Err(WeightsError::UnsupportedDtype {
            name: name.to_owned(),
            dtype: format!("{:?}", view.dtype()),
        });
    }

    // the buffer isn't guaranteed to be 4-byte aligned
    let values = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok((view.shape().to_vec(), values))
}

/// The rectified outputs of every layer up to the deepest one requested
pub struct Activations {
    maps: Vec<FeatureMap>,
}

impl Activations {
    /// The activation of `layer`.
    ///
    /// # Panics
    /// If `layer` is deeper than the layer the forward pass stopped at
    #[inline]
    pub fn get(&self, layer: Layer) -> &FeatureMap {
        &self.maps[layer.index()]
    }

    /// The activation of `layer`, or `None` if the forward pass stopped
    /// before reaching it
    #[inline]
    pub fn try_get(&self, layer: Layer) -> Option<&FeatureMap> {
        self.maps.get(layer.index())
    }

    /// The deepest layer that was evaluated
    pub fn deepest(&self) -> Option<Layer> {
        self.maps.len().checked_sub(1).map(|i| Layer::ALL[i])
    }
}

/// A VGG19 with every layer `width` channels wide and small random weights,
/// cheap enough to run in tests
#[cfg(test)]
pub(crate) fn tiny_network(width: usize, seed: u64) -> Vgg19 {
    use rand::{Rng, SeedableRng};
    let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);

    let mut in_channels = 3;
    let convs = Layer::ALL
        .iter()
        .map(|_| {
            let scale = (2.0 / (9.0 * in_channels as f32)).sqrt();
            let kernel: Vec<f32> = (0..width * in_channels * 9)
                .map(|_| rng.gen_range(-scale..scale))
                .collect();
            let bias = (0..width).map(|_| rng.gen_range(0.0..0.1)).collect();

            let conv = ConvWeights::from_oihw(width, in_channels, &kernel, bias).unwrap();
            in_channels = width;
            conv
        })
        .collect();

    Vgg19::from_layers(convs).unwrap()
}
