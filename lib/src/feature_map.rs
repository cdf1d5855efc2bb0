/// A single image or layer activation, stored channels-last (`[y][x][c]`).
///
/// Flattening a feature map yields the same element order as the pixel
/// vector the optimizer works on, so conversions are plain copies.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![0.0; height * width * channels],
        }
    }

    /// Wraps an existing buffer, returning `None` if its length doesn't match
    /// the dimensions
    pub fn from_vec(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != height * width * channels {
            return None;
        }

        Some(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub(crate) fn from_f64(height: usize, width: usize, channels: usize, values: &[f64]) -> Self {
        debug_assert_eq!(values.len(), height * width * channels);
        Self {
            height,
            width,
            channels,
            data: values.iter().map(|v| *v as f32).collect(),
        }
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of spatial positions, ie. the row count of the flattened
    /// `positions x channels` matrix
    #[inline]
    pub fn positions(&self) -> usize {
        self.height * self.width
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// The channel values at a single position
    #[inline]
    pub fn pixel(&self, y: usize, x: usize) -> &[f32] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    #[inline]
    pub(crate) fn same_shape(&self, other: &Self) -> bool {
        self.height == other.height && self.width == other.width && self.channels == other.channels
    }

    /// `self += scale * other`
    pub(crate) fn add_scaled(&mut self, other: &Self, scale: f32) {
        debug_assert!(self.same_shape(other));
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
    }

    pub(crate) fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }
}
