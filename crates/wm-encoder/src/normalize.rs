// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-channel affine normalisation of RGB batches.

use wm_tensor::{PureResult, Tensor, TensorError};

pub const RGB_CHANNELS: usize = 3;

/// Standard deviation of a uniform distribution on `[0, 1)`.
pub fn uniform_unit_std() -> f32 {
    1.0 / 12f32.sqrt()
}

/// `(x - mean[c]) / std[c]` for each of the three colour channels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelNormalize {
    mean: [f32; RGB_CHANNELS],
    std: [f32; RGB_CHANNELS],
}

impl ChannelNormalize {
    pub fn new(mean: [f32; RGB_CHANNELS], std: [f32; RGB_CHANNELS]) -> PureResult<Self> {
        if std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(TensorError::InvalidValue {
                label: "normalize_std",
            });
        }
        Ok(Self { mean, std })
    }

    /// Maps `[0, 1]` pixels onto `[-1, 1]`.
    pub fn image() -> Self {
        Self {
            mean: [0.5; RGB_CHANNELS],
            std: [0.5; RGB_CHANNELS],
        }
    }

    /// Maps `[-1, 1]` pixels back onto `[0, 1]`.
    pub fn image_inverse() -> Self {
        Self {
            mean: [-1.0; RGB_CHANNELS],
            std: [2.0; RGB_CHANNELS],
        }
    }

    /// Centres and whitens bit residuals, which are roughly uniform on the
    /// discarded bit range.
    pub fn bit_residual() -> Self {
        Self {
            mean: [0.5; RGB_CHANNELS],
            std: [uniform_unit_std(); RGB_CHANNELS],
        }
    }

    fn plane(tensor: &Tensor) -> PureResult<usize> {
        let (rows, cols) = tensor.shape();
        if cols % RGB_CHANNELS != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, RGB_CHANNELS),
            });
        }
        Ok(cols / RGB_CHANNELS)
    }

    fn per_channel(&self, tensor: &Tensor, op: impl Fn(f32, f32, f32) -> f32) -> PureResult<Tensor> {
        let plane = Self::plane(tensor)?;
        let mut out = tensor.clone();
        for row in out.data_mut().chunks_mut(RGB_CHANNELS * plane) {
            for (c, channel) in row.chunks_mut(plane).enumerate() {
                for value in channel.iter_mut() {
                    *value = op(*value, self.mean[c], self.std[c]);
                }
            }
        }
        Ok(out)
    }

    pub fn apply(&self, tensor: &Tensor) -> PureResult<Tensor> {
        self.per_channel(tensor, |x, mean, std| (x - mean) / std)
    }

    /// Exact inverse of [`apply`](Self::apply): `x * std + mean`.
    pub fn invert(&self, tensor: &Tensor) -> PureResult<Tensor> {
        self.per_channel(tensor, |x, mean, std| x * std + mean)
    }

    /// Scales a gradient flowing back through [`apply`](Self::apply).
    pub fn backward(&self, grad_output: &Tensor) -> PureResult<Tensor> {
        self.per_channel(grad_output, |g, _, std| g / std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tensor {
        Tensor::from_vec(1, 6, vec![0.0, 0.25, 0.5, 0.75, 1.0, 0.125]).unwrap()
    }

    #[test]
    fn image_norm_maps_unit_interval_to_symmetric_range() {
        let normed = ChannelNormalize::image().apply(&sample()).unwrap();
        assert_eq!(normed.data(), &[-1.0, -0.5, 0.0, 0.5, 1.0, -0.75]);
        let back = ChannelNormalize::image_inverse().apply(&normed).unwrap();
        assert!(back.max_abs_diff(&sample()).unwrap() < 1e-6);
    }

    #[test]
    fn bit_residual_invert_recovers_input() {
        let norm = ChannelNormalize::bit_residual();
        let x = sample();
        let roundtrip = norm.invert(&norm.apply(&x).unwrap()).unwrap();
        assert!(roundtrip.max_abs_diff(&x).unwrap() < 1e-6);

        // (y + 0.5) * (1/sqrt(12)) does not undo the normalisation.
        let y = norm.apply(&x).unwrap();
        let r = uniform_unit_std();
        let skewed = y.map(|v| (v + 0.5) * r);
        assert!(skewed.max_abs_diff(&x).unwrap() > 0.1);
    }

    #[test]
    fn rejects_widths_that_are_not_rgb() {
        let odd = Tensor::zeros(2, 4).unwrap();
        assert!(ChannelNormalize::image().apply(&odd).is_err());
    }

    #[test]
    fn rejects_non_positive_std() {
        assert!(ChannelNormalize::new([0.0; 3], [1.0, 0.0, 1.0]).is_err());
    }
}
