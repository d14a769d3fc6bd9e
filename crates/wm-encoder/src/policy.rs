// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! How the projected residual becomes the watermarked image.

use crate::config::{ConfigError, HiddenConfiguration, MaskSpec};
use crate::normalize::RGB_CHANNELS;
use crate::quantize::BitPlane;
use wm_tensor::{PureResult, Tensor, TensorError};

/// Sharpness of the sigmoid that turns raw projections into bit changes.
pub const BIT_CHANGE_TEMPERATURE: f32 = 10.0;

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Validated embedding mask broadcast over the batch and, when it has a
/// single channel, over R, G and B.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    channels: usize,
    plane: usize,
    data: Vec<f32>,
}

impl Mask {
    pub fn from_spec(spec: &MaskSpec, (h, w): (usize, usize)) -> Result<Self, ConfigError> {
        if spec.channels != 1 && spec.channels != RGB_CHANNELS {
            return Err(ConfigError::MaskChannels {
                channels: spec.channels,
            });
        }
        let plane = h * w;
        let expected = spec.channels * plane;
        if spec.data.len() != expected {
            return Err(ConfigError::MaskLength {
                expected,
                got: spec.data.len(),
            });
        }
        Ok(Self {
            channels: spec.channels,
            plane,
            data: spec.data.clone(),
        })
    }

    /// Elementwise product of an RGB batch with the mask.
    pub fn apply(&self, tensor: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = tensor.shape();
        if cols != RGB_CHANNELS * self.plane {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, RGB_CHANNELS * self.plane),
            });
        }
        let mut out = tensor.clone();
        for row in out.data_mut().chunks_mut(cols) {
            for (c, channel) in row.chunks_mut(self.plane).enumerate() {
                let offset = if self.channels == 1 { 0 } else { c * self.plane };
                let weights = &self.data[offset..offset + self.plane];
                for (value, weight) in channel.iter_mut().zip(weights) {
                    *value *= weight;
                }
            }
        }
        Ok(out)
    }
}

/// Which encoder variant to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    /// The projection is the output image.
    Direct,
    /// Learns which low bits to set relative to the bit-floored input.
    BitResidualSubtract,
    /// Learns the low bits from the discarded residual, optionally also
    /// seeing the full image.
    BitResidualDirect { include_image: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PerturbationPolicy {
    Direct { mask: Option<Mask> },
    BitResidualSubtract { plane: BitPlane },
    BitResidualDirect { plane: BitPlane, include_image: bool },
}

impl PerturbationPolicy {
    /// Resolves the policy for `kind`, reading the mask and bit depth from
    /// `config`.
    pub fn resolve(config: &HiddenConfiguration, kind: PolicyKind) -> Result<Self, ConfigError> {
        let bit_plane = || -> Result<BitPlane, ConfigError> {
            let bits = config.bit_depth()?;
            BitPlane::new(bits).map_err(|_| ConfigError::BitDepthOutOfRange {
                bits: i64::from(bits),
            })
        };
        Ok(match kind {
            PolicyKind::Direct => {
                let mask = config
                    .active_mask()
                    .map(|spec| Mask::from_spec(spec, config.frame().hw()))
                    .transpose()?;
                PerturbationPolicy::Direct { mask }
            }
            PolicyKind::BitResidualSubtract => PerturbationPolicy::BitResidualSubtract {
                plane: bit_plane()?,
            },
            PolicyKind::BitResidualDirect { include_image } => {
                PerturbationPolicy::BitResidualDirect {
                    plane: bit_plane()?,
                    include_image,
                }
            }
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PerturbationPolicy::Direct { mask: None } => "direct",
            PerturbationPolicy::Direct { mask: Some(_) } => "direct+mask",
            PerturbationPolicy::BitResidualSubtract { .. } => "bit-residual-subtract",
            PerturbationPolicy::BitResidualDirect {
                include_image: true,
                ..
            } => "bit-residual-direct+image",
            PerturbationPolicy::BitResidualDirect { .. } => "bit-residual-direct",
        }
    }

    /// Image-derived channels appended after the message and features.
    pub fn side_channels(&self) -> usize {
        match self {
            PerturbationPolicy::BitResidualDirect {
                include_image: true,
                ..
            } => 2 * RGB_CHANNELS,
            _ => RGB_CHANNELS,
        }
    }

    pub fn bit_plane(&self) -> Option<BitPlane> {
        match self {
            PerturbationPolicy::Direct { .. } => None,
            PerturbationPolicy::BitResidualSubtract { plane }
            | PerturbationPolicy::BitResidualDirect { plane, .. } => Some(*plane),
        }
    }
}
