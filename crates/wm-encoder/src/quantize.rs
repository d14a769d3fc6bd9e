// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! 8-bit intensity helpers shared by the bitwise encoders.

use wm_tensor::{PureResult, Tensor, TensorError};

/// Number of representable 8-bit intensities.
pub const INTENSITY_LEVELS: f32 = 256.0;

/// The low `bits` of every 8-bit intensity that an encoder may rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitPlane {
    bits: u32,
}

impl BitPlane {
    pub fn new(bits: u32) -> PureResult<Self> {
        if !(1..=8).contains(&bits) {
            return Err(TensorError::InvalidValue { label: "bit_depth" });
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// `2^bits`: the step between representable rounded intensities.
    pub fn int_rounding_factor(&self) -> f32 {
        (1u32 << self.bits) as f32
    }

    /// `(2^bits - 1) / 256`: the largest change the encoder may add back.
    pub fn output_scaling_factor(&self) -> f32 {
        (self.int_rounding_factor() - 1.0) / INTENSITY_LEVELS
    }

    /// Clears the low bits of every intensity in a `[0, 1]` image.
    pub fn floor(&self, image: &Tensor) -> Tensor {
        let factor = self.int_rounding_factor();
        image.map(|v| (v * INTENSITY_LEVELS / factor).floor() * factor / INTENSITY_LEVELS)
    }
}

/// Quantised copy of a `[0, 1]` image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteImage {
    pub shape: (usize, usize),
    pub data: Vec<u8>,
}

/// `floor(v * 256)` saturated into `0..=255`.
pub fn to_int_tensor(image: &Tensor) -> ByteImage {
    let data = image
        .data()
        .iter()
        .map(|&v| (v * INTENSITY_LEVELS).floor().clamp(0.0, 255.0) as u8)
        .collect();
    ByteImage {
        shape: image.shape(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_follow_bit_depth() {
        let plane = BitPlane::new(4).unwrap();
        assert_eq!(plane.int_rounding_factor(), 16.0);
        assert_eq!(plane.output_scaling_factor(), 15.0 / 256.0);
        assert!(BitPlane::new(0).is_err());
        assert!(BitPlane::new(9).is_err());
    }

    #[test]
    fn floor_clears_low_bits() {
        let plane = BitPlane::new(4).unwrap();
        let image = Tensor::from_vec(1, 3, vec![37.0 / 256.0, 15.0 / 256.0, 255.0 / 256.0]).unwrap();
        let rounded = plane.floor(&image);
        assert_eq!(rounded.data(), &[32.0 / 256.0, 0.0, 240.0 / 256.0]);
    }

    #[test]
    fn int_tensor_floors_and_saturates() {
        let image = Tensor::from_vec(1, 5, vec![0.0, 0.5, 0.999, 1.0, -0.2]).unwrap();
        let bytes = to_int_tensor(&image);
        assert_eq!(bytes.shape, (1, 5));
        assert_eq!(bytes.data, vec![0, 128, 255, 255, 0]);
    }
}
