// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wm_encoder::{
    to_int_tensor, BitPlane, BitwiseEncoder, BitwiseEncoder2, ChannelNormalize, Encoder,
    EncoderError, HiddenConfiguration, MaskSpec, Parameterized, Tensor,
};

fn unit_image(batch: usize, hw: (usize, usize), seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::from_fn(batch, 3 * hw.0 * hw.1, |_, _| rng.gen_range(0.0..1.0)).unwrap()
}

fn bits(batch: usize, length: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::from_fn(batch, length, |_, _| if rng.gen_bool(0.5) { 1.0 } else { 0.0 }).unwrap()
}

/// Asserts `0 <= unnorm(output) - rounded <= (2^b - 1)/256` everywhere.
fn assert_within_bit_budget(output: &Tensor, rounded: &Tensor, plane: BitPlane) {
    let unit = ChannelNormalize::image_inverse().apply(output).unwrap();
    let budget = plane.output_scaling_factor();
    for (value, floor) in unit.data().iter().zip(rounded.data()) {
        let gap = value - floor;
        assert!(gap >= -1e-5, "gap {gap} below zero");
        assert!(gap <= budget + 1e-5, "gap {gap} above {budget}");
    }
}

#[test]
fn direct_encoder_keeps_image_shape() {
    let config = HiddenConfiguration::whole_image((8, 6), 5, 4, 2);
    let encoder = Encoder::new(&config).unwrap();
    let out = encoder
        .forward(&unit_image(3, (8, 6), 1), &bits(3, 5, 2))
        .unwrap();
    assert_eq!(out.shape(), (3, 3 * 8 * 6));
}

#[test]
fn all_ones_mask_matches_unmasked_and_zeros_blank_the_output() {
    let base = HiddenConfiguration::whole_image((4, 4), 3, 4, 1);
    let image = unit_image(2, (4, 4), 7);
    let message = bits(2, 3, 8);

    let plain = Encoder::new(&base).unwrap();
    plain.eval();
    let expected = plain.forward(&image, &message).unwrap();

    let mut ones = Encoder::new(&base.clone().with_mask(MaskSpec::constant(1, (4, 4), 1.0))).unwrap();
    ones.eval();
    ones.load_state_dict(&plain.state_dict().unwrap()).unwrap();
    let masked = ones.forward(&image, &message).unwrap();
    assert!(masked.max_abs_diff(&expected).unwrap() < 1e-6);

    let zeros = Encoder::new(&base.with_mask(MaskSpec::constant(3, (4, 4), 0.0))).unwrap();
    let blank = zeros.forward(&image, &message).unwrap();
    assert!(blank.data().iter().all(|&v| v == 0.0));
}

#[test]
fn bitwise_encoder_stays_within_low_bits() {
    let config = HiddenConfiguration::whole_image((8, 8), 6, 4, 2).with_masking_args(4u32);
    let encoder = BitwiseEncoder::new(&config).unwrap();
    let image = unit_image(2, (8, 8), 11);
    let out = encoder.forward(&image, &bits(2, 6, 12)).unwrap();
    let plane = BitPlane::new(4).unwrap();
    assert_eq!(plane.output_scaling_factor(), 15.0 / 256.0);
    assert_within_bit_budget(&out, &plane.floor(&image), plane);
}

#[test]
fn bitwise_encoder2_stays_within_low_bits() {
    let config = HiddenConfiguration::whole_image((8, 8), 6, 4, 2).with_masking_args("4".to_string());
    let plane = BitPlane::new(4).unwrap();
    let normalized = ChannelNormalize::image()
        .apply(&unit_image(2, (8, 8), 13))
        .unwrap();
    let rounded = plane.floor(&ChannelNormalize::image_inverse().apply(&normalized).unwrap());
    for include_image in [false, true] {
        let encoder = BitwiseEncoder2::new(&config, include_image).unwrap();
        let out = encoder.forward(&normalized, &bits(2, 6, 14)).unwrap();
        assert_eq!(out.shape(), normalized.shape());
        assert_within_bit_budget(&out, &rounded, plane);
    }
}

#[test]
fn int_tensor_floors_into_bytes() {
    let image = Tensor::from_vec(1, 3, vec![0.0, 0.5, 0.999]).unwrap();
    let bytes = to_int_tensor(&image);
    assert_eq!(bytes.data, vec![0, 128, 255]);
}

#[test]
fn bitwise_encoder2_concatenation_width_follows_include_image() {
    let config = HiddenConfiguration::whole_image((4, 4), 2, 3, 1).with_masking_args(2u32);
    let without = BitwiseEncoder2::new(&config, false).unwrap();
    let with = BitwiseEncoder2::new(&config, true).unwrap();
    assert_eq!(without.policy().side_channels(), 3);
    assert_eq!(with.policy().side_channels(), 6);
    assert_eq!(with.fusion_in_channels() - without.fusion_in_channels(), 3);

    let short_message = bits(1, 1, 3);
    assert!(matches!(
        with.forward(&unit_image(1, (4, 4), 4), &short_message),
        Err(EncoderError::ShapeMismatch { .. })
    ));
}

#[test]
fn block_mode_end_to_end() {
    let config = HiddenConfiguration::blocks(4, 8, 2).with_masking_args(3u32);
    let image = unit_image(2, (16, 16), 21);
    let message = bits(2, 4, 22);

    let direct = Encoder::new(&config).unwrap();
    assert_eq!(direct.frame_hw(), (16, 16));
    assert_eq!(direct.message_length(), 4);
    assert_eq!(direct.forward(&image, &message).unwrap().shape(), (2, 768));

    let bitwise = BitwiseEncoder::new(&config).unwrap();
    let out = bitwise.forward(&image, &message).unwrap();
    assert!(out.data().iter().all(|v| (-1.0..=1.0).contains(v)));
}
