// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The learned watermark encoder.
//!
//! A stack of conv/batch-norm/ReLU blocks extracts features from an
//! image-derived tensor, the message is broadcast over the spatial grid and
//! concatenated with those features and the image channels, one more block
//! fuses everything and a 1×1 convolution projects back to RGB. The
//! [`PerturbationPolicy`] decides what the model sees and how the projection
//! becomes the output image.

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::config::{Frame, HiddenConfiguration};
use crate::error::{EncoderError, EncoderResult};
use crate::message::{broadcast_message, reduce_broadcast_grad};
use crate::normalize::{ChannelNormalize, RGB_CHANNELS};
use crate::policy::{sigmoid, PerturbationPolicy, PolicyKind, BIT_CHANGE_TEMPERATURE};
use crate::quantize::BitPlane;
use wm_nn::{Conv2d, ConvBnRelu, Module, Parameter, Parameterized, Sequential};
use wm_tensor::{PureResult, Tensor};

/// Tensors derived from the input image before the network runs.
struct Prepared {
    /// What the feature extractor sees.
    feature_input: Tensor,
    /// Image-derived channels concatenated after the features.
    side: Tensor,
    /// Bit-floored `[0, 1]` image for the bitwise policies.
    rounded: Option<Tensor>,
}

/// Intermediate activations of a forward pass, kept for the backward pass.
struct Activations {
    prepared: Prepared,
    concat: Tensor,
    fused: Tensor,
    raw: Tensor,
}

/// Gradients returned by [`WatermarkEncoder::backward`].
#[derive(Clone, Debug, PartialEq)]
pub struct InputGradients {
    /// Same shape as the image input.
    pub image: Tensor,
    /// `(batch, L)`, summed over every location the bit was broadcast to.
    pub message: Tensor,
}

pub struct WatermarkEncoder {
    extractor: Sequential,
    fusion: ConvBnRelu,
    projection: Conv2d,
    policy: PerturbationPolicy,
    frame: Frame,
    channels: usize,
    blocks: usize,
}

impl core::fmt::Debug for WatermarkEncoder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WatermarkEncoder")
            .field("policy", &self.policy.label())
            .field("frame", &self.frame)
            .field("channels", &self.channels)
            .field("blocks", &self.blocks)
            .finish()
    }
}

impl WatermarkEncoder {
    pub fn new(config: &HiddenConfiguration, kind: PolicyKind) -> EncoderResult<Self> {
        config.validate()?;
        let policy = PerturbationPolicy::resolve(config, kind)?;
        let frame = config.frame();
        let hw = frame.hw();
        let channels = config.encoder_channels;
        let blocks = config.encoder_blocks;

        let mut extractor = Sequential::new();
        for index in 0..blocks {
            let in_channels = if index == 0 { RGB_CHANNELS } else { channels };
            extractor.push(ConvBnRelu::new(
                &format!("encoder.extractor.{index}"),
                in_channels,
                channels,
                hw,
            )?);
        }
        let fusion_in = frame.message_length + channels + policy.side_channels();
        let fusion = ConvBnRelu::new("encoder.fusion", fusion_in, channels, hw)?;
        let projection = Conv2d::new(
            "encoder.projection",
            channels,
            RGB_CHANNELS,
            (1, 1),
            (1, 1),
            (0, 0),
            hw,
        )?;

        debug!(
            policy = policy.label(),
            height = hw.0,
            width = hw.1,
            message_length = frame.message_length,
            channels,
            blocks,
            fusion_in,
            "built watermark encoder"
        );

        Ok(Self {
            extractor,
            fusion,
            projection,
            policy,
            frame,
            channels,
            blocks,
        })
    }

    pub fn message_length(&self) -> usize {
        self.frame.message_length
    }

    pub fn frame_hw(&self) -> (usize, usize) {
        self.frame.hw()
    }

    pub fn policy(&self) -> &PerturbationPolicy {
        &self.policy
    }

    pub fn encoder_channels(&self) -> usize {
        self.channels
    }

    pub fn encoder_blocks(&self) -> usize {
        self.blocks
    }

    /// Channel count the fusion block was built for.
    pub fn fusion_in_channels(&self) -> usize {
        self.fusion.in_channels()
    }

    /// Batch statistics in every batch-norm layer.
    pub fn train(&self) {
        self.extractor.set_training(true);
        self.fusion.set_training(true);
    }

    /// Running statistics in every batch-norm layer; forward becomes a pure
    /// function of its inputs.
    pub fn eval(&self) {
        self.extractor.set_training(false);
        self.fusion.set_training(false);
    }

    fn check_inputs(&self, image: &Tensor, message: &Tensor) -> EncoderResult<usize> {
        let (batch, cols) = image.shape();
        let image_cols = RGB_CHANNELS * self.frame.plane();
        if cols != image_cols {
            return Err(EncoderError::ShapeMismatch {
                input: "image",
                expected: (batch, image_cols),
                got: (batch, cols),
            });
        }
        if message.shape() != (batch, self.frame.message_length) {
            return Err(EncoderError::ShapeMismatch {
                input: "message",
                expected: (batch, self.frame.message_length),
                got: message.shape(),
            });
        }
        Ok(batch)
    }

    fn prepare(&self, image: &Tensor) -> PureResult<Prepared> {
        match &self.policy {
            PerturbationPolicy::Direct { .. } => Ok(Prepared {
                feature_input: image.clone(),
                side: image.clone(),
                rounded: None,
            }),
            PerturbationPolicy::BitResidualSubtract { plane } => {
                let rounded = plane.floor(image);
                let normed = ChannelNormalize::image().apply(&rounded)?;
                Ok(Prepared {
                    feature_input: normed.clone(),
                    side: normed,
                    rounded: Some(rounded),
                })
            }
            PerturbationPolicy::BitResidualDirect {
                plane,
                include_image,
            } => {
                let unit = ChannelNormalize::image_inverse().apply(image)?;
                let rounded = plane.floor(&unit);
                let residual = unit.sub(&rounded)?;
                let bits = ChannelNormalize::bit_residual().apply(&residual)?;
                let side = if *include_image {
                    let normed = ChannelNormalize::image().apply(&unit)?;
                    Tensor::cat_cols(&[&normed, &bits])?
                } else {
                    bits.clone()
                };
                Ok(Prepared {
                    feature_input: bits,
                    side,
                    rounded: Some(rounded),
                })
            }
        }
    }

    fn concat(&self, message: &Tensor, features: &Tensor, side: &Tensor) -> EncoderResult<Tensor> {
        let planes = broadcast_message(message, self.frame.hw())?;
        let concat = Tensor::cat_cols(&[&planes, features, side])?;
        let expected = self.fusion_in_channels() * self.frame.plane();
        if concat.shape().1 != expected {
            return Err(EncoderError::ShapeMismatch {
                input: "fusion input",
                expected: (concat.shape().0, expected),
                got: concat.shape(),
            });
        }
        Ok(concat)
    }

    fn run(&self, image: &Tensor, message: &Tensor, replay: bool) -> EncoderResult<Activations> {
        let prepared = self.prepare(image)?;
        let features = if replay {
            self.extractor.forward_replay(&prepared.feature_input)?
        } else {
            self.extractor.forward(&prepared.feature_input)?
        };
        let concat = self.concat(message, &features, &prepared.side)?;
        let fused = if replay {
            self.fusion.forward_replay(&concat)?
        } else {
            self.fusion.forward(&concat)?
        };
        let raw = self.projection.forward(&fused)?;
        Ok(Activations {
            prepared,
            concat,
            fused,
            raw,
        })
    }

    /// Sigmoid gate of the bitwise policies, before scaling.
    fn bit_gate(&self, activations: &Activations) -> PureResult<Tensor> {
        let logits = match &self.policy {
            PerturbationPolicy::BitResidualSubtract { .. } => {
                activations.raw.sub(&activations.prepared.side)?
            }
            _ => activations.raw.clone(),
        };
        Ok(logits.map(|v| sigmoid(BIT_CHANGE_TEMPERATURE * v)))
    }

    fn compose(&self, activations: &Activations) -> EncoderResult<Tensor> {
        if let PerturbationPolicy::Direct { mask: Some(mask) } = &self.policy {
            return Ok(mask.apply(&activations.raw)?);
        }
        let (Some(plane), Some(rounded)) =
            (self.policy.bit_plane(), &activations.prepared.rounded)
        else {
            return Ok(activations.raw.clone());
        };
        let gate = self.bit_gate(activations)?;
        let mut watermarked = rounded.clone();
        watermarked.add_scaled(&gate, plane.output_scaling_factor())?;
        Ok(ChannelNormalize::image().apply(&watermarked)?)
    }

    /// Embeds `message` (`(batch, L)`) into `image` (`(batch, 3·H·W)`).
    ///
    /// The bit-residual-subtract policy expects `[0, 1]` pixels, the
    /// bit-residual-direct policy expects `[-1, 1]` pixels; both return
    /// `[-1, 1]` pixels.
    pub fn forward(&self, image: &Tensor, message: &Tensor) -> EncoderResult<Tensor> {
        let batch = self.check_inputs(image, message)?;
        trace!(policy = self.policy.label(), batch, "encoder forward");
        let activations = self.run(image, message, false)?;
        self.compose(&activations)
    }

    fn raw_gradient(&self, activations: &Activations, grad_output: &Tensor) -> EncoderResult<Tensor> {
        match (&self.policy, self.policy.bit_plane()) {
            (PerturbationPolicy::Direct { mask: Some(mask) }, _) => Ok(mask.apply(grad_output)?),
            (_, Some(plane)) => Ok(bit_gate_gradient(
                plane,
                &self.bit_gate(activations)?,
                grad_output,
            )?),
            _ => Ok(grad_output.clone()),
        }
    }

    /// Accumulates parameter gradients for `grad_output` (shaped like the
    /// output of [`forward`](Self::forward)) and returns the gradients with
    /// respect to both inputs. Bit flooring has no gradient, so the
    /// bit-residual-subtract policy always returns a zero image gradient.
    pub fn backward(
        &mut self,
        image: &Tensor,
        message: &Tensor,
        grad_output: &Tensor,
    ) -> EncoderResult<InputGradients> {
        let batch = self.check_inputs(image, message)?;
        if grad_output.shape() != image.shape() {
            return Err(EncoderError::ShapeMismatch {
                input: "grad_output",
                expected: image.shape(),
                got: grad_output.shape(),
            });
        }
        trace!(policy = self.policy.label(), batch, "encoder backward");

        let activations = self.run(image, message, true)?;
        let grad_raw = self.raw_gradient(&activations, grad_output)?;
        let grad_fused = self.projection.backward(&activations.fused, &grad_raw)?;
        let grad_concat = self.fusion.backward(&activations.concat, &grad_fused)?;

        let plane = self.frame.plane();
        let widths = [
            self.frame.message_length * plane,
            self.channels * plane,
            self.policy.side_channels() * plane,
        ];
        let mut parts = grad_concat.split_cols(&widths)?.into_iter();
        let (Some(grad_planes), Some(grad_features), Some(grad_side)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(EncoderError::ShapeMismatch {
                input: "fusion gradient",
                expected: (batch, widths.iter().sum()),
                got: grad_concat.shape(),
            });
        };
        let grad_feature_input = self
            .extractor
            .backward(&activations.prepared.feature_input, &grad_features)?;

        let grad_image = match &self.policy {
            PerturbationPolicy::Direct { .. } => grad_feature_input.add(&grad_side)?,
            PerturbationPolicy::BitResidualSubtract { .. } => {
                Tensor::zeros(batch, RGB_CHANNELS * plane)?
            }
            PerturbationPolicy::BitResidualDirect { include_image, .. } => {
                let to_unit = ChannelNormalize::image_inverse();
                let (grad_normed, grad_bits_side) = if *include_image {
                    let mut halves = grad_side
                        .split_cols(&[RGB_CHANNELS * plane, RGB_CHANNELS * plane])?
                        .into_iter();
                    match (halves.next(), halves.next()) {
                        (Some(normed), Some(bits)) => (Some(normed), bits),
                        _ => {
                            return Err(EncoderError::ShapeMismatch {
                                input: "side gradient",
                                expected: (batch, 2 * RGB_CHANNELS * plane),
                                got: grad_side.shape(),
                            })
                        }
                    }
                } else {
                    (None, grad_side)
                };
                let grad_bits = grad_feature_input.add(&grad_bits_side)?;
                let grad_residual = ChannelNormalize::bit_residual().backward(&grad_bits)?;
                let mut grad_unit = grad_residual;
                if let Some(grad_normed) = grad_normed {
                    let through_norm = ChannelNormalize::image().backward(&grad_normed)?;
                    grad_unit = grad_unit.add(&through_norm)?;
                }
                to_unit.backward(&grad_unit)?
            }
        };
        let grad_message =
            reduce_broadcast_grad(&grad_planes, self.frame.message_length, self.frame.hw())?;
        Ok(InputGradients {
            image: grad_image,
            message: grad_message,
        })
    }
}

/// Gradient of `norm(rounded + k·gate)` with respect to the gate logits,
/// where `gate = sigmoid(T·logit)`.
fn bit_gate_gradient(plane: BitPlane, gate: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
    let grad_watermarked = ChannelNormalize::image().backward(grad_output)?;
    let derivative = gate.map(|s| plane.output_scaling_factor() * BIT_CHANGE_TEMPERATURE * s * (1.0 - s));
    grad_watermarked.hadamard(&derivative)
}

impl Parameterized for WatermarkEncoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.extractor.visit_parameters(visitor)?;
        self.fusion.visit_parameters(visitor)?;
        self.projection.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.extractor.visit_parameters_mut(visitor)?;
        self.fusion.visit_parameters_mut(visitor)?;
        self.projection.visit_parameters_mut(visitor)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.extractor.visit_buffers(visitor)?;
        self.fusion.visit_buffers(visitor)
    }

    fn load_buffers(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.extractor.load_buffers(state)?;
        self.fusion.load_buffers(state)
    }
}

/// Whole-image or block encoder whose projection is the output image.
pub struct Encoder;

impl Encoder {
    pub fn new(config: &HiddenConfiguration) -> EncoderResult<WatermarkEncoder> {
        WatermarkEncoder::new(config, PolicyKind::Direct)
    }
}

/// Encoder that only rewrites the low `masking_args` bits of each intensity,
/// steering them relative to the bit-floored input.
pub struct BitwiseEncoder;

impl BitwiseEncoder {
    pub fn new(config: &HiddenConfiguration) -> EncoderResult<WatermarkEncoder> {
        WatermarkEncoder::new(config, PolicyKind::BitResidualSubtract)
    }
}

/// Encoder that learns the low bits from the discarded residual, optionally
/// also conditioning on the normalised image.
pub struct BitwiseEncoder2;

impl BitwiseEncoder2 {
    pub fn new(
        config: &HiddenConfiguration,
        include_image: bool,
    ) -> EncoderResult<WatermarkEncoder> {
        WatermarkEncoder::new(config, PolicyKind::BitResidualDirect { include_image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskSpec;

    fn image(batch: usize, hw: (usize, usize), seed: u64) -> Tensor {
        Tensor::random_uniform(batch, 3 * hw.0 * hw.1, 0.0, 1.0, Some(seed)).unwrap()
    }

    fn message(batch: usize, length: usize) -> Tensor {
        Tensor::from_fn(batch, length, |b, l| ((b + l) % 2) as f32).unwrap()
    }

    #[test]
    fn fusion_width_tracks_policy() {
        let config = HiddenConfiguration::whole_image((4, 4), 5, 6, 2).with_masking_args(2u32);
        assert_eq!(Encoder::new(&config).unwrap().fusion_in_channels(), 5 + 6 + 3);
        assert_eq!(BitwiseEncoder::new(&config).unwrap().fusion_in_channels(), 14);
        assert_eq!(BitwiseEncoder2::new(&config, false).unwrap().fusion_in_channels(), 14);
        assert_eq!(BitwiseEncoder2::new(&config, true).unwrap().fusion_in_channels(), 17);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let config = HiddenConfiguration::whole_image((4, 4), 3, 4, 1);
        let encoder = Encoder::new(&config).unwrap();
        let bad_image = Tensor::zeros(1, 3 * 5 * 4).unwrap();
        assert!(matches!(
            encoder.forward(&bad_image, &message(1, 3)),
            Err(EncoderError::ShapeMismatch { input: "image", .. })
        ));
        assert!(matches!(
            encoder.forward(&image(1, (4, 4), 1), &message(2, 3)),
            Err(EncoderError::ShapeMismatch {
                input: "message",
                ..
            })
        ));
        assert!(matches!(
            encoder.forward(&image(1, (4, 4), 1), &message(1, 4)),
            Err(EncoderError::ShapeMismatch {
                input: "message",
                ..
            })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = HiddenConfiguration::whole_image((4, 4), 3, 4, 1);
        assert!(matches!(
            BitwiseEncoder::new(&config),
            Err(EncoderError::Config(_))
        ));
        let masked = config.with_mask(MaskSpec::constant(3, (4, 5), 1.0));
        assert!(matches!(Encoder::new(&masked), Err(EncoderError::Config(_))));
    }

    #[test]
    fn eval_forward_is_repeatable() {
        let config = HiddenConfiguration::blocks(2, 4, 2).with_masking_args(3u32);
        let encoder = BitwiseEncoder2::new(&config, true).unwrap();
        let x = image(2, (16, 16), 3).map(|v| 2.0 * v - 1.0);
        let m = message(2, 2);
        encoder.forward(&x, &m).unwrap();
        encoder.eval();
        let first = encoder.forward(&x, &m).unwrap();
        let second = encoder.forward(&x, &m).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn subtract_policy_has_no_image_gradient() {
        let config = HiddenConfiguration::whole_image((4, 4), 2, 3, 1).with_masking_args(4u32);
        let mut encoder = BitwiseEncoder::new(&config).unwrap();
        let x = image(1, (4, 4), 9);
        let grad = Tensor::full(1, 48, 1.0).unwrap();
        let grads = encoder.backward(&x, &message(1, 2), &grad).unwrap();
        assert!(grads.image.data().iter().all(|&g| g == 0.0));
        assert_eq!(grads.message.shape(), (1, 2));
        assert!(matches!(
            encoder.backward(&x, &message(1, 2), &Tensor::zeros(1, 12).unwrap()),
            Err(EncoderError::ShapeMismatch {
                input: "grad_output",
                ..
            })
        ));
    }

    #[test]
    fn fusion_rejects_side_channels_of_the_wrong_width() {
        let config = HiddenConfiguration::whole_image((4, 4), 2, 3, 1).with_masking_args(2u32);
        let encoder = BitwiseEncoder2::new(&config, true).unwrap();
        let features = Tensor::zeros(1, 3 * 16).unwrap();
        let bits_only = Tensor::zeros(1, 3 * 16).unwrap();
        assert!(matches!(
            encoder.concat(&message(1, 2), &features, &bits_only),
            Err(EncoderError::ShapeMismatch {
                input: "fusion input",
                ..
            })
        ));
        let image_and_bits = Tensor::zeros(1, 6 * 16).unwrap();
        let concat = encoder
            .concat(&message(1, 2), &features, &image_and_bits)
            .unwrap();
        assert_eq!(concat.shape(), (1, (2 + 3 + 6) * 16));
    }

    #[test]
    fn direct_backward_matches_finite_differences() {
        let config = HiddenConfiguration::whole_image((3, 3), 2, 2, 1);
        let mut encoder = Encoder::new(&config).unwrap();
        encoder.eval();
        let x = image(1, (3, 3), 21);
        let m = message(1, 2);
        let weights = Tensor::random_uniform(1, 27, -1.0, 1.0, Some(5)).unwrap();
        let objective = |enc: &WatermarkEncoder, input: &Tensor, bits: &Tensor| -> f32 {
            let out = enc.forward(input, bits).unwrap();
            out.data().iter().zip(weights.data()).map(|(o, w)| o * w).sum()
        };
        let grads = encoder.backward(&x, &m, &weights).unwrap();
        assert_eq!(grads.message.shape(), (1, 2));
        let eps = 1e-3;
        let close = |numeric: f32, analytic: f32| (numeric - analytic).abs() < 2e-2 * (1.0 + numeric.abs());

        for index in [0usize, 4, 13, 26] {
            let mut plus = x.clone();
            plus.data_mut()[index] += eps;
            let mut minus = x.clone();
            minus.data_mut()[index] -= eps;
            let numeric =
                (objective(&encoder, &plus, &m) - objective(&encoder, &minus, &m)) / (2.0 * eps);
            let analytic = grads.image.data()[index];
            assert!(close(numeric, analytic), "image {index}: numeric {numeric} analytic {analytic}");
        }
        for index in 0..2 {
            let mut plus = m.clone();
            plus.data_mut()[index] += eps;
            let mut minus = m.clone();
            minus.data_mut()[index] -= eps;
            let numeric =
                (objective(&encoder, &x, &plus) - objective(&encoder, &x, &minus)) / (2.0 * eps);
            let analytic = grads.message.data()[index];
            assert!(close(numeric, analytic), "message {index}: numeric {numeric} analytic {analytic}");
        }
    }
}
