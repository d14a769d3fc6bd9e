// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Learned image watermark encoders.
//!
//! [`WatermarkEncoder`] embeds a message vector into an RGB batch. Three
//! constructors select how the network output turns into pixels:
//!
//! * [`Encoder`] uses the projection directly, optionally masked.
//! * [`BitwiseEncoder`] only rewrites the low bits of each 8-bit intensity,
//!   steering them relative to the bit-floored input.
//! * [`BitwiseEncoder2`] learns the low bits from the discarded bit residual.
//!
//! Images are `(batch, 3 * H * W)` channel-major tensors and messages are
//! `(batch, L)`.

pub mod config;
pub mod encoder;
pub mod error;
pub mod message;
pub mod normalize;
pub mod policy;
pub mod quantize;

pub use config::{ConfigError, Frame, HiddenConfiguration, MaskSpec, MaskingArgs, BLOCK_SIDE};
pub use encoder::{BitwiseEncoder, BitwiseEncoder2, Encoder, InputGradients, WatermarkEncoder};
pub use error::{EncoderError, EncoderResult};
pub use message::{broadcast_message, reduce_broadcast_grad};
pub use normalize::ChannelNormalize;
pub use policy::{Mask, PerturbationPolicy, PolicyKind, BIT_CHANGE_TEMPERATURE};
pub use quantize::{to_int_tensor, BitPlane, ByteImage};

pub use wm_config::tracing::init_tracing;
pub use wm_nn::{Module, Parameterized};
pub use wm_tensor::Tensor;
