// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! `nn.Module` style building blocks for the watermark encoder.
//!
//! Every layer consumes and produces channel-major `(batch, C * H * W)`
//! tensors, keeps its learnable state in named [`Parameter`]s and exposes a
//! manual `backward` that accumulates Euclidean gradients.

pub mod io;
pub mod layers;
pub mod module;

pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::activation::Relu;
pub use layers::conv::Conv2d;
pub use layers::conv_bn_relu::ConvBnRelu;
pub use layers::normalization::BatchNorm2d;
pub use layers::sequential::Sequential;
pub use module::{Module, Parameter, Parameterized};

pub use wm_tensor::{PureResult, Tensor, TensorError};
