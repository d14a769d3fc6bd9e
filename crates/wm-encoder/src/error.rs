// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::config::ConfigError;
use thiserror::Error;
use wm_tensor::TensorError;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("invalid encoder configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{input} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        input: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type EncoderResult<T> = Result<T, EncoderError>;
