// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use wm_tensor::{PureResult, Tensor, TensorError};

/// Replicates a `(batch, L)` message into `L` constant planes of `h × w`.
pub fn broadcast_message(message: &Tensor, (h, w): (usize, usize)) -> PureResult<Tensor> {
    let (batch, length) = message.shape();
    let plane = h * w;
    if plane == 0 {
        return Err(TensorError::InvalidDimensions { rows: h, cols: w });
    }
    let mut data = Vec::with_capacity(batch * length * plane);
    for b in 0..batch {
        for &bit in message.row(b) {
            data.extend(std::iter::repeat(bit).take(plane));
        }
    }
    Tensor::from_vec(batch, length * plane, data)
}

/// Sums a gradient over each broadcast plane, giving the `(batch, L)`
/// gradient of the message.
pub fn reduce_broadcast_grad(
    grad: &Tensor,
    message_length: usize,
    (h, w): (usize, usize),
) -> PureResult<Tensor> {
    let (batch, cols) = grad.shape();
    let plane = h * w;
    if plane == 0 || cols != message_length * plane {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, message_length * plane),
        });
    }
    let mut data = Vec::with_capacity(batch * message_length);
    for b in 0..batch {
        data.extend(grad.row(b).chunks(plane).map(|chunk| chunk.iter().sum::<f32>()));
    }
    Tensor::from_vec(batch, message_length, data)
}
