// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Per-channel batch normalisation over `(batch, channels * height * width)`
/// tensors. Statistics are gathered across the batch and every spatial
/// position of a channel.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    plane: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    training: Cell<bool>,
}

impl BatchNorm2d {
    /// Creates a batch normalisation layer for `channels` planes of
    /// `input_hw` pixels.
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        input_hw: (usize, usize),
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        let plane = input_hw.0 * input_hw.1;
        if channels == 0 || plane == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: plane,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(1, channels, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, channels)?),
            name,
            channels,
            plane,
            epsilon,
            momentum,
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![1.0; channels]),
            training: Cell::new(true),
        })
    }

    /// Snapshot of the running mean and variance.
    pub fn running_stats(&self) -> (Vec<f32>, Vec<f32>) {
        (
            self.running_mean.borrow().clone(),
            self.running_var.borrow().clone(),
        )
    }

    fn buffer_names(&self) -> [(String, &RefCell<Vec<f32>>); 2] {
        [
            (format!("{}::running_mean", self.name), &self.running_mean),
            (format!("{}::running_var", self.name), &self.running_var),
        ]
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (rows, cols) = input.shape();
        if cols != self.channels * self.plane {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.channels * self.plane),
            });
        }
        Ok(rows)
    }

    /// Biased per-channel mean and variance of the batch.
    fn compute_stats(&self, input: &Tensor, batch: usize) -> (Vec<f32>, Vec<f32>) {
        let count = (batch * self.plane) as f32;
        let mut mean = vec![0.0f32; self.channels];
        let mut variance = vec![0.0f32; self.channels];
        for (c, m) in mean.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for b in 0..batch {
                sum += input.row(b)[c * self.plane..(c + 1) * self.plane]
                    .iter()
                    .sum::<f32>();
            }
            *m = sum / count;
        }
        for (c, v) in variance.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for b in 0..batch {
                for value in &input.row(b)[c * self.plane..(c + 1) * self.plane] {
                    let centered = value - mean[c];
                    sum += centered * centered;
                }
            }
            *v = sum / count;
        }
        (mean, variance)
    }

    fn update_running(&self, mean: &[f32], variance: &[f32], count: usize) {
        let correction = if count > 1 {
            count as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let mut running_mean = self.running_mean.borrow_mut();
        let mut running_var = self.running_var.borrow_mut();
        for c in 0..self.channels {
            running_mean[c] = self.momentum * mean[c] + (1.0 - self.momentum) * running_mean[c];
            running_var[c] =
                self.momentum * variance[c] * correction + (1.0 - self.momentum) * running_var[c];
        }
    }

    fn normalize(&self, input: &Tensor, track: bool) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (mean, variance) = if self.training.get() {
            let (mean, variance) = self.compute_stats(input, batch);
            if track {
                self.update_running(&mean, &variance, batch * self.plane);
            }
            (mean, variance)
        } else {
            self.running_stats()
        };
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut output = input.clone();
        let cols = self.channels * self.plane;
        let data = output.data_mut();
        for b in 0..batch {
            let row = &mut data[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
                for value in &mut row[c * self.plane..(c + 1) * self.plane] {
                    *value = (*value - mean[c]) * inv_std * gamma[c] + beta[c];
                }
            }
        }
        Ok(output)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalize(input, true)
    }

    fn forward_replay(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalize(input, false)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let cols = self.channels * self.plane;
        let mut grad_input = vec![0.0f32; batch * cols];
        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];
        let gamma = self.gamma.value().data();

        if !self.training.get() {
            // Frozen statistics turn the layer into a per-channel affine map.
            let (mean, variance) = self.running_stats();
            for b in 0..batch {
                for c in 0..self.channels {
                    let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
                    for p in 0..self.plane {
                        let idx = b * cols + c * self.plane + p;
                        let g = grad_output.data()[idx];
                        let normed = (input.data()[idx] - mean[c]) * inv_std;
                        grad_gamma[c] += g * normed;
                        grad_beta[c] += g;
                        grad_input[idx] = g * gamma[c] * inv_std;
                    }
                }
            }
        } else {
            let (mean, variance) = self.compute_stats(input, batch);
            let count = (batch * self.plane) as f32;
            for c in 0..self.channels {
                let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
                let mut sum_grad = 0.0f32;
                let mut sum_grad_norm = 0.0f32;
                for b in 0..batch {
                    for p in 0..self.plane {
                        let idx = b * cols + c * self.plane + p;
                        let normed = (input.data()[idx] - mean[c]) * inv_std;
                        let g = grad_output.data()[idx];
                        let g_gamma = g * gamma[c];
                        sum_grad += g_gamma;
                        sum_grad_norm += g_gamma * normed;
                        grad_gamma[c] += g * normed;
                        grad_beta[c] += g;
                    }
                }
                for b in 0..batch {
                    for p in 0..self.plane {
                        let idx = b * cols + c * self.plane + p;
                        let normed = (input.data()[idx] - mean[c]) * inv_std;
                        let g_gamma = grad_output.data()[idx] * gamma[c];
                        let term = (count * g_gamma - sum_grad - normed * sum_grad_norm) / count;
                        grad_input[idx] = term * inv_std;
                    }
                }
            }
        }

        self.gamma
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, grad_gamma)?)?;
        self.beta
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, grad_beta)?)?;
        Tensor::from_vec(batch, cols, grad_input)
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

impl Parameterized for BatchNorm2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        for (name, buffer) in self.buffer_names() {
            let tensor = Tensor::from_vec(1, self.channels, buffer.borrow().clone())?;
            visitor(&name, &tensor)?;
        }
        Ok(())
    }

    fn load_buffers(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        for (name, buffer) in self.buffer_names() {
            let Some(value) = state.get(&name) else {
                return Err(TensorError::MissingParameter { name });
            };
            if value.shape() != (1, self.channels) {
                return Err(TensorError::ShapeMismatch {
                    left: (1, self.channels),
                    right: value.shape(),
                });
            }
            buffer.borrow_mut().copy_from_slice(value.data());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_output_is_whitened_per_channel() {
        let bn = BatchNorm2d::new("bn", 2, (2, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(
            2,
            8,
            vec![
                1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0, //
                5.0, 6.0, 7.0, 8.0, 10.0, 10.0, 10.0, 10.0,
            ],
        )
        .unwrap();
        let output = bn.forward(&input).unwrap();
        let mut channel0 = Vec::new();
        for b in 0..2 {
            channel0.extend_from_slice(&output.row(b)[0..4]);
            // A constant channel collapses to beta.
            assert!(output.row(b)[4..8].iter().all(|v| v.abs() < 1e-3));
        }
        let mean: f32 = channel0.iter().sum::<f32>() / 8.0;
        let var: f32 = channel0.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);

        let (running_mean, _) = bn.running_stats();
        assert!((running_mean[0] - 0.45).abs() < 1e-5);
        assert!((running_mean[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn replay_does_not_touch_running_stats() {
        let bn = BatchNorm2d::new("bn", 1, (1, 2), 0.5, 1e-5).unwrap();
        let input = Tensor::from_vec(1, 2, vec![2.0, 4.0]).unwrap();
        let before = bn.running_stats();
        let replay = bn.forward_replay(&input).unwrap();
        assert_eq!(bn.running_stats(), before);
        let tracked = bn.forward(&input).unwrap();
        assert_eq!(replay, tracked);
        assert_ne!(bn.running_stats(), before);
    }

    #[test]
    fn eval_mode_uses_running_statistics() {
        let bn = BatchNorm2d::new("bn", 1, (1, 2), 0.1, 1e-5).unwrap();
        bn.set_training(false);
        let input = Tensor::from_vec(1, 2, vec![2.0, -3.0]).unwrap();
        let output = bn.forward(&input).unwrap();
        // Fresh running stats are mean 0 and variance 1.
        assert!(output.max_abs_diff(&input).unwrap() < 1e-4);
    }

    #[test]
    fn running_statistics_travel_with_the_state_dict() {
        let source = BatchNorm2d::new("bn", 2, (1, 2), 0.5, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 4, vec![1.0, 3.0, -2.0, 2.0, 5.0, 7.0, 0.0, 4.0]).unwrap();
        source.forward(&input).unwrap();
        let state = source.state_dict().unwrap();
        assert!(state.contains_key("bn::running_mean"));
        assert!(state.contains_key("bn::running_var"));

        let mut restored = BatchNorm2d::new("bn", 2, (1, 2), 0.5, 1e-5).unwrap();
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored.running_stats(), source.running_stats());
        source.set_training(false);
        restored.set_training(false);
        assert_eq!(restored.forward(&input).unwrap(), source.forward(&input).unwrap());

        let mut partial = state.clone();
        partial.remove("bn::running_var");
        assert!(matches!(
            restored.load_state_dict(&partial),
            Err(TensorError::MissingParameter { .. })
        ));
    }

    #[test]
    fn training_backward_sums_to_zero_per_channel() {
        let mut bn = BatchNorm2d::new("bn", 2, (2, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::random_normal(3, 8, 0.0, 2.0, Some(4)).unwrap();
        let grad_output = Tensor::random_normal(3, 8, 0.0, 1.0, Some(5)).unwrap();
        let grad_input = bn.backward(&input, &grad_output).unwrap();
        for c in 0..2 {
            let total: f32 = (0..3)
                .map(|b| grad_input.row(b)[c * 4..(c + 1) * 4].iter().sum::<f32>())
                .sum();
            assert!(total.abs() < 1e-4, "channel {c} gradient sum {total}");
        }
        assert!(bn.gamma.gradient().is_some());
        assert!(bn.beta.gradient().is_some());
    }
}
