// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use wm_config::determinism;

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Two-dimensional convolution operating on `(batch, channels * height * width)` tensors.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        Self::with_seed(
            name,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            None,
        )
    }

    /// Builds the layer with uniform `±1/sqrt(fan_in)` initialisation. An
    /// explicit seed wins; otherwise the process determinism settings derive
    /// one from the layer name.
    #[allow(clippy::too_many_arguments)]
    pub fn with_seed(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "conv_in_channels")?;
        validate_positive(out_channels, "conv_out_channels")?;
        validate_positive(kernel.0, "conv_kernel_h")?;
        validate_positive(kernel.1, "conv_kernel_w")?;
        validate_positive(stride.0, "conv_stride_h")?;
        validate_positive(stride.1, "conv_stride_w")?;
        validate_positive(input_hw.0, "conv_input_height")?;
        validate_positive(input_hw.1, "conv_input_width")?;
        let name = name.into();
        let seed = seed.or_else(|| {
            let cfg = determinism::config();
            cfg.enabled.then(|| cfg.seed_for(name.as_str()))
        });
        let span = in_channels * kernel.0 * kernel.1;
        let bound = 1.0 / (span as f32).sqrt();
        let weight = Tensor::random_uniform(out_channels, span, -bound, bound, seed)?;
        let bias = Tensor::random_uniform(
            1,
            out_channels,
            -bound,
            bound,
            seed.map(|s| s.wrapping_add(1)),
        )?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Validate configuration by computing the output size once during construction.
        conv.output_hw()?;
        Ok(conv)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected_cols = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected_cols {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected_cols),
            });
        }
        Ok(batch)
    }

    /// Maps the kernel tap `(kh, kw)` of output position `(oh, ow)` onto the
    /// input plane, or `None` when it lands in the zero padding.
    fn source_index(&self, oh: usize, ow: usize, kh: usize, kw: usize) -> Option<usize> {
        let (h, w) = self.input_hw;
        let ih = (oh * self.stride.0 + kh) as isize - self.padding.0 as isize;
        let iw = (ow * self.stride.1 + kw) as isize - self.padding.1 as isize;
        if ih < 0 || iw < 0 || ih >= h as isize || iw >= w as isize {
            None
        } else {
            Some(ih as usize * w + iw as usize)
        }
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let plane = self.input_hw.0 * self.input_hw.1;
        {
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = input.row(b);
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let offset = (b * oh * ow + oh_idx * ow + ow_idx) * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(idx) = self.source_index(oh_idx, ow_idx, kh, kw) {
                                        column_data[offset + col_idx] = row[ic * plane + idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let plane = self.input_hw.0 * self.input_hw.1;
        let mut output = Tensor::zeros(batch, self.in_channels * plane)?;
        let output_cols = self.in_channels * plane;
        {
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let column_row = cols.row(b * oh * ow + oh_idx * ow + ow_idx);
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    if let Some(idx) = self.source_index(oh_idx, ow_idx, kh, kw) {
                                        grad_in_row[ic * plane + idx] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        debug_assert_eq!(cols.shape().1, kernel_elems);
        Ok(output)
    }

    /// Reorders `(batch, out_channels * oh * ow)` into `(batch * oh * ow, out_channels)`.
    fn grad_output_to_matrix(
        &self,
        grad_output: &Tensor,
        batch: usize,
        spatial: usize,
    ) -> PureResult<Tensor> {
        let mut matrix = Tensor::zeros(batch * spatial, self.out_channels)?;
        {
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = grad_output.row(b);
                for s in 0..spatial {
                    let offset = (b * spatial + s) * self.out_channels;
                    for oc in 0..self.out_channels {
                        matrix_data[offset + oc] = grad_row[oc * spatial + s];
                    }
                }
            }
        }
        Ok(matrix)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (oh, ow) = self.output_hw()?;
        let spatial = oh * ow;
        let patches = self.im2col(input, batch, oh, ow)?;
        let responses = patches.matmul(&self.weight.value().transpose())?;
        let bias = self.bias.value().data();
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        {
            let out_cols = self.out_channels * spatial;
            let out_data = out.data_mut();
            for b in 0..batch {
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for s in 0..spatial {
                    let response = responses.row(b * spatial + s);
                    for oc in 0..self.out_channels {
                        out_row[oc * spatial + s] = response[oc] + bias[oc];
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = self.grad_output_to_matrix(grad_output, batch, oh * ow)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        let grad_bias = Tensor::from_vec(1, self.out_channels, grad_matrix.sum_axis0())?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        let grad_input = self.col2im(&grad_patches, batch, oh, ow)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
        Ok(grad_input)
    }
}

impl Parameterized for Conv2d {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}
