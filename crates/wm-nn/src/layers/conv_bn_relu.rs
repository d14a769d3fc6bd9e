// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::activation::Relu;
use super::conv::Conv2d;
use super::normalization::BatchNorm2d;
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor};
use std::collections::HashMap;

const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1e-5;

/// 3×3 convolution (stride 1, padding 1) followed by batch norm and ReLU.
///
/// Spatial size is preserved, so stacks of these blocks can be fed
/// concatenations of feature maps and broadcast side information directly.
#[derive(Debug)]
pub struct ConvBnRelu {
    conv: Conv2d,
    norm: BatchNorm2d,
    activation: Relu,
}

impl ConvBnRelu {
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        let conv = Conv2d::new(
            format!("{name}.conv"),
            in_channels,
            out_channels,
            (3, 3),
            (1, 1),
            (1, 1),
            input_hw,
        )?;
        let norm = BatchNorm2d::new(
            format!("{name}.bn"),
            out_channels,
            input_hw,
            BN_MOMENTUM,
            BN_EPSILON,
        )?;
        Ok(Self {
            conv,
            norm,
            activation: Relu::new(),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

impl Module for ConvBnRelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let conv_out = self.conv.forward(input)?;
        let norm_out = self.norm.forward(&conv_out)?;
        self.activation.forward(&norm_out)
    }

    fn forward_replay(&self, input: &Tensor) -> PureResult<Tensor> {
        let conv_out = self.conv.forward(input)?;
        let norm_out = self.norm.forward_replay(&conv_out)?;
        self.activation.forward(&norm_out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let conv_out = self.conv.forward(input)?;
        let norm_out = self.norm.forward_replay(&conv_out)?;
        let grad = self.activation.backward(&norm_out, grad_output)?;
        let grad = self.norm.backward(&conv_out, &grad)?;
        self.conv.backward(input, &grad)
    }

    fn set_training(&self, training: bool) {
        self.norm.set_training(training);
    }
}

impl Parameterized for ConvBnRelu {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)?;
        self.norm.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)?;
        self.norm.visit_parameters_mut(visitor)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm.visit_buffers(visitor)
    }

    fn load_buffers(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.norm.load_buffers(state)
    }
}
