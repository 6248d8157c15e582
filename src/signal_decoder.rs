use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::blocks::{conv1x1, conv3x3, ResidualBlock};
use crate::config::SignalDecoderConfig;
use crate::error::Result;

/// Deterministic map from the signal code to a single-channel image estimate.
#[derive(Module, Debug)]
pub struct SignalDecoder<B: Backend> {
    input: Conv2d<B>,
    blocks: Vec<ResidualBlock<B>>,
    output: Conv2d<B>,
}

impl<B: Backend> SignalDecoder<B> {
    pub fn new(config: &SignalDecoderConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_channels;
        Ok(Self {
            input: conv3x3([config.s_code_channels, hidden], device),
            blocks: (0..config.n_res_blocks)
                .map(|_| ResidualBlock::new(hidden, device))
                .collect(),
            output: conv1x1([hidden, 1], device),
        })
    }

    pub fn forward(&self, signal_code: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = activation::silu(self.input.forward(signal_code));
        for block in &self.blocks {
            h = block.forward(h);
        }
        self.output.forward(h)
    }
}
