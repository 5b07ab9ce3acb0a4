//! SEANet waveform decoder.
//!
//! A causal convolutional stack: an input convolution, then one block per
//! stride ratio (ELU, transposed-convolution upsampling that halves the
//! channel count, residual units), then ELU and an output convolution down to
//! the audio channels. Every convolution streams, so decoding one latent step
//! at a time yields the same samples as decoding the whole sequence.

use crate::config::SeanetConfig;
use crate::modules::linear::ParamInit;
use crate::modules::streaming_conv::{
    StreamingConv1dOp, StreamingConvConfig, StreamingConvState, StreamingConvTranspose1dOp,
};
use crate::state::StreamingModule;
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

fn elu<B: Backend>(input: Tensor<B, 3>, alpha: f32) -> Tensor<B, 3> {
    let mask = input.clone().greater_equal_elem(0.0);
    let neg = input.clone().exp().sub_scalar(1.0).mul_scalar(alpha);
    neg.mask_where(mask, input)
}

/// Residual unit: `x + conv(elu(conv(elu(x))))`.
#[derive(Debug, Clone)]
pub struct SeanetResnetBlock<B: Backend> {
    pub convs: Vec<StreamingConv1dOp<B>>,
}

#[derive(Debug, Clone)]
pub struct SeanetResnetBlockState<B: Backend> {
    convs: Vec<StreamingConvState<B>>,
}

impl<B: Backend> SeanetResnetBlock<B> {
    fn new(
        dim: usize,
        hidden: usize,
        kernel_size: usize,
        dilation: usize,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let convs = vec![
            StreamingConv1dOp::init(
                StreamingConvConfig::new(kernel_size, 1, dilation),
                dim,
                hidden,
                true,
                init,
                device,
            ),
            StreamingConv1dOp::init(
                StreamingConvConfig::new(1, 1, 1),
                hidden,
                dim,
                true,
                init,
                device,
            ),
        ];
        Self { convs }
    }

    fn init_state(&self, batch_size: usize) -> SeanetResnetBlockState<B> {
        SeanetResnetBlockState {
            convs: self
                .convs
                .iter()
                .map(|conv| conv.init_state(batch_size))
                .collect(),
        }
    }

    fn forward(&self, input: Tensor<B, 3>, state: &mut SeanetResnetBlockState<B>) -> Tensor<B, 3> {
        let mut value = input.clone();
        for (conv, conv_state) in self.convs.iter().zip(state.convs.iter_mut()) {
            value = conv.forward(conv_state, elu(value, 1.0));
        }
        input + value
    }
}

#[derive(Debug, Clone)]
pub enum SeanetLayer<B: Backend> {
    Elu,
    Conv1d(StreamingConv1dOp<B>),
    ConvTranspose1d(StreamingConvTranspose1dOp<B>),
    ResBlock(SeanetResnetBlock<B>),
}

#[derive(Debug, Clone)]
pub enum SeanetLayerState<B: Backend> {
    None,
    Conv1d(StreamingConvState<B>),
    ConvTranspose1d(StreamingConvState<B>),
    ResBlock(SeanetResnetBlockState<B>),
}

#[derive(Debug, Clone)]
pub struct SeanetState<B: Backend> {
    layers: Vec<SeanetLayerState<B>>,
}

#[derive(Debug, Clone)]
pub struct SeanetDecoder<B: Backend> {
    pub layers: Vec<SeanetLayer<B>>,
}

impl<B: Backend> SeanetDecoder<B> {
    /// Build the layer stack described by `config`.
    pub fn new(config: &SeanetConfig, init: &mut ParamInit, device: &B::Device) -> Self {
        let mut mult = 1usize << config.ratios.len();
        let mut layers = vec![SeanetLayer::Conv1d(StreamingConv1dOp::init(
            StreamingConvConfig::new(config.kernel_size, 1, 1),
            config.dimension,
            mult * config.n_filters,
            true,
            init,
            device,
        ))];

        for &ratio in &config.ratios {
            let channels = mult * config.n_filters;
            let out_channels = channels / 2;
            layers.push(SeanetLayer::Elu);
            layers.push(SeanetLayer::ConvTranspose1d(StreamingConvTranspose1dOp::init(
                StreamingConvConfig::new(ratio * 2, ratio, 1),
                channels,
                out_channels,
                true,
                init,
                device,
            )));
            let hidden = out_channels / config.compress.max(1);
            let mut dilation = 1;
            for _ in 0..config.n_residual_layers {
                layers.push(SeanetLayer::ResBlock(SeanetResnetBlock::new(
                    out_channels,
                    hidden,
                    config.residual_kernel_size,
                    dilation,
                    init,
                    device,
                )));
                dilation *= config.dilation_base;
            }
            mult /= 2;
        }

        layers.push(SeanetLayer::Elu);
        layers.push(SeanetLayer::Conv1d(StreamingConv1dOp::init(
            StreamingConvConfig::new(config.last_kernel_size, 1, 1),
            config.n_filters,
            config.channels,
            true,
            init,
            device,
        )));

        Self { layers }
    }

    /// Decode `[batch, dimension, steps]` into `[batch, channels, steps * hop]`.
    pub fn forward(
        &self,
        mut input: Tensor<B, 3>,
        state: &mut SeanetState<B>,
    ) -> Result<Tensor<B, 3>> {
        for (layer, layer_state) in self.layers.iter().zip(state.layers.iter_mut()) {
            input = apply_layer(layer, layer_state, input)?;
        }
        Ok(input)
    }
}

impl<B: Backend> StreamingModule<B> for SeanetDecoder<B> {
    type State = SeanetState<B>;

    fn init_state(&self, batch_size: usize) -> SeanetState<B> {
        let layers = self
            .layers
            .iter()
            .map(|layer| match layer {
                SeanetLayer::Elu => SeanetLayerState::None,
                SeanetLayer::Conv1d(conv) => SeanetLayerState::Conv1d(conv.init_state(batch_size)),
                SeanetLayer::ConvTranspose1d(conv) => {
                    SeanetLayerState::ConvTranspose1d(conv.init_state(batch_size))
                }
                SeanetLayer::ResBlock(block) => {
                    SeanetLayerState::ResBlock(block.init_state(batch_size))
                }
            })
            .collect();
        SeanetState { layers }
    }
}

impl<B: Backend> Parameterized<B> for SeanetDecoder<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        for (index, layer) in self.layers.iter_mut().enumerate() {
            let layer_prefix = param_name(prefix, &format!("layers.{index}"));
            match layer {
                SeanetLayer::Elu => {}
                SeanetLayer::Conv1d(conv) => {
                    conv.visit_params(&param_name(&layer_prefix, "conv"), visitor)?
                }
                SeanetLayer::ConvTranspose1d(conv) => {
                    conv.visit_params(&param_name(&layer_prefix, "conv_transpose"), visitor)?
                }
                SeanetLayer::ResBlock(block) => {
                    for (conv_index, conv) in block.convs.iter_mut().enumerate() {
                        conv.visit_params(
                            &param_name(&layer_prefix, &format!("resblock.{conv_index}")),
                            visitor,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn apply_layer<B: Backend>(
    layer: &SeanetLayer<B>,
    state: &mut SeanetLayerState<B>,
    input: Tensor<B, 3>,
) -> Result<Tensor<B, 3>> {
    match (layer, state) {
        (SeanetLayer::Elu, _) => Ok(elu(input, 1.0)),
        (SeanetLayer::Conv1d(conv), SeanetLayerState::Conv1d(state)) => {
            Ok(conv.forward(state, input))
        }
        (SeanetLayer::ConvTranspose1d(conv), SeanetLayerState::ConvTranspose1d(state)) => {
            Ok(conv.forward(state, input))
        }
        (SeanetLayer::ResBlock(block), SeanetLayerState::ResBlock(state)) => {
            Ok(block.forward(input, state))
        }
        _ => Err(anyhow::anyhow!("Seanet layer/state mismatch")),
    }
}
