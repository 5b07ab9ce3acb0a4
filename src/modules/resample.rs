//! Latent-rate upsampling in front of the decoder transformer.

use crate::modules::linear::ParamInit;
use crate::modules::streaming_conv::{
    StreamingConvConfig, StreamingConvState, StreamingConvTranspose1dOp,
};
use crate::state::StreamingModule;
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

/// Depthwise transposed convolution with kernel `2 * stride` and no bias.
#[derive(Debug, Clone)]
pub struct ConvTrUpsample1d<B: Backend> {
    pub conv: StreamingConvTranspose1dOp<B>,
}

#[derive(Debug, Clone)]
pub struct ConvTrUpsample1dState<B: Backend> {
    pub conv: StreamingConvState<B>,
}

impl<B: Backend> ConvTrUpsample1d<B> {
    pub fn new(stride: usize, channels: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        let config = StreamingConvConfig {
            kernel_size: 2 * stride,
            stride,
            dilation: 1,
            groups: channels,
        };
        Self {
            conv: StreamingConvTranspose1dOp::init(config, channels, channels, false, init, device),
        }
    }

    /// Upsampling factor.
    pub fn stride(&self) -> usize {
        self.conv.config.stride
    }

    /// Map `[batch, channels, n]` to `[batch, channels, n * stride]`.
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        state: &mut ConvTrUpsample1dState<B>,
    ) -> Tensor<B, 3> {
        self.conv.forward(&mut state.conv, input)
    }
}

impl<B: Backend> StreamingModule<B> for ConvTrUpsample1d<B> {
    type State = ConvTrUpsample1dState<B>;

    fn init_state(&self, batch_size: usize) -> Self::State {
        ConvTrUpsample1dState {
            conv: self.conv.init_state(batch_size),
        }
    }
}

impl<B: Backend> Parameterized<B> for ConvTrUpsample1d<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.conv.visit_params(&param_name(prefix, "conv"), visitor)
    }
}
