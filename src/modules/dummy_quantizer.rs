//! Latent projection in front of the waveform decoder.
//!
//! The codec's vector quantizer is not needed to synthesize: generated
//! latents skip code lookup and only go through the quantizer's output
//! projection, a 1x1 convolution from the latent width to the decoder width.

use crate::modules::linear::ParamInit;
use crate::weights::{param_name, ParamRef, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{backend::Backend, module::conv1d, ops::ConvOptions, Tensor};

/// Quantizer output projection implemented as a 1x1 convolution.
#[derive(Debug, Clone)]
pub struct DummyQuantizer<B: Backend> {
    /// Convolution weights with shape `[out, in, 1]`.
    pub weight: Tensor<B, 3>,
}

impl<B: Backend> DummyQuantizer<B> {
    pub fn new(
        latent_dim: usize,
        output_dim: usize,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        Self {
            weight: init.fan_in([output_dim, latent_dim, 1], latent_dim, device),
        }
    }

    /// Project `[batch, latent_dim, steps]` to `[batch, output_dim, steps]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        conv1d(
            input,
            self.weight.clone(),
            None,
            ConvOptions::new([1], [0], [1], 1),
        )
    }
}

impl<B: Backend> Parameterized<B> for DummyQuantizer<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "weight"), ParamRef::Kernel(&mut self.weight))
    }
}
