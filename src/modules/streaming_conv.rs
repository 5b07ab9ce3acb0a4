//! Streaming-friendly causal 1D convolution primitives.
//!
//! These operators keep a small history buffer so they can process audio in
//! chunks while producing the same result as one causal convolution over the
//! whole sequence.

use crate::modules::linear::ParamInit;
use crate::weights::{param_name, ParamRef, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{
    backend::Backend,
    module::{conv1d, conv_transpose1d},
    ops::{ConvOptions, ConvTransposeOptions},
    Tensor,
};

/// Streaming convolution state (history buffer).
#[derive(Debug, Clone)]
pub struct StreamingConvState<B: Backend> {
    /// Cached input (conv) or pending output tail (transposed conv).
    pub history: Option<Tensor<B, 3>>,
}

impl<B: Backend> Default for StreamingConvState<B> {
    fn default() -> Self {
        Self { history: None }
    }
}

/// Configuration for streaming convolution ops.
#[derive(Debug, Clone)]
pub struct StreamingConvConfig {
    /// Kernel size in samples.
    pub kernel_size: usize,
    /// Stride in samples.
    pub stride: usize,
    /// Dilation factor.
    pub dilation: usize,
    /// Number of groups.
    pub groups: usize,
}

impl Default for StreamingConvConfig {
    /// Default to a 1x1 convolution.
    fn default() -> Self {
        Self {
            kernel_size: 1,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

impl StreamingConvConfig {
    /// Convenience constructor for an ungrouped convolution.
    pub fn new(kernel_size: usize, stride: usize, dilation: usize) -> Self {
        Self {
            kernel_size,
            stride,
            dilation,
            groups: 1,
        }
    }

    fn effective_kernel(&self) -> usize {
        self.dilation * self.kernel_size.saturating_sub(1) + 1
    }
}

/// Causal 1D convolution with streaming support.
///
/// The first chunk is left-padded with zeros, so the output for `n` input
/// samples has `n / stride` samples.
#[derive(Debug, Clone)]
pub struct StreamingConv1dOp<B: Backend> {
    /// Convolution config.
    pub config: StreamingConvConfig,
    /// Weight tensor `[out, in / groups, kernel]`.
    pub weight: Tensor<B, 3>,
    /// Optional bias `[out]`.
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> StreamingConv1dOp<B> {
    /// Create a new streaming conv op.
    pub fn new(
        config: StreamingConvConfig,
        weight: Tensor<B, 3>,
        bias: Option<Tensor<B, 1>>,
    ) -> Self {
        Self {
            config,
            weight,
            bias,
        }
    }

    /// Create a randomly initialized op.
    pub fn init(
        config: StreamingConvConfig,
        in_channels: usize,
        out_channels: usize,
        with_bias: bool,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let per_group = in_channels / config.groups;
        let fan_in = per_group * config.kernel_size;
        let weight = init.fan_in([out_channels, per_group, config.kernel_size], fan_in, device);
        let bias = with_bias.then(|| init.fan_in([out_channels], fan_in, device));
        Self::new(config, weight, bias)
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1] * self.config.groups
    }

    /// Fresh state whose history is the zero left-padding of a causal conv.
    pub fn init_state(&self, batch_size: usize) -> StreamingConvState<B> {
        let keep = self
            .config
            .effective_kernel()
            .saturating_sub(self.config.stride);
        let history = (keep > 0).then(|| {
            Tensor::zeros(
                [batch_size, self.in_channels(), keep],
                &self.weight.device(),
            )
        });
        StreamingConvState { history }
    }

    /// Apply convolution to a streaming chunk, updating history.
    pub fn forward(&self, state: &mut StreamingConvState<B>, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, _, input_len] = input.dims();
        if input_len == 0 {
            let out_channels = self.weight.dims()[0];
            return Tensor::zeros([batch, out_channels, 0], &input.device());
        }

        let extended = match state.history.take() {
            Some(history) => Tensor::cat(vec![history, input], 2),
            None => input,
        };

        let output = conv1d(
            extended.clone(),
            self.weight.clone(),
            self.bias.clone(),
            ConvOptions::new(
                [self.config.stride],
                [0],
                [self.config.dilation],
                self.config.groups,
            ),
        );

        let extended_len = extended.dims()[2];
        let effective = self.config.effective_kernel();
        // Keep every sample the next window still needs.
        let consumed = if extended_len >= effective {
            ((extended_len - effective) / self.config.stride + 1) * self.config.stride
        } else {
            0
        };
        let keep = extended_len - consumed;
        state.history = (keep > 0).then(|| extended.narrow(2, consumed, keep));

        output
    }
}

impl<B: Backend> Parameterized<B> for StreamingConv1dOp<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "weight"), ParamRef::Kernel(&mut self.weight))?;
        if let Some(bias) = self.bias.as_mut() {
            visitor.visit(&param_name(prefix, "bias"), ParamRef::Vector(bias))?;
        }
        Ok(())
    }
}

/// 1D transposed convolution with streaming support.
///
/// Each chunk of `n` inputs emits `n * stride` samples; the overlapping tail
/// of `kernel - stride` samples is held back and added to the next chunk.
#[derive(Debug, Clone)]
pub struct StreamingConvTranspose1dOp<B: Backend> {
    /// Convolution config.
    pub config: StreamingConvConfig,
    /// Weight tensor `[in, out / groups, kernel]`.
    pub weight: Tensor<B, 3>,
    /// Optional bias `[out]`.
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> StreamingConvTranspose1dOp<B> {
    /// Create a new streaming transposed conv op.
    pub fn new(
        config: StreamingConvConfig,
        weight: Tensor<B, 3>,
        bias: Option<Tensor<B, 1>>,
    ) -> Self {
        Self {
            config,
            weight,
            bias,
        }
    }

    /// Create a randomly initialized op.
    pub fn init(
        config: StreamingConvConfig,
        in_channels: usize,
        out_channels: usize,
        with_bias: bool,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let per_group = out_channels / config.groups;
        let fan_in = per_group * config.kernel_size;
        let weight = init.fan_in([in_channels, per_group, config.kernel_size], fan_in, device);
        let bias = with_bias.then(|| init.fan_in([out_channels], fan_in, device));
        Self::new(config, weight, bias)
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[1] * self.config.groups
    }

    /// Fresh state with no pending tail.
    pub fn init_state(&self, _batch_size: usize) -> StreamingConvState<B> {
        StreamingConvState::default()
    }

    /// Apply transposed convolution to a streaming chunk.
    pub fn forward(&self, state: &mut StreamingConvState<B>, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, _, input_len] = input.dims();
        if input_len == 0 {
            return Tensor::zeros([batch, self.out_channels(), 0], &input.device());
        }

        let output = conv_transpose1d(
            input,
            self.weight.clone(),
            self.bias.clone(),
            ConvTransposeOptions::new(
                [self.config.stride],
                [0],
                [0],
                [self.config.dilation],
                self.config.groups,
            ),
        );

        let output = match state.history.take() {
            Some(history) => {
                let hist_len = history.dims()[2];
                let total = output.dims()[2];
                let head = output.clone().narrow(2, 0, hist_len).add(history);
                Tensor::cat(vec![head, output.narrow(2, hist_len, total - hist_len)], 2)
            }
            None => output,
        };

        let emit_len = input_len * self.config.stride;
        let total_len = output.dims()[2];
        let tail_len = total_len.saturating_sub(emit_len);
        if tail_len > 0 {
            let tail = output.clone().narrow(2, emit_len, tail_len);
            // The bias is added once per output sample, on the chunk that emits it.
            let tail = match &self.bias {
                Some(bias) => {
                    let out_channels = bias.dims()[0];
                    tail.sub(bias.clone().reshape([1, out_channels, 1]))
                }
                None => tail,
            };
            state.history = Some(tail);
        }

        output.narrow(2, 0, emit_len.min(total_len))
    }
}

impl<B: Backend> Parameterized<B> for StreamingConvTranspose1dOp<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "weight"), ParamRef::Kernel(&mut self.weight))?;
        if let Some(bias) = self.bias.as_mut() {
            visitor.visit(&param_name(prefix, "bias"), ParamRef::Vector(bias))?;
        }
        Ok(())
    }
}
