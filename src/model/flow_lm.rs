//! FlowLM: the autoregressive latent language model.
//!
//! A causal transformer reads the voice conditioning and the embedded text
//! once, then produces one hidden vector per generated frame. Each hidden
//! vector yields an end-of-sequence logit and, through the flow network, the
//! next latent frame, which is fed back as the following step's input.

use crate::conditioner::text::LutConditioner;
use crate::config::FlowLmConfig;
use crate::model::sampler::{consistency_sample, NoiseSampler};
use crate::modules::flow_net::{SimpleMlpAdaLn, SimpleMlpAdaLnConfig};
use crate::modules::linear::{Linear, ParamInit};
use crate::modules::transformer::{
    Norm, StreamingTransformer, StreamingTransformerConfig, StreamingTransformerLayerConfig,
    StreamingTransformerState,
};
use crate::perf::{self, Metric};
use crate::state::{CacheLen, StreamingModule};
use crate::weights::{param_name, ParamRef, ParamVisitor, Parameterized};
use anyhow::{bail, Result};
use burn::tensor::{backend::Backend, ElementConversion, Tensor};

/// Per-utterance generation cache.
#[derive(Debug)]
pub struct FlowLmState<B: Backend> {
    pub transformer: StreamingTransformerState<B>,
    prefix_len: usize,
    steps: usize,
}

impl<B: Backend> FlowLmState<B> {
    /// Generation steps completed since the prefix was consumed.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Conditioning positions (voice and text) held ahead of the steps.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }
}

impl<B: Backend> CacheLen for FlowLmState<B> {
    fn cached_positions(&self) -> usize {
        self.transformer.cached_positions()
    }
}

/// Output of one generation step.
#[derive(Debug, Clone)]
pub struct FlowLmStep<B: Backend> {
    /// Normalized latent `[1, latent_dim]`, fed back as the next input.
    pub latent: Tensor<B, 2>,
    /// End-of-sequence logit.
    pub eos_logit: f32,
}

#[derive(Debug, Clone)]
pub struct FlowLmModel<B: Backend> {
    pub conditioner: LutConditioner<B>,
    pub input_linear: Linear<B>,
    pub transformer: StreamingTransformer<B>,
    pub out_norm: Norm<B>,
    pub out_eos: Linear<B>,
    pub flow_net: SimpleMlpAdaLn<B>,
    /// Learned input for the first generation step `[latent_dim]`.
    pub bos_emb: Tensor<B, 1>,
    /// Latent statistics used to map normalized latents back to decoder scale.
    pub emb_mean: Tensor<B, 1>,
    pub emb_std: Tensor<B, 1>,
    pub d_model: usize,
    pub latent_dim: usize,
}

impl<B: Backend> FlowLmModel<B> {
    pub fn new(
        config: &FlowLmConfig,
        latent_dim: usize,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let tr = &config.transformer;
        let d_model = tr.d_model;
        let transformer = StreamingTransformer::new(
            &StreamingTransformerConfig {
                num_layers: tr.num_layers,
                layer: StreamingTransformerLayerConfig {
                    d_model,
                    num_heads: tr.num_heads,
                    ffn_dim: d_model * tr.hidden_scale,
                    causal: true,
                    context: None,
                    rope_theta: tr.max_period,
                    layer_scale: None,
                    norm: tr.norm,
                    norm_epsilon: 1e-5,
                },
            },
            init,
            device,
        );
        let flow_net = SimpleMlpAdaLn::new(
            &SimpleMlpAdaLnConfig::new(
                latent_dim,
                config.flow.dim,
                latent_dim,
                d_model,
                config.flow.depth,
            ),
            init,
            device,
        );

        Self {
            conditioner: LutConditioner::new(
                config.lookup_table.n_bins,
                config.lookup_table.dim,
                init,
                device,
            ),
            input_linear: Linear::new(init, latent_dim, d_model, false, device),
            transformer,
            out_norm: Norm::new(tr.norm, d_model, 1e-5, device),
            out_eos: Linear::new(init, d_model, 1, true, device),
            flow_net,
            bos_emb: init.uniform([latent_dim], 1.0, device),
            emb_mean: Tensor::zeros([latent_dim], device),
            emb_std: Tensor::ones([latent_dim], device),
            d_model,
            latent_dim,
        }
    }

    /// Feed the conditioning prefix `[1, positions, d_model]` into the cache.
    pub fn prefill(&self, prefix: Tensor<B, 3>, state: &mut FlowLmState<B>) -> Result<()> {
        let _span = perf::span(Metric::FlowLmPrefill);
        let [_, positions, dim] = prefix.dims();
        if dim != self.d_model {
            bail!("conditioning width {dim} does not match d_model {}", self.d_model);
        }
        if state.steps > 0 {
            bail!("prefill after generation has started");
        }
        self.transformer.forward(prefix, &mut state.transformer);
        state.prefix_len += positions;
        Ok(())
    }

    /// Run one autoregressive step.
    ///
    /// `previous` is the normalized latent of the previous step, or `None` on
    /// the first step.
    pub fn step(
        &self,
        previous: Option<Tensor<B, 2>>,
        state: &mut FlowLmState<B>,
        noise: &mut NoiseSampler,
        consistency_steps: usize,
    ) -> Result<FlowLmStep<B>> {
        let _span = perf::span(Metric::FlowLmStep);
        let device = self.bos_emb.device();
        let input = match previous {
            Some(latent) => latent,
            None => self.bos_emb.clone().unsqueeze_dim::<2>(0),
        };
        let hidden = self
            .input_linear
            .forward(input.unsqueeze_dim::<3>(1));
        let hidden = self.transformer.forward(hidden, &mut state.transformer);
        let hidden = self.out_norm.forward(hidden);
        let [batch, seq, dim] = hidden.dims();
        let hidden: Tensor<B, 2> = hidden.narrow(1, seq - 1, 1).reshape([batch, dim]);

        let eos_logit: f32 = self
            .out_eos
            .forward(hidden.clone())
            .into_scalar()
            .elem();
        if !eos_logit.is_finite() {
            bail!("non-finite end-of-sequence logit at step {}", state.steps);
        }

        let noise = noise.tensor::<B>([batch, self.latent_dim], &device);
        let latent = consistency_sample(&self.flow_net, hidden, noise, consistency_steps);
        state.steps += 1;
        Ok(FlowLmStep { latent, eos_logit })
    }

    /// Map a normalized latent `[batch, latent_dim]` to decoder scale.
    pub fn denormalize(&self, latent: Tensor<B, 2>) -> Tensor<B, 2> {
        latent
            .mul(self.emb_std.clone().unsqueeze_dim::<2>(0))
            .add(self.emb_mean.clone().unsqueeze_dim::<2>(0))
    }
}

impl<B: Backend> StreamingModule<B> for FlowLmModel<B> {
    type State = FlowLmState<B>;

    fn init_state(&self, batch_size: usize) -> FlowLmState<B> {
        FlowLmState {
            transformer: self.transformer.init_state(batch_size),
            prefix_len: 0,
            steps: 0,
        }
    }
}

impl<B: Backend> Parameterized<B> for FlowLmModel<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.conditioner
            .visit_params(&param_name(prefix, "conditioner"), visitor)?;
        self.input_linear
            .visit_params(&param_name(prefix, "input_linear"), visitor)?;
        self.transformer
            .visit_params(&param_name(prefix, "transformer"), visitor)?;
        self.out_norm
            .visit_params(&param_name(prefix, "out_norm"), visitor)?;
        self.out_eos
            .visit_params(&param_name(prefix, "out_eos"), visitor)?;
        self.flow_net
            .visit_params(&param_name(prefix, "flow_net"), visitor)?;
        visitor.visit(&param_name(prefix, "bos_emb"), ParamRef::Vector(&mut self.bos_emb))?;
        visitor.visit(&param_name(prefix, "emb_mean"), ParamRef::Vector(&mut self.emb_mean))?;
        visitor.visit(&param_name(prefix, "emb_std"), ParamRef::Vector(&mut self.emb_std))
    }
}
