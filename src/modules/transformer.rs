//! Causal streaming transformer shared by the language model and the decoder.
//!
//! Each layer is pre-norm: attention with rotary embeddings over a per-layer
//! key/value cache, then a GELU feed-forward block. LayerScale on both
//! residual branches is optional.

use crate::config::NormKind;
use crate::modules::layer_scale::LayerScale;
use crate::modules::linear::{LayerNorm, Linear, ParamInit, RmsNorm};
use crate::modules::rope::RotaryEmbedding;
use crate::modules::streaming_mha::{CausalAttention, KvCache};
use crate::state::{CacheLen, StreamingModule};
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Layer or RMS normalization, chosen by configuration.
#[derive(Debug, Clone)]
pub enum Norm<B: Backend> {
    /// LayerNorm with scale and shift.
    Layer(LayerNorm<B>),
    /// RMS normalization.
    Rms(RmsNorm<B>),
}

impl<B: Backend> Norm<B> {
    /// Build a unit-initialized norm of the requested kind.
    pub fn new(kind: NormKind, dim: usize, epsilon: f32, device: &B::Device) -> Self {
        match kind {
            NormKind::LayerNorm => Norm::Layer(LayerNorm::new(dim, epsilon, true, device)),
            NormKind::RmsNorm => Norm::Rms(RmsNorm::new(dim, epsilon, device)),
        }
    }

    /// Normalize across the last axis.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Norm::Layer(norm) => norm.forward(x),
            Norm::Rms(norm) => norm.forward(x),
        }
    }
}

impl<B: Backend> Parameterized<B> for Norm<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        match self {
            Norm::Layer(norm) => norm.visit_params(prefix, visitor),
            Norm::Rms(norm) => norm.visit_params(prefix, visitor),
        }
    }
}

/// Hyperparameters for one transformer layer.
#[derive(Debug, Clone)]
pub struct StreamingTransformerLayerConfig {
    pub d_model: usize,
    pub num_heads: usize,
    pub ffn_dim: usize,
    pub causal: bool,
    pub context: Option<usize>,
    pub rope_theta: f32,
    pub layer_scale: Option<f32>,
    pub norm: NormKind,
    pub norm_epsilon: f32,
}

impl Default for StreamingTransformerLayerConfig {
    fn default() -> Self {
        Self {
            d_model: 512,
            num_heads: 8,
            ffn_dim: 2048,
            causal: true,
            context: None,
            rope_theta: 10000.0,
            layer_scale: None,
            norm: NormKind::LayerNorm,
            norm_epsilon: 1e-5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingTransformerLayer<B: Backend> {
    pub num_heads: usize,
    pub head_dim: usize,
    pub in_proj: Linear<B>,
    pub out_proj: Linear<B>,
    pub norm1: Norm<B>,
    pub norm2: Norm<B>,
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
    pub layer_scale_1: Option<LayerScale<B>>,
    pub layer_scale_2: Option<LayerScale<B>>,
    pub rope: RotaryEmbedding,
    pub attention: CausalAttention,
}

#[derive(Debug, Clone)]
pub struct StreamingTransformerLayerState<B: Backend> {
    pub kv: KvCache<B>,
}

impl<B: Backend> StreamingTransformerLayer<B> {
    pub fn new(
        config: &StreamingTransformerLayerConfig,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        let d_model = config.d_model;
        let head_dim = d_model / config.num_heads;
        let layer_scale_1 = config
            .layer_scale
            .map(|value| LayerScale::new(d_model, value, device));
        let layer_scale_2 = config
            .layer_scale
            .map(|value| LayerScale::new(d_model, value, device));

        Self {
            num_heads: config.num_heads,
            head_dim,
            in_proj: Linear::new(init, d_model, d_model * 3, false, device),
            out_proj: Linear::new(init, d_model, d_model, false, device),
            norm1: Norm::new(config.norm, d_model, config.norm_epsilon, device),
            norm2: Norm::new(config.norm, d_model, config.norm_epsilon, device),
            linear1: Linear::new(init, d_model, config.ffn_dim, false, device),
            linear2: Linear::new(init, config.ffn_dim, d_model, false, device),
            layer_scale_1,
            layer_scale_2,
            rope: RotaryEmbedding::new(head_dim, config.rope_theta),
            attention: CausalAttention {
                head_dim,
                causal: config.causal,
                context: config.context,
            },
        }
    }

    /// Process `[batch, seq, d_model]` positions following the cached ones.
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        state: &mut StreamingTransformerLayerState<B>,
    ) -> Tensor<B, 3> {
        let residual = input.clone();
        let normalized = self.norm1.forward(input);
        let qkv = self.in_proj.forward(normalized);
        let (queries, keys, values) = self.split_qkv(qkv);

        let start = state.kv.next_position;
        let queries = self.rope.apply(queries, start);
        let keys = self.rope.apply(keys, start);

        let (keys, values) = state.kv.append(keys, values, self.attention.context);
        let attn = self.attention.attend(&state.kv, queries, keys, values);
        let attn = self.out_proj.forward(merge_heads(attn));
        let attn = match &self.layer_scale_1 {
            Some(scale) => scale.apply(attn),
            None => attn,
        };
        let hidden = residual.add(attn);

        let ffn = self.linear1.forward(self.norm2.forward(hidden.clone()));
        let ffn = self.linear2.forward(gelu(ffn));
        let ffn = match &self.layer_scale_2 {
            Some(scale) => scale.apply(ffn),
            None => ffn,
        };

        hidden.add(ffn)
    }

    fn split_qkv(&self, qkv: Tensor<B, 3>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let [batch, seq, _] = qkv.dims();
        let qkv = qkv.reshape([batch, seq, 3, self.num_heads, self.head_dim]);
        let pick = |index: usize| {
            qkv.clone()
                .narrow(2, index, 1)
                .reshape([batch, seq, self.num_heads, self.head_dim])
                .swap_dims(1, 2)
        };
        (pick(0), pick(1), pick(2))
    }
}

fn merge_heads<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, heads, seq, dim] = input.dims();
    input.swap_dims(1, 2).reshape([batch, seq, heads * dim])
}

impl<B: Backend> StreamingModule<B> for StreamingTransformerLayer<B> {
    type State = StreamingTransformerLayerState<B>;

    fn init_state(&self, _batch_size: usize) -> Self::State {
        StreamingTransformerLayerState {
            kv: KvCache::default(),
        }
    }
}

impl<B: Backend> Parameterized<B> for StreamingTransformerLayer<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.in_proj
            .visit_params(&param_name(prefix, "self_attn.in_proj"), visitor)?;
        self.out_proj
            .visit_params(&param_name(prefix, "self_attn.out_proj"), visitor)?;
        self.norm1.visit_params(&param_name(prefix, "norm1"), visitor)?;
        self.norm2.visit_params(&param_name(prefix, "norm2"), visitor)?;
        self.linear1
            .visit_params(&param_name(prefix, "linear1"), visitor)?;
        self.linear2
            .visit_params(&param_name(prefix, "linear2"), visitor)?;
        if let Some(scale) = self.layer_scale_1.as_mut() {
            scale.visit_params(&param_name(prefix, "layer_scale_1"), visitor)?;
        }
        if let Some(scale) = self.layer_scale_2.as_mut() {
            scale.visit_params(&param_name(prefix, "layer_scale_2"), visitor)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StreamingTransformerConfig {
    pub num_layers: usize,
    pub layer: StreamingTransformerLayerConfig,
}

#[derive(Debug, Clone)]
pub struct StreamingTransformer<B: Backend> {
    pub layers: Vec<StreamingTransformerLayer<B>>,
}

#[derive(Debug, Clone)]
pub struct StreamingTransformerState<B: Backend> {
    pub layers: Vec<StreamingTransformerLayerState<B>>,
}

impl<B: Backend> CacheLen for StreamingTransformerState<B> {
    fn cached_positions(&self) -> usize {
        self.layers
            .first()
            .map(|layer| layer.kv.cached_positions())
            .unwrap_or(0)
    }
}

impl<B: Backend> StreamingTransformer<B> {
    pub fn new(config: &StreamingTransformerConfig, init: &mut ParamInit, device: &B::Device) -> Self {
        let layers = (0..config.num_layers)
            .map(|_| StreamingTransformerLayer::new(&config.layer, init, device))
            .collect();
        Self { layers }
    }

    pub fn forward(
        &self,
        mut input: Tensor<B, 3>,
        state: &mut StreamingTransformerState<B>,
    ) -> Tensor<B, 3> {
        for (layer, layer_state) in self.layers.iter().zip(state.layers.iter_mut()) {
            input = layer.forward(input, layer_state);
        }
        input
    }
}

impl<B: Backend> StreamingModule<B> for StreamingTransformer<B> {
    type State = StreamingTransformerState<B>;

    fn init_state(&self, batch_size: usize) -> Self::State {
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.init_state(batch_size))
            .collect();
        StreamingTransformerState { layers }
    }
}

impl<B: Backend> Parameterized<B> for StreamingTransformer<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        for (index, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_params(&param_name(prefix, &format!("layers.{index}")), visitor)?;
        }
        Ok(())
    }
}
