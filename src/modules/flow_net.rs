//! Flow network used by FlowLM to map noise to latent frames.
//!
//! A small MLP with adaptive layer normalization (AdaLN). Its conditioning is
//! the FlowLM hidden vector plus the mean of two time embeddings, one for the
//! start `s` and one for the end `t` of the interval being integrated by
//! [`crate::model::sampler::consistency_sample`].

use crate::modules::linear::{LayerNorm, Linear, ParamInit, RmsNorm};
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{activation::silu, backend::Backend, Tensor, TensorData as BurnTensorData};

/// Width of the sinusoidal time features fed to each timestep embedder.
const FREQUENCY_EMBEDDING_SIZE: usize = 256;
const TIME_MAX_PERIOD: f32 = 10000.0;

/// AdaLN modulation: `x * (1 + scale) + shift`.
fn modulate<B: Backend>(x: Tensor<B, 2>, shift: Tensor<B, 2>, scale: Tensor<B, 2>) -> Tensor<B, 2> {
    x.mul(scale.add_scalar(1.0)).add(shift)
}

/// Split a `[batch, N * width]` modulation row into its `N` parts.
fn split_modulation<B: Backend, const N: usize>(
    modulation: Tensor<B, 2>,
    width: usize,
) -> [Tensor<B, 2>; N] {
    std::array::from_fn(|part| modulation.clone().narrow(1, part * width, width))
}

/// Sinusoidal features of a time scalar, projected by a two-layer MLP and
/// RMS-normalized.
#[derive(Debug, Clone)]
pub struct TimestepEmbedder<B: Backend> {
    /// `[1, FREQUENCY_EMBEDDING_SIZE / 2]`, log-spaced.
    pub freqs: Tensor<B, 2>,
    pub proj_in: Linear<B>,
    pub proj_out: Linear<B>,
    pub norm: RmsNorm<B>,
}

impl<B: Backend> TimestepEmbedder<B> {
    pub fn new(hidden_size: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        let half = FREQUENCY_EMBEDDING_SIZE / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|i| TIME_MAX_PERIOD.powf(-(i as f32) / half as f32))
            .collect();
        Self {
            freqs: Tensor::from_data(BurnTensorData::new(freqs, [1, half]), device),
            proj_in: Linear::new(init, FREQUENCY_EMBEDDING_SIZE, hidden_size, true, device),
            proj_out: Linear::new(init, hidden_size, hidden_size, true, device),
            norm: RmsNorm::new(hidden_size, 1e-5, device),
        }
    }

    /// Embed a `[batch, 1]` column of times in `[0, 1]`.
    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 2> {
        let args = t.mul(self.freqs.clone());
        let embedding = Tensor::cat(vec![args.clone().cos(), args.sin()], 1);
        let hidden = silu(self.proj_in.forward(embedding));
        self.norm.forward(self.proj_out.forward(hidden))
    }
}

impl<B: Backend> Parameterized<B> for TimestepEmbedder<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.proj_in.visit_params(&param_name(prefix, "mlp.0"), visitor)?;
        self.proj_out.visit_params(&param_name(prefix, "mlp.2"), visitor)?;
        self.norm.visit_params(&param_name(prefix, "mlp.3"), visitor)
    }
}

/// Residual MLP block with AdaLN-style modulation.
#[derive(Debug, Clone)]
pub struct ResBlock<B: Backend> {
    pub channels: usize,
    pub norm: LayerNorm<B>,
    pub mlp_in: Linear<B>,
    pub mlp_out: Linear<B>,
    pub mod_linear: Linear<B>,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(channels: usize, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            channels,
            norm: LayerNorm::new(channels, 1e-6, true, device),
            mlp_in: Linear::new(init, channels, channels, true, device),
            mlp_out: Linear::new(init, channels, channels, true, device),
            mod_linear: Linear::new(init, channels, channels * 3, true, device),
        }
    }

    /// Forward pass with conditioning signal `y`.
    pub fn forward(&self, x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
        let [shift, scale, gate] =
            split_modulation(self.mod_linear.forward(silu(y)), self.channels);

        let h = modulate(self.norm.forward(x.clone()), shift, scale);
        let h = self.mlp_out.forward(silu(self.mlp_in.forward(h)));
        x.add(gate.mul(h))
    }
}

impl<B: Backend> Parameterized<B> for ResBlock<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.norm.visit_params(&param_name(prefix, "in_ln"), visitor)?;
        self.mlp_in.visit_params(&param_name(prefix, "mlp.0"), visitor)?;
        self.mlp_out.visit_params(&param_name(prefix, "mlp.2"), visitor)?;
        self.mod_linear
            .visit_params(&param_name(prefix, "adaLN_modulation.1"), visitor)
    }
}

/// Final projection layer for the flow network.
#[derive(Debug, Clone)]
pub struct FinalLayer<B: Backend> {
    pub model_channels: usize,
    pub norm: LayerNorm<B>,
    pub linear: Linear<B>,
    pub mod_linear: Linear<B>,
}

impl<B: Backend> FinalLayer<B> {
    pub fn new(
        model_channels: usize,
        out_channels: usize,
        init: &mut ParamInit,
        device: &B::Device,
    ) -> Self {
        Self {
            model_channels,
            norm: LayerNorm::new(model_channels, 1e-6, false, device),
            linear: Linear::new(init, model_channels, out_channels, true, device),
            mod_linear: Linear::new(init, model_channels, model_channels * 2, true, device),
        }
    }

    /// Forward pass with conditioning signal `y`.
    pub fn forward(&self, x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
        let [shift, scale] =
            split_modulation(self.mod_linear.forward(silu(y)), self.model_channels);
        self.linear
            .forward(modulate(self.norm.forward(x), shift, scale))
    }
}

impl<B: Backend> Parameterized<B> for FinalLayer<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.linear.visit_params(&param_name(prefix, "linear"), visitor)?;
        self.mod_linear
            .visit_params(&param_name(prefix, "adaLN_modulation.1"), visitor)
    }
}

#[derive(Debug, Clone)]
pub struct SimpleMlpAdaLnConfig {
    /// Latent width of the noise going in.
    pub in_channels: usize,
    pub model_channels: usize,
    /// Latent width of the flow coming out.
    pub out_channels: usize,
    /// Width of the FlowLM hidden vector used as condition.
    pub cond_channels: usize,
    pub num_res_blocks: usize,
}

impl SimpleMlpAdaLnConfig {
    pub fn new(
        in_channels: usize,
        model_channels: usize,
        out_channels: usize,
        cond_channels: usize,
        num_res_blocks: usize,
    ) -> Self {
        Self {
            in_channels,
            model_channels,
            out_channels,
            cond_channels,
            num_res_blocks,
        }
    }
}

/// Small MLP used as the flow network inside FlowLM.
///
/// It always takes two time conditions: the start `s` and end `t` of the
/// interval being integrated.
#[derive(Debug, Clone)]
pub struct SimpleMlpAdaLn<B: Backend> {
    pub time_embed: [TimestepEmbedder<B>; 2],
    pub cond_embed: Linear<B>,
    pub input_proj: Linear<B>,
    pub res_blocks: Vec<ResBlock<B>>,
    pub final_layer: FinalLayer<B>,
}

impl<B: Backend> SimpleMlpAdaLn<B> {
    pub fn new(config: &SimpleMlpAdaLnConfig, init: &mut ParamInit, device: &B::Device) -> Self {
        let time_embed = [
            TimestepEmbedder::new(config.model_channels, init, device),
            TimestepEmbedder::new(config.model_channels, init, device),
        ];
        let cond_embed = Linear::new(init, config.cond_channels, config.model_channels, true, device);
        let input_proj = Linear::new(init, config.in_channels, config.model_channels, true, device);
        let res_blocks = (0..config.num_res_blocks)
            .map(|_| ResBlock::new(config.model_channels, init, device))
            .collect();
        let final_layer =
            FinalLayer::new(config.model_channels, config.out_channels, init, device);

        Self {
            time_embed,
            cond_embed,
            input_proj,
            res_blocks,
            final_layer,
        }
    }

    /// Predict the flow direction for `x` over the interval `[s, t]`.
    pub fn forward(
        &self,
        c: Tensor<B, 2>,
        s: Tensor<B, 2>,
        t: Tensor<B, 2>,
        x: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let mut x = self.input_proj.forward(x);
        let t_combined = self.time_embed[0]
            .forward(s)
            .add(self.time_embed[1].forward(t))
            .div_scalar(2.0);
        let y = t_combined.add(self.cond_embed.forward(c));

        for block in &self.res_blocks {
            x = block.forward(x, y.clone());
        }

        self.final_layer.forward(x, y)
    }
}

impl<B: Backend> Parameterized<B> for SimpleMlpAdaLn<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        for (index, embedder) in self.time_embed.iter_mut().enumerate() {
            embedder.visit_params(&param_name(prefix, &format!("time_embed.{index}")), visitor)?;
        }
        self.cond_embed
            .visit_params(&param_name(prefix, "cond_embed"), visitor)?;
        self.input_proj
            .visit_params(&param_name(prefix, "input_proj"), visitor)?;
        for (index, block) in self.res_blocks.iter_mut().enumerate() {
            block.visit_params(&param_name(prefix, &format!("res_blocks.{index}")), visitor)?;
        }
        self.final_layer
            .visit_params(&param_name(prefix, "final_layer"), visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::export_state_dict;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn flow_net_shapes_and_names() {
        let device = NdArrayDevice::default();
        let config = SimpleMlpAdaLnConfig::new(4, 8, 4, 6, 2);
        let mut net = SimpleMlpAdaLn::<TestBackend>::new(&config, &mut ParamInit::new(1), &device);
        let c = Tensor::<TestBackend, 2>::ones([2, 6], &device);
        let s = Tensor::<TestBackend, 2>::zeros([2, 1], &device);
        let t = Tensor::<TestBackend, 2>::ones([2, 1], &device);
        let x = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        assert_eq!(net.forward(c, s, t, x).dims(), [2, 4]);

        let entries = export_state_dict(&mut net).expect("export");
        let names: Vec<&str> = entries.iter().map(|(name, _, _)| name.as_str()).collect();
        for expected in [
            "time_embed.1.mlp.3.alpha",
            "res_blocks.1.adaLN_modulation.1.weight",
            "res_blocks.0.in_ln.bias",
            "final_layer.linear.bias",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(!names.iter().any(|name| name.contains("norm_final")));
    }
}
