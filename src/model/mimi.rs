//! Waveform decoder: latent frames to PCM.
//!
//! One latent frame goes through the quantizer's output projection, a
//! learned transposed-convolution upsampler to the encoder frame rate, a
//! windowed causal transformer and the SEANet convolutional decoder. Every
//! stage streams, so decoding frame by frame matches decoding the sequence.

use crate::config::{MimiConfig, NormKind};
use crate::modules::dummy_quantizer::DummyQuantizer;
use crate::modules::linear::ParamInit;
use crate::modules::resample::{ConvTrUpsample1d, ConvTrUpsample1dState};
use crate::modules::seanet::{SeanetDecoder, SeanetState};
use crate::modules::transformer::{
    StreamingTransformer, StreamingTransformerConfig, StreamingTransformerLayerConfig,
    StreamingTransformerState,
};
use crate::perf::{self, Metric};
use crate::state::StreamingModule;
use crate::weights::{param_name, ParamVisitor, Parameterized};
use anyhow::{bail, Result};
use burn::tensor::{backend::Backend, Tensor};

/// Streaming buffers of every decoder stage.
#[derive(Debug)]
pub struct MimiState<B: Backend> {
    pub upsample: ConvTrUpsample1dState<B>,
    pub transformer: StreamingTransformerState<B>,
    pub decoder: SeanetState<B>,
    frames: usize,
}

impl<B: Backend> MimiState<B> {
    /// Latent frames decoded so far.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

#[derive(Debug, Clone)]
pub struct MimiDecoder<B: Backend> {
    pub quantizer: DummyQuantizer<B>,
    pub upsample: ConvTrUpsample1d<B>,
    pub decoder_transformer: StreamingTransformer<B>,
    pub decoder: SeanetDecoder<B>,
    pub sample_rate: usize,
    pub samples_per_frame: usize,
}

impl<B: Backend> MimiDecoder<B> {
    pub fn new(config: &MimiConfig, init: &mut ParamInit, device: &B::Device) -> Self {
        let tr = &config.transformer;
        let decoder_transformer = StreamingTransformer::new(
            &StreamingTransformerConfig {
                num_layers: tr.num_layers,
                layer: StreamingTransformerLayerConfig {
                    d_model: tr.d_model,
                    num_heads: tr.num_heads,
                    ffn_dim: tr.dim_feedforward,
                    causal: true,
                    context: Some(tr.context),
                    rope_theta: tr.max_period,
                    layer_scale: Some(tr.layer_scale),
                    norm: NormKind::LayerNorm,
                    norm_epsilon: 1e-5,
                },
            },
            init,
            device,
        );

        Self {
            quantizer: DummyQuantizer::new(
                config.quantizer.dimension,
                config.quantizer.output_dimension,
                init,
                device,
            ),
            upsample: ConvTrUpsample1d::new(config.upsample_stride(), tr.d_model, init, device),
            decoder_transformer,
            decoder: SeanetDecoder::new(&config.seanet, init, device),
            sample_rate: config.sample_rate,
            samples_per_frame: config.samples_per_frame(),
        }
    }

    /// Decode one latent frame `[1, latent_dim]` into `samples_per_frame`
    /// mono samples.
    pub fn decode_frame(&self, latent: Tensor<B, 2>, state: &mut MimiState<B>) -> Result<Vec<f32>> {
        let _span = perf::span(Metric::MimiDecodeFrame);
        let projected = self.quantizer.forward(latent.unsqueeze_dim::<3>(2));
        let upsampled = self.upsample.forward(projected, &mut state.upsample);
        let hidden = self
            .decoder_transformer
            .forward(upsampled.swap_dims(1, 2), &mut state.transformer)
            .swap_dims(1, 2);
        let audio = self.decoder.forward(hidden, &mut state.decoder)?;

        let [_, channels, samples] = audio.dims();
        if channels != 1 {
            bail!("decoder produced {channels} channels, expected mono");
        }
        let samples_out = audio
            .reshape([samples])
            .into_data()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("reading decoded audio: {err:?}"))?;
        if samples_out.iter().any(|v| !v.is_finite()) {
            bail!("decoder produced non-finite samples at frame {}", state.frames);
        }
        state.frames += 1;
        Ok(samples_out)
    }
}

impl<B: Backend> StreamingModule<B> for MimiDecoder<B> {
    type State = MimiState<B>;

    fn init_state(&self, batch_size: usize) -> MimiState<B> {
        MimiState {
            upsample: self.upsample.init_state(batch_size),
            transformer: self.decoder_transformer.init_state(batch_size),
            decoder: self.decoder.init_state(batch_size),
            frames: 0,
        }
    }
}

impl<B: Backend> Parameterized<B> for MimiDecoder<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.quantizer
            .visit_params(&param_name(prefix, "quantizer"), visitor)?;
        self.upsample
            .visit_params(&param_name(prefix, "upsample"), visitor)?;
        self.decoder_transformer
            .visit_params(&param_name(prefix, "decoder_transformer"), visitor)?;
        self.decoder
            .visit_params(&param_name(prefix, "decoder"), visitor)
    }
}
