//! End-to-end text-to-speech model orchestration.
//!
//! This module wires FlowLM (text-to-latent) and Mimi (latent-to-audio) into a
//! single model and drives one frame of generation at a time. The streaming
//! orchestrator in [`crate::engine`] owns the loop around [`TtsModel::next_frame`].

use crate::config::ModelConfig;
use crate::model::flow_lm::{FlowLmModel, FlowLmState};
use crate::model::mimi::{MimiDecoder, MimiState};
use crate::model::sampler::NoiseSampler;
use crate::modules::linear::ParamInit;
use crate::perf::{self, Metric};
use crate::state::{CacheLen, StreamingModule};
use crate::voice::VoiceEmbedding;
use crate::weights::{
    apply_state_dict, load_state_dict, param_name, ParamRef, ParamVisitor, Parameterized,
};
use anyhow::{bail, Result};
use burn::tensor::{backend::Backend, Tensor};
use std::path::Path;

/// Settings of one generation run, fixed when the state is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Consistency steps per frame.
    pub consistency_steps: usize,
    /// Frame ceiling for this utterance.
    pub max_frames: usize,
    /// Frames generated after end of sequence is first detected.
    pub frames_after_eos: usize,
    /// Logit above which a frame signals end of sequence.
    pub eos_threshold: f32,
}

/// Generation state for one utterance.
///
/// Holds the FlowLM key/value cache, the decoder's streaming buffers and the
/// noise source. It is created per session and dropped when the session ends.
pub struct TtsState<B: Backend> {
    pub flow_lm: FlowLmState<B>,
    pub mimi: MimiState<B>,
    noise: NoiseSampler,
    previous: Option<Tensor<B, 2>>,
    eos_step: Option<usize>,
    params: GenerationParams,
}

impl<B: Backend> TtsState<B> {
    /// Generation steps completed.
    pub fn steps(&self) -> usize {
        self.flow_lm.steps()
    }

    /// Step at which end of sequence was first detected.
    pub fn eos_step(&self) -> Option<usize> {
        self.eos_step
    }

    /// Parameters captured at creation.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// The frame ceiling was reached without an end-of-sequence signal.
    pub fn frame_cap_reached(&self) -> bool {
        self.eos_step.is_none() && self.steps() >= self.params.max_frames
    }
}

impl<B: Backend> CacheLen for TtsState<B> {
    fn cached_positions(&self) -> usize {
        self.flow_lm.cached_positions()
    }
}

/// PCM produced by one generation step.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Mono samples at the decoder's sample rate.
    pub samples: Vec<f32>,
    /// This is the last frame of the utterance.
    pub is_final: bool,
}

/// The main text-to-speech model combining FlowLM and Mimi components.
#[derive(Debug, Clone)]
pub struct TtsModel<B: Backend> {
    pub config: ModelConfig,
    pub flow_lm: FlowLmModel<B>,
    pub mimi: MimiDecoder<B>,
}

impl<B: Backend> TtsModel<B> {
    /// Build a model with seeded random weights.
    pub fn from_config(config: &ModelConfig, seed: u64, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let mut init = ParamInit::new(seed);
        let latent_dim = config.mimi.quantizer.dimension;
        let flow_lm = FlowLmModel::new(&config.flow_lm, latent_dim, &mut init, device);
        let mimi = MimiDecoder::new(&config.mimi, &mut init, device);
        Ok(Self {
            config: config.clone(),
            flow_lm,
            mimi,
        })
    }

    /// Build a model and load every parameter from a SafeTensors checkpoint.
    pub fn load(
        config: &ModelConfig,
        weights_path: impl AsRef<Path>,
        device: &B::Device,
    ) -> Result<Self> {
        let mut model = Self::from_config(config, 0, device)?;
        let state = load_state_dict(weights_path)?;
        apply_state_dict(&mut model, &state, device)?;
        Ok(model)
    }

    /// Output sample rate in Hz.
    pub fn sample_rate(&self) -> usize {
        self.mimi.sample_rate
    }

    /// Samples decoded per generated frame.
    pub fn samples_per_frame(&self) -> usize {
        self.mimi.samples_per_frame
    }

    /// Frame ceiling for a prompt of `token_count` tokens.
    ///
    /// Allows roughly three tokens per second of speech plus two seconds of
    /// slack, never above the configured `max_frames`.
    pub fn max_frames_for(&self, token_count: usize) -> usize {
        let seconds = token_count as f32 / 3.0 + 2.0;
        let frames = (seconds * self.config.mimi.frame_rate) as usize;
        frames.clamp(1, self.config.generation.max_frames)
    }

    /// Allocate a generation state and feed the voice and text prefix.
    pub fn init_state(
        &self,
        voice: &VoiceEmbedding<B>,
        tokens: &[u32],
        params: GenerationParams,
        noise: NoiseSampler,
    ) -> Result<TtsState<B>> {
        if tokens.is_empty() {
            bail!("cannot generate from an empty token sequence");
        }
        let width = voice.conditioning.dims()[2];
        if width != self.flow_lm.d_model {
            bail!(
                "voice {} has width {width}, model expects {}",
                voice.name,
                self.flow_lm.d_model
            );
        }
        let device = self.flow_lm.bos_emb.device();
        let text = self.flow_lm.conditioner.forward_tokens(tokens, &device)?;
        let prefix = Tensor::cat(vec![voice.conditioning.clone(), text], 1);

        let mut flow_lm = self.flow_lm.init_state(1);
        self.flow_lm.prefill(prefix, &mut flow_lm)?;
        perf::add_count(Metric::Tokens, tokens.len() as u64);

        Ok(TtsState {
            flow_lm,
            mimi: self.mimi.init_state(1),
            noise,
            previous: None,
            eos_step: None,
            params,
        })
    }

    /// Generate and decode the next frame.
    pub fn next_frame(&self, state: &mut TtsState<B>) -> Result<DecodedFrame> {
        if state.eos_step.is_some_and(|eos| state.steps() > eos + state.params.frames_after_eos) {
            bail!("generation already finished");
        }
        let step_index = state.steps();
        let step = self.flow_lm.step(
            state.previous.take(),
            &mut state.flow_lm,
            &mut state.noise,
            state.params.consistency_steps,
        )?;
        if state.eos_step.is_none() && step.eos_logit > state.params.eos_threshold {
            log::debug!("end of sequence at step {step_index} (logit {:.3})", step.eos_logit);
            state.eos_step = Some(step_index);
        }

        let latent = self.flow_lm.denormalize(step.latent.clone());
        let samples = self.mimi.decode_frame(latent, &mut state.mimi)?;
        state.previous = Some(step.latent);
        perf::add_count(Metric::Frames, 1);

        let is_final = state
            .eos_step
            .is_some_and(|eos| step_index >= eos + state.params.frames_after_eos);
        Ok(DecodedFrame { samples, is_final })
    }
}

impl<B: Backend> Parameterized<B> for TtsModel<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        self.flow_lm
            .visit_params(&param_name(prefix, "flow_lm"), visitor)?;
        self.mimi.visit_params(&param_name(prefix, "mimi"), visitor)
    }
}

/// Count scalar parameters of a module tree.
pub fn parameter_count<B: Backend, M: Parameterized<B>>(module: &mut M) -> Result<usize> {
    struct Counter(usize);
    impl<B: Backend> ParamVisitor<B> for Counter {
        fn visit(&mut self, _name: &str, param: ParamRef<'_, B>) -> Result<()> {
            self.0 += param.checkpoint_shape().iter().product::<usize>();
            Ok(())
        }
    }
    let mut counter = Counter(0);
    module.visit_params("", &mut counter)?;
    Ok(counter.0)
}
