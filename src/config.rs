//! Configuration types for the model architecture and for synthesis sessions.
//!
//! Architecture settings ([`ModelConfig`]) describe tensor shapes and are read
//! from an optional `config.yaml` inside the model directory using
//! [`load_model_config`]. When the file is absent the built-in layout of the
//! released pocket checkpoint is used.
//!
//! Session settings ([`EngineConfig`]) are set through
//! [`crate::Engine::configure`] and validated atomically.

use crate::audio::speed::{MAX_SPEED, MIN_SPEED};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Flow network configuration (dimensionality and depth).
pub struct FlowConfig {
    /// Hidden size inside the flow network.
    pub dim: usize,
    /// Number of residual blocks.
    pub depth: usize,
}

/// Normalization used by the language-model transformer layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// LayerNorm with learned scale and shift.
    LayerNorm,
    /// RMS normalization with a learned scale.
    RmsNorm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Transformer hyperparameters for the FlowLM backbone.
pub struct FlowLmTransformerConfig {
    /// Feed-forward expansion factor.
    pub hidden_scale: usize,
    /// RoPE base period.
    pub max_period: f32,
    /// Model width.
    pub d_model: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Normalization flavour for every layer and the output norm.
    #[serde(default = "default_norm")]
    pub norm: NormKind,
}

fn default_norm() -> NormKind {
    NormKind::LayerNorm
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Token embedding table settings.
pub struct LookupTableConfig {
    /// Embedding dimension for token IDs.
    pub dim: usize,
    /// Vocabulary size (number of bins).
    pub n_bins: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Full FlowLM configuration.
pub struct FlowLmConfig {
    /// Flow network configuration.
    pub flow: FlowConfig,
    /// Transformer configuration.
    pub transformer: FlowLmTransformerConfig,
    /// Text lookup-table configuration.
    pub lookup_table: LookupTableConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// SEANet decoder configuration.
pub struct SeanetConfig {
    /// Latent dimension entering the decoder.
    pub dimension: usize,
    /// Number of audio channels.
    pub channels: usize,
    /// Base number of convolutional filters.
    pub n_filters: usize,
    /// Residual layers per upsampling block.
    pub n_residual_layers: usize,
    /// Stride ratios, applied in order by the decoder.
    pub ratios: Vec<usize>,
    /// First convolution kernel size.
    pub kernel_size: usize,
    /// Residual block kernel size.
    pub residual_kernel_size: usize,
    /// Final convolution kernel size.
    pub last_kernel_size: usize,
    /// Dilation base for residual blocks.
    pub dilation_base: usize,
    /// Compression factor inside residual blocks.
    pub compress: usize,
}

impl SeanetConfig {
    /// Product of all stride ratios, i.e. samples produced per decoder input step.
    pub fn hop_length(&self) -> usize {
        self.ratios.iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Transformer settings used inside the waveform decoder.
pub struct MimiTransformerConfig {
    /// Model width.
    pub d_model: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Number of transformer layers.
    pub num_layers: usize,
    /// LayerScale initialization value.
    pub layer_scale: f32,
    /// Attention context length in positions.
    pub context: usize,
    /// RoPE base period.
    #[serde(default = "default_mimi_max_period")]
    pub max_period: f32,
    /// Feed-forward hidden size.
    pub dim_feedforward: usize,
}

fn default_mimi_max_period() -> f32 {
    10000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Latent projection settings.
pub struct QuantizerConfig {
    /// Latent dimension produced by the flow model.
    pub dimension: usize,
    /// Output dimension fed to the decoder transformer.
    pub output_dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Waveform decoder configuration.
pub struct MimiConfig {
    /// Audio sample rate in Hz.
    pub sample_rate: usize,
    /// Number of audio channels.
    pub channels: usize,
    /// Frame rate in Hz (latents per second).
    pub frame_rate: f32,
    /// SEANet decoder configuration.
    pub seanet: SeanetConfig,
    /// Transformer configuration.
    pub transformer: MimiTransformerConfig,
    /// Latent projection configuration.
    pub quantizer: QuantizerConfig,
}

impl MimiConfig {
    /// Rate of the SEANet input sequence in Hz.
    pub fn encoder_frame_rate(&self) -> f32 {
        self.sample_rate as f32 / self.seanet.hop_length() as f32
    }

    /// Stride of the latent upsampler.
    pub fn upsample_stride(&self) -> usize {
        (self.encoder_frame_rate() / self.frame_rate).round() as usize
    }

    /// Audio samples produced per generated latent frame.
    pub fn samples_per_frame(&self) -> usize {
        self.upsample_stride() * self.seanet.hop_length()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Generation loop and output settings that are not trained parameters.
pub struct GenerationConfig {
    /// Logit above which a frame is treated as end of sequence.
    #[serde(default = "default_eos_threshold")]
    pub eos_threshold: f32,
    /// Hard cap on generated frames for a single utterance.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Crossfade length applied between decoded frames, in milliseconds.
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: f32,
    /// Capacity of the bounded chunk channel used by streaming sessions.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

fn default_eos_threshold() -> f32 {
    -4.0
}

fn default_max_frames() -> usize {
    1500
}

fn default_crossfade_ms() -> f32 {
    5.0
}

fn default_stream_capacity() -> usize {
    4
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            eos_threshold: default_eos_threshold(),
            max_frames: default_max_frames(),
            crossfade_ms: default_crossfade_ms(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

/// Top-level model configuration.
///
/// # Example YAML
///
/// ```yaml
/// flow_lm:
///   flow: { dim: 512, depth: 6 }
///   transformer: { hidden_scale: 4, max_period: 10000, d_model: 1024, num_heads: 16, num_layers: 6 }
///   lookup_table: { dim: 1024, n_bins: 4000 }
/// mimi:
///   sample_rate: 24000
///   channels: 1
///   frame_rate: 12.5
///   # ... seanet, transformer, quantizer configs
/// generation:
///   eos_threshold: -4.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// FlowLM transformer configuration.
    pub flow_lm: FlowLmConfig,
    /// Waveform decoder configuration.
    pub mimi: MimiConfig,
    /// Generation loop settings.
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            flow_lm: FlowLmConfig {
                flow: FlowConfig {
                    dim: 512,
                    depth: 6,
                },
                transformer: FlowLmTransformerConfig {
                    hidden_scale: 4,
                    max_period: 10000.0,
                    d_model: 1024,
                    num_heads: 16,
                    num_layers: 6,
                    norm: NormKind::LayerNorm,
                },
                lookup_table: LookupTableConfig {
                    dim: 1024,
                    n_bins: 4000,
                },
            },
            mimi: MimiConfig {
                sample_rate: 24000,
                channels: 1,
                frame_rate: 12.5,
                seanet: SeanetConfig {
                    dimension: 512,
                    channels: 1,
                    n_filters: 64,
                    n_residual_layers: 1,
                    ratios: vec![6, 5, 4],
                    kernel_size: 7,
                    residual_kernel_size: 3,
                    last_kernel_size: 3,
                    dilation_base: 2,
                    compress: 2,
                },
                transformer: MimiTransformerConfig {
                    d_model: 512,
                    num_heads: 8,
                    num_layers: 2,
                    layer_scale: 0.01,
                    context: 250,
                    max_period: 10000.0,
                    dim_feedforward: 2048,
                },
                quantizer: QuantizerConfig {
                    dimension: 32,
                    output_dimension: 512,
                },
            },
            generation: GenerationConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let tr = &self.flow_lm.transformer;
        if tr.num_heads == 0 || tr.d_model % tr.num_heads != 0 {
            anyhow::bail!(
                "flow_lm d_model {} is not divisible by num_heads {}",
                tr.d_model,
                tr.num_heads
            );
        }
        if (tr.d_model / tr.num_heads) % 2 != 0 {
            anyhow::bail!("flow_lm head dimension must be even for rotary embeddings");
        }
        if self.flow_lm.lookup_table.dim != tr.d_model {
            anyhow::bail!(
                "lookup_table dim {} must match transformer d_model {}",
                self.flow_lm.lookup_table.dim,
                tr.d_model
            );
        }
        let mt = &self.mimi.transformer;
        if mt.num_heads == 0 || mt.d_model % mt.num_heads != 0 {
            anyhow::bail!(
                "mimi d_model {} is not divisible by num_heads {}",
                mt.d_model,
                mt.num_heads
            );
        }
        if (mt.d_model / mt.num_heads) % 2 != 0 {
            anyhow::bail!("mimi head dimension must be even for rotary embeddings");
        }
        if self.mimi.quantizer.output_dimension != mt.d_model
            || self.mimi.seanet.dimension != mt.d_model
        {
            anyhow::bail!("quantizer output, seanet dimension and mimi d_model must agree");
        }
        if self.mimi.seanet.ratios.is_empty() || self.mimi.seanet.ratios.contains(&0) {
            anyhow::bail!("seanet ratios must be non-empty and positive");
        }
        let exact = self.mimi.encoder_frame_rate() / self.mimi.frame_rate;
        if self.mimi.upsample_stride() == 0 || (exact - exact.round()).abs() > 1e-3 {
            anyhow::bail!(
                "encoder frame rate {} is not an integer multiple of frame rate {}",
                self.mimi.encoder_frame_rate(),
                self.mimi.frame_rate
            );
        }
        if self.generation.stream_capacity == 0 {
            anyhow::bail!("stream_capacity must be at least 1");
        }
        if self.generation.max_frames == 0 {
            anyhow::bail!("max_frames must be at least 1");
        }
        Ok(())
    }
}

/// Load a model configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist, contains invalid YAML, or
/// describes inconsistent shapes.
pub fn load_model_config(path: impl AsRef<Path>) -> anyhow::Result<ModelConfig> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: ModelConfig = serde_yaml::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

/// Per-session synthesis settings.
///
/// All fields are validated together by [`EngineConfig::validate`]; a rejected
/// configuration never partially applies.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Index into the loaded voice set.
    pub voice_index: usize,
    /// Variance of the sampling noise. Must be positive.
    pub temperature: f32,
    /// Nucleus mass kept by the noise truncation, in `(0, 1]`.
    pub top_p: f32,
    /// Playback speed factor, within `0.5..=2.0`.
    pub speed: f32,
    /// Number of consistency sampling steps per frame. Must be at least 1.
    pub consistency_steps: usize,
    /// Seed used when `use_fixed_seed` is set.
    pub seed: u64,
    /// Use `seed` for reproducible output instead of fresh entropy.
    pub use_fixed_seed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            voice_index: 0,
            temperature: 0.7,
            top_p: 0.9,
            speed: 1.0,
            consistency_steps: 2,
            seed: 42,
            use_fixed_seed: false,
        }
    }
}

impl EngineConfig {
    /// Single-step sampling for the lowest time to first audio.
    pub fn low_latency() -> Self {
        Self {
            consistency_steps: 1,
            ..Self::default()
        }
    }

    /// More sampling steps and a cooler temperature.
    pub fn high_quality() -> Self {
        Self {
            temperature: 0.5,
            consistency_steps: 4,
            ..Self::default()
        }
    }

    /// Validate every field, reporting the first violation.
    ///
    /// `voice_count` is the number of loaded voices; the voice index is only
    /// checked when it is known.
    pub fn validate(&self, voice_count: Option<usize>) -> Result<(), EngineError> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(EngineError::InvalidConfig(format!(
                "speed must be in [{MIN_SPEED}, {MAX_SPEED}], got {}",
                self.speed
            )));
        }
        if self.consistency_steps == 0 {
            return Err(EngineError::InvalidConfig(
                "consistency_steps must be at least 1".to_string(),
            ));
        }
        if let Some(count) = voice_count {
            if self.voice_index >= count {
                return Err(EngineError::VoiceNotFound {
                    index: self.voice_index,
                    available: count,
                });
            }
        }
        Ok(())
    }
}
