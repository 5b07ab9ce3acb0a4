//! # pocket-engine - CPU-only streaming text-to-speech
//!
//! An on-device speech engine: text goes in, mono PCM comes out, with no
//! network access and no GPU.
//!
//! ## Architecture Overview
//!
//! 1. **Tokenizer** ([`TextTokenizer`]): normalizes the prompt and maps it to
//!    subword token ids.
//!
//! 2. **Voice store** ([`VoiceStore`]): precomputed conditioning sequences,
//!    one per voice, loaded once and shared read-only.
//!
//! 3. **FlowLM**: a causal transformer with rotary positions and a key/value
//!    cache. It reads the voice and text once, then emits one hidden vector
//!    per frame together with an end-of-sequence logit.
//!
//! 4. **Consistency sampler**: refines Gaussian noise into a latent frame in
//!    a few steps, conditioned on the hidden vector.
//!
//! 5. **Waveform decoder**: transposed-convolution upsampling, a windowed
//!    transformer and a SEANet decoder turn each latent frame into PCM.
//!
//! 6. **Engine** ([`Engine`]): owns the model, runs one session at a time,
//!    blends frames, applies speed and delivers audio in batch or as a
//!    bounded stream with cooperative cancellation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pocket_engine::{CpuEngine, EngineConfig};
//!
//! let mut engine = CpuEngine::cpu();
//! engine.load("model")?;
//! engine.configure(EngineConfig {
//!     use_fixed_seed: true,
//!     ..EngineConfig::default()
//! })?;
//!
//! let result = engine.synthesize("Hello, world!")?;
//! println!("{:.2}s at {} Hz", result.duration_seconds, result.sample_rate);
//! # Ok::<(), pocket_engine::EngineError>(())
//! ```
//!
//! ## Streaming
//!
//! ```no_run
//! # use pocket_engine::CpuEngine;
//! # let mut engine = CpuEngine::cpu();
//! # engine.load("model")?;
//! for chunk in engine.synthesize_streaming("Streaming starts before the sentence ends.")? {
//!     let chunk = chunk?;
//!     println!("chunk {} with {} samples", chunk.sequence_number, chunk.audio.len());
//!     if chunk.is_last {
//!         break;
//!     }
//! }
//! # Ok::<(), pocket_engine::EngineError>(())
//! ```
//!
//! ## Model directory
//!
//! `load` expects `model.safetensors`, `tokenizer.model` or `tokenizer.json`,
//! and `voices/<name>.safetensors`. An optional `config.yaml` overrides the
//! architecture; see [`ModelConfig`].

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod perf;
pub mod voice;

// Internal modules - exposed for integration tests but not part of stable API.
#[doc(hidden)]
pub mod conditioner;
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;
#[doc(hidden)]
pub mod state;
#[doc(hidden)]
pub mod weights;

pub use conditioner::text::TextTokenizer;
pub use config::{load_model_config, EngineConfig, ModelConfig};
pub use engine::{
    AudioChunk, AudioStream, CacheStats, CancelHandle, CpuEngine, Engine, EngineState,
    SessionOutcome, SynthesisResult,
};
pub use engine::version;
pub use error::EngineError;
pub use model::tts::TtsModel;
pub use voice::{VoiceInfo, VoiceStore};
