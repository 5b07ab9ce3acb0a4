//! High-level model components for FlowLM, Mimi, and the combined TTS stack.
//!
//! FlowLM generates latent audio frames, the sampler refines noise into each
//! frame, Mimi decodes frames into waveforms, and `tts` drives one frame of
//! generation at a time.

pub mod flow_lm;
pub mod mimi;
pub mod sampler;
pub mod tts;
