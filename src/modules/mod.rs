//! Low-level neural network building blocks.
//!
//! These modules implement attention, convolutions, and the specialized blocks
//! used by FlowLM and the waveform decoder. Layers that run incrementally keep
//! their caches in explicit state values rather than in the module.

pub mod dummy_quantizer;
pub mod flow_net;
pub mod layer_scale;
pub mod linear;
pub mod resample;
pub mod rope;
pub mod seanet;
pub mod streaming_conv;
pub mod streaming_mha;
pub mod transformer;
