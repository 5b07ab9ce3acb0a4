//! Text conditioning for the FlowLM model.
//!
//! Turns prompts into token IDs and embeds them into the transformer's input
//! space.

pub mod text;
