//! Streaming state helpers shared across the synthesis pipeline.
//!
//! Layers that keep per-utterance caches implement [`StreamingModule`]. The
//! state they hand out is owned by the session that requested it and dropped
//! when the session ends, so no cache outlives its utterance.

use burn::tensor::backend::Backend;

/// Trait implemented by streaming modules that keep per-request state.
pub trait StreamingModule<B: Backend> {
    /// Concrete state type for this module.
    type State;

    /// Allocate a fresh state for a given batch size.
    fn init_state(&self, batch_size: usize) -> Self::State;
}

/// Number of cached positions held by a layer, used for diagnostics.
pub trait CacheLen {
    /// Positions currently held.
    fn cached_positions(&self) -> usize;
}
