//! Error type returned by the public engine API.
//!
//! Internal layers propagate [`anyhow::Error`]; the engine maps those onto the
//! variants below at its boundary so callers can match on the failure kind.

use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by [`crate::Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// A model asset was missing, unreadable or had the wrong shape.
    #[error("failed to load model from {path}: {reason}")]
    ModelLoadFailed {
        /// Model directory or file that failed.
        path: PathBuf,
        /// Human readable cause.
        reason: String,
    },

    /// An operation other than `load` was called without a loaded model.
    #[error("no model is loaded")]
    ModelNotLoaded,

    /// The text could not be turned into tokens.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested voice index is outside the loaded voice set.
    #[error("voice index {index} not found ({available} voices available)")]
    VoiceNotFound {
        /// Requested index.
        index: usize,
        /// Number of loaded voices.
        available: usize,
    },

    /// A configuration field was outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The generation loop hit its frame cap without an end-of-sequence signal.
    #[error("generation stopped after {max_frames} frames without end of sequence")]
    GenerationOverflow {
        /// Frame cap that was reached.
        max_frames: usize,
    },

    /// A numerical step of inference or waveform decoding failed.
    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    /// Another synthesis session is already active on this engine.
    #[error("engine is busy with another synthesis session")]
    Busy,
}

impl EngineError {
    pub(crate) fn load_failed(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::ModelLoadFailed {
            path: path.into(),
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Self::DecodeFailed(format!("{err:#}"))
    }
}

/// Convenience alias for engine results.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
