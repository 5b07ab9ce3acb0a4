//! Audio post-processing and output helpers.
//!
//! These helpers sit between the waveform decoder and the caller: blending
//! decoded frames, applying the playback speed, and encoding PCM for files or
//! byte buffers.

pub mod blend;
pub mod io;
pub mod speed;
