//! Playback speed by band-limited resampling.
//!
//! The waveform is resampled by `1 / speed` and played back at the original
//! rate, so duration scales with `1 / speed` (pitch moves with it). The
//! changer is streaming: feed decoded audio with [`SpeedChanger::process`] and
//! call [`SpeedChanger::finish`] once, after which exactly
//! `round(total_in / speed)` samples have been returned.

use crate::perf::{self, Metric};
use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input samples handed to the resampler per call.
const CHUNK_SIZE: usize = 1024;

/// Speeds this close to 1 skip resampling entirely.
const BYPASS_TOLERANCE: f32 = 0.01;

/// Slowest accepted speed. The resampler's output buffer grows with
/// `1 / speed`, so it must stay bounded.
pub const MIN_SPEED: f32 = 0.5;
/// Fastest accepted speed.
pub const MAX_SPEED: f32 = 2.0;

pub struct SpeedChanger {
    resampler: Option<SincFixedIn<f32>>,
    ratio: f64,
    pending: Vec<f32>,
    ready: Vec<f32>,
    delay: usize,
    input_total: usize,
    emitted: usize,
}

impl SpeedChanger {
    pub fn new(speed: f32) -> Result<Self> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            anyhow::bail!("speed must be in [{MIN_SPEED}, {MAX_SPEED}], got {speed}");
        }
        let ratio = 1.0 / speed as f64;
        let resampler = if (speed - 1.0).abs() < BYPASS_TOLERANCE {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            Some(
                SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_SIZE, 1)
                    .context("building speed resampler")?,
            )
        };
        let delay = resampler.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            resampler,
            ratio,
            pending: Vec::new(),
            ready: Vec::new(),
            delay,
            input_total: 0,
            emitted: 0,
        })
    }

    /// Resampling is skipped for this speed.
    pub fn is_bypass(&self) -> bool {
        self.resampler.is_none()
    }

    /// Output length for `input` samples.
    pub fn output_len(&self, input: usize) -> usize {
        if self.is_bypass() {
            input
        } else {
            (input as f64 * self.ratio).round() as usize
        }
    }

    /// Feed decoded audio and return whatever output is available.
    ///
    /// Output lags input by the resampler's filter delay; the remainder comes
    /// out of [`SpeedChanger::finish`].
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.input_total += samples.len();
        let Some(resampler) = self.resampler.as_mut() else {
            self.emitted += samples.len();
            return Ok(samples.to_vec());
        };
        let _span = perf::span(Metric::SpeedResample);
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let out = resampler
                .process(&[chunk], None)
                .context("resampling audio")?;
            Self::collect(&mut self.ready, &mut self.delay, out);
        }
        // Never run ahead of what the input seen so far can justify.
        let limit = ((self.input_total as f64 * self.ratio).floor() as usize)
            .saturating_sub(self.emitted)
            .min(self.ready.len());
        self.emitted += limit;
        Ok(self.ready.drain(..limit).collect())
    }

    /// Flush the resampler and return the final samples.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let target = self.output_len(self.input_total);
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        let _span = perf::span(Metric::SpeedResample);
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            let out = resampler
                .process_partial(Some(&[chunk]), None)
                .context("resampling final audio")?;
            Self::collect(&mut self.ready, &mut self.delay, out);
        }
        // Push silence through until the filter delay has drained.
        let mut guard = 0;
        while self.emitted + self.ready.len() < target && guard < 8 {
            let out = resampler
                .process_partial::<Vec<f32>>(None, None)
                .context("flushing speed resampler")?;
            Self::collect(&mut self.ready, &mut self.delay, out);
            guard += 1;
        }

        let remaining = target.saturating_sub(self.emitted);
        self.ready.resize(remaining, 0.0);
        self.emitted += remaining;
        Ok(std::mem::take(&mut self.ready))
    }

    fn collect(ready: &mut Vec<f32>, delay: &mut usize, out: Vec<Vec<f32>>) {
        let Some(channel) = out.into_iter().next() else {
            return;
        };
        let skip = (*delay).min(channel.len());
        *delay -= skip;
        ready.extend_from_slice(&channel[skip..]);
    }
}

/// Apply `speed` to a whole buffer.
pub fn apply_speed(samples: &[f32], speed: f32) -> Result<Vec<f32>> {
    let mut changer = SpeedChanger::new(speed)?;
    let mut out = changer.process(samples)?;
    out.extend(changer.finish()?);
    Ok(out)
}
