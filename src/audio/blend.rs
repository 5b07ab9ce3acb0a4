//! Linear crossfade between consecutive decoded frames.
//!
//! Each frame's head is faded in against the tail kept from the previous
//! frame. Frames keep their length, so a session that decodes `n` frames of
//! `k` samples always yields `n * k` samples.

/// Streaming overlap-add joiner.
#[derive(Debug, Clone)]
pub struct OverlapAdd {
    overlap: usize,
    tail: Vec<f32>,
}

impl OverlapAdd {
    /// Joiner blending over `overlap` samples. Zero disables blending.
    pub fn new(overlap: usize) -> Self {
        Self {
            overlap,
            tail: Vec::new(),
        }
    }

    /// Joiner for a crossfade of `millis` at `sample_rate`.
    pub fn from_millis(millis: f32, sample_rate: usize) -> Self {
        let overlap = (sample_rate as f32 * millis.max(0.0) / 1000.0).round() as usize;
        Self::new(overlap)
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Blend `frame` with the previous tail and return it, same length.
    pub fn push(&mut self, mut frame: Vec<f32>) -> Vec<f32> {
        let fade = self.overlap.min(self.tail.len()).min(frame.len());
        if fade > 0 {
            let tail = &self.tail[self.tail.len() - fade..];
            for (idx, (sample, previous)) in frame.iter_mut().zip(tail).enumerate() {
                let gain = idx as f32 / fade as f32;
                *sample = previous * (1.0 - gain) + *sample * gain;
            }
        }

        let keep = self.overlap.min(frame.len());
        self.tail.clear();
        self.tail.extend_from_slice(&frame[frame.len() - keep..]);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_passes_through() {
        let mut blend = OverlapAdd::new(4);
        let frame: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(blend.push(frame.clone()), frame);
    }

    #[test]
    fn head_fades_from_previous_tail() {
        let mut blend = OverlapAdd::new(4);
        blend.push(vec![1.0; 8]);
        let out = blend.push(vec![0.0; 8]);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[..4], &[1.0, 0.75, 0.5, 0.25]);
        assert!(out[4..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn length_is_preserved_across_frames() {
        let mut blend = OverlapAdd::from_millis(5.0, 1600);
        assert_eq!(blend.overlap(), 8);
        let total: usize = (0..5).map(|_| blend.push(vec![0.3; 128]).len()).sum();
        assert_eq!(total, 5 * 128);
    }

    #[test]
    fn short_frames_blend_partially() {
        let mut blend = OverlapAdd::new(10);
        blend.push(vec![1.0; 3]);
        let out = blend.push(vec![0.0; 2]);
        assert_eq!(out, vec![1.0, 0.5]);
    }

    #[test]
    fn zero_overlap_is_identity() {
        let mut blend = OverlapAdd::new(0);
        blend.push(vec![1.0; 4]);
        assert_eq!(blend.push(vec![0.5; 4]), vec![0.5; 4]);
    }
}
