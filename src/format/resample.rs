//! Streaming sample rate conversion.
//!
//! The resampler keeps its fractional read position and the last consumed
//! frame between calls, so a signal fed in arbitrary block sizes produces
//! the same output as one fed in a single block. Positions are tracked in
//! integer units of `1 / dst_rate` input frames, which keeps long-running
//! streams free of drift.

use super::round_to_16_frames;
use crate::ResamplerError;

/// Largest supported up- or down-sampling factor.
const MAX_RATIO: u32 = 256;

/// Interpolation quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Sample-and-hold. Cheapest, audible aliasing.
    Fast,
    /// Linear interpolation between neighbouring frames.
    #[default]
    Default,
}

/// Stateful interleaved 16-bit resampler.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::format::{Quality, Resampler};
///
/// let mut resampler = Resampler::create(48000, 8000, 1, Quality::Default).unwrap();
/// let input = vec![0i16; 480];
/// let mut output = vec![0i16; 96];
///
/// let mut in_frames = 480;
/// let mut out_frames = 96;
/// resampler.process(&input, &mut in_frames, &mut output, &mut out_frames);
/// assert_eq!(in_frames, 480);
/// assert_eq!(out_frames, 80);
/// ```
#[derive(Debug, Clone)]
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    quality: Quality,
    /// Position of the next output frame relative to the first frame of the
    /// next input block, in `1 / dst_rate` frame units. Never below `-dst_rate`.
    phase: i64,
    /// Last consumed input frame (index -1 of the next block).
    history: Vec<i16>,
}

impl Resampler {
    /// Creates a resampler for the given rate pair and channel count.
    ///
    /// # Errors
    ///
    /// Fails when a rate or the channel count is zero, or when the ratio
    /// exceeds 256 in either direction.
    pub fn create(
        src_rate: u32,
        dst_rate: u32,
        channels: u16,
        quality: Quality,
    ) -> Result<Self, ResamplerError> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(ResamplerError::InvalidRate { src_rate, dst_rate });
        }
        if channels == 0 {
            return Err(ResamplerError::InvalidChannels(channels));
        }
        if u64::from(src_rate) > u64::from(dst_rate) * u64::from(MAX_RATIO)
            || u64::from(dst_rate) > u64::from(src_rate) * u64::from(MAX_RATIO)
        {
            return Err(ResamplerError::RatioOutOfRange { src_rate, dst_rate });
        }

        Ok(Self {
            src_rate,
            dst_rate,
            channels: usize::from(channels),
            quality,
            phase: -i64::from(dst_rate),
            history: vec![0; usize::from(channels)],
        })
    }

    /// Returns the input sample rate.
    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    /// Returns the output sample rate.
    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    /// Returns the channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns an output buffer size (in frames, 16-frame aligned) large
    /// enough to hold everything produced from `in_frames` input frames.
    #[must_use]
    pub fn output_capacity(&self, in_frames: usize) -> usize {
        let produced = (in_frames as u64 * u64::from(self.dst_rate)).div_ceil(u64::from(self.src_rate));
        round_to_16_frames(produced as usize)
    }

    /// Converts frames from `input` into `output`.
    ///
    /// On entry `in_frames` and `out_frames` hold how many frames are
    /// available and how many fit; on return they hold how many were
    /// consumed and produced. Unconsumed input must be offered again.
    pub fn process(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) {
        let ch = self.channels;
        let available = (*in_frames).min(input.len() / ch);
        let capacity = (*out_frames).min(output.len() / ch);
        let unit = i64::from(self.dst_rate);
        let step = i64::from(self.src_rate);
        let limit = (available as i64 - 1) * unit;

        let mut produced = 0;
        while produced < capacity && self.phase < limit {
            let index = self.phase.div_euclid(unit);
            let frac = self.phase.rem_euclid(unit);
            let frame = &mut output[produced * ch..(produced + 1) * ch];

            for (c, sample) in frame.iter_mut().enumerate() {
                let a = self.sample_at(input, index, c);
                let value = match self.quality {
                    Quality::Fast => a,
                    Quality::Default => {
                        let b = self.sample_at(input, index + 1, c);
                        a + (b - a) * frac / unit
                    }
                };
                *sample = value as i16;
            }

            produced += 1;
            self.phase += step;
        }

        let consumed = if available == 0 {
            0
        } else if self.phase >= limit {
            available
        } else {
            (self.phase.div_euclid(unit) + 1).max(0) as usize
        };

        if consumed > 0 {
            self.history
                .copy_from_slice(&input[(consumed - 1) * ch..consumed * ch]);
            self.phase -= consumed as i64 * unit;
        }

        *in_frames = consumed;
        *out_frames = produced;
    }

    /// Drops all streaming state, as if freshly created.
    pub fn reset(&mut self) {
        self.phase = -i64::from(self.dst_rate);
        self.history.fill(0);
    }

    #[inline]
    fn sample_at(&self, input: &[i16], index: i64, channel: usize) -> i64 {
        if index < 0 {
            i64::from(self.history[channel])
        } else {
            i64::from(input[index as usize * self.channels + channel])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATES: [u32; 5] = [8000, 16000, 44100, 48000, 96000];

    fn sine(frames: usize, rate: u32, channels: usize) -> Vec<i16> {
        (0..frames)
            .flat_map(|i| {
                let t = i as f64 / f64::from(rate);
                let value = ((2.0 * std::f64::consts::PI * 1000.0 * t).sin() * 16000.0) as i16;
                std::iter::repeat(value).take(channels)
            })
            .collect()
    }

    /// Feeds `input` in blocks of `block` frames, returning all output.
    fn run_blocks(resampler: &mut Resampler, input: &[i16], block: usize) -> Vec<i16> {
        let ch = resampler.channels();
        let mut output = Vec::new();
        for chunk in input.chunks(block * ch) {
            let frames = chunk.len() / ch;
            let capacity = resampler.output_capacity(frames);
            let mut buf = vec![0i16; capacity * ch];
            let mut in_frames = frames;
            let mut out_frames = capacity;
            resampler.process(chunk, &mut in_frames, &mut buf, &mut out_frames);
            assert_eq!(in_frames, frames);
            output.extend_from_slice(&buf[..out_frames * ch]);
        }
        output
    }

    #[test]
    fn test_create_rejects_invalid_input() {
        assert!(matches!(
            Resampler::create(0, 8000, 1, Quality::Default),
            Err(ResamplerError::InvalidRate { .. })
        ));
        assert!(matches!(
            Resampler::create(8000, 48000, 0, Quality::Default),
            Err(ResamplerError::InvalidChannels(0))
        ));
        assert!(matches!(
            Resampler::create(100, 192_000, 1, Quality::Default),
            Err(ResamplerError::RatioOutOfRange { .. })
        ));
    }

    #[test]
    fn test_output_count_matches_ratio() {
        let frames = 4800;
        for &src in &RATES {
            for &dst in &RATES {
                let mut resampler = Resampler::create(src, dst, 1, Quality::Default).unwrap();
                let output = run_blocks(&mut resampler, &sine(frames, src, 1), 96);
                let expected = frames as f64 * f64::from(dst) / f64::from(src);
                let diff = (output.len() as f64 - expected).abs();
                assert!(diff <= 1.0, "{src} -> {dst}: got {} expected {expected}", output.len());
            }
        }
    }

    #[test]
    fn test_block_size_does_not_change_output() {
        let input = sine(2000, 48000, 2);
        let mut whole = Resampler::create(48000, 8000, 2, Quality::Default).unwrap();
        let mut pieces = Resampler::create(48000, 8000, 2, Quality::Default).unwrap();

        let expected = run_blocks(&mut whole, &input, 2000);
        let actual = run_blocks(&mut pieces, &input, 37);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_limited_output_consumes_partial_input() {
        let input = sine(480, 8000, 1);
        let mut reference = Resampler::create(8000, 48000, 1, Quality::Default).unwrap();
        let expected = run_blocks(&mut reference, &input, 480);

        let mut resampler = Resampler::create(8000, 48000, 1, Quality::Default).unwrap();
        let mut output = Vec::new();
        let mut offset = 0;
        while offset < input.len() {
            let mut buf = vec![0i16; 100];
            let mut in_frames = input.len() - offset;
            let mut out_frames = buf.len();
            resampler.process(&input[offset..], &mut in_frames, &mut buf, &mut out_frames);
            output.extend_from_slice(&buf[..out_frames]);
            offset += in_frames;
        }
        assert_eq!(output, expected);
    }

    #[test]
    fn test_upsampled_sine_stays_in_range() {
        let input = sine(800, 8000, 1);
        let peak = input.iter().map(|s| s.unsigned_abs()).max().unwrap();
        let mut resampler = Resampler::create(8000, 48000, 1, Quality::Default).unwrap();
        let output = run_blocks(&mut resampler, &input, 80);
        assert!(output.iter().all(|s| s.unsigned_abs() <= peak));
    }

    #[test]
    fn test_linear_interpolates_midpoints() {
        let mut resampler = Resampler::create(1000, 2000, 1, Quality::Default).unwrap();
        let input = [0i16, 100, 200, 300];
        let mut output = [0i16; 16];
        let mut in_frames = 4;
        let mut out_frames = 16;
        resampler.process(&input, &mut in_frames, &mut output, &mut out_frames);
        // First output is the zero history frame
        assert_eq!(&output[..out_frames], &[0, 0, 0, 50, 100, 150, 200, 250]);
    }

    #[test]
    fn test_fast_quality_holds_samples() {
        let mut resampler = Resampler::create(1000, 2000, 1, Quality::Fast).unwrap();
        let input = [10i16, 20, 30];
        let mut output = [0i16; 16];
        let mut in_frames = 3;
        let mut out_frames = 16;
        resampler.process(&input, &mut in_frames, &mut output, &mut out_frames);
        assert_eq!(&output[..out_frames], &[0, 0, 10, 10, 20, 20]);
    }

    #[test]
    fn test_empty_input() {
        let mut resampler = Resampler::create(8000, 48000, 1, Quality::Default).unwrap();
        let mut output = [0i16; 16];
        let mut in_frames = 0;
        let mut out_frames = 16;
        resampler.process(&[], &mut in_frames, &mut output, &mut out_frames);
        assert_eq!(in_frames, 0);
        assert_eq!(out_frames, 0);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let input = sine(160, 8000, 1);
        let mut resampler = Resampler::create(8000, 16000, 1, Quality::Default).unwrap();
        let first = run_blocks(&mut resampler, &input, 160);
        resampler.reset();
        let second = run_blocks(&mut resampler, &input, 160);
        assert_eq!(first, second);
    }

    #[test]
    fn test_output_capacity_is_aligned() {
        let resampler = Resampler::create(8000, 48000, 1, Quality::Default).unwrap();
        assert_eq!(resampler.output_capacity(96), 576);
        let resampler = Resampler::create(48000, 8000, 1, Quality::Default).unwrap();
        assert_eq!(resampler.output_capacity(480), 80);
        assert_eq!(resampler.output_capacity(481), 96);
    }
}
