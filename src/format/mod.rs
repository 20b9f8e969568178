//! Audio format conversion utilities.
//!
//! This module provides the conversions needed between endpoints:
//! - Channel remapping (N → M channels)
//! - Streaming sample rate conversion
//! - [`FormatConverter`], which chains both with reusable scratch buffers

mod convert;
mod resample;

pub use convert::{remap_channels, remapped_len, round_to_16_frames, FRAME_ALIGNMENT};
pub use resample::{Quality, Resampler};

use crate::{AudioConfig, ResamplerError};

/// Converts interleaved audio between two formats.
///
/// Remaps channels first, then resamples. Each instance owns its own
/// resampler state, so one converter must serve exactly one direction of
/// one path.
#[derive(Debug)]
pub struct FormatConverter {
    src: AudioConfig,
    dst: AudioConfig,
    resampler: Option<Resampler>,
    remapped: Vec<i16>,
    resampled: Vec<i16>,
}

impl FormatConverter {
    /// Creates a converter from `src` to `dst`.
    ///
    /// A resampler is only allocated when the rates differ.
    ///
    /// # Errors
    ///
    /// Returns the resampler creation error; callers treat it as non-fatal.
    pub fn new(src: AudioConfig, dst: AudioConfig, quality: Quality) -> Result<Self, ResamplerError> {
        if src.channels == 0 {
            return Err(ResamplerError::InvalidChannels(src.channels));
        }
        let resampler = if src.sample_rate == dst.sample_rate {
            None
        } else {
            Some(Resampler::create(
                src.sample_rate,
                dst.sample_rate,
                dst.channels,
                quality,
            )?)
        };

        tracing::debug!(
            src_rate = src.sample_rate,
            src_channels = src.channels,
            dst_rate = dst.sample_rate,
            dst_channels = dst.channels,
            "format converter created"
        );

        Ok(Self {
            src,
            dst,
            resampler,
            remapped: Vec::new(),
            resampled: Vec::new(),
        })
    }

    /// Returns `true` if the channel counts differ.
    pub fn needs_remap(&self) -> bool {
        self.src.channels != self.dst.channels
    }

    /// Returns `true` if the sample rates differ.
    pub fn needs_resample(&self) -> bool {
        self.resampler.is_some()
    }

    /// Returns `true` if input passes through unchanged.
    pub fn is_passthrough(&self) -> bool {
        !self.needs_remap() && !self.needs_resample()
    }

    /// Returns how many output frames `in_frames` input frames can produce
    /// at most, 16-frame aligned.
    pub fn output_capacity(&self, in_frames: usize) -> usize {
        match &self.resampler {
            Some(resampler) => resampler.output_capacity(in_frames),
            None => round_to_16_frames(in_frames),
        }
    }

    /// Converts a block of interleaved source frames.
    ///
    /// The returned slice borrows either the input (passthrough) or the
    /// converter's scratch storage and is valid until the next call.
    pub fn convert<'a>(&'a mut self, input: &'a [i16]) -> &'a [i16] {
        let src_ch = usize::from(self.src.channels);
        let dst_ch = usize::from(self.dst.channels);
        let frames = input.len() / src_ch;

        let remapped: &[i16] = if src_ch == dst_ch {
            &input[..frames * src_ch]
        } else {
            self.remapped.resize(frames * dst_ch, 0);
            remap_channels(input, src_ch, &mut self.remapped, dst_ch);
            &self.remapped
        };

        let Some(resampler) = self.resampler.as_mut() else {
            return remapped;
        };

        let capacity = resampler.output_capacity(frames);
        self.resampled.resize(capacity * dst_ch, 0);
        let mut in_frames = frames;
        let mut out_frames = capacity;
        resampler.process(remapped, &mut in_frames, &mut self.resampled, &mut out_frames);
        &self.resampled[..out_frames * dst_ch]
    }
}
