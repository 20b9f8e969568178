//! Channel remapping and frame alignment.

/// Frame granularity that conversion buffers are aligned to.
pub const FRAME_ALIGNMENT: usize = 16;

/// Rounds a frame count up to the next multiple of 16.
#[inline]
#[must_use]
pub fn round_to_16_frames(frames: usize) -> usize {
    (frames + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Returns how many samples [`remap_channels`] produces for `src_len` input samples.
#[inline]
#[must_use]
pub fn remapped_len(src_len: usize, src_channels: usize, dst_channels: usize) -> usize {
    if src_channels == 0 {
        return 0;
    }
    src_len / src_channels * dst_channels
}

/// Converts interleaved frames from `src_channels` to `dst_channels`.
///
/// - Same count: copied verbatim.
/// - Mono source: the sample is replicated into every output channel.
/// - Stereo to mono: left and right are averaged.
/// - Other down-mixes: trailing channels are dropped.
/// - Other up-mixes: source channels are copied, extra channels are silent.
///
/// Only whole frames that fit in both buffers are converted. Returns the
/// number of samples written to `dst`.
pub fn remap_channels(
    src: &[i16],
    src_channels: usize,
    dst: &mut [i16],
    dst_channels: usize,
) -> usize {
    if src_channels == 0 || dst_channels == 0 {
        return 0;
    }

    let frames = (src.len() / src_channels).min(dst.len() / dst_channels);
    let src = &src[..frames * src_channels];
    let dst = &mut dst[..frames * dst_channels];

    if src_channels == dst_channels {
        dst.copy_from_slice(src);
        return dst.len();
    }

    let frames_in = src.chunks_exact(src_channels);
    let frames_out = dst.chunks_exact_mut(dst_channels);

    match (src_channels, dst_channels) {
        (1, _) => {
            for (input, output) in frames_in.zip(frames_out) {
                output.fill(input[0]);
            }
        }
        (2, 1) => {
            for (input, output) in frames_in.zip(frames_out) {
                // Average the two channels, avoiding overflow
                let left = i32::from(input[0]);
                let right = i32::from(input[1]);
                output[0] = ((left + right) / 2) as i16;
            }
        }
        (from, to) if from > to => {
            for (input, output) in frames_in.zip(frames_out) {
                output.copy_from_slice(&input[..to]);
            }
        }
        (from, _) => {
            for (input, output) in frames_in.zip(frames_out) {
                output[..from].copy_from_slice(input);
                output[from..].fill(0);
            }
        }
    }

    dst.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL_COUNTS: [usize; 5] = [1, 2, 4, 6, 8];

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16).wrapping_mul(37)).collect()
    }

    #[test]
    fn test_round_to_16_frames() {
        assert_eq!(round_to_16_frames(0), 0);
        assert_eq!(round_to_16_frames(1), 16);
        assert_eq!(round_to_16_frames(16), 16);
        assert_eq!(round_to_16_frames(80), 80);
        assert_eq!(round_to_16_frames(81), 96);
        assert_eq!(round_to_16_frames(480), 480);
        assert_eq!(round_to_16_frames(1920), 1920);
    }

    #[test]
    fn test_remap_length_for_all_channel_pairs() {
        let frames = 96;
        for &src_ch in &CHANNEL_COUNTS {
            for &dst_ch in &CHANNEL_COUNTS {
                let input = ramp(frames * src_ch);
                let mut output = vec![0i16; frames * dst_ch];
                let written = remap_channels(&input, src_ch, &mut output, dst_ch);
                assert_eq!(
                    written,
                    input.len() * dst_ch / src_ch,
                    "{src_ch} -> {dst_ch} channels"
                );
                assert_eq!(written, remapped_len(input.len(), src_ch, dst_ch));
            }
        }
    }

    #[test]
    fn test_remap_identity() {
        for &ch in &CHANNEL_COUNTS {
            let input = ramp(64 * ch);
            let mut output = vec![0i16; input.len()];
            remap_channels(&input, ch, &mut output, ch);
            assert_eq!(output, input);
        }
    }

    #[test]
    fn test_mono_replicates() {
        let mut output = vec![0i16; 6];
        remap_channels(&[10, -20], 1, &mut output, 3);
        assert_eq!(output, vec![10, 10, 10, -20, -20, -20]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let mut output = vec![0i16; 2];
        remap_channels(&[100, 200, i16::MAX, i16::MAX], 2, &mut output, 1);
        assert_eq!(output, vec![150, i16::MAX]);
    }

    #[test]
    fn test_downmix_truncates() {
        let mut output = vec![0i16; 4];
        remap_channels(&[1, 2, 3, 4, 5, 6, 7, 8], 4, &mut output, 2);
        assert_eq!(output, vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_upmix_zero_fills() {
        let mut output = vec![-1i16; 8];
        remap_channels(&[1, 2, 3, 4], 2, &mut output, 4);
        assert_eq!(output, vec![1, 2, 0, 0, 3, 4, 0, 0]);
    }

    #[test]
    fn test_remap_ignores_partial_frames() {
        let mut output = vec![0i16; 8];
        let written = remap_channels(&[1, 2, 3], 2, &mut output, 2);
        assert_eq!(written, 2);
    }

    #[test]
    fn test_remap_limited_by_destination() {
        let mut output = vec![0i16; 3];
        let written = remap_channels(&[1, 2, 3, 4], 1, &mut output, 2);
        assert_eq!(written, 2);
        assert_eq!(&output[..2], &[1, 1]);
    }

    #[test]
    fn test_remap_zero_channels() {
        let mut output = vec![0i16; 4];
        assert_eq!(remap_channels(&[1, 2], 0, &mut output, 2), 0);
        assert_eq!(remapped_len(4, 0, 2), 0);
    }
}
