//! Configuration types for endpoints and the device.

use crate::format::{round_to_16_frames, Quality};
use crate::HalError;

/// Bytes per sample. Only signed 16-bit interleaved PCM is supported.
pub const SAMPLE_BYTES: usize = 2;

/// Hardware configuration of one PCM endpoint.
///
/// Sample format is always signed 16-bit little-endian interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmConfig {
    /// Channels per frame.
    pub channels: u16,
    /// Frames per second.
    pub rate: u32,
    /// Frames per hardware period.
    pub period_size: usize,
    /// Periods in the hardware buffer.
    pub period_count: usize,
    /// Frames queued before playback/capture starts.
    pub start_threshold: usize,
    /// Frames available before the hardware stops (0 = driver default).
    pub stop_threshold: usize,
}

impl PcmConfig {
    /// Creates a playback-style config whose start threshold is the full buffer.
    #[must_use]
    pub const fn playback(rate: u32, channels: u16, period_size: usize, period_count: usize) -> Self {
        Self {
            channels,
            rate,
            period_size,
            period_count,
            start_threshold: period_size * period_count,
            stop_threshold: 0,
        }
    }

    /// Creates a capture-style config that starts on the first frame and
    /// stops once the full buffer is pending.
    #[must_use]
    pub const fn capture(rate: u32, channels: u16, period_size: usize, period_count: usize) -> Self {
        Self {
            channels,
            rate,
            period_size,
            period_count,
            start_threshold: 1,
            stop_threshold: period_size * period_count,
        }
    }

    /// Returns the size of one frame in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * SAMPLE_BYTES
    }

    /// Returns the period length rounded up to a multiple of 16 frames.
    #[must_use]
    pub fn aligned_period(&self) -> usize {
        round_to_16_frames(self.period_size)
    }

    /// Returns the size of one period in bytes.
    #[must_use]
    pub fn period_bytes(&self) -> usize {
        self.period_size * self.frame_bytes()
    }

    /// Checks that every field is usable.
    pub fn validate(&self, name: &str) -> Result<(), HalError> {
        if self.channels == 0 {
            return Err(HalError::invalid_config(format!("{name}: channels must be non-zero")));
        }
        if self.rate == 0 {
            return Err(HalError::invalid_config(format!("{name}: rate must be non-zero")));
        }
        if self.period_size == 0 || self.period_count == 0 {
            return Err(HalError::invalid_config(format!(
                "{name}: period size and count must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Stream configuration as seen by the upstream framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono, 2 = stereo).
    pub channels: u16,
}

impl AudioConfig {
    /// Creates a config with the given rate and channel count.
    #[must_use]
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Returns the sample format name reported to the framework.
    #[must_use]
    pub fn format_name(&self) -> &'static str {
        "AUDIO_FORMAT_PCM_16_BIT"
    }

    /// Returns the channel mask name for the given direction.
    #[must_use]
    pub fn channel_mask_name(&self, input: bool) -> &'static str {
        match (input, self.channels) {
            (false, 1) => "AUDIO_CHANNEL_OUT_MONO",
            (false, _) => "AUDIO_CHANNEL_OUT_STEREO",
            (true, 1) => "AUDIO_CHANNEL_IN_MONO",
            (true, _) => "AUDIO_CHANNEL_IN_STEREO",
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

impl From<&PcmConfig> for AudioConfig {
    fn from(config: &PcmConfig) -> Self {
        Self::new(config.rate, config.channels)
    }
}

/// Device-wide configuration.
///
/// Use [`HalConfig::default()`] for the reference hardware, or override
/// individual fields.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::HalConfig;
///
/// let config = HalConfig {
///     primary_cards: vec!["sofhdadsp".to_string(), "Dummy".to_string()],
///     ..Default::default()
/// };
/// assert_eq!(config.bt_card_name, "btaudiosource");
/// ```
#[derive(Debug, Clone)]
pub struct HalConfig {
    /// Driver names probed in order for the primary codec.
    ///
    /// Default: `PCH`, `Intel`, `sofhdadsp`, `Dummy`
    pub primary_cards: Vec<String>,

    /// Card index used when no candidate resolves.
    ///
    /// Default: 0
    pub dummy_card: u32,

    /// Driver name of the Bluetooth SCO card.
    ///
    /// Default: `btaudiosource`
    pub bt_card_name: String,

    /// PCM device index used on every card.
    ///
    /// Default: 0
    pub pcm_device: u32,

    /// Primary playback endpoint.
    ///
    /// Default: 48kHz stereo, 1024 frames x 4 periods
    pub out_config: PcmConfig,

    /// Primary capture endpoint.
    ///
    /// Default: 48kHz stereo, 1920 frames x 4 periods
    pub in_config: PcmConfig,

    /// Bluetooth narrow-band playback endpoint.
    ///
    /// Default: 8kHz mono, 80 frames x 50 periods
    pub bt_out_config: PcmConfig,

    /// Bluetooth narrow-band capture endpoint.
    ///
    /// Default: 8kHz mono, 80 frames x 50 periods
    pub bt_in_config: PcmConfig,

    /// Preferred USB endpoint config for the loopback bridge.
    ///
    /// Default: 48kHz stereo, 480 frames x 5 periods
    pub usb_config: PcmConfig,

    /// Resampler quality for diversion and loopback paths.
    ///
    /// Default: [`Quality::Default`]
    pub resampler_quality: Quality,
}

/// Capture period in milliseconds for the primary input endpoint.
const IN_PERIOD_MS: usize = 10;

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            primary_cards: ["PCH", "Intel", "sofhdadsp", "Dummy"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            dummy_card: 0,
            bt_card_name: "btaudiosource".to_string(),
            pcm_device: 0,
            out_config: PcmConfig::playback(48000, 2, 1024, 4),
            in_config: PcmConfig::capture(48000, 2, 48000 * IN_PERIOD_MS * 4 / 1000, 4),
            bt_out_config: PcmConfig::playback(8000, 1, 80, 50),
            bt_in_config: PcmConfig::capture(8000, 1, 80, 50),
            usb_config: PcmConfig::playback(48000, 2, 480, 5),
            resampler_quality: Quality::Default,
        }
    }
}

impl HalConfig {
    /// Checks every endpoint config and the card candidate list.
    pub fn validate(&self) -> Result<(), HalError> {
        if self.primary_cards.is_empty() {
            return Err(HalError::invalid_config("primary_cards must not be empty"));
        }
        self.out_config.validate("out_config")?;
        self.in_config.validate("in_config")?;
        self.bt_out_config.validate("bt_out_config")?;
        self.bt_in_config.validate("bt_in_config")?;
        self.usb_config.validate("usb_config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_config_default() {
        let config = HalConfig::default();
        assert_eq!(config.primary_cards, vec!["PCH", "Intel", "sofhdadsp", "Dummy"]);
        assert_eq!(config.out_config.rate, 48000);
        assert_eq!(config.out_config.start_threshold, 4096);
        assert_eq!(config.in_config.period_size, 1920);
        assert_eq!(config.bt_out_config.channels, 1);
        assert_eq!(config.bt_in_config.rate, 8000);
        assert_eq!(config.usb_config.period_size, 480);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pcm_config_sizes() {
        let config = PcmConfig::playback(8000, 1, 80, 50);
        assert_eq!(config.frame_bytes(), 2);
        assert_eq!(config.period_bytes(), 160);
        assert_eq!(config.aligned_period(), 80);

        let odd = PcmConfig::playback(44100, 2, 441, 4);
        assert_eq!(odd.aligned_period(), 448);
    }

    #[test]
    fn test_capture_thresholds() {
        let config = PcmConfig::capture(48000, 2, 480, 4);
        assert_eq!(config.start_threshold, 1);
        assert_eq!(config.stop_threshold, 1920);
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = HalConfig {
            bt_out_config: PcmConfig::playback(0, 1, 80, 50),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bt_out_config"));
    }

    #[test]
    fn test_validate_rejects_empty_candidates() {
        let config = HalConfig {
            primary_cards: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audio_config_names() {
        let mono = AudioConfig::new(16000, 1);
        assert_eq!(mono.channel_mask_name(false), "AUDIO_CHANNEL_OUT_MONO");
        assert_eq!(mono.channel_mask_name(true), "AUDIO_CHANNEL_IN_MONO");
        assert_eq!(AudioConfig::default().channel_mask_name(false), "AUDIO_CHANNEL_OUT_STEREO");
        assert_eq!(mono.format_name(), "AUDIO_FORMAT_PCM_16_BIT");
    }
}
