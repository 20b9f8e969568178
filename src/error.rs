//! Error types for the audio HAL.
//!
//! Errors are split into three categories:
//! - **Fatal errors** ([`HalError`]): Prevent a device or stream from being opened
//! - **Endpoint errors** ([`PcmError`]): Failures of a physical PCM endpoint,
//!   absorbed by the stream lifecycle and surfaced via [`HalEvent`](crate::HalEvent)
//! - **Resampler errors** ([`ResamplerError`]): Non-fatal, disable conversion for one path

/// Fatal errors returned from device construction and stream open.
///
/// Runtime transfer problems never show up here: `read`/`write` always
/// report the full byte count and signal trouble through latency,
/// silence and events instead.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    /// No candidate card (not even the dummy card) exposes PCM capabilities.
    #[error("no usable sound card (tried {tried:?})")]
    NoUsableCard {
        /// Driver names that were probed, in order.
        tried: Vec<String>,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The builder was finished without a PCM backend.
    #[error("no PCM backend configured - call backend() on the builder")]
    NoBackend,

    /// Scratch storage for a stream could not be allocated.
    #[error("out of memory allocating {what}")]
    OutOfMemory {
        /// What was being allocated.
        what: &'static str,
    },

    /// The loopback bridge was requested before a USB card was set.
    #[error("no USB card selected for loopback (set card=<index>)")]
    NoUsbCard,

    /// The Bluetooth card could not be resolved by driver name.
    #[error("bluetooth card '{name}' not present")]
    NoBluetoothCard {
        /// Driver name that was looked up.
        name: String,
    },

    /// One of the four loopback endpoints failed to open or prepare.
    #[error("loopback endpoint {endpoint} failed: {source}")]
    LoopbackEndpoint {
        /// Which endpoint failed (`usb_in`, `bt_out`, `bt_in`, `usb_out`).
        endpoint: &'static str,
        /// The underlying endpoint error.
        #[source]
        source: PcmError,
    },

    /// A loopback worker thread could not be spawned.
    #[error("failed to spawn loopback worker '{name}': {source}")]
    SpawnFailed {
        /// Worker name.
        name: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl HalError {
    /// Creates an invalid configuration error with the given reason.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Failures reported by a physical PCM endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    /// The card/device pair does not exist.
    #[error("no such device: card {card} device {device}")]
    NotFound {
        /// Card index.
        card: u32,
        /// Device index.
        device: u32,
    },

    /// The device opened but rejected the configuration.
    #[error("device not ready: {reason}")]
    NotReady {
        /// Why the hardware refused.
        reason: String,
    },

    /// The card/device pair is already held by another path.
    #[error("device busy: card {card} device {device}")]
    Busy {
        /// Card index.
        card: u32,
        /// Device index.
        device: u32,
    },

    /// Playback ran dry (broken pipe).
    #[error("underrun")]
    Underrun,

    /// Capture data was lost because it was not read in time.
    #[error("overrun")]
    Overrun,

    /// Any other transfer failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl PcmError {
    /// Creates an I/O error with the given message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Creates a not-ready error with the given reason.
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }
}

/// Resampler creation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResamplerError {
    /// A sample rate of zero was requested.
    #[error("invalid sample rates {src_rate}Hz -> {dst_rate}Hz")]
    InvalidRate {
        /// Source rate.
        src_rate: u32,
        /// Destination rate.
        dst_rate: u32,
    },

    /// A channel count of zero was requested.
    #[error("invalid channel count: {0}")]
    InvalidChannels(u16),

    /// The conversion ratio exceeds what the resampler supports.
    #[error("ratio {src_rate}Hz -> {dst_rate}Hz out of range")]
    RatioOutOfRange {
        /// Source rate.
        src_rate: u32,
        /// Destination rate.
        dst_rate: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_error_display() {
        let err = HalError::NoUsableCard {
            tried: vec!["PCH".to_string(), "Dummy".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no usable sound card (tried [\"PCH\", \"Dummy\"])"
        );
    }

    #[test]
    fn test_invalid_config_helper() {
        let err = HalError::invalid_config("period_size must be non-zero");
        assert_eq!(
            err.to_string(),
            "invalid configuration: period_size must be non-zero"
        );
    }

    #[test]
    fn test_loopback_endpoint_error_has_source() {
        use std::error::Error;

        let err = HalError::LoopbackEndpoint {
            endpoint: "bt_out",
            source: PcmError::NotFound { card: 3, device: 0 },
        };
        assert!(err.to_string().contains("bt_out"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_pcm_error_helpers() {
        assert_eq!(PcmError::io("short write").to_string(), "i/o error: short write");
        assert_eq!(
            PcmError::not_ready("hw params").to_string(),
            "device not ready: hw params"
        );
    }

    #[test]
    fn test_resampler_error_display() {
        let err = ResamplerError::InvalidRate {
            src_rate: 0,
            dst_rate: 8000,
        };
        assert_eq!(err.to_string(), "invalid sample rates 0Hz -> 8000Hz");
    }
}
