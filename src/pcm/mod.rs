//! Physical PCM endpoints.
//!
//! A [`PcmBackend`] opens card/device pairs and hands back boxed
//! [`PcmStream`]s. [`PcmHandle`] wraps one open stream together with its
//! identity and negotiated config; dropping the handle closes the endpoint.

mod mock;

#[cfg(feature = "cpal-backend")]
mod cpal;

pub use mock::{sine_wave, MockBackend, MockOp};

#[cfg(feature = "cpal-backend")]
pub use self::cpal::CpalBackend;

use std::fmt;

use crate::{PcmConfig, PcmError};

/// Transfer direction of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Samples flow from the host to the hardware.
    Playback,
    /// Samples flow from the hardware to the host.
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playback => f.write_str("playback"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

/// Identity of a physical endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmId {
    /// Sound card index.
    pub card: u32,
    /// PCM device index on the card.
    pub device: u32,
    /// Transfer direction.
    pub direction: Direction,
}

impl PcmId {
    /// Creates a playback endpoint id.
    #[must_use]
    pub const fn playback(card: u32, device: u32) -> Self {
        Self {
            card,
            device,
            direction: Direction::Playback,
        }
    }

    /// Creates a capture endpoint id.
    #[must_use]
    pub const fn capture(card: u32, device: u32) -> Self {
        Self {
            card,
            device,
            direction: Direction::Capture,
        }
    }
}

impl fmt::Display for PcmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hw:{},{} ({})", self.card, self.device, self.direction)
    }
}

/// Rates and channel counts an endpoint accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcmCaps {
    /// Supported sample rates in Hz, in preference order.
    pub rates: Vec<u32>,
    /// Supported channel counts, in preference order.
    pub channels: Vec<u16>,
}

impl PcmCaps {
    /// Creates capabilities from rate and channel lists.
    pub fn new(rates: impl Into<Vec<u32>>, channels: impl Into<Vec<u16>>) -> Self {
        Self {
            rates: rates.into(),
            channels: channels.into(),
        }
    }

    /// Adapts `preferred` to these capabilities.
    ///
    /// Keeps the preferred rate and channel count when offered, otherwise
    /// falls back to the first supported value. Period geometry is kept.
    #[must_use]
    pub fn negotiate(&self, preferred: &PcmConfig) -> PcmConfig {
        let mut config = *preferred;
        if !self.rates.contains(&preferred.rate) {
            if let Some(&rate) = self.rates.first() {
                config.rate = rate;
            }
        }
        if !self.channels.contains(&preferred.channels) {
            if let Some(&channels) = self.channels.first() {
                config.channels = channels;
            }
        }
        config
    }
}

/// An open PCM stream. Dropping it closes the endpoint.
pub trait PcmStream: Send {
    /// Prepares the hardware for transfers.
    fn prepare(&mut self) -> Result<(), PcmError> {
        Ok(())
    }

    /// Blocks until `buf` is filled with interleaved capture samples.
    fn read(&mut self, buf: &mut [i16]) -> Result<(), PcmError>;

    /// Blocks until all of `buf` has been queued for playback.
    fn write(&mut self, buf: &[i16]) -> Result<(), PcmError>;
}

/// Opens physical endpoints.
pub trait PcmBackend: Send + Sync {
    /// Opens `id` with `config`.
    ///
    /// Must return [`PcmError::NotFound`] when the pair does not exist and
    /// [`PcmError::NotReady`] when it exists but rejects the configuration.
    fn open(&self, id: PcmId, config: &PcmConfig) -> Result<Box<dyn PcmStream>, PcmError>;

    /// Returns the capabilities of `id`, or `None` if it does not exist.
    fn capabilities(&self, id: PcmId) -> Option<PcmCaps>;
}

/// An exclusively owned, open endpoint.
#[must_use]
pub struct PcmHandle {
    id: PcmId,
    config: PcmConfig,
    stream: Box<dyn PcmStream>,
}

impl PcmHandle {
    /// Opens `id` through `backend`.
    pub fn open(backend: &dyn PcmBackend, id: PcmId, config: &PcmConfig) -> Result<Self, PcmError> {
        let stream = backend.open(id, config)?;
        tracing::info!(
            card = id.card,
            device = id.device,
            direction = %id.direction,
            rate = config.rate,
            channels = config.channels,
            period_size = config.period_size,
            "pcm opened"
        );
        Ok(Self {
            id,
            config: *config,
            stream,
        })
    }

    /// Opens `id` and prepares it in one step.
    pub fn open_prepared(
        backend: &dyn PcmBackend,
        id: PcmId,
        config: &PcmConfig,
    ) -> Result<Self, PcmError> {
        let mut handle = Self::open(backend, id, config)?;
        handle.prepare()?;
        Ok(handle)
    }

    /// Returns the endpoint identity.
    pub fn id(&self) -> PcmId {
        self.id
    }

    /// Returns the negotiated config.
    pub fn config(&self) -> &PcmConfig {
        &self.config
    }

    /// Prepares the hardware for transfers.
    pub fn prepare(&mut self) -> Result<(), PcmError> {
        self.stream.prepare()
    }

    /// Reads interleaved samples, filling `buf`.
    pub fn read(&mut self, buf: &mut [i16]) -> Result<(), PcmError> {
        self.stream.read(buf)
    }

    /// Writes interleaved samples from `buf`.
    pub fn write(&mut self, buf: &[i16]) -> Result<(), PcmError> {
        self.stream.write(buf)
    }
}

impl fmt::Debug for PcmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmHandle")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for PcmHandle {
    fn drop(&mut self) {
        tracing::debug!(card = self.id.card, device = self.id.device, direction = %self.id.direction, "pcm closed");
    }
}
