//! Builder for [`AudioHwDevice`].

use std::sync::Arc;

use crate::card::{CardLookup, ProcAsound};
use crate::device::{AudioHwDevice, DeviceContext};
use crate::pcm::PcmBackend;
use crate::route::{LogRouter, RouteApplier};
use crate::{event_callback, EventCallback, HalConfig, HalError, HalEvent};

/// Builder for configuring and opening the audio device.
///
/// Use [`AudioHwDevice::builder()`] to create a new builder.
///
/// Only the PCM backend is required (with the `cpal-backend` feature it
/// defaults to the host's ALSA devices). Card lookup defaults to
/// [`ProcAsound`] and route application to [`LogRouter`].
///
/// # Example
///
/// ```
/// use hfp_audio_hal::pcm::{MockBackend, PcmCaps};
/// use hfp_audio_hal::AudioHwDevice;
///
/// let mock = MockBackend::new();
/// mock.add_card("sofhdadsp", 0, PcmCaps::new([48000], [2]));
///
/// let device = AudioHwDevice::builder()
///     .backend(mock.clone())
///     .card_lookup(mock)
///     .primary_cards(["sofhdadsp"])
///     .on_event(|e| tracing::warn!(?e, "hal event"))
///     .open()?;
/// assert!(!device.is_diverted());
/// # Ok::<(), hfp_audio_hal::HalError>(())
/// ```
#[must_use]
pub struct HalBuilder {
    backend: Option<Arc<dyn PcmBackend>>,
    card_lookup: Option<Arc<dyn CardLookup>>,
    router: Option<Arc<dyn RouteApplier>>,
    config: HalConfig,
    event_callback: Option<EventCallback>,
}

impl Default for HalBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HalBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            backend: None,
            card_lookup: None,
            router: None,
            config: HalConfig::default(),
            event_callback: None,
        }
    }

    /// Sets the PCM backend that opens endpoints.
    pub fn backend<B: PcmBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Sets how driver names are resolved to card indices.
    ///
    /// Default: [`ProcAsound`]
    pub fn card_lookup<L: CardLookup + 'static>(mut self, lookup: L) -> Self {
        self.card_lookup = Some(Arc::new(lookup));
        self
    }

    /// Sets the mixer route applier.
    ///
    /// Default: [`LogRouter`]
    pub fn router<R: RouteApplier + 'static>(mut self, router: R) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    /// Sets the device configuration.
    pub fn with_config(mut self, config: HalConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the primary card candidates, probed in order.
    pub fn primary_cards<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.primary_cards = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a callback to receive runtime events.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(HalEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    #[cfg(feature = "cpal-backend")]
    fn default_backend() -> Result<Arc<dyn PcmBackend>, HalError> {
        Ok(Arc::new(crate::pcm::CpalBackend::new()))
    }

    #[cfg(not(feature = "cpal-backend"))]
    fn default_backend() -> Result<Arc<dyn PcmBackend>, HalError> {
        Err(HalError::NoBackend)
    }

    /// Validates the configuration and opens the device.
    ///
    /// No endpoint is opened here; cards are resolved when streams open.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - No backend was set and no default backend is compiled in
    pub fn open(self) -> Result<AudioHwDevice, HalError> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => Self::default_backend()?,
        };
        let cards = self
            .card_lookup
            .unwrap_or_else(|| Arc::new(ProcAsound::new()));
        let router = self.router.unwrap_or_else(|| Arc::new(LogRouter));

        tracing::info!(
            primary_cards = ?self.config.primary_cards,
            bt_card = %self.config.bt_card_name,
            "audio device opened"
        );

        Ok(AudioHwDevice::new(DeviceContext::new(
            backend,
            cards,
            router,
            self.config,
            self.event_callback,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::MockBackend;

    #[test]
    fn test_builder_defaults() {
        let builder = HalBuilder::new();
        assert!(builder.backend.is_none());
        assert!(builder.event_callback.is_none());
        assert_eq!(builder.config.bt_card_name, "btaudiosource");
    }

    #[test]
    fn test_builder_primary_cards() {
        let builder = HalBuilder::new().primary_cards(["USB", "Dummy"]);
        assert_eq!(builder.config.primary_cards, vec!["USB", "Dummy"]);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = HalConfig::default();
        config.out_config.rate = 0;

        let result = HalBuilder::new()
            .backend(MockBackend::new())
            .with_config(config)
            .open();
        assert!(matches!(result, Err(HalError::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_rejects_empty_card_list() {
        let result = HalBuilder::new()
            .backend(MockBackend::new())
            .primary_cards(Vec::<String>::new())
            .open();
        assert!(matches!(result, Err(HalError::InvalidConfig { .. })));
    }

    #[cfg(not(feature = "cpal-backend"))]
    #[test]
    fn test_builder_requires_backend() {
        let result = HalBuilder::new().open();
        assert!(matches!(result, Err(HalError::NoBackend)));
    }
}
