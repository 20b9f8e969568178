//! USB ↔ Bluetooth loopback bridge session.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;

use crate::event::{emit, EventCallback, HalEvent};
use crate::format::Quality;
use crate::pcm::{PcmBackend, PcmHandle, PcmId};
use crate::pipeline::{Relay, RelayCounters, RelayStats};
use crate::{HalError, PcmConfig};

/// Statistics about a loopback session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// USB capture → Bluetooth playback.
    pub usb_to_bt: RelayStats,
    /// Bluetooth capture → USB playback.
    pub bt_to_usb: RelayStats,
}

/// The endpoints a loopback session bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackPlan {
    /// USB card index.
    pub usb_card: u32,
    /// Bluetooth card index.
    pub bt_card: u32,
    /// PCM device index on both cards.
    pub device: u32,
    /// Preferred USB format, negotiated against the card's capabilities.
    pub usb_config: PcmConfig,
    /// Bluetooth playback endpoint config.
    pub bt_out: PcmConfig,
    /// Bluetooth capture endpoint config.
    pub bt_in: PcmConfig,
}

/// Handle to a running loopback bridge.
///
/// Owns the two relay threads and their shared cancellation token. The
/// endpoints themselves belong to the threads, which close them on exit.
///
/// # Lifecycle
///
/// 1. [`start()`](LoopbackSession::start) opens and prepares all four
///    endpoints, then spawns `usb_to_bt` and `bt_to_usb`
/// 2. Both relays run until cancelled
/// 3. [`stop()`](LoopbackSession::stop) cancels and joins them
/// 4. Dropping the session also stops it
///
/// # Example
///
/// ```
/// use hfp_audio_hal::pcm::{MockBackend, PcmCaps};
/// use hfp_audio_hal::{HalConfig, LoopbackPlan, LoopbackSession};
///
/// let mock = MockBackend::new();
/// mock.add_card("usb", 2, PcmCaps::new([48000], [2]));
/// mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
///
/// let config = HalConfig::default();
/// let plan = LoopbackPlan {
///     usb_card: 2,
///     bt_card: 3,
///     device: 0,
///     usb_config: config.usb_config,
///     bt_out: config.bt_out_config,
///     bt_in: config.bt_in_config,
/// };
///
/// let session = LoopbackSession::start(&mock, &plan, config.resampler_quality, None)?;
/// assert_eq!(session.worker_count(), 2);
/// session.stop();
/// assert!(mock.open_endpoints().is_empty());
/// # Ok::<(), hfp_audio_hal::HalError>(())
/// ```
pub struct LoopbackSession {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    usb_to_bt: Arc<RelayCounters>,
    bt_to_usb: Arc<RelayCounters>,
    events: Option<EventCallback>,
}

impl LoopbackSession {
    /// Opens and prepares all four endpoints, then spawns both relays.
    ///
    /// If any endpoint fails, the ones already opened are closed and no
    /// thread is started.
    pub fn start(
        backend: &dyn PcmBackend,
        plan: &LoopbackPlan,
        quality: Quality,
        events: Option<EventCallback>,
    ) -> Result<Self, HalError> {
        let usb_in_id = PcmId::capture(plan.usb_card, plan.device);
        let usb_out_id = PcmId::playback(plan.usb_card, plan.device);
        let usb_in_config = negotiate(backend, usb_in_id, &plan.usb_config);
        let usb_in_config = PcmConfig::capture(
            usb_in_config.rate,
            usb_in_config.channels,
            usb_in_config.period_size,
            usb_in_config.period_count,
        );
        let usb_out_config = negotiate(backend, usb_out_id, &plan.usb_config);

        let open = |endpoint, id, config: &PcmConfig| {
            PcmHandle::open_prepared(backend, id, config)
                .map_err(|source| HalError::LoopbackEndpoint { endpoint, source })
        };
        let usb_in = open("usb_in", usb_in_id, &usb_in_config)?;
        let bt_out = open("bt_out", PcmId::playback(plan.bt_card, plan.device), &plan.bt_out)?;
        let bt_in = open("bt_in", PcmId::capture(plan.bt_card, plan.device), &plan.bt_in)?;
        let usb_out = open("usb_out", usb_out_id, &usb_out_config)?;

        let token = CancellationToken::new();
        let usb_to_bt = Arc::new(RelayCounters::default());
        let bt_to_usb = Arc::new(RelayCounters::default());

        let mut session = Self {
            token,
            workers: Vec::with_capacity(2),
            usb_to_bt: Arc::clone(&usb_to_bt),
            bt_to_usb: Arc::clone(&bt_to_usb),
            events: events.clone(),
        };

        let relays = [
            Relay::new("usb_to_bt", usb_in, bt_out, quality, usb_to_bt, events.clone()),
            Relay::new("bt_to_usb", bt_in, usb_out, quality, bt_to_usb, events.clone()),
        ];
        for (name, relay) in ["usb_to_bt", "bt_to_usb"].into_iter().zip(relays) {
            let token = session.token.clone();
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || relay.run(&token))
                .map_err(|source| HalError::SpawnFailed { name, source })?;
            session.workers.push(handle);
        }

        tracing::info!(
            usb_card = plan.usb_card,
            bt_card = plan.bt_card,
            usb_rate = usb_out_config.rate,
            usb_channels = usb_out_config.channels,
            "loopback started"
        );
        emit(
            events.as_ref(),
            HalEvent::LoopbackStarted {
                usb_card: plan.usb_card,
                bt_card: plan.bt_card,
            },
        );
        Ok(session)
    }

    /// Returns how many relay threads were spawned.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` until cancelled and while a relay is still running.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.workers.iter().any(|w| !w.is_finished())
    }

    /// Requests both relays to stop after their current iteration.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns a clone of the shared cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns current relay statistics.
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            usb_to_bt: self.usb_to_bt.snapshot(),
            bt_to_usb: self.bt_to_usb.snapshot(),
        }
    }

    /// Cancels both relays and waits for them to close their endpoints.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.token.cancel();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("loopback relay panicked");
            }
        }
        let stats = self.stats();
        tracing::info!(
            usb_to_bt_frames = stats.usb_to_bt.frames_relayed,
            bt_to_usb_frames = stats.bt_to_usb.frames_relayed,
            "loopback stopped"
        );
        emit(self.events.as_ref(), HalEvent::LoopbackStopped);
    }
}

impl fmt::Debug for LoopbackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackSession")
            .field("workers", &self.workers.len())
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Adapts `preferred` to what endpoint `id` reports it supports.
fn negotiate(backend: &dyn PcmBackend, id: PcmId, preferred: &PcmConfig) -> PcmConfig {
    backend
        .capabilities(id)
        .map_or(*preferred, |caps| caps.negotiate(preferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::{MockBackend, MockOp, PcmCaps};
    use crate::{HalConfig, PcmError};
    use std::time::{Duration, Instant};

    fn plan() -> LoopbackPlan {
        let config = HalConfig::default();
        LoopbackPlan {
            usb_card: 2,
            bt_card: 3,
            device: 0,
            usb_config: config.usb_config,
            bt_out: config.bt_out_config,
            bt_in: config.bt_in_config,
        }
    }

    fn mock() -> MockBackend {
        let mock = MockBackend::new();
        mock.add_card("usb", 2, PcmCaps::new([44100, 48000], [2]));
        mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
        mock.set_io_delay(Duration::from_millis(2));
        mock
    }

    #[test]
    fn test_start_opens_four_endpoints_and_two_workers() {
        let mock = mock();
        let session = LoopbackSession::start(&mock, &plan(), Quality::Default, None).unwrap();

        assert_eq!(session.worker_count(), 2);
        assert!(session.is_running());
        assert_eq!(mock.open_endpoints().len(), 4);

        session.stop();
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_cancel_stops_within_one_iteration() {
        let mock = mock();
        let session = LoopbackSession::start(&mock, &plan(), Quality::Default, None).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        session.cancel();
        assert!(!session.is_running());
        let stats = session.stats();
        session.stop();

        // one iteration is a read plus a write, 2ms each
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(stats.usb_to_bt.iterations > 0);
        assert!(stats.bt_to_usb.iterations > 0);
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_missing_endpoint_aborts_startup() {
        let mock = mock();
        mock.remove_card(3);

        let err = LoopbackSession::start(&mock, &plan(), Quality::Default, None).unwrap_err();
        assert!(matches!(
            err,
            HalError::LoopbackEndpoint {
                endpoint: "bt_out",
                source: PcmError::NotFound { card: 3, device: 0 },
            }
        ));
        assert!(mock.open_endpoints().is_empty());
        assert_eq!(
            mock.ops(),
            vec![
                MockOp::Open(PcmId::capture(2, 0)),
                MockOp::OpenRejected(PcmId::playback(3, 0)),
                MockOp::Close(PcmId::capture(2, 0)),
            ]
        );
    }

    #[test]
    fn test_prepare_failure_aborts_startup() {
        let mock = mock();
        mock.set_fail_prepare(2, true);

        let err = LoopbackSession::start(&mock, &plan(), Quality::Default, None).unwrap_err();
        assert!(matches!(err, HalError::LoopbackEndpoint { endpoint: "usb_in", .. }));
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_usb_config_is_negotiated() {
        let mock = MockBackend::new();
        mock.add_card("usb", 2, PcmCaps::new([44100], [1]));
        mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));

        let preferred = plan().usb_config;
        let negotiated = negotiate(&mock, PcmId::playback(2, 0), &preferred);
        assert_eq!(negotiated.rate, 44100);
        assert_eq!(negotiated.channels, 1);
        assert_eq!(negotiated.period_size, preferred.period_size);

        let missing = negotiate(&mock, PcmId::playback(9, 0), &preferred);
        assert_eq!(missing, preferred);
    }

    #[test]
    fn test_loopback_stats_default() {
        let stats = LoopbackStats::default();
        assert_eq!(stats.usb_to_bt.iterations, 0);
        assert_eq!(stats.bt_to_usb.frames_relayed, 0);
    }
}
