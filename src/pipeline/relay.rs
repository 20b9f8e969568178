//! Relay worker - moves one period at a time from a source endpoint to a
//! sink endpoint, converting format on the way.
//!
//! Each loopback direction runs one `Relay` on its own thread:
//! - Reading one aligned period from the source
//! - Remapping and resampling it to the sink's format
//! - Writing it to the sink
//!
//! Failures are counted and logged, never fatal. The loop ends only when
//! the shared cancellation token fires, and the worker then drops both of
//! its endpoints itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::event::{emit, EventCallback, HalEvent};
use crate::format::{FormatConverter, Quality};
use crate::pcm::PcmHandle;
use crate::stream::throttle_duration;
use crate::{AudioConfig, PcmError};

/// Iterations between periodic statistics logs.
const STATS_LOG_INTERVAL: u64 = 500;

/// Snapshot of one relay direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Loop iterations started.
    pub iterations: u64,
    /// Frames written to the sink.
    pub frames_relayed: u64,
    /// Failed source reads.
    pub read_errors: u64,
    /// Failed sink writes.
    pub write_errors: u64,
}

/// Counters shared between a relay thread and its session.
#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    iterations: AtomicU64,
    frames_relayed: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

impl RelayCounters {
    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// One direction of the loopback bridge.
pub(crate) struct Relay {
    name: &'static str,
    source: PcmHandle,
    sink: PcmHandle,
    quality: Quality,
    counters: Arc<RelayCounters>,
    events: Option<EventCallback>,
}

impl Relay {
    pub(crate) fn new(
        name: &'static str,
        source: PcmHandle,
        sink: PcmHandle,
        quality: Quality,
        counters: Arc<RelayCounters>,
        events: Option<EventCallback>,
    ) -> Self {
        Self {
            name,
            source,
            sink,
            quality,
            counters,
            events,
        }
    }

    /// Creates the converter for this direction.
    ///
    /// `None` means conversion is unavailable and silence is relayed.
    fn converter(&self) -> Option<FormatConverter> {
        let src = AudioConfig::from(self.source.config());
        let dst = AudioConfig::from(self.sink.config());
        match FormatConverter::new(src, dst, self.quality) {
            Ok(converter) => {
                tracing::debug!(
                    relay = self.name,
                    passthrough = converter.is_passthrough(),
                    "relay converter ready"
                );
                Some(converter)
            }
            Err(e) => {
                tracing::warn!(relay = self.name, error = %e, "relay resampler unavailable, relaying silence");
                emit(
                    self.events.as_ref(),
                    HalEvent::ResamplerUnavailable {
                        path: self.name,
                        reason: e.to_string(),
                    },
                );
                None
            }
        }
    }

    /// Runs until `token` is cancelled, then closes both endpoints.
    ///
    /// Cancellation is observed between iterations, so shutdown takes at
    /// most one period per direction.
    pub(crate) fn run(self, token: &CancellationToken) {
        let mut converter = self.converter();
        let Self {
            name,
            mut source,
            mut sink,
            counters,
            ..
        } = self;

        let src = *source.config();
        let dst = *sink.config();
        let frames = src.aligned_period();
        let mut input = vec![0i16; frames * usize::from(src.channels)];
        let silent_frames = (frames as u64 * u64::from(dst.rate)).div_ceil(u64::from(src.rate)) as usize;
        let silence = vec![0i16; silent_frames * usize::from(dst.channels)];

        tracing::info!(
            relay = name,
            source = %source.id(),
            sink = %sink.id(),
            frames,
            "relay started"
        );

        while !token.is_cancelled() {
            let iteration = counters.iterations.fetch_add(1, Ordering::Relaxed) + 1;

            if let Err(error) = source.read(&mut input) {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(relay = name, %error, "relay read failed");
                std::thread::sleep(throttle_duration(
                    input.len() * crate::config::SAMPLE_BYTES,
                    src.frame_bytes(),
                    src.rate,
                ));
                continue;
            }

            let output = match converter.as_mut() {
                Some(converter) => converter.convert(&input),
                None => silence.as_slice(),
            };

            match sink.write(output) {
                Ok(()) => {
                    let written = output.len() / usize::from(dst.channels);
                    counters
                        .frames_relayed
                        .fetch_add(written as u64, Ordering::Relaxed);
                }
                Err(error) => {
                    counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(relay = name, %error, "relay write failed");
                    if error != PcmError::Underrun {
                        std::thread::sleep(throttle_duration(
                            output.len() * crate::config::SAMPLE_BYTES,
                            dst.frame_bytes(),
                            dst.rate,
                        ));
                    }
                }
            }

            if iteration % STATS_LOG_INTERVAL == 0 {
                let stats = counters.snapshot();
                tracing::debug!(
                    relay = name,
                    iterations = stats.iterations,
                    frames = stats.frames_relayed,
                    read_errors = stats.read_errors,
                    write_errors = stats.write_errors,
                    "relay stats"
                );
            }
        }

        drop(source);
        drop(sink);
        tracing::info!(relay = name, "relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::{MockBackend, PcmCaps, PcmId};
    use crate::PcmConfig;
    use std::time::Duration;

    fn mock() -> MockBackend {
        let mock = MockBackend::new();
        mock.add_card("usb", 2, PcmCaps::new([48000], [2]));
        mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
        mock.set_io_delay(Duration::from_millis(1));
        mock
    }

    fn spawn_relay(mock: &MockBackend, token: &CancellationToken) -> (Arc<RelayCounters>, std::thread::JoinHandle<()>) {
        let usb = PcmConfig::capture(48000, 2, 480, 5);
        let bt = PcmConfig::playback(8000, 1, 80, 50);
        let source = PcmHandle::open(mock, PcmId::capture(2, 0), &usb).unwrap();
        let sink = PcmHandle::open(mock, PcmId::playback(3, 0), &bt).unwrap();
        let counters = Arc::new(RelayCounters::default());
        let relay = Relay::new("usb_to_bt", source, sink, Quality::Default, Arc::clone(&counters), None);
        let token = token.clone();
        let handle = std::thread::spawn(move || relay.run(&token));
        (counters, handle)
    }

    #[test]
    fn test_relay_converts_and_stops_on_cancel() {
        let mock = mock();
        mock.feed_capture(2, 0, &crate::pcm::sine_wave(48000, 2, 440.0, 4800));

        let token = CancellationToken::new();
        let (counters, handle) = spawn_relay(&mock, &token);
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        handle.join().unwrap();

        let stats = counters.snapshot();
        assert!(stats.iterations > 0);
        assert_eq!(stats.read_errors, 0);
        // 480 frames at 48kHz become 80 frames at 8kHz, mono
        let played = mock.played(3, 0);
        assert!(!played.is_empty());
        assert_eq!(played.len() as u64, stats.frames_relayed);
        assert!(mock.open_endpoints().is_empty());
    }

    #[test]
    fn test_relay_survives_errors() {
        let mock = mock();
        mock.inject_read_error(2, PcmError::Overrun);
        mock.inject_write_error(3, PcmError::Underrun);

        let token = CancellationToken::new();
        let (counters, handle) = spawn_relay(&mock, &token);
        std::thread::sleep(Duration::from_millis(40));
        token.cancel();
        handle.join().unwrap();

        let stats = counters.snapshot();
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.write_errors, 1);
        assert!(stats.iterations > 2);
    }

    #[test]
    fn test_cancelled_before_start_closes_endpoints() {
        let mock = mock();
        let token = CancellationToken::new();
        token.cancel();
        let (counters, handle) = spawn_relay(&mock, &token);
        handle.join().unwrap();

        assert_eq!(counters.snapshot(), RelayStats::default());
        assert!(mock.open_endpoints().is_empty());
    }
}
