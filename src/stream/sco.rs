//! Format conversion for streams diverted to the Bluetooth narrow-band link.
//!
//! Converters are created on the first diverted transfer of each direction
//! and belong to one diversion period. Every change of the diversion flags
//! starts a new generation; a converter built under an older one is
//! discarded before it is used again. They are never shared with the
//! loopback bridge.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::event::{emit, EventCallback, HalEvent};
use crate::format::{round_to_16_frames, FormatConverter, Quality, FRAME_ALIGNMENT};
use crate::pcm::PcmHandle;
use crate::{AudioConfig, PcmConfig, PcmError};

#[derive(Default)]
struct ScoDirection {
    converter: Option<FormatConverter>,
    /// Generation the converter and any pending samples belong to.
    generation: u64,
    /// Playback: app samples carried over to the next write.
    /// Capture: link samples read this period.
    staging: Vec<i16>,
    silence: Vec<i16>,
}

impl ScoDirection {
    /// Drops state left over from an earlier diversion period.
    fn sync(&mut self, generation: u64, path: &'static str) {
        if self.generation == generation {
            return;
        }
        if self.converter.take().is_some() {
            tracing::debug!(path, "stale sco resampler discarded");
        }
        self.staging.clear();
        self.generation = generation;
    }

    fn release(&mut self) -> bool {
        self.staging.clear();
        self.converter.take().is_some()
    }
}

/// Returns the converter in `slot`, creating it on first use.
fn ensure_converter<'a>(
    slot: &'a mut Option<FormatConverter>,
    path: &'static str,
    src: AudioConfig,
    dst: AudioConfig,
    quality: Quality,
    events: Option<&EventCallback>,
) -> Option<&'a mut FormatConverter> {
    if slot.is_none() {
        match FormatConverter::new(src, dst, quality) {
            Ok(converter) => {
                tracing::info!(path, "sco resampler created");
                *slot = Some(converter);
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "sco resampler unavailable, sending silence");
                emit(
                    events,
                    HalEvent::ResamplerUnavailable {
                        path,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }
    slot.as_mut()
}

/// Conversion state for both directions of the diverted path.
///
/// The direction mutexes are held across link I/O. Nothing that holds the
/// device lock may take them; [`ScoPath::invalidate`] only touches the
/// generation counter.
pub(crate) struct ScoPath {
    out: Mutex<ScoDirection>,
    input: Mutex<ScoDirection>,
    generation: AtomicU64,
    quality: Quality,
    events: Option<EventCallback>,
}

impl ScoPath {
    pub(crate) fn new(quality: Quality, events: Option<EventCallback>) -> Self {
        Self {
            out: Mutex::default(),
            input: Mutex::default(),
            generation: AtomicU64::new(0),
            quality,
            events,
        }
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new diversion period. Never blocks.
    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Converts app-format samples to the link format and writes them.
    ///
    /// Only whole 16-frame blocks are converted; a shorter tail is kept and
    /// sent ahead of the next write of the same period.
    pub(crate) fn write(
        &self,
        pcm: &mut PcmHandle,
        app: &PcmConfig,
        samples: &[i16],
    ) -> Result<(), PcmError> {
        let link = *pcm.config();
        let app_ch = usize::from(app.channels);

        let mut guard = self.out.lock();
        guard.sync(self.current(), "sco_out");
        let ScoDirection {
            converter,
            staging,
            silence,
            ..
        } = &mut *guard;
        staging.extend_from_slice(samples);
        let frames = staging.len() / app_ch / FRAME_ALIGNMENT * FRAME_ALIGNMENT;
        if frames == 0 {
            return Ok(());
        }
        let ready = frames * app_ch;

        let result = match ensure_converter(
            converter,
            "sco_out",
            AudioConfig::from(app),
            AudioConfig::from(&link),
            self.quality,
            self.events.as_ref(),
        ) {
            Some(conv) => pcm.write(conv.convert(&staging[..ready])),
            None => {
                let silent = frames * link.rate as usize / app.rate as usize;
                silence.clear();
                silence.resize(silent * usize::from(link.channels), 0);
                pcm.write(silence)
            }
        };
        staging.drain(..ready);
        result
    }

    /// Reads from the link and converts into app-format `out`.
    ///
    /// Frames the link did not deliver are left silent.
    pub(crate) fn read(
        &self,
        pcm: &mut PcmHandle,
        app: &PcmConfig,
        out: &mut [i16],
    ) -> Result<(), PcmError> {
        let link = *pcm.config();
        let app_frames = out.len() / usize::from(app.channels);
        let link_frames = round_to_16_frames(
            (app_frames as u64 * u64::from(link.rate)).div_ceil(u64::from(app.rate)) as usize,
        );

        let mut guard = self.input.lock();
        guard.sync(self.current(), "sco_in");
        let ScoDirection {
            converter, staging, ..
        } = &mut *guard;
        staging.clear();
        staging.resize(link_frames * usize::from(link.channels), 0);
        pcm.read(staging)?;

        match ensure_converter(
            converter,
            "sco_in",
            AudioConfig::from(&link),
            AudioConfig::from(app),
            self.quality,
            self.events.as_ref(),
        ) {
            Some(conv) => {
                let converted = conv.convert(staging);
                let n = converted.len().min(out.len());
                out[..n].copy_from_slice(&converted[..n]);
                out[n..].fill(0);
            }
            None => out.fill(0),
        }
        Ok(())
    }

    /// Drops both converters and their resampler state.
    ///
    /// Waits for a transfer in flight on either direction, so it must be
    /// called without the device lock.
    pub(crate) fn release(&self) {
        let released =
            usize::from(self.out.lock().release()) + usize::from(self.input.lock().release());
        if released > 0 {
            tracing::debug!(released, "sco resamplers released");
        }
    }

    /// Returns how many directions hold a converter of the current period.
    pub(crate) fn active_converters(&self) -> usize {
        let current = self.current();
        let live = |dir: &ScoDirection| dir.converter.is_some() && dir.generation == current;
        usize::from(live(&*self.out.lock())) + usize::from(live(&*self.input.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::{MockBackend, PcmCaps, PcmId};

    fn link_handle(mock: &MockBackend) -> PcmHandle {
        mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
        let config = PcmConfig::playback(8000, 1, 80, 2);
        PcmHandle::open(mock, PcmId::playback(3, 0), &config).unwrap()
    }

    #[test]
    fn test_partial_block_is_carried_over() {
        let mock = MockBackend::new();
        let mut pcm = link_handle(&mock);
        let app = PcmConfig::playback(48000, 2, 1024, 2);
        let sco = ScoPath::new(Quality::Default, None);

        // 1000 frames leave an 8-frame tail, which completes the next write.
        let first = vec![1000i16; 1000 * 2];
        let second = vec![1000i16; 1032 * 2];
        sco.write(&mut pcm, &app, &first).unwrap();
        sco.write(&mut pcm, &app, &second).unwrap();

        let played = mock.played(3, 0);
        assert_eq!(played.len(), 166 + 173);
        assert!(played[1..].iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_short_write_waits_for_a_full_block() {
        let mock = MockBackend::new();
        let mut pcm = link_handle(&mock);
        let app = PcmConfig::playback(48000, 2, 1024, 2);
        let sco = ScoPath::new(Quality::Default, None);

        sco.write(&mut pcm, &app, &[500i16; 10 * 2]).unwrap();
        assert!(mock.played(3, 0).is_empty());
        sco.write(&mut pcm, &app, &[500i16; 6 * 2]).unwrap();
        assert_eq!(mock.played(3, 0).len(), 3);
    }

    #[test]
    fn test_invalidate_discards_converter_and_tail() {
        let mock = MockBackend::new();
        let mut pcm = link_handle(&mock);
        let app = PcmConfig::playback(48000, 2, 1024, 2);
        let sco = ScoPath::new(Quality::Default, None);

        sco.write(&mut pcm, &app, &[1000i16; 40 * 2]).unwrap();
        assert_eq!(sco.active_converters(), 1);

        sco.invalidate();
        assert_eq!(sco.active_converters(), 0);

        // The 8-frame tail of the old period is gone and the new converter
        // starts from fresh history.
        mock.take_played(3, 0);
        sco.write(&mut pcm, &app, &[1000i16; 32 * 2]).unwrap();
        let played = mock.played(3, 0);
        assert_eq!(played.len(), 6);
        assert_eq!(played[0], 0);
        assert_eq!(sco.active_converters(), 1);
    }

    #[test]
    fn test_release_drops_both_directions() {
        let mock = MockBackend::new();
        let mut pcm = link_handle(&mock);
        let app = PcmConfig::playback(48000, 2, 1024, 2);
        let sco = ScoPath::new(Quality::Default, None);

        sco.write(&mut pcm, &app, &[0i16; 32 * 2]).unwrap();
        sco.release();
        assert_eq!(sco.active_converters(), 0);
        sco.release();
    }
}
