//! Hardware PCM endpoints through cpal (ALSA on Linux).
//!
//! cpal streams are callback driven and cannot leave the thread that built
//! them, so every open endpoint owns a small thread that builds the stream,
//! plays it and waits to be told to stop. Samples cross between that
//! callback and the blocking `read`/`write` through a ring buffer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{Direction, PcmBackend, PcmCaps, PcmId, PcmStream};
use crate::{PcmConfig, PcmError};

/// Symmetric i16 max for audio conversion (avoids asymmetric clipping).
const I16_MAX_SYMMETRIC: f32 = i16::MAX as f32;

/// Rates probed against each supported config range.
const PROBE_RATES: [u32; 7] = [8000, 16000, 32000, 44100, 48000, 88200, 96000];

/// Poll interval while a blocking transfer waits for the callback.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// PCM backend for real sound cards.
///
/// Card indices are mapped to cpal devices named `hw:<card>,<device>` or
/// `hw:CARD=<id>,DEV=<device>`, where `<id>` is read from
/// `/proc/asound/card<card>/id`.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    proc_root: PathBuf,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    /// Creates a backend using `/proc/asound` for card ids.
    pub fn new() -> Self {
        Self::with_proc_root("/proc/asound")
    }

    /// Creates a backend reading card ids below `root`.
    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn card_id(&self, card: u32) -> Option<String> {
        let path = self.proc_root.join(format!("card{card}")).join("id");
        std::fs::read_to_string(path)
            .ok()
            .map(|id| id.trim().to_string())
    }

    /// Returns the cpal device names that may stand for `id`.
    fn device_names(&self, id: PcmId) -> Vec<String> {
        let mut names = vec![format!("hw:{},{}", id.card, id.device)];
        if let Some(card_id) = self.card_id(id.card) {
            names.push(format!("hw:CARD={card_id},DEV={}", id.device));
        }
        names
    }

    fn find_device(&self, id: PcmId) -> Option<Device> {
        let names = self.device_names(id);
        let host = cpal::default_host();
        let devices = match id.direction {
            Direction::Playback => host.output_devices().ok()?.collect::<Vec<_>>(),
            Direction::Capture => host.input_devices().ok()?.collect::<Vec<_>>(),
        };
        devices
            .into_iter()
            .find(|device| device.name().is_ok_and(|name| names.contains(&name)))
    }
}

impl PcmBackend for CpalBackend {
    fn open(&self, id: PcmId, config: &PcmConfig) -> Result<Box<dyn PcmStream>, PcmError> {
        let capacity = config.period_size * config.period_count * usize::from(config.channels);
        let (prod, cons) = HeapRb::<i16>::new(capacity.max(1)).split();
        let shared = Arc::new(Shared::default());

        let (ring, callback_end) = match id.direction {
            Direction::Playback => (Ring::Playback(prod), CallbackEnd::Playback(cons)),
            Direction::Capture => (Ring::Capture(cons), CallbackEnd::Capture(prod)),
        };

        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let backend = self.clone();
        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.rate),
            buffer_size: BufferSize::Fixed(config.period_size as u32),
        };
        let worker_shared = Arc::clone(&shared);

        let worker = std::thread::Builder::new()
            .name(format!("pcm-{}-{}", id.card, id.device))
            .spawn(move || {
                let stream = match backend.build_stream(id, &stream_config, callback_end, worker_shared) {
                    Ok(stream) => stream,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(PcmError::io(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Runs until the endpoint handle drops its sender.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PcmError::io(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(PcmError::io("pcm thread exited during open")));
        if let Err(error) = ready {
            let _ = worker.join();
            return Err(error);
        }

        let buffer_time = Duration::from_micros(
            (config.period_size * config.period_count) as u64 * 1_000_000 / u64::from(config.rate),
        );

        Ok(Box::new(CpalPcm {
            ring,
            shared,
            timeout: buffer_time * 2 + Duration::from_millis(100),
            stop: Some(stop_tx),
            worker: Some(worker),
        }))
    }

    fn capabilities(&self, id: PcmId) -> Option<PcmCaps> {
        let device = self.find_device(id)?;
        let ranges: Vec<_> = match id.direction {
            Direction::Playback => device.supported_output_configs().ok()?.collect(),
            Direction::Capture => device.supported_input_configs().ok()?.collect(),
        };

        let mut caps = PcmCaps::default();
        for range in ranges {
            if !matches!(range.sample_format(), SampleFormat::I16 | SampleFormat::F32) {
                continue;
            }
            if !caps.channels.contains(&range.channels()) {
                caps.channels.push(range.channels());
            }
            for rate in rates_in_range(range.min_sample_rate().0, range.max_sample_rate().0) {
                if !caps.rates.contains(&rate) {
                    caps.rates.push(rate);
                }
            }
        }
        (!caps.rates.is_empty() && !caps.channels.is_empty()).then_some(caps)
    }
}

impl CpalBackend {
    fn build_stream(
        &self,
        id: PcmId,
        config: &StreamConfig,
        end: CallbackEnd,
        shared: Arc<Shared>,
    ) -> Result<Stream, PcmError> {
        let device = self.find_device(id).ok_or(PcmError::NotFound {
            card: id.card,
            device: id.device,
        })?;
        let format = match id.direction {
            Direction::Playback => device.default_output_config(),
            Direction::Capture => device.default_input_config(),
        }
        .map_err(|e| PcmError::io(e.to_string()))?
        .sample_format();

        let error_shared = Arc::clone(&shared);
        let on_error = move |err: cpal::StreamError| {
            tracing::error!(endpoint = %id, "pcm stream error: {}", err);
            error_shared.failed.store(true, Ordering::Release);
        };

        let result = match (end, format) {
            (CallbackEnd::Playback(mut cons), SampleFormat::I16) => device.build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let filled = cons.pop_slice(data);
                    if filled < data.len() {
                        data[filled..].fill(0);
                        shared.xrun.store(true, Ordering::Release);
                    }
                },
                on_error,
                None,
            ),
            (CallbackEnd::Playback(mut cons), SampleFormat::F32) => device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = match cons.try_pop() {
                            Some(s) => f32::from(s) / I16_MAX_SYMMETRIC,
                            None => {
                                shared.xrun.store(true, Ordering::Release);
                                0.0
                            }
                        };
                    }
                },
                on_error,
                None,
            ),
            (CallbackEnd::Capture(mut prod), SampleFormat::I16) => device.build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if prod.push_slice(data) < data.len() {
                        shared.xrun.store(true, Ordering::Release);
                    }
                },
                on_error,
                None,
            ),
            (CallbackEnd::Capture(mut prod), SampleFormat::F32) => device.build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        let converted = (sample * I16_MAX_SYMMETRIC).clamp(-I16_MAX_SYMMETRIC, I16_MAX_SYMMETRIC) as i16;
                        if prod.try_push(converted).is_err() {
                            shared.xrun.store(true, Ordering::Release);
                        }
                    }
                },
                on_error,
                None,
            ),
            (_, format) => {
                return Err(PcmError::not_ready(format!("unsupported sample format {format:?}")));
            }
        };

        result.map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => PcmError::NotFound {
                card: id.card,
                device: id.device,
            },
            BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
                PcmError::not_ready(e.to_string())
            }
            other => PcmError::io(other.to_string()),
        })
    }
}

/// Returns the probe rates within `min..=max`.
fn rates_in_range(min: u32, max: u32) -> impl Iterator<Item = u32> {
    PROBE_RATES
        .into_iter()
        .filter(move |rate| (min..=max).contains(rate))
}

#[derive(Default)]
struct Shared {
    /// Underrun (playback) or overrun (capture) since the last transfer.
    xrun: AtomicBool,
    /// The stream reported an error and delivers no more data.
    failed: AtomicBool,
}

enum Ring {
    Playback(HeapProd<i16>),
    Capture(HeapCons<i16>),
}

enum CallbackEnd {
    Playback(HeapCons<i16>),
    Capture(HeapProd<i16>),
}

struct CpalPcm {
    ring: Ring,
    shared: Arc<Shared>,
    timeout: Duration,
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalPcm {
    fn check_failed(&self) -> Result<(), PcmError> {
        if self.shared.failed.load(Ordering::Acquire) {
            Err(PcmError::io("stream failed"))
        } else {
            Ok(())
        }
    }
}

impl PcmStream for CpalPcm {
    fn read(&mut self, buf: &mut [i16]) -> Result<(), PcmError> {
        self.check_failed()?;
        let Ring::Capture(cons) = &mut self.ring else {
            return Err(PcmError::io("read on playback endpoint"));
        };

        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;
        while filled < buf.len() {
            filled += cons.pop_slice(&mut buf[filled..]);
            if filled < buf.len() {
                if Instant::now() >= deadline {
                    buf[filled..].fill(0);
                    return Err(PcmError::io("capture timed out"));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        if self.shared.xrun.swap(false, Ordering::AcqRel) {
            return Err(PcmError::Overrun);
        }
        Ok(())
    }

    fn write(&mut self, buf: &[i16]) -> Result<(), PcmError> {
        self.check_failed()?;
        let Ring::Playback(prod) = &mut self.ring else {
            return Err(PcmError::io("write on capture endpoint"));
        };

        let deadline = Instant::now() + self.timeout;
        let mut written = 0;
        while written < buf.len() {
            written += prod.push_slice(&buf[written..]);
            if written < buf.len() {
                if Instant::now() >= deadline {
                    return Err(PcmError::io("playback timed out"));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        // Report an underrun once the ring had run dry and is refilled.
        if self.shared.xrun.swap(false, Ordering::AcqRel) && prod.occupied_len() <= buf.len() {
            return Err(PcmError::Underrun);
        }
        Ok(())
    }
}

impl Drop for CpalPcm {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_in_range() {
        let rates: Vec<_> = rates_in_range(8000, 48000).collect();
        assert_eq!(rates, vec![8000, 16000, 32000, 44100, 48000]);
        assert_eq!(rates_in_range(22050, 22050).count(), 0);
    }

    #[test]
    fn test_device_names_use_proc_card_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("card1")).unwrap();
        std::fs::write(dir.path().join("card1").join("id"), "PCH\n").unwrap();

        let backend = CpalBackend::with_proc_root(dir.path());
        assert_eq!(
            backend.device_names(PcmId::playback(1, 0)),
            vec!["hw:1,0".to_string(), "hw:CARD=PCH,DEV=0".to_string()]
        );
        assert_eq!(backend.device_names(PcmId::capture(4, 2)), vec!["hw:4,2".to_string()]);
    }

    // Note: Device tests require actual audio hardware and are skipped in CI
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_first_card() {
        let backend = CpalBackend::new();
        let id = PcmId::playback(0, 0);
        let caps = backend.capabilities(id).unwrap();
        let config = caps.negotiate(&PcmConfig::playback(48000, 2, 1024, 4));

        let mut stream = backend.open(id, &config).unwrap();
        let silence = vec![0i16; config.period_size * usize::from(config.channels)];
        for _ in 0..10 {
            let _ = stream.write(&silence);
        }
    }
}
