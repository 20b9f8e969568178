//! In-memory PCM backend for testing without hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::{PcmBackend, PcmCaps, PcmId, PcmStream};
use crate::card::CardLookup;
use crate::{PcmConfig, PcmError};

/// Capture queue size per card/device, in samples.
const CAPTURE_CAPACITY: usize = 1 << 20;

/// One entry of the mock's open/close ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// An endpoint was opened.
    Open(PcmId),
    /// An open attempt was refused (missing, busy or not ready).
    OpenRejected(PcmId),
    /// An endpoint was closed.
    Close(PcmId),
}

struct MockCard {
    name: String,
    caps: PcmCaps,
    not_ready: bool,
    fail_prepare: bool,
}

#[derive(Default)]
struct MockState {
    cards: HashMap<u32, MockCard>,
    open: HashSet<PcmId>,
    log: Vec<MockOp>,
    capture: HashMap<(u32, u32), HeapRb<i16>>,
    played: HashMap<(u32, u32), Vec<i16>>,
    read_faults: HashMap<u32, VecDeque<PcmError>>,
    write_faults: HashMap<u32, VecDeque<PcmError>>,
    io_delay: Duration,
}

/// A scriptable set of sound cards.
///
/// Cards are registered by driver name and index, so the same object
/// serves as [`PcmBackend`] and [`CardLookup`]. Every open and close is
/// recorded, and opening an endpoint that is already open is refused with
/// [`PcmError::Busy`], mirroring exclusive hardware access.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::pcm::{MockBackend, PcmCaps, PcmHandle, PcmId};
/// use hfp_audio_hal::PcmConfig;
///
/// let mock = MockBackend::new();
/// mock.add_card("PCH", 0, PcmCaps::new([48000], [2]));
///
/// let config = PcmConfig::playback(48000, 2, 1024, 4);
/// let mut pcm = PcmHandle::open(&mock, PcmId::playback(0, 0), &config).unwrap();
/// pcm.write(&[1, 2, 3, 4]).unwrap();
/// drop(pcm);
///
/// assert_eq!(mock.played(0, 0), vec![1, 2, 3, 4]);
/// assert!(!mock.is_open(PcmId::playback(0, 0)));
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Creates a backend with no cards.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read and write block for `delay`, simulating a period.
    pub fn set_io_delay(&self, delay: Duration) {
        self.state.lock().io_delay = delay;
    }

    /// Registers a card under a driver name.
    pub fn add_card(&self, name: impl Into<String>, index: u32, caps: PcmCaps) {
        self.state.lock().cards.insert(
            index,
            MockCard {
                name: name.into(),
                caps,
                not_ready: false,
                fail_prepare: false,
            },
        );
    }

    /// Unplugs a card. Already open endpoints stay usable until closed.
    pub fn remove_card(&self, index: u32) {
        self.state.lock().cards.remove(&index);
    }

    /// Makes opens on `card` fail with [`PcmError::NotReady`].
    pub fn set_not_ready(&self, card: u32, not_ready: bool) {
        if let Some(entry) = self.state.lock().cards.get_mut(&card) {
            entry.not_ready = not_ready;
        }
    }

    /// Makes `prepare` fail on every endpoint of `card`.
    pub fn set_fail_prepare(&self, card: u32, fail: bool) {
        if let Some(entry) = self.state.lock().cards.get_mut(&card) {
            entry.fail_prepare = fail;
        }
    }

    /// Queues an error for the next write on `card`.
    pub fn inject_write_error(&self, card: u32, error: PcmError) {
        self.state
            .lock()
            .write_faults
            .entry(card)
            .or_default()
            .push_back(error);
    }

    /// Queues an error for the next read on `card`.
    pub fn inject_read_error(&self, card: u32, error: PcmError) {
        self.state
            .lock()
            .read_faults
            .entry(card)
            .or_default()
            .push_back(error);
    }

    /// Queues capture samples for `card`/`device`. Returns how many fit.
    pub fn feed_capture(&self, card: u32, device: u32, samples: &[i16]) -> usize {
        self.state
            .lock()
            .capture
            .entry((card, device))
            .or_insert_with(|| HeapRb::new(CAPTURE_CAPACITY))
            .push_slice(samples)
    }

    /// Returns how many capture samples are still queued.
    pub fn pending_capture(&self, card: u32, device: u32) -> usize {
        self.state
            .lock()
            .capture
            .get(&(card, device))
            .map_or(0, |rb| rb.occupied_len())
    }

    /// Returns everything played to `card`/`device` so far.
    pub fn played(&self, card: u32, device: u32) -> Vec<i16> {
        self.state
            .lock()
            .played
            .get(&(card, device))
            .cloned()
            .unwrap_or_default()
    }

    /// Takes everything played to `card`/`device`, clearing it.
    pub fn take_played(&self, card: u32, device: u32) -> Vec<i16> {
        self.state
            .lock()
            .played
            .remove(&(card, device))
            .unwrap_or_default()
    }

    /// Returns the open/close ledger.
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().log.clone()
    }

    /// Clears the open/close ledger.
    pub fn clear_ops(&self) {
        self.state.lock().log.clear();
    }

    /// Counts successful opens of `id`.
    pub fn open_count(&self, id: PcmId) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|op| **op == MockOp::Open(id))
            .count()
    }

    /// Returns `true` if `id` is currently open.
    pub fn is_open(&self, id: PcmId) -> bool {
        self.state.lock().open.contains(&id)
    }

    /// Returns every currently open endpoint.
    pub fn open_endpoints(&self) -> Vec<PcmId> {
        self.state.lock().open.iter().copied().collect()
    }
}

impl PcmBackend for MockBackend {
    fn open(&self, id: PcmId, _config: &PcmConfig) -> Result<Box<dyn PcmStream>, PcmError> {
        let mut state = self.state.lock();

        let refusal = match state.cards.get(&id.card) {
            None => Some(PcmError::NotFound {
                card: id.card,
                device: id.device,
            }),
            Some(_) if state.open.contains(&id) => Some(PcmError::Busy {
                card: id.card,
                device: id.device,
            }),
            Some(card) if card.not_ready => Some(PcmError::not_ready("hardware rejected config")),
            Some(_) => None,
        };

        if let Some(error) = refusal {
            state.log.push(MockOp::OpenRejected(id));
            return Err(error);
        }

        state.open.insert(id);
        state.log.push(MockOp::Open(id));
        let io_delay = state.io_delay;

        Ok(Box::new(MockPcm {
            id,
            io_delay,
            state: Arc::clone(&self.state),
        }))
    }

    fn capabilities(&self, id: PcmId) -> Option<PcmCaps> {
        self.state
            .lock()
            .cards
            .get(&id.card)
            .map(|card| card.caps.clone())
    }
}

impl CardLookup for MockBackend {
    fn resolve_card(&self, driver_name: &str) -> Option<u32> {
        self.state
            .lock()
            .cards
            .iter()
            .find(|(_, card)| card.name == driver_name)
            .map(|(&index, _)| index)
    }
}

/// An open mock endpoint.
struct MockPcm {
    id: PcmId,
    io_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockPcm {
    fn pace(&self) {
        if !self.io_delay.is_zero() {
            std::thread::sleep(self.io_delay);
        }
    }
}

impl PcmStream for MockPcm {
    fn prepare(&mut self) -> Result<(), PcmError> {
        let state = self.state.lock();
        match state.cards.get(&self.id.card) {
            Some(card) if card.fail_prepare => Err(PcmError::io("prepare failed")),
            _ => Ok(()),
        }
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<(), PcmError> {
        let result = {
            let mut state = self.state.lock();
            match state
                .read_faults
                .get_mut(&self.id.card)
                .and_then(VecDeque::pop_front)
            {
                Some(error) => Err(error),
                None => {
                    let filled = state
                        .capture
                        .get_mut(&(self.id.card, self.id.device))
                        .map_or(0, |rb| rb.pop_slice(buf));
                    buf[filled..].fill(0);
                    Ok(())
                }
            }
        };
        self.pace();
        result
    }

    fn write(&mut self, buf: &[i16]) -> Result<(), PcmError> {
        let result = {
            let mut state = self.state.lock();
            match state
                .write_faults
                .get_mut(&self.id.card)
                .and_then(VecDeque::pop_front)
            {
                Some(error) => Err(error),
                None => {
                    state
                        .played
                        .entry((self.id.card, self.id.device))
                        .or_default()
                        .extend_from_slice(buf);
                    Ok(())
                }
            }
        };
        self.pace();
        result
    }
}

impl Drop for MockPcm {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.open.remove(&self.id);
        state.log.push(MockOp::Close(self.id));
    }
}

/// Generates an interleaved sine wave, the same value on every channel.
pub fn sine_wave(sample_rate: u32, channels: u16, frequency: f64, frames: usize) -> Vec<i16> {
    let sample_rate = f64::from(sample_rate);
    (0..frames)
        .flat_map(|i| {
            let t = i as f64 / sample_rate;
            let value = (2.0 * std::f64::consts::PI * frequency * t).sin();
            std::iter::repeat((value * 32767.0) as i16).take(usize::from(channels))
        })
        .collect()
}
