//! Framework-facing streams and their lifecycle.
//!
//! A stream is in one of three states:
//!
//! - **Standby**: no endpoint held. The next `read`/`write` opens one.
//! - **Active**: an endpoint is held until standby is requested, forced by
//!   the device layer, or the desired route changes.
//! - **Unavailable**: the hardware refused the configuration once. Sticky
//!   until the stream is closed.
//!
//! Every transfer takes the device lock, then the stream lock. The device
//! lock is dropped before the blocking transfer; the stream lock is held
//! throughout. Transfers always report the full byte count and throttle
//! on failure (except underruns) so callers cannot spin faster than real
//! time.

mod input;
mod output;
pub(crate) mod sco;

pub use input::InputStream;
pub use output::OutputStream;

use std::fmt;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::device::{DeviceContext, DeviceState, Route};
use crate::event::{emit, HalEvent};
use crate::pcm::{Direction, PcmHandle, PcmId};
use crate::{PcmConfig, PcmError};

/// Observable lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// No endpoint held.
    Standby,
    /// An endpoint is open.
    Active,
    /// The hardware refused the stream; close and reopen to recover.
    Unavailable,
}

/// Returns how long `bytes` of audio last in real time.
///
/// Computed as `bytes * 1_000_000 / frame_size / sample_rate` microseconds.
pub fn throttle_duration(bytes: usize, frame_size: usize, sample_rate: u32) -> Duration {
    if frame_size == 0 || sample_rate == 0 {
        return Duration::ZERO;
    }
    let micros = bytes as u64 * 1_000_000 / frame_size as u64 / u64::from(sample_rate);
    Duration::from_micros(micros)
}

/// A mutex with a pre-lock.
///
/// Lockers take the pre-lock, then the main lock, then release the
/// pre-lock. A thread that keeps re-locking in a loop therefore queues
/// behind any thread already waiting, so control-plane calls are not
/// starved by a busy transfer loop.
pub(crate) struct StreamLock<T> {
    pre_lock: Mutex<()>,
    lock: Mutex<T>,
}

impl<T> StreamLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            pre_lock: Mutex::new(()),
            lock: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let _pre = self.pre_lock.lock();
        self.lock.lock()
    }
}

/// Mutable per-stream state, guarded by the stream lock.
pub(crate) struct StreamState {
    standby: bool,
    unavailable: bool,
    frames: u64,
    handle: Option<PcmHandle>,
    route: Option<Route>,
    scratch: Vec<i16>,
}

impl StreamState {
    fn new(scratch: Vec<i16>) -> Self {
        Self {
            standby: true,
            unavailable: false,
            frames: 0,
            handle: None,
            route: None,
            scratch,
        }
    }

    fn status(&self) -> StreamStatus {
        if self.unavailable {
            StreamStatus::Unavailable
        } else if self.standby {
            StreamStatus::Standby
        } else {
            StreamStatus::Active
        }
    }

    /// Closes the endpoint. Returns `true` if the stream was active.
    pub(crate) fn enter_standby(&mut self) -> bool {
        self.handle = None;
        self.route = None;
        !std::mem::replace(&mut self.standby, true)
    }
}

/// A stream's direction and lock-protected state.
pub(crate) struct StreamCore {
    direction: Direction,
    state: StreamLock<StreamState>,
}

impl StreamCore {
    pub(crate) fn new(direction: Direction, scratch: Vec<i16>) -> Self {
        Self {
            direction,
            state: StreamLock::new(StreamState::new(scratch)),
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock()
    }
}

/// Why a transfer did not reach the hardware.
#[derive(Debug)]
pub(crate) enum TransferError {
    /// The stream was marked unavailable earlier.
    Unavailable,
    /// The loopback bridge owns the hardware.
    Suspended,
    /// Diverted, but no Bluetooth card is present.
    NoBluetoothCard,
    /// The endpoint failed to open or transfer.
    Pcm(PcmError),
}

impl TransferError {
    fn is_underrun(&self) -> bool {
        matches!(self, Self::Pcm(PcmError::Underrun))
    }
}

impl From<PcmError> for TransferError {
    fn from(error: PcmError) -> Self {
        Self::Pcm(error)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("stream unavailable"),
            Self::Suspended => f.write_str("hardware held by loopback"),
            Self::NoBluetoothCard => f.write_str("no bluetooth card present"),
            Self::Pcm(error) => error.fmt(f),
        }
    }
}

/// Brings the stream to a state where it can transfer, returning the route
/// its endpoint was opened for.
///
/// Consumes a pending forced standby, drops an endpoint opened for a route
/// that is no longer wanted, and opens a new one if in standby. Called with
/// both the device and the stream lock held.
pub(crate) fn prepare_transfer(
    ctx: &DeviceContext,
    dev: &mut DeviceState,
    st: &mut StreamState,
    direction: Direction,
    app: &PcmConfig,
) -> Result<Route, TransferError> {
    if dev.take_forced_standby(direction) && st.enter_standby() {
        tracing::info!(%direction, "forced standby");
        emit(
            ctx.events(),
            HalEvent::StandbyEntered {
                direction,
                forced: true,
            },
        );
    }

    let desired = dev.desired_route();
    if st.route.is_some() && st.route != desired && st.enter_standby() {
        tracing::info!(%direction, ?desired, "route changed, reopening");
        emit(
            ctx.events(),
            HalEvent::StandbyEntered {
                direction,
                forced: true,
            },
        );
    }

    if !st.standby {
        if let Some(route) = st.route {
            return Ok(route);
        }
    }

    if st.unavailable {
        return Err(TransferError::Unavailable);
    }
    let Some(route) = desired else {
        return Err(TransferError::Suspended);
    };

    let (id, config) = match route {
        Route::Primary => (
            PcmId {
                card: dev.primary_card(direction),
                device: ctx.config().pcm_device,
                direction,
            },
            *app,
        ),
        Route::Bluetooth => {
            let card = ctx
                .refresh_bt_card(dev)
                .ok_or(TransferError::NoBluetoothCard)?;
            (
                PcmId {
                    card,
                    device: ctx.config().pcm_device,
                    direction,
                },
                ctx.bt_config(direction),
            )
        }
    };

    match PcmHandle::open(ctx.backend(), id, &config) {
        Ok(handle) => {
            st.handle = Some(handle);
            st.route = Some(route);
            st.standby = false;
            ctx.select_routes(dev);
            emit(ctx.events(), HalEvent::EndpointOpened { id });
            Ok(route)
        }
        Err(PcmError::NotReady { reason }) => {
            st.unavailable = true;
            tracing::error!(%direction, endpoint = %id, %reason, "endpoint not ready, stream unavailable");
            emit(
                ctx.events(),
                HalEvent::StreamUnavailable {
                    direction,
                    reason,
                },
            );
            Err(TransferError::Unavailable)
        }
        Err(error) => Err(error.into()),
    }
}

/// Logs a failed transfer, notifies listeners and sleeps unless it was an
/// underrun.
pub(crate) fn absorb_failure(
    ctx: &DeviceContext,
    direction: Direction,
    error: &TransferError,
    bytes: usize,
    app: &PcmConfig,
) {
    if let TransferError::Pcm(pcm_error) = error {
        emit(
            ctx.events(),
            HalEvent::TransferFailed {
                direction,
                error: pcm_error.clone(),
            },
        );
    }

    if error.is_underrun() && direction == Direction::Playback {
        tracing::debug!(%direction, "underrun");
        return;
    }

    let delay = throttle_duration(bytes, app.frame_bytes(), app.rate);
    tracing::warn!(%direction, %error, delay_us = delay.as_micros() as u64, "transfer failed, throttling");
    std::thread::sleep(delay);
}

/// Puts a stream into standby under both locks, as the framework asks.
pub(crate) fn standby(ctx: &DeviceContext, core: &StreamCore) {
    let _dev = ctx.lock_state();
    let mut st = core.lock();
    if st.enter_standby() {
        tracing::info!(direction = %core.direction(), "standby");
        emit(
            ctx.events(),
            HalEvent::StandbyEntered {
                direction: core.direction(),
                forced: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_throttle_duration() {
        // 100ms of 48kHz stereo 16-bit
        assert_eq!(throttle_duration(19200, 4, 48000), Duration::from_millis(100));
        // 10ms of 8kHz mono
        assert_eq!(throttle_duration(160, 2, 8000), Duration::from_millis(10));
        assert_eq!(throttle_duration(100, 0, 48000), Duration::ZERO);
    }

    #[test]
    fn test_stream_state_transitions() {
        let mut state = StreamState::new(Vec::new());
        assert_eq!(state.status(), StreamStatus::Standby);
        assert!(!state.enter_standby());

        state.standby = false;
        assert_eq!(state.status(), StreamStatus::Active);
        assert!(state.enter_standby());
        assert_eq!(state.status(), StreamStatus::Standby);

        state.unavailable = true;
        assert_eq!(state.status(), StreamStatus::Unavailable);
    }

    #[test]
    fn test_pre_lock_serialises_lockers() {
        let lock = Arc::new(StreamLock::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_transfer_error_display() {
        assert_eq!(TransferError::Suspended.to_string(), "hardware held by loopback");
        assert_eq!(TransferError::from(PcmError::Underrun).to_string(), "underrun");
        assert!(TransferError::Pcm(PcmError::Underrun).is_underrun());
        assert!(!TransferError::Unavailable.is_underrun());
    }
}
