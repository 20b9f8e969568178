//! Runtime events for monitoring the HAL.
//!
//! Events are non-fatal notifications. Streams and the loopback bridge keep
//! running after any event; they are for logging and metrics, not error
//! handling.

use std::sync::Arc;

use crate::pcm::{Direction, PcmId};
use crate::PcmError;

/// Runtime events emitted by streams, the diversion path and the loopback bridge.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::HalEvent;
///
/// fn handle_event(event: HalEvent) {
///     match event {
///         HalEvent::TransferFailed { direction, error } => {
///             eprintln!("{direction} transfer failed: {error}");
///         }
///         HalEvent::LoopbackFailed { reason } => {
///             eprintln!("loopback did not start: {reason}");
///         }
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum HalEvent {
    /// A stream acquired its endpoint.
    EndpointOpened {
        /// The endpoint that was opened.
        id: PcmId,
    },

    /// A stream released its endpoint.
    StandbyEntered {
        /// Stream direction.
        direction: Direction,
        /// `true` if requested by the device layer rather than the framework.
        forced: bool,
    },

    /// A stream became permanently unavailable.
    ///
    /// The stream must be closed and reopened to recover.
    StreamUnavailable {
        /// Stream direction.
        direction: Direction,
        /// What the hardware reported.
        reason: String,
    },

    /// A read or write failed; the caller still saw a full transfer.
    TransferFailed {
        /// Stream direction.
        direction: Direction,
        /// The underlying failure.
        error: PcmError,
    },

    /// Call-audio diversion to the Bluetooth link was switched.
    DiversionChanged {
        /// Whether streams are now diverted.
        active: bool,
    },

    /// The USB ↔ Bluetooth loopback bridge is running.
    LoopbackStarted {
        /// USB card index.
        usb_card: u32,
        /// Bluetooth card index.
        bt_card: u32,
    },

    /// The loopback bridge was cancelled and both workers have exited.
    LoopbackStopped,

    /// The loopback bridge could not be started.
    LoopbackFailed {
        /// Why startup was aborted.
        reason: String,
    },

    /// A format conversion path has no resampler and falls back to silence.
    ResamplerUnavailable {
        /// Which path (`sco_out`, `sco_in`, `usb_to_bt`, `bt_to_usb`).
        path: &'static str,
        /// The creation error.
        reason: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Called from whichever thread hit the event, including real-time
/// transfer threads. Keep it short.
pub type EventCallback = Arc<dyn Fn(HalEvent) + Send + Sync>;

/// Creates an event callback from a closure.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::{event_callback, HalEvent};
///
/// let callback = event_callback(|event| {
///     tracing::warn!(?event, "hal event");
/// });
/// callback(HalEvent::LoopbackStopped);
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(HalEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Delivers `event` to `callback` if one is installed.
pub(crate) fn emit(callback: Option<&EventCallback>, event: HalEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hal_event_clone_eq() {
        let event = HalEvent::TransferFailed {
            direction: Direction::Playback,
            error: PcmError::Underrun,
        };
        assert_eq!(event.clone(), event);
    }

    #[test]
    fn test_event_callback_helper() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let callback = event_callback(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emit(Some(&callback), HalEvent::LoopbackStopped);
        emit(None, HalEvent::LoopbackStopped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
