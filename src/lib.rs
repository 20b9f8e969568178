//! # hfp-audio-hal
//!
//! Audio hardware abstraction for devices with a primary codec, a USB audio
//! card and a Bluetooth SCO link.
//!
//! `hfp-audio-hal` exposes one logical output and one logical input stream
//! to an audio framework while the physical endpoint behind them changes
//! with call state: the primary codec normally, the 8 kHz mono Bluetooth
//! link while a hands-free call is diverted, or nothing at all while the
//! USB ↔ Bluetooth loopback bridge owns the hardware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hfp_audio_hal::{AudioConfig, AudioHwDevice, ProcAsound};
//! # use hfp_audio_hal::pcm::MockBackend;
//! # let backend = MockBackend::new();
//!
//! let device = AudioHwDevice::builder()
//!     .backend(backend)                       // ALSA, cpal, or a mock
//!     .card_lookup(ProcAsound::new())         // /proc/asound/<driver>
//!     .on_event(|e| tracing::warn!(?e, "hal event"))
//!     .open()?;
//!
//! let (out, config) = device.open_output_stream(&AudioConfig::default())?;
//! let period = vec![0u8; out.buffer_size()];
//! out.write(&period);                         // always reports period.len()
//!
//! // Hands-free call: divert streams to the Bluetooth link and bridge USB
//! device.set_parameters("card=2;bt_sco=on")?;
//! // ...
//! device.set_parameters("bt_sco=off")?;
//! # Ok::<(), hfp_audio_hal::HalError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Streams**: blocking `read`/`write` calls from framework threads.
//!   Endpoints open lazily and drop to standby on request, on route change
//!   or when the device layer forces it.
//! - **Device lock**: one mutex for card selection, routing masks and
//!   call flags. Taken before any stream lock and released before the
//!   blocking transfer.
//! - **Loopback threads**: two relay loops (`usb_to_bt`, `bt_to_usb`) that
//!   run outside the framework's calls and stop cooperatively on a shared
//!   cancellation token.
//!
//! Transfers never report short counts. Failures surface as latency,
//! silence and [`HalEvent`]s.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod card;
mod config;
mod device;
mod error;
mod event;
pub mod format;
mod params;
pub mod pcm;
mod pipeline;
mod route;
mod session;
mod stream;

pub use builder::HalBuilder;
pub use card::{CardLookup, CardResolver, ProcAsound};
pub use config::{AudioConfig, HalConfig, PcmConfig};
pub use device::{AudioHwDevice, AudioMode};
pub use error::{HalError, PcmError, ResamplerError};
pub use event::{event_callback, EventCallback, HalEvent};
pub use params::KvPairs;
pub use pipeline::RelayStats;
pub use route::{
    routes_for, LogRouter, RouteApplier, DEVICE_BIT_IN, DEVICE_IN_BUILTIN_MIC,
    DEVICE_IN_WIRED_HEADSET, DEVICE_OUT_SPEAKER, DEVICE_OUT_WIRED_HEADPHONE,
    DEVICE_OUT_WIRED_HEADSET,
};
pub use session::{LoopbackPlan, LoopbackSession, LoopbackStats};
pub use stream::{throttle_duration, InputStream, OutputStream, StreamStatus};
