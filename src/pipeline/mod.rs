//! Loopback relay pipeline.
//!
//! Each direction of the loopback bridge is a single blocking loop on a
//! dedicated thread:
//!
//! ```text
//! source PCM → read period → remap → resample → sink PCM
//! ```
//!
//! When both endpoints share rate and channel count the converter is a
//! passthrough and the period is written as read.

mod relay;

pub use relay::RelayStats;
pub(crate) use relay::{Relay, RelayCounters};
