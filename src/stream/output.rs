//! Playback stream.

use std::sync::Arc;
use std::time::Duration;

use super::{absorb_failure, prepare_transfer, StreamCore, StreamState, StreamStatus, TransferError};
use crate::config::SAMPLE_BYTES;
use crate::device::{DeviceContext, Route};
use crate::params::KvPairs;
use crate::pcm::Direction;
use crate::{AudioConfig, PcmConfig};

/// A framework-facing playback stream.
///
/// Opened with [`AudioHwDevice::open_output_stream`]. The endpoint is
/// acquired lazily on the first [`write`](Self::write); dropping the stream
/// closes it.
///
/// [`AudioHwDevice::open_output_stream`]: crate::AudioHwDevice::open_output_stream
pub struct OutputStream {
    ctx: Arc<DeviceContext>,
    core: Arc<StreamCore>,
    config: PcmConfig,
    requested: AudioConfig,
}

impl OutputStream {
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        core: Arc<StreamCore>,
        config: PcmConfig,
        requested: AudioConfig,
    ) -> Self {
        Self {
            ctx,
            core,
            config,
            requested,
        }
    }

    /// Returns the negotiated stream format.
    pub fn config(&self) -> AudioConfig {
        AudioConfig::from(&self.config)
    }

    /// Returns the preferred write size in bytes (one period).
    pub fn buffer_size(&self) -> usize {
        self.config.period_bytes()
    }

    /// Returns the hardware buffer latency.
    pub fn latency(&self) -> Duration {
        let frames = (self.config.period_size * self.config.period_count) as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.config.rate))
    }

    /// Plays interleaved little-endian 16-bit samples.
    ///
    /// Always returns `buffer.len()`. If the data could not be delivered
    /// the call sleeps for the buffer's real-time duration instead, except
    /// after an underrun, which returns immediately.
    pub fn write(&self, buffer: &[u8]) -> usize {
        let bytes = buffer.len();
        if let Err(error) = self.write_inner(buffer) {
            absorb_failure(&self.ctx, Direction::Playback, &error, bytes, &self.config);
        }
        bytes
    }

    fn write_inner(&self, buffer: &[u8]) -> Result<(), TransferError> {
        let mut dev = self.ctx.lock_state();
        let mut st = self.core.lock();
        let route = prepare_transfer(&self.ctx, &mut dev, &mut st, Direction::Playback, &self.config)?;
        drop(dev);

        let StreamState {
            handle,
            scratch,
            frames,
            ..
        } = &mut *st;
        let Some(pcm) = handle.as_mut() else {
            return Err(TransferError::Unavailable);
        };

        scratch.clear();
        scratch.extend(
            buffer
                .chunks_exact(SAMPLE_BYTES)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );

        match route {
            Route::Primary => pcm.write(scratch)?,
            Route::Bluetooth => self.ctx.sco().write(pcm, &self.config, scratch)?,
        }

        *frames += (buffer.len() / self.config.frame_bytes()) as u64;
        Ok(())
    }

    /// Releases the endpoint. The next write reopens it.
    pub fn standby(&self) {
        super::standby(&self.ctx, &self.core);
    }

    /// Returns the current lifecycle state.
    pub fn status(&self) -> StreamStatus {
        self.core.lock().status()
    }

    /// Returns how many frames have been delivered to the hardware.
    pub fn frames_written(&self) -> u64 {
        self.core.lock().frames
    }

    /// Applies `routing=<mask>`.
    pub fn set_parameters(&self, kvpairs: &str) {
        let params = KvPairs::parse(kvpairs);
        if let Some(mask) = params.get_u32("routing") {
            let mut dev = self.ctx.lock_state();
            let _st = self.core.lock();
            self.ctx.update_routing(&mut dev, Direction::Playback, mask);
        }
    }

    /// Answers `sup_formats`, `sup_sampling_rates` and `sup_channels`
    /// from the requested config.
    pub fn get_parameters(&self, keys: &str) -> String {
        let query = KvPairs::parse(keys);
        let mut reply = KvPairs::new();
        if query.contains("sup_formats") {
            reply.push("sup_formats", self.requested.format_name());
        }
        if query.contains("sup_sampling_rates") {
            reply.push("sup_sampling_rates", self.requested.sample_rate.to_string());
        }
        if query.contains("sup_channels") {
            reply.push("sup_channels", self.requested.channel_mask_name(false));
        }
        reply.to_string()
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.ctx.close_stream(&self.core);
    }
}
