//! Capture stream.

use std::sync::Arc;

use super::{absorb_failure, prepare_transfer, StreamCore, StreamState, StreamStatus, TransferError};
use crate::config::SAMPLE_BYTES;
use crate::device::{DeviceContext, Route};
use crate::params::KvPairs;
use crate::pcm::Direction;
use crate::{AudioConfig, PcmConfig};

/// A framework-facing capture stream.
///
/// Opened with [`AudioHwDevice::open_input_stream`]. The endpoint is
/// acquired lazily on the first [`read`](Self::read); dropping the stream
/// closes it.
///
/// [`AudioHwDevice::open_input_stream`]: crate::AudioHwDevice::open_input_stream
pub struct InputStream {
    ctx: Arc<DeviceContext>,
    core: Arc<StreamCore>,
    config: PcmConfig,
    requested: AudioConfig,
}

impl InputStream {
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

    /// Returns the preferred read size in bytes (one period).
    pub fn buffer_size(&self) -> usize {
        self.config.period_bytes()
    }

    /// Fills `buffer` with interleaved little-endian 16-bit samples.
    ///
    /// Always returns `buffer.len()`. On failure, or while the microphone
    /// is muted, the buffer holds silence; failures additionally sleep for
    /// the buffer's real-time duration.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let bytes = buffer.len();
        match self.read_inner(buffer) {
            Ok(false) => {}
            Ok(true) => buffer.fill(0),
            Err(error) => {
                buffer.fill(0);
                absorb_failure(&self.ctx, Direction::Capture, &error, bytes, &self.config);
            }
        }
        bytes
    }

    /// Returns whether the microphone was muted.
    fn read_inner(&self, buffer: &mut [u8]) -> Result<bool, TransferError> {
        let mut dev = self.ctx.lock_state();
        let mut st = self.core.lock();
        let route = prepare_transfer(&self.ctx, &mut dev, &mut st, Direction::Capture, &self.config)?;
        let muted = dev.mic_mute();
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
        scratch.resize(buffer.len() / SAMPLE_BYTES, 0);

        match route {
            Route::Primary => pcm.read(scratch)?,
            Route::Bluetooth => self.ctx.sco().read(pcm, &self.config, scratch)?,
        }

        for (bytes, sample) in buffer.chunks_exact_mut(SAMPLE_BYTES).zip(scratch.iter()) {
            bytes.copy_from_slice(&sample.to_le_bytes());
        }

        *frames += (buffer.len() / self.config.frame_bytes()) as u64;
        Ok(muted)
    }

    /// Releases the endpoint. The next read reopens it.
    pub fn standby(&self) {
        super::standby(&self.ctx, &self.core);
    }

    /// Returns the current lifecycle state.
    pub fn status(&self) -> StreamStatus {
        self.core.lock().status()
    }

    /// Returns how many frames have been captured from the hardware.
    pub fn frames_read(&self) -> u64 {
        self.core.lock().frames
    }

    /// Applies `routing=<mask>`.
    pub fn set_parameters(&self, kvpairs: &str) {
        let params = KvPairs::parse(kvpairs);
        if let Some(mask) = params.get_u32("routing") {
            let mut dev = self.ctx.lock_state();
            let _st = self.core.lock();
            self.ctx.update_routing(&mut dev, Direction::Capture, mask);
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
            reply.push("sup_channels", self.requested.channel_mask_name(true));
        }
        reply.to_string()
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        self.ctx.close_stream(&self.core);
    }
}
