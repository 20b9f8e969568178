//! The hardware device: device-wide state, stream factory and control plane.
//!
//! [`AudioHwDevice`] is the public handle. Everything it shares with its
//! streams lives in a [`DeviceContext`] behind one device-wide mutex.
//!
//! Lock order, outermost first: loopback, device, stream, SCO direction.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::card::{CardLookup, CardResolver};
use crate::event::{emit, EventCallback, HalEvent};
use crate::format::round_to_16_frames;
use crate::params::KvPairs;
use crate::pcm::{Direction, PcmBackend, PcmId};
use crate::route::{routes_for, RouteApplier, DEVICE_BIT_IN, DEVICE_IN_BUILTIN_MIC, DEVICE_OUT_SPEAKER};
use crate::session::{LoopbackPlan, LoopbackSession, LoopbackStats};
use crate::stream::sco::ScoPath;
use crate::stream::{InputStream, OutputStream, StreamCore};
use crate::{AudioConfig, HalBuilder, HalConfig, HalError, PcmConfig};

/// Which physical path a stream's endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// The primary codec.
    Primary,
    /// The Bluetooth narrow-band link.
    Bluetooth,
}

/// Telephony mode reported by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    /// No call.
    #[default]
    Normal,
    /// Incoming call ringing.
    Ringtone,
    /// Cellular call.
    InCall,
    /// VoIP call.
    InCommunication,
}

/// Device-wide mutable state, guarded by the device lock.
pub(crate) struct DeviceState {
    out_card: u32,
    in_card: u32,
    bt_card: Option<u32>,
    usb_card: Option<u32>,
    mic_mute: bool,
    out_devices: u32,
    in_devices: u32,
    hfp_active: bool,
    sco_active: bool,
    loopback_active: bool,
    out_needs_standby: bool,
    in_needs_standby: bool,
    mode: AudioMode,
    streams: Vec<Weak<StreamCore>>,
}

impl DeviceState {
    fn new(dummy_card: u32) -> Self {
        Self {
            out_card: dummy_card,
            in_card: dummy_card,
            bt_card: None,
            usb_card: None,
            mic_mute: false,
            out_devices: DEVICE_OUT_SPEAKER,
            in_devices: DEVICE_IN_BUILTIN_MIC & !DEVICE_BIT_IN,
            hfp_active: false,
            sco_active: false,
            loopback_active: false,
            out_needs_standby: false,
            in_needs_standby: false,
            mode: AudioMode::Normal,
            streams: Vec::new(),
        }
    }

    /// Clears and returns the pending forced-standby flag for `direction`.
    pub(crate) fn take_forced_standby(&mut self, direction: Direction) -> bool {
        match direction {
            Direction::Playback => std::mem::take(&mut self.out_needs_standby),
            Direction::Capture => std::mem::take(&mut self.in_needs_standby),
        }
    }

    fn request_standby(&mut self) {
        self.out_needs_standby = true;
        self.in_needs_standby = true;
    }

    /// Returns the route new endpoints should open on, or `None` while the
    /// loopback bridge owns the hardware.
    pub(crate) fn desired_route(&self) -> Option<Route> {
        if self.loopback_active {
            None
        } else if self.diverted() {
            Some(Route::Bluetooth)
        } else {
            Some(Route::Primary)
        }
    }

    pub(crate) fn primary_card(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Playback => self.out_card,
            Direction::Capture => self.in_card,
        }
    }

    pub(crate) fn mic_mute(&self) -> bool {
        self.mic_mute
    }

    pub(crate) fn diverted(&self) -> bool {
        self.hfp_active || self.sco_active
    }

    fn register(&mut self, core: &Arc<StreamCore>) {
        self.streams.retain(|weak| weak.strong_count() > 0);
        self.streams.push(Arc::downgrade(core));
    }
}

/// Everything streams share with the device.
pub(crate) struct DeviceContext {
    state: Mutex<DeviceState>,
    loopback: Mutex<Option<LoopbackSession>>,
    sco: ScoPath,
    backend: Arc<dyn PcmBackend>,
    cards: Arc<dyn CardLookup>,
    router: Arc<dyn RouteApplier>,
    resolver: CardResolver,
    config: HalConfig,
    events: Option<EventCallback>,
}

impl DeviceContext {
    pub(crate) fn new(
        backend: Arc<dyn PcmBackend>,
        cards: Arc<dyn CardLookup>,
        router: Arc<dyn RouteApplier>,
        config: HalConfig,
        events: Option<EventCallback>,
    ) -> Self {
        let resolver = CardResolver::new(config.primary_cards.clone(), config.dummy_card);
        Self {
            state: Mutex::new(DeviceState::new(config.dummy_card)),
            loopback: Mutex::new(None),
            sco: ScoPath::new(config.resampler_quality, events.clone()),
            backend,
            cards,
            router,
            resolver,
            config,
            events,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    pub(crate) fn events(&self) -> Option<&EventCallback> {
        self.events.as_ref()
    }

    pub(crate) fn config(&self) -> &HalConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn PcmBackend {
        self.backend.as_ref()
    }

    pub(crate) fn sco(&self) -> &ScoPath {
        &self.sco
    }

    /// Re-resolves the Bluetooth card by driver name.
    pub(crate) fn refresh_bt_card(&self, dev: &mut DeviceState) -> Option<u32> {
        dev.bt_card = self.cards.resolve_card(&self.config.bt_card_name);
        tracing::debug!(name = %self.config.bt_card_name, card = ?dev.bt_card, "bluetooth card lookup");
        dev.bt_card
    }

    pub(crate) fn bt_config(&self, direction: Direction) -> PcmConfig {
        match direction {
            Direction::Playback => self.config.bt_out_config,
            Direction::Capture => self.config.bt_in_config,
        }
    }

    /// Picks the first candidate card that exposes PCM capabilities.
    fn resolve_primary(&self, direction: Direction) -> Result<u32, HalError> {
        let device = self.config.pcm_device;
        let has_pcm = |card| {
            self.backend
                .capabilities(PcmId {
                    card,
                    device,
                    direction,
                })
                .is_some()
        };
        let card = self.resolver.resolve_with(self.cards.as_ref(), &has_pcm);
        if has_pcm(card) {
            Ok(card)
        } else {
            Err(HalError::NoUsableCard {
                tried: self.resolver.candidates().to_vec(),
            })
        }
    }

    /// Re-applies mixer routes for the current masks.
    pub(crate) fn select_routes(&self, dev: &DeviceState) {
        self.router.reset();
        for name in routes_for(dev.out_devices, dev.in_devices) {
            self.router.apply_route(name);
        }
    }

    pub(crate) fn update_routing(&self, dev: &mut DeviceState, direction: Direction, mask: u32) {
        match direction {
            Direction::Playback => dev.out_devices = mask,
            Direction::Capture => dev.in_devices = mask & !DEVICE_BIT_IN,
        }
        tracing::info!(%direction, mask, "routing changed");
        self.select_routes(dev);
    }

    /// Closes the stream's endpoint and forgets it.
    pub(crate) fn close_stream(&self, core: &Arc<StreamCore>) {
        let mut dev = self.lock_state();
        let mut st = core.lock();
        st.enter_standby();
        drop(st);
        let target = Arc::as_ptr(core);
        dev.streams
            .retain(|weak| weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), target));
        tracing::info!(direction = %core.direction(), "stream closed");
    }

    /// Puts every open stream into standby now, under each stream's lock.
    fn force_standby_all(&self, dev: &mut DeviceState) {
        dev.streams.retain(|weak| weak.strong_count() > 0);
        for core in dev.streams.iter().filter_map(Weak::upgrade) {
            if core.lock().enter_standby() {
                tracing::info!(direction = %core.direction(), "standby for loopback");
                emit(
                    self.events(),
                    HalEvent::StandbyEntered {
                        direction: core.direction(),
                        forced: true,
                    },
                );
            }
        }
    }

    /// Reacts to a change of the diversion flags.
    ///
    /// Starts a new SCO converter generation on every change. Converters of
    /// the ended period are released by the caller once the device lock is
    /// dropped.
    fn apply_diversion_change(&self, dev: &mut DeviceState, was_diverted: bool) {
        let diverted = dev.diverted();
        if diverted == was_diverted {
            return;
        }
        self.sco.invalidate();
        if diverted {
            dev.request_standby();
        } else {
            dev.out_needs_standby = false;
            dev.in_needs_standby = false;
        }
        tracing::info!(active = diverted, bt_card = ?dev.bt_card, "call audio diversion");
        emit(self.events(), HalEvent::DiversionChanged { active: diverted });
    }

    fn set_hfp(&self, enable: bool) {
        let mut dev = self.lock_state();
        let was = dev.diverted();
        dev.hfp_active = enable;
        self.refresh_bt_card(&mut dev);
        self.apply_diversion_change(&mut dev, was);
        let ended = was && !dev.diverted();
        drop(dev);
        if ended {
            self.sco.release();
        }
    }

    fn set_bt_sco(&self, on: bool) -> Result<(), HalError> {
        let mut loopback = self.loopback.lock();
        if !on {
            if let Some(session) = loopback.take() {
                session.stop();
            }
            let mut dev = self.lock_state();
            let was = dev.diverted();
            dev.loopback_active = false;
            dev.sco_active = false;
            self.apply_diversion_change(&mut dev, was);
            let ended = was && !dev.diverted();
            drop(dev);
            if ended {
                self.sco.release();
            }
            return Ok(());
        }

        if loopback.as_ref().is_some_and(LoopbackSession::is_running) {
            return Ok(());
        }

        let mut dev = self.lock_state();
        let was = dev.diverted();
        dev.sco_active = true;
        let bt_card = self.refresh_bt_card(&mut dev);
        self.apply_diversion_change(&mut dev, was);

        let usb_card = dev.usb_card.ok_or(HalError::NoUsbCard)?;
        let bt_card = bt_card.ok_or_else(|| HalError::NoBluetoothCard {
            name: self.config.bt_card_name.clone(),
        })?;

        dev.loopback_active = true;
        self.force_standby_all(&mut dev);
        drop(dev);

        let plan = LoopbackPlan {
            usb_card,
            bt_card,
            device: self.config.pcm_device,
            usb_config: self.config.usb_config,
            bt_out: self.config.bt_out_config,
            bt_in: self.config.bt_in_config,
        };
        match LoopbackSession::start(
            self.backend(),
            &plan,
            self.config.resampler_quality,
            self.events.clone(),
        ) {
            Ok(session) => {
                *loopback = Some(session);
                Ok(())
            }
            Err(error) => {
                self.lock_state().loopback_active = false;
                Err(error)
            }
        }
    }
}

/// An opened audio hardware device.
///
/// Created with [`AudioHwDevice::builder()`]. Streams opened from it keep
/// the shared device state alive, so they may outlive this handle; the
/// loopback bridge does not and is stopped on drop.
///
/// # Example
///
/// ```
/// use hfp_audio_hal::pcm::{MockBackend, PcmCaps};
/// use hfp_audio_hal::{AudioConfig, AudioHwDevice, HalConfig};
///
/// let mock = MockBackend::new();
/// mock.add_card("PCH", 1, PcmCaps::new([48000], [2]));
///
/// let device = AudioHwDevice::builder()
///     .backend(mock.clone())
///     .card_lookup(mock.clone())
///     .open()?;
///
/// let (out, negotiated) = device.open_output_stream(&AudioConfig::default())?;
/// assert_eq!(negotiated, AudioConfig::new(48000, 2));
/// assert_eq!(out.write(&[0u8; 4096]), 4096);
/// # Ok::<(), hfp_audio_hal::HalError>(())
/// ```
pub struct AudioHwDevice {
    ctx: Arc<DeviceContext>,
}

impl AudioHwDevice {
    /// Creates a builder.
    pub fn builder() -> HalBuilder {
        HalBuilder::new()
    }

    pub(crate) fn new(ctx: DeviceContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Returns the device configuration.
    pub fn config(&self) -> &HalConfig {
        self.ctx.config()
    }

    /// Opens a playback stream.
    ///
    /// The primary card is resolved afresh. The endpoint itself is opened
    /// on the first write. Returns the stream and its negotiated config.
    pub fn open_output_stream(
        &self,
        requested: &AudioConfig,
    ) -> Result<(OutputStream, AudioConfig), HalError> {
        let config = self.ctx.config().out_config;
        let core = self.open_core(Direction::Playback, &config, "output stream buffer")?;
        let stream = OutputStream::new(Arc::clone(&self.ctx), core, config, *requested);
        Ok((stream, AudioConfig::from(&config)))
    }

    /// Opens a capture stream.
    ///
    /// See [`open_output_stream`](Self::open_output_stream).
    pub fn open_input_stream(
        &self,
        requested: &AudioConfig,
    ) -> Result<(InputStream, AudioConfig), HalError> {
        let config = self.ctx.config().in_config;
        let core = self.open_core(Direction::Capture, &config, "input stream buffer")?;
        let stream = InputStream::new(Arc::clone(&self.ctx), core, config, *requested);
        Ok((stream, AudioConfig::from(&config)))
    }

    fn open_core(
        &self,
        direction: Direction,
        config: &PcmConfig,
        what: &'static str,
    ) -> Result<Arc<StreamCore>, HalError> {
        let mut dev = self.ctx.lock_state();
        let card = self.ctx.resolve_primary(direction)?;
        match direction {
            Direction::Playback => dev.out_card = card,
            Direction::Capture => dev.in_card = card,
        }

        let samples = config.aligned_period() * usize::from(config.channels);
        let mut scratch = Vec::new();
        scratch
            .try_reserve(samples)
            .map_err(|_| HalError::OutOfMemory { what })?;

        let core = Arc::new(StreamCore::new(direction, scratch));
        dev.register(&core);
        tracing::info!(
            %direction,
            card,
            rate = config.rate,
            channels = config.channels,
            "stream opened"
        );
        Ok(core)
    }

    /// Closes a playback stream, releasing its endpoint.
    pub fn close_output_stream(&self, stream: OutputStream) {
        drop(stream);
    }

    /// Closes a capture stream, releasing its endpoint.
    pub fn close_input_stream(&self, stream: InputStream) {
        drop(stream);
    }

    /// Applies `key=value;...` control-plane parameters.
    ///
    /// Recognised keys: `card`, `routing`, `hfp_enable` and `bt_sco`.
    /// Unknown keys are ignored. Only a failed loopback start is reported
    /// as an error; the diversion it belongs to stays enabled.
    pub fn set_parameters(&self, kvpairs: &str) -> Result<(), HalError> {
        let params = KvPairs::parse(kvpairs);
        tracing::debug!(%params, "set_parameters");

        if let Some(card) = params.get_u32("card") {
            let mut dev = self.ctx.lock_state();
            dev.usb_card = Some(card);
            self.ctx.refresh_bt_card(&mut dev);
            tracing::info!(card, "usb card selected");
        }

        if let Some(mask) = params.get_u32("routing") {
            let direction = if mask & DEVICE_BIT_IN != 0 {
                Direction::Capture
            } else {
                Direction::Playback
            };
            let mut dev = self.ctx.lock_state();
            self.ctx.update_routing(&mut dev, direction, mask);
        }

        match params.get("hfp_enable") {
            Some("true") => self.ctx.set_hfp(true),
            Some("false") => self.ctx.set_hfp(false),
            Some(other) => tracing::warn!(value = other, "ignoring hfp_enable"),
            None => {}
        }

        let bt_sco = match params.get("bt_sco") {
            Some("on") => Some(true),
            Some("off") => Some(false),
            Some(other) => {
                tracing::warn!(value = other, "ignoring bt_sco");
                None
            }
            None => None,
        };
        if let Some(on) = bt_sco {
            if let Err(error) = self.ctx.set_bt_sco(on) {
                tracing::error!(%error, "loopback did not start");
                emit(
                    self.ctx.events(),
                    HalEvent::LoopbackFailed {
                        reason: error.to_string(),
                    },
                );
                return Err(error);
            }
        }
        Ok(())
    }

    /// Answers `hfp_enable`, `bt_sco` and `card` queries.
    ///
    /// `bt_sco` reads `on` only while the loopback bridge runs. After a
    /// failed `bt_sco=on` it reads `off` even though streams stay diverted.
    pub fn get_parameters(&self, keys: &str) -> String {
        let query = KvPairs::parse(keys);
        let bridged = query.contains("bt_sco") && self.is_loopback_active();
        let dev = self.ctx.lock_state();
        let mut reply = KvPairs::new();
        if query.contains("hfp_enable") {
            reply.push("hfp_enable", dev.hfp_active.to_string());
        }
        if query.contains("bt_sco") {
            reply.push("bt_sco", if bridged { "on" } else { "off" });
        }
        if query.contains("card") {
            if let Some(card) = dev.usb_card {
                reply.push("card", card.to_string());
            }
        }
        reply.to_string()
    }

    /// Mutes or unmutes the microphone. Muted reads return silence.
    pub fn set_mic_mute(&self, mute: bool) {
        self.ctx.lock_state().mic_mute = mute;
        tracing::info!(mute, "mic mute");
    }

    /// Returns whether the microphone is muted.
    pub fn mic_mute(&self) -> bool {
        self.ctx.lock_state().mic_mute
    }

    /// Records the telephony mode. A change forces both directions into
    /// standby on their next transfer.
    pub fn set_mode(&self, mode: AudioMode) {
        let mut dev = self.ctx.lock_state();
        if dev.mode != mode {
            tracing::info!(from = ?dev.mode, to = ?mode, "mode changed");
            dev.mode = mode;
            dev.request_standby();
        }
    }

    /// Returns the current telephony mode.
    pub fn mode(&self) -> AudioMode {
        self.ctx.lock_state().mode
    }

    /// Returns the capture buffer size in bytes for `config`.
    pub fn input_buffer_size(&self, config: &AudioConfig) -> usize {
        let hw = &self.ctx.config().in_config;
        let frames = hw.period_size * config.sample_rate as usize / hw.rate as usize;
        round_to_16_frames(frames) * usize::from(config.channels) * crate::config::SAMPLE_BYTES
    }

    /// Returns whether streams are diverted to the Bluetooth link.
    pub fn is_diverted(&self) -> bool {
        self.ctx.lock_state().diverted()
    }

    /// Returns whether the loopback bridge is running.
    pub fn is_loopback_active(&self) -> bool {
        self.ctx
            .loopback
            .lock()
            .as_ref()
            .is_some_and(LoopbackSession::is_running)
    }

    /// Returns relay statistics of the running loopback bridge.
    pub fn loopback_stats(&self) -> Option<LoopbackStats> {
        self.ctx.loopback.lock().as_ref().map(LoopbackSession::stats)
    }
}

impl Drop for AudioHwDevice {
    fn drop(&mut self) {
        if let Some(session) = self.ctx.loopback.lock().take() {
            session.stop();
        }
        self.ctx.lock_state().loopback_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_route() {
        let mut dev = DeviceState::new(0);
        assert_eq!(dev.desired_route(), Some(Route::Primary));

        dev.hfp_active = true;
        assert_eq!(dev.desired_route(), Some(Route::Bluetooth));

        dev.loopback_active = true;
        assert_eq!(dev.desired_route(), None);
    }

    #[test]
    fn test_forced_standby_is_consumed() {
        let mut dev = DeviceState::new(0);
        dev.request_standby();

        assert!(dev.take_forced_standby(Direction::Playback));
        assert!(!dev.take_forced_standby(Direction::Playback));
        assert!(dev.take_forced_standby(Direction::Capture));
    }

    #[test]
    fn test_default_masks() {
        let dev = DeviceState::new(3);
        assert_eq!(dev.primary_card(Direction::Playback), 3);
        assert_eq!(routes_for(dev.out_devices, dev.in_devices), vec!["speaker", "main-mic"]);
    }

    #[test]
    fn test_diversion_owns_its_converters() {
        use crate::pcm::{MockBackend, PcmCaps};

        let mock = MockBackend::new();
        mock.add_card("PCH", 1, PcmCaps::new([48000], [2]));
        mock.add_card("USB-Audio", 2, PcmCaps::new([48000], [2]));
        mock.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
        mock.set_io_delay(std::time::Duration::from_millis(1));
        let device = AudioHwDevice::builder()
            .backend(mock.clone())
            .card_lookup(mock.clone())
            .open()
            .unwrap();
        let sco = device.ctx.sco();

        let (out, _) = device.open_output_stream(&AudioConfig::default()).unwrap();
        let (input, _) = device.open_input_stream(&AudioConfig::default()).unwrap();
        device.set_parameters("hfp_enable=true").unwrap();
        assert_eq!(out.write(&[0u8; 4096]), 4096);
        assert_eq!(input.read(&mut [0u8; 1920]), 1920);
        assert_eq!(sco.active_converters(), 2);

        device.set_parameters("hfp_enable=false").unwrap();
        assert_eq!(sco.active_converters(), 0);

        // The bridge relays through converters of its own
        device.set_parameters("card=2;bt_sco=on").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(device.loopback_stats().unwrap().usb_to_bt.iterations > 0);
        assert_eq!(sco.active_converters(), 0);
        device.set_parameters("bt_sco=off").unwrap();
    }
}
