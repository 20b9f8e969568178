//! Loopback bridge example on simulated hardware.
//!
//! Plays a tone through the primary codec, diverts it to the Bluetooth
//! link for a hands-free call, then bridges a USB headset to Bluetooth
//! for half a second.
//!
//! Run with: RUST_LOG=debug cargo run --example loopback_mock

use std::time::Duration;

use hfp_audio_hal::pcm::{sine_wave, MockBackend, PcmCaps};
use hfp_audio_hal::{AudioConfig, AudioHwDevice};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Simulated cards: primary codec, USB headset and Bluetooth SCO
    let hw = MockBackend::new();
    hw.add_card("PCH", 0, PcmCaps::new([48000], [2]));
    hw.add_card("USB-Audio", 2, PcmCaps::new([48000, 44100], [2, 1]));
    hw.add_card("btaudiosource", 3, PcmCaps::new([8000], [1]));
    hw.set_io_delay(Duration::from_millis(10));
    hw.feed_capture(2, 0, &sine_wave(48000, 2, 440.0, 48000));

    let device = AudioHwDevice::builder()
        .backend(hw.clone())
        .card_lookup(hw.clone())
        .on_event(|e| tracing::info!(?e, "hal event"))
        .open()?;

    let (out, config) = device.open_output_stream(&AudioConfig::default())?;
    println!("Output stream: {}Hz, {} channels", config.sample_rate, config.channels);

    let tone: Vec<u8> = sine_wave(48000, 2, 1000.0, 1024)
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    out.write(&tone);
    println!("Primary codec received {} samples", hw.played(0, 0).len());

    device.set_parameters("hfp_enable=true")?;
    out.write(&tone);
    println!("Bluetooth link received {} samples", hw.played(3, 0).len());
    device.set_parameters("hfp_enable=false")?;

    device.set_parameters("card=2;bt_sco=on")?;
    std::thread::sleep(Duration::from_millis(500));

    // Get stats before stopping
    let stats = device.loopback_stats();
    device.set_parameters("bt_sco=off")?;

    println!("Loopback stats: {stats:?}");
    println!("Endpoints still open: {}", hw.open_endpoints().len());

    Ok(())
}
