use std::time::{Duration, Instant};

use hiresti_platform::memory::{MemoryClock, MemoryEnumerator};
use hiresti_platform::{Device, FormatSource};

use super::*;
use crate::config::WatchdogConfig;
use crate::host::testing::RecordingHost;
use crate::settings::MemorySettingsStore;
use crate::source::StaticSource;
use crate::pipeline::{SimHandle, SimulatedBackend};

const BUILT_IN: &str = "Built-in Audio (Card 0)";
const USB_DAC: &str = "USB DAC (Card 1)";
const PW_DAC: &str = "USB DAC";
const HIRES: &str = "/music/hires.flac";
const STUDIO: &str = "/music/studio-master.flac";
const CD: &str = "/music/cd.flac";

struct Rig {
    core: AudioCore,
    host: Arc<RecordingHost>,
    sim: SimHandle,
    devices: Arc<MemoryEnumerator>,
    clock: Arc<MemoryClock>,
    store: Arc<MemorySettingsStore>,
}

fn quick_config() -> CoreConfig {
    CoreConfig {
        pipewire_grace_ms: 60,
        pipewire_poll_ms: 10,
        watchdog: WatchdogConfig {
            fast_interval_ms: 10,
            slow_interval_ms: 20,
            passive_active_ms: 20,
            passive_idle_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn rig(settings: Settings, clock: MemoryClock) -> Rig {
    let host = Arc::new(RecordingHost::default());
    let sim = SimHandle::new();
    sim.add_media(HIRES, StreamFormat::new(96000, 24, "FLAC"), 240.0);
    sim.add_media(STUDIO, StreamFormat::new(192000, 24, "FLAC"), 240.0);
    sim.add_media(CD, StreamFormat::new(44100, 16, "FLAC"), 240.0);

    let devices = Arc::new(MemoryEnumerator::new());
    devices.set_devices(
        Driver::Alsa,
        vec![
            Device::new(Driver::Alsa, BUILT_IN, Some("hw:0,0".into())),
            Device::new(Driver::Alsa, USB_DAC, Some("hw:1,0".into())),
        ],
    );
    devices.set_devices(
        Driver::PipeWire,
        vec![
            Device::new(Driver::PipeWire, DEFAULT_SYSTEM_OUTPUT_NAME, None),
            Device::new(Driver::PipeWire, PW_DAC, Some("alsa_output.usb-dac.analog-stereo".into())),
        ],
    );
    let clock = Arc::new(clock);
    let store = Arc::new(MemorySettingsStore::with_settings(settings));

    let core = AudioCore::new(CoreParts {
        host: host.clone(),
        enumerator: devices.clone(),
        clock: Some(clock.clone()),
        backend: SimulatedBackend::factory(sim.clone()),
        source: Arc::new(StaticSource::new("HI_RES")),
        settings: store.clone(),
        audio_cache: None,
        cover_cache: None,
        config: quick_config(),
        env: EnvConfig::default(),
    })
    .unwrap();

    Rig {
        core,
        host,
        sim,
        devices,
        clock,
        store,
    }
}

fn alsa_exclusive() -> Settings {
    Settings {
        driver: "ALSA".into(),
        device: USB_DAC.into(),
        bit_perfect: true,
        exclusive_lock: true,
        ..Default::default()
    }
}

fn pipewire_bit_perfect() -> Settings {
    Settings {
        driver: "PipeWire".into(),
        device: PW_DAC.into(),
        bit_perfect: true,
        ..Default::default()
    }
}

fn pump_until(core: &mut AudioCore, what: &str, done: impl Fn(&AudioCore) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        core.pump();
        if done(core) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn applied_name(core: &AudioCore) -> Option<String> {
    core.state_machine().applied().map(|r| r.device_name.clone())
}

fn disconnected() -> OutputState {
    OutputState::Fallback(DISCONNECTED.to_string())
}

/// Restored output, a hi-res track playing on the USB DAC
fn playing_on_usb(settings: Settings) -> Rig {
    start_on_usb(rig(settings, MemoryClock::new(48000)))
}

fn start_on_usb(mut rig: Rig) -> Rig {
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);
    assert_eq!(applied_name(&rig.core).as_deref(), Some(USB_DAC));

    rig.core.play_track(Track::new(HIRES, "Hi-Res")).unwrap();
    pump_until(&mut rig.core, "playback", |c| {
        c.playback_state() == PlaybackState::Playing && c.sink_format().map(|s| s.rate) == Some(96000)
    });
    rig
}

#[test]
fn test_alsa_exclusive_is_bit_perfect() {
    let rig = rig(alsa_exclusive(), MemoryClock::new(48000));
    rig.devices.set_runtime_format(Some(RuntimeFormat {
        rate: 96000,
        depth: 24,
        source: FormatSource::Kernel,
    }));
    let mut rig = start_on_usb(rig);
    pump_until(&mut rig.core, "verdict", |c| c.verdict().yes);

    let verdict = rig.core.verdict();
    assert_eq!(verdict.label(), "Yes");
    assert!(verdict.reasons.is_empty());

    let elements = rig.core.graph_elements().to_vec();
    assert!(!elements.iter().any(|e| e == "resampler"), "{:?}", elements);
    assert!(!elements.iter().any(|e| e == "volume"));
    assert!(elements.iter().any(|e| e == "sink (ALSA)"));

    let lines = rig.core.diagnostics();
    assert!(lines.iter().any(|l| l.contains("96")), "{:?}", lines);
    let transitions = rig.host.transitions.lock().clone();
    assert!(transitions.iter().any(|t| t.next == OutputState::Active));
}

#[test]
fn test_remote_track_plays() {
    let remote = "https://cdn.example/tracks/42.flac?token=abc&exp=1700000000";
    let mut rig = playing_on_usb(alsa_exclusive());
    rig.sim.add_media(remote, StreamFormat::new(88200, 24, "FLAC"), 200.0);

    rig.core.play_track(Track::new(remote, "Remote Master")).unwrap();
    pump_until(&mut rig.core, "remote playback", |c| {
        c.playback_state() == PlaybackState::Playing
            && c.source_format().is_some_and(|f| f.rate == 88200)
            && *c.output_state() == OutputState::Active
    });
    let notices = rig.host.notices.lock();
    assert!(
        !notices.iter().any(|(level, _)| *level == NoticeLevel::Error),
        "{:?}",
        notices
    );
}

#[test]
fn test_presence_check_notices_unplugged_dac() {
    let mut rig = playing_on_usb(alsa_exclusive());

    // No backend error; only the idle-time listing can spot the loss
    rig.devices.unplug(Driver::Alsa, USB_DAC);
    pump_until(&mut rig.core, "presence loss", |c| *c.output_state() == disconnected());

    assert!(rig.host.has_notice(&format!("Audio device disconnected: {}", USB_DAC)));
    assert_eq!(
        rig.core.state_machine().last_disconnected(),
        Some(&(Driver::Alsa, USB_DAC.to_string()))
    );
    assert_ne!(rig.core.watchdog_phase(), WatchPhase::Stopped);
    pump_until(&mut rig.core, "substitute", |c| applied_name(c).as_deref() == Some(BUILT_IN));
}

#[test]
fn test_usb_disconnect_rebinds_to_substitute() {
    let mut rig = playing_on_usb(alsa_exclusive());

    rig.devices.unplug(Driver::Alsa, USB_DAC);
    rig.sim.inject_error("Device has been disconnected: No such device");
    pump_until(&mut rig.core, "rebind", |c| {
        *c.output_state() == disconnected() && applied_name(c).as_deref() == Some(BUILT_IN)
    });

    assert!(rig.host.has_notice(&format!("Audio device disconnected: {}", USB_DAC)));
    assert_eq!(
        rig.core.state_machine().last_disconnected(),
        Some(&(Driver::Alsa, USB_DAC.to_string()))
    );
    assert_ne!(rig.core.watchdog_phase(), WatchPhase::Stopped);
    // The user's choice survives the substitute binding
    assert_eq!(
        rig.core.state_machine().requested().map(|r| r.device_name.as_str()),
        Some(USB_DAC)
    );
    let health = rig.host.health.lock().clone();
    assert!(health.iter().any(|(area, h, _)| area == "output" && *h == crate::host::Health::Warn));

    // Same error again inside the dedupe window is ignored
    let notices = rig.host.notice_texts().len();
    rig.sim.inject_error("Device has been disconnected: No such device");
    std::thread::sleep(Duration::from_millis(50));
    rig.core.pump();
    assert_eq!(rig.host.notice_texts().len(), notices);
}

#[test]
fn test_disconnect_without_substitute_errors() {
    let mut rig = playing_on_usb(alsa_exclusive());
    rig.devices.set_devices(Driver::Alsa, Vec::new());
    rig.sim.inject_error("ALSA: device disconnected");

    pump_until(&mut rig.core, "no output", |c| {
        matches!(c.output_state(), OutputState::Error(_))
    });
    assert_eq!(rig.core.output_state().reason(), Some(NO_OUTPUT));
    assert!(rig.host.has_notice(NO_OUTPUT));
    assert!(*rig.host.play_resets.lock() >= 1);
    pump_until(&mut rig.core, "stop", |c| c.playback_state() == PlaybackState::Stopped);
}

#[test]
fn test_auto_rebind_then_cooldown() {
    let settings = Settings {
        output_auto_rebind_once: true,
        ..alsa_exclusive()
    };
    let mut rig = playing_on_usb(settings);

    rig.devices.unplug(Driver::Alsa, USB_DAC);
    rig.sim.inject_error("Device has been disconnected");
    pump_until(&mut rig.core, "first rebind", |c| applied_name(c).as_deref() == Some(BUILT_IN));

    rig.devices.plug(Device::new(Driver::Alsa, USB_DAC, Some("hw:1,0".into())));
    pump_until(&mut rig.core, "switch back", |c| {
        *c.output_state() == OutputState::Active && applied_name(c).as_deref() == Some(USB_DAC)
    });
    assert!(rig.host.has_notice(&format!("Switched back automatically to {}", USB_DAC)));
    assert_eq!(rig.core.watchdog_phase(), WatchPhase::Stopped);
    assert!(rig.core.event_log().contains("switched back automatically"));

    // Second loss inside the cooldown: announced, not acted on
    rig.devices.unplug(Driver::Alsa, USB_DAC);
    rig.sim.inject_error("USB device disconnected again");
    pump_until(&mut rig.core, "second rebind", |c| {
        *c.output_state() == disconnected() && applied_name(c).as_deref() == Some(BUILT_IN)
    });
    rig.devices.plug(Device::new(Driver::Alsa, USB_DAC, Some("hw:1,0".into())));
    let deadline = Instant::now() + Duration::from_secs(3);
    while !rig.host.has_notice("auto switch-back cooling down") {
        assert!(Instant::now() < deadline, "no cooldown notice: {:?}", rig.host.notice_texts());
        rig.core.pump();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*rig.core.output_state(), disconnected());
    assert_eq!(applied_name(&rig.core).as_deref(), Some(BUILT_IN));
}

#[test]
fn test_device_back_without_auto_rebind_only_notifies() {
    let mut rig = playing_on_usb(alsa_exclusive());
    rig.devices.unplug(Driver::Alsa, USB_DAC);
    rig.sim.inject_error("Device has been disconnected");
    pump_until(&mut rig.core, "rebind", |c| applied_name(c).as_deref() == Some(BUILT_IN));

    rig.devices.plug(Device::new(Driver::Alsa, USB_DAC, Some("hw:1,0".into())));
    let deadline = Instant::now() + Duration::from_secs(3);
    while !rig.host.has_notice(&format!("Previous device is back: {}", USB_DAC)) {
        assert!(Instant::now() < deadline);
        rig.core.pump();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(applied_name(&rig.core).as_deref(), Some(BUILT_IN));

    let id = rig.core.recover_output().unwrap();
    assert!(id.is_some());
    pump_until(&mut rig.core, "recover", |c| {
        *c.output_state() == OutputState::Active && applied_name(c).as_deref() == Some(USB_DAC)
    });
}

#[test]
fn test_pipewire_rate_block_pauses() {
    let clock = MemoryClock::new(48000);
    clock.pin_rate(Some(48000));
    let mut rig = rig(pipewire_bit_perfect(), clock);
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);

    rig.core.play_track(Track::new(STUDIO, "Studio Master")).unwrap();
    pump_until(&mut rig.core, "rate block", |c| {
        *c.output_state() == OutputState::Fallback(RATE_BLOCKED.to_string())
    });
    pump_until(&mut rig.core, "pause", |c| c.playback_state() != PlaybackState::Playing);

    assert!(rig.host.has_notice(RATE_BLOCKED));
    assert!(*rig.host.play_resets.lock() >= 1);
    assert!(rig.clock.writes() > 0);

    let verdict = rig.core.verdict();
    assert!(!verdict.yes);
    assert!(verdict.reasons.iter().any(|r| r == "Rate/depth mismatch"), "{:?}", verdict.reasons);
    assert!(verdict.reasons.iter().any(|r| r == RATE_BLOCKED));

    let transitions = rig.host.transitions.lock();
    let blocked = transitions
        .iter()
        .find(|t| t.next == OutputState::Fallback(RATE_BLOCKED.to_string()))
        .unwrap();
    assert_eq!(blocked.prev, OutputState::Switching);
    assert!(transitions
        .iter()
        .any(|t| t.prev == OutputState::Active && t.next == OutputState::Switching));
}

#[test]
fn test_pipewire_clock_follows_source() {
    let mut rig = rig(pipewire_bit_perfect(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);

    rig.core.play_track(Track::new(STUDIO, "Studio Master")).unwrap();
    pump_until(&mut rig.core, "clock", |c| c.verdict().yes);

    assert_eq!(rig.clock.settings().force_rate, 192000);
    assert!(rig.clock.settings().allows(176400));
    assert_eq!(*rig.core.output_state(), OutputState::Active);
    assert!(rig.core.event_log().contains("clock renegotiation for 192000Hz"));

    rig.core.shutdown();
    assert_eq!(rig.clock.settings().force_rate, 0);
}

#[test]
fn test_pro_audio_profile_on_enable() {
    let mut rig = rig(
        Settings {
            bit_perfect: false,
            ..pipewire_bit_perfect()
        },
        MemoryClock::new(48000),
    );
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);
    rig.core.play_track(Track::new(HIRES, "Hi-Res")).unwrap();
    pump_until(&mut rig.core, "playback", |c| c.playback_state() == PlaybackState::Playing);

    let outcome = rig.core.set_bit_perfect(true).unwrap();
    assert!(matches!(outcome, SwitchOutcome::Started(_)));
    pump_until(&mut rig.core, "pro audio", |c| c.event_log().contains("Pro Audio profile active"));
    assert_eq!(
        rig.clock
            .active_profile("alsa_card.usb-dac")
            .as_deref(),
        Some("pro-audio")
    );
    pump_until(&mut rig.core, "active", |c| *c.output_state() == OutputState::Active);
}

#[test]
fn test_latency_profile_switch_while_playing() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);
    rig.core.play_track(Track::new(CD, "Red Book")).unwrap();
    pump_until(&mut rig.core, "playback", |c| c.playback_state() == PlaybackState::Playing);

    rig.core.set_latency_profile(LatencyProfile::LowLatency).unwrap();
    assert_eq!(*rig.core.output_state(), OutputState::Switching);
    pump_until(&mut rig.core, "active", |c| *c.output_state() == OutputState::Active);

    assert!(rig.sim.latency_calls().contains(&(40, 4)));
    assert_eq!(rig.core.visual_offset_ms(), 40);
    assert_eq!(rig.core.spectrum().sync_offset_ms(), 40);
    assert_eq!(rig.core.target().latency, LatencyProfile::LowLatency);

    let settings = rig.core.settings();
    assert_eq!(settings.viz_sync_offset_ms, 40);
    assert_eq!(settings.latency(), LatencyProfile::LowLatency);
    assert!(rig.core.event_log().contains("latency profile changed"));
    assert!(rig.core.event_log().contains("switching -> active"));

    // Safe profile's 400ms buffer is capped for the visual offset
    rig.core.set_latency_profile(LatencyProfile::Safe).unwrap();
    assert_eq!(rig.core.visual_offset_ms(), MAX_SYNC_OFFSET_MS);
}

#[test]
fn test_set_output_idempotent_and_coalesced() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);

    let same = rig.core.target().clone();
    assert_eq!(rig.core.set_output(same).unwrap(), SwitchOutcome::Unchanged);

    let usb = OutputRequest {
        driver: Driver::Alsa,
        device_id: Some("hw:1,0".into()),
        device_name: USB_DAC.into(),
        ..Default::default()
    };
    assert!(matches!(rig.core.set_output(usb.clone()).unwrap(), SwitchOutcome::Started(_)));
    assert_eq!(rig.core.set_output(usb).unwrap(), SwitchOutcome::Coalesced);
    pump_until(&mut rig.core, "active", |c| *c.output_state() == OutputState::Active);

    rig.core.shutdown();
    let saved = rig.store.saved().unwrap();
    assert_eq!(saved.driver, "ALSA");
    assert_eq!(saved.device, USB_DAC);
}

#[test]
fn test_exclusive_needs_bit_perfect_and_alsa() {
    let mut rig = rig(pipewire_bit_perfect(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);

    rig.core.set_bit_perfect(false).unwrap();
    assert_eq!(rig.core.set_exclusive(true).unwrap(), SwitchOutcome::Unchanged);
    pump_until(&mut rig.core, "shared", |c| *c.output_state() == OutputState::Active);

    rig.core.set_bit_perfect(true).unwrap();
    pump_until(&mut rig.core, "bit-perfect", |c| *c.output_state() == OutputState::Active);
    rig.core.set_exclusive(true).unwrap();
    pump_until(&mut rig.core, "error", |c| matches!(c.output_state(), OutputState::Error(_)));
    assert_eq!(rig.core.output_state().reason(), Some("Exclusive mode requires ALSA"));
    assert!(rig.host.has_notice("Exclusive mode requires ALSA"));
}

#[test]
fn test_stream_resolution_failure_keeps_output() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);
    let transitions = rig.host.transitions.lock().len();

    rig.core.play_track(Track::new("12345", "Unavailable")).unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while *rig.host.play_resets.lock() == 0 {
        assert!(Instant::now() < deadline);
        rig.core.pump();
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(rig.host.transitions.lock().len(), transitions);
    assert_eq!(*rig.core.output_state(), OutputState::Active);
    assert_eq!(rig.core.playback_state(), PlaybackState::Stopped);
    let notices = rig.host.notices.lock().clone();
    assert!(notices.iter().any(|(level, _)| *level == NoticeLevel::Warning), "{:?}", notices);
}

#[test]
fn test_saved_device_missing_falls_back_to_default() {
    let settings = Settings {
        driver: "PipeWire".into(),
        device: "Vanished DAC".into(),
        ..Default::default()
    };
    let mut rig = rig(settings, MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);

    assert!(rig.host.has_notice("Saved output device not found: Vanished DAC"));
    assert_eq!(rig.core.target().device_name, DEFAULT_SYSTEM_OUTPUT_NAME);
    assert_eq!(rig.core.target().device_id, None);
}

#[test]
fn test_refresh_devices_reports_latest_only() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    let _stale = rig.core.refresh_devices(Driver::Alsa).unwrap();
    let _latest = rig.core.refresh_devices(Driver::PipeWire).unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while rig.host.device_lists.lock().is_empty() {
        assert!(Instant::now() < deadline);
        rig.core.pump();
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(50));
    rig.core.pump();
    let lists = rig.host.device_lists.lock().clone();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].driver, Driver::PipeWire);
    assert!(rig.core.drivers().contains(&Driver::Alsa));
}

#[test]
fn test_volume_and_eq_persist() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    rig.core.set_volume(0.5).unwrap();
    rig.core.set_eq_band(3, 30.0).unwrap();
    assert!(rig.core.set_eq_band(NUM_EQ_BANDS, 1.0).is_err());

    let settings = rig.core.settings();
    assert_eq!(settings.volume, 50);
    assert_eq!(settings.eq_gains[3], EQ_MAX_DB);
    rig.core.shutdown();
    assert_eq!(rig.store.saved().unwrap().volume, 50);
}

#[test]
fn test_spectrum_ticks_while_playing() {
    let mut rig = rig(Settings::default(), MemoryClock::new(48000));
    pump_until(&mut rig.core, "restore", |c| *c.output_state() == OutputState::Active);
    rig.core.set_bar_count(32).unwrap();
    rig.core.set_viz_profile(SpectrumProfile::from_index(1));
    assert_eq!(rig.core.settings().viz_bar_count, 32);

    rig.core.play_track(Track::new(CD, "Red Book")).unwrap();
    pump_until(&mut rig.core, "playback", |c| c.playback_state() == PlaybackState::Playing);

    let mut cur = vec![0.0; 64];
    let mut trail = vec![0.0; 64];
    let mut peak = vec![0.0; 64];
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        rig.core.pump();
        let (bars, _) = rig.core.tick_spectrum(&mut cur, &mut trail, &mut peak);
        assert_eq!(bars, 32);
        if cur.iter().any(|v| *v > 0.0) {
            break;
        }
        assert!(Instant::now() < deadline, "spectrum stayed flat");
        std::thread::sleep(Duration::from_millis(16));
    }

    rig.core.stop().unwrap();
    pump_until(&mut rig.core, "stop", |c| c.playback_state() == PlaybackState::Stopped);
    assert!(rig.core.source_format().is_none());
}
