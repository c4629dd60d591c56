//! Audio Core - Main Entry Point
//!
//! [`AudioCore`] lives on the host's foreground thread. It owns the
//! pipeline handle, the output state machine, the hotplug watchdog, the
//! spectrum processor and the settings handle, and it is the only place
//! where their results meet.
//!
//! # Threads
//!
//! ```text
//!                       ┌──────────────── foreground ────────────────┐
//!   host commands ────► │ AudioCore ── OutputStateMachine ── EventLog │
//!                       │    │  ▲           │ transitions             │
//!                       │    │  │ pump()    ▼                         │
//!                       │    │  │        HostSurface                  │
//!                       └────┼──┼───────────────────────────────────────┘
//!           PipelineCommand  │  │ PipelineEvent / SpectrumFrame / WorkResult
//!                            ▼  │
//!   hiresti-pipeline    hiresti-work-N    hiresti-hotplug    hiresti-settings
//! ```
//!
//! Workers and the watchdog never mutate core state. They send a
//! [`WorkResult`] and ask the host to call [`AudioCore::pump`] through
//! [`HostSurface::post_to_main`]. Pipeline events are drained by the same
//! `pump()`, which the host should also call on a short timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use hiresti_dsp::{
    sanitize_sync_offset, DspError, SpectrumAnalyzer, SpectrumProcessor, SpectrumProfile,
    EQ_MAX_DB, EQ_MIN_DB, MAX_SYNC_OFFSET_MS, NUM_EQ_BANDS,
};
use hiresti_platform::{
    session_control, supports_clock_control, system_enumerator, CachedEnumerator, ClockSettings,
    DeviceEnumerator, DeviceList, Driver, RuntimeFormat, SessionControl, DEFAULT_OUTPUT_NAME,
    DEFAULT_SYSTEM_OUTPUT_NAME, HIRES_ALLOWED_RATES,
};

use crate::cache::{AudioCache, CoverCache};
use crate::config::{CoreConfig, EnvConfig, LatencyProfile};
use crate::error::{
    classify, classify_backend_error, user_message, BackendErrorCategory, CoreResult,
    ErrorContext,
};
use crate::event_log::EventLog;
use crate::host::{HostSurface, MainTask, NoticeLevel};
use crate::message::{PipelineEvent, PlaybackState, RefreshPurpose, WorkResult};
use crate::model::{OutputRequest, OutputState, SinkFormat, StreamFormat, Track};
use crate::pipeline::{BackendFactory, CodecBackend, NativeBackend, Pipeline, SoftwareStage};
use crate::settings::{JsonSettingsStore, Settings, SettingsHandle, SettingsStore};
use crate::source::{PrefetchCache, TrackSource};
use crate::state::{Completion, OutputStateMachine, Transition, DISCONNECTED};
use crate::verdict::{diagnostics_lines, output_health, BitPerfectVerdict, VerdictInput};
use crate::watchdog::{
    evaluate_probe, HotplugWatchdog, PassiveMonitor, ProbeFinding, ProbeGate, ProbeSink,
    WatchPhase, WatchdogControl,
};
use crate::work::{OpClass, RequestTracker, WorkQueue};

#[cfg(test)]
mod tests;

/// Fallback reason when the session graph ignores the force-rate hint
pub const RATE_BLOCKED: &str = "PipeWire rate blocked";

const NETWORK_ERROR: &str = "Network stream error";
const CODEC_ERROR: &str = "Decoder/codec error";
const NO_OUTPUT: &str = "No output device available";

const NOTICE_MS: u32 = 4000;

/// Identical backend errors within this window are reported once
const ERROR_DEDUPE: Duration = Duration::from_secs(1);

/// Events shown in the diagnostics view
const DIAG_EVENTS: usize = 8;

static UNKNOWN_FORMAT: StreamFormat = StreamFormat {
    rate: 0,
    depth: 0,
    channels: 0,
    codec: String::new(),
    bitrate: 0,
};

/// What `set_output` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Reconfiguration dispatched under this request id
    Started(u64),
    /// Already active on exactly this request
    Unchanged,
    /// Same request already in flight
    Coalesced,
}

/// Collaborators the core is built from
pub struct CoreParts {
    pub host: Arc<dyn HostSurface>,
    pub enumerator: Arc<dyn DeviceEnumerator>,
    /// Session clock control; `None` where no session manager can be steered
    pub clock: Option<Arc<dyn SessionControl>>,
    pub backend: BackendFactory,
    pub source: Arc<dyn TrackSource>,
    pub settings: Arc<dyn SettingsStore>,
    pub audio_cache: Option<AudioCache>,
    pub cover_cache: Option<CoverCache>,
    pub config: CoreConfig,
    pub env: EnvConfig,
}

impl CoreParts {
    /// System devices, the native backend, JSON settings and on-disk caches
    pub fn system(host: Arc<dyn HostSurface>, source: Arc<dyn TrackSource>) -> CoreResult<Self> {
        let env = EnvConfig::from_env();
        let clock = if supports_clock_control() {
            session_control().ok()
        } else {
            None
        };
        Ok(Self {
            host,
            enumerator: system_enumerator(),
            clock,
            backend: Box::new(|| Box::new(NativeBackend::new()) as Box<dyn CodecBackend>),
            source,
            settings: Arc::new(JsonSettingsStore::open_default()?),
            audio_cache: AudioCache::open_default(Settings::default().audio_cache_tracks as usize).ok(),
            cover_cache: CoverCache::open_default(&env).ok(),
            config: CoreConfig::default(),
            env,
        })
    }
}

/// The audio core aggregate
pub struct AudioCore {
    host: Arc<dyn HostSurface>,
    enumerator: Arc<CachedEnumerator>,
    clock: Option<Arc<dyn SessionControl>>,
    source: Arc<dyn TrackSource>,
    audio_cache: Option<AudioCache>,
    settings: SettingsHandle,
    config: CoreConfig,

    pipeline: Pipeline,
    work: WorkQueue,
    results_tx: Sender<WorkResult>,
    results_rx: Receiver<WorkResult>,
    tracker: RequestTracker,

    state: OutputStateMachine,
    watchdog: Box<dyn WatchdogControl>,
    watch_epoch: Arc<AtomicU64>,
    gate: ProbeGate,
    passive: PassiveMonitor,
    known_devices: HashMap<Driver, Vec<String>>,
    event_log: EventLog,

    spectrum: SpectrumProcessor,
    spectrum_enabled: bool,
    visual_offset_ms: i32,
    prefetch: PrefetchCache,

    /// What the user asked for; the state machine tracks what is applied
    target: OutputRequest,
    /// Latest output request id handed to the pipeline
    output_id: u64,
    /// Waiting for clock negotiation before the sink is opened
    deferred_output: Option<(u64, OutputRequest)>,
    /// Clock renegotiation for an already applied sink
    renegotiating: Option<u64>,
    pro_audio_pending: bool,
    force_rate_set: bool,
    session_clock: Option<ClockSettings>,
    runtime_format: Option<RuntimeFormat>,
    sink: Option<SinkFormat>,
    elements: Vec<String>,

    source_format: Option<StreamFormat>,
    duration_s: Option<f64>,
    current_track: Option<Track>,
    playback: PlaybackState,
    autoplay: Option<u64>,
    last_error: Option<(String, Instant)>,

    started: Instant,
    shut_down: bool,
}

impl AudioCore {
    /// Build the core, spawn its threads and restore the saved output
    pub fn new(parts: CoreParts) -> CoreResult<Self> {
        let CoreParts {
            host,
            enumerator: raw_enumerator,
            clock,
            backend,
            source,
            settings,
            audio_cache,
            cover_cache,
            config,
            env,
        } = parts;

        let settings = SettingsHandle::open(settings)?;
        let saved = settings.snapshot();
        if let Some(lib) = &env.rust_viz_lib {
            info!("HIRESTI_RUST_VIZ_LIB={} ignored: spectrum DSP is built in", lib);
        }

        let analyzer = Arc::new(SpectrumAnalyzer::new(48000.0, config.spectrum_fps));
        let stage = SoftwareStage::new(analyzer, config.spectrum_fps);
        let pipeline = Pipeline::spawn(backend, stage, &config)?;
        let work = WorkQueue::new(config.workers)?;
        let (results_tx, results_rx) = unbounded::<WorkResult>();

        let watch_epoch = Arc::new(AtomicU64::new(0));
        let gate = ProbeGate::new();
        let sink: ProbeSink = {
            let results = results_tx.clone();
            let host = Arc::clone(&host);
            let epoch = Arc::clone(&watch_epoch);
            Box::new(move |driver, list| {
                let request_id = epoch.load(Ordering::SeqCst);
                let result = WorkResult::HotplugProbe {
                    request_id,
                    driver,
                    list,
                };
                if results.send(result).is_ok() {
                    host.post_to_main(MainTask::Pump);
                }
            })
        };
        // Probes bypass the TTL cache; a stale listing would hide the change
        let watchdog = HotplugWatchdog::spawn(
            config.watchdog.clone(),
            Arc::clone(&raw_enumerator),
            gate.clone(),
            sink,
        )?;

        let audio_cache = audio_cache.map(|mut cache| {
            cache.set_max_tracks(saved.audio_cache_tracks as usize);
            cache
        });

        let target = OutputRequest {
            driver: saved.driver(),
            device_id: None,
            device_name: saved.device.clone(),
            bit_perfect: saved.bit_perfect,
            exclusive: saved.exclusive_lock,
            latency: saved.latency(),
        };

        let mut core = Self {
            host,
            enumerator: Arc::new(CachedEnumerator::new(raw_enumerator)),
            clock,
            source,
            audio_cache,
            settings,
            pipeline,
            work,
            results_tx,
            results_rx,
            tracker: RequestTracker::new(),
            state: OutputStateMachine::new(),
            watchdog: Box::new(watchdog),
            watch_epoch,
            gate,
            passive: PassiveMonitor::new(config.watchdog.clone()),
            known_devices: HashMap::new(),
            event_log: EventLog::new(),
            spectrum: SpectrumProcessor::new(
                saved.viz_bar_count as usize,
                saved.viz_profile(),
                config.spectrum_max_hz,
            ),
            spectrum_enabled: true,
            visual_offset_ms: 0,
            prefetch: PrefetchCache::default(),
            target,
            output_id: 0,
            deferred_output: None,
            renegotiating: None,
            pro_audio_pending: false,
            force_rate_set: false,
            session_clock: None,
            runtime_format: None,
            sink: None,
            elements: Vec::new(),
            source_format: None,
            duration_s: None,
            current_track: None,
            playback: PlaybackState::Stopped,
            autoplay: None,
            last_error: None,
            started: Instant::now(),
            shut_down: false,
            config,
        };

        core.apply_saved(&saved)?;
        if let Some(covers) = cover_cache {
            core.prune_covers(covers);
        }
        core.restore_output()?;
        info!("Audio core started");
        Ok(core)
    }

    fn apply_saved(&mut self, saved: &Settings) -> CoreResult<()> {
        self.pipeline
            .set_volume(f32::from(saved.volume) / 100.0)?;
        for (band, gain_db) in saved.eq_gains.iter().enumerate() {
            if *gain_db != 0.0 {
                self.pipeline.set_eq_band(band, *gain_db)?;
            }
        }
        self.apply_visual_offset();
        Ok(())
    }

    fn restore_output(&mut self) -> CoreResult<()> {
        let name = self.target.device_name.as_str();
        if self.target.driver == Driver::Auto || name == DEFAULT_OUTPUT_NAME || name == DEFAULT_SYSTEM_OUTPUT_NAME {
            self.start_switch(self.target.clone(), "restore")?;
            return Ok(());
        }
        self.submit_listing(self.target.driver, RefreshPurpose::Restore, 0)
    }

    fn prune_covers(&self, covers: CoverCache) {
        let result = self.submit(move || {
            if let Err(e) = covers.prune(std::time::SystemTime::now()) {
                warn!("Cover cache prune failed: {}", e);
            }
            None
        });
        if let Err(e) = result {
            warn!("Could not schedule cover prune: {}", e);
        }
    }

    // ---- work plumbing ----

    /// Run `job` on a worker; its result is delivered through `pump()`
    fn submit<F>(&self, job: F) -> CoreResult<()>
    where
        F: FnOnce() -> Option<WorkResult> + Send + 'static,
    {
        let results = self.results_tx.clone();
        let host = Arc::clone(&self.host);
        self.work.submit(move || {
            if let Some(result) = job() {
                if results.send(result).is_ok() {
                    host.post_to_main(MainTask::Pump);
                }
            }
        })
    }

    fn submit_listing(&self, driver: Driver, purpose: RefreshPurpose, request_id: u64) -> CoreResult<()> {
        if purpose != RefreshPurpose::Presence {
            self.enumerator.invalidate_driver(driver);
        }
        let enumerator: Arc<dyn DeviceEnumerator> = self.enumerator.clone();
        let gate = (purpose == RefreshPurpose::Presence).then(|| self.gate.clone());
        self.submit(move || {
            let _guard = match &gate {
                Some(gate) => Some(gate.try_enter(driver)?),
                None => None,
            };
            let result = enumerator.list_devices(driver).map_err(|e| e.to_string());
            Some(WorkResult::DevicesListed {
                request_id,
                driver,
                purpose,
                result,
            })
        })
    }

    fn log(&mut self, message: &str) {
        let line = self.event_log.push(message);
        self.host.record_diag_event(&line);
    }

    fn notice(&self, level: NoticeLevel, text: &str) {
        self.host.show_notice(level, text, NOTICE_MS);
    }

    fn emit(&mut self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        info!("{}", transition.log_line());
        self.log(&transition.log_line());
        self.host.on_output_state_transition(&transition);
        let (health, detail) = output_health(&transition.next);
        self.host.set_diag_health("output", health, detail);
        if transition.next == OutputState::Active {
            self.passive.reset();
        }
    }

    // ---- transport ----

    /// Resolve and play `track`; returns the play request id
    pub fn play_track(&mut self, track: Track) -> CoreResult<u64> {
        let id = self.tracker.next(OpClass::Play);
        self.autoplay = Some(id);
        let quality = self.source.quality_key();
        if let Some(uri) = self.prefetch.take(&track.id, &quality) {
            debug!("Using prefetched stream for {}", track.id);
            self.load_resolved(id, track, uri)?;
            return Ok(id);
        }

        let source = Arc::clone(&self.source);
        let cache = self.audio_cache.clone();
        let timeout = self.config.external_timeout();
        self.submit(move || {
            let cached = cache
                .as_ref()
                .and_then(|c| c.lookup(&track.id, &quality))
                .map(|path| path.to_string_lossy().into_owned());
            let result = match cached {
                Some(path) => Ok(path),
                None => source.stream_uri(&track, timeout).map_err(|e| e.to_string()),
            };
            Some(WorkResult::StreamResolved {
                request_id: id,
                track,
                result,
            })
        })?;
        Ok(id)
    }

    /// Resolve `track` ahead of time so the next `play_track` starts at once
    pub fn prefetch_track(&self, track: Track) -> CoreResult<()> {
        let quality = self.source.quality_key();
        if self.prefetch.contains(&track.id, &quality) {
            return Ok(());
        }
        let source = Arc::clone(&self.source);
        let timeout = self.config.external_timeout();
        self.submit(move || match source.stream_uri(&track, timeout) {
            Ok(uri) => Some(WorkResult::Prefetched {
                track_id: track.id,
                quality,
                uri,
            }),
            Err(e) => {
                debug!("Prefetch of {} failed: {}", track.id, e);
                None
            }
        })
    }

    /// Open `uri` without starting playback
    pub fn load_uri(&mut self, uri: &str) -> CoreResult<u64> {
        let id = self.tracker.next(OpClass::Play);
        self.autoplay = None;
        self.current_track = None;
        self.begin_load(uri, id)?;
        Ok(id)
    }

    fn begin_load(&mut self, uri: &str, request_id: u64) -> CoreResult<()> {
        self.source_format = None;
        self.duration_s = None;
        self.spectrum.reset();
        self.pipeline.load(uri, request_id)
    }

    fn load_resolved(&mut self, request_id: u64, track: Track, uri: String) -> CoreResult<()> {
        self.begin_load(&uri, request_id)?;
        if uri.starts_with("http") {
            self.cache_track(&track, &uri);
        }
        self.current_track = Some(track);
        Ok(())
    }

    fn cache_track(&mut self, track: &Track, uri: &str) {
        let Some(cache) = self.audio_cache.clone().filter(AudioCache::is_enabled) else {
            return;
        };
        let request_id = self.tracker.next(OpClass::CacheFetch);
        let quality = self.source.quality_key();
        let track_id = track.id.clone();
        let uri = uri.to_string();
        let timeout = self.config.external_timeout();
        let result = self.submit(move || {
            let result = cache
                .fetch(&track_id, &quality, &uri, timeout)
                .map(|path| path.map(|p| p.to_string_lossy().into_owned()))
                .map_err(|e| e.to_string());
            Some(WorkResult::Cached {
                request_id,
                track_id,
                result,
            })
        });
        if let Err(e) = result {
            debug!("Audio cache fetch not scheduled: {}", e);
        }
    }

    pub fn play(&mut self) -> CoreResult<()> {
        self.pipeline.play()
    }

    pub fn pause(&mut self) -> CoreResult<()> {
        self.autoplay = None;
        self.pipeline.pause()
    }

    /// Stop and release the stream; `play()` needs a new load afterwards
    pub fn stop(&mut self) -> CoreResult<()> {
        self.autoplay = None;
        self.source_format = None;
        self.duration_s = None;
        self.spectrum.reset();
        self.pipeline.stop()
    }

    pub fn seek(&mut self, position_s: f64) -> CoreResult<()> {
        self.pipeline.seek(position_s)
    }

    /// `(position_s, duration_s)`; never goes backwards except across a seek
    pub fn position(&self) -> (f64, Option<f64>) {
        self.pipeline.position()
    }

    // ---- software stage ----

    /// Software volume `0.0..=1.0`; ignored while bit-perfect is on
    pub fn set_volume(&mut self, volume: f32) -> CoreResult<()> {
        let volume = volume.clamp(0.0, 1.0);
        let percent = (volume * 100.0).round() as u8;
        self.settings.update(|s| s.volume = percent);
        if self.target.bit_perfect {
            debug!("Volume change ignored under bit-perfect");
            return Ok(());
        }
        self.pipeline.set_volume(volume)
    }

    pub fn set_eq_band(&mut self, band: usize, gain_db: f32) -> CoreResult<()> {
        if band >= NUM_EQ_BANDS {
            return Err(DspError::InvalidBandIndex(band).into());
        }
        let gain_db = gain_db.clamp(EQ_MIN_DB, EQ_MAX_DB);
        self.settings.update(|s| s.eq_gains[band] = gain_db);
        self.pipeline.set_eq_band(band, gain_db)
    }

    // ---- output ----

    /// Switch the output; identical requests are coalesced
    pub fn set_output(&mut self, request: OutputRequest) -> CoreResult<SwitchOutcome> {
        if *self.state.state() == OutputState::Active
            && self.state.applied() == Some(&request)
            && self.deferred_output.is_none()
        {
            debug!("Output already active on {}", request.device_name);
            return Ok(SwitchOutcome::Unchanged);
        }
        if let Some((_, in_flight, started)) = self.state.in_flight() {
            if *in_flight == request && started.elapsed() < self.config.switch_coalesce() {
                debug!("Output switch to {} already in flight", request.device_name);
                return Ok(SwitchOutcome::Coalesced);
            }
        }
        self.persist_target(&request);
        let id = self.start_switch(request, "output change")?;
        Ok(SwitchOutcome::Started(id))
    }

    fn persist_target(&self, request: &OutputRequest) {
        let request = request.clone();
        self.settings.update(move |s| {
            s.driver = request.driver.as_str().to_string();
            s.device = request.device_name;
            s.bit_perfect = request.bit_perfect;
            s.exclusive_lock = request.exclusive;
            s.latency_profile = request.latency.as_str().to_string();
        });
    }

    fn start_switch(&mut self, request: OutputRequest, detail: &str) -> CoreResult<u64> {
        self.target = request.clone();
        let (id, transition) = self.state.begin(request.clone(), detail);
        self.emit(transition);
        self.dispatch_output(id, request)?;
        Ok(id)
    }

    fn dispatch_output(&mut self, id: u64, request: OutputRequest) -> CoreResult<()> {
        self.output_id = id;
        self.renegotiating = None;
        self.sink = None;
        self.runtime_format = None;
        self.session_clock = None;
        self.apply_visual_offset();

        let rate = self
            .source_format
            .as_ref()
            .filter(|s| s.is_known())
            .map(|s| s.rate);
        match rate.filter(|_| self.needs_clock(&request)) {
            Some(rate) => {
                let device_id = request.device_id.clone();
                self.deferred_output = Some((id, request));
                self.negotiate_clock(id, rate, device_id)
            }
            None => {
                self.deferred_output = None;
                if !request.bit_perfect {
                    self.release_force_rate();
                }
                self.pipeline.set_output(id, request)
            }
        }
    }

    fn needs_clock(&self, request: &OutputRequest) -> bool {
        request.driver == Driver::PipeWire && request.bit_perfect && !request.exclusive && self.clock.is_some()
    }

    /// Publish a force-rate hint and wait for the graph to follow
    fn negotiate_clock(&mut self, request_id: u64, rate: u32, device_id: Option<String>) -> CoreResult<()> {
        let Some(clock) = self.clock.clone() else {
            return Ok(());
        };
        let pro_audio = std::mem::take(&mut self.pro_audio_pending);
        let grace = self.config.pipewire_grace();
        let poll = self.config.pipewire_poll();
        self.force_rate_set = true;
        self.submit(move || {
            let pro_audio = if pro_audio {
                device_id
                    .as_deref()
                    .map(|id| clock.ensure_pro_audio(id).map_err(|e| e.to_string()))
            } else {
                None
            };
            if let Err(e) = clock.set_allowed_rates(&HIRES_ALLOWED_RATES) {
                warn!("Failed to publish allowed rates: {}", e);
            }
            if let Err(e) = clock.set_force_rate(rate) {
                warn!("Failed to publish force-rate {}: {}", rate, e);
            }
            let (settings, honoured) = clock.wait_for_clock(&|c: &ClockSettings| c.honours(rate), grace, poll);
            Some(WorkResult::ClockNegotiated {
                request_id,
                rate,
                honoured,
                clock: settings,
                pro_audio,
            })
        })
    }

    fn release_force_rate(&mut self) {
        if !std::mem::take(&mut self.force_rate_set) {
            return;
        }
        let Some(clock) = self.clock.clone() else {
            return;
        };
        let result = self.submit(move || {
            if let Err(e) = clock.set_force_rate(0) {
                warn!("Failed to release force-rate: {}", e);
            }
            None
        });
        if let Err(e) = result {
            warn!("Could not schedule force-rate release: {}", e);
        }
    }

    /// Re-apply the last requested output after Fallback or Error
    pub fn recover_output(&mut self) -> CoreResult<Option<u64>> {
        if !self.state.can_recover() {
            return Ok(None);
        }
        let Some(request) = self.state.requested().cloned() else {
            return Ok(None);
        };
        self.state.clear_last_disconnected();
        self.stop_watchdog();
        self.log(&format!("Recover requested for {}", request.device_name));
        self.start_switch(request, "recover").map(Some)
    }

    pub fn set_bit_perfect(&mut self, enabled: bool) -> CoreResult<SwitchOutcome> {
        let mut request = self.target.clone();
        request.bit_perfect = enabled;
        if !enabled {
            request.exclusive = false;
            let volume = self.settings.read(|s| f32::from(s.volume) / 100.0);
            self.pipeline.set_volume(volume)?;
        } else if request.driver == Driver::PipeWire {
            self.pro_audio_pending = true;
        }
        self.set_output(request)
    }

    /// Exclusive mode only applies together with bit-perfect
    pub fn set_exclusive(&mut self, enabled: bool) -> CoreResult<SwitchOutcome> {
        if enabled && !self.target.bit_perfect {
            warn!("Exclusive mode needs bit-perfect mode");
            return Ok(SwitchOutcome::Unchanged);
        }
        let mut request = self.target.clone();
        request.exclusive = enabled;
        self.set_output(request)
    }

    /// Apply sink timings; restarts the output when playing or exclusive
    pub fn set_latency_profile(&mut self, profile: LatencyProfile) -> CoreResult<()> {
        let (buffer_ms, latency_ms) = profile.timings();
        self.pipeline.set_alsa_latency(buffer_ms, latency_ms)?;

        let offset = sanitize_sync_offset(i64::from(buffer_ms).min(i64::from(MAX_SYNC_OFFSET_MS)));
        self.settings.update(|s| {
            s.latency_profile = profile.as_str().to_string();
            s.viz_sync_offset_ms = offset;
        });
        self.target.latency = profile;
        self.set_visual_offset(offset);
        self.log(&format!("Latency profile: {}", profile.as_str()));

        if self.playback == PlaybackState::Playing || self.target.exclusive {
            self.start_switch(self.target.clone(), "latency profile changed")?;
        }
        Ok(())
    }

    /// Refresh the device list for `driver`; answered via `on_devices_changed`
    pub fn refresh_devices(&mut self, driver: Driver) -> CoreResult<u64> {
        let id = self.tracker.next(OpClass::DeviceRefresh);
        self.submit_listing(driver, RefreshPurpose::User, id)?;
        Ok(id)
    }

    pub fn drivers(&self) -> Vec<Driver> {
        self.enumerator.list_drivers()
    }

    // ---- spectrum ----

    pub fn set_spectrum_enabled(&mut self, enabled: bool) -> CoreResult<()> {
        self.spectrum_enabled = enabled;
        if !enabled {
            self.spectrum.reset();
        }
        self.pipeline.set_spectrum_enabled(enabled)
    }

    pub fn set_bar_count(&mut self, count: usize) -> CoreResult<()> {
        self.spectrum.set_bar_count(count)?;
        self.settings.update(|s| s.viz_bar_count = count as u32);
        Ok(())
    }

    pub fn set_viz_profile(&mut self, profile: SpectrumProfile) {
        self.spectrum.set_profile(profile);
        self.settings.update(|s| s.viz_profile = profile.index() as u8);
    }

    /// Renderer entry: animate one display frame into the caller's buffers
    ///
    /// Returns the bar count written and the bass level.
    pub fn tick_spectrum(&mut self, cur: &mut [f32], trail: &mut [f32], peak: &mut [f32]) -> (usize, f32) {
        self.drain_spectrum();
        let position = (self.playback == PlaybackState::Playing).then(|| self.pipeline.position().0);
        let now_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.spectrum.tick_copy(now_ms, position, cur, trail, peak)
    }

    fn drain_spectrum(&mut self) {
        let enabled = self.spectrum_enabled;
        for frame in self.pipeline.drain_spectrum() {
            if enabled {
                self.spectrum.push_frame(frame);
            }
        }
    }

    fn offset_for(&self, request: &OutputRequest) -> i32 {
        let key = request.offset_key();
        self.settings
            .read(|s| s.device_offset(&key).unwrap_or(s.viz_sync_offset_ms))
    }

    fn apply_visual_offset(&mut self) {
        let offset = self.offset_for(&self.target);
        self.set_visual_offset(offset);
    }

    fn set_visual_offset(&mut self, offset_ms: i32) {
        self.visual_offset_ms = offset_ms;
        self.spectrum.set_sync_offset_ms(i64::from(offset_ms));
    }

    /// Learned offsets are reported but never persisted
    pub fn on_viz_sync_offset_update(&mut self, learned_ms: i32) {
        debug!("Pipeline learned A/V offset {}ms; keeping {}ms", learned_ms, self.visual_offset_ms);
    }

    // ---- diagnostics ----

    fn active_request(&self) -> &OutputRequest {
        self.state.applied().unwrap_or(&self.target)
    }

    fn verdict_sink(&self) -> Option<SinkFormat> {
        if let Some(rt) = self.runtime_format {
            return Some(SinkFormat {
                rate: rt.rate,
                depth: rt.depth,
                channels: 2,
            });
        }
        if self.active_request().driver == Driver::PipeWire {
            if let Some(clock) = self.session_clock.as_ref().filter(|c| c.clock_rate > 0) {
                return Some(SinkFormat {
                    rate: clock.clock_rate,
                    depth: self.sink.map(|s| s.depth).unwrap_or(0),
                    channels: 2,
                });
            }
        }
        self.sink.filter(|s| s.rate > 0)
    }

    fn verdict_input(&self) -> VerdictInput<'_> {
        let active = self.active_request();
        VerdictInput {
            bit_perfect: self.target.bit_perfect,
            exclusive: self.target.exclusive,
            driver: active.driver,
            device_name: &active.device_name,
            state: self.state.state(),
            source: self.source_format.as_ref().unwrap_or(&UNKNOWN_FORMAT),
            sink: self.verdict_sink(),
            last_error: self.last_error.as_ref().map(|(m, _)| m.as_str()),
        }
    }

    pub fn verdict(&self) -> BitPerfectVerdict {
        BitPerfectVerdict::evaluate(&self.verdict_input())
    }

    /// Lines for the signal-path view
    pub fn diagnostics(&self) -> Vec<String> {
        diagnostics_lines(&self.verdict_input(), &self.event_log.recent(DIAG_EVENTS))
    }

    // ---- accessors ----

    pub fn output_state(&self) -> &OutputState {
        self.state.state()
    }

    pub fn state_machine(&self) -> &OutputStateMachine {
        &self.state
    }

    pub fn target(&self) -> &OutputRequest {
        &self.target
    }

    pub fn source_format(&self) -> Option<&StreamFormat> {
        self.source_format.as_ref()
    }

    pub fn sink_format(&self) -> Option<SinkFormat> {
        self.sink
    }

    /// Names of the elements in the current graph
    pub fn graph_elements(&self) -> &[String] {
        &self.elements
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_track.as_ref()
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration_s
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback
    }

    pub fn visual_offset_ms(&self) -> i32 {
        self.visual_offset_ms
    }

    pub fn settings(&self) -> Settings {
        self.settings.snapshot()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// Hand the pending log lines to a diagnostics view
    pub fn drain_events(&mut self) -> Vec<String> {
        self.event_log.drain()
    }

    pub fn watchdog_phase(&self) -> WatchPhase {
        self.watchdog.phase()
    }

    pub fn spectrum(&self) -> &SpectrumProcessor {
        &self.spectrum
    }

    // ---- foreground pump ----

    /// Apply everything that arrived from other threads; returns how many
    /// messages were handled
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.pipeline.try_recv_event() {
            self.on_pipeline_event(event);
            handled += 1;
        }
        while let Ok(result) = self.results_rx.try_recv() {
            self.on_work_result(result);
            handled += 1;
        }
        self.drain_spectrum();
        self.poll_presence();
        handled
    }

    fn on_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Loaded {
                request_id,
                format,
                duration_s,
            } => {
                self.duration_s = duration_s;
                self.source_format = Some(format.clone());
                self.host.on_tag(&format);
                self.log(&format!("Loaded {} {}", format.codec, format.describe()));
                if format.is_known() && self.deferred_output.is_none() && self.needs_clock(&self.target) {
                    let device_id = self.target.device_id.clone();
                    let followed = self
                        .session_clock
                        .as_ref()
                        .is_some_and(|c| c.honours(format.rate));
                    if !followed {
                        let detail = format!("clock renegotiation for {}Hz", format.rate);
                        if let Some((id, transition)) = self.state.renegotiate(&detail) {
                            self.output_id = id;
                            self.renegotiating = Some(id);
                            self.emit(transition);
                        }
                    }
                    if let Err(e) = self.negotiate_clock(self.output_id, format.rate, device_id) {
                        warn!("Clock negotiation not scheduled: {}", e);
                    }
                }
                self.query_runtime_format();
                if self.autoplay == Some(request_id) {
                    self.autoplay = None;
                    if let Err(e) = self.pipeline.play() {
                        warn!("Autoplay failed: {}", e);
                    }
                }
            }
            PipelineEvent::LoadFailed { request_id, message } => {
                if self.autoplay == Some(request_id) {
                    self.autoplay = None;
                }
                warn!("Load #{} failed: {}", request_id, message);
                self.log(&format!("Load failed: {}", message));
                self.notice(
                    NoticeLevel::Error,
                    user_message(classify(&message), ErrorContext::Playback),
                );
                self.host.reset_play_button();
            }
            PipelineEvent::StateChanged(state) => {
                self.playback = state;
            }
            PipelineEvent::Tag(format) => {
                self.host.on_tag(&format);
                self.source_format = Some(format);
            }
            PipelineEvent::Eos => self.host.on_eos(),
            PipelineEvent::Error { message } => self.on_backend_error(&message),
            PipelineEvent::OutputApplied {
                request_id,
                sink,
                elements,
                fallback,
            } => self.on_output_applied(request_id, sink, elements, fallback),
            PipelineEvent::OutputFailed { request_id, message } => {
                self.on_output_failed(request_id, &message)
            }
            PipelineEvent::SyncOffset { learned_ms } => self.on_viz_sync_offset_update(learned_ms),
        }
    }

    fn on_output_applied(
        &mut self,
        request_id: u64,
        sink: SinkFormat,
        elements: Vec<String>,
        fallback: Option<String>,
    ) {
        if request_id == 0 {
            // Rebuilt by a load for the request already applied
            self.sink = Some(sink);
            self.elements = elements;
            if let Some(reason) = fallback {
                let transition = self.state.fall_back(&reason);
                self.emit(transition);
            }
            return;
        }

        let completion = match &fallback {
            Some(reason) => Completion::Degraded(reason.clone()),
            None => Completion::Applied,
        };
        let transition = self.state.complete(request_id, completion);
        if request_id != self.output_id {
            return;
        }
        self.sink = Some(sink);
        self.elements = elements;
        self.emit(transition);
        if let Some(reason) = fallback {
            self.notice(NoticeLevel::Warning, &format!("Output fallback: {}", reason));
        }
        self.query_runtime_format();
    }

    fn on_output_failed(&mut self, request_id: u64, message: &str) {
        let transition = if request_id == 0 {
            self.state.fail(message)
        } else {
            self.state.complete(request_id, Completion::Failed(message.to_string()))
        };
        if transition.is_none() {
            return;
        }
        self.emit(transition);
        self.sink = None;
        if let Err(e) = self.pipeline.stop() {
            warn!("Stop after output failure: {}", e);
        }
        self.host.reset_play_button();
        self.notice(NoticeLevel::Error, message);
    }

    fn query_runtime_format(&self) {
        let request = self.active_request();
        if !request.driver.supports_presence_check() || self.source_format.is_none() {
            return;
        }
        let enumerator: Arc<dyn DeviceEnumerator> = self.enumerator.clone();
        let driver = request.driver;
        let device_id = request.device_id.clone();
        let request_id = self.output_id;
        let result = self.submit(move || {
            Some(WorkResult::RuntimeFormat {
                request_id,
                format: enumerator.runtime_format(driver, device_id.as_deref()),
            })
        });
        if let Err(e) = result {
            debug!("Runtime format query not scheduled: {}", e);
        }
    }

    fn on_backend_error(&mut self, message: &str) {
        let now = Instant::now();
        if let Some((last, at)) = &self.last_error {
            if last == message && now.duration_since(*at) < ERROR_DEDUPE {
                return;
            }
        }
        self.last_error = Some((message.to_string(), now));
        warn!("Backend error: {}", message);
        self.log(&format!("Backend error: {}", message));

        match classify_backend_error(message) {
            BackendErrorCategory::Device => {
                let active = self.active_request();
                let (driver, name) = (active.driver, active.device_name.clone());
                self.on_device_lost(driver, &name);
            }
            BackendErrorCategory::Network => self.fail_playback(NETWORK_ERROR, false),
            BackendErrorCategory::Codec => self.fail_playback(CODEC_ERROR, true),
            BackendErrorCategory::Other => {
                self.fail_playback(user_message(classify(message), ErrorContext::Playback), false)
            }
        }
    }

    fn fail_playback(&mut self, reason: &str, stop: bool) {
        let transition = self.state.fail(reason);
        self.emit(transition);
        let result = if stop {
            self.pipeline.stop()
        } else {
            self.pipeline.pause()
        };
        if let Err(e) = result {
            warn!("Could not halt playback: {}", e);
        }
        self.host.reset_play_button();
        self.notice(NoticeLevel::Error, reason);
    }

    // ---- device lifecycle ----

    fn on_device_lost(&mut self, driver: Driver, name: &str) {
        let Some(transition) = self.state.device_lost(driver, name) else {
            debug!("Device loss of {} ignored in state {}", name, self.state.state());
            return;
        };
        self.emit(Some(transition));
        self.notice(NoticeLevel::Warning, &format!("Audio device disconnected: {}", name));
        self.passive.note_event(Instant::now());
        self.start_watchdog(driver);
        if let Err(e) = self.submit_listing(driver, RefreshPurpose::Rebind, 0) {
            warn!("Rebind listing not scheduled: {}", e);
        }
    }

    fn start_watchdog(&mut self, driver: Driver) {
        let epoch = self.tracker.next(OpClass::HotplugProbe);
        self.watch_epoch.store(epoch, Ordering::SeqCst);
        self.watchdog.start(driver);
    }

    fn stop_watchdog(&mut self) {
        // Results already queued belong to the old generation
        let epoch = self.tracker.next(OpClass::HotplugProbe);
        self.watch_epoch.store(epoch, Ordering::SeqCst);
        self.watchdog.stop();
    }

    fn remember(&mut self, list: &DeviceList) {
        self.known_devices.insert(list.driver, list.names());
    }

    fn poll_presence(&mut self) {
        let driver = self.target.driver;
        if *self.state.state() != OutputState::Active
            || !driver.supports_presence_check()
            || self.target.device_id.is_none()
            || self.watchdog.is_running()
        {
            return;
        }
        if !self.passive.poll(self.playback == PlaybackState::Playing, Instant::now()) {
            return;
        }
        if self.gate.is_busy(driver) {
            return;
        }
        if let Err(e) = self.submit_listing(driver, RefreshPurpose::Presence, 0) {
            debug!("Presence check not scheduled: {}", e);
        }
    }

    fn on_work_result(&mut self, result: WorkResult) {
        match result {
            WorkResult::StreamResolved {
                request_id,
                track,
                result,
            } => {
                if !self.tracker.is_current(OpClass::Play, request_id) {
                    debug!("Discarding stale stream resolution #{}", request_id);
                    return;
                }
                match result {
                    Ok(uri) => {
                        if let Err(e) = self.load_resolved(request_id, track, uri) {
                            warn!("Load not sent: {}", e);
                        }
                    }
                    Err(message) => {
                        warn!("No stream for {}: {}", track.id, message);
                        self.autoplay = None;
                        self.log(&format!("Stream unavailable for {}: {}", track.title, message));
                        self.notice(
                            NoticeLevel::Warning,
                            user_message(classify(&message), ErrorContext::Playback),
                        );
                        self.host.reset_play_button();
                    }
                }
            }
            WorkResult::Prefetched {
                track_id,
                quality,
                uri,
            } => self.prefetch.insert(&track_id, &quality, uri),
            WorkResult::DevicesListed {
                request_id,
                driver,
                purpose,
                result,
            } => self.on_device_list(request_id, driver, purpose, result),
            WorkResult::ClockNegotiated {
                request_id,
                rate,
                honoured,
                clock,
                pro_audio,
            } => self.on_clock_negotiated(request_id, rate, honoured, clock, pro_audio),
            WorkResult::RuntimeFormat { request_id, format } => {
                if request_id == self.output_id {
                    self.runtime_format = format;
                }
            }
            WorkResult::HotplugProbe {
                request_id,
                driver,
                list,
            } => self.on_hotplug_probe(request_id, driver, list),
            WorkResult::Cached {
                request_id,
                track_id,
                result,
            } => match result {
                Ok(Some(path)) => {
                    debug!("Cache fetch #{} stored {}", request_id, path);
                    self.log(&format!("Cached track {}", track_id));
                }
                Ok(None) => {}
                Err(e) => warn!("Caching {} failed: {}", track_id, e),
            },
        }
    }

    fn on_device_list(
        &mut self,
        request_id: u64,
        driver: Driver,
        purpose: RefreshPurpose,
        result: Result<DeviceList, String>,
    ) {
        let list = match result {
            Ok(list) => list,
            Err(e) => {
                warn!("Listing {} devices failed: {}", driver, e);
                match purpose {
                    RefreshPurpose::Rebind => self.rebind_from(&DeviceList::empty(driver)),
                    RefreshPurpose::Restore => self.restore_from(&DeviceList::empty(driver)),
                    RefreshPurpose::User | RefreshPurpose::Presence => {}
                }
                return;
            }
        };

        match purpose {
            RefreshPurpose::User => {
                if !self.tracker.is_current(OpClass::DeviceRefresh, request_id) {
                    return;
                }
                self.remember(&list);
                self.host.on_devices_changed(&list);
            }
            RefreshPurpose::Presence => {
                self.remember(&list);
                if *self.state.state() != OutputState::Active {
                    return;
                }
                let missing = self
                    .state
                    .applied()
                    .filter(|r| r.driver == driver && r.device_id.is_some())
                    .filter(|r| !list.contains_name(&r.device_name))
                    .map(|r| r.device_name.clone());
                if let Some(name) = missing {
                    self.on_device_lost(driver, &name);
                }
            }
            RefreshPurpose::Rebind => {
                self.remember(&list);
                self.rebind_from(&list);
            }
            RefreshPurpose::Restore => {
                self.remember(&list);
                self.restore_from(&list);
            }
        }
    }

    /// Move audio to the first other device on the lost device's driver
    fn rebind_from(&mut self, list: &DeviceList) {
        let disconnected = matches!(self.state.state(), OutputState::Fallback(r) if r == DISCONNECTED);
        if !disconnected || self.state.in_flight().is_some() {
            return;
        }
        let lost = self.state.last_disconnected().map(|(_, name)| name.clone());
        let is_lost = |name: &str| lost.as_deref() == Some(name);
        let substitute = list
            .iter()
            .find(|d| !d.is_default() && !is_lost(&d.name))
            .or_else(|| list.iter().find(|d| !is_lost(&d.name)))
            .cloned();

        match substitute {
            Some(device) => {
                let request = OutputRequest {
                    driver: device.driver,
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                    ..self.target.clone()
                };
                let id = self.state.begin_rebind(request.clone());
                self.log(&format!("Rebinding output to {}", device.name));
                if let Err(e) = self.dispatch_output(id, request) {
                    warn!("Rebind not dispatched: {}", e);
                }
            }
            None => {
                let transition = self.state.fail(NO_OUTPUT);
                self.emit(transition);
                if let Err(e) = self.pipeline.stop() {
                    warn!("Stop after device loss: {}", e);
                }
                self.host.reset_play_button();
                self.notice(NoticeLevel::Error, NO_OUTPUT);
            }
        }
    }

    fn restore_from(&mut self, list: &DeviceList) {
        let request = match list.find_by_name(&self.target.device_name) {
            Some(device) => OutputRequest {
                device_id: device.id.clone(),
                device_name: device.name.clone(),
                ..self.target.clone()
            },
            None => {
                self.notice(
                    NoticeLevel::Warning,
                    &format!("Saved output device not found: {}", self.target.device_name),
                );
                let fallback = list.iter().find(|d| d.is_default()).or_else(|| list.first_available());
                OutputRequest {
                    device_id: fallback.and_then(|d| d.id.clone()),
                    device_name: fallback
                        .map(|d| d.name.clone())
                        .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string()),
                    ..self.target.clone()
                }
            }
        };
        if let Err(e) = self.start_switch(request, "restore") {
            warn!("Output restore failed: {}", e);
        }
    }

    fn on_hotplug_probe(&mut self, request_id: u64, driver: Driver, list: DeviceList) {
        if !self.tracker.is_current(OpClass::HotplugProbe, request_id) || !self.watchdog.is_running() {
            return;
        }
        let known = self.known_devices.get(&driver).cloned();
        let lost = self
            .state
            .last_disconnected()
            .filter(|(d, _)| *d == driver)
            .map(|(_, name)| name.clone());
        self.remember(&list);
        let Some(known) = known else {
            debug!("First {} listing; recorded as baseline", driver);
            return;
        };

        match evaluate_probe(&known, &list, lost.as_deref()) {
            ProbeFinding::Reappeared(name) => self.on_device_back(driver, &name, &list),
            ProbeFinding::NewDevice(name) => {
                self.log(&format!("New audio device: {}", name));
                self.notice(NoticeLevel::Info, &format!("New audio device detected: {}", name));
                self.passive.note_event(Instant::now());
                self.stop_watchdog();
            }
            ProbeFinding::Unchanged => {}
        }
    }

    fn on_device_back(&mut self, driver: Driver, name: &str, list: &DeviceList) {
        let now = Instant::now();
        let auto_rebind = self.settings.read(|s| s.output_auto_rebind_once);
        let cooldown = self.state.cooldown_remaining(now);
        self.passive.note_event(now);
        self.state.clear_last_disconnected();
        self.stop_watchdog();
        self.log(&format!("Previous device back: {}", name));

        match (auto_rebind, cooldown) {
            (true, None) => {
                let request = match self.state.requested() {
                    Some(r) if r.driver == driver && r.device_name == name => r.clone(),
                    _ => {
                        let device = list.find_by_name(name);
                        OutputRequest {
                            driver,
                            device_id: device.and_then(|d| d.id.clone()),
                            device_name: name.to_string(),
                            ..self.target.clone()
                        }
                    }
                };
                self.state
                    .arm_cooldown(now, self.config.watchdog.rebind_cooldown());
                match self.start_switch(request, "switched back automatically") {
                    Ok(_) => self.notice(
                        NoticeLevel::Success,
                        &format!("Switched back automatically to {}", name),
                    ),
                    Err(e) => warn!("Switch-back failed: {}", e),
                }
            }
            (true, Some(left)) => self.notice(
                NoticeLevel::Info,
                &format!(
                    "Previous device is back: {} (auto switch-back cooling down, {}s left)",
                    name,
                    left.as_secs().max(1)
                ),
            ),
            (false, _) => self.notice(NoticeLevel::Info, &format!("Previous device is back: {}", name)),
        }
    }

    fn on_clock_negotiated(
        &mut self,
        request_id: u64,
        rate: u32,
        honoured: bool,
        clock: ClockSettings,
        pro_audio: Option<Result<String, String>>,
    ) {
        if request_id != self.output_id {
            debug!("Discarding stale clock negotiation #{}", request_id);
            return;
        }
        match pro_audio {
            Some(Ok(card)) => self.log(&format!("Pro Audio profile active on {}", card)),
            Some(Err(e)) => {
                warn!("Pro Audio profile switch failed: {}", e);
                self.notice(
                    NoticeLevel::Warning,
                    &format!("Could not switch to Pro Audio profile: {}", e),
                );
            }
            None => {}
        }
        self.session_clock = Some(clock);
        let renegotiated = self.renegotiating == Some(request_id);
        if renegotiated {
            self.renegotiating = None;
        }

        if honoured {
            self.log(&format!("PipeWire clock follows {}Hz", rate));
            if renegotiated {
                let transition = self.state.complete(request_id, Completion::Applied);
                self.emit(transition);
            }
        } else {
            warn!("PipeWire kept its clock; {}Hz not honoured", rate);
            let transition = if renegotiated {
                self.state
                    .complete(request_id, Completion::Degraded(RATE_BLOCKED.to_string()))
            } else if self.state.is_current(request_id) {
                self.state.degrade(request_id, RATE_BLOCKED)
            } else {
                self.state.fall_back(RATE_BLOCKED)
            };
            if transition.is_some() {
                self.emit(transition);
                if self.playback == PlaybackState::Playing {
                    if let Err(e) = self.pipeline.pause() {
                        warn!("Pause after rate block: {}", e);
                    }
                }
                self.host.reset_play_button();
                self.notice(NoticeLevel::Warning, RATE_BLOCKED);
            }
        }

        if self.deferred_output.as_ref().map(|(id, _)| *id) == Some(request_id) {
            if let Some((id, request)) = self.deferred_output.take() {
                if let Err(e) = self.pipeline.set_output(id, request) {
                    warn!("Output not sent after negotiation: {}", e);
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Stop threads, release the clock override and flush settings
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.shut_down, true) {
            return;
        }
        self.watchdog.stop();
        if let Err(e) = self.pipeline.stop() {
            debug!("Pipeline already gone: {}", e);
        }
        if self.force_rate_set {
            if let Some(clock) = &self.clock {
                if let Err(e) = clock.set_force_rate(0) {
                    warn!("Failed to release force-rate: {}", e);
                }
            }
        }
        if let Err(e) = self.settings.flush() {
            warn!("Final settings flush failed: {}", e);
        }
        self.work.shutdown();
        info!("Audio core shut down");
    }
}

impl Drop for AudioCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
