//! Audio Pipeline
//!
//! [`Pipeline`] lives on the foreground thread and talks to a dedicated
//! pipeline thread that owns the [`CodecBackend`]. Nothing outside that
//! thread touches the decoder graph.
//!
//! ```text
//! foreground                         hiresti-pipeline
//! ──────────                         ────────────────
//! Pipeline ──PipelineCommand──────►  PipelineWorker ──► Box<dyn CodecBackend>
//!    ▲                                   │  │
//!    ├──────PipelineEvent (unbounded) ◄──┘  │ analyzer.update()
//!    ├──────SpectrumFrame (rtrb SPSC) ◄─────┘
//!    └──────PositionClock (shared)
//! ```

pub mod backend;
mod clock;
pub mod graph;
pub mod native;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use hiresti_dsp::{sanitize_sync_offset, SpectrumFrame};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, PipelineError};
use crate::message::{PipelineCommand, PipelineEvent, PlaybackState};
use crate::model::{OutputRequest, SinkFormat, StreamFormat};

pub use backend::{BackendEvent, BackendFactory, CodecBackend, LoadedMedia, SimHandle, SimulatedBackend};
pub use clock::PositionClock;
pub use graph::{build_graph, EqControl, GraphElement, GraphPlan, SoftwareStage};
pub use native::NativeBackend;

/// Frames buffered between the pipeline thread and the renderer
const SPECTRUM_RING_CAPACITY: usize = 8;

/// Handle to the pipeline thread
pub struct Pipeline {
    command_sender: Sender<PipelineCommand>,
    event_receiver: Receiver<PipelineEvent>,
    thread: Option<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
    has_media: Arc<AtomicBool>,
    clock: Arc<PositionClock>,
    spectrum: Consumer<SpectrumFrame>,
    stage: SoftwareStage,
}

impl Pipeline {
    /// Spawn the pipeline thread; the backend is built on it by `factory`
    pub fn spawn(factory: BackendFactory, stage: SoftwareStage, config: &CoreConfig) -> CoreResult<Self> {
        let (command_sender, command_receiver) = bounded::<PipelineCommand>(32);
        let (event_sender, event_receiver) = unbounded::<PipelineEvent>();
        let (producer, spectrum) = RingBuffer::<SpectrumFrame>::new(SPECTRUM_RING_CAPACITY);

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let has_media = Arc::new(AtomicBool::new(false));
        let clock = Arc::new(PositionClock::new(config.seek_hold()));

        let worker_shutdown = Arc::clone(&shutdown_flag);
        let worker_media = Arc::clone(&has_media);
        let worker_clock = Arc::clone(&clock);
        let worker_stage = stage.clone();
        let load_timeout = config.external_timeout();

        let name = "hiresti-pipeline".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let worker = PipelineWorker {
                    backend: factory(),
                    events: event_sender,
                    clock: worker_clock,
                    has_media: worker_media,
                    stage: worker_stage,
                    spectrum: producer,
                    frame: SpectrumFrame::default(),
                    request: OutputRequest::default(),
                    latency: None,
                    source: None,
                    state: PlaybackState::Stopped,
                    volume: 1.0,
                    spectrum_enabled: true,
                    load_timeout,
                };
                worker.run(command_receiver, worker_shutdown);
            })
            .map_err(|e| CoreError::Spawn {
                name,
                message: e.to_string(),
            })?;

        Ok(Self {
            command_sender,
            event_receiver,
            thread: Some(thread),
            shutdown_flag,
            has_media,
            clock,
            spectrum,
            stage,
        })
    }

    /// Tear down the current graph and open `uri`
    pub fn load(&self, uri: &str, request_id: u64) -> CoreResult<()> {
        self.has_media.store(true, Ordering::SeqCst);
        self.send_command(PipelineCommand::Load {
            uri: uri.to_string(),
            request_id,
        })
    }

    pub fn play(&self) -> CoreResult<()> {
        if !self.has_media() {
            return Err(PipelineError::NoMedia.into());
        }
        self.send_command(PipelineCommand::Play)
    }

    pub fn pause(&self) -> CoreResult<()> {
        self.send_command(PipelineCommand::Pause)
    }

    /// Stop and release decode resources; `play()` needs a new `load()` afterwards
    pub fn stop(&self) -> CoreResult<()> {
        self.has_media.store(false, Ordering::SeqCst);
        self.send_command(PipelineCommand::Stop)
    }

    /// Seek within the current stream; clamped to `[0, duration]`
    pub fn seek(&self, position_s: f64) -> CoreResult<()> {
        if !self.has_media() {
            return Ok(());
        }
        match self.clock.seek(position_s) {
            Some(target) => self.send_command(PipelineCommand::Seek(target)),
            None => {
                debug!("Ignoring micro-seek to {:.2}s", position_s);
                Ok(())
            }
        }
    }

    pub fn set_volume(&self, volume: f32) -> CoreResult<()> {
        self.send_command(PipelineCommand::SetVolume(volume))
    }

    pub fn set_eq_band(&self, band: usize, gain_db: f32) -> CoreResult<()> {
        self.send_command(PipelineCommand::SetEqBand { band, gain_db })
    }

    /// Rebuild the sink for `request`; answered by `OutputApplied`/`OutputFailed`
    pub fn set_output(&self, request_id: u64, request: OutputRequest) -> CoreResult<()> {
        self.send_command(PipelineCommand::SetOutput { request_id, request })
    }

    pub fn set_alsa_latency(&self, buffer_ms: u32, latency_ms: u32) -> CoreResult<()> {
        self.send_command(PipelineCommand::SetAlsaLatency {
            buffer_ms,
            latency_ms,
        })
    }

    pub fn set_spectrum_enabled(&self, enabled: bool) -> CoreResult<()> {
        self.send_command(PipelineCommand::SetSpectrumEnabled(enabled))
    }

    /// `(position_s, duration_s)` from the decoder clock
    pub fn position(&self) -> (f64, Option<f64>) {
        self.clock.get()
    }

    pub fn has_media(&self) -> bool {
        self.has_media.load(Ordering::SeqCst)
    }

    /// Controls shared with the audio path
    pub fn stage(&self) -> &SoftwareStage {
        &self.stage
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<PipelineEvent> {
        self.event_receiver.try_recv().ok()
    }

    /// Event channel, for hosts that select over several receivers
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.event_receiver
    }

    /// Most recent spectrum frame; older frames are dropped
    pub fn latest_spectrum(&mut self) -> Option<SpectrumFrame> {
        self.drain_spectrum().last()
    }

    /// Every frame queued since the last call, oldest first
    pub fn drain_spectrum(&mut self) -> impl Iterator<Item = SpectrumFrame> + '_ {
        std::iter::from_fn(move || self.spectrum.pop().ok())
    }

    fn send_command(&self, command: PipelineCommand) -> CoreResult<()> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(CoreError::ShutDown);
        }
        self.command_sender
            .send(command)
            .map_err(|_| CoreError::ChannelSend)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let _ = self.command_sender.send(PipelineCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// State owned by the pipeline thread
struct PipelineWorker {
    backend: Box<dyn CodecBackend>,
    events: Sender<PipelineEvent>,
    clock: Arc<PositionClock>,
    has_media: Arc<AtomicBool>,
    stage: SoftwareStage,
    spectrum: Producer<SpectrumFrame>,
    frame: SpectrumFrame,
    request: OutputRequest,
    /// Explicit `SetAlsaLatency` override of the profile timings
    latency: Option<(u32, u32)>,
    source: Option<StreamFormat>,
    state: PlaybackState,
    /// Volume last asked for; not applied while bit-perfect
    volume: f32,
    spectrum_enabled: bool,
    load_timeout: Duration,
}

impl PipelineWorker {
    fn run(mut self, commands: Receiver<PipelineCommand>, shutdown: Arc<AtomicBool>) {
        info!("Pipeline thread started ({} backend)", self.backend.name());
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match commands.recv_timeout(Duration::from_millis(16)) {
                Ok(PipelineCommand::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Command channel disconnected");
                    break;
                }
            }
            self.service();
        }
        self.backend.stop();
        info!("Pipeline thread stopped");
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            self.state = state;
            self.emit(PipelineEvent::StateChanged(state));
        }
    }

    fn loaded(&self) -> bool {
        self.source.is_some()
    }

    fn handle(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Load { uri, request_id } => self.load(&uri, request_id),
            PipelineCommand::Play => {
                if !self.loaded() {
                    self.emit(PipelineEvent::error(PipelineError::NoMedia));
                    return;
                }
                match self.backend.play() {
                    Ok(()) => self.set_state(PlaybackState::Playing),
                    Err(e) => self.emit(PipelineEvent::error(e)),
                }
            }
            PipelineCommand::Pause => {
                if self.loaded() {
                    match self.backend.pause() {
                        Ok(()) => self.set_state(PlaybackState::Paused),
                        Err(e) => self.emit(PipelineEvent::error(e)),
                    }
                }
            }
            PipelineCommand::Stop => self.stop(),
            PipelineCommand::Seek(target) => {
                if let Err(e) = self.backend.seek(target) {
                    debug!("Seek to {:.2}s not possible: {}", target, e);
                }
            }
            PipelineCommand::SetVolume(volume) => {
                self.volume = volume;
                self.apply_volume();
            }
            PipelineCommand::SetEqBand { band, gain_db } => {
                if let Err(e) = self.stage.eq.set_band_gain(band, gain_db) {
                    self.emit(PipelineEvent::error(e));
                }
            }
            PipelineCommand::SetOutput { request_id, request } => {
                self.request = request;
                self.apply_volume();
                self.stage.eq.set_bypass(self.request.bit_perfect);
                self.apply_output(request_id);
            }
            PipelineCommand::SetAlsaLatency {
                buffer_ms,
                latency_ms,
            } => {
                self.latency = Some((buffer_ms, latency_ms));
                self.backend.set_latency(buffer_ms, latency_ms);
            }
            PipelineCommand::SetSpectrumEnabled(enabled) => {
                self.spectrum_enabled = enabled;
                self.stage.analyzer.set_enabled(enabled);
                if !enabled {
                    self.stage.analyzer.reset();
                }
            }
            PipelineCommand::Shutdown => {}
        }
    }

    fn apply_volume(&self) {
        let volume = if self.request.bit_perfect { 1.0 } else { self.volume };
        self.stage.volume.set(volume);
    }

    fn load(&mut self, uri: &str, request_id: u64) {
        self.backend.stop();
        self.source = None;
        self.clock.reset(None);
        self.set_state(PlaybackState::Stopped);

        match self.backend.load(uri, self.load_timeout) {
            Ok(media) => {
                info!("Loaded {} ({})", uri, media.format.describe());
                self.clock.reset(media.duration_s);
                self.source = Some(media.format.clone());
                self.emit(PipelineEvent::Loaded {
                    request_id,
                    format: media.format,
                    duration_s: media.duration_s,
                });
                self.apply_output(0);
                if self.loaded() {
                    self.set_state(PlaybackState::Paused);
                }
            }
            Err(e) => {
                warn!("Load failed for {}: {}", uri, e);
                self.has_media.store(false, Ordering::SeqCst);
                self.emit(PipelineEvent::LoadFailed {
                    request_id,
                    message: e.to_string(),
                });
            }
        }
    }

    fn stop(&mut self) {
        self.backend.stop();
        self.source = None;
        self.clock.reset(None);
        self.has_media.store(false, Ordering::SeqCst);
        self.stage.analyzer.reset();
        self.set_state(PlaybackState::Stopped);
    }

    fn plan(&self, request: &OutputRequest) -> Result<GraphPlan, PipelineError> {
        let plan = build_graph(request, self.source.as_ref(), self.spectrum_enabled)?;
        Ok(match self.latency {
            Some((buffer_ms, latency_ms)) => plan.with_latency(buffer_ms, latency_ms),
            None => plan,
        })
    }

    fn configure(&mut self, plan: &GraphPlan) -> Result<SinkFormat, PipelineError> {
        self.backend.set_latency(plan.buffer_ms, plan.latency_ms);
        let sink = self.backend.configure_output(plan, &self.stage)?;
        plan.check_exact(self.source.as_ref(), &sink)?;
        Ok(sink)
    }

    /// Rebuild the sink for the current request and report the outcome
    fn apply_output(&mut self, request_id: u64) {
        let plan = match self.plan(&self.request) {
            Ok(plan) => plan,
            Err(e) => {
                self.emit(PipelineEvent::OutputFailed {
                    request_id,
                    message: e.to_string(),
                });
                return;
            }
        };

        if !self.loaded() {
            debug!("No media loaded; output {} ready when idle", plan.driver);
            self.emit(PipelineEvent::OutputApplied {
                request_id,
                sink: SinkFormat::default(),
                elements: plan.names(),
                fallback: None,
            });
            return;
        }

        let mut applied = plan;
        let mut fallback = None;
        let result = match self.configure(&applied) {
            Err(mismatch @ PipelineError::FormatMismatch { .. }) => {
                warn!("Exact format not available: {}", mismatch);
                let shared = OutputRequest {
                    bit_perfect: false,
                    exclusive: false,
                    ..self.request.clone()
                };
                fallback = Some("rate/depth mismatch".to_string());
                match self.plan(&shared) {
                    Ok(plan) => {
                        applied = plan;
                        self.configure(&applied)
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        match result {
            Ok(sink) => {
                if self.state == PlaybackState::Playing {
                    if let Err(e) = self.backend.play() {
                        self.emit(PipelineEvent::error(e));
                    }
                }
                info!(
                    "Output applied on {}: {}Hz/{}-bit [{}]",
                    applied.driver,
                    sink.rate,
                    sink.depth,
                    applied.names().join(" -> ")
                );
                self.emit(PipelineEvent::OutputApplied {
                    request_id,
                    sink,
                    elements: applied.names(),
                    fallback,
                });
                self.emit(PipelineEvent::SyncOffset {
                    learned_ms: sanitize_sync_offset(i64::from(applied.buffer_ms)),
                });
            }
            Err(e) => {
                warn!("Output configuration failed: {}", e);
                self.emit(PipelineEvent::OutputFailed {
                    request_id,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Per-iteration housekeeping: bus messages, clock and spectrum
    fn service(&mut self) {
        self.backend.service();

        while let Some(event) = self.backend.poll_event() {
            match event {
                BackendEvent::Eos => {
                    self.set_state(PlaybackState::Paused);
                    self.emit(PipelineEvent::Eos);
                }
                BackendEvent::Error(message) => self.emit(PipelineEvent::Error { message }),
                BackendEvent::Tag(update) => {
                    if let Some(source) = self.source.as_mut() {
                        source.merge(&update);
                        let merged = source.clone();
                        self.emit(PipelineEvent::Tag(merged));
                    }
                }
            }
        }

        if let Some(position) = self.backend.position() {
            self.clock.observe(position);
        }

        if self.spectrum_enabled && self.state == PlaybackState::Playing && self.stage.analyzer.update() {
            let (position, _) = self.clock.get();
            self.stage.analyzer.copy_into(&mut self.frame, Some(position));
            // Renderer only wants the latest frame
            let _ = self.spectrum.push(self.frame.clone());
        }
    }
}
