//! Codec Backend Seam
//!
//! The pipeline thread drives exactly one [`CodecBackend`]. Backends are
//! constructed on that thread through a [`BackendFactory`], so they may
//! hold thread-bound handles such as audio streams.
//!
//! [`SimulatedBackend`] is a scriptable stand-in used by the scenario
//! tests and by the console host's `--simulate` mode. It synthesizes a test
//! tone through the software stage so the spectrum path runs end to end.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hiresti_dsp::ProcessorChain;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{SinkFormat, StreamFormat};
use crate::pipeline::graph::{GraphPlan, SoftwareStage};

/// Media opened by [`CodecBackend::load`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMedia {
    pub format: StreamFormat,
    pub duration_s: Option<f64>,
}

/// Bus messages from the backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Eos,
    Error(String),
    Tag(StreamFormat),
}

/// Decoder graph owner
pub trait CodecBackend {
    fn name(&self) -> &'static str;

    /// Open `uri` and probe its format; output is not touched
    fn load(&mut self, uri: &str, timeout: Duration) -> PipelineResult<LoadedMedia>;

    /// (Re)build the sink for `plan`; returns the format the sink accepted
    fn configure_output(&mut self, plan: &GraphPlan, stage: &SoftwareStage) -> PipelineResult<SinkFormat>;

    fn play(&mut self) -> PipelineResult<()>;

    fn pause(&mut self) -> PipelineResult<()>;

    /// Release decode resources
    fn stop(&mut self);

    fn seek(&mut self, position_s: f64) -> PipelineResult<()>;

    /// Decoder clock in seconds
    fn position(&self) -> Option<f64>;

    fn set_latency(&mut self, buffer_ms: u32, latency_ms: u32);

    fn poll_event(&mut self) -> Option<BackendEvent>;

    /// Called once per pipeline loop iteration
    fn service(&mut self) {}
}

/// Builds the backend on the pipeline thread
pub type BackendFactory = Box<dyn FnOnce() -> Box<dyn CodecBackend> + Send>;

#[derive(Default)]
struct SimState {
    media: HashMap<String, LoadedMedia>,
    sink_format: Option<SinkFormat>,
    output_failure: Option<String>,
    latency_calls: Vec<(u32, u32)>,
    plans: Vec<GraphPlan>,
    pending: VecDeque<BackendEvent>,
    tone_hz: f32,
}

/// Script and observe a [`SimulatedBackend`] from another thread
#[derive(Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn new() -> Self {
        let handle = Self::default();
        handle.0.lock().tone_hz = 440.0;
        handle
    }

    pub fn add_media(&self, uri: &str, format: StreamFormat, duration_s: f64) {
        self.0.lock().media.insert(
            uri.to_string(),
            LoadedMedia {
                format,
                duration_s: Some(duration_s),
            },
        );
    }

    /// Format the sink acquires; `None` mirrors the plan's target
    pub fn set_sink_format(&self, format: Option<SinkFormat>) {
        self.0.lock().sink_format = format;
    }

    /// Make the next sink acquisitions fail with `message`
    pub fn fail_output(&self, message: Option<&str>) {
        self.0.lock().output_failure = message.map(str::to_string);
    }

    /// Queue a bus error as if raised by a decoder or sink element
    pub fn inject_error(&self, message: &str) {
        self.0
            .lock()
            .pending
            .push_back(BackendEvent::Error(message.to_string()));
    }

    pub fn inject_tag(&self, format: StreamFormat) {
        self.0.lock().pending.push_back(BackendEvent::Tag(format));
    }

    pub fn finish(&self) {
        self.0.lock().pending.push_back(BackendEvent::Eos);
    }

    pub fn latency_calls(&self) -> Vec<(u32, u32)> {
        self.0.lock().latency_calls.clone()
    }

    pub fn plans(&self) -> Vec<GraphPlan> {
        self.0.lock().plans.clone()
    }

    pub fn last_plan(&self) -> Option<GraphPlan> {
        self.0.lock().plans.last().cloned()
    }
}

const SIM_EXTENSIONS: [&str; 6] = ["flac", "wav", "m4a", "mp4", "mp3", "aiff"];

/// Scriptable backend; see [`SimHandle`]
pub struct SimulatedBackend {
    handle: SimHandle,
    media: Option<LoadedMedia>,
    chain: Option<ProcessorChain>,
    sink: Option<SinkFormat>,
    playing: bool,
    base_s: f64,
    started: Option<Instant>,
    last_service: Instant,
    phase: f32,
    scratch: Vec<f32>,
}

impl SimulatedBackend {
    pub fn new(handle: SimHandle) -> Self {
        Self {
            handle,
            media: None,
            chain: None,
            sink: None,
            playing: false,
            base_s: 0.0,
            started: None,
            last_service: Instant::now(),
            phase: 0.0,
            scratch: vec![0.0; 8192],
        }
    }

    pub fn factory(handle: SimHandle) -> BackendFactory {
        Box::new(move || Box::new(SimulatedBackend::new(handle)) as Box<dyn CodecBackend>)
    }

    fn duration(&self) -> Option<f64> {
        self.media.as_ref().and_then(|m| m.duration_s)
    }

    fn clock(&self) -> f64 {
        let running = self.started.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0);
        let pos = self.base_s + running;
        self.duration().map(|d| pos.min(d)).unwrap_or(pos)
    }

    /// Run a few milliseconds of tone through the software stage
    fn synthesize(&mut self) {
        let (Some(chain), Some(sink)) = (self.chain.as_mut(), self.sink) else {
            return;
        };
        let elapsed = self.last_service.elapsed().as_secs_f64();
        let frames = ((elapsed * f64::from(sink.rate)) as usize).min(self.scratch.len() / 2);
        if frames == 0 {
            return;
        }
        let tone = self.handle.0.lock().tone_hz;
        let step = 2.0 * std::f32::consts::PI * tone / sink.rate.max(1) as f32;
        let buffer = &mut self.scratch[..frames * 2];
        for frame in buffer.chunks_exact_mut(2) {
            let s = self.phase.sin() * 0.5;
            frame[0] = s;
            frame[1] = s;
            self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
        }
        chain.process(buffer);
    }
}

impl CodecBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn load(&mut self, uri: &str, _timeout: Duration) -> PipelineResult<LoadedMedia> {
        self.stop();
        let registered = self.handle.0.lock().media.get(uri).cloned();
        let media = match registered {
            Some(media) => media,
            None => {
                let path = uri.split(['?', '#']).next().unwrap_or(uri);
                let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
                if !SIM_EXTENSIONS.contains(&ext.as_str()) {
                    return Err(PipelineError::Load {
                        uri: uri.to_string(),
                        message: "no demuxer for this stream".to_string(),
                    });
                }
                LoadedMedia {
                    format: StreamFormat::new(44100, 16, &ext),
                    duration_s: Some(180.0),
                }
            }
        };
        self.media = Some(media.clone());
        self.base_s = 0.0;
        Ok(media)
    }

    fn configure_output(&mut self, plan: &GraphPlan, stage: &SoftwareStage) -> PipelineResult<SinkFormat> {
        let (failure, forced) = {
            let mut state = self.handle.0.lock();
            state.plans.push(plan.clone());
            (state.output_failure.clone(), state.sink_format)
        };
        if let Some(message) = failure {
            self.chain = None;
            self.sink = None;
            return Err(PipelineError::Output(message));
        }
        let sink = forced.unwrap_or_else(|| match plan.target {
            Some((rate, depth)) => SinkFormat {
                rate,
                depth,
                channels: 2,
            },
            None => SinkFormat {
                rate: 48000,
                depth: 24,
                channels: 2,
            },
        });
        self.chain = Some(stage.build_chain(plan, sink.rate as f32, 2, 1024));
        self.sink = Some(sink);
        Ok(sink)
    }

    fn play(&mut self) -> PipelineResult<()> {
        if self.media.is_none() {
            return Err(PipelineError::NoMedia);
        }
        if !self.playing {
            self.playing = true;
            self.started = Some(Instant::now());
            self.last_service = Instant::now();
        }
        Ok(())
    }

    fn pause(&mut self) -> PipelineResult<()> {
        if self.playing {
            self.base_s = self.clock();
            self.started = None;
            self.playing = false;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.playing = false;
        self.started = None;
        self.base_s = 0.0;
        self.media = None;
    }

    fn seek(&mut self, position_s: f64) -> PipelineResult<()> {
        if self.media.is_none() {
            return Err(PipelineError::NoMedia);
        }
        self.base_s = position_s;
        if self.playing {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn position(&self) -> Option<f64> {
        self.media.as_ref().map(|_| self.clock())
    }

    fn set_latency(&mut self, buffer_ms: u32, latency_ms: u32) {
        self.handle
            .0
            .lock()
            .latency_calls
            .push((buffer_ms, latency_ms));
    }

    fn poll_event(&mut self) -> Option<BackendEvent> {
        if let Some(event) = self.handle.0.lock().pending.pop_front() {
            return Some(event);
        }
        if self.playing {
            if let Some(duration) = self.duration() {
                if self.clock() >= duration {
                    self.pause().ok();
                    return Some(BackendEvent::Eos);
                }
            }
        }
        None
    }

    fn service(&mut self) {
        if self.playing {
            self.synthesize();
        }
        self.last_service = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use hiresti_dsp::SpectrumAnalyzer;
    use hiresti_platform::Driver;

    use super::*;
    use crate::model::OutputRequest;
    use crate::pipeline::graph::build_graph;

    fn stage() -> SoftwareStage {
        SoftwareStage::new(Arc::new(SpectrumAnalyzer::new(48000.0, 30)), 30)
    }

    #[test]
    fn test_unknown_uri_fails_to_load() {
        let mut backend = SimulatedBackend::new(SimHandle::new());
        let err = backend.load("https://example.com/stream", Duration::from_secs(1));
        assert!(matches!(err, Err(PipelineError::Load { .. })));
        assert!(matches!(backend.play(), Err(PipelineError::NoMedia)));
    }

    #[test]
    fn test_sink_mirrors_target() {
        let handle = SimHandle::new();
        handle.add_media("a.flac", StreamFormat::new(96000, 24, "FLAC"), 10.0);
        let mut backend = SimulatedBackend::new(handle.clone());
        let media = backend.load("a.flac", Duration::from_secs(1)).unwrap();
        let request = OutputRequest {
            driver: Driver::Alsa,
            bit_perfect: true,
            exclusive: true,
            ..Default::default()
        };
        let plan = build_graph(&request, Some(&media.format), true).unwrap();
        let sink = backend.configure_output(&plan, &stage()).unwrap();
        assert_eq!((sink.rate, sink.depth), (96000, 24));
        assert_eq!(handle.plans().len(), 1);

        handle.fail_output(Some("Device or resource busy"));
        assert!(backend.configure_output(&plan, &stage()).is_err());
    }

    #[test]
    fn test_position_and_eos() {
        let handle = SimHandle::new();
        handle.add_media("short.flac", StreamFormat::new(44100, 16, "FLAC"), 0.05);
        let mut backend = SimulatedBackend::new(handle);
        backend.load("short.flac", Duration::from_secs(1)).unwrap();
        backend.play().unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(backend.poll_event(), Some(BackendEvent::Eos));
        assert!(backend.position().unwrap() <= 0.05);
        backend.seek(0.01).unwrap();
        assert!((backend.position().unwrap() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_synthesized_tone_reaches_analyzer() {
        let handle = SimHandle::new();
        let mut backend = SimulatedBackend::new(handle);
        backend.load("tone.wav", Duration::from_secs(1)).unwrap();
        let st = stage();
        let plan = build_graph(&OutputRequest::default(), None, true).unwrap();
        backend.configure_output(&plan, &st).unwrap();
        backend.play().unwrap();
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(10));
            backend.service();
        }
        assert!(st.analyzer.update());
    }
}
