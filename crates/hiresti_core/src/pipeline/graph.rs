//! Graph Construction
//!
//! A [`GraphPlan`] is the ordered element list for one output request:
//!
//! ```text
//! shared:      source → decoder → convert → volume → eq → spectrum → resampler → sink
//! bit-perfect: source → decoder → convert(passthrough) → [spectrum] → sink
//! ```
//!
//! The spectrum tap only reads samples, so it stays available under
//! bit-perfect output. The [`SoftwareStage`] turns a plan into the
//! [`ProcessorChain`] the backend runs per buffer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hiresti_dsp::{
    AudioProcessor, DspResult, EqConfig, Equalizer, ProcessContext, ProcessorChain,
    SpectrumAnalyzer, SpectrumTap, VolumeControl, VolumeStage,
};
use hiresti_platform::Driver;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{OutputRequest, SinkFormat, StreamFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphElement {
    Source,
    Decoder,
    FormatConverter { passthrough: bool },
    Volume,
    Equalizer,
    SpectrumTap,
    Resampler,
    Sink(Driver),
}

impl fmt::Display for GraphElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphElement::Source => f.write_str("source"),
            GraphElement::Decoder => f.write_str("decoder"),
            GraphElement::FormatConverter { passthrough: true } => {
                f.write_str("format-converter (passthrough)")
            }
            GraphElement::FormatConverter { passthrough: false } => f.write_str("format-converter"),
            GraphElement::Volume => f.write_str("volume"),
            GraphElement::Equalizer => f.write_str("equalizer-10bands"),
            GraphElement::SpectrumTap => f.write_str("spectrum"),
            GraphElement::Resampler => f.write_str("resampler"),
            GraphElement::Sink(driver) => write!(f, "sink ({})", driver),
        }
    }
}

/// Element list and sink parameters for one output request
#[derive(Debug, Clone, PartialEq)]
pub struct GraphPlan {
    pub elements: Vec<GraphElement>,
    pub driver: Driver,
    pub device_id: Option<String>,
    pub device_name: String,
    pub bit_perfect: bool,
    pub exclusive: bool,
    pub buffer_ms: u32,
    pub latency_ms: u32,
    /// `(rate, depth)` the sink must run at, when the source is known
    pub target: Option<(u32, u16)>,
}

impl GraphPlan {
    pub fn contains(&self, element: GraphElement) -> bool {
        self.elements.contains(&element)
    }

    pub fn names(&self) -> Vec<String> {
        self.elements.iter().map(ToString::to_string).collect()
    }

    /// Whether the plan modifies samples in software
    pub fn has_software_stage(&self) -> bool {
        self.contains(GraphElement::Volume) || self.contains(GraphElement::Equalizer)
    }

    pub fn with_latency(mut self, buffer_ms: u32, latency_ms: u32) -> Self {
        self.buffer_ms = buffer_ms;
        self.latency_ms = latency_ms;
        self
    }

    /// Exclusive output must run at the source format exactly
    pub fn check_exact(&self, source: Option<&StreamFormat>, sink: &SinkFormat) -> PipelineResult<()> {
        let Some(source) = source.filter(|s| s.is_known()) else {
            return Ok(());
        };
        if !self.exclusive || sink.matches(source) {
            return Ok(());
        }
        Err(PipelineError::FormatMismatch {
            source_rate: source.rate,
            source_depth: source.effective_depth(),
            sink_rate: sink.rate,
            sink_depth: sink.depth,
        })
    }
}

/// Plan the graph for `request`
pub fn build_graph(
    request: &OutputRequest,
    source: Option<&StreamFormat>,
    spectrum: bool,
) -> PipelineResult<GraphPlan> {
    if request.exclusive && request.driver != Driver::Alsa {
        return Err(PipelineError::ExclusiveRequiresAlsa);
    }

    let mut elements = vec![GraphElement::Source, GraphElement::Decoder];
    if request.bit_perfect {
        elements.push(GraphElement::FormatConverter { passthrough: true });
        if spectrum {
            elements.push(GraphElement::SpectrumTap);
        }
    } else {
        elements.push(GraphElement::FormatConverter { passthrough: false });
        elements.push(GraphElement::Volume);
        elements.push(GraphElement::Equalizer);
        if spectrum {
            elements.push(GraphElement::SpectrumTap);
        }
        elements.push(GraphElement::Resampler);
    }
    elements.push(GraphElement::Sink(request.driver));

    let (buffer_ms, latency_ms) = request.latency.timings();
    let target = source
        .filter(|s| s.is_known() && request.bit_perfect)
        .map(|s| (s.rate, s.effective_depth()));

    Ok(GraphPlan {
        elements,
        driver: request.driver,
        device_id: request.device_id.clone(),
        device_name: request.device_name.clone(),
        bit_perfect: request.bit_perfect,
        exclusive: request.exclusive,
        buffer_ms,
        latency_ms,
        target,
    })
}

/// Equalizer settings shared between the pipeline thread and the audio path
#[derive(Clone, Default)]
pub struct EqControl {
    inner: Arc<EqShared>,
}

#[derive(Default)]
struct EqShared {
    config: Mutex<EqConfig>,
    version: AtomicU64,
}

impl EqControl {
    pub fn set_band_gain(&self, band: usize, gain_db: f32) -> DspResult<()> {
        self.inner.config.lock().set_band_gain(band, gain_db)?;
        self.inner.version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.inner.config.lock().bypass = bypass;
        self.inner.version.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> EqConfig {
        self.inner.config.lock().clone()
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }
}

/// Equalizer that picks up [`EqControl`] changes between buffers
struct SharedEqualizer {
    eq: Equalizer,
    control: EqControl,
    seen: u64,
}

impl SharedEqualizer {
    fn new(control: EqControl, sample_rate: f32) -> Self {
        let mut eq = Equalizer::new(sample_rate);
        // A failed retune keeps the flat response
        let _ = eq.update_config(control.snapshot());
        let seen = control.version();
        Self { eq, control, seen }
    }
}

impl AudioProcessor for SharedEqualizer {
    fn process(&mut self, buffer: &mut [f32], context: &ProcessContext) {
        let version = self.control.version();
        if version != self.seen {
            // Never wait on the control thread here; retry next buffer
            if let Some(config) = self.control.inner.config.try_lock() {
                let _ = self.eq.update_config(config.clone());
                self.seen = version;
            }
        }
        AudioProcessor::process(&mut self.eq, buffer, context);
    }

    fn reset(&mut self) {
        self.eq.reset();
    }

    fn name(&self) -> &'static str {
        "equalizer-10bands"
    }

    fn is_enabled(&self) -> bool {
        AudioProcessor::is_enabled(&self.eq) || self.control.version() != self.seen
    }
}

/// Controls that survive graph rebuilds
#[derive(Clone)]
pub struct SoftwareStage {
    pub volume: VolumeControl,
    pub eq: EqControl,
    pub analyzer: Arc<SpectrumAnalyzer>,
    /// Analysis frames per second
    pub spectrum_fps: u32,
}

impl SoftwareStage {
    pub fn new(analyzer: Arc<SpectrumAnalyzer>, spectrum_fps: u32) -> Self {
        Self {
            volume: VolumeControl::default(),
            eq: EqControl::default(),
            analyzer,
            spectrum_fps,
        }
    }

    /// Processor chain for `plan` at the sink's rate
    pub fn build_chain(
        &self,
        plan: &GraphPlan,
        sample_rate: f32,
        channels: usize,
        buffer_size: usize,
    ) -> ProcessorChain {
        let mut chain = ProcessorChain::new(sample_rate, channels, buffer_size);
        for element in &plan.elements {
            match element {
                GraphElement::Volume => chain.add(VolumeStage::new(self.volume.clone())),
                GraphElement::Equalizer => {
                    chain.add(SharedEqualizer::new(self.eq.clone(), sample_rate))
                }
                GraphElement::SpectrumTap => chain.add(SpectrumTap::new(Arc::clone(&self.analyzer))),
                _ => {}
            }
        }
        self.analyzer.set_sample_rate(sample_rate, self.spectrum_fps);
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatencyProfile;

    fn request(driver: Driver, bit_perfect: bool, exclusive: bool) -> OutputRequest {
        OutputRequest {
            driver,
            device_id: Some("hw:1,0".into()),
            device_name: "USB DAC".into(),
            bit_perfect,
            exclusive,
            latency: LatencyProfile::LowLatency,
        }
    }

    #[test]
    fn test_bit_perfect_exclusive_has_no_software_stage() {
        let source = StreamFormat::new(96000, 24, "FLAC");
        let plan = build_graph(&request(Driver::Alsa, true, true), Some(&source), true).unwrap();
        assert!(!plan.has_software_stage());
        assert!(!plan.contains(GraphElement::Resampler));
        assert!(plan.contains(GraphElement::FormatConverter { passthrough: true }));
        assert_eq!(plan.target, Some((96000, 24)));
        assert_eq!((plan.buffer_ms, plan.latency_ms), (40, 4));
        assert_eq!(plan.names().last().unwrap(), "sink (ALSA)");
    }

    #[test]
    fn test_shared_path_elements() {
        let plan = build_graph(&request(Driver::PipeWire, false, false), None, false).unwrap();
        assert_eq!(
            plan.names(),
            vec![
                "source",
                "decoder",
                "format-converter",
                "volume",
                "equalizer-10bands",
                "resampler",
                "sink (PipeWire)"
            ]
        );
        assert_eq!(plan.target, None);
    }

    #[test]
    fn test_exclusive_requires_alsa() {
        let err = build_graph(&request(Driver::PipeWire, true, true), None, true).unwrap_err();
        assert_eq!(err, PipelineError::ExclusiveRequiresAlsa);
    }

    #[test]
    fn test_check_exact() {
        let source = StreamFormat::new(192000, 24, "FLAC");
        let plan = build_graph(&request(Driver::Alsa, true, true), Some(&source), false).unwrap();
        let sink = SinkFormat {
            rate: 96000,
            depth: 24,
            channels: 2,
        };
        assert!(matches!(
            plan.check_exact(Some(&source), &sink),
            Err(PipelineError::FormatMismatch { source_rate: 192000, .. })
        ));
        assert!(plan.check_exact(None, &sink).is_ok());
    }

    #[test]
    fn test_chain_follows_plan() {
        let stage = SoftwareStage::new(Arc::new(SpectrumAnalyzer::new(48000.0, 30)), 30);
        let shared = build_graph(&request(Driver::Alsa, false, false), None, true).unwrap();
        let chain = stage.build_chain(&shared, 48000.0, 2, 512);
        assert_eq!(chain.names(), vec!["volume", "equalizer-10bands", "spectrum"]);

        let exact = build_graph(&request(Driver::Alsa, true, true), None, true).unwrap();
        let chain = stage.build_chain(&exact, 48000.0, 2, 512);
        assert_eq!(chain.names(), vec!["spectrum"]);
    }

    #[test]
    fn test_eq_control_reaches_audio_path() {
        let stage = SoftwareStage::new(Arc::new(SpectrumAnalyzer::new(48000.0, 30)), 30);
        let plan = build_graph(&request(Driver::Alsa, false, false), None, false).unwrap();
        let mut chain = stage.build_chain(&plan, 48000.0, 2, 512);

        stage.eq.set_band_gain(5, 12.0).unwrap();
        let mut peak = 0.0_f32;
        let mut buffer = vec![0.0_f32; 960];
        for block in 0..10 {
            for (i, frame) in buffer.chunks_exact_mut(2).enumerate() {
                let t = (block * 480 + i) as f32 / 48000.0;
                let s = (2.0 * std::f32::consts::PI * 947.0 * t).sin() * 0.25;
                frame[0] = s;
                frame[1] = s;
            }
            chain.process(&mut buffer);
            peak = buffer.iter().fold(peak, |m, v| m.max(v.abs()));
        }
        assert!(peak > 0.5, "boost applied: {}", peak);
        assert_eq!(stage.eq.snapshot().bands[5].gain_db, 12.0);
    }
}
