//! Audio Processor Trait
//!
//! Defines the interface for the chainable stages of the software path:
//! `volume -> eq -> spectrum_tap`. Bit-perfect output builds no chain at all.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::eq::Equalizer;
use crate::fft::SpectrumAnalyzer;

/// Context passed to processors containing stream metadata
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    pub sample_rate: f32,
    pub channels: usize,
    pub buffer_size: usize,
}

impl ProcessContext {
    pub fn new(sample_rate: f32, channels: usize, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            channels,
            buffer_size,
        }
    }
}

/// Trait for audio processors in the DSP chain
///
/// # Real-time Safety Contract
///
/// Implementors MUST follow these rules in `process()`:
/// - NO heap allocations (no Vec::push, no Box::new, no String)
/// - NO syscalls (no file I/O, no network, no mutex locks)
/// - Constant or O(n) time complexity where n = buffer size
pub trait AudioProcessor: Send {
    /// Process audio buffer in-place
    ///
    /// Buffer format is interleaved: [L0, R0, L1, R1, ...]
    fn process(&mut self, buffer: &mut [f32], context: &ProcessContext);

    /// Reset internal state (delay lines, envelopes, etc.)
    fn reset(&mut self);

    /// Human-readable name for diagnostics
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// A chain of processors applied sequentially
pub struct ProcessorChain {
    processors: Vec<Box<dyn AudioProcessor>>,
    context: ProcessContext,
}

impl ProcessorChain {
    pub fn new(sample_rate: f32, channels: usize, buffer_size: usize) -> Self {
        Self {
            processors: Vec::new(),
            context: ProcessContext::new(sample_rate, channels, buffer_size),
        }
    }

    /// Add a processor to the end of the chain
    ///
    /// Note: This allocates. Only call during setup, not in audio callback.
    pub fn add<P: AudioProcessor + 'static>(&mut self, processor: P) {
        self.processors.push(Box::new(processor));
    }

    /// Process buffer through all enabled processors
    #[inline]
    pub fn process(&mut self, buffer: &mut [f32]) {
        for processor in &mut self.processors {
            if processor.is_enabled() {
                processor.process(buffer, &self.context);
            }
        }
    }

    pub fn reset(&mut self) {
        for processor in &mut self.processors {
            processor.reset();
        }
    }

    pub fn set_context(&mut self, context: ProcessContext) {
        self.context = context;
    }

    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    /// Stage names in order, for the signal-path view
    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Shared linear gain, written by the control thread and read per buffer
#[derive(Debug, Clone)]
pub struct VolumeControl(Arc<AtomicU32>);

impl Default for VolumeControl {
    fn default() -> Self {
        Self(Arc::new(AtomicU32::new(1.0f32.to_bits())))
    }
}

impl VolumeControl {
    /// Set gain, clamped to 0..=1
    pub fn set(&self, volume: f32) {
        let v = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Software volume stage
pub struct VolumeStage {
    control: VolumeControl,
}

impl VolumeStage {
    pub fn new(control: VolumeControl) -> Self {
        Self { control }
    }
}

impl AudioProcessor for VolumeStage {
    fn process(&mut self, buffer: &mut [f32], _context: &ProcessContext) {
        let gain = self.control.get();
        if gain == 1.0 {
            return;
        }
        for sample in buffer.iter_mut() {
            *sample *= gain;
        }
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "volume"
    }
}

impl AudioProcessor for Equalizer {
    fn process(&mut self, buffer: &mut [f32], context: &ProcessContext) {
        if context.channels == 2 {
            self.process_interleaved(buffer);
        }
    }

    fn reset(&mut self) {
        Equalizer::reset(self);
    }

    fn name(&self) -> &'static str {
        "equalizer-10bands"
    }

    fn is_enabled(&self) -> bool {
        !self.config().bypass
    }
}

/// Feeds the analyzer without touching the buffer
pub struct SpectrumTap {
    analyzer: Arc<SpectrumAnalyzer>,
}

impl SpectrumTap {
    pub fn new(analyzer: Arc<SpectrumAnalyzer>) -> Self {
        Self { analyzer }
    }
}

impl AudioProcessor for SpectrumTap {
    fn process(&mut self, buffer: &mut [f32], context: &ProcessContext) {
        self.analyzer.push_interleaved(buffer, context.channels);
    }

    fn reset(&mut self) {
        self.analyzer.reset();
    }

    fn name(&self) -> &'static str {
        "spectrum"
    }

    fn is_enabled(&self) -> bool {
        self.analyzer.is_enabled()
    }
}
