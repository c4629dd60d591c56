//! FFT Spectrum Analyzer
//!
//! Produces the dB frames consumed by [`crate::SpectrumProcessor`]. The audio
//! path pushes samples; the pipeline thread polls [`SpectrumAnalyzer::update`]
//! at the analysis rate and copies the result into a [`SpectrumFrame`].
//!
//! # Architecture
//!
//! ```text
//! audio callback                      pipeline thread
//! ──────────────                      ───────────────
//! push_sample() ─► ring (atomics) ─►  update(): window ─► FFT ─► dB bins
//! ```
//!
//! Samples are stored as `AtomicU32` bit patterns so the writer never takes
//! a lock. A torn read across a wrap only smears one analysis window.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::spectrum::SpectrumFrame;

/// FFT size (must be power of 2)
/// 2048 samples at 48kHz = ~42ms window, ~23Hz resolution
pub const FFT_SIZE: usize = 2048;

/// Number of dB bins per frame (linear frequency, DC to Nyquist)
pub const NUM_BINS: usize = 512;

/// Floor for silent bins
pub const DB_FLOOR: f32 = -120.0;

/// Hann window coefficient
fn hann_window(n: usize, size: usize) -> f32 {
    0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (size - 1) as f32).cos())
}

/// Pre-computed Hann window lookup table
struct HannWindow {
    coeffs: Box<[f32; FFT_SIZE]>,
}

impl HannWindow {
    fn new() -> Self {
        let coeffs = Box::new(core::array::from_fn(|i| hann_window(i, FFT_SIZE)));
        Self { coeffs }
    }

    #[inline]
    fn apply(&self, sample: f32, index: usize) -> f32 {
        sample * self.coeffs[index]
    }
}

struct Scratch {
    buffer: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
}

/// Spectrum analyzer that computes a dB magnitude spectrum
///
/// Thread-safe design:
/// - Audio thread writes samples via `push_sample()`
/// - Pipeline thread computes frames via `update()` and reads `copy_into()`
pub struct SpectrumAnalyzer {
    /// Ring buffer for incoming samples (mono, mixed from stereo)
    samples: Box<[AtomicU32]>,
    write_pos: AtomicU32,
    samples_since_fft: AtomicU32,
    /// Samples needed before computing next FFT
    samples_per_fft: AtomicU32,
    spectrum_ready: AtomicBool,
    enabled: AtomicBool,
    /// Output spectrum in dB
    spectrum: RwLock<Box<[f32; NUM_BINS]>>,
    window: HannWindow,
    fft: Arc<dyn Fft<f32>>,
    scratch: Mutex<Scratch>,
}

impl SpectrumAnalyzer {
    /// Create a new spectrum analyzer
    ///
    /// # Arguments
    /// * `sample_rate` - Audio sample rate in Hz
    /// * `fps` - Target analysis rate (frames per second)
    pub fn new(sample_rate: f32, fps: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            samples: (0..FFT_SIZE).map(|_| AtomicU32::new(0)).collect(),
            write_pos: AtomicU32::new(0),
            samples_since_fft: AtomicU32::new(0),
            samples_per_fft: AtomicU32::new(Self::interval(sample_rate, fps)),
            spectrum_ready: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            spectrum: RwLock::new(Box::new([DB_FLOOR; NUM_BINS])),
            window: HannWindow::new(),
            fft,
            scratch: Mutex::new(Scratch {
                buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
                fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            }),
        }
    }

    fn interval(sample_rate: f32, fps: u32) -> u32 {
        (sample_rate.max(1.0) / fps.max(1) as f32).max(1.0) as u32
    }

    /// Retune for a new stream rate
    pub fn set_sample_rate(&self, sample_rate: f32, fps: u32) {
        self.samples_per_fft
            .store(Self::interval(sample_rate, fps), Ordering::Relaxed);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.spectrum_ready.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Push a stereo sample pair to the analyzer
    ///
    /// # Real-time Safety
    /// No allocations, no locks, O(1).
    #[inline]
    pub fn push_sample(&self, left: f32, right: f32) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mono = (left + right) * 0.5;

        let pos = self.write_pos.load(Ordering::Relaxed) as usize % FFT_SIZE;
        self.samples[pos].store(mono.to_bits(), Ordering::Relaxed);
        self.write_pos
            .store(((pos + 1) % FFT_SIZE) as u32, Ordering::Relaxed);

        // Counter is reset by update(), not here, so a frame is never dropped
        let count = self.samples_since_fft.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.samples_per_fft.load(Ordering::Relaxed) {
            self.spectrum_ready.store(true, Ordering::Release);
        }
    }

    /// Push an interleaved buffer of `channels` channels
    #[inline]
    pub fn push_interleaved(&self, buffer: &[f32], channels: usize) {
        match channels {
            0 => {}
            1 => buffer.iter().for_each(|&s| self.push_sample(s, s)),
            n => buffer
                .chunks_exact(n)
                .for_each(|frame| self.push_sample(frame[0], frame[1])),
        }
    }

    /// Compute a new spectrum if enough samples arrived
    ///
    /// Returns true if the spectrum was updated.
    pub fn update(&self) -> bool {
        if !self.spectrum_ready.swap(false, Ordering::Acquire) {
            return false;
        }
        self.samples_since_fft.store(0, Ordering::Relaxed);

        let mut scratch = self.scratch.lock();
        let Scratch {
            buffer,
            fft_scratch,
        } = &mut *scratch;

        let read_pos = self.write_pos.load(Ordering::Relaxed) as usize;
        for (i, slot) in buffer.iter_mut().enumerate() {
            // Oldest sample first
            let idx = (read_pos + i) % FFT_SIZE;
            let sample = f32::from_bits(self.samples[idx].load(Ordering::Relaxed));
            *slot = Complex::new(self.window.apply(sample, i), 0.0);
        }
        self.fft.process_with_scratch(buffer, fft_scratch);

        let mut spectrum = self.spectrum.write();
        compute_db_spectrum(buffer, &mut spectrum[..]);
        true
    }

    /// Copy the latest spectrum into `frame`
    pub fn copy_into(&self, frame: &mut SpectrumFrame, position_s: Option<f64>) {
        let spectrum = self.spectrum.read();
        frame.fill(&spectrum[..], position_s);
    }

    pub fn spectrum(&self) -> Vec<f32> {
        self.spectrum.read().to_vec()
    }

    /// Reset the analyzer state
    pub fn reset(&self) {
        for s in self.samples.iter() {
            s.store(0, Ordering::Relaxed);
        }
        self.write_pos.store(0, Ordering::Relaxed);
        self.samples_since_fft.store(0, Ordering::Relaxed);
        self.spectrum_ready.store(false, Ordering::Relaxed);
        self.spectrum.write().fill(DB_FLOOR);
    }
}

/// Convert FFT output to `NUM_BINS` linear-frequency dB bins
///
/// Adjacent FFT bins are averaged pairwise (1024 positive bins -> 512).
/// 0 dB corresponds to a full-scale sine.
fn compute_db_spectrum(fft_output: &[Complex<f32>], out: &mut [f32]) {
    let nyquist = FFT_SIZE / 2;
    let per_bin = nyquist / out.len().max(1);
    // Hann window halves the coherent gain; a full-scale sine peaks at N/4
    let reference = FFT_SIZE as f32 / 4.0;

    for (i, dst) in out.iter_mut().enumerate() {
        let start = i * per_bin;
        let end = (start + per_bin).min(nyquist);
        let mag = fft_output[start..end]
            .iter()
            .map(|c| c.norm())
            .fold(0.0_f32, f32::max);
        let db = 20.0 * (mag / reference).max(1e-10).log10();
        *dst = db.max(DB_FLOOR);
    }
}
