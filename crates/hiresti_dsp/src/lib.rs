//! HiresTI DSP - Spectrum and Software-Stage Processing
//!
//! This crate provides:
//! - dB normalization and logarithmic bar binning
//! - Per-bar animation (current / trail / peak-hold) with motion profiles
//! - Spectrum intake with rate limiting and A/V offset history
//! - FFT analysis tap producing dB frames from PCM
//! - 10-band equalizer and the software processor chain
//!
//! # Architecture
//!
//! ```text
//! PCM ─► ProcessorChain(volume ─► eq ─► SpectrumTap) ─► sink
//!                                          │
//!                             SpectrumAnalyzer::update()
//!                                          │ SpectrumFrame
//!                                          ▼
//!                 SpectrumProcessor ─► BandAnimator ─► tick_copy(cur, trail, peak)
//! ```
//!
//! Nothing on the renderer path allocates after construction.

mod bands;
mod bins;
mod eq;
mod error;
mod fft;
mod presets;
mod processor;
mod spectrum;

pub use bands::{
    is_allowed_bar_count, BandAnimator, BandState, ALLOWED_BAR_COUNTS, DEFAULT_BAR_COUNT,
    MAX_BARS,
};
pub use bins::{build_log_bins, normalize_db, tilt, DB_MIN, DB_RANGE};
pub use eq::{Band, BandType, EqConfig, Equalizer, EQ_BANDS, EQ_MAX_DB, EQ_MIN_DB, NUM_EQ_BANDS};
pub use error::{DspError, DspResult};
pub use fft::{SpectrumAnalyzer, DB_FLOOR, FFT_SIZE, NUM_BINS};
pub use presets::{Preset, ProfileParams, SpectrumProfile, PRESETS};
pub use processor::{
    AudioProcessor, ProcessContext, ProcessorChain, SpectrumTap, VolumeControl, VolumeStage,
};
pub use spectrum::{
    sanitize_sync_offset, FrameHistory, SpectrumFrame, SpectrumProcessor, MAX_FRAME_BINS,
    MAX_SYNC_OFFSET_MS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyzer_to_bars() {
        let analyzer = SpectrumAnalyzer::new(48000.0, 30);
        for i in 0..4096 {
            let s = (2.0 * std::f32::consts::PI * 100.0 * i as f32 / 48000.0).sin();
            analyzer.push_sample(s, s);
        }
        assert!(analyzer.update());

        let mut frame = SpectrumFrame::default();
        analyzer.copy_into(&mut frame, None);
        let mut proc = SpectrumProcessor::new(16, SpectrumProfile::Insane, 60.0);
        proc.push_frame(frame);

        let (mut cur, mut trail, mut peak) = ([0.0; MAX_BARS], [0.0; MAX_BARS], [0.0; MAX_BARS]);
        let mut n = 0;
        for t in 0..20 {
            n = proc.tick_copy(t as f64 * 16.0, None, &mut cur, &mut trail, &mut peak).0;
        }
        assert_eq!(n, 16);
        // A 100 Hz tone lights the low end more than the top
        assert!(cur[1] > cur[15]);
    }
}
