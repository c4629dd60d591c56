//! Per-Bar Envelope Animation
//!
//! Each display frame moves every bar toward its target and updates two
//! slower envelopes that the renderer draws behind the bars:
//!
//! ```text
//!   1.0 ┤        ▔▔  <- peak: holds for N frames, then falls linearly
//!       │      ░░░░  <- trail: decaying max of recent levels
//!       │      ████  <- current: low-passed toward target
//!   0.0 ┴──────────
//! ```
//!
//! Storage for [`MAX_BARS`] bars is allocated once; changing the bar count
//! or profile never reallocates.

use crate::error::{DspError, DspResult};
use crate::presets::{ProfileParams, SpectrumProfile};

/// Largest supported bar count
pub const MAX_BARS: usize = 128;

/// Bar counts the renderer can lay out
pub const ALLOWED_BAR_COUNTS: [usize; 8] = [4, 8, 16, 32, 48, 64, 96, 128];

/// Default bar count
pub const DEFAULT_BAR_COUNT: usize = 32;

pub fn is_allowed_bar_count(n: usize) -> bool {
    ALLOWED_BAR_COUNTS.contains(&n)
}

/// Envelope state of one bar
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandState {
    pub current: f32,
    pub target: f32,
    pub trail: f32,
    pub peak: f32,
    /// Frames left before the peak starts falling
    pub peak_ttl: u32,
}

impl BandState {
    #[inline]
    fn step(&mut self, p: &ProfileParams) {
        self.current += (self.target - self.current) * p.smooth;
        self.current = self.current.clamp(0.0, 1.0);

        self.trail = self.current.max(self.trail * p.trail_decay).min(1.0);

        if self.current >= self.peak {
            self.peak = self.current;
            self.peak_ttl = p.peak_hold_frames;
        } else if self.peak_ttl > 0 {
            self.peak_ttl -= 1;
        } else {
            // Never fall below the bar itself
            self.peak = (self.peak - p.peak_fall).max(self.current).max(0.0);
        }
    }
}

/// Animates up to [`MAX_BARS`] bars with a motion profile
#[derive(Debug, Clone)]
pub struct BandAnimator {
    bands: Box<[BandState; MAX_BARS]>,
    count: usize,
    profile: SpectrumProfile,
    params: ProfileParams,
    bass: f32,
}

impl Default for BandAnimator {
    fn default() -> Self {
        Self::new(DEFAULT_BAR_COUNT, SpectrumProfile::default())
    }
}

impl BandAnimator {
    /// Create an animator; an unsupported `count` falls back to the default
    pub fn new(count: usize, profile: SpectrumProfile) -> Self {
        Self {
            bands: Box::new([BandState::default(); MAX_BARS]),
            count: if is_allowed_bar_count(count) {
                count
            } else {
                DEFAULT_BAR_COUNT
            },
            profile,
            params: profile.params(),
            bass: 0.0,
        }
    }

    pub fn bar_count(&self) -> usize {
        self.count
    }

    /// Change the number of bars, clearing all envelopes
    pub fn set_bar_count(&mut self, count: usize) -> DspResult<()> {
        if !is_allowed_bar_count(count) {
            return Err(DspError::InvalidBarCount(count));
        }
        if count != self.count {
            self.count = count;
            self.reset();
        }
        Ok(())
    }

    pub fn profile(&self) -> SpectrumProfile {
        self.profile
    }

    pub fn params(&self) -> &ProfileParams {
        &self.params
    }

    pub fn set_profile(&mut self, profile: SpectrumProfile) {
        self.profile = profile;
        self.params = profile.params();
    }

    /// Set targets from bar heights; missing bars target 0
    ///
    /// Targets are scaled by the profile's `gain_mul` and clamped to 1.
    pub fn set_target(&mut self, heights: &[f32]) {
        let gain = self.params.gain_mul;
        for (i, band) in self.bands[..self.count].iter_mut().enumerate() {
            let h = heights.get(i).copied().unwrap_or(0.0);
            band.target = (h * gain).clamp(0.0, 1.0);
        }
    }

    /// Advance one display frame
    pub fn tick(&mut self) {
        let params = self.params;
        for band in &mut self.bands[..self.count] {
            band.step(&params);
        }

        let low = (self.count / 10).max(1);
        let mean = self.bands[..low].iter().map(|b| b.current).sum::<f32>() / low as f32;
        self.bass += (mean - self.bass) * params.bass_smooth;
    }

    /// Advance one frame and copy the envelopes out
    ///
    /// Writes `min(bar_count, shortest buffer)` entries and returns that count
    /// with the bass level.
    pub fn tick_copy(&mut self, cur_out: &mut [f32], trail_out: &mut [f32], peak_out: &mut [f32]) -> (usize, f32) {
        self.tick();
        let n = self
            .count
            .min(cur_out.len())
            .min(trail_out.len())
            .min(peak_out.len());
        for (i, band) in self.bands[..n].iter().enumerate() {
            cur_out[i] = band.current;
            trail_out[i] = band.trail;
            peak_out[i] = band.peak;
        }
        (n, self.bass)
    }

    pub fn bands(&self) -> &[BandState] {
        &self.bands[..self.count]
    }

    pub fn bass(&self) -> f32 {
        self.bass
    }

    /// Largest `|current - target|` across active bars
    pub fn max_error(&self) -> f32 {
        self.bands()
            .iter()
            .map(|b| (b.current - b.target).abs())
            .fold(0.0, f32::max)
    }

    pub fn reset(&mut self) {
        self.bands.fill(BandState::default());
        self.bass = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(anim: &BandAnimator) {
        for (i, b) in anim.bands().iter().enumerate() {
            assert!(b.current >= 0.0 && b.current <= 1.0, "bar {} current {}", i, b.current);
            assert!(b.current <= b.trail && b.trail <= 1.0, "bar {} trail {}", i, b.trail);
            assert!(b.current <= b.peak && b.peak <= 1.0, "bar {} peak {}", i, b.peak);
        }
    }

    #[test]
    fn test_invariants_hold_under_random_targets() {
        let mut anim = BandAnimator::new(64, SpectrumProfile::Insane);
        let mut seed = 12345u32;
        let mut heights = [0.0f32; 64];
        for _ in 0..500 {
            for h in heights.iter_mut() {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                *h = (seed >> 8) as f32 / (1u32 << 24) as f32 * 1.5;
            }
            anim.set_target(&heights);
            anim.tick();
            assert_invariants(&anim);
        }
    }

    #[test]
    fn test_monotone_settlement() {
        let mut anim = BandAnimator::new(8, SpectrumProfile::Dynamic);
        anim.set_target(&[0.8; 8]);
        let mut last = 0.0;
        for _ in 0..40 {
            anim.tick();
            let cur = anim.bands()[0].current;
            assert!(cur >= last - 1e-7);
            assert!(cur <= 0.8 + 1e-6);
            last = cur;
        }
        assert!(anim.max_error() < 1e-3);
    }

    #[test]
    fn test_peak_hold_then_fall() {
        let mut anim = BandAnimator::new(4, SpectrumProfile::Dynamic);
        anim.set_target(&[1.0; 4]);
        for _ in 0..30 {
            anim.tick();
        }
        let top = anim.bands()[0].peak;
        anim.set_target(&[0.0; 4]);
        // current drops immediately, peak is held for 8 frames
        for _ in 0..8 {
            anim.tick();
            assert_eq!(anim.bands()[0].peak, top);
        }
        anim.tick();
        assert!(anim.bands()[0].peak < top);
        assert!((top - anim.bands()[0].peak - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_tick_copy_bar_counts() {
        let mut cur = [0.0; MAX_BARS];
        let mut trail = [0.0; MAX_BARS];
        let mut peak = [0.0; MAX_BARS];
        for &n in &ALLOWED_BAR_COUNTS {
            let mut anim = BandAnimator::new(n, SpectrumProfile::Soft);
            anim.set_target(&[0.5; MAX_BARS]);
            let (written, bass) = anim.tick_copy(&mut cur, &mut trail, &mut peak);
            assert_eq!(written, n);
            assert!(bass > 0.0 && bass <= 1.0);
        }
        // Short caller buffers bound the write
        let mut anim = BandAnimator::new(128, SpectrumProfile::Soft);
        let (written, _) = anim.tick_copy(&mut cur[..10], &mut trail, &mut peak);
        assert_eq!(written, 10);
    }

    #[test]
    fn test_gain_mul_clamps_targets() {
        let mut anim = BandAnimator::new(4, SpectrumProfile::Insane);
        anim.set_target(&[0.9, 0.5]);
        let t: Vec<f32> = anim.bands().iter().map(|b| b.target).collect();
        assert_eq!(t[0], 1.0);
        assert!((t[1] - 0.66).abs() < 1e-6);
        assert_eq!(&t[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_set_bar_count() {
        let mut anim = BandAnimator::default();
        assert_eq!(anim.bar_count(), 32);
        anim.set_target(&[1.0; 32]);
        anim.tick();
        anim.set_bar_count(64).unwrap();
        assert_eq!(anim.bar_count(), 64);
        assert!(anim.bands().iter().all(|b| b.current == 0.0));
        assert!(anim.set_bar_count(100).is_err());
        assert_eq!(anim.bar_count(), 64);
    }

    #[test]
    fn test_bass_uses_lowest_tenth() {
        let mut anim = BandAnimator::new(32, SpectrumProfile::Dynamic);
        let mut heights = [0.0; 32];
        heights[..3].fill(1.0);
        anim.set_target(&heights);
        for _ in 0..200 {
            anim.tick();
        }
        assert!((anim.bass() - 1.0).abs() < 1e-3);
    }
}
