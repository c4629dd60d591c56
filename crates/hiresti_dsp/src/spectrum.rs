//! Spectrum Intake and Renderer Snapshot
//!
//! The pipeline delivers dB frames at analysis rate (~20-30 Hz); the
//! renderer ticks at display rate (up to 120 Hz). `SpectrumProcessor` sits
//! between them:
//!
//! ```text
//! pipeline ──SpectrumFrame──► push_frame ──► FrameHistory (by position)
//!                                                 │ sample_at(pos - offset)
//! renderer ──tick_copy(now)─► rate limit ─► normalize ─► log bins ─► BandAnimator
//! ```
//!
//! Frames are kept by stream position so the renderer can show what is
//! audible now rather than what was just decoded.

use std::collections::VecDeque;

use crate::bands::{BandAnimator, DEFAULT_BAR_COUNT, MAX_BARS};
use crate::bins::{build_log_bins, normalize_db, DB_MIN, DB_RANGE};
use crate::error::DspResult;
use crate::presets::SpectrumProfile;

/// Capacity of a spectrum frame in bins
pub const MAX_FRAME_BINS: usize = 512;

/// Frames retained for offset lookups (~6 s at 20 Hz)
const HISTORY_FRAMES: usize = 128;

/// Bound on the audio/visual offset in milliseconds
pub const MAX_SYNC_OFFSET_MS: i32 = 200;

/// One analysis frame: dB magnitudes plus the stream position it belongs to
///
/// Fixed capacity so frames can be produced on the audio path and moved
/// through a ring buffer without allocating.
#[derive(Clone)]
pub struct SpectrumFrame {
    bins: [f32; MAX_FRAME_BINS],
    len: usize,
    pub position_s: Option<f64>,
}

impl std::fmt::Debug for SpectrumFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumFrame")
            .field("len", &self.len)
            .field("position_s", &self.position_s)
            .finish()
    }
}

impl Default for SpectrumFrame {
    fn default() -> Self {
        Self {
            bins: [DB_MIN; MAX_FRAME_BINS],
            len: 0,
            position_s: None,
        }
    }
}

impl SpectrumFrame {
    /// Copy up to [`MAX_FRAME_BINS`] values
    pub fn from_slice(values: &[f32], position_s: Option<f64>) -> Self {
        let mut frame = Self::default();
        frame.fill(values, position_s);
        frame
    }

    pub fn fill(&mut self, values: &[f32], position_s: Option<f64>) {
        let n = values.len().min(MAX_FRAME_BINS);
        self.bins[..n].copy_from_slice(&values[..n]);
        self.len = n;
        self.position_s = position_s;
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Recent frames ordered by arrival
#[derive(Debug, Default)]
pub struct FrameHistory {
    frames: VecDeque<SpectrumFrame>,
}

impl FrameHistory {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(HISTORY_FRAMES),
        }
    }

    pub fn push(&mut self, frame: SpectrumFrame) {
        // A position jump backwards is a seek: older frames no longer apply
        if let (Some(new_pos), Some(last_pos)) = (
            frame.position_s,
            self.frames.back().and_then(|f| f.position_s),
        ) {
            if new_pos + 0.5 < last_pos {
                self.frames.clear();
            }
        }
        if self.frames.len() == HISTORY_FRAMES {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Latest frame whose position is at or before `position_s`
    ///
    /// Falls back to the oldest frame when every frame is newer, and to the
    /// latest frame when frames carry no position.
    pub fn sample_at(&self, position_s: f64) -> Option<&SpectrumFrame> {
        let latest = self.frames.back()?;
        if latest.position_s.is_none() {
            return Some(latest);
        }
        self.frames
            .iter()
            .rev()
            .find(|f| f.position_s.map(|p| p <= position_s).unwrap_or(false))
            .or_else(|| self.frames.front())
    }

    pub fn latest(&self) -> Option<&SpectrumFrame> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Clamp an offset to `[-200, 200]` ms; anything outside resets to 0
pub fn sanitize_sync_offset(offset_ms: i64) -> i32 {
    if (-(MAX_SYNC_OFFSET_MS as i64)..=MAX_SYNC_OFFSET_MS as i64).contains(&offset_ms) {
        offset_ms as i32
    } else {
        0
    }
}

/// Spectrum intake, binning and animation for one visualizer
#[derive(Debug)]
pub struct SpectrumProcessor {
    animator: BandAnimator,
    history: FrameHistory,
    heights: Vec<f32>,
    bars: Vec<f32>,
    db_min: f32,
    db_range: f32,
    min_interval_ms: f64,
    last_target_ms: Option<f64>,
    sync_offset_ms: i32,
    dirty: bool,
}

impl Default for SpectrumProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_BAR_COUNT, SpectrumProfile::default(), 60.0)
    }
}

impl SpectrumProcessor {
    /// `max_hz` bounds how often targets are recomputed (<= 0 selects 20 Hz)
    pub fn new(bar_count: usize, profile: SpectrumProfile, max_hz: f32) -> Self {
        let hz = if max_hz <= 0.0 { 20.0 } else { max_hz };
        Self {
            animator: BandAnimator::new(bar_count, profile),
            history: FrameHistory::new(),
            heights: vec![0.0; MAX_FRAME_BINS],
            bars: vec![0.0; MAX_BARS],
            db_min: DB_MIN,
            db_range: DB_RANGE,
            min_interval_ms: 1000.0 / f64::from(hz),
            last_target_ms: None,
            sync_offset_ms: 0,
            dirty: false,
        }
    }

    pub fn push_frame(&mut self, frame: SpectrumFrame) {
        if frame.is_empty() {
            return;
        }
        self.history.push(frame);
        self.dirty = true;
    }

    pub fn set_sync_offset_ms(&mut self, offset_ms: i64) {
        self.sync_offset_ms = sanitize_sync_offset(offset_ms);
    }

    pub fn sync_offset_ms(&self) -> i32 {
        self.sync_offset_ms
    }

    pub fn set_bar_count(&mut self, count: usize) -> DspResult<()> {
        self.animator.set_bar_count(count)?;
        self.last_target_ms = None;
        self.dirty = !self.history.is_empty();
        Ok(())
    }

    pub fn bar_count(&self) -> usize {
        self.animator.bar_count()
    }

    pub fn set_profile(&mut self, profile: SpectrumProfile) {
        self.animator.set_profile(profile);
    }

    pub fn profile(&self) -> SpectrumProfile {
        self.animator.profile()
    }

    pub fn animator(&self) -> &BandAnimator {
        &self.animator
    }

    /// Recompute bar targets from the frame audible at `position_s`
    ///
    /// Returns false when rate limited or when no frame is available.
    pub fn update_targets(&mut self, now_ms: f64, position_s: Option<f64>) -> bool {
        if let Some(last) = self.last_target_ms {
            if now_ms - last < self.min_interval_ms {
                return false;
            }
        }
        let frame = match position_s {
            Some(pos) => {
                let audible = pos - f64::from(self.sync_offset_ms) / 1000.0;
                self.history.sample_at(audible.max(0.0))
            }
            None => self.history.latest(),
        };
        let Some(frame) = frame else {
            return false;
        };
        if position_s.is_none() && !self.dirty {
            return false;
        }

        let n_in = frame.len();
        normalize_db(
            frame.bins(),
            &mut self.heights[..n_in],
            self.db_min,
            self.db_range,
            1.0,
        );
        let count = self.animator.bar_count();
        build_log_bins(&self.heights[..n_in], &mut self.bars[..count]);
        self.animator.set_target(&self.bars[..count]);

        self.last_target_ms = Some(now_ms);
        self.dirty = false;
        true
    }

    /// Renderer entry point: refresh targets if due, then animate one frame
    pub fn tick_copy(
        &mut self,
        now_ms: f64,
        position_s: Option<f64>,
        cur_out: &mut [f32],
        trail_out: &mut [f32],
        peak_out: &mut [f32],
    ) -> (usize, f32) {
        self.update_targets(now_ms, position_s);
        self.animator.tick_copy(cur_out, trail_out, peak_out)
    }

    /// Clear history and envelopes (track change, spectrum disabled)
    pub fn reset(&mut self) {
        self.history.clear();
        self.animator.reset();
        self.last_target_ms = None;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_frame(db: f32, pos: Option<f64>) -> SpectrumFrame {
        SpectrumFrame::from_slice(&[db; 512], pos)
    }

    #[test]
    fn test_frame_capacity() {
        let frame = SpectrumFrame::from_slice(&[0.0; 900], Some(1.0));
        assert_eq!(frame.len(), MAX_FRAME_BINS);
        assert!(SpectrumFrame::from_slice(&[], None).is_empty());
    }

    #[test]
    fn test_history_sample_at_offset() {
        let mut history = FrameHistory::new();
        for i in 0..10 {
            history.push(flat_frame(-i as f32, Some(i as f64 * 0.1)));
        }
        let f = history.sample_at(0.55).unwrap();
        assert_eq!(f.position_s, Some(0.5));
        // Earlier than anything retained: oldest frame
        assert_eq!(history.sample_at(-1.0).unwrap().position_s, Some(0.0));
        // Seek backwards drops stale frames
        history.push(flat_frame(0.0, Some(0.0)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_sanitize_sync_offset() {
        assert_eq!(sanitize_sync_offset(40), 40);
        assert_eq!(sanitize_sync_offset(-200), -200);
        assert_eq!(sanitize_sync_offset(201), 0);
        assert_eq!(sanitize_sync_offset(-5000), 0);
    }

    #[test]
    fn test_rate_limit() {
        let mut proc = SpectrumProcessor::new(32, SpectrumProfile::Dynamic, 60.0);
        proc.push_frame(flat_frame(-12.0, None));
        assert!(proc.update_targets(0.0, None));
        proc.push_frame(flat_frame(-6.0, None));
        assert!(!proc.update_targets(5.0, None), "within 1/60 s");
        assert!(proc.update_targets(20.0, None));
        // No new frame and no position: nothing to do
        assert!(!proc.update_targets(40.0, None));
    }

    #[test]
    fn test_flat_input_settles() {
        let mut proc = SpectrumProcessor::new(32, SpectrumProfile::Extreme, 60.0);
        let mut cur = [0.0; MAX_BARS];
        let mut trail = [0.0; MAX_BARS];
        let mut peak = [0.0; MAX_BARS];
        proc.push_frame(flat_frame(-12.0, None));
        for i in 0..10 {
            let (n, _) = proc.tick_copy(i as f64 * 8.0, None, &mut cur, &mut trail, &mut peak);
            assert_eq!(n, 32);
        }
        assert!(proc.animator().max_error() < 1e-3);
    }

    #[test]
    fn test_bar_count_change_mid_stream() {
        let mut proc = SpectrumProcessor::default();
        let mut cur = [0.0; MAX_BARS];
        let mut trail = [0.0; MAX_BARS];
        let mut peak = [0.0; MAX_BARS];
        proc.push_frame(flat_frame(-12.0, None));
        assert_eq!(proc.tick_copy(0.0, None, &mut cur, &mut trail, &mut peak).0, 32);
        proc.set_bar_count(64).unwrap();
        assert_eq!(proc.tick_copy(100.0, None, &mut cur, &mut trail, &mut peak).0, 64);
        assert!(cur[..64].iter().all(|v| *v > 0.0), "targets recomputed for new bar count");
    }
}
