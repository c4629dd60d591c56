//! Playback position shared between the pipeline thread and its handle.
//!
//! The decoder clock is noisy around seeks: it can briefly report the old
//! position or jump back a few milliseconds while buffers refill. The
//! reported position therefore only moves forward, except for an explicit
//! seek, and holds the seek target for a short window afterwards.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Seeks closer than this to the previous one are dropped
const MICRO_SEEK_DELTA_S: f64 = 0.2;
const MICRO_SEEK_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ClockState {
    position: f64,
    duration: Option<f64>,
    last_seek: Option<(f64, Instant)>,
}

#[derive(Debug)]
pub struct PositionClock {
    state: Mutex<ClockState>,
    hold: Duration,
}

impl PositionClock {
    pub fn new(hold: Duration) -> Self {
        Self {
            state: Mutex::new(ClockState::default()),
            hold,
        }
    }

    /// Start over for a new stream
    pub fn reset(&self, duration: Option<f64>) {
        let mut state = self.state.lock();
        *state = ClockState {
            duration: duration.filter(|d| d.is_finite() && *d > 0.0),
            ..ClockState::default()
        };
    }

    /// Clamp a seek target and record it; `None` when it is a micro-seek
    pub fn seek(&self, target_s: f64) -> Option<f64> {
        let mut state = self.state.lock();
        let mut target = if target_s.is_finite() { target_s.max(0.0) } else { 0.0 };
        if let Some(duration) = state.duration {
            target = target.min(duration);
        }
        if let Some((previous, at)) = state.last_seek {
            if at.elapsed() < MICRO_SEEK_WINDOW && (previous - target).abs() < MICRO_SEEK_DELTA_S {
                return None;
            }
        }
        state.position = target;
        state.last_seek = Some((target, Instant::now()));
        Some(target)
    }

    /// Feed a decoder clock reading
    pub fn observe(&self, decoder_s: f64) {
        if !decoder_s.is_finite() {
            return;
        }
        let mut state = self.state.lock();
        if let Some((_, at)) = state.last_seek {
            if at.elapsed() < self.hold {
                return;
            }
        }
        let clamped = match state.duration {
            Some(d) => decoder_s.min(d),
            None => decoder_s,
        };
        if clamped > state.position {
            state.position = clamped;
        }
    }

    /// `(position_s, duration_s)`
    pub fn get(&self) -> (f64, Option<f64>) {
        let state = self.state.lock();
        (state.position, state.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_never_goes_backwards() {
        let clock = PositionClock::new(Duration::ZERO);
        clock.reset(Some(100.0));
        clock.observe(5.0);
        clock.observe(4.9);
        assert_eq!(clock.get(), (5.0, Some(100.0)));
        clock.observe(250.0);
        assert_eq!(clock.get().0, 100.0);
    }

    #[test]
    fn test_seek_jumps_and_holds() {
        let clock = PositionClock::new(Duration::from_millis(200));
        clock.reset(Some(60.0));
        clock.observe(40.0);
        assert_eq!(clock.seek(10.0), Some(10.0));
        clock.observe(40.0);
        assert_eq!(clock.get().0, 10.0);
        std::thread::sleep(Duration::from_millis(220));
        clock.observe(10.3);
        assert_eq!(clock.get().0, 10.3);
    }

    #[test]
    fn test_seek_clamps_and_drops_micro_seeks() {
        let clock = PositionClock::new(Duration::ZERO);
        clock.reset(Some(30.0));
        assert_eq!(clock.seek(-3.0), Some(0.0));
        assert_eq!(clock.seek(0.1), None);
        assert_eq!(clock.seek(99.0), Some(30.0));
        assert_eq!(clock.seek(f64::NAN), Some(0.0));
    }
}
