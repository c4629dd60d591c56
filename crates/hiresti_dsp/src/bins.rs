//! dB Normalization and Logarithmic Binning
//!
//! Turns a linear-frequency dB spectrum into bar heights:
//!
//! ```text
//! dB[0..N]  --normalize_db-->  h[0..N] in [0,1]  --build_log_bins-->  bars[0..M]
//!                                                    x0 = (i/M)^2.15 * (N-1)
//! ```
//!
//! The 2.15 exponent gives low frequencies many more bars than a linear
//! split would. Both functions write into caller buffers and never allocate.

/// Quietest level shown (maps to height 0)
pub const DB_MIN: f32 = -60.0;

/// dB span mapped onto heights 0..1
pub const DB_RANGE: f32 = 60.0;

const BIN_EXPONENT: f32 = 2.15;
const TILT_BASE: f32 = 0.92;
const TILT_SPAN: f32 = 0.16;
const SHAPE_POW: f32 = 0.84;

/// Map dB values to heights: `clamp((v - db_min) / db_range, 0, 1)^gamma`
///
/// Fills `min(input.len(), out.len())` entries and zeroes the rest of `out`.
/// A zero `db_range` falls back to [`DB_RANGE`]; `gamma == 1.0` skips shaping.
pub fn normalize_db(input: &[f32], out: &mut [f32], db_min: f32, db_range: f32, gamma: f32) {
    let range = if db_range.abs() < f32::EPSILON {
        DB_RANGE
    } else {
        db_range
    };
    let n = input.len().min(out.len());
    for (dst, &v) in out[..n].iter_mut().zip(input) {
        let h = if v.is_nan() || v <= db_min {
            0.0
        } else {
            ((v - db_min) / range).clamp(0.0, 1.0)
        };
        *dst = if (gamma - 1.0).abs() > f32::EPSILON && gamma > 0.0 {
            h.powf(gamma)
        } else {
            h
        };
    }
    out[n..].fill(0.0);
}

/// Tilt applied to output bar `i` of `out_count`
#[inline]
pub fn tilt(i: usize, out_count: usize) -> f32 {
    let denom = out_count.saturating_sub(1).max(1) as f32;
    TILT_BASE + TILT_SPAN * (i as f32 / denom)
}

/// Average heights over logarithmically widening input ranges
///
/// Each output bar is the mean of `values[x0..=x1]`, lifted by [`tilt`] and
/// shaped by `pow(v, 0.84)`, clamped to `[0, 1]`. An empty input or output
/// leaves `out` untouched.
pub fn build_log_bins(values: &[f32], out: &mut [f32]) {
    let in_count = values.len();
    let out_count = out.len();
    if in_count == 0 || out_count == 0 {
        return;
    }
    let span = (in_count - 1) as f32;

    for (i, dst) in out.iter_mut().enumerate() {
        let t0 = i as f32 / out_count as f32;
        let t1 = (i + 1) as f32 / out_count as f32;
        let x0 = ((t0.powf(BIN_EXPONENT) * span) as usize).min(in_count - 1);
        let mut x1 = ((t1.powf(BIN_EXPONENT) * span) as usize).min(in_count - 1);
        if x1 <= x0 {
            x1 = (x0 + 1).min(in_count - 1);
        }

        let slice = &values[x0..=x1];
        let avg = slice.iter().sum::<f32>() / slice.len() as f32;
        let shaped = avg.clamp(0.0, 1.0).powf(SHAPE_POW) * tilt(i, out_count);
        *dst = shaped.clamp(0.0, 1.0);
    }
}
