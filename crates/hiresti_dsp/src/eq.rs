//! 10-Band Equalizer
//!
//! Cascade of BiQuad filters on the classic 10-band centers, following the
//! RBJ Audio EQ Cookbook. Gains are limited to -24..+12 dB. The software
//! stage removes the equalizer entirely under bit-perfect output; `bypass`
//! is the user-facing off switch.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};

/// Number of EQ bands
pub const NUM_EQ_BANDS: usize = 10;

/// Band center frequencies (Hz)
pub const EQ_BANDS: [f32; NUM_EQ_BANDS] = [
    29.0, 59.0, 119.0, 237.0, 474.0, 947.0, 1889.0, 3770.0, 7523.0, 15011.0,
];

/// Lowest band gain in dB
pub const EQ_MIN_DB: f32 = -24.0;

/// Highest band gain in dB
pub const EQ_MAX_DB: f32 = 12.0;

/// Filter type for each EQ band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandType {
    LowShelf,
    Peaking,
    HighShelf,
}

/// Single EQ band configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub frequency: f32,
    pub gain_db: f32,
    pub q: f32,
    pub band_type: BandType,
}

impl Band {
    pub fn new(frequency: f32, band_type: BandType) -> Self {
        Self {
            frequency,
            gain_db: 0.0,
            q: Q_BUTTERWORTH_F32,
            band_type,
        }
    }

    fn to_coefficients(self, sample_rate: f32) -> DspResult<Coefficients<f32>> {
        if sample_rate <= 0.0 {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        // Bands above Nyquist (e.g. 15 kHz at 22.05 kHz) stay flat
        if self.frequency >= sample_rate * 0.5 || self.gain_db == 0.0 {
            return Ok(passthrough());
        }
        // biquad takes shelf/peak gains in dB
        let filter = match self.band_type {
            BandType::LowShelf => Type::LowShelf(self.gain_db),
            BandType::Peaking => Type::PeakingEQ(self.gain_db),
            BandType::HighShelf => Type::HighShelf(self.gain_db),
        };

        Coefficients::<f32>::from_params(filter, sample_rate.hz(), self.frequency.hz(), self.q)
            .map_err(|_| DspError::InvalidCoefficients {
                frequency: self.frequency,
                sample_rate,
            })
    }
}

/// Identity filter
fn passthrough() -> Coefficients<f32> {
    Coefficients {
        a1: 0.0,
        a2: 0.0,
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
    }
}

/// Complete EQ configuration for all 10 bands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqConfig {
    pub bands: [Band; NUM_EQ_BANDS],
    pub bypass: bool,
}

impl Default for EqConfig {
    fn default() -> Self {
        let bands = core::array::from_fn(|i| {
            let band_type = match i {
                0 => BandType::LowShelf,
                9 => BandType::HighShelf,
                _ => BandType::Peaking,
            };
            Band::new(EQ_BANDS[i], band_type)
        });

        Self {
            bands,
            bypass: false,
        }
    }
}

impl EqConfig {
    /// Set gain for a specific band (0-9), clamped to -24..+12 dB
    pub fn set_band_gain(&mut self, band_index: usize, gain_db: f32) -> DspResult<()> {
        let band = self
            .bands
            .get_mut(band_index)
            .ok_or(DspError::InvalidBandIndex(band_index))?;
        band.gain_db = if gain_db.is_finite() {
            gain_db.clamp(EQ_MIN_DB, EQ_MAX_DB)
        } else {
            0.0
        };
        Ok(())
    }

    pub fn gains(&self) -> [f32; NUM_EQ_BANDS] {
        core::array::from_fn(|i| self.bands[i].gain_db)
    }

    /// Whether every band is at 0 dB
    pub fn is_flat(&self) -> bool {
        self.bands.iter().all(|b| b.gain_db == 0.0)
    }
}

/// The main equalizer processor
///
/// Designed for real-time use: no allocations in `process_*`.
pub struct Equalizer {
    filters_left: [DirectForm2Transposed<f32>; NUM_EQ_BANDS],
    filters_right: [DirectForm2Transposed<f32>; NUM_EQ_BANDS],
    config: EqConfig,
    sample_rate: f32,
}

impl Equalizer {
    /// Create a new equalizer with a flat response
    pub fn new(sample_rate: f32) -> Self {
        let flat = passthrough();
        let mut eq = Self {
            filters_left: core::array::from_fn(|_| DirectForm2Transposed::<f32>::new(flat)),
            filters_right: core::array::from_fn(|_| DirectForm2Transposed::<f32>::new(flat)),
            config: EqConfig::default(),
            sample_rate,
        };
        // Flat bands are exact identities; only a bad rate can fail here
        let _ = eq.rebuild();
        eq
    }

    fn rebuild(&mut self) -> DspResult<()> {
        for i in 0..NUM_EQ_BANDS {
            let coeffs = self.config.bands[i].to_coefficients(self.sample_rate)?;
            self.filters_left[i].update_coefficients(coeffs);
            self.filters_right[i].update_coefficients(coeffs);
        }
        Ok(())
    }

    /// Replace the configuration; call between buffers
    pub fn update_config(&mut self, config: EqConfig) -> DspResult<()> {
        self.config = config;
        self.rebuild()
    }

    pub fn set_band_gain(&mut self, band_index: usize, gain_db: f32) -> DspResult<()> {
        self.config.set_band_gain(band_index, gain_db)?;
        let coeffs = self.config.bands[band_index].to_coefficients(self.sample_rate)?;
        self.filters_left[band_index].update_coefficients(coeffs);
        self.filters_right[band_index].update_coefficients(coeffs);
        Ok(())
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        if self.config.bypass && !bypass {
            self.reset();
        }
        self.config.bypass = bypass;
    }

    /// Retune filters for a new stream rate
    pub fn set_sample_rate(&mut self, sample_rate: f32) -> DspResult<()> {
        if sample_rate <= 0.0 {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        self.sample_rate = sample_rate;
        self.reset();
        self.rebuild()
    }

    /// Process a stereo sample pair through the EQ chain
    #[inline]
    pub fn process_sample(&mut self, left: f32, right: f32) -> (f32, f32) {
        if self.config.bypass {
            return (left, right);
        }
        let mut l = left;
        let mut r = right;
        for i in 0..NUM_EQ_BANDS {
            l = self.filters_left[i].run(l);
            r = self.filters_right[i].run(r);
        }
        (l, r)
    }

    /// Process an interleaved stereo buffer in-place
    ///
    /// Buffer format: [L0, R0, L1, R1, L2, R2, ...]
    #[inline]
    pub fn process_interleaved(&mut self, buffer: &mut [f32]) {
        if self.config.bypass {
            return;
        }
        for frame in buffer.chunks_exact_mut(2) {
            let (l, r) = self.process_sample(frame[0], frame[1]);
            frame[0] = l;
            frame[1] = r;
        }
    }

    pub fn config(&self) -> &EqConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Reset filter state (clear delay lines)
    pub fn reset(&mut self) {
        for i in 0..NUM_EQ_BANDS {
            self.filters_left[i].reset_state();
            self.filters_right[i].reset_state();
        }
    }
}
