//! DSP Error Types

use thiserror::Error;

/// Errors that can occur during DSP operations
#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid band index: {0} (must be 0-9)")]
    InvalidBandIndex(usize),

    #[error("Invalid filter coefficients for frequency {frequency}Hz at sample rate {sample_rate}Hz")]
    InvalidCoefficients { frequency: f32, sample_rate: f32 },

    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f32),

    #[error("Unsupported bar count: {0} (allowed: 4, 8, 16, 32, 48, 64, 96, 128)")]
    InvalidBarCount(usize),

    #[error("Unknown spectrum profile: {0}")]
    UnknownProfile(String),
}

/// Result type alias for DSP operations
pub type DspResult<T> = Result<T, DspError>;
