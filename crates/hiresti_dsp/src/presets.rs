//! Built-in Spectrum Motion Profiles

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DspError;

/// Animation constants for one motion profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    /// Fraction of the distance to target covered per tick
    pub smooth: f32,
    pub trail_decay: f32,
    pub peak_hold_frames: u32,
    pub peak_fall: f32,
    /// Target gain (result clamped to 1)
    pub gain_mul: f32,
    /// Bar spacing factor for the renderer
    pub spacing_mul: f32,
    pub bass_smooth: f32,
}

/// Visualizer motion profile, persisted as index 0..=3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpectrumProfile {
    Soft,
    #[default]
    Dynamic,
    Extreme,
    Insane,
}

/// Named profile with its constants
pub type Preset = (SpectrumProfile, ProfileParams);

/// List of built-in profiles, in persisted index order
pub const PRESETS: &[Preset] = &[
    (
        SpectrumProfile::Soft,
        ProfileParams {
            smooth: 0.30,
            trail_decay: 0.93,
            peak_hold_frames: 12,
            peak_fall: 0.014,
            gain_mul: 0.84,
            spacing_mul: 1.08,
            bass_smooth: 0.22,
        },
    ),
    (
        SpectrumProfile::Dynamic,
        ProfileParams {
            smooth: 0.45,
            trail_decay: 0.90,
            peak_hold_frames: 8,
            peak_fall: 0.02,
            gain_mul: 1.0,
            spacing_mul: 1.0,
            bass_smooth: 0.22,
        },
    ),
    (
        SpectrumProfile::Extreme,
        ProfileParams {
            smooth: 0.56,
            trail_decay: 0.87,
            peak_hold_frames: 6,
            peak_fall: 0.03,
            gain_mul: 1.18,
            spacing_mul: 0.92,
            bass_smooth: 0.22,
        },
    ),
    (
        SpectrumProfile::Insane,
        ProfileParams {
            smooth: 0.62,
            trail_decay: 0.84,
            peak_hold_frames: 4,
            peak_fall: 0.04,
            gain_mul: 1.32,
            spacing_mul: 0.88,
            bass_smooth: 0.22,
        },
    ),
];

impl SpectrumProfile {
    pub const ALL: [SpectrumProfile; 4] = [
        SpectrumProfile::Soft,
        SpectrumProfile::Dynamic,
        SpectrumProfile::Extreme,
        SpectrumProfile::Insane,
    ];

    pub fn params(self) -> ProfileParams {
        PRESETS[self.index()].1
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Profile for a persisted index; out of range falls back to `Dynamic`
    pub fn from_index(index: i64) -> Self {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpectrumProfile::Soft => "Soft",
            SpectrumProfile::Dynamic => "Dynamic",
            SpectrumProfile::Extreme => "Extreme",
            SpectrumProfile::Insane => "Insane",
        }
    }
}

impl fmt::Display for SpectrumProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpectrumProfile {
    type Err = DspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DspError::UnknownProfile(s.to_string()))
    }
}
