//! Core Configuration
//!
//! Typed knobs for the pipeline, the output state machine and the hotplug
//! watchdog, plus the `HIRESTI_*` environment overrides.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Buffer/latency preset for the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LatencyProfile {
    #[serde(rename = "Safe (400ms)")]
    Safe,
    #[default]
    #[serde(rename = "Standard (100ms)")]
    Standard,
    #[serde(rename = "Low Latency (40ms)")]
    LowLatency,
    #[serde(rename = "Aggressive (20ms)")]
    Aggressive,
}

impl LatencyProfile {
    pub const ALL: [LatencyProfile; 4] = [
        LatencyProfile::Safe,
        LatencyProfile::Standard,
        LatencyProfile::LowLatency,
        LatencyProfile::Aggressive,
    ];

    /// `(buffer_ms, latency_ms)`
    pub fn timings(&self) -> (u32, u32) {
        match self {
            LatencyProfile::Safe => (400, 40),
            LatencyProfile::Standard => (100, 10),
            LatencyProfile::LowLatency => (40, 4),
            LatencyProfile::Aggressive => (20, 2),
        }
    }

    pub fn buffer_ms(&self) -> u32 {
        self.timings().0
    }

    pub fn latency_ms(&self) -> u32 {
        self.timings().1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyProfile::Safe => "Safe (400ms)",
            LatencyProfile::Standard => "Standard (100ms)",
            LatencyProfile::LowLatency => "Low Latency (40ms)",
            LatencyProfile::Aggressive => "Aggressive (20ms)",
        }
    }
}

impl fmt::Display for LatencyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LatencyProfile {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::Settings {
                path: Default::default(),
                message: format!("unknown latency profile: {}", s),
            })
    }
}

/// Hotplug watchdog and passive presence monitor timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub fast_interval_ms: u64,
    pub fast_seconds: u64,
    pub slow_interval_ms: u64,
    /// Quiet period after an automatic switch-back
    pub rebind_cooldown_s: u64,
    /// Presence-check interval while playing or shortly after an event
    pub passive_active_ms: u64,
    pub passive_idle_ms: u64,
    /// How long an output event counts as "recent"
    pub recent_event_s: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 1000,
            fast_seconds: 60,
            slow_interval_ms: 5000,
            rebind_cooldown_s: 15,
            passive_active_ms: 3000,
            passive_idle_ms: 15000,
            recent_event_s: 10,
        }
    }
}

impl WatchdogConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms.max(1))
    }

    pub fn fast_window(&self) -> Duration {
        Duration::from_secs(self.fast_seconds)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms.max(1))
    }

    pub fn rebind_cooldown(&self) -> Duration {
        Duration::from_secs(self.rebind_cooldown_s)
    }
}

/// Overall core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Worker threads serving the work queue
    pub workers: usize,
    /// Timeout for HTTP and codec-open calls
    pub external_timeout_ms: u64,
    /// How long the session clock gets to adopt a force-rate hint
    pub pipewire_grace_ms: u64,
    pub pipewire_poll_ms: u64,
    /// Repeated identical output switches inside this window are ignored
    pub switch_coalesce_ms: u64,
    /// Position reads report the seek target for this long after a seek
    pub seek_hold_ms: u64,
    /// Analysis rate of the spectrum tap
    pub spectrum_fps: u32,
    /// Upper bound on spectrum target recomputation
    pub spectrum_max_hz: f32,
    pub watchdog: WatchdogConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            external_timeout_ms: 10_000,
            pipewire_grace_ms: 450,
            pipewire_poll_ms: 50,
            switch_coalesce_ms: 800,
            seek_hold_ms: 350,
            spectrum_fps: 30,
            spectrum_max_hz: 60.0,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    pub fn pipewire_grace(&self) -> Duration {
        Duration::from_millis(self.pipewire_grace_ms)
    }

    pub fn pipewire_poll(&self) -> Duration {
        Duration::from_millis(self.pipewire_poll_ms)
    }

    pub fn switch_coalesce(&self) -> Duration {
        Duration::from_millis(self.switch_coalesce_ms)
    }

    pub fn seek_hold(&self) -> Duration {
        Duration::from_millis(self.seek_hold_ms)
    }
}

/// Values read from `HIRESTI_*` environment variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    pub cover_cache_max_mb: u64,
    pub cover_cache_max_days: u64,
    /// Override path for an external visualizer library; logged only
    pub rust_viz_lib: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cover_cache_max_mb: 300,
            cover_cache_max_days: 30,
            rust_viz_lib: None,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; unparsable numbers keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            cover_cache_max_mb: number("HIRESTI_COVER_CACHE_MAX_MB", defaults.cover_cache_max_mb),
            cover_cache_max_days: number(
                "HIRESTI_COVER_CACHE_MAX_DAYS",
                defaults.cover_cache_max_days,
            ),
            rust_viz_lib: lookup("HIRESTI_RUST_VIZ_LIB").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn cover_cache_max_bytes(&self) -> u64 {
        self.cover_cache_max_mb.saturating_mul(1024 * 1024)
    }

    pub fn cover_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cover_cache_max_days.saturating_mul(86_400))
    }
}
