//! Platform Backend Traits
//!
//! Defines the interface the core consumes for device discovery and for
//! steering the session manager's clock.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::device::{Driver, DeviceList, RuntimeFormat};
use crate::error::PlatformResult;

/// Device discovery for every supported driver
///
/// Implementations may block (shelling out, reading procfs), so callers run
/// them on worker threads.
pub trait DeviceEnumerator: Send + Sync {
    /// Get the backend name (for logging/debugging)
    fn name(&self) -> &'static str;

    /// Drivers usable on this system, `Auto` first
    fn list_drivers(&self) -> Vec<Driver>;

    /// Current device snapshot for `driver`
    fn list_devices(&self, driver: Driver) -> PlatformResult<DeviceList>;

    /// Format the selected sink is running at, if observable
    fn runtime_format(&self, driver: Driver, device_id: Option<&str>) -> Option<RuntimeFormat>;
}

/// Clock settings published by the session manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSettings {
    /// `clock.force-rate` (0 = not forced)
    pub force_rate: u32,
    /// `clock.allowed-rates`
    pub allowed_rates: Vec<u32>,
    /// `clock.rate` the graph currently runs at (0 = unknown)
    pub clock_rate: u32,
    /// `clock.quantum` in frames (0 = unknown)
    pub quantum: u32,
}

impl ClockSettings {
    /// Whether the graph honours a request for `rate`
    ///
    /// Either the force-rate override took effect, or the graph clock
    /// already runs at the rate.
    pub fn honours(&self, rate: u32) -> bool {
        rate > 0 && (self.force_rate == rate || self.clock_rate == rate)
    }

    pub fn allows(&self, rate: u32) -> bool {
        self.allowed_rates.contains(&rate)
    }
}

/// Rates requested alongside a force-rate hint so the graph may follow the source
pub const HIRES_ALLOWED_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Control over the session manager's clock metadata and card profiles
pub trait SessionControl: Send + Sync {
    /// Read the current clock metadata
    fn read_clock(&self) -> PlatformResult<ClockSettings>;

    /// Publish a `force_rate` hint; `0` releases the override
    fn set_force_rate(&self, rate: u32) -> PlatformResult<()>;

    /// Publish the set of rates the graph may switch between
    fn set_allowed_rates(&self, rates: &[u32]) -> PlatformResult<()>;

    /// Switch the card behind `device_id` to the `pro-audio` profile.
    /// Returns the card name on success.
    fn ensure_pro_audio(&self, device_id: &str) -> PlatformResult<String>;

    /// Poll `read_clock` until `check` holds or `grace` elapses
    ///
    /// Returns the last reading and whether the check passed.
    fn wait_for_clock(
        &self,
        check: &dyn Fn(&ClockSettings) -> bool,
        grace: Duration,
        interval: Duration,
    ) -> (ClockSettings, bool) {
        let deadline = Instant::now() + grace.max(Duration::from_millis(50));
        loop {
            let settings = self.read_clock().unwrap_or_default();
            if check(&settings) {
                return (settings, true);
            }
            if Instant::now() >= deadline {
                return (settings, false);
            }
            std::thread::sleep(interval.max(Duration::from_millis(10)));
        }
    }
}
