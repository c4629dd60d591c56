//! HiresTI Platform - Driver Discovery and Session Control
//!
//! This crate answers two questions for the output engine:
//! - Which drivers and output devices exist right now?
//! - What rate is the session manager's graph clocked at, and can it be moved?
//!
//! # Platform Support
//!
//! | Platform | Drivers                          | Clock Control        |
//! |----------|----------------------------------|----------------------|
//! | Linux    | Auto, PipeWire, PulseAudio, ALSA | pw-metadata, pactl   |
//! | Other    | Auto                             | None                 |
//!
//! # Architecture
//!
//! Backends implement [`DeviceEnumerator`] and [`SessionControl`]. The core
//! wraps the enumerator in a [`CachedEnumerator`]; tests and simulations use
//! the [`memory`] backend.

mod cache;
mod device;
mod error;
pub mod memory;
mod traits;

#[cfg(target_os = "linux")]
pub mod linux;

use std::sync::Arc;

pub use cache::{CachedEnumerator, DEVICE_CACHE_TTL};
pub use device::{
    depth_from_format_name, Device, DeviceList, Driver, FormatSource, RuntimeFormat,
    DEFAULT_OUTPUT_NAME, DEFAULT_SYSTEM_OUTPUT_NAME,
};
pub use error::{PlatformError, PlatformResult};
pub use traits::{ClockSettings, DeviceEnumerator, SessionControl, HIRES_ALLOWED_RATES};

/// Get the device enumerator for the current OS
pub fn system_enumerator() -> Arc<dyn DeviceEnumerator> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::SystemEnumerator::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let mem = memory::MemoryEnumerator::new();
        mem.set_drivers(vec![Driver::Auto]);
        mem.set_devices(
            Driver::Auto,
            vec![Device::new(Driver::Auto, DEFAULT_OUTPUT_NAME, None)],
        );
        Arc::new(mem)
    }
}

/// Get the session clock controller for the current OS
pub fn session_control() -> PlatformResult<Arc<dyn SessionControl>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::PipeWireClock::default()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::FeatureNotAvailable("session clock control".into()))
    }
}

/// Check if the current platform can steer a session manager clock
pub fn supports_clock_control() -> bool {
    #[cfg(target_os = "linux")]
    {
        linux::tool_on_path("pw-metadata")
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_capabilities() {
        let _ = supports_clock_control();
        let enumerator = system_enumerator();
        assert_eq!(enumerator.list_drivers().first(), Some(&Driver::Auto));
        let auto = enumerator.list_devices(Driver::Auto).unwrap();
        assert_eq!(auto.names(), vec![DEFAULT_OUTPUT_NAME.to_string()]);
    }
}
