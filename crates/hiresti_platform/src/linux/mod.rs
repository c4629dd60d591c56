//! Linux Platform Backend - ALSA, PipeWire, PulseAudio
//!
//! Discovery never links against the session manager; it reads procfs and
//! shells out to the session tools, so one enumerator serves every driver:
//!
//! ```text
//! SystemEnumerator
//!   ├── ALSA        /proc/asound/cards, cardN/pcmMp/subK/hw_params
//!   ├── PipeWire    pw-dump (sinks + Format params), pactl fallback
//!   └── PulseAudio  pactl list sinks
//!
//! PipeWireClock (SessionControl)
//!   ├── pw-metadata -n settings 0 clock.*
//!   └── pactl list cards / set-card-profile
//! ```

mod alsa;
mod command;
mod pipewire;
mod profile;
mod pulse;
mod state;

use std::sync::Arc;

use tracing::{debug, warn};

pub use alsa::{parse_cards, parse_hw_address, parse_hw_params, AlsaProc, PROC_ASOUND};
pub use command::{tool_on_path, CommandRunner, SystemRunner};
pub use pipewire::{
    format_rate_list, parse_rate_list, parse_settings_metadata, PipeWireClock, PRO_AUDIO_PROFILE,
};
pub use profile::card_from_pipewire_output_node;
pub use pulse::parse_sinks as parse_pactl_sinks;
pub use state::{PipeWireState, PwFormat, PwNodeInfo};

use crate::device::{
    Device, DeviceList, Driver, RuntimeFormat, DEFAULT_OUTPUT_NAME, DEFAULT_SYSTEM_OUTPUT_NAME,
};
use crate::error::{PlatformError, PlatformResult};
use crate::traits::DeviceEnumerator;

type ToolProbe = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Device enumerator for a Linux desktop
pub struct SystemEnumerator {
    runner: Arc<dyn CommandRunner>,
    alsa: AlsaProc,
    tool_probe: ToolProbe,
}

impl Default for SystemEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemEnumerator {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(SystemRunner::default()), AlsaProc::default(), Box::new(tool_on_path))
    }

    /// Build from explicit parts (scripted tools, a fake procfs root)
    pub fn with_parts(runner: Arc<dyn CommandRunner>, alsa: AlsaProc, tool_probe: ToolProbe) -> Self {
        Self {
            runner,
            alsa,
            tool_probe,
        }
    }

    fn driver_available(&self, driver: Driver) -> bool {
        match driver {
            Driver::Auto => true,
            Driver::PipeWire => (self.tool_probe)("pw-dump") || (self.tool_probe)("pw-cli"),
            Driver::PulseAudio => (self.tool_probe)("pactl"),
            Driver::Alsa => self.alsa.is_present(),
        }
    }

    fn pipewire_sinks(&self) -> Vec<Device> {
        let from_graph = match pipewire::snapshot(self.runner.as_ref()) {
            Ok(state) => pipewire::list_sinks(&state),
            Err(e) => {
                debug!("PipeWire enumeration unavailable: {}", e);
                Vec::new()
            }
        };
        if !from_graph.is_empty() {
            return from_graph;
        }
        // Only when the graph itself could not be enumerated
        pulse::list_sinks(self.runner.as_ref(), Driver::PipeWire).unwrap_or_else(|e| {
            warn!("pactl fallback failed: {}", e);
            Vec::new()
        })
    }
}

impl DeviceEnumerator for SystemEnumerator {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn list_drivers(&self) -> Vec<Driver> {
        Driver::ALL
            .into_iter()
            .filter(|d| self.driver_available(*d))
            .collect()
    }

    fn list_devices(&self, driver: Driver) -> PlatformResult<DeviceList> {
        let devices = match driver {
            Driver::Auto => vec![Device::new(Driver::Auto, DEFAULT_OUTPUT_NAME, None)],
            Driver::PipeWire => {
                let mut out = vec![Device::new(Driver::PipeWire, DEFAULT_SYSTEM_OUTPUT_NAME, None)];
                out.extend(self.pipewire_sinks());
                out
            }
            Driver::PulseAudio => {
                if !self.driver_available(driver) {
                    return Err(PlatformError::DriverUnavailable(driver.to_string()));
                }
                let mut out = vec![Device::new(Driver::PulseAudio, DEFAULT_SYSTEM_OUTPUT_NAME, None)];
                out.extend(pulse::list_sinks(self.runner.as_ref(), Driver::PulseAudio)?);
                out
            }
            Driver::Alsa => self.alsa.list_cards()?,
        };
        debug!("{} devices for {}", devices.len(), driver);
        Ok(DeviceList::new(driver, devices))
    }

    fn runtime_format(&self, driver: Driver, device_id: Option<&str>) -> Option<RuntimeFormat> {
        if driver == Driver::PipeWire {
            let from_graph = pipewire::snapshot(self.runner.as_ref())
                .ok()
                .and_then(|state| pipewire::runtime_format(&state, device_id));
            if from_graph.is_some() {
                return from_graph;
            }
        }
        let kernel_filter = if driver == Driver::Alsa { device_id } else { None };
        self.alsa.running_format(kernel_filter)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::command::testing::ScriptedRunner;
    use super::state::fixtures::PW_DUMP;
    use super::*;

    fn enumerator(runner: Arc<ScriptedRunner>, root: &std::path::Path) -> SystemEnumerator {
        SystemEnumerator::with_parts(
            runner,
            AlsaProc::new(root),
            Box::new(|tool| matches!(tool, "pw-dump" | "pactl")),
        )
    }

    #[test]
    fn test_list_drivers_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cards"), " 0 [PCH ]: HDA-Intel - HDA Intel PCH\n").unwrap();
        let en = enumerator(Arc::new(ScriptedRunner::default()), dir.path());
        assert_eq!(
            en.list_drivers(),
            vec![Driver::Auto, Driver::PipeWire, Driver::PulseAudio, Driver::Alsa]
        );

        let bare = SystemEnumerator::with_parts(
            Arc::new(ScriptedRunner::default()),
            AlsaProc::new("/nonexistent"),
            Box::new(|_| false),
        );
        assert_eq!(bare.list_drivers(), vec![Driver::Auto]);
    }

    #[test]
    fn test_auto_lists_default_output() {
        let dir = tempfile::tempdir().unwrap();
        let en = enumerator(Arc::new(ScriptedRunner::default()), dir.path());
        let list = en.list_devices(Driver::Auto).unwrap();
        assert_eq!(list.names(), vec![DEFAULT_OUTPUT_NAME.to_string()]);
        assert!(list.devices[0].is_default());
    }

    #[test]
    fn test_pipewire_devices_from_graph() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner.push("pw-dump", Ok(PW_DUMP.into()));
        let en = enumerator(runner.clone(), dir.path());

        let list = en.list_devices(Driver::PipeWire).unwrap();
        assert_eq!(
            list.names(),
            vec![
                DEFAULT_SYSTEM_OUTPUT_NAME.to_string(),
                "Topping DAC".to_string(),
                "Built-in Audio Analog Stereo".to_string(),
            ]
        );
        assert_eq!(runner.calls_matching("pactl"), 0);

        let fmt = en.runtime_format(Driver::PipeWire, None).unwrap();
        assert_eq!(fmt.rate, 96000);
    }

    #[test]
    fn test_pipewire_falls_back_to_pactl() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner.push(
            "pactl list sinks",
            Ok("Sink #1\n\tName: alsa_output.usb-DAC.analog-stereo\n\tDescription: USB DAC\n".into()),
        );
        let en = enumerator(runner, dir.path());

        let list = en.list_devices(Driver::PipeWire).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.devices[1].name, "USB DAC");
        assert_eq!(list.devices[1].driver, Driver::PipeWire);
    }

    #[test]
    fn test_alsa_devices_and_missing_procfs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("cards"),
            " 0 [PCH ]: HDA-Intel - HDA Intel PCH\n 1 [DAC ]: USB-Audio - USB DAC\n",
        )
        .unwrap();
        let en = enumerator(Arc::new(ScriptedRunner::default()), dir.path());
        let list = en.list_devices(Driver::Alsa).unwrap();
        assert_eq!(list.names(), vec!["USB DAC (Card 1)", "HDA Intel PCH (Card 0)"]);

        let missing = enumerator(Arc::new(ScriptedRunner::default()), &dir.path().join("nope"));
        assert!(missing.list_devices(Driver::Alsa).is_err());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_system_enumeration() {
        let en = SystemEnumerator::new();
        for driver in en.list_drivers() {
            let list = en.list_devices(driver).expect("enumerate");
            println!("{}: {:?}", driver, list.names());
        }
    }
}
