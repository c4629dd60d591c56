//! Driver and Device Model
//!
//! Driver identifiers are persisted by the UI as literal wire strings, so
//! `Driver` round-trips through exactly `Auto (Default)`, `ALSA`, `PipeWire`
//! and `PulseAudio`.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// Name shown for the implicit default device of the `Auto` driver
pub const DEFAULT_OUTPUT_NAME: &str = "Default Output";

/// Name shown for the session default sink on PipeWire / PulseAudio
pub const DEFAULT_SYSTEM_OUTPUT_NAME: &str = "Default System Output";

/// Audio backend selectable by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Driver {
    #[default]
    #[serde(rename = "Auto (Default)")]
    Auto,
    #[serde(rename = "ALSA")]
    Alsa,
    #[serde(rename = "PipeWire")]
    PipeWire,
    #[serde(rename = "PulseAudio")]
    PulseAudio,
}

impl Driver {
    pub const ALL: [Driver; 4] = [
        Driver::Auto,
        Driver::PipeWire,
        Driver::PulseAudio,
        Driver::Alsa,
    ];

    /// Wire string used for persistence and display
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Auto => "Auto (Default)",
            Driver::Alsa => "ALSA",
            Driver::PipeWire => "PipeWire",
            Driver::PulseAudio => "PulseAudio",
        }
    }

    /// Drivers whose devices are nodes of a session manager graph
    pub fn is_session_managed(&self) -> bool {
        matches!(self, Driver::PipeWire | Driver::PulseAudio)
    }

    /// Drivers the passive presence monitor watches
    pub fn supports_presence_check(&self) -> bool {
        matches!(self, Driver::Alsa | Driver::PipeWire)
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "Auto (Default)" => Ok(Driver::Auto),
            "ALSA" => Ok(Driver::Alsa),
            "PipeWire" => Ok(Driver::PipeWire),
            "PulseAudio" => Ok(Driver::PulseAudio),
            _ if trimmed.eq_ignore_ascii_case("auto") => Ok(Driver::Auto),
            _ => Err(PlatformError::UnknownDriver(trimmed.to_string())),
        }
    }
}

/// An output device as reported by one enumeration snapshot
///
/// `(driver, id)` is unique within a snapshot; ids may be recycled across
/// hotplug events, so long-lived references should key on the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub driver: Driver,

    /// Opaque backend identifier (`hw:1,0`, a PipeWire node name, ...).
    /// `None` selects the backend's default sink.
    pub id: Option<String>,

    /// Human-readable name
    pub name: String,

    /// Graph node id for session-managed backends
    pub node_id: Option<u32>,
}

impl Device {
    pub fn new(driver: Driver, name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            driver,
            id,
            name: name.into(),
            node_id: None,
        }
    }

    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Whether this entry stands for "whatever the system default is"
    pub fn is_default(&self) -> bool {
        self.id.is_none()
    }
}

/// Ordered device snapshot for one driver
///
/// Ordering is backend-defined and preserved for UI stability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceList {
    pub driver: Driver,
    pub devices: Vec<Device>,
    pub captured_at: SystemTime,
}

impl DeviceList {
    pub fn new(driver: Driver, devices: Vec<Device>) -> Self {
        Self {
            driver,
            devices,
            captured_at: SystemTime::now(),
        }
    }

    pub fn empty(driver: Driver) -> Self {
        Self::new(driver, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.id.as_deref() == Some(id))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.find_by_name(name).is_some()
    }

    /// First entry that addresses real hardware rather than the default sink,
    /// falling back to the first entry of any kind
    pub fn first_available(&self) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| !d.is_default())
            .or_else(|| self.devices.first())
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

/// Where a runtime (sink-side) format reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatSource {
    /// Session manager snapshot (PipeWire node params)
    Session,
    /// `/proc/asound` hw_params of a running substream
    Kernel,
}

/// Format the sink is actually running at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFormat {
    pub rate: u32,
    pub depth: u16,
    pub source: FormatSource,
}

/// Map an ALSA / SPA sample format name to its bit depth
///
/// Accepts kernel spellings (`S24_3LE`, `S32_LE`) and SPA spellings
/// (`S24LE`, `F32LE`).
pub fn depth_from_format_name(fmt: &str) -> Option<u16> {
    let upper = fmt.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return None;
    }
    if upper.starts_with("FLOAT64") || upper.starts_with("F64") {
        return Some(64);
    }
    if upper.starts_with("FLOAT") || upper.starts_with("F32") {
        return Some(32);
    }
    let digits: String = upper
        .trim_start_matches(|c| c == 'S' || c == 'U')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse::<u16>() {
        Ok(bits @ (8 | 16 | 20 | 24 | 32)) => Some(bits),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_wire_strings_roundtrip() {
        for driver in Driver::ALL {
            let parsed: Driver = driver.as_str().parse().unwrap();
            assert_eq!(parsed, driver);
        }
        assert_eq!("auto".parse::<Driver>().unwrap(), Driver::Auto);
        assert!("alsa".parse::<Driver>().is_err(), "wire strings are case-sensitive");
    }

    #[test]
    fn test_driver_serde_uses_wire_strings() {
        let json = serde_json::to_string(&Driver::Auto).unwrap();
        assert_eq!(json, "\"Auto (Default)\"");
        let back: Driver = serde_json::from_str("\"PulseAudio\"").unwrap();
        assert_eq!(back, Driver::PulseAudio);
    }

    #[test]
    fn test_device_list_lookup() {
        let list = DeviceList::new(
            Driver::PipeWire,
            vec![
                Device::new(Driver::PipeWire, DEFAULT_SYSTEM_OUTPUT_NAME, None),
                Device::new(Driver::PipeWire, "USB DAC", Some("alsa_output.usb-dac".into())),
            ],
        );
        assert!(list.contains_name("USB DAC"));
        assert_eq!(
            list.find_by_id("alsa_output.usb-dac").map(|d| d.name.as_str()),
            Some("USB DAC")
        );
        assert_eq!(list.first_available().unwrap().name, "USB DAC");
    }

    #[test]
    fn test_depth_from_format_name() {
        assert_eq!(depth_from_format_name("S16_LE"), Some(16));
        assert_eq!(depth_from_format_name("S24_3LE"), Some(24));
        assert_eq!(depth_from_format_name("S32_LE"), Some(32));
        assert_eq!(depth_from_format_name("S24LE"), Some(24));
        assert_eq!(depth_from_format_name("F32LE"), Some(32));
        assert_eq!(depth_from_format_name("FLOAT_LE"), Some(32));
        assert_eq!(depth_from_format_name("MU_LAW"), None);
        assert_eq!(depth_from_format_name(""), None);
    }
}
