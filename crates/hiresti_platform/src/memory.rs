//! In-memory backend
//!
//! A scriptable enumerator and session clock. Used by the core's scenario
//! tests and by the CLI's `--simulate` mode to drive hotplug and rate
//! negotiation without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::device::{Device, DeviceList, Driver, RuntimeFormat};
use crate::error::{PlatformError, PlatformResult};
use crate::traits::{ClockSettings, DeviceEnumerator, SessionControl};

/// Enumerator whose device lists are set by the caller
#[derive(Default)]
pub struct MemoryEnumerator {
    drivers: RwLock<Vec<Driver>>,
    devices: RwLock<HashMap<Driver, Vec<Device>>>,
    runtime: RwLock<Option<RuntimeFormat>>,
    fail: AtomicBool,
    list_calls: AtomicUsize,
}

impl MemoryEnumerator {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(Driver::ALL.to_vec()),
            ..Default::default()
        }
    }

    pub fn set_drivers(&self, drivers: Vec<Driver>) {
        *self.drivers.write() = drivers;
    }

    pub fn set_devices(&self, driver: Driver, devices: Vec<Device>) {
        self.devices.write().insert(driver, devices);
    }

    /// Add a device (hotplug)
    pub fn plug(&self, device: Device) {
        let mut devices = self.devices.write();
        let list = devices.entry(device.driver).or_default();
        if !list.iter().any(|d| d.name == device.name) {
            list.push(device);
        }
    }

    /// Remove a device by name (unplug)
    pub fn unplug(&self, driver: Driver, name: &str) {
        if let Some(list) = self.devices.write().get_mut(&driver) {
            list.retain(|d| d.name != name);
        }
    }

    pub fn set_runtime_format(&self, format: Option<RuntimeFormat>) {
        *self.runtime.write() = format;
    }

    /// Make every `list_devices` call fail (enumeration outage)
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl DeviceEnumerator for MemoryEnumerator {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_drivers(&self) -> Vec<Driver> {
        self.drivers.read().clone()
    }

    fn list_devices(&self, driver: Driver) -> PlatformResult<DeviceList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::command("memory", "enumeration failed"));
        }
        let devices = self.devices.read().get(&driver).cloned().unwrap_or_default();
        Ok(DeviceList::new(driver, devices))
    }

    fn runtime_format(&self, _driver: Driver, _device_id: Option<&str>) -> Option<RuntimeFormat> {
        *self.runtime.read()
    }
}

/// Session clock that either follows requests or pins the graph rate
#[derive(Default)]
pub struct MemoryClock {
    settings: Mutex<ClockSettings>,
    /// When set, the graph ignores force-rate and stays at this rate
    pinned_rate: Mutex<Option<u32>>,
    profiles: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryClock {
    pub fn new(clock_rate: u32) -> Self {
        let clock = Self::default();
        clock.settings.lock().clock_rate = clock_rate;
        clock
    }

    /// Simulate a graph that refuses rate changes
    pub fn pin_rate(&self, rate: Option<u32>) {
        *self.pinned_rate.lock() = rate;
        if let Some(rate) = rate {
            let mut settings = self.settings.lock();
            settings.clock_rate = rate;
            settings.force_rate = 0;
        }
    }

    pub fn settings(&self) -> ClockSettings {
        self.settings.lock().clone()
    }

    pub fn active_profile(&self, card: &str) -> Option<String> {
        self.profiles.lock().get(card).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SessionControl for MemoryClock {
    fn read_clock(&self) -> PlatformResult<ClockSettings> {
        Ok(self.settings.lock().clone())
    }

    fn set_force_rate(&self, rate: u32) -> PlatformResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.pinned_rate.lock().is_some() {
            return Ok(());
        }
        let mut settings = self.settings.lock();
        settings.force_rate = rate;
        if rate > 0 {
            settings.clock_rate = rate;
        }
        Ok(())
    }

    fn set_allowed_rates(&self, rates: &[u32]) -> PlatformResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut sorted = rates.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        self.settings.lock().allowed_rates = sorted;
        Ok(())
    }

    fn ensure_pro_audio(&self, device_id: &str) -> PlatformResult<String> {
        #[cfg(target_os = "linux")]
        let card = crate::linux::card_from_pipewire_output_node(device_id);
        #[cfg(not(target_os = "linux"))]
        let card = device_id.strip_prefix("alsa_output.").map(|c| format!("alsa_card.{}", c));

        let card = card.ok_or_else(|| PlatformError::UnsupportedDevice(device_id.to_string()))?;
        self.profiles
            .lock()
            .insert(card.clone(), "pro-audio".to_string());
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_plug_unplug() {
        let mem = MemoryEnumerator::new();
        mem.plug(Device::new(Driver::Alsa, "USB DAC (Card 1)", Some("hw:1,0".into())));
        mem.plug(Device::new(Driver::Alsa, "USB DAC (Card 1)", Some("hw:1,0".into())));
        assert_eq!(mem.list_devices(Driver::Alsa).unwrap().len(), 1);

        mem.unplug(Driver::Alsa, "USB DAC (Card 1)");
        assert!(mem.list_devices(Driver::Alsa).unwrap().is_empty());

        mem.set_failing(true);
        assert!(mem.list_devices(Driver::Alsa).is_err());
    }

    #[test]
    fn test_clock_follows_force_rate() {
        let clock = MemoryClock::new(48000);
        clock.set_force_rate(96000).unwrap();
        let (settings, ok) =
            clock.wait_for_clock(&|s| s.honours(96000), Duration::from_millis(50), Duration::from_millis(10));
        assert!(ok);
        assert_eq!(settings.clock_rate, 96000);
    }

    #[test]
    fn test_pinned_clock_blocks() {
        let clock = MemoryClock::new(48000);
        clock.pin_rate(Some(48000));
        clock.set_force_rate(96000).unwrap();
        let (settings, ok) =
            clock.wait_for_clock(&|s| s.honours(96000), Duration::from_millis(50), Duration::from_millis(10));
        assert!(!ok);
        assert_eq!(settings.clock_rate, 48000);
        assert_eq!(clock.writes(), 1);
    }

    #[test]
    fn test_pro_audio_profile() {
        let clock = MemoryClock::new(48000);
        let card = clock
            .ensure_pro_audio("alsa_output.usb-DAC.analog-stereo")
            .unwrap();
        assert_eq!(clock.active_profile(&card).as_deref(), Some("pro-audio"));
        assert!(clock.ensure_pro_audio("hw:1,0").is_err());
    }
}
