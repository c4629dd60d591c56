//! Short-lived device list cache
//!
//! The UI re-reads device lists on every menu open and the watchdog polls
//! every second; enumeration shells out, so results are reused for a short
//! TTL. Readers receive clones and never hold the lock while enumerating.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use crate::device::{DeviceList, Driver, RuntimeFormat};
use crate::error::PlatformResult;
use crate::traits::DeviceEnumerator;

/// Default lifetime of a cached device list
pub const DEVICE_CACHE_TTL: Duration = Duration::from_millis(1500);

struct Entry {
    list: DeviceList,
    fetched: Instant,
}

/// Wraps an enumerator with a per-driver TTL cache
pub struct CachedEnumerator {
    inner: Arc<dyn DeviceEnumerator>,
    ttl: Duration,
    entries: RwLock<HashMap<Driver, Entry>>,
}

impl CachedEnumerator {
    pub fn new(inner: Arc<dyn DeviceEnumerator>) -> Self {
        Self::with_ttl(inner, DEVICE_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn DeviceEnumerator>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every cached list (after a hotplug event or a profile switch)
    pub fn invalidate(&self) {
        self.entries.write().clear();
    }

    pub fn invalidate_driver(&self, driver: Driver) {
        self.entries.write().remove(&driver);
    }

    fn fresh(&self, driver: Driver) -> Option<DeviceList> {
        let entries = self.entries.read();
        let entry = entries.get(&driver)?;
        (entry.fetched.elapsed() < self.ttl).then(|| entry.list.clone())
    }
}

impl DeviceEnumerator for CachedEnumerator {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn list_drivers(&self) -> Vec<Driver> {
        self.inner.list_drivers()
    }

    fn list_devices(&self, driver: Driver) -> PlatformResult<DeviceList> {
        if let Some(list) = self.fresh(driver) {
            trace!("device cache hit for {}", driver);
            return Ok(list);
        }
        let list = self.inner.list_devices(driver)?;
        self.entries.write().insert(
            driver,
            Entry {
                list: list.clone(),
                fetched: Instant::now(),
            },
        );
        Ok(list)
    }

    fn runtime_format(&self, driver: Driver, device_id: Option<&str>) -> Option<RuntimeFormat> {
        self.inner.runtime_format(driver, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory::MemoryEnumerator;

    fn setup(ttl: Duration) -> (Arc<MemoryEnumerator>, CachedEnumerator) {
        let mem = Arc::new(MemoryEnumerator::new());
        mem.set_devices(
            Driver::Alsa,
            vec![Device::new(Driver::Alsa, "USB DAC (Card 1)", Some("hw:1,0".into()))],
        );
        let cached = CachedEnumerator::with_ttl(mem.clone(), ttl);
        (mem, cached)
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let (mem, cached) = setup(Duration::from_secs(60));
        assert_eq!(cached.list_devices(Driver::Alsa).unwrap().len(), 1);

        mem.set_devices(Driver::Alsa, Vec::new());
        assert_eq!(cached.list_devices(Driver::Alsa).unwrap().len(), 1);
        assert_eq!(mem.list_calls(), 1);

        cached.invalidate();
        assert!(cached.list_devices(Driver::Alsa).unwrap().is_empty());
        assert_eq!(mem.list_calls(), 2);
    }

    #[test]
    fn test_cache_expires() {
        let (mem, cached) = setup(Duration::ZERO);
        cached.list_devices(Driver::Alsa).unwrap();
        cached.list_devices(Driver::Alsa).unwrap();
        assert_eq!(mem.list_calls(), 2);
    }
}
