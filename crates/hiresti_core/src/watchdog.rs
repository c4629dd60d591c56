//! Hotplug Watchdog
//!
//! After a device loss the watchdog polls device enumeration on the lost
//! device's driver until something changes or it is stopped:
//!
//! ```text
//!            start(driver)              fast_window elapsed
//! Stopped ──────────────► Fast (1s) ─────────────────────► Slow (5s)
//!    ▲                        │                               │
//!    └──────── stop() ────────┴───────────────────────────────┘
//! ```
//!
//! Probes run on the `hiresti-hotplug` thread and are serialized per driver
//! through a [`ProbeGate`]. Results are handed to a sink closure, which is
//! expected to post them to the foreground thread; the watchdog itself never
//! interprets them. Enumeration failures are logged and dropped.
//!
//! [`PassiveMonitor`] is the cheaper idle-time presence check that decides
//! when the foreground should look for the selected device.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hiresti_platform::{DeviceEnumerator, DeviceList, Driver};

use crate::config::WatchdogConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchPhase {
    Stopped,
    Fast,
    Slow,
}

/// Probe schedule; no I/O
#[derive(Debug, Clone)]
pub struct HotplugContext {
    config: WatchdogConfig,
    driver: Option<Driver>,
    started: Option<Instant>,
    next_due: Option<Instant>,
    probes: u64,
}

impl HotplugContext {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            driver: None,
            started: None,
            next_due: None,
            probes: 0,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Enter the fast phase; restarting keeps nothing from an earlier watch
    pub fn start(&mut self, driver: Driver, now: Instant) {
        self.driver = Some(driver);
        self.started = Some(now);
        self.next_due = Some(now + self.config.fast_interval());
        self.probes = 0;
    }

    pub fn stop(&mut self) {
        self.driver = None;
        self.started = None;
        self.next_due = None;
    }

    pub fn driver(&self) -> Option<Driver> {
        self.driver
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn phase(&self, now: Instant) -> WatchPhase {
        match self.started {
            None => WatchPhase::Stopped,
            Some(started) if now.saturating_duration_since(started) < self.config.fast_window() => {
                WatchPhase::Fast
            }
            Some(_) => WatchPhase::Slow,
        }
    }

    pub fn next_interval(&self, now: Instant) -> Option<Duration> {
        match self.phase(now) {
            WatchPhase::Stopped => None,
            WatchPhase::Fast => Some(self.config.fast_interval()),
            WatchPhase::Slow => Some(self.config.slow_interval()),
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.map(|due| now >= due).unwrap_or(false)
    }

    /// Schedule the next probe after one ran at `now`
    pub fn mark_probed(&mut self, now: Instant) {
        self.probes += 1;
        self.next_due = self.next_interval(now).map(|interval| now + interval);
    }

    pub fn probe_count(&self) -> u64 {
        self.probes
    }
}

/// What a probe revealed relative to the previous listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFinding {
    /// The last-disconnected device is listed again
    Reappeared(String),
    /// First name not seen before
    NewDevice(String),
    Unchanged,
}

/// Compare a fresh listing against `known` names
pub fn evaluate_probe(known: &[String], list: &DeviceList, lost: Option<&str>) -> ProbeFinding {
    if let Some(name) = lost {
        if list.contains_name(name) {
            return ProbeFinding::Reappeared(name.to_string());
        }
    }
    list.iter()
        .find(|d| !d.is_default() && !known.iter().any(|k| k == &d.name))
        .map(|d| ProbeFinding::NewDevice(d.name.clone()))
        .unwrap_or(ProbeFinding::Unchanged)
}

/// At most one enumeration in flight per driver
#[derive(Debug, Clone, Default)]
pub struct ProbeGate {
    busy: Arc<Mutex<HashSet<Driver>>>,
}

impl ProbeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` while another probe of `driver` is running
    pub fn try_enter(&self, driver: Driver) -> Option<ProbeGuard> {
        if self.busy.lock().insert(driver) {
            Some(ProbeGuard {
                gate: self.clone(),
                driver,
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self, driver: Driver) -> bool {
        self.busy.lock().contains(&driver)
    }
}

/// Releases the driver slot on drop
#[derive(Debug)]
pub struct ProbeGuard {
    gate: ProbeGate,
    driver: Driver,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.gate.busy.lock().remove(&self.driver);
    }
}

/// Start/stop surface of the watchdog
pub trait WatchdogControl: Send + Sync {
    fn start(&self, driver: Driver);

    fn stop(&self);

    fn is_running(&self) -> bool;

    fn phase(&self) -> WatchPhase;
}

/// Receives successful probe listings, off the foreground thread
pub type ProbeSink = Box<dyn Fn(Driver, DeviceList) + Send>;

enum Control {
    /// Schedule changed
    Wake,
    Shutdown,
}

/// Background hotplug poller
pub struct HotplugWatchdog {
    context: Arc<Mutex<HotplugContext>>,
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatchdog {
    pub fn spawn(
        config: WatchdogConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        gate: ProbeGate,
        sink: ProbeSink,
    ) -> CoreResult<Self> {
        let context = Arc::new(Mutex::new(HotplugContext::new(config)));
        let (control, control_rx) = bounded::<Control>(8);
        let worker_context = Arc::clone(&context);

        let name = "hiresti-hotplug".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!("Hotplug watchdog thread started");
                loop {
                    let wait = worker_context
                        .lock()
                        .next_due()
                        .map(|due| after(due.saturating_duration_since(Instant::now())))
                        .unwrap_or_else(never);
                    select! {
                        recv(control_rx) -> msg => match msg {
                            Ok(Control::Wake) => continue,
                            Ok(Control::Shutdown) | Err(_) => break,
                        },
                        recv(wait) -> _ => {
                            let driver = {
                                let mut ctx = worker_context.lock();
                                let now = Instant::now();
                                if !ctx.is_due(now) {
                                    continue;
                                }
                                ctx.mark_probed(now);
                                ctx.driver()
                            };
                            if let Some(driver) = driver {
                                probe(driver, enumerator.as_ref(), &gate, &sink);
                            }
                        }
                    }
                }
                debug!("Hotplug watchdog thread stopped");
            })
            .map_err(|e| CoreError::Spawn {
                name,
                message: e.to_string(),
            })?;

        Ok(Self {
            context,
            control,
            thread: Some(thread),
        })
    }

    /// Snapshot of the schedule
    pub fn context(&self) -> HotplugContext {
        self.context.lock().clone()
    }

    fn wake(&self) {
        let _ = self.control.try_send(Control::Wake);
    }
}

fn probe(driver: Driver, enumerator: &dyn DeviceEnumerator, gate: &ProbeGate, sink: &ProbeSink) {
    let Some(_guard) = gate.try_enter(driver) else {
        debug!("Probe for {} already in flight", driver);
        return;
    };
    match enumerator.list_devices(driver) {
        Ok(list) => sink(driver, list),
        Err(e) => warn!("Hotplug probe on {} failed: {}", driver, e),
    }
}

impl WatchdogControl for HotplugWatchdog {
    fn start(&self, driver: Driver) {
        info!("Hotplug watchdog started on {}", driver);
        self.context.lock().start(driver, Instant::now());
        self.wake();
    }

    fn stop(&self) {
        if self.context.lock().is_running() {
            info!("Hotplug watchdog stopped");
        }
        self.context.lock().stop();
        self.wake();
    }

    fn is_running(&self) -> bool {
        self.context.lock().is_running()
    }

    fn phase(&self) -> WatchPhase {
        self.context.lock().phase(Instant::now())
    }
}

impl Drop for HotplugWatchdog {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Idle-time presence check schedule
#[derive(Debug, Clone)]
pub struct PassiveMonitor {
    config: WatchdogConfig,
    next_due: Option<Instant>,
    last_event: Option<Instant>,
}

impl PassiveMonitor {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            next_due: None,
            last_event: None,
        }
    }

    /// Something device-related happened; check more often for a while
    pub fn note_event(&mut self, now: Instant) {
        self.last_event = Some(now);
    }

    pub fn interval(&self, playing: bool, now: Instant) -> Duration {
        let recent = self
            .last_event
            .map(|at| now.saturating_duration_since(at) < Duration::from_secs(self.config.recent_event_s))
            .unwrap_or(false);
        if playing || recent {
            Duration::from_millis(self.config.passive_active_ms)
        } else {
            Duration::from_millis(self.config.passive_idle_ms)
        }
    }

    /// True when a presence check should run now; reschedules itself
    pub fn poll(&mut self, playing: bool, now: Instant) -> bool {
        let interval = self.interval(playing, now);
        match self.next_due {
            None => {
                self.next_due = Some(now + interval);
                false
            }
            Some(due) if now >= due => {
                self.next_due = Some(now + interval);
                true
            }
            Some(due) => {
                // Switching to the shorter interval should not wait out the longer one
                if due > now + interval {
                    self.next_due = Some(now + interval);
                }
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.next_due = None;
    }
}
