//! Host Surface
//!
//! The capabilities the embedding application provides to the core. The
//! core never touches widgets: it posts wake-ups to the host's main loop
//! and reports notices, diagnostics and transitions through this trait.

use std::fmt;

use serde::{Deserialize, Serialize};

use hiresti_platform::DeviceList;

use crate::model::StreamFormat;
use crate::state::Transition;

/// Work the host must run on its foreground thread
pub enum MainTask {
    /// Results are waiting; call `AudioCore::pump()`
    Pump,
    /// Arbitrary closure to run on the foreground thread
    Call(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for MainTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MainTask::Pump => f.write_str("Pump"),
            MainTask::Call(_) => f.write_str("Call(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Health badge for a diagnostics area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Warn,
    Error,
    Idle,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "ok",
            Health::Warn => "warn",
            Health::Error => "error",
            Health::Idle => "idle",
        }
    }
}

/// Callbacks into the embedding application
///
/// Everything except [`HostSurface::post_to_main`] is invoked on the
/// foreground thread, from inside `AudioCore` methods.
pub trait HostSurface: Send + Sync {
    /// Schedule `task` on the foreground thread; may be called from any thread
    fn post_to_main(&self, task: MainTask);

    fn show_notice(&self, level: NoticeLevel, text: &str, timeout_ms: u32);

    fn record_diag_event(&self, message: &str);

    fn set_diag_health(&self, area: &str, health: Health, detail: Option<&str>);

    fn on_output_state_transition(&self, transition: &Transition);

    /// Playback stopped on an error; the play control should show "play"
    fn reset_play_button(&self);

    fn on_tag(&self, _format: &StreamFormat) {}

    fn on_eos(&self) {}

    fn on_devices_changed(&self, _devices: &DeviceList) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Host that records every callback for assertions
    #[derive(Default)]
    pub struct RecordingHost {
        pub notices: Mutex<Vec<(NoticeLevel, String)>>,
        pub diag: Mutex<Vec<String>>,
        pub health: Mutex<Vec<(String, Health, Option<String>)>>,
        pub transitions: Mutex<Vec<Transition>>,
        pub play_resets: Mutex<usize>,
        pub posted: Mutex<usize>,
        pub tags: Mutex<Vec<StreamFormat>>,
        pub eos: Mutex<usize>,
        pub device_lists: Mutex<Vec<DeviceList>>,
    }

    impl RecordingHost {
        pub fn notice_texts(&self) -> Vec<String> {
            self.notices.lock().iter().map(|(_, t)| t.clone()).collect()
        }

        pub fn has_notice(&self, needle: &str) -> bool {
            self.notices.lock().iter().any(|(_, t)| t.contains(needle))
        }
    }

    impl HostSurface for RecordingHost {
        fn post_to_main(&self, task: MainTask) {
            *self.posted.lock() += 1;
            if let MainTask::Call(f) = task {
                f();
            }
        }

        fn show_notice(&self, level: NoticeLevel, text: &str, _timeout_ms: u32) {
            self.notices.lock().push((level, text.to_string()));
        }

        fn record_diag_event(&self, message: &str) {
            self.diag.lock().push(message.to_string());
        }

        fn set_diag_health(&self, area: &str, health: Health, detail: Option<&str>) {
            self.health
                .lock()
                .push((area.to_string(), health, detail.map(str::to_string)));
        }

        fn on_output_state_transition(&self, transition: &Transition) {
            self.transitions.lock().push(transition.clone());
        }

        fn reset_play_button(&self) {
            *self.play_resets.lock() += 1;
        }

        fn on_tag(&self, format: &StreamFormat) {
            self.tags.lock().push(format.clone());
        }

        fn on_eos(&self) {
            *self.eos.lock() += 1;
        }

        fn on_devices_changed(&self, devices: &DeviceList) {
            self.device_lists.lock().push(devices.clone());
        }
    }
}
