//! PipeWire Sink Enumeration and Clock Metadata
//!
//! Sinks come from a `pw-dump` snapshot; clock hints are written to the
//! `settings` metadata object with `pw-metadata`:
//!
//! ```text
//! $ pw-metadata -n settings 0
//! Found "settings" metadata 32
//! update: id:0 key:'clock.rate' value:'48000' type:''
//! update: id:0 key:'clock.allowed-rates' value:'[ 48000 ]' type:''
//! update: id:0 key:'clock.force-rate' value:'0' type:''
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::command::{CommandRunner, SystemRunner};
use super::profile::card_from_pipewire_output_node;
use super::pulse;
use super::state::PipeWireState;
use crate::device::{Device, Driver, FormatSource, RuntimeFormat};
use crate::error::{PlatformError, PlatformResult};
use crate::traits::{ClockSettings, SessionControl};

/// Attempts made to switch a card to `pro-audio`
const PROFILE_ATTEMPTS: usize = 3;

/// Pause between a profile switch and its verification
const PROFILE_SETTLE: Duration = Duration::from_millis(120);

pub const PRO_AUDIO_PROFILE: &str = "pro-audio";

/// Take a graph snapshot with `pw-dump`
pub fn snapshot(runner: &dyn CommandRunner) -> PlatformResult<PipeWireState> {
    let json = runner.run("pw-dump", &[])?;
    PipeWireState::from_pw_dump(&json)
}

/// Audio sinks of the graph: USB devices first, duplicates removed
pub fn list_sinks(state: &PipeWireState) -> Vec<Device> {
    let mut out: Vec<Device> = state
        .sinks()
        .into_iter()
        .map(|node| {
            Device::new(Driver::PipeWire, node.display_name(), Some(node.name.clone()))
                .with_node_id(node.id)
        })
        .collect();

    out.sort_by_key(|d| {
        let hay = format!(
            "{} {}",
            d.name.to_ascii_uppercase(),
            d.id.as_deref().unwrap_or("").to_ascii_uppercase()
        );
        if hay.contains("USB") {
            0
        } else {
            1
        }
    });
    out.dedup_by(|a, b| a.id == b.id && a.name == b.name);
    out
}

/// Negotiated format of `device_id`, or of the first running sink
pub fn runtime_format(state: &PipeWireState, device_id: Option<&str>) -> Option<RuntimeFormat> {
    let node = match device_id {
        Some(id) => state.node_by_name(id),
        None => state.sinks().into_iter().find(|n| n.is_running()),
    }?;
    let format = node.format?;
    Some(RuntimeFormat {
        rate: format.rate,
        depth: format.depth?,
        source: FormatSource::Session,
    })
}

/// Parse `pw-metadata -n settings 0` output into clock settings
pub fn parse_settings_metadata(text: &str) -> ClockSettings {
    let mut settings = ClockSettings::default();
    for line in text.lines() {
        let Some((key, value)) = parse_update_line(line) else {
            continue;
        };
        match key {
            "clock.force-rate" => settings.force_rate = value.parse().unwrap_or(0),
            "clock.rate" => settings.clock_rate = value.parse().unwrap_or(0),
            "clock.quantum" => settings.quantum = value.parse().unwrap_or(0),
            "clock.allowed-rates" => settings.allowed_rates = parse_rate_list(value),
            _ => {}
        }
    }
    settings
}

/// `update: id:0 key:'clock.rate' value:'48000' type:''` -> `("clock.rate", "48000")`
fn parse_update_line(line: &str) -> Option<(&str, &str)> {
    let after_key = line.split_once("key:'")?.1;
    let (key, rest) = after_key.split_once('\'')?;
    let after_value = rest.split_once("value:'")?.1;
    let (value, _) = after_value.split_once('\'')?;
    Some((key, value.trim()))
}

/// Extract every positive integer from `[ 44100 48000 ]` / `44100,48000`
pub fn parse_rate_list(raw: &str) -> Vec<u32> {
    let mut rates: Vec<u32> = raw
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|t| t.parse::<u32>().ok())
        .filter(|r| *r > 0)
        .collect();
    rates.sort_unstable();
    rates.dedup();
    rates
}

/// Format rates the way `pw-metadata` expects an array value
pub fn format_rate_list(rates: &[u32]) -> String {
    let mut sorted: Vec<u32> = rates.iter().copied().filter(|r| *r > 0).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let body = sorted
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("[ {} ]", body)
}

/// Session control through `pw-metadata` and `pactl`
pub struct PipeWireClock {
    runner: Arc<dyn CommandRunner>,
    profile_settle: Duration,
}

impl Default for PipeWireClock {
    fn default() -> Self {
        Self::new(Arc::new(SystemRunner::default()))
    }
}

impl PipeWireClock {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            profile_settle: PROFILE_SETTLE,
        }
    }

    #[cfg(test)]
    fn with_profile_settle(mut self, settle: Duration) -> Self {
        self.profile_settle = settle;
        self
    }

    fn write_setting(&self, key: &str, value: &str) -> PlatformResult<()> {
        self.runner
            .run("pw-metadata", &["-n", "settings", "0", key, value])?;
        Ok(())
    }
}

impl SessionControl for PipeWireClock {
    fn read_clock(&self) -> PlatformResult<ClockSettings> {
        let text = self.runner.run("pw-metadata", &["-n", "settings", "0"])?;
        Ok(parse_settings_metadata(&text))
    }

    fn set_force_rate(&self, rate: u32) -> PlatformResult<()> {
        debug!("pipewire clock.force-rate={}", rate);
        self.write_setting("clock.force-rate", &rate.to_string())
    }

    fn set_allowed_rates(&self, rates: &[u32]) -> PlatformResult<()> {
        if rates.iter().all(|r| *r == 0) {
            return Err(PlatformError::parse("allowed rates", "empty rate list"));
        }
        let value = format_rate_list(rates);
        debug!("pipewire clock.allowed-rates={}", value);
        self.write_setting("clock.allowed-rates", &value)
    }

    fn ensure_pro_audio(&self, device_id: &str) -> PlatformResult<String> {
        let card = card_from_pipewire_output_node(device_id)
            .ok_or_else(|| PlatformError::UnsupportedDevice(device_id.to_string()))?;

        let runner = self.runner.as_ref();
        if pulse::card_active_profile(runner, &card).as_deref() == Some(PRO_AUDIO_PROFILE) {
            debug!("Card {} already in {}", card, PRO_AUDIO_PROFILE);
            return Ok(card);
        }

        let mut last_err = String::new();
        for attempt in 1..=PROFILE_ATTEMPTS {
            if let Err(e) = pulse::set_card_profile(runner, &card, PRO_AUDIO_PROFILE) {
                warn!("pro-audio switch attempt {} for {} failed: {}", attempt, card, e);
                last_err = e.to_string();
            }
            thread::sleep(self.profile_settle);
            if pulse::card_active_profile(runner, &card).as_deref() == Some(PRO_AUDIO_PROFILE) {
                info!("Card {} switched to {}", card, PRO_AUDIO_PROFILE);
                return Ok(card);
            }
        }

        Err(PlatformError::ProfileSwitchFailed(format!(
            "failed to switch {} to {}: {}",
            card, PRO_AUDIO_PROFILE, last_err
        )))
    }
}
